// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Locating the configuration file

use log::debug;
use std::borrow::Cow;
use std::path::PathBuf;

use crate::Error;

/// Locations searched if no configuration file is given explicitly, in this order
pub const DEFAULT_CONFIGS: [&str; 4] = [
    "classpath:logback-access-test.xml",
    "classpath:logback-access.xml",
    "classpath:logback-access-test-spring.xml",
    "classpath:logback-access-spring.xml",
];

/// Configuration used if none of the [`DEFAULT_CONFIGS`] exist
pub const FALLBACK_CONFIG: &str = "bundled:logback-access-spring.xml";

const BUNDLED: [(&str, &str); 1] = [(
    "logback-access-spring.xml",
    include_str!("../resources/logback-access-spring.xml"),
)];

/// A configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// File on disk
    File(PathBuf),
    /// Configuration compiled into the binary
    Embedded {
        /// File name
        name: &'static str,
        /// File contents
        content: &'static str,
    },
}

impl Resource {
    /// Name used in log and error messages
    pub fn name(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Embedded { name, .. } => format!("bundled:{name}"),
        }
    }

    /// Reads the configuration file
    pub fn read(&self) -> Result<Cow<'static, str>, Error> {
        match self {
            Self::File(path) => std::fs::read_to_string(path)
                .map(Cow::Owned)
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                }),
            Self::Embedded { content, .. } => Ok(Cow::Borrowed(content)),
        }
    }
}

/// Maps resource locations to files
///
/// Locations starting with `classpath:` are looked up in each of the roots, in order. Locations
/// starting with `file:` and locations without prefix are file paths. `bundled:` refers to
/// configurations compiled into the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLoader {
    roots: Vec<PathBuf>,
}

impl Default for ResourceLoader {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from(".")],
        }
    }
}

impl ResourceLoader {
    /// Creates a loader without any roots for `classpath:` locations
    pub fn new() -> Self {
        Self { roots: Vec::new() }
    }

    /// Adds a root directory for `classpath:` locations
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Looks up a resource, `None` if it doesn’t exist
    pub fn get(&self, location: &str) -> Option<Resource> {
        if let Some(name) = location.strip_prefix("bundled:") {
            return BUNDLED
                .iter()
                .find(|(bundled, _)| *bundled == name)
                .map(|(name, content)| Resource::Embedded { name, content });
        }

        if let Some(name) = location.strip_prefix("classpath:") {
            let name = name.trim_start_matches('/');
            return self
                .roots
                .iter()
                .map(|root| root.join(name))
                .find(|path| path.is_file())
                .map(Resource::File);
        }

        let path = PathBuf::from(location.strip_prefix("file:").unwrap_or(location));
        path.is_file().then_some(Resource::File(path))
    }

    /// Determines the configuration file to use
    ///
    /// An explicitly configured location has to exist. Otherwise the default locations are
    /// searched, with the bundled configuration as last resort.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<Resource, Error> {
        if let Some(location) = explicit {
            return self
                .get(location)
                .ok_or_else(|| Error::ConfigNotFound(location.to_owned()));
        }

        for location in DEFAULT_CONFIGS {
            if let Some(resource) = self.get(location) {
                debug!("Found access log configuration {location}");
                return Ok(resource);
            }
        }

        debug!("No access log configuration found, using {FALLBACK_CONFIG}");
        self.get(FALLBACK_CONFIG)
            .ok_or_else(|| Error::ConfigNotFound(FALLBACK_CONFIG.to_owned()))
    }
}
