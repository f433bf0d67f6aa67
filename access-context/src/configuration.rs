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

//! Structures handling command line options and YAML deserialization of the access log settings

use access_event::LocalPortStrategy;
use clap::Args;
use log::trace;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::{Environment, Error};

/// Command line options of the access log
#[derive(Debug, Default, Clone, PartialEq, Eq, Args)]
pub struct AccessLogOpt {
    /// Access log configuration file
    ///
    /// Accepts file paths as well as `classpath:` locations.
    #[arg(long)]
    pub access_log_config: Option<String>,

    /// Disable the access log
    #[arg(long)]
    pub access_log_disabled: bool,

    /// Activate a profile of the access log configuration (can be repeated)
    #[arg(long = "profile")]
    pub profiles: Vec<String>,
}

/// Settings specific to one web server runtime
///
/// Values that aren’t set fall back to the shared settings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConf {
    /// Source of the local port
    pub local_port_strategy: Option<LocalPortStrategy>,
    /// Whether forwarded address, host, port and protocol are trusted
    ///
    /// If unset, Pingora and tower trust these once a forwarded headers component marked the
    /// request. actix-web doesn’t trust them unless enabled.
    pub request_attributes_enabled: Option<bool>,
}

impl RuntimeConf {
    /// Determines the effective local port strategy for this runtime
    pub fn local_port_strategy(&self, shared: LocalPortStrategy) -> LocalPortStrategy {
        self.local_port_strategy.unwrap_or(shared)
    }
}

/// Request and response body capture settings
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TeeFilterConf {
    /// Enables body capture
    pub enabled: bool,
    /// Host name patterns bodies are captured for, all hosts if empty
    pub includes: Vec<String>,
    /// Host name patterns bodies are never captured for
    pub excludes: Vec<String>,
}

/// Access log settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessLogConf {
    /// If `false`, no access log is set up
    pub enabled: bool,
    /// Configuration file location, searched in the default locations if unset
    pub config: Option<String>,
    /// Source of the local port unless overridden per runtime
    pub local_port_strategy: LocalPortStrategy,
    /// Pingora integration settings
    pub pingora: RuntimeConf,
    /// tower integration settings
    pub tower: RuntimeConf,
    /// actix-web integration settings
    pub actix: RuntimeConf,
    /// Body capture settings
    pub tee_filter: TeeFilterConf,
}

impl Default for AccessLogConf {
    fn default() -> Self {
        Self {
            enabled: true,
            config: None,
            local_port_strategy: LocalPortStrategy::default(),
            pingora: RuntimeConf::default(),
            tower: RuntimeConf::default(),
            actix: RuntimeConf::default(),
            tee_filter: TeeFilterConf::default(),
        }
    }
}

/// Access log settings along with the environment of the host application
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessLogSettings {
    /// Access log settings
    pub access_log: AccessLogConf,
    /// Profiles and properties available to the configuration file
    pub environment: Environment,
}

impl AccessLogSettings {
    /// Merges the command line options into the current settings. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: AccessLogOpt) {
        if let Some(config) = opt.access_log_config {
            self.access_log.config = Some(config);
        }
        if opt.access_log_disabled {
            self.access_log.enabled = false;
        }
        if !opt.profiles.is_empty() {
            self.environment.profiles = opt.profiles;
        }
    }
}

/// Trait for settings structures that can be loaded from YAML files. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads settings from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug + ?Sized,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader)?;
        trace!("Loaded settings file: {conf:#?}");

        Ok(conf)
    }
}
