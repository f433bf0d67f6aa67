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

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while setting up the access log pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Explicitly configured resource doesn't exist
    #[error("access log configuration {0} not found")]
    ConfigNotFound(String),

    /// Reading a file failed
    #[error("failed reading {path}: {source}")]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Configuration file isn't well-formed XML
    #[error("failed parsing access log configuration {name}: {source}")]
    Xml {
        /// Resource name
        name: String,
        /// Parser error
        source: roxmltree::Error,
    },

    /// Configuration file is well-formed but cannot be applied
    #[error("invalid access log configuration: {0}")]
    Invalid(String),

    /// Settings file cannot be deserialized
    #[error("failed reading settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The operation is not supported
    #[error("unsupported operation: {0}")]
    Unsupported(#[from] access_event::UnsupportedOperation),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
