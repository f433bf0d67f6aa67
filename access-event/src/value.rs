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

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Determines what [`AccessEventSource::local_port`](crate::AccessEventSource::local_port)
/// reports
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalPortStrategy {
    /// Port of the interface the request was received on, `local` in config file
    #[serde(alias = "LOCAL")]
    Local,
    /// Port the client sent the request to, `server` in config file
    ///
    /// This is usually taken from the `Host` header. Behind a reverse proxy rewriting forwarded
    /// headers it identifies the port the client actually used.
    #[default]
    #[serde(alias = "SERVER")]
    Server,
}

impl FromStr for LocalPortStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("local") {
            Ok(Self::Local)
        } else if s.eq_ignore_ascii_case("server") {
            Ok(Self::Server)
        } else {
            Err(format!("Unsupported local port strategy {s}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing() {
        assert_eq!("local".parse(), Ok(LocalPortStrategy::Local));
        assert_eq!("SERVER".parse(), Ok(LocalPortStrategy::Server));
        assert!("socket".parse::<LocalPortStrategy>().is_err());
    }
}
