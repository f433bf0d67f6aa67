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
use std::collections::BTreeMap;

/// Case-insensitive header map
///
/// Names are stored lowercased and iterated in sorted order. All values of a repeated header are
/// kept in the order they were received, lookups return the first one.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    /// Creates an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value to the header with the given name
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Returns the first value of the header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Returns all values of the header, empty if the header isn't present
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Checks whether the header is present
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Lowercased header names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Header names with their first value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|(name, values)| {
            values
                .first()
                .map(|value| (name.as_str(), value.as_str()))
        })
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: AsRef<str>, V: AsRef<[u8]>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(
                name.as_ref(),
                String::from_utf8_lossy(value.as_ref()).into_owned(),
            );
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let headers: Headers = [
            ("X-Forwarded-For", "1.2.3.4"),
            ("Accept", "text/html"),
            ("x-forwarded-for", "5.6.7.8"),
        ]
        .into_iter()
        .collect();

        assert_eq!(headers.get("x-FORWARDED-for"), Some("1.2.3.4"));
        assert_eq!(headers.get_all("X-Forwarded-For"), ["1.2.3.4", "5.6.7.8"]);
        assert_eq!(headers.get("Host"), None);
        assert!(headers.get_all("Host").is_empty());
        assert_eq!(headers.len(), 2);

        assert_eq!(
            headers.names().collect::<Vec<_>>(),
            ["accept", "x-forwarded-for"]
        );
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            [("accept", "text/html"), ("x-forwarded-for", "1.2.3.4")]
        );
    }

    #[test]
    fn lossy_values() {
        let headers: Headers = [("X-Test", b"a\xffb".as_slice())].into_iter().collect();
        assert_eq!(headers.get("x-test"), Some("a\u{fffd}b"));
    }
}
