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

//! Per-request attribute store shared between request processing components
//!
//! Web server integrations put a [`RequestAttributes`] instance into the request extensions.
//! Components processing the request (forwarded headers handling, body capture, authentication)
//! store their results there, event sources read them back once the exchange completes.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::OrderedMap;

/// Captured request body
pub const INPUT_BUFFER_ATTRIBUTE: &str = "LB_INPUT_BUFFER";

/// Captured response body
pub const OUTPUT_BUFFER_ATTRIBUTE: &str = "LB_OUTPUT_BUFFER";

/// Name of the authenticated user
pub const REMOTE_USER_ATTRIBUTE: &str = "access.remote_user";

/// Client address as determined from forwarded headers
pub const REMOTE_ADDR_ATTRIBUTE: &str = "access.remote_addr";

/// Client host name as determined from forwarded headers
pub const REMOTE_HOST_ATTRIBUTE: &str = "access.remote_host";

/// Protocol as determined from forwarded headers
pub const PROTOCOL_ATTRIBUTE: &str = "access.protocol";

/// Server name as determined from forwarded headers
pub const SERVER_NAME_ATTRIBUTE: &str = "access.server_name";

/// Server port as determined from forwarded headers
pub const SERVER_PORT_ATTRIBUTE: &str = "access.server_port";

/// Set by the forwarded headers component, signals that the forwarded attributes can be trusted
pub const FORWARDED_MARKER_ATTRIBUTE: &str = "access.forwarded_headers";

/// Checks whether an attribute is internal and should not be listed among request attributes
pub fn is_internal(name: &str) -> bool {
    name == INPUT_BUFFER_ATTRIBUTE
        || name == OUTPUT_BUFFER_ATTRIBUTE
        || name == FORWARDED_MARKER_ATTRIBUTE
}

/// Value of a request attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Text value
    Text(String),
    /// Binary value, e.g. a captured body
    Bytes(Bytes),
}

impl AttributeValue {
    /// Text representation of the value, binary data is decoded lossily
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for AttributeValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

/// Attribute store of a single request
///
/// Cloning produces another handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes(Arc<Mutex<OrderedMap<AttributeValue>>>);

impl RequestAttributes {
    /// Creates an empty attribute store
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an attribute, replacing any previous value
    pub fn set(&self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.0.lock().insert(name.into(), value.into());
    }

    /// Retrieves an attribute value
    pub fn get(&self, name: &str) -> Option<AttributeValue> {
        self.0.lock().get(name).cloned()
    }

    /// Retrieves an attribute as text
    pub fn get_text(&self, name: &str) -> Option<String> {
        self.0.lock().get(name).map(AttributeValue::to_text)
    }

    /// Retrieves binary attribute data
    pub fn get_bytes(&self, name: &str) -> Option<Bytes> {
        self.0.lock().get(name).map(|value| match value {
            AttributeValue::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            AttributeValue::Bytes(bytes) => bytes.clone(),
        })
    }

    /// Checks whether an attribute is present
    pub fn contains(&self, name: &str) -> bool {
        self.0.lock().contains_key(name)
    }

    /// Removes an attribute
    pub fn remove(&self, name: &str) -> Option<AttributeValue> {
        self.0.lock().shift_remove(name)
    }

    /// Text values of all attributes meant for logging, in insertion order
    pub fn to_map(&self) -> OrderedMap<String> {
        self.0
            .lock()
            .iter()
            .filter(|(name, _)| !is_internal(name))
            .map(|(name, value)| (name.clone(), value.to_text()))
            .collect()
    }
}

/// Session identifier of the request
///
/// Session handling components put this into the request extensions. Event sources only read it,
/// so logging never creates a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Authenticated user name of the request
///
/// Authentication components put this into the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_attributes_hidden() {
        let attributes = RequestAttributes::new();
        attributes.set("b", "2");
        attributes.set(INPUT_BUFFER_ATTRIBUTE, Bytes::from_static(b"body"));
        attributes.set(FORWARDED_MARKER_ATTRIBUTE, "true");
        attributes.set("a", Bytes::from_static(b"1"));

        let map = attributes.to_map();
        assert_eq!(
            map.iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect::<Vec<_>>(),
            [("b", "2"), ("a", "1")]
        );

        assert_eq!(
            attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE),
            Some(Bytes::from_static(b"body"))
        );
        assert!(attributes.contains(FORWARDED_MARKER_ATTRIBUTE));
    }

    #[test]
    fn shared_between_clones() {
        let attributes = RequestAttributes::new();
        let other = attributes.clone();
        other.set(REMOTE_USER_ATTRIBUTE, "alice");
        assert_eq!(
            attributes.get_text(REMOTE_USER_ATTRIBUTE).as_deref(),
            Some("alice")
        );
        assert_eq!(
            attributes.remove(REMOTE_USER_ATTRIBUTE),
            Some(AttributeValue::Text("alice".to_owned()))
        );
        assert!(!other.contains(REMOTE_USER_ATTRIBUTE));
    }
}
