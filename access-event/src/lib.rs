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

//! # Access events
//!
//! This crate defines the data exchanged between web server integrations and the access log
//! pipeline of `access-context`. Each web server integration implements [`AccessEventSource`]
//! on top of its own request and response types, computing the individual values only when
//! somebody asks for them.
//!
//! Values are read on the thread handling the request. Anything that needs to keep the data
//! beyond that point, e.g. a queue feeding a background writer, calls
//! [`AccessEventSource::prepare_for_deferred_processing`] and keeps the resulting
//! [`AccessEvent`]. That snapshot no longer references any request or response object and can
//! be sent to other threads or serialized.
//!
//! ```rust
//! use access_event::{AccessEvent, AccessEventSource};
//!
//! let event = AccessEvent::builder()
//!     .method("GET")
//!     .request_uri("/index.html")
//!     .protocol("HTTP/1.1")
//!     .status_code(200)
//!     .build();
//! assert_eq!(event.request_url(), "GET /index.html HTTP/1.1");
//! assert_eq!(event.request_header("User-Agent"), "-");
//! ```

pub mod attributes;
mod error;
mod event;
mod headers;
mod source;
pub mod support;
mod value;

pub use attributes::{AttributeValue, RemoteUser, RequestAttributes, SessionId};
pub use error::UnsupportedOperation;
pub use event::{AccessEvent, AccessEventBuilder};
pub use headers::Headers;
pub use source::{AccessEventSource, IMAGE_CONTENTS_SUPPRESSED, NA};
pub use value::LocalPortStrategy;

/// Insertion-ordered map type used for cookies, parameters and attributes
pub type OrderedMap<V> = indexmap::IndexMap<String, V>;
