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

//! # Access log for tower and axum
//!
//! [`AccessLogLayer`] produces an access event for each request and passes it to an
//! [`AccessContext`](access_context::AccessContext). The event is emitted once the response body
//! has been sent, so that the processing time and the number of bytes sent are known.
//!
//! ```rust
//! use access_context::{AccessContext, AccessLogSettings};
//! use axum::routing::get;
//! use axum::Router;
//! use std::sync::Arc;
//! use tower_access_module::{AccessLogLayer, ForwardedHeadersLayer, TeeLayer};
//!
//! let settings = AccessLogSettings::default();
//! let context = Arc::new(AccessContext::from_settings(&settings).unwrap().unwrap());
//! let conf = &settings.access_log;
//!
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "Hello" }))
//!     .layer(TeeLayer::from_conf(&conf.tee_filter).unwrap())
//!     .layer(ForwardedHeadersLayer::new())
//!     .layer(AccessLogLayer::from_conf(context, conf));
//! ```
//!
//! The client address is taken from [`ConnectInfo`](axum::extract::ConnectInfo), either
//! [`SocketPair`] or [`std::net::SocketAddr`]. Only `SocketPair` makes the local port available.
//! Behind a reverse proxy [`ForwardedHeadersLayer`] provides the original client address, host,
//! port and protocol instead.
//!
//! Handlers can add attributes to the access event via [`request_attributes`] or by extracting
//! [`RequestAttributes`](access_event::RequestAttributes) as an extension. There is no session
//! support, session IDs are never logged.

mod connect;
mod forwarded;
mod layer;
mod source;
mod tee;
#[cfg(test)]
mod test_utils;

pub use connect::SocketPair;
pub use forwarded::{ForwardedHeadersLayer, ForwardedHeadersService};
pub use layer::{request_attributes, AccessLogBody, AccessLogLayer, AccessLogService};
pub use tee::{TeeBody, TeeLayer, TeeRequestBody, TeeService};
