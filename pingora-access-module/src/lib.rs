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

//! # Access log for Pingora
//!
//! This crate produces access events for requests processed by a Pingora proxy and passes them
//! to an [`AccessContext`](access_context::AccessContext). The handler has to be called from the
//! `request_filter` and `logging` phases of the proxy:
//!
//! ```rust
//! use access_context::{AccessContext, AccessLogSettings};
//! use async_trait::async_trait;
//! use pingora::proxy::{ProxyHttp, Session};
//! use pingora::upstreams::peer::HttpPeer;
//! use pingora::Error;
//! use pingora_access_module::{AccessCtx, AccessLogHandler};
//!
//! pub struct MyProxy {
//!     log: AccessLogHandler,
//! }
//!
//! #[async_trait]
//! impl ProxyHttp for MyProxy {
//!     type CTX = AccessCtx;
//!     fn new_ctx(&self) -> Self::CTX {
//!         AccessLogHandler::new_ctx()
//!     }
//!
//!     async fn request_filter(
//!         &self,
//!         session: &mut Session,
//!         ctx: &mut Self::CTX,
//!     ) -> Result<bool, Box<Error>> {
//!         self.log.request_filter(session, ctx);
//!         Ok(false)
//!     }
//!
//!     async fn upstream_peer(
//!         &self,
//!         _session: &mut Session,
//!         _ctx: &mut Self::CTX,
//!     ) -> Result<Box<HttpPeer>, Box<Error>> {
//!         Ok(Box::new(HttpPeer::new("127.0.0.1:8080", false, String::new())))
//!     }
//!
//!     async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
//!         self.log.logging(session, e, ctx);
//!     }
//! }
//!
//! let settings = AccessLogSettings::default();
//! let proxy = AccessLogHandler::from_settings(&settings)
//!     .unwrap()
//!     .map(|log| MyProxy { log });
//! ```
//!
//! Pingora has no notion of sessions, so session IDs are never logged. The client address is the
//! peer address of the connection, forwarded headers are not considered. Request and response
//! bodies are logged only if the proxy stores them in [`AccessCtx::attributes`].
//!
//! The local port is determined according to the configured
//! [`LocalPortStrategy`](access_event::LocalPortStrategy): either the port of the interface the
//! request was received on or the port from the `Host` header.

mod handler;
mod source;

pub use handler::{AccessCtx, AccessLogHandler};
pub use source::PingoraAccessSource;
