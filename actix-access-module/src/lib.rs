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

//! # Access log for actix-web
//!
//! [`AccessLog`] produces an access event for each request and passes it to an
//! [`AccessContext`](access_context::AccessContext). The event is emitted once the response body
//! has been sent or dropped. Request data is captured before the request is passed on, values
//! handlers store in the request extensions are read once the response is available.
//!
//! ```rust
//! use access_context::{AccessContext, AccessLogSettings};
//! use actix_access_module::AccessLog;
//! use actix_web::{web, App};
//! use std::sync::Arc;
//!
//! let settings = AccessLogSettings::default();
//! let context = Arc::new(AccessContext::from_settings(&settings).unwrap().unwrap());
//!
//! let app = App::new()
//!     .wrap(AccessLog::from_conf(context, &settings.access_log))
//!     .route("/", web::get().to(|| async { "Hello" }));
//! ```
//!
//! The client address is the peer address of the connection. With `request_attributes_enabled`
//! set for the `actix` runtime, the `Forwarded` and `X-Forwarded-*` headers evaluated by
//! actix-web’s [`ConnectionInfo`](actix_web::dev::ConnectionInfo) are used instead.
//!
//! Session middleware and authentication can make session ID and user name available by
//! inserting [`SessionId`](access_event::SessionId) and [`RemoteUser`](access_event::RemoteUser)
//! into the request extensions. Logging never creates a session.

mod middleware;
mod source;

pub use middleware::{request_attributes, AccessLog, AccessLogBody, AccessLogMiddleware};
