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

//! Connection information for axum servers

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use log::debug;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;

/// Local and remote address of a connection
///
/// Using this type as connect info makes the local port available to the access log:
///
/// ```rust,no_run
/// use axum::Router;
/// use tower_access_module::SocketPair;
///
/// # async fn run() -> std::io::Result<()> {
/// let app = Router::new();
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
/// axum::serve(
///     listener,
///     app.into_make_service_with_connect_info::<SocketPair>(),
/// )
/// .await
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketPair {
    /// Address of the interface the connection was accepted on
    pub local: SocketAddr,
    /// Address of the client
    pub remote: SocketAddr,
}

impl Connected<IncomingStream<'_, TcpListener>> for SocketPair {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        let remote = *stream.remote_addr();
        let local = stream.io().local_addr().unwrap_or_else(|err| {
            debug!("Failed determining local address of connection from {remote}: {err}");
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        });
        Self { local, remote }
    }
}
