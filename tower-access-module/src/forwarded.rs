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

//! Layer evaluating `X-Forwarded-*` headers set by reverse proxies

use access_event::attributes::{
    FORWARDED_MARKER_ATTRIBUTE, PROTOCOL_ATTRIBUTE, REMOTE_ADDR_ATTRIBUTE, REMOTE_HOST_ATTRIBUTE,
    SERVER_NAME_ATTRIBUTE, SERVER_PORT_ATTRIBUTE,
};
use access_event::support::{default_port, host_and_port};
use http::header::HeaderName;
use http::{HeaderMap, Request};
use log::trace;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::layer::request_attributes;

#[derive(Debug, Clone)]
struct HeaderNames {
    remote_ip: HeaderName,
    protocol: HeaderName,
    host: HeaderName,
    port: HeaderName,
}

/// Stores client address, host, port and protocol as reported by a reverse proxy in the request
/// attributes
///
/// The access log uses these values instead of the connection data if the runtime's
/// `request_attributes_enabled` setting is `true` or unset.
#[derive(Debug, Clone)]
pub struct ForwardedHeadersLayer {
    names: Arc<HeaderNames>,
}

impl Default for ForwardedHeadersLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardedHeadersLayer {
    /// Creates a layer evaluating `X-Forwarded-For`, `X-Forwarded-Proto`, `X-Forwarded-Host` and
    /// `X-Forwarded-Port` headers
    pub fn new() -> Self {
        Self {
            names: Arc::new(HeaderNames {
                remote_ip: HeaderName::from_static("x-forwarded-for"),
                protocol: HeaderName::from_static("x-forwarded-proto"),
                host: HeaderName::from_static("x-forwarded-host"),
                port: HeaderName::from_static("x-forwarded-port"),
            }),
        }
    }

    /// Uses a different header for the client address, e.g. `X-Real-IP`
    pub fn with_remote_ip_header(self, name: HeaderName) -> Self {
        self.with_names(|names| names.remote_ip = name)
    }

    /// Uses a different header for the original protocol
    pub fn with_protocol_header(self, name: HeaderName) -> Self {
        self.with_names(|names| names.protocol = name)
    }

    /// Uses a different header for the original host
    pub fn with_host_header(self, name: HeaderName) -> Self {
        self.with_names(|names| names.host = name)
    }

    /// Uses a different header for the original port
    pub fn with_port_header(self, name: HeaderName) -> Self {
        self.with_names(|names| names.port = name)
    }

    fn with_names(self, modify: impl FnOnce(&mut HeaderNames)) -> Self {
        let mut names = HeaderNames::clone(&self.names);
        modify(&mut names);
        Self {
            names: Arc::new(names),
        }
    }
}

impl<S> Layer<S> for ForwardedHeadersLayer {
    type Service = ForwardedHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ForwardedHeadersService {
            inner,
            names: self.names.clone(),
        }
    }
}

/// Service produced by [`ForwardedHeadersLayer`]
#[derive(Debug, Clone)]
pub struct ForwardedHeadersService<S> {
    inner: S,
    names: Arc<HeaderNames>,
}

/// First entry of a comma-separated header, for `X-Forwarded-For` this is the original client
fn first_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

impl<S> ForwardedHeadersService<S> {
    fn apply<B>(&self, request: &mut Request<B>) {
        let attributes = request_attributes(request);
        let headers = request.headers();

        if let Some(client) = first_value(headers, &self.names.remote_ip) {
            trace!("Forwarded client address: {client}");
            attributes.set(REMOTE_ADDR_ATTRIBUTE, client);
            attributes.set(REMOTE_HOST_ATTRIBUTE, client);
        }

        let mut port = first_value(headers, &self.names.port).and_then(|port| port.parse().ok());
        if let Some(host) = first_value(headers, &self.names.host) {
            let (name, host_port) = host_and_port(host);
            attributes.set(SERVER_NAME_ATTRIBUTE, name);
            port = port.or(host_port);
        }
        let port = port.or_else(|| first_value(headers, &self.names.protocol).map(default_port));
        if let Some(port) = port {
            attributes.set(SERVER_PORT_ATTRIBUTE, port.to_string());
        }

        attributes.set(PROTOCOL_ATTRIBUTE, format!("{:?}", request.version()));
        attributes.set(FORWARDED_MARKER_ATTRIBUTE, "true");
    }
}

impl<S, B> Service<Request<B>> for ForwardedHeadersService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        self.apply(&mut request);
        self.inner.call(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_context::{AccessLogConf, RuntimeConf};
    use access_event::AccessEventSource;
    use axum::body::Body;
    use http::header;
    use test_log::test;

    use crate::test_utils::{app, capture_context, connected, send};

    fn forwarded_request() -> Request<Body> {
        let request = Request::builder()
            .uri("/mock-controller/text")
            .header(header::HOST, "backend:8080")
            .header("X-Forwarded-For", "1.2.3.4, 10.0.0.2")
            .header("X-Forwarded-Proto", "https")
            .header("X-Forwarded-Host", "www.example.com")
            .body(Body::empty())
            .unwrap();
        connected(request, "10.0.0.2:8080", "10.0.0.1:40000")
    }

    #[test]
    fn header_values() {
        let mut headers = HeaderMap::new();
        let name = HeaderName::from_static("x-forwarded-for");
        assert_eq!(first_value(&headers, &name), None);

        headers.append(&name, " , ".parse().unwrap());
        headers.append(&name, "1.2.3.4 , 5.6.7.8".parse().unwrap());
        assert_eq!(first_value(&headers, &name), Some("1.2.3.4"));
    }

    #[test]
    fn attributes_written() {
        let layer = ForwardedHeadersLayer::new()
            .with_remote_ip_header(HeaderName::from_static("x-real-ip"));
        let service = layer.layer(());
        let mut request = Request::builder()
            .header("X-Real-IP", "1.2.3.4")
            .header("X-Forwarded-Host", "example.com:8443")
            .body(())
            .unwrap();
        service.apply(&mut request);

        let attributes = request_attributes(&mut request);
        let text = |name| attributes.get_text(name);
        assert_eq!(text(REMOTE_ADDR_ATTRIBUTE).as_deref(), Some("1.2.3.4"));
        assert_eq!(text(REMOTE_HOST_ATTRIBUTE).as_deref(), Some("1.2.3.4"));
        assert_eq!(text(SERVER_NAME_ATTRIBUTE).as_deref(), Some("example.com"));
        assert_eq!(text(SERVER_PORT_ATTRIBUTE).as_deref(), Some("8443"));
        assert_eq!(text(PROTOCOL_ATTRIBUTE).as_deref(), Some("HTTP/1.1"));
        assert!(attributes.contains(FORWARDED_MARKER_ATTRIBUTE));
    }

    #[test(tokio::test)]
    async fn trusted_automatically() {
        let (context, capture) = capture_context();
        send(app(context, &AccessLogConf::default(), true, None), forwarded_request()).await;

        let event = &capture.events()[0];
        assert_eq!(event.remote_addr(), "1.2.3.4");
        assert_eq!(event.remote_host(), "1.2.3.4");
        assert_eq!(event.server_name(), "www.example.com");
        assert_eq!(event.local_port(), 443);
        assert_eq!(event.protocol(), "HTTP/1.1");
        assert!(!event.attribute_map().contains_key(FORWARDED_MARKER_ATTRIBUTE));
    }

    #[test(tokio::test)]
    async fn not_trusted() {
        let (context, capture) = capture_context();
        let conf = AccessLogConf {
            tower: RuntimeConf {
                request_attributes_enabled: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        send(app(context.clone(), &conf, true, None), forwarded_request()).await;
        send(app(context, &AccessLogConf::default(), false, None), forwarded_request()).await;

        for event in capture.events() {
            assert_eq!(event.remote_addr(), "10.0.0.1");
            assert_eq!(event.server_name(), "backend");
            assert_eq!(event.local_port(), 8080);
        }
        assert_eq!(capture.len(), 2);
    }
}
