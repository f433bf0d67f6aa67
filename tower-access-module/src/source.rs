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

//! Access event source for requests processed by a tower service

use access_event::attributes::{
    FORWARDED_MARKER_ATTRIBUTE, INPUT_BUFFER_ATTRIBUTE, OUTPUT_BUFFER_ATTRIBUTE,
    PROTOCOL_ATTRIBUTE, REMOTE_ADDR_ATTRIBUTE, REMOTE_HOST_ATTRIBUTE, REMOTE_USER_ATTRIBUTE,
    SERVER_NAME_ATTRIBUTE, SERVER_PORT_ATTRIBUTE,
};
use access_event::support::{
    collect_parameters, current_thread_name, default_port, elapsed_since, format_query_string,
    format_request_content, format_request_url, format_response_content, host_and_port,
    parse_cookies,
};
use access_event::{
    AccessEventSource, Headers, LocalPortStrategy, OrderedMap, RemoteUser, RequestAttributes, NA,
};
use axum::extract::ConnectInfo;
use http::{header, HeaderMap, Method, Request, Uri, Version};
use once_cell::unsync::OnceCell;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use crate::connect::SocketPair;

/// Request data retained until the response completes
#[derive(Debug)]
pub(crate) struct RequestInfo {
    pub(crate) start: SystemTime,
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) remote_user: Option<String>,
    pub(crate) attributes: RequestAttributes,
}

impl RequestInfo {
    pub(crate) fn new<B>(
        start: SystemTime,
        request: &Request<B>,
        attributes: RequestAttributes,
    ) -> Self {
        let extensions = request.extensions();
        let (local, remote) =
            if let Some(ConnectInfo(pair)) = extensions.get::<ConnectInfo<SocketPair>>() {
                (Some(pair.local), Some(pair.remote))
            } else if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
                (None, Some(*addr))
            } else {
                (None, None)
            };

        Self {
            start,
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            local,
            remote,
            remote_user: extensions
                .get::<RemoteUser>()
                .map(|RemoteUser(user)| user.clone()),
            attributes,
        }
    }
}

/// A completed request/response exchange
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) request: RequestInfo,
    pub(crate) status: u16,
    pub(crate) response_headers: HeaderMap,
    pub(crate) bytes_sent: u64,
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Access event source reading a completed exchange
pub(crate) struct TowerAccessSource<'a> {
    exchange: &'a Exchange,
    local_port_strategy: LocalPortStrategy,
    trusted: bool,
    timestamp: SystemTime,
    thread_name: String,
    attributes: OnceCell<OrderedMap<String>>,
    forwarded: OnceCell<Forwarded>,
    server_name: OnceCell<String>,
    local_port: OnceCell<u16>,
    remote_addr: OnceCell<String>,
    remote_user: OnceCell<Option<String>>,
    protocol: OnceCell<String>,
    query_string: OnceCell<String>,
    request_url: OnceCell<String>,
    request_headers: OnceCell<Headers>,
    cookies: OnceCell<OrderedMap<String>>,
    parameters: OnceCell<OrderedMap<Vec<String>>>,
    request_content: OnceCell<Option<String>>,
    response_headers: OnceCell<Headers>,
    response_content: OnceCell<Option<String>>,
}

/// Values determined by the forwarded headers layer, only filled in if trusted
#[derive(Debug, Default)]
struct Forwarded {
    remote_addr: Option<String>,
    remote_host: Option<String>,
    protocol: Option<String>,
    server_name: Option<String>,
    server_port: Option<u16>,
}

impl Debug for TowerAccessSource<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TowerAccessSource")
            .field("request_url", &self.request_url())
            .field("status_code", &self.status_code())
            .finish_non_exhaustive()
    }
}

impl<'a> TowerAccessSource<'a> {
    /// Creates a source, `request_attributes_enabled` decides whether forwarded values are used
    ///
    /// If `request_attributes_enabled` is `None`, forwarded values are used whenever the
    /// forwarded headers layer processed the request.
    pub(crate) fn new(
        exchange: &'a Exchange,
        local_port_strategy: LocalPortStrategy,
        request_attributes_enabled: Option<bool>,
    ) -> Self {
        let trusted = request_attributes_enabled
            .unwrap_or_else(|| exchange.request.attributes.contains(FORWARDED_MARKER_ATTRIBUTE));
        Self {
            exchange,
            local_port_strategy,
            trusted,
            timestamp: SystemTime::now(),
            thread_name: current_thread_name(),
            attributes: OnceCell::new(),
            forwarded: OnceCell::new(),
            server_name: OnceCell::new(),
            local_port: OnceCell::new(),
            remote_addr: OnceCell::new(),
            remote_user: OnceCell::new(),
            protocol: OnceCell::new(),
            query_string: OnceCell::new(),
            request_url: OnceCell::new(),
            request_headers: OnceCell::new(),
            cookies: OnceCell::new(),
            parameters: OnceCell::new(),
            request_content: OnceCell::new(),
            response_headers: OnceCell::new(),
            response_content: OnceCell::new(),
        }
    }

    fn request(&self) -> &'a RequestInfo {
        &self.exchange.request
    }

    fn forwarded(&self) -> &Forwarded {
        self.forwarded.get_or_init(|| {
            if !self.trusted {
                return Forwarded::default();
            }
            let attributes = &self.request().attributes;
            Forwarded {
                remote_addr: attributes.get_text(REMOTE_ADDR_ATTRIBUTE),
                remote_host: attributes.get_text(REMOTE_HOST_ATTRIBUTE),
                protocol: attributes.get_text(PROTOCOL_ATTRIBUTE),
                server_name: attributes.get_text(SERVER_NAME_ATTRIBUTE),
                server_port: attributes
                    .get_text(SERVER_PORT_ATTRIBUTE)
                    .and_then(|port| port.parse().ok()),
            }
        })
    }

    fn host(&self) -> Option<(&'a str, Option<u16>)> {
        header_str(&self.request().headers, header::HOST).map(host_and_port)
    }

    fn content_type(&self) -> Option<&'a str> {
        header_str(&self.request().headers, header::CONTENT_TYPE)
    }

    fn server_port(&self) -> u16 {
        self.forwarded()
            .server_port
            .or_else(|| self.host().and_then(|(_, port)| port))
            .or_else(|| self.request().uri.port_u16())
            .unwrap_or_else(|| default_port(self.request().uri.scheme_str().unwrap_or("http")))
    }
}

impl AccessEventSource for TowerAccessSource<'_> {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn elapsed_time(&self) -> Option<Duration> {
        elapsed_since(self.request().start, self.timestamp)
    }

    fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn server_name(&self) -> &str {
        self.server_name.get_or_init(|| {
            if let Some(name) = &self.forwarded().server_name {
                name.clone()
            } else if let Some((host, _)) = self.host() {
                host.to_owned()
            } else if let Some(host) = self.request().uri.host() {
                host.to_owned()
            } else if let Some(local) = self.request().local {
                local.ip().to_string()
            } else {
                NA.to_owned()
            }
        })
    }

    fn local_port(&self) -> u16 {
        *self
            .local_port
            .get_or_init(|| match (self.local_port_strategy, self.request().local) {
                (LocalPortStrategy::Local, Some(local)) => local.port(),
                _ => self.server_port(),
            })
    }

    fn remote_addr(&self) -> &str {
        self.remote_addr.get_or_init(|| {
            if let Some(addr) = &self.forwarded().remote_addr {
                addr.clone()
            } else if let Some(remote) = self.request().remote {
                remote.ip().to_string()
            } else {
                NA.to_owned()
            }
        })
    }

    fn remote_host(&self) -> &str {
        match &self.forwarded().remote_host {
            Some(host) => host,
            None => self.remote_addr(),
        }
    }

    fn remote_user(&self) -> Option<&str> {
        self.remote_user
            .get_or_init(|| {
                self.request()
                    .attributes
                    .get_text(REMOTE_USER_ATTRIBUTE)
                    .or_else(|| self.request().remote_user.clone())
            })
            .as_deref()
    }

    fn protocol(&self) -> &str {
        self.protocol.get_or_init(|| {
            self.forwarded()
                .protocol
                .clone()
                .unwrap_or_else(|| format!("{:?}", self.request().version))
        })
    }

    fn method(&self) -> &str {
        self.request().method.as_str()
    }

    fn request_uri(&self) -> &str {
        self.request().uri.path()
    }

    fn query_string(&self) -> &str {
        self.query_string
            .get_or_init(|| format_query_string(self.request().uri.query()))
    }

    fn request_url(&self) -> &str {
        self.request_url.get_or_init(|| {
            format_request_url(
                self.method(),
                self.request_uri(),
                self.query_string(),
                self.protocol(),
            )
        })
    }

    fn request_header_map(&self) -> &Headers {
        self.request_headers
            .get_or_init(|| self.request().headers.iter().collect())
    }

    fn cookie_map(&self) -> &OrderedMap<String> {
        self.cookies.get_or_init(|| {
            parse_cookies(
                self.request()
                    .headers
                    .get_all(header::COOKIE)
                    .iter()
                    .filter_map(|value| value.to_str().ok()),
            )
        })
    }

    fn request_parameter_map(&self) -> &OrderedMap<Vec<String>> {
        self.parameters.get_or_init(|| {
            let body = self.request().attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE);
            collect_parameters(
                self.request().uri.query(),
                self.content_type(),
                body.as_deref(),
            )
        })
    }

    fn attribute_map(&self) -> &OrderedMap<String> {
        self.attributes
            .get_or_init(|| self.request().attributes.to_map())
    }

    fn session_id(&self) -> Option<&str> {
        None
    }

    fn request_content(&self) -> Option<&str> {
        self.request_content
            .get_or_init(|| {
                let body = self.request().attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE);
                format_request_content(
                    self.method(),
                    self.content_type(),
                    self.request_parameter_map(),
                    body.as_deref(),
                )
            })
            .as_deref()
    }

    fn status_code(&self) -> u16 {
        self.exchange.status
    }

    fn response_header_map(&self) -> &Headers {
        self.response_headers
            .get_or_init(|| self.exchange.response_headers.iter().collect())
    }

    fn content_length(&self) -> u64 {
        self.exchange.bytes_sent
    }

    fn response_content(&self) -> Option<&str> {
        self.response_content
            .get_or_init(|| {
                let body = self.request().attributes.get_bytes(OUTPUT_BUFFER_ATTRIBUTE);
                format_response_content(
                    self.response_header_map().get("content-type"),
                    body.as_deref(),
                )
            })
            .as_deref()
    }
}
