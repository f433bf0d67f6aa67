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

//! Access event source reading Pingora’s session

use access_event::attributes::{
    FORWARDED_MARKER_ATTRIBUTE, INPUT_BUFFER_ATTRIBUTE, OUTPUT_BUFFER_ATTRIBUTE,
    PROTOCOL_ATTRIBUTE, REMOTE_ADDR_ATTRIBUTE, REMOTE_HOST_ATTRIBUTE, SERVER_NAME_ATTRIBUTE,
    SERVER_PORT_ATTRIBUTE,
};
use access_event::support::{
    collect_parameters, current_thread_name, default_port, elapsed_since, format_query_string,
    format_request_content, format_request_url, format_response_content, host_and_port,
    parse_cookies,
};
use access_event::{AccessEventSource, Headers, LocalPortStrategy, OrderedMap, NA};
use http::{header, HeaderMap, Uri};
use once_cell::unsync::OnceCell;
use pingora::protocols::l4::socket::SocketAddr;
use pingora::proxy::Session;
use std::fmt::{Debug, Formatter};
use std::time::{Duration, SystemTime};

use crate::handler::AccessCtx;

fn inet(addr: Option<&SocketAddr>) -> Option<&std::net::SocketAddr> {
    addr.and_then(SocketAddr::as_inet)
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Values a forwarded headers component stored in the request attributes
#[derive(Debug, Default)]
struct Forwarded {
    remote_addr: Option<String>,
    remote_host: Option<String>,
    protocol: Option<String>,
    server_name: Option<String>,
    server_port: Option<u16>,
}

/// Access event source for a request processed by Pingora
///
/// All values are computed on first access. The source has to be consumed while the session is
/// still available, usually during the `logging` phase.
///
/// Forwarded address, host, port and protocol are taken from the request attributes if these
/// are trusted, see [`PingoraAccessSource::with_request_attributes`].
pub struct PingoraAccessSource<'a> {
    session: &'a Session,
    ctx: &'a AccessCtx,
    local_port_strategy: LocalPortStrategy,
    fallback_status: Option<u16>,
    trusted: bool,
    timestamp: SystemTime,
    thread_name: String,
    forwarded: OnceCell<Forwarded>,
    server_name: OnceCell<String>,
    local_port: OnceCell<u16>,
    remote_addr: OnceCell<String>,
    protocol: OnceCell<String>,
    query_string: OnceCell<String>,
    request_url: OnceCell<String>,
    request_headers: OnceCell<Headers>,
    cookies: OnceCell<OrderedMap<String>>,
    parameters: OnceCell<OrderedMap<Vec<String>>>,
    attributes: OnceCell<OrderedMap<String>>,
    request_content: OnceCell<Option<String>>,
    response_headers: OnceCell<Headers>,
    response_content: OnceCell<Option<String>>,
}

impl Debug for PingoraAccessSource<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingoraAccessSource")
            .field("request_url", &self.request_url())
            .field("status_code", &self.status_code())
            .finish_non_exhaustive()
    }
}

impl<'a> PingoraAccessSource<'a> {
    /// Creates a source for the current state of the session
    pub fn new(
        session: &'a Session,
        ctx: &'a AccessCtx,
        local_port_strategy: LocalPortStrategy,
    ) -> Self {
        Self {
            session,
            ctx,
            local_port_strategy,
            fallback_status: None,
            trusted: ctx.attributes.contains(FORWARDED_MARKER_ATTRIBUTE),
            timestamp: SystemTime::now(),
            thread_name: current_thread_name(),
            forwarded: OnceCell::new(),
            server_name: OnceCell::new(),
            local_port: OnceCell::new(),
            remote_addr: OnceCell::new(),
            protocol: OnceCell::new(),
            query_string: OnceCell::new(),
            request_url: OnceCell::new(),
            request_headers: OnceCell::new(),
            cookies: OnceCell::new(),
            parameters: OnceCell::new(),
            attributes: OnceCell::new(),
            request_content: OnceCell::new(),
            response_headers: OnceCell::new(),
            response_content: OnceCell::new(),
        }
    }

    /// Status code reported if no response header was written
    pub fn with_fallback_status(mut self, status: u16) -> Self {
        self.fallback_status = Some(status);
        self
    }

    /// Decides whether forwarded values in the request attributes are used
    ///
    /// If `enabled` is `None`, these are used whenever a forwarded headers component marked the
    /// request with
    /// [`FORWARDED_MARKER_ATTRIBUTE`](access_event::attributes::FORWARDED_MARKER_ATTRIBUTE).
    pub fn with_request_attributes(mut self, enabled: Option<bool>) -> Self {
        if let Some(enabled) = enabled {
            self.trusted = enabled;
        }
        self
    }

    fn forwarded(&self) -> &Forwarded {
        self.forwarded.get_or_init(|| {
            if !self.trusted {
                return Forwarded::default();
            }
            let attributes = &self.ctx.attributes;
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

    fn uri(&self) -> &'a Uri {
        self.ctx
            .original_uri
            .as_ref()
            .unwrap_or(&self.session.req_header().uri)
    }

    fn host(&self) -> Option<(&'a str, Option<u16>)> {
        header_str(&self.session.req_header().headers, header::HOST).map(host_and_port)
    }

    fn content_type(&self) -> Option<&'a str> {
        header_str(&self.session.req_header().headers, header::CONTENT_TYPE)
    }

    fn scheme_port(&self) -> u16 {
        default_port(self.uri().scheme_str().unwrap_or("http"))
    }
}

impl AccessEventSource for PingoraAccessSource<'_> {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn elapsed_time(&self) -> Option<Duration> {
        elapsed_since(self.ctx.start, self.timestamp)
    }

    fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn server_name(&self) -> &str {
        self.server_name.get_or_init(|| {
            if let Some(host) = &self.forwarded().server_name {
                host.clone()
            } else if let Some((host, _)) = self.host() {
                host.to_owned()
            } else if let Some(host) = self.uri().host() {
                host.to_owned()
            } else if let Some(addr) = inet(self.session.server_addr()) {
                addr.ip().to_string()
            } else {
                NA.to_owned()
            }
        })
    }

    fn local_port(&self) -> u16 {
        *self.local_port.get_or_init(|| {
            let local = inet(self.session.server_addr()).map(std::net::SocketAddr::port);
            match self.local_port_strategy {
                LocalPortStrategy::Local => local.unwrap_or_else(|| self.scheme_port()),
                LocalPortStrategy::Server => self
                    .forwarded()
                    .server_port
                    .or_else(|| self.host().and_then(|(_, port)| port))
                    .or_else(|| self.uri().port_u16())
                    .or(local)
                    .unwrap_or_else(|| self.scheme_port()),
            }
        })
    }

    fn remote_addr(&self) -> &str {
        self.remote_addr.get_or_init(|| {
            if let Some(addr) = &self.forwarded().remote_addr {
                return addr.clone();
            }
            inet(self.session.client_addr())
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| NA.to_owned())
        })
    }

    fn remote_host(&self) -> &str {
        self.forwarded()
            .remote_host
            .as_deref()
            .unwrap_or_else(|| self.remote_addr())
    }

    fn remote_user(&self) -> Option<&str> {
        self.ctx.remote_user.as_deref()
    }

    fn protocol(&self) -> &str {
        self.protocol.get_or_init(|| {
            self.forwarded()
                .protocol
                .clone()
                .unwrap_or_else(|| format!("{:?}", self.session.req_header().version))
        })
    }

    fn method(&self) -> &str {
        self.session.req_header().method.as_str()
    }

    fn request_uri(&self) -> &str {
        self.uri().path()
    }

    fn query_string(&self) -> &str {
        self.query_string
            .get_or_init(|| format_query_string(self.uri().query()))
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
            .get_or_init(|| self.session.req_header().headers.iter().collect())
    }

    fn cookie_map(&self) -> &OrderedMap<String> {
        self.cookies.get_or_init(|| {
            parse_cookies(
                self.session
                    .req_header()
                    .headers
                    .get_all(header::COOKIE)
                    .iter()
                    .filter_map(|value| value.to_str().ok()),
            )
        })
    }

    fn request_parameter_map(&self) -> &OrderedMap<Vec<String>> {
        self.parameters.get_or_init(|| {
            let body = self.ctx.attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE);
            collect_parameters(self.uri().query(), self.content_type(), body.as_deref())
        })
    }

    fn attribute_map(&self) -> &OrderedMap<String> {
        self.attributes.get_or_init(|| self.ctx.attributes.to_map())
    }

    fn session_id(&self) -> Option<&str> {
        None
    }

    fn request_content(&self) -> Option<&str> {
        self.request_content
            .get_or_init(|| {
                let body = self.ctx.attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE);
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
        self.session
            .response_written()
            .map(|header| header.status.as_u16())
            .or(self.fallback_status)
            .unwrap_or(0)
    }

    fn response_header_map(&self) -> &Headers {
        self.response_headers.get_or_init(|| {
            self.session
                .response_written()
                .map(|header| header.headers.iter().collect())
                .unwrap_or_default()
        })
    }

    fn content_length(&self) -> u64 {
        self.session.body_bytes_sent() as u64
    }

    fn response_content(&self) -> Option<&str> {
        self.response_content
            .get_or_init(|| {
                let body = self.ctx.attributes.get_bytes(OUTPUT_BUFFER_ATTRIBUTE);
                format_response_content(
                    self.response_header_map().get("content-type"),
                    body.as_deref(),
                )
            })
            .as_deref()
    }
}
