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

//! Access event source reading actix-web’s request

use access_event::attributes::{
    INPUT_BUFFER_ATTRIBUTE, OUTPUT_BUFFER_ATTRIBUTE, REMOTE_USER_ATTRIBUTE,
};
use access_event::support::{
    collect_parameters, current_thread_name, default_port, elapsed_since, format_query_string,
    format_request_content, format_request_url, format_response_content, host_and_port,
    parse_cookies,
};
use access_event::{
    AccessEventSource, Headers, LocalPortStrategy, OrderedMap, RemoteUser, RequestAttributes,
    SessionId, NA,
};
use actix_web::http::header::{self, HeaderMap, HeaderName};
use actix_web::http::{Method, Uri, Version};
use actix_web::{HttpMessage, HttpRequest};
use once_cell::unsync::OnceCell;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Host and port as sent by the client, the proxy’s view if forwarded headers are trusted
#[derive(Debug)]
struct Authority {
    host: String,
    port: Option<u16>,
    scheme: String,
}

impl Authority {
    fn new(request: &HttpRequest, trusted: bool) -> Self {
        if trusted {
            let info = request.connection_info();
            let (host, port) = host_and_port(info.host());
            return Self {
                host: host.to_owned(),
                port,
                scheme: info.scheme().to_owned(),
            };
        }

        let config = request.app_config();
        let scheme = if config.secure() { "https" } else { "http" };
        let (host, port) = header_str(request.headers(), header::HOST)
            .map(host_and_port)
            .or_else(|| request.uri().host().map(|host| (host, request.uri().port_u16())))
            .unwrap_or_else(|| host_and_port(config.host()));
        Self {
            host: host.to_owned(),
            port,
            scheme: scheme.to_owned(),
        }
    }
}

/// Request data captured before the request is passed on
///
/// actix-web needs exclusive access to the request while routing, so no `HttpRequest` can be
/// kept until the response is complete.
#[derive(Debug)]
pub(crate) struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    peer_addr: Option<SocketAddr>,
    local_addr: SocketAddr,
    authority: Authority,
    forwarded_for: Option<String>,
}

impl RequestHead {
    /// Captures the request, forwarded headers are only considered if `trusted` is `true`
    pub(crate) fn new(request: &HttpRequest, trusted: bool) -> Self {
        let forwarded_for = if trusted {
            request
                .connection_info()
                .realip_remote_addr()
                .map(|addr| host_and_port(addr).0.to_owned())
        } else {
            None
        };

        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            peer_addr: request.peer_addr(),
            local_addr: request.app_config().local_addr(),
            authority: Authority::new(request, trusted),
            forwarded_for,
        }
    }

    pub(crate) fn path(&self) -> &str {
        self.uri.path()
    }
}

/// Values handlers store in the request extensions
#[derive(Debug, Default)]
pub(crate) struct Identity {
    pub(crate) remote_user: Option<String>,
    pub(crate) session_id: Option<String>,
}

impl Identity {
    pub(crate) fn new(request: &HttpRequest) -> Self {
        let extensions = request.extensions();
        Self {
            remote_user: extensions
                .get::<RemoteUser>()
                .map(|RemoteUser(user)| user.clone()),
            session_id: extensions
                .get::<SessionId>()
                .map(|SessionId(id)| id.clone()),
        }
    }
}

/// A completed request/response exchange
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) head: RequestHead,
    pub(crate) identity: Identity,
    pub(crate) start: SystemTime,
    pub(crate) attributes: RequestAttributes,
    pub(crate) status: u16,
    pub(crate) response_headers: HeaderMap,
    pub(crate) bytes_sent: u64,
}

/// Access event source reading a completed exchange
pub(crate) struct ActixAccessSource<'a> {
    exchange: &'a Exchange,
    local_port_strategy: LocalPortStrategy,
    timestamp: SystemTime,
    thread_name: String,
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

impl Debug for ActixAccessSource<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActixAccessSource")
            .field("request_url", &self.request_url())
            .field("status_code", &self.status_code())
            .finish_non_exhaustive()
    }
}

impl<'a> ActixAccessSource<'a> {
    pub(crate) fn new(exchange: &'a Exchange, local_port_strategy: LocalPortStrategy) -> Self {
        Self {
            exchange,
            local_port_strategy,
            timestamp: SystemTime::now(),
            thread_name: current_thread_name(),
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

    fn head(&self) -> &'a RequestHead {
        &self.exchange.head
    }

    fn content_type(&self) -> Option<&'a str> {
        header_str(&self.head().headers, header::CONTENT_TYPE)
    }
}

impl AccessEventSource for ActixAccessSource<'_> {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn elapsed_time(&self) -> Option<Duration> {
        elapsed_since(self.exchange.start, self.timestamp)
    }

    fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn server_name(&self) -> &str {
        let host = &self.head().authority.host;
        if host.is_empty() {
            NA
        } else {
            host
        }
    }

    fn local_port(&self) -> u16 {
        let head = self.head();
        match self.local_port_strategy {
            LocalPortStrategy::Local => head.local_addr.port(),
            LocalPortStrategy::Server => head
                .authority
                .port
                .unwrap_or_else(|| default_port(&head.authority.scheme)),
        }
    }

    fn remote_addr(&self) -> &str {
        self.remote_addr.get_or_init(|| {
            let head = self.head();
            head.forwarded_for.clone().unwrap_or_else(|| {
                head.peer_addr
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| NA.to_owned())
            })
        })
    }

    fn remote_host(&self) -> &str {
        self.remote_addr()
    }

    fn remote_user(&self) -> Option<&str> {
        self.exchange
            .identity
            .remote_user
            .as_deref()
            .or_else(|| self.attribute_map().get(REMOTE_USER_ATTRIBUTE).map(String::as_str))
    }

    fn protocol(&self) -> &str {
        self.protocol
            .get_or_init(|| format!("{:?}", self.head().version))
    }

    fn method(&self) -> &str {
        self.head().method.as_str()
    }

    fn request_uri(&self) -> &str {
        self.head().path()
    }

    fn query_string(&self) -> &str {
        self.query_string
            .get_or_init(|| format_query_string(self.head().uri.query()))
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
            .get_or_init(|| self.head().headers.iter().collect())
    }

    fn cookie_map(&self) -> &OrderedMap<String> {
        self.cookies.get_or_init(|| {
            parse_cookies(
                self.head()
                    .headers
                    .get_all(header::COOKIE)
                    .filter_map(|value| value.to_str().ok()),
            )
        })
    }

    fn request_parameter_map(&self) -> &OrderedMap<Vec<String>> {
        self.parameters.get_or_init(|| {
            let body = self.exchange.attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE);
            collect_parameters(
                self.head().uri.query(),
                self.content_type(),
                body.as_deref(),
            )
        })
    }

    fn attribute_map(&self) -> &OrderedMap<String> {
        self.attributes
            .get_or_init(|| self.exchange.attributes.to_map())
    }

    fn session_id(&self) -> Option<&str> {
        self.exchange.identity.session_id.as_deref()
    }

    fn request_content(&self) -> Option<&str> {
        self.request_content
            .get_or_init(|| {
                let body = self.exchange.attributes.get_bytes(INPUT_BUFFER_ATTRIBUTE);
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
                let body = self.exchange.attributes.get_bytes(OUTPUT_BUFFER_ATTRIBUTE);
                format_response_content(
                    self.response_header_map().get("content-type"),
                    body.as_deref(),
                )
            })
            .as_deref()
    }
}
