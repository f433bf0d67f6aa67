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

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::support::{
    current_thread_name, extend_parameters, format_query_string, format_request_url,
};
use crate::{AccessEventSource, Headers, OrderedMap, UnsupportedOperation, NA};

/// Frozen access event
///
/// This holds copies of all values of an [`AccessEventSource`] and doesn't depend on any request
/// or response objects. It can be sent to other threads, kept for later processing or
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    timestamp: SystemTime,
    elapsed_time: Option<Duration>,
    thread_name: String,
    server_name: String,
    local_port: u16,
    remote_addr: String,
    remote_host: String,
    remote_user: Option<String>,
    protocol: String,
    method: String,
    request_uri: String,
    query_string: String,
    request_url: String,
    request_headers: Headers,
    cookies: OrderedMap<String>,
    request_parameters: OrderedMap<Vec<String>>,
    attributes: OrderedMap<String>,
    session_id: Option<String>,
    request_content: Option<String>,
    status_code: u16,
    response_headers: Headers,
    content_length: u64,
    response_content: Option<String>,
}

impl AccessEvent {
    /// Reads all values of an event source
    ///
    /// This forces all lazy computations of the source.
    pub fn capture<S: AccessEventSource + ?Sized>(source: &S) -> Self {
        Self {
            timestamp: source.timestamp(),
            elapsed_time: source.elapsed_time(),
            thread_name: source.thread_name().to_owned(),
            server_name: source.server_name().to_owned(),
            local_port: source.local_port(),
            remote_addr: source.remote_addr().to_owned(),
            remote_host: source.remote_host().to_owned(),
            remote_user: source.remote_user().map(str::to_owned),
            protocol: source.protocol().to_owned(),
            method: source.method().to_owned(),
            request_uri: source.request_uri().to_owned(),
            query_string: source.query_string().to_owned(),
            request_url: source.request_url().to_owned(),
            request_headers: source.request_header_map().clone(),
            cookies: source.cookie_map().clone(),
            request_parameters: source.request_parameter_map().clone(),
            attributes: source.attribute_map().clone(),
            session_id: source.session_id().map(str::to_owned),
            request_content: source.request_content().map(str::to_owned),
            status_code: source.status_code(),
            response_headers: source.response_header_map().clone(),
            content_length: source.content_length(),
            response_content: source.response_content().map(str::to_owned),
        }
    }

    /// Creates a builder for events not originating from a web server
    pub fn builder() -> AccessEventBuilder {
        AccessEventBuilder::default()
    }

    /// The thread name is fixed at capture time, this always fails
    pub fn set_thread_name(&mut self, _name: &str) -> Result<(), UnsupportedOperation> {
        Err(UnsupportedOperation {
            field: "thread name",
            request_url: self.request_url.clone(),
        })
    }
}

impl AccessEventSource for AccessEvent {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn elapsed_time(&self) -> Option<Duration> {
        self.elapsed_time
    }

    fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn remote_host(&self) -> &str {
        &self.remote_host
    }

    fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn request_uri(&self) -> &str {
        &self.request_uri
    }

    fn query_string(&self) -> &str {
        &self.query_string
    }

    fn request_url(&self) -> &str {
        &self.request_url
    }

    fn request_header_map(&self) -> &Headers {
        &self.request_headers
    }

    fn cookie_map(&self) -> &OrderedMap<String> {
        &self.cookies
    }

    fn request_parameter_map(&self) -> &OrderedMap<Vec<String>> {
        &self.request_parameters
    }

    fn attribute_map(&self) -> &OrderedMap<String> {
        &self.attributes
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn request_content(&self) -> Option<&str> {
        self.request_content.as_deref()
    }

    fn status_code(&self) -> u16 {
        self.status_code
    }

    fn response_header_map(&self) -> &Headers {
        &self.response_headers
    }

    fn content_length(&self) -> u64 {
        self.content_length
    }

    fn response_content(&self) -> Option<&str> {
        self.response_content.as_deref()
    }

    fn fix(&self) -> AccessEvent {
        self.clone()
    }
}

/// Assembles an [`AccessEvent`] value by value
///
/// The request line is derived from method, URI, query and protocol when the event is built.
#[derive(Debug)]
pub struct AccessEventBuilder {
    event: AccessEvent,
}

impl Default for AccessEventBuilder {
    fn default() -> Self {
        Self {
            event: AccessEvent {
                timestamp: SystemTime::now(),
                elapsed_time: None,
                thread_name: current_thread_name(),
                server_name: NA.to_owned(),
                local_port: 0,
                remote_addr: NA.to_owned(),
                remote_host: NA.to_owned(),
                remote_user: None,
                protocol: "HTTP/1.1".to_owned(),
                method: "GET".to_owned(),
                request_uri: "/".to_owned(),
                query_string: String::new(),
                request_url: String::new(),
                request_headers: Headers::new(),
                cookies: OrderedMap::new(),
                request_parameters: OrderedMap::new(),
                attributes: OrderedMap::new(),
                session_id: None,
                request_content: None,
                status_code: 0,
                response_headers: Headers::new(),
                content_length: 0,
                response_content: None,
            },
        }
    }
}

impl AccessEventBuilder {
    /// Sets the capture time
    pub fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    /// Sets the elapsed time
    pub fn elapsed_time(mut self, elapsed_time: Duration) -> Self {
        self.event.elapsed_time = Some(elapsed_time);
        self
    }

    /// Sets the thread name
    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.event.thread_name = thread_name.into();
        self
    }

    /// Sets the server name
    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.event.server_name = server_name.into();
        self
    }

    /// Sets the local port
    pub fn local_port(mut self, local_port: u16) -> Self {
        self.event.local_port = local_port;
        self
    }

    /// Sets both client address and client host name
    pub fn remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        let remote_addr = remote_addr.into();
        self.event.remote_host.clone_from(&remote_addr);
        self.event.remote_addr = remote_addr;
        self
    }

    /// Sets the client host name
    pub fn remote_host(mut self, remote_host: impl Into<String>) -> Self {
        self.event.remote_host = remote_host.into();
        self
    }

    /// Sets the authenticated user
    pub fn remote_user(mut self, remote_user: impl Into<String>) -> Self {
        self.event.remote_user = Some(remote_user.into());
        self
    }

    /// Sets the protocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.event.protocol = protocol.into();
        self
    }

    /// Sets the request method
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    /// Sets the request path
    pub fn request_uri(mut self, request_uri: impl Into<String>) -> Self {
        self.event.request_uri = request_uri.into();
        self
    }

    /// Sets the raw query, also adding its parameters
    pub fn query(mut self, query: &str) -> Self {
        self.event.query_string = format_query_string(Some(query));
        extend_parameters(&mut self.event.request_parameters, query);
        self
    }

    /// Adds a request header
    pub fn request_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.event.request_headers.append(name, value);
        self
    }

    /// Adds a cookie unless a cookie with this name is already present
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.event
            .cookies
            .entry(name.into())
            .or_insert_with(|| value.into());
        self
    }

    /// Adds a request parameter value
    pub fn request_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.event
            .request_parameters
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Sets a request attribute
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.event.attributes.insert(name.into(), value.into());
        self
    }

    /// Sets the session identifier
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.event.session_id = Some(session_id.into());
        self
    }

    /// Sets the request content
    pub fn request_content(mut self, content: impl Into<String>) -> Self {
        self.event.request_content = Some(content.into());
        self
    }

    /// Sets the response status code
    pub fn status_code(mut self, status_code: u16) -> Self {
        self.event.status_code = status_code;
        self
    }

    /// Adds a response header
    pub fn response_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.event.response_headers.append(name, value);
        self
    }

    /// Sets the number of response bytes sent
    pub fn content_length(mut self, content_length: u64) -> Self {
        self.event.content_length = content_length;
        self
    }

    /// Sets the response content
    pub fn response_content(mut self, content: impl Into<String>) -> Self {
        self.event.response_content = Some(content.into());
        self
    }

    /// Produces the event
    pub fn build(mut self) -> AccessEvent {
        self.event.request_url = format_request_url(
            &self.event.method,
            &self.event.request_uri,
            &self.event.query_string,
            &self.event.protocol,
        );
        self.event
    }
}
