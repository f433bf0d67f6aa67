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

use std::time::{Duration, SystemTime};

use crate::{AccessEvent, Headers, OrderedMap};

/// Placeholder for values that are missing or not available
pub const NA: &str = "-";

/// Replaces the response content of images
pub const IMAGE_CONTENTS_SUPPRESSED: &str = "[IMAGE CONTENTS SUPPRESSED]";

/// Read access to the data of a completed HTTP exchange
///
/// Implementations compute values on first access and cache them. They are meant to be read on
/// the thread handling the request, use [`AccessEventSource::fix`] to get a copy that can be
/// passed to other threads.
///
/// The methods returning optional values report `None` for data that is missing or not supported
/// by the web server. The provided helper methods convert missing values to the [`NA`]
/// placeholder.
pub trait AccessEventSource {
    /// Time at which the event was captured
    fn timestamp(&self) -> SystemTime;

    /// Time elapsed between the start of request processing and the capture
    ///
    /// This is `None` if the start time is unknown.
    fn elapsed_time(&self) -> Option<Duration>;

    /// Name of the thread that captured the event
    fn thread_name(&self) -> &str;

    /// Host name of the server
    fn server_name(&self) -> &str;

    /// Local port, as determined by the configured [`LocalPortStrategy`](crate::LocalPortStrategy)
    fn local_port(&self) -> u16;

    /// Client IP address
    fn remote_addr(&self) -> &str;

    /// Client host name, usually identical to the IP address
    fn remote_host(&self) -> &str;

    /// Authenticated user, if any
    fn remote_user(&self) -> Option<&str>;

    /// Request protocol, e.g. `HTTP/1.1`
    fn protocol(&self) -> &str;

    /// Request method
    fn method(&self) -> &str;

    /// Request path without the query string
    fn request_uri(&self) -> &str;

    /// Query string prefixed with `?`, or an empty string if there is no query
    fn query_string(&self) -> &str;

    /// Request line: method, URI with query string and protocol
    fn request_url(&self) -> &str;

    /// Request headers
    fn request_header_map(&self) -> &Headers;

    /// Request cookies, the first cookie of each name wins
    fn cookie_map(&self) -> &OrderedMap<String>;

    /// Request parameters from the query string and form data
    fn request_parameter_map(&self) -> &OrderedMap<Vec<String>>;

    /// Request attributes
    fn attribute_map(&self) -> &OrderedMap<String>;

    /// Identifier of the existing session, if any
    fn session_id(&self) -> Option<&str>;

    /// Request body, if it was captured or can be reconstructed
    fn request_content(&self) -> Option<&str>;

    /// Response status code, `0` if no response was sent
    fn status_code(&self) -> u16;

    /// Response headers
    fn response_header_map(&self) -> &Headers;

    /// Number of response body bytes sent
    fn content_length(&self) -> u64;

    /// Response body, if it was captured
    fn response_content(&self) -> Option<&str>;

    /// Reads all values and produces a frozen copy
    fn fix(&self) -> AccessEvent {
        AccessEvent::capture(self)
    }

    /// Called before an event is kept around beyond the `emit` call
    fn prepare_for_deferred_processing(&self) -> AccessEvent {
        self.fix()
    }

    /// First value of a request header or [`NA`]
    fn request_header(&self, name: &str) -> &str {
        self.request_header_map().get(name).unwrap_or(NA)
    }

    /// All values of a request header, `["-"]` if the header is missing
    fn request_header_values(&self, name: &str) -> Vec<&str> {
        let values = self.request_header_map().get_all(name);
        if values.is_empty() {
            vec![NA]
        } else {
            values.iter().map(String::as_str).collect()
        }
    }

    /// First value of a response header or [`NA`]
    fn response_header(&self, name: &str) -> &str {
        self.response_header_map().get(name).unwrap_or(NA)
    }

    /// Cookie value or [`NA`]
    fn cookie(&self, name: &str) -> &str {
        self.cookie_map()
            .get(name)
            .map(String::as_str)
            .unwrap_or(NA)
    }

    /// All values of a request parameter, `["-"]` if the parameter is missing
    fn request_parameter(&self, name: &str) -> Vec<&str> {
        match self.request_parameter_map().get(name) {
            Some(values) if !values.is_empty() => values.iter().map(String::as_str).collect(),
            _ => vec![NA],
        }
    }

    /// Request attribute or [`NA`]
    fn attribute(&self, name: &str) -> &str {
        self.attribute_map()
            .get(name)
            .map(String::as_str)
            .unwrap_or(NA)
    }

    /// Authenticated user or [`NA`]
    fn remote_user_or_sentinel(&self) -> &str {
        self.remote_user().unwrap_or(NA)
    }

    /// Session identifier or [`NA`]
    fn session_id_or_sentinel(&self) -> &str {
        self.session_id().unwrap_or(NA)
    }

    /// Elapsed time in milliseconds, `-1` if unknown
    fn elapsed_millis(&self) -> i64 {
        self.elapsed_time()
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(-1)
    }

    /// Elapsed time in whole seconds, `-1` if unknown
    fn elapsed_seconds(&self) -> i64 {
        self.elapsed_time()
            .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(-1)
    }
}
