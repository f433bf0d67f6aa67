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

//! Helpers shared by the event source implementations

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::{Duration, SystemTime};

use crate::{OrderedMap, IMAGE_CONTENTS_SUPPRESSED};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

// Characters that stay unencoded in form data
const FORM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');

/// Converts the raw query of a URI into the query string representation: `?` followed by the
/// query or an empty string
pub fn format_query_string(query: Option<&str>) -> String {
    match query {
        Some(query) => format!("?{query}"),
        None => String::new(),
    }
}

/// Produces the request line
pub fn format_request_url(
    method: &str,
    request_uri: &str,
    query_string: &str,
    protocol: &str,
) -> String {
    format!("{method} {request_uri}{query_string} {protocol}")
}

fn decode_component(value: &str) -> String {
    let value = value.replace('+', " ");
    percent_decode_str(&value).decode_utf8_lossy().into_owned()
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, FORM_ENCODE_SET)
        .to_string()
        .replace("%20", "+")
}

/// Adds the parameters of form-encoded data to a parameter map
///
/// Parameters without a value are added with an empty value.
pub fn extend_parameters(parameters: &mut OrderedMap<Vec<String>>, data: &str) {
    for pair in data.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        parameters
            .entry(decode_component(name))
            .or_default()
            .push(decode_component(value));
    }
}

/// Parses the parameters of a query
pub fn parse_query(query: Option<&str>) -> OrderedMap<Vec<String>> {
    let mut parameters = OrderedMap::new();
    if let Some(query) = query {
        extend_parameters(&mut parameters, query);
    }
    parameters
}

/// Collects the request parameters from the query and a captured form-encoded body
pub fn collect_parameters(
    query: Option<&str>,
    content_type: Option<&str>,
    body: Option<&[u8]>,
) -> OrderedMap<Vec<String>> {
    let mut parameters = parse_query(query);
    if let Some(body) = body.filter(|_| is_form_urlencoded(content_type)) {
        extend_parameters(&mut parameters, &String::from_utf8_lossy(body));
    }
    parameters
}

/// Parses `Cookie` header values, the first cookie of each name wins
pub fn parse_cookies(headers: impl IntoIterator<Item = impl AsRef<str>>) -> OrderedMap<String> {
    let mut cookies = OrderedMap::new();
    for header in headers {
        for cookie in header.as_ref().split(';') {
            let Some((name, value)) = cookie.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|value| value.strip_suffix('"'))
                .unwrap_or(value);
            cookies
                .entry(name.to_owned())
                .or_insert_with(|| value.to_owned());
        }
    }
    cookies
}

/// Checks whether the content type indicates form-encoded data
pub fn is_form_urlencoded(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|content_type| {
        content_type
            .get(..FORM_URLENCODED.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(FORM_URLENCODED))
    })
}

/// Determines the request content
///
/// A captured request body is used as is. Without it, form data of `POST` requests is
/// reconstructed from the parameters.
pub fn format_request_content(
    method: &str,
    content_type: Option<&str>,
    parameters: &OrderedMap<Vec<String>>,
    body: Option<&[u8]>,
) -> Option<String> {
    if let Some(body) = body {
        return Some(String::from_utf8_lossy(body).into_owned());
    }

    if method.eq_ignore_ascii_case("POST") && is_form_urlencoded(content_type) {
        let content = parameters
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |value| (name, value)))
            .map(|(name, value)| format!("{}={}", encode_component(name), encode_component(value)))
            .collect::<Vec<_>>()
            .join("&");
        return Some(content);
    }

    None
}

/// Determines the response content, image data is never logged
pub fn format_response_content(content_type: Option<&str>, body: Option<&[u8]>) -> Option<String> {
    if content_type.is_some_and(|content_type| content_type.starts_with("image/")) {
        return Some(IMAGE_CONTENTS_SUPPRESSED.to_owned());
    }
    body.map(|body| String::from_utf8_lossy(body).into_owned())
}

/// Time elapsed since `start`, `None` if `start` lies in the future
pub fn elapsed_since(start: SystemTime, now: SystemTime) -> Option<Duration> {
    now.duration_since(start).ok()
}

/// Name of the current thread, its identifier for unnamed threads
pub fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", thread.id()),
    }
}

/// Splits the value of a `Host` header into host name and port
pub fn host_and_port(host: &str) -> (&str, Option<u16>) {
    let port_separator = if host.starts_with('[') {
        // IPv6 address, the port can only follow the closing bracket
        host.rfind("]:").map(|index| index + 1)
    } else if host.matches(':').count() == 1 {
        host.find(':')
    } else {
        None
    };

    match port_separator {
        Some(index) => match host[index + 1..].parse() {
            Ok(port) => (&host[..index], Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    }
}

/// Default port for a URI scheme
pub fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[(&str, &str)]) -> OrderedMap<Vec<String>> {
        let mut parameters = OrderedMap::<Vec<String>>::new();
        for (name, value) in list {
            parameters
                .entry((*name).to_owned())
                .or_default()
                .push((*value).to_owned());
        }
        parameters
    }

    #[test]
    fn query_string() {
        assert_eq!(format_query_string(Some("a=1&b=2")), "?a=1&b=2");
        assert_eq!(format_query_string(Some("")), "?");
        assert_eq!(format_query_string(None), "");
        assert_eq!(
            format_request_url("GET", "/path", "?a=1", "HTTP/1.1"),
            "GET /path?a=1 HTTP/1.1"
        );
    }

    #[test]
    fn parameters() {
        let parsed = parse_query(Some("a=1&b=x+y&a=%C3%A4&flag&=z"));
        assert_eq!(
            parsed,
            params(&[("a", "1"), ("a", "ä"), ("b", "x y"), ("flag", ""), ("", "z")])
        );

        let mut parsed = parse_query(None);
        assert!(parsed.is_empty());
        extend_parameters(&mut parsed, "c=3");
        assert_eq!(parsed, params(&[("c", "3")]));

        let form = Some("application/x-www-form-urlencoded");
        assert_eq!(
            collect_parameters(Some("a=1"), form, Some(b"a=2&b=3")),
            params(&[("a", "1"), ("a", "2"), ("b", "3")])
        );
        assert_eq!(
            collect_parameters(Some("a=1"), Some("text/plain"), Some(b"a=2")),
            params(&[("a", "1")])
        );
        assert_eq!(collect_parameters(None, form, None), params(&[]));
    }

    #[test]
    fn cookies() {
        let cookies = parse_cookies(["a=1; B=2", "a=3; c=\"quoted\"; invalid; =x"]);
        assert_eq!(
            cookies
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect::<Vec<_>>(),
            [("a", "1"), ("B", "2"), ("c", "quoted")]
        );
        assert_eq!(cookies.get("b"), None);
    }

    #[test]
    fn request_content() {
        let parameters = params(&[("a", "1"), ("a", "x y"), ("b&c", "ä")]);
        assert_eq!(
            format_request_content(
                "POST",
                Some("application/x-www-form-urlencoded; charset=UTF-8"),
                &parameters,
                None
            )
            .as_deref(),
            Some("a=1&a=x+y&b%26c=%C3%A4")
        );
        assert_eq!(
            format_request_content("post", Some("text/plain"), &parameters, Some(b"raw"))
                .as_deref(),
            Some("raw")
        );
        assert_eq!(
            format_request_content(
                "GET",
                Some("application/x-www-form-urlencoded"),
                &parameters,
                None
            ),
            None
        );
        assert_eq!(
            format_request_content("POST", None, &parameters, None),
            None
        );
    }

    #[test]
    fn response_content() {
        assert_eq!(
            format_response_content(Some("image/png"), Some(b"\x89PNG")).as_deref(),
            Some(IMAGE_CONTENTS_SUPPRESSED)
        );
        assert_eq!(
            format_response_content(Some("image/gif"), None).as_deref(),
            Some(IMAGE_CONTENTS_SUPPRESSED)
        );
        assert_eq!(
            format_response_content(Some("text/plain"), Some(b"text")).as_deref(),
            Some("text")
        );
        assert_eq!(format_response_content(Some("text/plain"), None), None);
    }

    #[test]
    fn elapsed() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(
            elapsed_since(start, start + Duration::from_millis(1500)),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(elapsed_since(start + Duration::from_secs(1), start), None);
    }

    #[test]
    fn host_parsing() {
        assert_eq!(host_and_port("example.com"), ("example.com", None));
        assert_eq!(host_and_port("example.com:8080"), ("example.com", Some(8080)));
        assert_eq!(host_and_port("example.com:http"), ("example.com:http", None));
        assert_eq!(host_and_port("[::1]:443"), ("[::1]", Some(443)));
        assert_eq!(host_and_port("[::1]"), ("[::1]", None));
        assert_eq!(host_and_port("::1"), ("::1", None));
        assert_eq!(default_port("HTTPS"), 443);
        assert_eq!(default_port("http"), 80);
    }

    #[test]
    fn thread_name() {
        let name = std::thread::Builder::new()
            .name("worker-1".to_owned())
            .spawn(current_thread_name)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name, "worker-1");
    }
}
