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

//! Conversion of events into log lines
//!
//! Patterns consist of literal text and conversion words starting with `%`. Some words take an
//! argument in braces, e.g. `%i{User-Agent}`. Supported words:
//!
//! | Word | Long form | Value |
//! |---|---|---|
//! | `%h` | `%clientHost`, `%remoteHost` | client host name |
//! | `%a` | `%remoteIP` | client IP address |
//! | `%l` | | always `-` |
//! | `%u` | `%user` | authenticated user |
//! | `%t` | `%date` | capture time, an optional argument is a `chrono` format string |
//! | `%r` | `%requestURL` | request line |
//! | `%s` | `%statusCode` | response status code |
//! | `%b` | `%bytesSent` | response bytes sent |
//! | `%D` | `%elapsedTime` | elapsed milliseconds |
//! | `%T` | `%elapsedSeconds` | elapsed seconds |
//! | `%I` | `%threadName` | capturing thread |
//! | `%v` | `%server` | server name |
//! | `%p` | `%localPort` | local port |
//! | `%m` | `%requestMethod` | request method |
//! | `%U` | `%requestURI` | request path |
//! | `%q` | `%queryString` | query string |
//! | `%H` | `%protocol` | protocol |
//! | `%i{name}` | `%header{name}` | request header |
//! | `%o{name}` | `%responseHeader{name}` | response header |
//! | `%c{name}` | `%requestCookie{name}` | cookie |
//! | | `%reqAttribute{name}` | request attribute |
//! | | `%reqParameter{name}` | request parameter values, comma-separated |
//! | | `%sessionID` | session identifier |
//! | | `%requestContent` | request body |
//! | | `%responseContent` | response body |
//! | `%n` | | line break |
//! | `%%` | | literal `%` |
//!
//! The whole pattern can also be one of the names `common` (alias `clf`) or `combined`. Every
//! encoded event ends with a line break.

use access_event::{AccessEventSource, NA};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, Local};
use std::io::Write;

use crate::configurator::Element;
use crate::Error;

/// Common Log Format
pub const COMMON_PATTERN: &str = "%h %l %u [%t] \"%r\" %s %b";

/// Combined Log Format
pub const COMBINED_PATTERN: &str = "%h %l %u [%t] \"%r\" %s %b \"%i{Referer}\" \"%i{User-Agent}\"";

const DEFAULT_DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    RemoteHost,
    RemoteAddr,
    RemoteUser,
    Date(String),
    RequestUrl,
    StatusCode,
    BytesSent,
    ElapsedMillis,
    ElapsedSeconds,
    ThreadName,
    ServerName,
    LocalPort,
    Method,
    RequestUri,
    QueryString,
    Protocol,
    RequestHeader(String),
    ResponseHeader(String),
    Cookie(String),
    Attribute(String),
    Parameter(String),
    SessionId,
    RequestContent,
    ResponseContent,
    NewLine,
}

impl Token {
    fn from_word(word: &str, argument: Option<String>) -> Result<Self, Error> {
        let required = |argument: Option<String>| {
            argument.ok_or_else(|| {
                Error::invalid(format!("conversion word %{word} requires an argument"))
            })
        };

        Ok(match word {
            "h" | "clientHost" | "remoteHost" => Self::RemoteHost,
            "a" | "remoteIP" => Self::RemoteAddr,
            "l" => Self::Literal(NA.to_owned()),
            "u" | "user" => Self::RemoteUser,
            "t" | "date" => {
                let format = argument.unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_owned());
                if StrftimeItems::new(&format).any(|item| item == Item::Error) {
                    return Err(Error::invalid(format!("invalid date format {format:?}")));
                }
                Self::Date(format)
            }
            "r" | "requestURL" => Self::RequestUrl,
            "s" | "statusCode" => Self::StatusCode,
            "b" | "bytesSent" => Self::BytesSent,
            "D" | "elapsedTime" => Self::ElapsedMillis,
            "T" | "elapsedSeconds" => Self::ElapsedSeconds,
            "I" | "threadName" => Self::ThreadName,
            "v" | "server" => Self::ServerName,
            "p" | "localPort" => Self::LocalPort,
            "m" | "requestMethod" => Self::Method,
            "U" | "requestURI" => Self::RequestUri,
            "q" | "queryString" => Self::QueryString,
            "H" | "protocol" => Self::Protocol,
            "i" | "header" => Self::RequestHeader(required(argument)?),
            "o" | "responseHeader" => Self::ResponseHeader(required(argument)?),
            "c" | "requestCookie" => Self::Cookie(required(argument)?),
            "reqAttribute" => Self::Attribute(required(argument)?),
            "reqParameter" => Self::Parameter(required(argument)?),
            "sessionID" => Self::SessionId,
            "requestContent" => Self::RequestContent,
            "responseContent" => Self::ResponseContent,
            "n" => Self::NewLine,
            word => return Err(Error::invalid(format!("unknown conversion word %{word}"))),
        })
    }
}

fn parse(pattern: &str) -> Result<Vec<Token>, Error> {
    let pattern = match pattern.trim() {
        "common" | "clf" => COMMON_PATTERN,
        "combined" => COMBINED_PATTERN,
        _ => pattern,
    };

    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }

        if chars.peek() == Some(&'%') {
            chars.next();
            literal.push('%');
            continue;
        }

        let mut word = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphabetic()) {
            word.push(c);
        }
        if word.is_empty() {
            return Err(Error::invalid(format!(
                "incomplete conversion word in pattern {pattern:?}"
            )));
        }

        let argument = if chars.next_if_eq(&'{').is_some() {
            let mut argument = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => argument.push(c),
                    None => {
                        return Err(Error::invalid(format!(
                            "unterminated argument in pattern {pattern:?}"
                        )))
                    }
                }
            }
            Some(argument)
        } else {
            None
        };

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(Token::from_word(&word, argument)?);
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    if tokens.last() != Some(&Token::NewLine) {
        tokens.push(Token::NewLine);
    }
    Ok(tokens)
}

fn write_escaped(buf: &mut Vec<u8>, data: impl AsRef<[u8]>) -> Result<(), std::io::Error> {
    fn is_allowed(byte: u8) -> bool {
        (b' '..=b'~').contains(&byte) && byte != b'"' && byte != b'\\'
    }

    for byte in data.as_ref() {
        if is_allowed(*byte) {
            buf.push(*byte);
        } else {
            write!(buf, "\\x{byte:02x}")?;
        }
    }

    Ok(())
}

/// Encoder turning events into log lines according to a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEncoder {
    tokens: Vec<Token>,
    offset: Option<FixedOffset>,
}

impl PatternEncoder {
    /// Compiles a pattern
    pub fn new(pattern: &str) -> Result<Self, Error> {
        Ok(Self {
            tokens: parse(pattern)?,
            offset: None,
        })
    }

    /// Renders `%t` with a fixed UTC offset rather than the local time zone
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Compiles the pattern configured for an appender
    ///
    /// This is taken from `<encoder><pattern>` or `<pattern>` and defaults to `common`.
    pub fn from_element(element: &Element) -> Result<Self, Error> {
        let pattern = element
            .child("encoder")
            .map(|encoder| encoder.child_text("pattern").unwrap_or(encoder.text()))
            .or_else(|| element.child_text("pattern"))
            .filter(|pattern| !pattern.is_empty())
            .unwrap_or("common");
        Self::new(pattern)
    }

    /// Appends the representation of an event to the buffer
    ///
    /// Values originating from the request or response are escaped: quotation marks, backslashes
    /// and anything outside the printable ASCII range are written as `\xNN`.
    pub fn encode(&self, event: &dyn AccessEventSource, buf: &mut Vec<u8>) {
        for token in &self.tokens {
            let _ = match token {
                Token::Literal(text) => buf.write_all(text.as_bytes()),
                Token::RemoteHost => write_escaped(buf, event.remote_host()),
                Token::RemoteAddr => write_escaped(buf, event.remote_addr()),
                Token::RemoteUser => write_escaped(buf, event.remote_user_or_sentinel()),
                Token::Date(format) => match self.offset {
                    Some(offset) => {
                        let time = DateTime::<Local>::from(event.timestamp())
                            .with_timezone(&offset)
                            .format(format);
                        write!(buf, "{time}")
                    }
                    None => {
                        let time = DateTime::<Local>::from(event.timestamp()).format(format);
                        write!(buf, "{time}")
                    }
                },
                Token::RequestUrl => write_escaped(buf, event.request_url()),
                Token::StatusCode => write!(buf, "{}", event.status_code()),
                Token::BytesSent => write!(buf, "{}", event.content_length()),
                Token::ElapsedMillis => write!(buf, "{}", event.elapsed_millis()),
                Token::ElapsedSeconds => write!(buf, "{}", event.elapsed_seconds()),
                Token::ThreadName => write_escaped(buf, event.thread_name()),
                Token::ServerName => write_escaped(buf, event.server_name()),
                Token::LocalPort => write!(buf, "{}", event.local_port()),
                Token::Method => write_escaped(buf, event.method()),
                Token::RequestUri => write_escaped(buf, event.request_uri()),
                Token::QueryString => write_escaped(buf, event.query_string()),
                Token::Protocol => write_escaped(buf, event.protocol()),
                Token::RequestHeader(name) => write_escaped(buf, event.request_header(name)),
                Token::ResponseHeader(name) => write_escaped(buf, event.response_header(name)),
                Token::Cookie(name) => write_escaped(buf, event.cookie(name)),
                Token::Attribute(name) => write_escaped(buf, event.attribute(name)),
                Token::Parameter(name) => {
                    write_escaped(buf, event.request_parameter(name).join(","))
                }
                Token::SessionId => write_escaped(buf, event.session_id_or_sentinel()),
                Token::RequestContent => {
                    write_escaped(buf, event.request_content().unwrap_or(NA))
                }
                Token::ResponseContent => {
                    write_escaped(buf, event.response_content().unwrap_or(NA))
                }
                Token::NewLine => writeln!(buf),
            };
        }
    }

    /// Produces the representation of an event as a string
    pub fn encode_to_string(&self, event: &dyn AccessEventSource) -> String {
        let mut buf = Vec::new();
        self.encode(event, &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_event::AccessEvent;
    use std::time::{Duration, SystemTime};

    #[test]
    fn escaping() {
        let mut buf = Vec::<u8>::new();
        let _ = write_escaped(&mut buf, b"abcd");
        assert_eq!(&buf, b"abcd");

        buf.truncate(0);
        let _ = write_escaped(&mut buf, b"\0ab\"\\+-=! cd");
        assert_eq!(&buf, b"\\x00ab\\x22\\x5c+-=! cd");

        buf.truncate(0);
        let _ = write_escaped(&mut buf, b"ab~\x7f\x80\xfe\xffcd");
        assert_eq!(&buf, b"ab~\\x7f\\x80\\xfe\\xffcd");
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!(
            parse("%h 100%% %i{X-Test}").unwrap(),
            vec![
                Token::RemoteHost,
                Token::Literal(" 100% ".to_owned()),
                Token::RequestHeader("X-Test".to_owned()),
                Token::NewLine,
            ]
        );
        assert_eq!(parse("combined").unwrap(), parse(COMBINED_PATTERN).unwrap());
        assert_eq!(parse("clf").unwrap(), parse(COMMON_PATTERN).unwrap());
        assert_eq!(parse("%s%n").unwrap(), vec![Token::StatusCode, Token::NewLine]);

        assert!(parse("%unknown").is_err());
        assert!(parse("%i").is_err());
        assert!(parse("%i{X-Test").is_err());
        assert!(parse("100%").is_err());
        assert!(parse("%t{%Q}").is_err());
        assert_eq!(
            parse("%t{%Y}").unwrap(),
            vec![Token::Date("%Y".to_owned()), Token::NewLine]
        );
    }

    #[test]
    fn common_format() {
        // 2024-05-29 10:53:19 UTC
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1716979999);
        let event = AccessEvent::builder()
            .timestamp(time)
            .remote_addr("127.0.0.1")
            .method("GET")
            .request_uri("/test\n/\"")
            .status_code(200)
            .content_length(876)
            .request_header("Referer", "https://example.com/")
            .request_header("User-Agent", "Mozilla/1.0 \\\"invalid data\u{e4}")
            .build();

        let offset = FixedOffset::west_opt(3600).unwrap();
        let encoder = PatternEncoder::new("combined").unwrap().with_offset(offset);
        assert_eq!(
            encoder.encode_to_string(&event),
            "127.0.0.1 - - [29/May/2024:09:53:19 -0100] \"GET /test\\x0a/\\x22 HTTP/1.1\" 200 876 \"https://example.com/\" \"Mozilla/1.0 \\x5c\\x22invalid data\\xc3\\xa4\"\n"
        );
    }

    #[test]
    fn extended_words() {
        let event = AccessEvent::builder()
            .remote_user("alice")
            .query("a=1&a=2")
            .cookie("theme", "dark")
            .attribute("tenant", "acme")
            .session_id("s1")
            .response_header("Content-Type", "text/plain")
            .response_content("Hello")
            .elapsed_time(Duration::from_millis(1500))
            .local_port(8080)
            .server_name("example.com")
            .thread_name("worker-1")
            .build();

        let encoder = PatternEncoder::new(
            "%u|%q|%c{theme}|%reqAttribute{tenant}|%reqParameter{a}|%sessionID|%o{content-type}|%responseContent|%requestContent|%D|%T|%p|%v|%I|%m|%U|%H",
        )
        .unwrap();
        assert_eq!(
            encoder.encode_to_string(&event),
            "alice|?a=1&a=2|dark|acme|1,2|s1|text/plain|Hello|-|1500|1|8080|example.com|worker-1|GET|/|HTTP/1.1\n"
        );
    }

    #[test]
    fn encoder_from_element() {
        let element = Element::new("appender").with_child(
            Element::new("encoder").with_child(Element::new("pattern").with_text("%s")),
        );
        assert_eq!(
            PatternEncoder::from_element(&element).unwrap(),
            PatternEncoder::new("%s").unwrap()
        );
        assert_eq!(
            PatternEncoder::from_element(&Element::new("appender")).unwrap(),
            PatternEncoder::new("common").unwrap()
        );
    }
}
