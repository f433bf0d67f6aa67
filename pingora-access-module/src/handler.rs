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

//! Handler for Pingora’s `request_filter` and `logging` phases

use access_context::{AccessContext, AccessLogConf, AccessLogSettings};
use access_event::{LocalPortStrategy, RequestAttributes};
use http::Uri;
use log::debug;
use pingora::proxy::Session;
use pingora::{Error, ErrorType};
use std::sync::Arc;
use std::time::SystemTime;

use crate::source::PingoraAccessSource;

/// Per-request state of the access log
#[derive(Debug, Clone)]
pub struct AccessCtx {
    pub(crate) start: SystemTime,
    pub(crate) original_uri: Option<Uri>,
    pub(crate) remote_user: Option<String>,
    pub(crate) attributes: RequestAttributes,
}

impl Default for AccessCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessCtx {
    /// Creates the state of a request that starts now
    pub fn new() -> Self {
        Self {
            start: SystemTime::now(),
            original_uri: None,
            remote_user: None,
            attributes: RequestAttributes::new(),
        }
    }

    /// Time the request started
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Records the name of the authenticated user
    pub fn set_remote_user(&mut self, remote_user: impl Into<String>) {
        self.remote_user = Some(remote_user.into());
    }

    /// Attributes logged along with the request
    ///
    /// Request and response bodies can be logged by storing them as
    /// [`INPUT_BUFFER_ATTRIBUTE`](access_event::attributes::INPUT_BUFFER_ATTRIBUTE) and
    /// [`OUTPUT_BUFFER_ATTRIBUTE`](access_event::attributes::OUTPUT_BUFFER_ATTRIBUTE).
    pub fn attributes(&self) -> &RequestAttributes {
        &self.attributes
    }
}

/// Handler for Pingora’s `request_filter` and `logging` phases
///
/// The proxy implementation has to call [`AccessLogHandler::request_filter`] before the request
/// URI is modified and [`AccessLogHandler::logging`] from its own `logging` phase.
#[derive(Debug, Clone)]
pub struct AccessLogHandler {
    context: Arc<AccessContext>,
    local_port_strategy: LocalPortStrategy,
    request_attributes_enabled: Option<bool>,
}

impl AccessLogHandler {
    /// Creates a handler passing events to the context
    ///
    /// Forwarded values in the request attributes are used if `pingora.request_attributes_enabled`
    /// is `true`. If unset, they are used once a forwarded headers component marked the request.
    pub fn new(context: Arc<AccessContext>, conf: &AccessLogConf) -> Self {
        Self {
            context,
            local_port_strategy: conf.pingora.local_port_strategy(conf.local_port_strategy),
            request_attributes_enabled: conf.pingora.request_attributes_enabled,
        }
    }

    /// Sets up the access log as configured, `None` if it is disabled
    pub fn from_settings(settings: &AccessLogSettings) -> Result<Option<Self>, Box<Error>> {
        let context = AccessContext::from_settings(settings).map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                "failed setting up access log",
                err,
            )
        })?;
        Ok(context.map(|context| Self::new(Arc::new(context), &settings.access_log)))
    }

    /// The context receiving events
    pub fn context(&self) -> &Arc<AccessContext> {
        &self.context
    }

    /// Creates a new state object, see [`pingora::proxy::ProxyHttp::new_ctx`]
    pub fn new_ctx() -> AccessCtx {
        AccessCtx::new()
    }

    /// Records the original request URI, later phases might rewrite it
    pub fn request_filter(&self, session: &Session, ctx: &mut AccessCtx) {
        if ctx.original_uri.is_none() {
            ctx.original_uri = Some(session.req_header().uri.clone());
        }
    }

    /// Emits the access event of the request
    pub fn logging(&self, session: &Session, error: Option<&Error>, ctx: &AccessCtx) {
        let mut source = PingoraAccessSource::new(session, ctx, self.local_port_strategy)
            .with_request_attributes(self.request_attributes_enabled);
        if let Some(error) = error {
            debug!("Request finished with error: {error}");
            if let ErrorType::HTTPStatus(status) = error.etype() {
                source = source.with_fallback_status(*status);
            }
        }
        self.context.emit(&source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_context::capture::EventsCapture;
    use access_context::{Configurator, Environment, Resource, RuntimeConf};
    use access_event::attributes::{
        FORWARDED_MARKER_ATTRIBUTE, INPUT_BUFFER_ATTRIBUTE, PROTOCOL_ATTRIBUTE,
        REMOTE_ADDR_ATTRIBUTE, REMOTE_HOST_ATTRIBUTE, SERVER_NAME_ATTRIBUTE, SERVER_PORT_ATTRIBUTE,
    };
    use access_event::AccessEventSource;
    use pingora::http::ResponseHeader;
    use std::io::{Cursor, Seek, SeekFrom, Write};
    use test_log::test;

    const CAPTURE_CONFIG: Resource = Resource::Embedded {
        name: "capture.xml",
        content: r#"<configuration>
            <appender name="CAPTURE" class="CaptureAppender" />
            <appender-ref ref="CAPTURE" />
        </configuration>"#,
    };

    fn handler(conf: &AccessLogConf) -> (AccessLogHandler, EventsCapture) {
        let capture = EventsCapture::new();
        let configurator = Configurator::new(Environment::new())
            .with_appender("CaptureAppender", capture.factory());
        let context = AccessContext::from_resource(&CAPTURE_CONFIG, &configurator).unwrap();
        (AccessLogHandler::new(Arc::new(context), conf), capture)
    }

    async fn make_session(request: &str) -> Session {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let _ = cursor.write(request.as_bytes());
        let _ = cursor.seek(SeekFrom::Start(0));

        let mut session = Session::new_h1(Box::new(cursor));
        assert!(session.read_request().await.unwrap());
        session
    }

    #[test(tokio::test)]
    async fn request_fields() {
        let session = make_session(
            "GET /mock-controller/text?a=1&b=2 HTTP/1.1\r\n\
             Host: example.com:8080\r\n\
             X-Multi: v1\r\n\
             X-Multi: v2\r\n\
             X-Forwarded-For: 1.2.3.4\r\n\
             Cookie: theme=dark; theme=light\r\n\
             \r\n",
        )
        .await;
        let mut ctx = AccessLogHandler::new_ctx();
        ctx.set_remote_user("alice");
        ctx.attributes().set("tenant", "acme");
        ctx.attributes().set(INPUT_BUFFER_ATTRIBUTE, "ignored");

        let source = PingoraAccessSource::new(&session, &ctx, LocalPortStrategy::Server);
        assert_eq!(source.method(), "GET");
        assert_eq!(source.request_uri(), "/mock-controller/text");
        assert_eq!(source.query_string(), "?a=1&b=2");
        assert_eq!(
            source.request_url(),
            "GET /mock-controller/text?a=1&b=2 HTTP/1.1"
        );
        assert_eq!(source.protocol(), "HTTP/1.1");
        assert_eq!(source.server_name(), "example.com");
        assert_eq!(source.local_port(), 8080);
        assert_eq!(source.remote_addr(), "-");
        assert_eq!(source.remote_user(), Some("alice"));
        assert_eq!(source.request_header("x-multi"), "v1");
        assert_eq!(source.request_header("X-MULTI"), "v1");
        assert_eq!(source.request_header_values("X-Multi"), ["v1", "v2"]);
        assert_eq!(source.request_header("X-Missing"), "-");
        assert_eq!(source.cookie("theme"), "dark");
        assert_eq!(source.cookie("Theme"), "-");
        assert_eq!(source.request_parameter("a"), ["1"]);
        assert_eq!(source.request_parameter("c"), ["-"]);
        assert_eq!(source.attribute("tenant"), "acme");
        assert!(!source.attribute_map().contains_key(INPUT_BUFFER_ATTRIBUTE));
        assert_eq!(source.session_id(), None);
        assert_eq!(source.status_code(), 0);
        assert_eq!(source.content_length(), 0);

        let source = PingoraAccessSource::new(&session, &ctx, LocalPortStrategy::Local);
        assert_eq!(source.local_port(), 80);
    }

    #[test(tokio::test)]
    async fn original_uri_logged() {
        let (handler, capture) = handler(&AccessLogConf::default());
        let mut session =
            make_session("GET /original?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let mut ctx = AccessLogHandler::new_ctx();

        handler.request_filter(&session, &mut ctx);
        session
            .req_header_mut()
            .set_uri(Uri::from_static("/rewritten"));
        handler.request_filter(&session, &mut ctx);

        handler.logging(&session, None, &ctx);
        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_uri(), "/original");
        assert_eq!(events[0].query_string(), "?x=1");
    }

    #[test(tokio::test)]
    async fn logging_phase() {
        let (handler, capture) = handler(&AccessLogConf::default());
        let mut session = make_session("GET /page HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

        let t0 = SystemTime::now();
        let mut ctx = AccessLogHandler::new_ctx();
        handler.request_filter(&session, &mut ctx);

        let mut response = ResponseHeader::build(200, None).unwrap();
        response.insert_header("Content-Type", "text/plain").unwrap();
        session
            .as_downstream_mut()
            .write_response_header(Box::new(response))
            .await
            .unwrap();

        handler.logging(&session, None, &ctx);
        let t1 = SystemTime::now();

        let events = capture.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.status_code(), 200);
        assert_eq!(event.method(), "GET");
        assert_eq!(event.request_uri(), "/page");
        assert_eq!(event.response_header("content-type"), "text/plain");
        assert_eq!(event.content_length(), session.body_bytes_sent() as u64);

        let elapsed = event.elapsed_time().unwrap();
        assert!(elapsed <= t1.duration_since(t0).unwrap());
    }

    #[test(tokio::test)]
    async fn error_status() {
        let (handler, capture) = handler(&AccessLogConf::default());
        let session = make_session("GET / HTTP/1.1\r\n\r\n").await;
        let ctx = AccessLogHandler::new_ctx();

        let error = Error::new(ErrorType::HTTPStatus(502));
        handler.logging(&session, Some(&*error), &ctx);
        let error = Error::new(ErrorType::ConnectTimedout);
        handler.logging(&session, Some(&*error), &ctx);

        let statuses: Vec<_> = capture
            .events()
            .iter()
            .map(AccessEventSource::status_code)
            .collect();
        assert_eq!(statuses, [502, 0]);
    }

    fn forwarded_ctx(marked: bool) -> AccessCtx {
        let ctx = AccessLogHandler::new_ctx();
        let attributes = ctx.attributes();
        attributes.set(REMOTE_ADDR_ATTRIBUTE, "1.2.3.4");
        attributes.set(REMOTE_HOST_ATTRIBUTE, "client.example.net");
        attributes.set(PROTOCOL_ATTRIBUTE, "HTTP/2.0");
        attributes.set(SERVER_NAME_ATTRIBUTE, "www.example.com");
        attributes.set(SERVER_PORT_ATTRIBUTE, "443");
        if marked {
            attributes.set(FORWARDED_MARKER_ATTRIBUTE, "true");
        }
        ctx
    }

    fn pingora_conf(request_attributes_enabled: Option<bool>) -> AccessLogConf {
        AccessLogConf {
            pingora: RuntimeConf {
                request_attributes_enabled,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test(tokio::test)]
    async fn forwarded_attributes() {
        let session = make_session("GET / HTTP/1.1\r\nHost: backend:8080\r\n\r\n").await;
        let cases = [
            (None, false, false),
            (None, true, true),
            (Some(false), true, false),
            (Some(true), false, true),
        ];
        for (enabled, marked, trusted) in cases {
            let (handler, capture) = handler(&pingora_conf(enabled));
            handler.logging(&session, None, &forwarded_ctx(marked));

            let event = &capture.events()[0];
            if trusted {
                assert_eq!(event.remote_addr(), "1.2.3.4", "{enabled:?} {marked}");
                assert_eq!(event.remote_host(), "client.example.net");
                assert_eq!(event.protocol(), "HTTP/2.0");
                assert_eq!(event.server_name(), "www.example.com");
                assert_eq!(event.local_port(), 443);
            } else {
                assert_eq!(event.remote_addr(), "-", "{enabled:?} {marked}");
                assert_eq!(event.remote_host(), "-");
                assert_eq!(event.protocol(), "HTTP/1.1");
                assert_eq!(event.server_name(), "backend");
                assert_eq!(event.local_port(), 8080);
            }
        }
    }

    #[test(tokio::test)]
    async fn frozen_event_detached() {
        let mut session = make_session("GET /page HTTP/1.1\r\nX-Foo: bar\r\n\r\n").await;
        let ctx = AccessLogHandler::new_ctx();

        let event = PingoraAccessSource::new(&session, &ctx, LocalPortStrategy::Server).fix();
        assert_eq!(event.fix(), event);

        session
            .req_header_mut()
            .insert_header("X-Foo", "changed")
            .unwrap();
        session
            .req_header_mut()
            .set_uri(Uri::from_static("/changed"));
        ctx.attributes().set("late", "value");

        assert_eq!(event.request_header("x-foo"), "bar");
        assert_eq!(event.request_uri(), "/page");
        assert_eq!(event.attribute("late"), "-");
    }

    #[test]
    fn settings() {
        let mut settings = AccessLogSettings::default();
        settings.access_log.enabled = false;
        assert!(AccessLogHandler::from_settings(&settings).unwrap().is_none());

        settings.access_log.enabled = true;
        settings.access_log.config = Some("missing-access-log-config.xml".to_owned());
        assert!(AccessLogHandler::from_settings(&settings).is_err());
    }
}
