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

//! Middleware emitting an access event once the response body has been sent

use access_context::{AccessContext, AccessLogConf};
use access_event::{LocalPortStrategy, RequestAttributes};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::{Error, HttpMessage};
use bytes::Bytes;
use futures::future::{ok, LocalBoxFuture, Ready};
use log::debug;
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::SystemTime;

use crate::source::{ActixAccessSource, Exchange, Identity, RequestHead};

/// Retrieves the attribute store of the request, adding one if necessary
///
/// Handlers can use this to add attributes to the access event. Request and response bodies are
/// logged if stored as
/// [`INPUT_BUFFER_ATTRIBUTE`](access_event::attributes::INPUT_BUFFER_ATTRIBUTE) and
/// [`OUTPUT_BUFFER_ATTRIBUTE`](access_event::attributes::OUTPUT_BUFFER_ATTRIBUTE).
pub fn request_attributes(request: &impl HttpMessage) -> RequestAttributes {
    if let Some(attributes) = request.extensions().get::<RequestAttributes>() {
        return attributes.clone();
    }
    let attributes = RequestAttributes::new();
    request.extensions_mut().insert(attributes.clone());
    attributes
}

#[derive(Debug)]
struct Settings {
    context: Arc<AccessContext>,
    local_port_strategy: LocalPortStrategy,
    trusted: bool,
}

/// Middleware passing an access event for each request to the access context
///
/// This should be registered last via `App::wrap`, making it the outermost middleware.
#[derive(Debug, Clone)]
pub struct AccessLog {
    settings: Arc<Settings>,
}

impl AccessLog {
    /// Creates a middleware with default settings
    pub fn new(context: Arc<AccessContext>) -> Self {
        Self::from_conf(context, &AccessLogConf::default())
    }

    /// Creates a middleware using the `actix` runtime settings
    ///
    /// Forwarded headers are only considered if `request_attributes_enabled` is `true`.
    pub fn from_conf(context: Arc<AccessContext>, conf: &AccessLogConf) -> Self {
        Self {
            settings: Arc::new(Settings {
                context,
                local_port_strategy: conf.actix.local_port_strategy(conf.local_port_strategy),
                trusted: conf.actix.request_attributes_enabled.unwrap_or(false),
            }),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AccessLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<AccessLogBody<B>>;
    type Error = Error;
    type Transform = AccessLogMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AccessLogMiddleware {
            service,
            settings: self.settings.clone(),
        })
    }
}

/// Service produced by [`AccessLog`]
#[derive(Debug)]
pub struct AccessLogMiddleware<S> {
    service: S,
    settings: Arc<Settings>,
}

impl<S, B> Service<ServiceRequest> for AccessLogMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<AccessLogBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, request: ServiceRequest) -> Self::Future {
        let start = SystemTime::now();
        let attributes = request_attributes(&request);
        let head = RequestHead::new(request.request(), self.settings.trusted);
        let settings = self.settings.clone();
        let future = self.service.call(request);

        Box::pin(async move {
            match future.await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let response_headers = response.headers().clone();
                    let identity = Identity::new(response.request());
                    let pending = Pending {
                        settings,
                        exchange: Exchange {
                            head,
                            identity,
                            start,
                            attributes,
                            status,
                            response_headers,
                            bytes_sent: 0,
                        },
                    };
                    Ok(response.map_body(move |_, body| AccessLogBody::new(body, pending)))
                }
                Err(err) => {
                    debug!("Request {} failed: {err}", head.path());
                    let status = err.as_response_error().status_code().as_u16();
                    Pending {
                        settings,
                        exchange: Exchange {
                            head,
                            identity: Identity::default(),
                            start,
                            attributes,
                            status,
                            response_headers: HeaderMap::new(),
                            bytes_sent: 0,
                        },
                    }
                    .emit();
                    Err(err)
                }
            }
        })
    }
}

#[derive(Debug)]
struct Pending {
    settings: Arc<Settings>,
    exchange: Exchange,
}

impl Pending {
    fn emit(self) {
        let source = ActixAccessSource::new(&self.exchange, self.settings.local_port_strategy);
        self.settings.context.emit(&source);
    }
}

/// Response body counting the bytes sent, emits the access event when done
///
/// The event is emitted once the body stream ends or the body is dropped, whichever happens
/// first.
pub struct AccessLogBody<B> {
    body: Pin<Box<B>>,
    pending: Option<Pending>,
}

impl<B> Debug for AccessLogBody<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLogBody")
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl<B> AccessLogBody<B> {
    fn new(body: B, pending: Pending) -> Self {
        Self {
            body: Box::pin(body),
            pending: Some(pending),
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.emit();
        }
    }
}

impl<B: MessageBody> MessageBody for AccessLogBody<B> {
    type Error = B::Error;

    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = &mut *self;
        let result = ready!(this.body.as_mut().poll_next(cx));
        match &result {
            Some(Ok(chunk)) => {
                if let Some(pending) = &mut this.pending {
                    pending.exchange.bytes_sent += chunk.len() as u64;
                }
            }
            Some(Err(_)) | None => this.finish(),
        }
        Poll::Ready(result)
    }
}

impl<B> Drop for AccessLogBody<B> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_context::capture::EventsCapture;
    use access_context::{Configurator, Environment, Resource, RuntimeConf};
    use access_event::attributes::REMOTE_USER_ATTRIBUTE;
    use access_event::{AccessEventSource, RemoteUser, SessionId};
    use actix_web::error::ErrorServiceUnavailable;
    use actix_web::http::header;
    use actix_web::test::{call_and_read_body, call_service, init_service, TestRequest};
    use actix_web::{web, App, HttpRequest};
    use test_log::test;

    const MOCK_TEXT: &str = "Hello from the mock controller";

    const CAPTURE_CONFIG: Resource = Resource::Embedded {
        name: "capture.xml",
        content: r#"<configuration>
            <appender name="CAPTURE" class="CaptureAppender" />
            <appender-ref ref="CAPTURE" />
        </configuration>"#,
    };

    fn capture_context() -> (Arc<AccessContext>, EventsCapture) {
        let capture = EventsCapture::new();
        let configurator = Configurator::new(Environment::new())
            .with_appender("CaptureAppender", capture.factory());
        let context = AccessContext::from_resource(&CAPTURE_CONFIG, &configurator).unwrap();
        (Arc::new(context), capture)
    }

    async fn text() -> &'static str {
        MOCK_TEXT
    }

    async fn secured(request: HttpRequest) -> &'static str {
        request
            .extensions_mut()
            .insert(SessionId("abc123".to_owned()));
        request
            .extensions_mut()
            .insert(RemoteUser("alice".to_owned()));
        let attributes = request_attributes(&request);
        attributes.set(REMOTE_USER_ATTRIBUTE, "bob");
        attributes.set("tenant", "acme");
        "secret"
    }

    fn text_request() -> TestRequest {
        TestRequest::get()
            .uri("/mock-controller/text?lang=en")
            .insert_header((header::HOST, "localhost:8081"))
            .peer_addr("127.0.0.1:54321".parse().unwrap())
    }

    fn forwarded_request() -> TestRequest {
        TestRequest::get()
            .uri("/mock-controller/text")
            .insert_header((header::HOST, "backend:8081"))
            .insert_header(("X-Forwarded-For", "1.2.3.4, 10.0.0.2"))
            .insert_header(("X-Forwarded-Host", "www.example.com"))
            .insert_header(("X-Forwarded-Proto", "https"))
            .peer_addr("10.0.0.1:40000".parse().unwrap())
    }

    #[test(actix_web::test)]
    async fn mock_controller_text() {
        let (context, capture) = capture_context();
        let app = init_service(
            App::new()
                .wrap(AccessLog::new(context))
                .route("/mock-controller/text", web::get().to(text)),
        )
        .await;

        let t0 = SystemTime::now();
        let body = call_and_read_body(&app, text_request().to_request()).await;
        let t1 = SystemTime::now();
        assert_eq!(body, MOCK_TEXT);

        let events = capture.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.method(), "GET");
        assert_eq!(event.request_uri(), "/mock-controller/text");
        assert_eq!(event.query_string(), "?lang=en");
        assert_eq!(event.protocol(), "HTTP/1.1");
        assert_eq!(event.request_parameter("lang"), ["en"]);
        assert_eq!(event.status_code(), 200);
        assert_eq!(event.content_length(), MOCK_TEXT.len() as u64);
        assert_eq!(
            event.response_header("Content-Type"),
            "text/plain; charset=utf-8"
        );
        assert_eq!(event.server_name(), "localhost");
        assert_eq!(event.local_port(), 8081);
        assert_eq!(event.remote_addr(), "127.0.0.1");
        assert_eq!(event.remote_host(), "127.0.0.1");
        assert_eq!(event.remote_user(), None);
        assert_eq!(event.session_id(), None);

        assert!(event.timestamp() >= t0 && event.timestamp() <= t1);
        let elapsed = event.elapsed_time().unwrap();
        assert!(elapsed <= t1.duration_since(t0).unwrap());
    }

    async fn user(id: web::Path<String>) -> String {
        format!("user {id}")
    }

    #[test(actix_web::test)]
    async fn path_parameters() {
        let (context, capture) = capture_context();
        let app = init_service(
            App::new().wrap(AccessLog::new(context)).service(
                web::scope("/api").service(web::resource("/users/{id}").route(web::get().to(user))),
            ),
        )
        .await;

        let request = TestRequest::get()
            .uri("/api/users/42?verbose=1")
            .peer_addr("127.0.0.1:54321".parse().unwrap())
            .to_request();
        assert_eq!(call_and_read_body(&app, request).await, "user 42");

        let request = TestRequest::get().uri("/api/missing").to_request();
        assert_eq!(call_service(&app, request).await.status(), 404);

        let events = capture.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].request_uri(), "/api/users/42");
        assert_eq!(events[0].query_string(), "?verbose=1");
        assert_eq!(events[0].status_code(), 200);
        assert_eq!(events[0].content_length(), 7);
        assert_eq!(events[0].remote_addr(), "127.0.0.1");
        assert_eq!(events[1].request_uri(), "/api/missing");
        assert_eq!(events[1].status_code(), 404);
    }

    #[test(actix_web::test)]
    async fn local_port_strategy() {
        let (context, capture) = capture_context();
        let conf = AccessLogConf {
            actix: RuntimeConf {
                local_port_strategy: Some(LocalPortStrategy::Local),
                ..Default::default()
            },
            ..Default::default()
        };
        let app = init_service(
            App::new()
                .wrap(AccessLog::from_conf(context, &conf))
                .route("/mock-controller/text", web::get().to(text)),
        )
        .await;

        call_and_read_body(&app, text_request().to_request()).await;
        assert_eq!(capture.events()[0].local_port(), 8080);
    }

    #[test(actix_web::test)]
    async fn forwarded_headers() {
        let (context, capture) = capture_context();
        let conf = AccessLogConf {
            actix: RuntimeConf {
                request_attributes_enabled: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let trusting = init_service(
            App::new()
                .wrap(AccessLog::from_conf(context.clone(), &conf))
                .route("/mock-controller/text", web::get().to(text)),
        )
        .await;
        let untrusting = init_service(
            App::new()
                .wrap(AccessLog::new(context))
                .route("/mock-controller/text", web::get().to(text)),
        )
        .await;

        call_and_read_body(&trusting, forwarded_request().to_request()).await;
        call_and_read_body(&untrusting, forwarded_request().to_request()).await;

        let events = capture.events();
        assert_eq!(events[0].remote_addr(), "1.2.3.4");
        assert_eq!(events[0].server_name(), "www.example.com");
        assert_eq!(events[0].local_port(), 443);

        assert_eq!(events[1].remote_addr(), "10.0.0.1");
        assert_eq!(events[1].server_name(), "backend");
        assert_eq!(events[1].local_port(), 8081);
    }

    #[test(actix_web::test)]
    async fn session_and_user() {
        let (context, capture) = capture_context();
        let app = init_service(
            App::new()
                .wrap(AccessLog::new(context))
                .route("/secured", web::get().to(secured)),
        )
        .await;

        let request = TestRequest::get().uri("/secured").to_request();
        assert_eq!(call_and_read_body(&app, request).await, "secret");

        let event = &capture.events()[0];
        assert_eq!(event.session_id(), Some("abc123"));
        assert_eq!(event.remote_user(), Some("alice"));
        assert_eq!(event.attribute("tenant"), "acme");
    }

    #[test(actix_web::test)]
    async fn emitted_on_drop() {
        let (context, capture) = capture_context();
        let app = init_service(
            App::new()
                .wrap(AccessLog::new(context))
                .route("/mock-controller/text", web::get().to(text)),
        )
        .await;

        let response = call_service(&app, text_request().to_request()).await;
        assert_eq!(response.status(), 200);
        assert!(capture.is_empty());

        drop(response);
        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code(), 200);
        assert_eq!(events[0].content_length(), 0);
    }

    #[test(actix_web::test)]
    async fn service_errors() {
        let (context, capture) = capture_context();
        let app = init_service(
            App::new()
                .wrap_fn(|_request, _service| async {
                    Err::<ServiceResponse, _>(ErrorServiceUnavailable("backend unavailable"))
                })
                .wrap(AccessLog::new(context))
                .route("/mock-controller/text", web::get().to(text)),
        )
        .await;

        let result = app.call(text_request().to_request()).await;
        assert!(result.is_err());

        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code(), 503);
        assert_eq!(events[0].content_length(), 0);
    }
}
