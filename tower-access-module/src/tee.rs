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

//! Layer capturing request and response bodies for the access log

use access_context::TeeFilterConf;
use access_event::attributes::{INPUT_BUFFER_ATTRIBUTE, OUTPUT_BUFFER_ATTRIBUTE};
use access_event::support::host_and_port;
use access_event::RequestAttributes;
use bytes::{Bytes, BytesMut};
use glob::{MatchOptions, Pattern, PatternError};
use http::{header, Request, Response};
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, Either, Full};
use log::{trace, warn};
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tower::{Layer, Service};

use crate::layer::request_attributes;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug)]
struct HostPatterns {
    enabled: bool,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

/// Stores request and response bodies in the request attributes
///
/// Request bodies are read completely before the request is passed on. Response bodies are
/// copied while they are being sent.
#[derive(Debug, Clone)]
pub struct TeeLayer {
    hosts: Arc<HostPatterns>,
}

impl Default for TeeLayer {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, PatternError> {
    patterns.iter().map(|pattern| Pattern::new(pattern)).collect()
}

impl TeeLayer {
    /// Creates a layer capturing bodies for all hosts
    pub fn new() -> Self {
        Self {
            hosts: Arc::new(HostPatterns {
                enabled: true,
                includes: Vec::new(),
                excludes: Vec::new(),
            }),
        }
    }

    /// Creates a layer from the `tee_filter` settings, fails on invalid host patterns
    pub fn from_conf(conf: &TeeFilterConf) -> Result<Self, PatternError> {
        Ok(Self {
            hosts: Arc::new(HostPatterns {
                enabled: conf.enabled,
                includes: compile(&conf.includes)?,
                excludes: compile(&conf.excludes)?,
            }),
        })
    }

    /// Checks whether bodies are captured for requests to the given host
    pub fn is_active(&self, host: &str) -> bool {
        let hosts = &self.hosts;
        hosts.enabled
            && (hosts.includes.is_empty()
                || hosts
                    .includes
                    .iter()
                    .any(|pattern| pattern.matches_with(host, MATCH_OPTIONS)))
            && !hosts
                .excludes
                .iter()
                .any(|pattern| pattern.matches_with(host, MATCH_OPTIONS))
    }
}

impl<S> Layer<S> for TeeLayer {
    type Service = TeeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TeeService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`TeeLayer`]
#[derive(Debug, Clone)]
pub struct TeeService<S> {
    inner: S,
    layer: TeeLayer,
}

fn host_name<B>(request: &Request<B>) -> &str {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host_and_port(host).0)
        .or_else(|| request.uri().host())
        .unwrap_or_default()
}

/// Request body passed on by [`TeeService`], the captured copy if the body was read
pub type TeeRequestBody<B> = Either<Full<Bytes>, B>;

impl<S, B, ResBody> Service<Request<B>> for TeeService<S>
where
    S: Service<Request<TeeRequestBody<B>>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display,
    ResBody: Body<Data = Bytes> + 'static,
{
    type Response = Response<TeeBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let attributes = if self.layer.is_active(host_name(&request)) {
            Some(request_attributes(&mut request))
        } else {
            None
        };

        Box::pin(async move {
            let request = match &attributes {
                Some(attributes) => {
                    let (parts, body) = request.into_parts();
                    let body = match body.collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(err) => {
                            warn!("Failed reading request body of {}: {err}", parts.uri);
                            Bytes::new()
                        }
                    };
                    trace!("Captured {} bytes of request body", body.len());
                    attributes.set(INPUT_BUFFER_ATTRIBUTE, body.clone());
                    Request::from_parts(parts, Either::Left(Full::new(body)))
                }
                None => request.map(Either::Right),
            };

            let response = inner.call(request).await?;
            Ok(response.map(|body| TeeBody::new(body, attributes)))
        })
    }
}

/// Response body copying the data into the request attributes
///
/// The copy is stored once the last frame passes through.
pub struct TeeBody<B> {
    inner: Pin<Box<B>>,
    capture: Option<(RequestAttributes, BytesMut)>,
}

impl<B> Debug for TeeBody<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeBody")
            .field("capturing", &self.capture.is_some())
            .finish_non_exhaustive()
    }
}

impl<B> TeeBody<B> {
    fn new(inner: B, attributes: Option<RequestAttributes>) -> Self {
        Self {
            inner: Box::pin(inner),
            capture: attributes.map(|attributes| (attributes, BytesMut::new())),
        }
    }

    fn store(&mut self) {
        if let Some((attributes, buffer)) = self.capture.take() {
            trace!("Captured {} bytes of response body", buffer.len());
            attributes.set(OUTPUT_BUFFER_ATTRIBUTE, buffer.freeze());
        }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let result = ready!(this.inner.as_mut().poll_frame(cx));
        match &result {
            Some(Ok(frame)) => {
                if let (Some((_, buffer)), Some(data)) = (&mut this.capture, frame.data_ref()) {
                    buffer.extend_from_slice(data);
                }
                if this.inner.is_end_stream() {
                    this.store();
                }
            }
            Some(Err(_)) | None => this.store(),
        }
        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_context::AccessLogConf;
    use access_event::{AccessEventSource, IMAGE_CONTENTS_SUPPRESSED};
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use test_log::test;

    use crate::test_utils::{app, capture_context, send};

    fn conf(includes: &[&str], excludes: &[&str]) -> TeeFilterConf {
        TeeFilterConf {
            enabled: true,
            includes: includes.iter().map(|pattern| (*pattern).to_owned()).collect(),
            excludes: excludes.iter().map(|pattern| (*pattern).to_owned()).collect(),
        }
    }

    fn form_request(host: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mock-controller/echo?x=0")
            .header(header::HOST, host)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("a=1&b=x+y"))
            .unwrap()
    }

    #[test]
    fn host_patterns() {
        let layer = TeeLayer::from_conf(&conf(&["*.example.com"], &["internal.example.com"]))
            .unwrap();
        assert!(layer.is_active("www.example.com"));
        assert!(layer.is_active("WWW.Example.COM"));
        assert!(!layer.is_active("internal.example.com"));
        assert!(!layer.is_active("example.org"));
        assert!(!layer.is_active(""));

        assert!(TeeLayer::new().is_active("anything"));
        assert!(TeeLayer::from_conf(&conf(&[], &[])).unwrap().is_active("x"));
        assert!(!TeeLayer::from_conf(&TeeFilterConf::default())
            .unwrap()
            .is_active("x"));
        assert!(TeeLayer::from_conf(&conf(&["[a"], &[])).is_err());
    }

    #[test(tokio::test)]
    async fn bodies_captured() {
        let (context, capture) = capture_context();
        let conf = AccessLogConf {
            tee_filter: conf(&["*.example.com"], &[]),
            ..Default::default()
        };

        let request = form_request("www.example.com");
        let (status, body) = send(app(context, &conf, false, None), request).await;
        assert_eq!(status, 200);
        assert_eq!(body, "a=1&b=x+y");

        let event = &capture.events()[0];
        assert_eq!(event.request_content(), Some("a=1&b=x+y"));
        assert_eq!(event.response_content(), Some("a=1&b=x+y"));
        assert_eq!(event.request_parameter("x"), ["0"]);
        assert_eq!(event.request_parameter("a"), ["1"]);
        assert_eq!(event.request_parameter("b"), ["x y"]);
        assert_eq!(event.content_length(), 9);
        assert!(event.attribute_map().is_empty());
    }

    #[test(tokio::test)]
    async fn other_hosts_not_captured() {
        let (context, capture) = capture_context();
        let conf = AccessLogConf {
            tee_filter: conf(&["*.example.com"], &[]),
            ..Default::default()
        };

        let request = form_request("example.org");
        let (_, body) = send(app(context, &conf, false, None), request).await;
        assert_eq!(body, "a=1&b=x+y");

        let event = &capture.events()[0];
        assert_eq!(event.request_content(), Some("x=0"));
        assert_eq!(event.response_content(), None);
        assert_eq!(event.request_parameter("a"), ["-"]);
    }

    #[test(tokio::test)]
    async fn images_suppressed() {
        let (context, capture) = capture_context();
        let conf = AccessLogConf {
            tee_filter: conf(&[], &[]),
            ..Default::default()
        };
        let routes = Router::new().route(
            "/image.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0x89_u8, b'P', b'N']) }),
        );

        let request = Request::builder()
            .uri("/image.png")
            .body(Body::empty())
            .unwrap();
        send(app(context, &conf, false, Some(routes)), request).await;

        let event = &capture.events()[0];
        assert_eq!(event.response_content(), Some(IMAGE_CONTENTS_SUPPRESSED));
        assert_eq!(event.request_content(), Some(""));
        assert_eq!(event.content_length(), 3);
    }
}
