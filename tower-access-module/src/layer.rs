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

//! Layer emitting an access event once the response body has been sent

use access_context::{AccessContext, AccessLogConf};
use access_event::{LocalPortStrategy, RequestAttributes};
use bytes::Buf;
use http::{HeaderMap, Request, Response};
use http_body::{Body, Frame, SizeHint};
use log::debug;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::SystemTime;
use tower::{Layer, Service};

use crate::source::{Exchange, RequestInfo, TowerAccessSource};

/// Retrieves the attribute store of the request, adding one if necessary
///
/// Handlers can use this to add attributes to the access event, e.g. the authenticated user as
/// [`REMOTE_USER_ATTRIBUTE`](access_event::attributes::REMOTE_USER_ATTRIBUTE).
pub fn request_attributes<B>(request: &mut Request<B>) -> RequestAttributes {
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
    request_attributes_enabled: Option<bool>,
}

/// Passes an access event for each request to the access context
///
/// This layer should be the outermost one, so that the time measurement covers all processing.
/// The event is emitted when the response body has been sent completely or is dropped.
#[derive(Debug, Clone)]
pub struct AccessLogLayer {
    settings: Arc<Settings>,
}

impl AccessLogLayer {
    /// Creates a layer with default settings
    pub fn new(context: Arc<AccessContext>) -> Self {
        Self::from_conf(context, &AccessLogConf::default())
    }

    /// Creates a layer using the `tower` runtime settings
    pub fn from_conf(context: Arc<AccessContext>, conf: &AccessLogConf) -> Self {
        Self {
            settings: Arc::new(Settings {
                context,
                local_port_strategy: conf.tower.local_port_strategy(conf.local_port_strategy),
                request_attributes_enabled: conf.tower.request_attributes_enabled,
            }),
        }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            settings: self.settings.clone(),
        }
    }
}

/// Service produced by [`AccessLogLayer`]
#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    settings: Arc<Settings>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AccessLogService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display + 'static,
    ReqBody: Send + 'static,
    ResBody: 'static,
{
    type Response = Response<AccessLogBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let start = SystemTime::now();
        let attributes = request_attributes(&mut request);
        let info = RequestInfo::new(start, &request, attributes);
        let settings = self.settings.clone();

        Box::pin(async move {
            match inner.call(request).await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let pending = Pending {
                        settings,
                        exchange: Exchange {
                            request: info,
                            status: parts.status.as_u16(),
                            response_headers: parts.headers.clone(),
                            bytes_sent: 0,
                        },
                    };
                    Ok(Response::from_parts(parts, AccessLogBody::new(body, pending)))
                }
                Err(err) => {
                    debug!("Request {} failed: {err}", info.uri);
                    Pending {
                        settings,
                        exchange: Exchange {
                            request: info,
                            status: 0,
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
        let source = TowerAccessSource::new(
            &self.exchange,
            self.settings.local_port_strategy,
            self.settings.request_attributes_enabled,
        );
        self.settings.context.emit(&source);
    }
}

/// Response body counting the bytes sent, emits the access event when done
///
/// The event is emitted after the last frame or when the body is dropped, whichever happens
/// first.
pub struct AccessLogBody<B> {
    inner: Pin<Box<B>>,
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
    fn new(inner: B, pending: Pending) -> Self {
        Self {
            inner: Box::pin(inner),
            pending: Some(pending),
        }
    }

    fn count(&mut self, bytes: usize) {
        if let Some(pending) = &mut self.pending {
            pending.exchange.bytes_sent += bytes as u64;
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.emit();
        }
    }
}

impl<B> Body for AccessLogBody<B>
where
    B: Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let result = ready!(this.inner.as_mut().poll_frame(cx));
        match &result {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.count(data.remaining());
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Some(Err(_)) | None => this.finish(),
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

impl<B> Drop for AccessLogBody<B> {
    fn drop(&mut self) {
        self.finish();
    }
}
