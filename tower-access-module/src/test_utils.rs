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

use access_context::capture::EventsCapture;
use access_context::{AccessContext, AccessLogConf, Configurator, Environment, Resource};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use crate::{AccessLogLayer, ForwardedHeadersLayer, SocketPair, TeeLayer};

pub(crate) const MOCK_TEXT: &str = "Hello from the mock controller";

const CAPTURE_CONFIG: Resource = Resource::Embedded {
    name: "capture.xml",
    content: r#"<configuration>
        <appender name="CAPTURE" class="CaptureAppender" />
        <appender-ref ref="CAPTURE" />
    </configuration>"#,
};

pub(crate) fn capture_context() -> (Arc<AccessContext>, EventsCapture) {
    let capture = EventsCapture::new();
    let configurator =
        Configurator::new(Environment::new()).with_appender("CaptureAppender", capture.factory());
    let context = AccessContext::from_resource(&CAPTURE_CONFIG, &configurator).unwrap();
    (Arc::new(context), capture)
}

async fn text() -> &'static str {
    MOCK_TEXT
}

async fn echo(body: String) -> String {
    body
}

fn mock_routes() -> Router {
    Router::new()
        .route("/mock-controller/text", get(text))
        .route("/mock-controller/echo", post(echo))
}

/// Application with the access log, forwarded headers evaluation and body capture as configured
pub(crate) fn app(
    context: Arc<AccessContext>,
    conf: &AccessLogConf,
    forwarded: bool,
    routes: Option<Router>,
) -> Router {
    let mut app = routes.unwrap_or_else(mock_routes);
    if conf.tee_filter.enabled {
        app = app.layer(TeeLayer::from_conf(&conf.tee_filter).unwrap());
    }
    if forwarded {
        app = app.layer(ForwardedHeadersLayer::new());
    }
    app.layer(AccessLogLayer::from_conf(context, conf))
}

pub(crate) fn connected(mut request: Request<Body>, local: &str, remote: &str) -> Request<Body> {
    request.extensions_mut().insert(ConnectInfo(SocketPair {
        local: local.parse::<SocketAddr>().unwrap(),
        remote: remote.parse::<SocketAddr>().unwrap(),
    }));
    request
}

/// Sends the request and reads the complete response
pub(crate) async fn send(app: Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}
