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

#![doc = include_str!("../README.md")]

use access_context::{AccessContext, AccessLogOpt, AccessLogSettings, FromYaml};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tower_access_module::{AccessLogLayer, ForwardedHeadersLayer, SocketPair, TeeLayer};

/// Run the access log sample server
#[derive(Debug, Parser)]
struct Opt {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Settings file
    #[arg(long)]
    conf: Option<PathBuf>,

    #[command(flatten)]
    access_log: AccessLogOpt,
}

async fn text() -> &'static str {
    "Hello from the mock controller"
}

async fn echo(body: String) -> String {
    body
}

fn app(settings: &AccessLogSettings) -> Result<Router, String> {
    let app = Router::new()
        .route("/mock-controller/text", get(text))
        .route("/mock-controller/echo", post(echo));

    let Some(context) = AccessContext::from_settings(settings).map_err(|err| err.to_string())?
    else {
        info!("Access log disabled");
        return Ok(app);
    };
    let context = Arc::new(context);
    #[cfg(unix)]
    access_context::signal::listen(&context);

    let conf = &settings.access_log;
    let tee = TeeLayer::from_conf(&conf.tee_filter)
        .map_err(|err| format!("invalid tee filter host pattern: {err}"))?;
    Ok(app
        .layer(tee)
        .layer(ForwardedHeadersLayer::new())
        .layer(AccessLogLayer::from_conf(context, conf)))
}

async fn run(opt: Opt) -> Result<(), String> {
    let mut settings = match opt.conf.as_deref().map(AccessLogSettings::load_from_yaml) {
        Some(Ok(settings)) => settings,
        Some(Err(err)) => {
            error!("{err}");
            AccessLogSettings::default()
        }
        None => AccessLogSettings::default(),
    };
    settings.merge_with_opt(opt.access_log);

    let app = app(&settings)?;

    let listener = tokio::net::TcpListener::bind(opt.listen)
        .await
        .map_err(|err| format!("Failed listening on {}: {err}", opt.listen))?;
    info!("Listening on {}", opt.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketPair>(),
    )
    .await
    .map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run(Opt::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
