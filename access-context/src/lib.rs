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

//! # Access log pipeline
//!
//! This crate receives the access events produced by the web server integrations and passes
//! them to appenders configured by an XML file. A minimal setup could look like this:
//!
//! ```rust
//! use access_context::{AccessContext, Configurator, Environment, Resource};
//! use access_event::AccessEvent;
//!
//! let resource = Resource::Embedded {
//!     name: "logback-access.xml",
//!     content: r#"<configuration>
//!         <appender name="CONSOLE" class="ConsoleAppender">
//!             <encoder><pattern>combined</pattern></encoder>
//!         </appender>
//!         <appender-ref ref="CONSOLE" />
//!     </configuration>"#,
//! };
//! let configurator = Configurator::new(Environment::new().with_profile("dev"));
//! let context = AccessContext::from_resource(&resource, &configurator).unwrap();
//!
//! context.emit(&AccessEvent::builder().request_uri("/index.html").build());
//! context.close();
//! ```
//!
//! Usually the configuration file is located via [`ResourceLoader`], see
//! [`AccessContext::from_conf`]. The settings are typically read from a YAML file:
//!
//! ```yaml
//! access_log:
//!   config: classpath:logback-access.xml
//!   local_port_strategy: server
//!   tee_filter:
//!     enabled: true
//!     includes: ["*.example.com"]
//! environment:
//!   profiles: [dev]
//! ```
//!
//! Search order for the configuration file if none is given explicitly:
//!
//! 1. `logback-access-test.xml`
//! 2. `logback-access.xml`
//! 3. `logback-access-test-spring.xml`
//! 4. `logback-access-spring.xml`
//! 5. The bundled configuration, logging to standard output in the common log format
//!
//! See [`configurator`] for the configuration file syntax and [`encoder`] for the supported
//! pattern conversion words.

pub mod appender;
pub mod capture;
mod configuration;
pub mod configurator;
mod context;
pub mod encoder;
mod environment;
mod error;
pub mod filter;
mod resolution;
#[cfg(unix)]
pub mod signal;

pub use appender::Appender;
pub use configuration::{
    AccessLogConf, AccessLogOpt, AccessLogSettings, FromYaml, RuntimeConf, TeeFilterConf,
};
pub use configurator::{BuildContext, Configuration, Configurator, Element};
pub use context::{AccessContext, AccessContextState};
pub use encoder::PatternEncoder;
pub use environment::{Environment, DEFAULT_PROFILE};
pub use error::Error;
pub use filter::{Filter, FilterReply};
pub use resolution::{Resource, ResourceLoader, DEFAULT_CONFIGS, FALLBACK_CONFIG};

pub use access_event;
