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

//! The access log pipeline shared by all requests

use access_event::AccessEventSource;
use log::{debug, warn};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::appender::Appender;
use crate::filter::{chain_decision, FilterReply};
use crate::{AccessLogConf, AccessLogSettings, Configuration, Configurator};
use crate::{Error, Resource, ResourceLoader};

/// Lifecycle state of an [`AccessContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessContextState {
    /// Events are processed
    Started,
    /// Events are ignored
    Closed,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Receives access events from the web server integrations
///
/// The context is created from a configuration file and starts processing events right away.
/// It is meant to be shared via `Arc` between all requests.
#[derive(Debug)]
pub struct AccessContext {
    name: String,
    pipeline: RwLock<Option<Configuration>>,
}

impl AccessContext {
    /// Sets up the access log as configured by the settings, `None` if it is disabled
    pub fn from_conf(
        conf: &AccessLogConf,
        loader: &ResourceLoader,
        configurator: &Configurator,
    ) -> Result<Option<Self>, Error> {
        if conf.enabled {
            Self::new(conf, loader, configurator).map(Some)
        } else {
            debug!("Access log disabled");
            Ok(None)
        }
    }

    /// Shortcut for [`AccessContext::from_conf`] looking up `classpath:` locations in the current
    /// directory
    pub fn from_settings(settings: &AccessLogSettings) -> Result<Option<Self>, Error> {
        Self::from_conf(
            &settings.access_log,
            &ResourceLoader::default(),
            &Configurator::new(settings.environment.clone()),
        )
    }

    /// Locates the configuration file and sets up the access log
    ///
    /// This fails if an explicitly configured file doesn’t exist or any configuration file
    /// cannot be applied.
    pub fn new(
        conf: &AccessLogConf,
        loader: &ResourceLoader,
        configurator: &Configurator,
    ) -> Result<Self, Error> {
        let resource = loader.resolve(conf.config.as_deref())?;
        Self::from_resource(&resource, configurator)
    }

    /// Sets up the access log from the given configuration file
    pub fn from_resource(resource: &Resource, configurator: &Configurator) -> Result<Self, Error> {
        let name = resource.name();
        let content = resource.read()?;
        let configuration = configurator.configure(&name, &content)?;
        debug!("Started access log {name}");
        Ok(Self {
            name,
            pipeline: RwLock::new(Some(configuration)),
        })
    }

    /// Name of the configuration file
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> AccessContextState {
        if self.pipeline.read().is_some() {
            AccessContextState::Started
        } else {
            AccessContextState::Closed
        }
    }

    /// Passes an event through the filters and on to the attached appenders
    ///
    /// Panics in filters or appenders are logged and don’t affect the caller. Does nothing once
    /// the context is closed.
    pub fn emit(&self, source: &dyn AccessEventSource) {
        let pipeline = self.pipeline.read();
        let Some(configuration) = pipeline.as_ref() else {
            return;
        };

        let decision = catch_unwind(AssertUnwindSafe(|| {
            chain_decision(&configuration.filters, source)
        }));
        match decision {
            Ok(FilterReply::Deny) => {
                debug!("Access event for {} denied", source.request_uri());
                return;
            }
            Ok(_) => {}
            Err(payload) => {
                warn!(
                    "Access log {}: filter panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
                return;
            }
        }

        for appender in &configuration.attached {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| appender.append(source))) {
                warn!(
                    "Access log {}: appender {} panicked: {}",
                    self.name,
                    appender.name(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Asks appenders to reopen their files, e.g. after log rotation
    pub fn reopen(&self) {
        if let Some(configuration) = self.pipeline.read().as_ref() {
            for appender in configuration.appenders.values() {
                appender.reopen();
            }
        }
    }

    /// Stops all appenders and filters, further events are ignored
    pub fn close(&self) {
        let Some(configuration) = self.pipeline.write().take() else {
            return;
        };

        let mut stopped: Vec<&Arc<dyn Appender>> = Vec::new();
        for appender in configuration
            .attached
            .iter()
            .chain(configuration.appenders.values())
        {
            if !stopped.iter().any(|other| Arc::ptr_eq(*other, appender)) {
                appender.stop();
                stopped.push(appender);
            }
        }
        for filter in &configuration.filters {
            filter.stop();
        }
        debug!("Closed access log {}", self.name);
    }
}

impl Display for AccessContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessContext({})", self.name)
    }
}

impl Drop for AccessContext {
    fn drop(&mut self) {
        self.close();
    }
}
