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

//! In-memory appender collecting events, meant for tests
//!
//! ```rust
//! use access_context::capture::EventsCapture;
//! use access_context::{Configurator, Environment};
//!
//! let capture = EventsCapture::new();
//! let configurator = Configurator::new(Environment::new())
//!     .with_appender("CaptureAppender", capture.factory());
//! ```

use access_event::{AccessEvent, AccessEventSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::appender::Appender;
use crate::configurator::{BuildContext, Element};
use crate::Error;

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<Vec<AccessEvent>>,
    stopped: AtomicBool,
}

/// Handle to the events collected by capture appenders
///
/// Clones share the same event list.
#[derive(Debug, Clone, Default)]
pub struct EventsCapture {
    shared: Arc<Shared>,
}

impl EventsCapture {
    /// Creates an empty capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an appender adding events to this capture
    pub fn appender(&self, name: impl Into<String>) -> Arc<dyn Appender> {
        Arc::new(CaptureAppender {
            name: name.into(),
            shared: self.shared.clone(),
        })
    }

    /// Produces a factory for configuration files, see
    /// [`Configurator::with_appender`](crate::Configurator::with_appender)
    pub fn factory(
        &self,
    ) -> impl Fn(&Element, &BuildContext<'_>) -> Result<Arc<dyn Appender>, Error> + Send + Sync {
        fn constrain<F>(factory: F) -> F
        where
            F: Fn(&Element, &BuildContext<'_>) -> Result<Arc<dyn Appender>, Error>,
        {
            factory
        }

        let capture = self.clone();
        constrain(move |element, _ctx| {
            Ok(capture.appender(element.attribute("name").unwrap_or("CAPTURE")))
        })
    }

    /// Copies of the events collected so far
    pub fn events(&self) -> Vec<AccessEvent> {
        self.shared.events.lock().clone()
    }

    /// Number of events collected so far
    pub fn len(&self) -> usize {
        self.shared.events.lock().len()
    }

    /// Checks whether no events were collected
    pub fn is_empty(&self) -> bool {
        self.shared.events.lock().is_empty()
    }

    /// Removes all collected events
    pub fn clear(&self) {
        self.shared.events.lock().clear();
    }

    /// Checks whether an appender of this capture was stopped
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct CaptureAppender {
    name: String,
    shared: Arc<Shared>,
}

impl Appender for CaptureAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, event: &dyn AccessEventSource) {
        let event = event.prepare_for_deferred_processing();
        self.shared.events.lock().push(event);
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
    }
}
