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

//! Appenders receiving accepted events

use access_event::{AccessEvent, AccessEventSource};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::{stderr, stdout, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Sender};

use crate::configurator::{BuildContext, Element};
use crate::context::panic_message;
use crate::encoder::PatternEncoder;
use crate::filter::{chain_decision, Filter, FilterReply};
use crate::Error;

/// Destination of accepted events
pub trait Appender: Debug + Send + Sync {
    /// Name of the appender as referenced in the configuration
    fn name(&self) -> &str;

    /// Processes an event
    ///
    /// Implementations keeping the event beyond this call have to use
    /// [`AccessEventSource::prepare_for_deferred_processing`].
    fn append(&self, event: &dyn AccessEventSource);

    /// Called when the pipeline shuts down
    fn stop(&self) {}

    /// Reopens any files, called after log rotation
    fn reopen(&self) {}
}

fn required_name(element: &Element) -> Result<&str, Error> {
    element
        .attribute("name")
        .ok_or_else(|| Error::invalid(format!("<{}> element requires a name", element.name)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
}

/// Writes events to standard output
///
/// ```xml
/// <appender name="CONSOLE" class="ConsoleAppender">
///   <target>System.err</target>
///   <encoder><pattern>combined</pattern></encoder>
/// </appender>
/// ```
#[derive(Debug)]
pub struct ConsoleAppender {
    name: String,
    target: Target,
    encoder: PatternEncoder,
}

impl ConsoleAppender {
    /// Creates an appender writing to standard output
    pub fn new(name: impl Into<String>, encoder: PatternEncoder) -> Self {
        Self {
            name: name.into(),
            target: Target::Stdout,
            encoder,
        }
    }

    pub(crate) fn from_element(
        element: &Element,
        _ctx: &BuildContext<'_>,
    ) -> Result<Arc<dyn Appender>, Error> {
        let encoder = PatternEncoder::from_element(element)?;
        let mut appender = Self::new(required_name(element)?, encoder);
        if element.child_text("target") == Some("System.err") {
            appender.target = Target::Stderr;
        }
        Ok(Arc::new(appender))
    }
}

impl Appender for ConsoleAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, event: &dyn AccessEventSource) {
        let mut buf = Vec::with_capacity(256);
        self.encoder.encode(event, &mut buf);
        let result = match self.target {
            Target::Stdout => stdout().lock().write_all(&buf),
            Target::Stderr => stderr().lock().write_all(&buf),
        };
        if let Err(err) = result {
            error!("Appender {} failed writing to console: {err}", self.name);
        }
    }
}

fn normalize_path(path: PathBuf) -> Result<PathBuf, Error> {
    if path.as_os_str().is_empty() || path.as_os_str() == "-" {
        // Don't change special paths
        return Ok(path);
    }

    if let Some(parent) = path.parent() {
        let mut parent = if parent.as_os_str().is_empty() {
            PathBuf::from(".").canonicalize()
        } else {
            parent.canonicalize()
        }
        .map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        if let Some(name) = path.file_name() {
            parent.push(name);
        }
        Ok(parent)
    } else {
        // Absolute path in the root, leave unchanged
        Ok(path)
    }
}

fn open_file(path: &PathBuf) -> Box<dyn Write + Send> {
    if path.as_os_str() != "-" {
        match File::options().append(true).create(true).open(path) {
            Ok(file) => return Box::new(file),
            Err(err) => {
                error!(
                    "Failed opening log file {} (cause: {err}), falling back to stdout",
                    path.as_os_str().to_string_lossy()
                );
            }
        }
    }
    Box::new(stdout())
}

/// Appends events to a file
///
/// The special path `-` writes to standard output, so does a file that cannot be opened.
///
/// ```xml
/// <appender name="FILE" class="FileAppender">
///   <file>logs/access.log</file>
///   <encoder><pattern>common</pattern></encoder>
/// </appender>
/// ```
pub struct FileAppender {
    name: String,
    path: PathBuf,
    encoder: PatternEncoder,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl Debug for FileAppender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAppender")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("encoder", &self.encoder)
            .finish()
    }
}

impl FileAppender {
    /// Opens the file, creating it if necessary
    ///
    /// Fails only if the parent directory cannot be resolved.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        encoder: PatternEncoder,
    ) -> Result<Self, Error> {
        // Normalize parent directory in case the same file is specified with different paths
        let path = normalize_path(path.into())?;
        let writer = Mutex::new(open_file(&path));
        Ok(Self {
            name: name.into(),
            path,
            encoder,
            writer,
        })
    }

    /// Normalized file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn from_element(
        element: &Element,
        _ctx: &BuildContext<'_>,
    ) -> Result<Arc<dyn Appender>, Error> {
        let path = element
            .child_text("file")
            .ok_or_else(|| Error::invalid("FileAppender requires a file element"))?;
        Ok(Arc::new(Self::new(
            required_name(element)?,
            path,
            PatternEncoder::from_element(element)?,
        )?))
    }
}

impl Appender for FileAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, event: &dyn AccessEventSource) {
        let mut buf = Vec::with_capacity(256);
        self.encoder.encode(event, &mut buf);

        let mut writer = self.writer.lock();
        if let Err(err) = writer.write_all(&buf).and_then(|()| writer.flush()) {
            error!(
                "Appender {} failed writing to {}: {err}",
                self.name,
                self.path.display()
            );
        }
    }

    fn stop(&self) {
        if let Err(err) = self.writer.lock().flush() {
            warn!(
                "Appender {} failed flushing {}: {err}",
                self.name,
                self.path.display()
            );
        }
    }

    fn reopen(&self) {
        debug!("Reopening {}", self.path.display());
        *self.writer.lock() = open_file(&self.path);
    }
}

/// Default capacity of the [`AsyncAppender`] queue
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Hands events over to a background thread which forwards them to other appenders
///
/// Events are frozen before being queued. If the queue is full, events are dropped.
///
/// ```xml
/// <appender name="ASYNC" class="AsyncAppender">
///   <queueSize>512</queueSize>
///   <appender-ref ref="FILE" />
/// </appender>
/// ```
///
/// Referenced appenders have to be defined before the asynchronous appender.
#[derive(Debug)]
pub struct AsyncAppender {
    name: String,
    sender: Mutex<Option<Sender<AccessEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncAppender {
    /// Starts the background thread
    pub fn new(
        name: impl Into<String>,
        queue_size: usize,
        appenders: Vec<Arc<dyn Appender>>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if queue_size == 0 {
            return Err(Error::invalid(format!(
                "queue size of appender {name} has to be positive"
            )));
        }

        let (sender, mut receiver) = channel::<AccessEvent>(queue_size);
        let worker_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("access-log-{name}"))
            .spawn(move || {
                while let Some(event) = receiver.blocking_recv() {
                    for appender in &appenders {
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| appender.append(&event)))
                        {
                            warn!(
                                "Appender {worker_name}: appender {} panicked: {}",
                                appender.name(),
                                panic_message(payload.as_ref())
                            );
                        }
                    }
                }
            })
            .map_err(|err| {
                Error::invalid(format!("failed starting thread of appender {name}: {err}"))
            })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn from_element(
        element: &Element,
        ctx: &BuildContext<'_>,
    ) -> Result<Arc<dyn Appender>, Error> {
        let queue_size = match element.child_text("queueSize") {
            Some(size) => size
                .parse()
                .map_err(|err| Error::invalid(format!("invalid queue size {size}: {err}")))?,
            None => DEFAULT_QUEUE_SIZE,
        };
        let appenders = ctx.referenced_appenders(element)?;
        Ok(Arc::new(Self::new(
            required_name(element)?,
            queue_size,
            appenders,
        )?))
    }
}

impl Appender for AsyncAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, event: &dyn AccessEventSource) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            debug!("Appender {} is stopped, dropping event", self.name);
            return;
        };

        match sender.try_send(event.prepare_for_deferred_processing()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Queue of appender {} is full, dropping event {}",
                    self.name,
                    event.request_url()
                );
            }
            Err(TrySendError::Closed(_)) => {
                error!("Failed queuing event, thread of appender {} crashed?", self.name);
            }
        }
    }

    fn stop(&self) {
        // Closing the channel makes the worker exit once the queue is drained
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Thread of appender {} panicked", self.name);
            }
        }
    }
}

/// Applies filters before passing events on to another appender
///
/// This is produced for `<appender>` elements containing `<filter>` elements.
#[derive(Debug)]
pub struct FilteredAppender {
    inner: Arc<dyn Appender>,
    filters: Vec<Box<dyn Filter>>,
}

impl FilteredAppender {
    /// Wraps an appender
    pub fn new(inner: Arc<dyn Appender>, filters: Vec<Box<dyn Filter>>) -> Self {
        Self { inner, filters }
    }
}

impl Appender for FilteredAppender {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn append(&self, event: &dyn AccessEventSource) {
        if chain_decision(&self.filters, event) != FilterReply::Deny {
            self.inner.append(event);
        }
    }

    fn stop(&self) {
        self.inner.stop();
        for filter in &self.filters {
            filter.stop();
        }
    }

    fn reopen(&self) {
        self.inner.reopen();
    }
}
