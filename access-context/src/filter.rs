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

//! Event filters deciding which events are logged

use access_event::AccessEventSource;
use glob::Pattern;
use std::fmt::Debug;

use crate::configurator::{BuildContext, Element};
use crate::Error;

/// Decision of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReply {
    /// Log the event, skip remaining filters
    Accept,
    /// Don’t log the event
    Deny,
    /// No opinion, ask the next filter
    Neutral,
}

impl std::str::FromStr for FilterReply {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::Accept),
            "DENY" => Ok(Self::Deny),
            "NEUTRAL" => Ok(Self::Neutral),
            other => Err(Error::invalid(format!("unknown filter reply {other}"))),
        }
    }
}

/// Event filter
pub trait Filter: Debug + Send + Sync {
    /// Decides about an event
    fn decide(&self, event: &dyn AccessEventSource) -> FilterReply;

    /// Called when the pipeline shuts down
    fn stop(&self) {}
}

/// Runs filters in order, the first reply other than [`FilterReply::Neutral`] wins
pub fn chain_decision(filters: &[Box<dyn Filter>], event: &dyn AccessEventSource) -> FilterReply {
    filters
        .iter()
        .map(|filter| filter.decide(event))
        .find(|reply| *reply != FilterReply::Neutral)
        .unwrap_or(FilterReply::Neutral)
}

fn replies(element: &Element) -> Result<(FilterReply, FilterReply), Error> {
    let on_match = element
        .child_text("onMatch")
        .map(str::parse)
        .transpose()?
        .unwrap_or(FilterReply::Neutral);
    let on_mismatch = element
        .child_text("onMismatch")
        .map(str::parse)
        .transpose()?
        .unwrap_or(FilterReply::Neutral);
    Ok((on_match, on_mismatch))
}

/// Matches a request header
///
/// ```xml
/// <filter class="RequestHeaderFilter">
///   <header>X-Health-Check</header>
///   <value>true</value>
///   <onMatch>DENY</onMatch>
/// </filter>
/// ```
///
/// Without a `value` element the filter matches whenever the header is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaderFilter {
    header: String,
    value: Option<String>,
    on_match: FilterReply,
    on_mismatch: FilterReply,
}

impl RequestHeaderFilter {
    /// Creates a filter matching a header value
    pub fn new(
        header: impl Into<String>,
        value: Option<String>,
        on_match: FilterReply,
        on_mismatch: FilterReply,
    ) -> Self {
        Self {
            header: header.into(),
            value,
            on_match,
            on_mismatch,
        }
    }

    pub(crate) fn from_element(
        element: &Element,
        _ctx: &BuildContext<'_>,
    ) -> Result<Box<dyn Filter>, Error> {
        let header = element
            .child_text("header")
            .ok_or_else(|| Error::invalid("RequestHeaderFilter requires a header element"))?;
        let (on_match, on_mismatch) = replies(element)?;
        Ok(Box::new(Self::new(
            header,
            element.child_text("value").map(str::to_owned),
            on_match,
            on_mismatch,
        )))
    }
}

impl Filter for RequestHeaderFilter {
    fn decide(&self, event: &dyn AccessEventSource) -> FilterReply {
        let matches = match (&self.value, event.request_header_map().get(&self.header)) {
            (Some(expected), Some(actual)) => expected == actual,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if matches {
            self.on_match
        } else {
            self.on_mismatch
        }
    }
}

/// Matches the request path against a glob pattern
///
/// ```xml
/// <filter class="RequestUriFilter">
///   <pattern>/health*</pattern>
///   <onMatch>DENY</onMatch>
/// </filter>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUriFilter {
    pattern: Pattern,
    on_match: FilterReply,
    on_mismatch: FilterReply,
}

impl RequestUriFilter {
    /// Creates a filter, fails if the pattern is invalid
    pub fn new(
        pattern: &str,
        on_match: FilterReply,
        on_mismatch: FilterReply,
    ) -> Result<Self, Error> {
        let pattern = Pattern::new(pattern)
            .map_err(|err| Error::invalid(format!("invalid URI pattern {pattern}: {err}")))?;
        Ok(Self {
            pattern,
            on_match,
            on_mismatch,
        })
    }

    pub(crate) fn from_element(
        element: &Element,
        _ctx: &BuildContext<'_>,
    ) -> Result<Box<dyn Filter>, Error> {
        let pattern = element
            .child_text("pattern")
            .ok_or_else(|| Error::invalid("RequestUriFilter requires a pattern element"))?;
        let (on_match, on_mismatch) = replies(element)?;
        Ok(Box::new(Self::new(pattern, on_match, on_mismatch)?))
    }
}

impl Filter for RequestUriFilter {
    fn decide(&self, event: &dyn AccessEventSource) -> FilterReply {
        if self.pattern.matches(event.request_uri()) {
            self.on_match
        } else {
            self.on_mismatch
        }
    }
}
