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

//! Interpretation of XML configuration files
//!
//! A configuration file looks like this:
//!
//! ```xml
//! <configuration>
//!   <property name="dir" value="logs" />
//!   <springProperty name="app" source="app.name" defaultValue="app" />
//!   <appender name="FILE" class="FileAppender">
//!     <file>${dir}/${app}-access.log</file>
//!     <encoder><pattern>combined</pattern></encoder>
//!   </appender>
//!   <springProfile name="dev">
//!     <appender name="CONSOLE" class="ConsoleAppender" />
//!     <appender-ref ref="CONSOLE" />
//!   </springProfile>
//!   <appender-ref ref="FILE" />
//! </configuration>
//! ```
//!
//! `<springProfile>` sections are only considered if their `name` attribute matches the active
//! profiles of the [`Environment`], see [`Environment::accepts_profiles`]. Values can refer to
//! properties via `${name}` or `${name:-default}`. Properties are looked up in the configuration
//! file first, then in the environment properties, then in the process environment variables.

use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::appender::{Appender, AsyncAppender, ConsoleAppender, FileAppender, FilteredAppender};
use crate::filter::{Filter, RequestHeaderFilter, RequestUriFilter};
use crate::{Environment, Error};

/// Builds an appender from its configuration element
pub type AppenderFactory =
    dyn Fn(&Element, &BuildContext<'_>) -> Result<Arc<dyn Appender>, Error> + Send + Sync;

/// Builds a filter from its configuration element
pub type FilterFactory =
    dyn Fn(&Element, &BuildContext<'_>) -> Result<Box<dyn Filter>, Error> + Send + Sync;

/// Configuration element with properties substituted and profile sections resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Tag name
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Text content
    pub text: String,
    /// Child elements
    pub children: Vec<Element>,
}

impl Element {
    /// Creates an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Sets the text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Adds a child element
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Looks up an attribute value
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attribute, _)| attribute == name)
            .map(|(_, value)| value.as_str())
    }

    /// Text content with surrounding whitespace removed
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// First child element with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All child elements with the given name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Trimmed text content of the first child element with the given name
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::text)
    }
}

/// Pipeline components produced from a configuration file
#[derive(Debug, Default)]
pub struct Configuration {
    /// Filters deciding whether an event is passed to the appenders
    pub filters: Vec<Box<dyn Filter>>,
    /// All appenders defined, by name
    pub appenders: IndexMap<String, Arc<dyn Appender>>,
    /// Appenders referenced at the top level, these receive the events
    pub attached: Vec<Arc<dyn Appender>>,
}

impl Configuration {
    /// Stops all components, used if the configuration cannot be completed
    pub(crate) fn stop(&self) {
        for appender in self.appenders.values() {
            appender.stop();
        }
        for filter in &self.filters {
            filter.stop();
        }
    }
}

/// Information available to appender and filter factories
pub struct BuildContext<'a> {
    configurator: &'a Configurator,
    appenders: &'a IndexMap<String, Arc<dyn Appender>>,
}

impl Debug for BuildContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("appenders", &self.appenders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BuildContext<'_> {
    /// Environment of the configuration
    pub fn environment(&self) -> &Environment {
        &self.configurator.environment
    }

    /// Looks up a previously defined appender
    pub fn appender(&self, name: &str) -> Option<Arc<dyn Appender>> {
        self.appenders.get(name).cloned()
    }

    /// Resolves the `<appender-ref>` children of an element
    pub fn referenced_appenders(&self, element: &Element) -> Result<Vec<Arc<dyn Appender>>, Error> {
        element
            .children_named("appender-ref")
            .map(|reference| self.resolve_reference(reference))
            .collect()
    }

    fn resolve_reference(&self, reference: &Element) -> Result<Arc<dyn Appender>, Error> {
        let name = reference
            .attribute("ref")
            .ok_or_else(|| Error::invalid("<appender-ref> element requires a ref attribute"))?;
        self.appender(name)
            .ok_or_else(|| Error::invalid(format!("reference to undefined appender {name}")))
    }

    /// Builds a filter from a `<filter>` element
    pub fn build_filter(&self, element: &Element) -> Result<Box<dyn Filter>, Error> {
        let class = element
            .attribute("class")
            .ok_or_else(|| Error::invalid("<filter> element requires a class attribute"))?;
        let factory = self
            .configurator
            .filters
            .get(class)
            .ok_or_else(|| Error::invalid(format!("unknown filter class {class}")))?;
        factory(element, self)
    }

    fn build_appender(&self, element: &Element) -> Result<Arc<dyn Appender>, Error> {
        let class = element
            .attribute("class")
            .ok_or_else(|| Error::invalid("<appender> element requires a class attribute"))?;
        let factory = self
            .configurator
            .appenders
            .get(class)
            .ok_or_else(|| Error::invalid(format!("unknown appender class {class}")))?;
        let appender = factory(element, self)?;

        let filters = element
            .children_named("filter")
            .map(|filter| self.build_filter(filter))
            .collect::<Result<Vec<_>, _>>();
        match filters {
            Ok(filters) if filters.is_empty() => Ok(appender),
            Ok(filters) => Ok(Arc::new(FilteredAppender::new(appender, filters))),
            Err(err) => {
                appender.stop();
                Err(err)
            }
        }
    }
}

/// Interprets configuration files
///
/// Appender and filter classes are resolved via a registry. Built-in are `ConsoleAppender`,
/// `FileAppender`, `AsyncAppender`, `RequestHeaderFilter` and `RequestUriFilter`. The Logback
/// class names `ch.qos.logback.core.ConsoleAppender`, `ch.qos.logback.core.FileAppender` and
/// `ch.qos.logback.core.AsyncAppenderBase` are accepted as aliases.
pub struct Configurator {
    environment: Environment,
    appenders: HashMap<String, Arc<AppenderFactory>>,
    filters: HashMap<String, Arc<FilterFactory>>,
}

impl Debug for Configurator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut appenders = self.appenders.keys().collect::<Vec<_>>();
        appenders.sort();
        let mut filters = self.filters.keys().collect::<Vec<_>>();
        filters.sort();
        f.debug_struct("Configurator")
            .field("environment", &self.environment)
            .field("appenders", &appenders)
            .field("filters", &filters)
            .finish()
    }
}

impl Default for Configurator {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}

impl Configurator {
    /// Creates a configurator with the built-in appenders and filters
    pub fn new(environment: Environment) -> Self {
        let mut configurator = Self {
            environment,
            appenders: HashMap::new(),
            filters: HashMap::new(),
        };
        for class in ["ConsoleAppender", "ch.qos.logback.core.ConsoleAppender"] {
            configurator = configurator.with_appender(class, ConsoleAppender::from_element);
        }
        for class in ["FileAppender", "ch.qos.logback.core.FileAppender"] {
            configurator = configurator.with_appender(class, FileAppender::from_element);
        }
        for class in ["AsyncAppender", "ch.qos.logback.core.AsyncAppenderBase"] {
            configurator = configurator.with_appender(class, AsyncAppender::from_element);
        }
        configurator
            .with_filter("RequestHeaderFilter", RequestHeaderFilter::from_element)
            .with_filter("RequestUriFilter", RequestUriFilter::from_element)
    }

    /// Environment used for profiles and properties
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Registers an appender class
    pub fn with_appender<F>(mut self, class: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Element, &BuildContext<'_>) -> Result<Arc<dyn Appender>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.appenders.insert(class.into(), Arc::new(factory));
        self
    }

    /// Registers a filter class
    pub fn with_filter<F>(mut self, class: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Element, &BuildContext<'_>) -> Result<Box<dyn Filter>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.filters.insert(class.into(), Arc::new(factory));
        self
    }

    /// Builds the pipeline components described by a configuration file
    ///
    /// `name` identifies the file in error messages.
    pub fn configure(&self, name: &str, content: &str) -> Result<Configuration, Error> {
        let document = roxmltree::Document::parse(content).map_err(|source| Error::Xml {
            name: name.to_owned(),
            source,
        })?;
        let root = document.root_element();
        if root.tag_name().name() != "configuration" {
            return Err(Error::invalid(format!(
                "{name}: expected <configuration> root element, found <{}>",
                root.tag_name().name()
            )));
        }

        let mut properties = HashMap::new();
        let elements = self.expand_children(root, &mut properties)?;

        let mut configuration = Configuration::default();
        if let Err(err) = self.apply(name, elements, &mut configuration) {
            configuration.stop();
            return Err(err);
        }
        debug!(
            "Configured {name}: {} appenders, {} attached, {} filters",
            configuration.appenders.len(),
            configuration.attached.len(),
            configuration.filters.len()
        );
        Ok(configuration)
    }

    fn apply(
        &self,
        name: &str,
        elements: Vec<Element>,
        configuration: &mut Configuration,
    ) -> Result<(), Error> {
        for element in elements {
            let ctx = BuildContext {
                configurator: self,
                appenders: &configuration.appenders,
            };
            match element.name.as_str() {
                "appender" => {
                    let appender = ctx.build_appender(&element)?;
                    let appender_name = appender.name().to_owned();
                    if let Some(previous) =
                        configuration.appenders.insert(appender_name, appender)
                    {
                        previous.stop();
                        warn!("{name}: appender {} defined twice", previous.name());
                    }
                }
                "appender-ref" => {
                    let appender = ctx.resolve_reference(&element)?;
                    configuration.attached.push(appender);
                }
                "filter" => {
                    let filter = ctx.build_filter(&element)?;
                    configuration.filters.push(filter);
                }
                other => warn!("{name}: ignoring unsupported element <{other}>"),
            }
        }
        Ok(())
    }

    fn expand_children(
        &self,
        node: roxmltree::Node<'_, '_>,
        properties: &mut HashMap<String, String>,
    ) -> Result<Vec<Element>, Error> {
        let mut elements = Vec::new();
        for child in node.children().filter(roxmltree::Node::is_element) {
            match child.tag_name().name() {
                "springProfile" => {
                    let names = child.attribute("name").unwrap_or("");
                    let names = names
                        .split(',')
                        .map(|name| self.substitute(name.trim(), properties))
                        .filter(|name| !name.is_empty())
                        .collect::<Vec<_>>();
                    if !names.is_empty() && self.environment.accepts_profiles(&names)? {
                        elements.extend(self.expand_children(child, properties)?);
                    } else {
                        debug!("Skipping section for profiles {names:?}");
                    }
                }
                "property" => {
                    let (name, value) = match (child.attribute("name"), child.attribute("value")) {
                        (Some(name), Some(value)) => (name, value),
                        _ => {
                            return Err(Error::invalid(
                                "<property> element requires name and value attributes",
                            ))
                        }
                    };
                    let value = self.substitute(value, properties);
                    properties.insert(self.substitute(name, properties), value);
                }
                "springProperty" => {
                    let name = child.attribute("name").ok_or_else(|| {
                        Error::invalid("<springProperty> element requires a name attribute")
                    })?;
                    let name = self.substitute(name, properties);
                    let source = child
                        .attribute("source")
                        .map(|source| self.substitute(source, properties));
                    let value = source
                        .as_deref()
                        .and_then(|source| self.environment.property(source))
                        .map(str::to_owned)
                        .or_else(|| {
                            child
                                .attribute("defaultValue")
                                .map(|value| self.substitute(value, properties))
                        });
                    match value {
                        Some(value) => {
                            properties.insert(name, value);
                        }
                        None => warn!("No value for property {name}, source {source:?} not set"),
                    }
                }
                tag => {
                    let attributes = child
                        .attributes()
                        .map(|attribute| {
                            (
                                attribute.name().to_owned(),
                                self.substitute(attribute.value(), properties),
                            )
                        })
                        .collect();
                    let text = child
                        .children()
                        .filter(roxmltree::Node::is_text)
                        .filter_map(|text| text.text())
                        .collect::<String>();
                    let text = self.substitute(&text, properties);
                    let children = self.expand_children(child, properties)?;
                    elements.push(Element {
                        name: tag.to_owned(),
                        attributes,
                        text,
                        children,
                    });
                }
            }
        }
        Ok(elements)
    }

    fn lookup(&self, key: &str, properties: &HashMap<String, String>) -> Option<String> {
        properties
            .get(key)
            .cloned()
            .or_else(|| self.environment.property(key).map(str::to_owned))
            .or_else(|| std::env::var(key).ok())
    }

    /// Replaces `${name}` and `${name:-default}` references
    ///
    /// Undefined properties without a default are replaced by `name_IS_UNDEFINED`.
    pub(crate) fn substitute(&self, value: &str, properties: &HashMap<String, String>) -> String {
        let mut result = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            let Some(length) = closing_brace(&rest[start + 2..]) else {
                break;
            };
            result.push_str(&rest[..start]);

            let reference = &rest[start + 2..start + 2 + length];
            let (key, default) = match split_default(reference) {
                Some((key, default)) => (key, Some(default)),
                None => (reference, None),
            };
            let key = self.substitute(key, properties);
            match (self.lookup(&key, properties), default) {
                (Some(value), _) => result.push_str(&value),
                (None, Some(default)) => result.push_str(&self.substitute(default, properties)),
                (None, None) => {
                    result.push_str(&key);
                    result.push_str("_IS_UNDEFINED");
                }
            }

            rest = &rest[start + 2 + length + 1..];
        }
        result.push_str(rest);
        result
    }
}

/// Position of the `}` closing a reference, nested references are skipped
fn closing_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        match c {
            '$' if chars.next_if(|(_, next)| *next == '{').is_some() => depth += 1,
            '}' if depth == 0 => return Some(index),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Splits `key:-default` at the first `:-` outside of nested references
fn split_default(reference: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let bytes = reference.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'$' if bytes.get(index + 1) == Some(&b'{') => {
                depth += 1;
                index += 1;
            }
            b'}' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(index + 1) == Some(&b'-') => {
                return Some((&reference[..index], &reference[index + 2..]));
            }
            _ => {}
        }
        index += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::capture::EventsCapture;
    use access_event::AccessEvent;
    use test_log::test;

    fn configurator(environment: Environment, capture: &EventsCapture) -> Configurator {
        Configurator::new(environment).with_appender("CaptureAppender", capture.factory())
    }

    #[test]
    fn substitution() {
        let configurator = Configurator::new(Environment::new().with_property("app.name", "demo"));
        let mut properties = HashMap::new();
        properties.insert("dir".to_owned(), "logs".to_owned());

        assert_eq!(
            configurator.substitute("${dir}/${app.name}.log", &properties),
            "logs/demo.log"
        );
        assert_eq!(
            configurator.substitute("${missing:-fallback ${dir}}", &properties),
            "fallback logs"
        );
        assert_eq!(
            configurator.substitute("x${missing}y", &properties),
            "xmissing_IS_UNDEFINEDy"
        );
        assert_eq!(
            configurator.substitute("${a:-${b:-${dir}}}/x}", &properties),
            "logs/x}"
        );
        assert_eq!(
            configurator.substitute("${${name:-dir}}.log", &properties),
            "logs.log"
        );
        assert_eq!(configurator.substitute("${open", &properties), "${open");
        assert_eq!(configurator.substitute("${a:-${b}", &properties), "${a:-${b}");
        assert_eq!(configurator.substitute("plain", &properties), "plain");
    }

    #[test]
    fn elements() {
        let configurator = Configurator::default();
        let mut properties = HashMap::new();
        let document = roxmltree::Document::parse(
            r#"<configuration>
                <property name="pattern" value="%h %s" />
                <appender name="A" class="ConsoleAppender">
                    <encoder>
                        <pattern>${pattern}</pattern>
                    </encoder>
                </appender>
            </configuration>"#,
        )
        .unwrap();
        let elements = configurator
            .expand_children(document.root_element(), &mut properties)
            .unwrap();

        assert_eq!(elements.len(), 1);
        let appender = &elements[0];
        assert_eq!(appender.name, "appender");
        assert_eq!(appender.attribute("class"), Some("ConsoleAppender"));
        assert_eq!(
            appender
                .child("encoder")
                .and_then(|encoder| encoder.child_text("pattern")),
            Some("%h %s")
        );
        assert_eq!(properties.get("pattern").map(String::as_str), Some("%h %s"));
    }

    #[test]
    fn profiles_and_properties() {
        let content = r#"<configuration>
            <springProperty name="target" source="capture.name" defaultValue="DEFAULT" />
            <springProfile name="dev, staging">
                <appender name="${target}" class="CaptureAppender" />
                <appender-ref ref="${target}" />
            </springProfile>
            <springProfile name="!dev">
                <appender name="OTHER" class="CaptureAppender" />
                <springProfile name="prod">
                    <appender-ref ref="OTHER" />
                </springProfile>
            </springProfile>
            <springProfile name="">
                <appender-ref ref="UNDEFINED" />
            </springProfile>
        </configuration>"#;

        let capture = EventsCapture::new();
        let environment = Environment::new()
            .with_profile("dev")
            .with_property("capture.name", "DEV_CAPTURE");
        let configuration = configurator(environment, &capture)
            .configure("test.xml", content)
            .unwrap();
        assert_eq!(
            configuration.appenders.keys().collect::<Vec<_>>(),
            ["DEV_CAPTURE"]
        );
        assert_eq!(configuration.attached.len(), 1);

        let configuration = configurator(Environment::new().with_profile("prod"), &capture)
            .configure("test.xml", content)
            .unwrap();
        assert_eq!(
            configuration.appenders.keys().collect::<Vec<_>>(),
            ["OTHER"]
        );
        assert_eq!(configuration.attached.len(), 1);
        assert_eq!(configuration.attached[0].name(), "OTHER");

        let configuration = configurator(Environment::new().with_profile("qa"), &capture)
            .configure("test.xml", content)
            .unwrap();
        assert_eq!(
            configuration.appenders.keys().collect::<Vec<_>>(),
            ["OTHER"]
        );
        assert!(configuration.attached.is_empty());
    }

    #[test]
    fn filters() {
        let content = r#"<configuration>
            <filter class="RequestUriFilter">
                <pattern>/health</pattern>
                <onMatch>DENY</onMatch>
            </filter>
            <appender name="CAPTURE" class="CaptureAppender">
                <filter class="RequestHeaderFilter">
                    <header>X-Skip</header>
                    <onMatch>DENY</onMatch>
                </filter>
            </appender>
            <appender-ref ref="CAPTURE" />
            <unknown />
        </configuration>"#;

        let capture = EventsCapture::new();
        let configuration = configurator(Environment::new(), &capture)
            .configure("test.xml", content)
            .unwrap();
        assert_eq!(configuration.filters.len(), 1);

        let appender = &configuration.attached[0];
        appender.append(&AccessEvent::builder().request_header("X-Skip", "1").build());
        appender.append(&AccessEvent::builder().build());
        assert_eq!(capture.len(), 1);
    }

    #[test]
    fn invalid_configurations() {
        let capture = EventsCapture::new();
        let configurator = configurator(Environment::new(), &capture);

        assert!(matches!(
            configurator.configure("test.xml", "<configuration>"),
            Err(Error::Xml { .. })
        ));
        assert!(matches!(
            configurator.configure("test.xml", "<logging />"),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            configurator.configure(
                "test.xml",
                r#"<configuration><appender name="X" class="Unknown" /></configuration>"#
            ),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            configurator.configure(
                "test.xml",
                r#"<configuration><appender-ref ref="X" /></configuration>"#
            ),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            configurator.configure(
                "test.xml",
                r#"<configuration><springProfile name="a &amp; b | c" /></configuration>"#
            ),
            Err(Error::Invalid(_))
        ));

        // Appenders created before the error are stopped
        let result = configurator.configure(
            "test.xml",
            r#"<configuration>
                <appender name="CAPTURE" class="CaptureAppender" />
                <filter class="Unknown" />
            </configuration>"#,
        );
        assert!(result.is_err());
        assert!(capture.is_stopped());
    }
}
