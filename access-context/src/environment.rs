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

//! Host application environment: active profiles and properties

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::Error;

/// Profile considered active if no profiles are configured explicitly
pub const DEFAULT_PROFILE: &str = "default";

/// Environment of the application embedding the access log
///
/// Configuration files can restrict sections to certain profiles via `<springProfile>` and read
/// properties via `<springProperty>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Environment {
    /// Active profiles
    pub profiles: Vec<String>,
    /// Application properties
    pub properties: BTreeMap<String, String>,
}

impl Environment {
    /// Creates an environment without profiles or properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Activates a profile
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.push(profile.into());
        self
    }

    /// Sets a property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Looks up a property
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn is_active(&self, profile: &str) -> bool {
        if self.profiles.is_empty() {
            profile == DEFAULT_PROFILE
        } else {
            self.profiles.iter().any(|active| active == profile)
        }
    }

    /// Checks whether any of the profile expressions matches the active profiles
    ///
    /// Expressions consist of profile names combined with `!`, `&`, `|` and parentheses. Mixing
    /// `&` and `|` requires parentheses. An empty list of expressions is never accepted.
    pub fn accepts_profiles<S: AsRef<str>>(&self, expressions: &[S]) -> Result<bool, Error> {
        let mut accepted = false;
        for expression in expressions {
            let expression = expression.as_ref();
            let tokens = tokenize(expression);
            let mut parser = Parser {
                expression,
                tokens: &tokens,
                position: 0,
            };
            let result = parser.expression(self)?;
            if parser.position != tokens.len() {
                return Err(parser.malformed());
            }
            accepted |= result;
        }
        Ok(accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Name(&'a str),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(expression: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (index, c) in expression.char_indices() {
        let token = match c {
            '!' => Some(Token::Not),
            '&' => Some(Token::And),
            '|' => Some(Token::Or),
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            c if c.is_whitespace() => None,
            _ => {
                if start.is_none() {
                    start = Some(index);
                }
                continue;
            }
        };
        if let Some(start) = start.take() {
            tokens.push(Token::Name(&expression[start..index]));
        }
        tokens.extend(token);
    }
    if let Some(start) = start {
        tokens.push(Token::Name(&expression[start..]));
    }
    tokens
}

struct Parser<'a, 'b> {
    expression: &'a str,
    tokens: &'b [Token<'a>],
    position: usize,
}

impl<'a, 'b> Parser<'a, 'b> {
    fn malformed(&self) -> Error {
        Error::invalid(format!("malformed profile expression {:?}", self.expression))
    }

    fn peek(&self) -> Option<&'b Token<'a>> {
        self.tokens.get(self.position)
    }

    fn expression(&mut self, environment: &Environment) -> Result<bool, Error> {
        let mut result = self.operand(environment)?;
        let mut operator = None;
        while let Some(token) = self.peek() {
            let token = token.clone();
            if token != Token::And && token != Token::Or {
                break;
            }
            if operator.as_ref().is_some_and(|operator| *operator != token) {
                return Err(self.malformed());
            }
            self.position += 1;
            let operand = self.operand(environment)?;
            result = if token == Token::And {
                result && operand
            } else {
                result || operand
            };
            operator = Some(token);
        }
        Ok(result)
    }

    fn operand(&mut self, environment: &Environment) -> Result<bool, Error> {
        let token = self.peek().cloned().ok_or_else(|| self.malformed())?;
        self.position += 1;
        match token {
            Token::Name(name) => Ok(environment.is_active(name)),
            Token::Not => Ok(!self.operand(environment)?),
            Token::Open => {
                let result = self.expression(environment)?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.malformed());
                }
                self.position += 1;
                Ok(result)
            }
            Token::And | Token::Or | Token::Close => Err(self.malformed()),
        }
    }
}
