//! Declarative rule definitions.
//!
//! A definition names a selector and, optionally, the handlers to call on
//! enter/exit. Handlers are registered in code under a name; definitions can
//! then come from configuration:
//!
//! ```json
//! [{ "selector": ".tooltip", "matches": "attach-tooltip", "unmatches": "detach-tooltip" }]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DeclError, DeclResult, ValidationError};
use crate::tree::Selector;

use super::{Callback, Rule};

/// A selector rule with named callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Selector the rule matches.
    pub selector: Selector,
    /// Handler invoked when a node enters the match set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
    /// Handler invoked when a node leaves the match set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmatches: Option<String>,
}

impl RuleDefinition {
    /// Creates a definition with no handlers.
    #[must_use]
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            matches: None,
            unmatches: None,
        }
    }

    /// Checks the shape of one JSON rule object.
    ///
    /// A missing or non-string `selector` is an `InvalidMatcherType`; a
    /// non-string `matches`/`unmatches` is an `InvalidCallbackType`.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let Some(object) = value.as_object() else {
            return Err(ValidationError::InvalidRuleType {
                reason: format!("rule definition must be an object, got {value}"),
            });
        };

        let selector = match object.get("selector") {
            Some(Value::String(s)) => Selector::new(s.as_str())?,
            Some(other) => {
                return Err(ValidationError::matcher(format!(
                    "selector must be a string, got {other}"
                )))
            }
            None => return Err(ValidationError::matcher("selector is required")),
        };

        if let Some(unknown) = object
            .keys()
            .find(|k| !matches!(k.as_str(), "selector" | "matches" | "unmatches"))
        {
            return Err(ValidationError::InvalidRuleType {
                reason: format!("unknown field '{unknown}'"),
            });
        }

        Ok(Self {
            selector,
            matches: handler_name(object, "matches")?,
            unmatches: handler_name(object, "unmatches")?,
        })
    }

    /// Accepts either a single rule object or an array of them.
    pub fn list_from_value(value: &Value) -> Result<Vec<Self>, ValidationError> {
        match value {
            Value::Array(items) => items.iter().map(Self::from_value).collect(),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    /// Parses JSON text holding one rule or an array of rules.
    pub fn from_json_str(json: &str) -> DeclResult<Vec<Self>> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| DeclError::config(format!("invalid rule definitions: {e}")))?;
        Ok(Self::list_from_value(&value)?)
    }
}

fn handler_name(object: &Map<String, Value>, field: &str) -> Result<Option<String>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) if !name.trim().is_empty() => Ok(Some(name.trim().to_string())),
        Some(Value::String(_)) => Err(ValidationError::callback(field, "handler name must not be empty")),
        Some(other) => Err(ValidationError::callback(
            field,
            format!("expected a handler name, got {other}"),
        )),
    }
}

/// Named callbacks that definitions refer to.
pub struct HandlerRegistry<N> {
    handlers: HashMap<String, Callback<N>>,
}

impl<N> Default for HandlerRegistry<N> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<N> fmt::Debug for HandlerRegistry<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl<N> HandlerRegistry<N>
where
    N: Clone + PartialEq + 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a handler.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&N) + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Returns true if a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn lookup(&self, field: &str, name: Option<&String>) -> Result<Option<Callback<N>>, ValidationError> {
        match name {
            None => Ok(None),
            Some(name) => self
                .handlers
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| ValidationError::callback(field, format!("no handler named '{name}'"))),
        }
    }

    /// Builds a rule from a definition, resolving handler names.
    pub fn resolve(&self, definition: &RuleDefinition) -> Result<Arc<Rule<N>>, ValidationError> {
        let on_match = self.lookup("matches", definition.matches.as_ref())?;
        let on_unmatch = self.lookup("unmatches", definition.unmatches.as_ref())?;

        Rule::builder()
            .matcher(super::Matcher::Selector(definition.selector.clone()))
            .on_match_shared(on_match)
            .on_unmatch_shared(on_unmatch)
            .build()
    }

    /// Checks and resolves a JSON rule object or array.
    pub fn load(&self, value: &Value) -> Result<Vec<Arc<Rule<N>>>, ValidationError> {
        RuleDefinition::list_from_value(value)?
            .iter()
            .map(|d| self.resolve(d))
            .collect()
    }
}
