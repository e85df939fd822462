// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Resolution
//!
//! Routing keys and queue names are derived from action patterns ("pins") so the
//! same configuration always produces the same broker topology. A pin such as
//! `role:order,cmd:create` becomes the routing key `cmd.create.role.order`: keys
//! are sorted and each `key.value` pair is joined with `.`.
//!
//! Everything in this module is pure and free of I/O.

use crate::errors::AmqpError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Separator between routing key segments
pub const TOPIC_SEPARATOR: &str = ".";
/// Single segment topic wildcard
pub const WILDCARD_ONE: &str = "*";
/// Zero-or-more segments topic wildcard
pub const WILDCARD_MANY: &str = "#";
/// Property carrying the framework metadata on action arguments
pub const META_PROPERTY: &str = "meta$";

/// A flat set of `key:value` constraints identifying which actions a
/// listener serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "RawPin")]
pub struct Pin(BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPin {
    Text(String),
    Fields(Map<String, Value>),
}

impl TryFrom<RawPin> for Pin {
    type Error = AmqpError;

    fn try_from(raw: RawPin) -> Result<Self, Self::Error> {
        match raw {
            RawPin::Text(text) => Pin::parse(&text),
            RawPin::Fields(fields) => Ok(Pin::from_fields(&fields)),
        }
    }
}

impl Pin {
    /// Parses the textual pin form `role:order,cmd:create`.
    pub fn parse(text: &str) -> Result<Pin, AmqpError> {
        let mut fields = BTreeMap::new();

        for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once(':') else {
                return Err(AmqpError::ConfigurationError(format!(
                    "pin segment `{}` is not a key:value pair",
                    pair
                )));
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(AmqpError::ConfigurationError(format!(
                    "pin segment `{}` has an empty key",
                    pair
                )));
            }

            fields.insert(key.to_owned(), value.trim().to_owned());
        }

        if fields.is_empty() {
            return Err(AmqpError::ConfigurationError(format!(
                "pin `{}` has no constraints",
                text
            )));
        }

        Ok(Pin(fields))
    }

    /// Builds a pin from a JSON object. Matcher values that are not scalars
    /// (e.g. `{"$exists": true}`) match anything and become a wildcard.
    pub fn from_json(value: &Value) -> Result<Pin, AmqpError> {
        match value {
            Value::Object(fields) if !fields.is_empty() => Ok(Pin::from_fields(fields)),
            Value::String(text) => Pin::parse(text),
            other => Err(AmqpError::ConfigurationError(format!(
                "pin must be a non-empty object, got `{}`",
                other
            ))),
        }
    }

    fn from_fields(fields: &Map<String, Value>) -> Pin {
        Pin(fields
            .iter()
            .map(|(k, v)| (k.clone(), segment(v)))
            .collect())
    }

    /// Whether the action arguments satisfy every constraint of this pin.
    pub fn matches(&self, args: &Value) -> bool {
        self.0.iter().all(|(key, expected)| match args.get(key) {
            Some(actual) => is_wildcard(expected) || segment(actual) == *expected,
            None => false,
        })
    }

    /// The routing key of this pin, wildcards included.
    pub fn topic(&self) -> String {
        self.0
            .iter()
            .flat_map(|(k, v)| [k.as_str(), v.as_str()])
            .collect::<Vec<_>>()
            .join(TOPIC_SEPARATOR)
    }

    /// Replaces the pin values with the concrete values carried by `args`.
    fn concrete(&self, args: &Value) -> Pin {
        Pin(self
            .0
            .iter()
            .map(|(k, v)| {
                let value = args
                    .get(k)
                    .filter(|a| a.is_string() || a.is_number() || a.is_boolean())
                    .map(segment)
                    .unwrap_or_else(|| v.clone());
                (k.clone(), value)
            })
            .collect())
    }
}

fn is_wildcard(value: &str) -> bool {
    value == WILDCARD_ONE || value == WILDCARD_MANY
}

fn segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_owned(),
        Value::Array(_) | Value::Object(_) => WILDCARD_ONE.to_owned(),
    }
}

/// Queue naming parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueNaming {
    pub prefix: String,
    pub separator: String,
}

impl Default for QueueNaming {
    fn default() -> Self {
        QueueNaming {
            prefix: "actions".to_owned(),
            separator: TOPIC_SEPARATOR.to_owned(),
        }
    }
}

/// Derives one routing key per pin, in pin order.
pub fn resolve_listen_topics(pins: &[Pin]) -> Vec<String> {
    pins.iter().map(Pin::topic).collect()
}

/// Derives the exact routing key an outgoing action is published under.
///
/// The matched pattern is taken from `meta$.pattern` when the framework
/// supplies it, otherwise from the first pin the arguments satisfy.
pub fn resolve_client_topic(args: &Value, pins: &[Pin]) -> Result<String, AmqpError> {
    let pattern = match args
        .get(META_PROPERTY)
        .and_then(|meta| meta.get("pattern"))
        .and_then(Value::as_str)
    {
        Some(text) => Pin::parse(text)?,
        None => pins
            .iter()
            .find(|pin| pin.matches(args))
            .cloned()
            .ok_or_else(|| AmqpError::UnmatchedAction(args.to_string()))?,
    };

    Ok(pattern.concrete(args).topic())
}

/// Builds `prefix + separator + suffix`. The suffix is mandatory; an empty
/// prefix still contributes its separator.
pub fn build_queue_name(suffix: &str, naming: &QueueNaming) -> Result<String, AmqpError> {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        return Err(AmqpError::ConfigurationError(
            "queue name suffix must not be empty".to_owned(),
        ));
    }

    Ok([naming.prefix.as_str(), suffix].join(&naming.separator))
}
