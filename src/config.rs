// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Configuration
//!
//! Raw configuration is deserialized with serde (typically from the host's JSON
//! settings) and then normalized exactly once per component into an immutable
//! [`Settings`] value. Normalization applies role defaults and validates the
//! mandatory naming fields, so configuration problems surface synchronously as
//! [`AmqpError::ConfigurationError`] before the channel is touched.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
    topic::{Pin, QueueNaming},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Default exchange shared by every transport
pub const DEFAULT_EXCHANGE_NAME: &str = "actions.topic";
/// Default number of unacknowledged deliveries per consumer
pub const DEFAULT_PREFETCH: u16 = 1;

/// The component a configuration is normalized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    RpcClient,
    RpcListener,
    PubSubPublisher,
    PubSubSubscriber,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub passive: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: true,
            auto_delete: false,
            internal: false,
            passive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            name: DEFAULT_EXCHANGE_NAME.to_owned(),
            kind: ExchangeKind::Topic,
            options: ExchangeOptions::default(),
        }
    }
}

/// Queue declaration options. Flags left unset take the role's rule when the
/// configuration is normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
    pub passive: bool,
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(flatten)]
    pub naming: QueueNaming,
    /// Fixed suffix for the RPC reply queue; random when absent.
    pub id: Option<String>,
    pub options: QueueOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub prefetch: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumeConfig {
    pub exclusive: bool,
    pub no_local: bool,
    pub consumer_tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub mandatory: bool,
    pub persistent: bool,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub app_id: Option<String>,
}

/// Raw, user supplied transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Logical name of a listener or subscriber, used as its queue suffix.
    pub name: Option<String>,
    pub pins: Vec<Pin>,
    pub exchange: ExchangeConfig,
    pub queues: QueueConfig,
    pub channel: ChannelConfig,
    pub consume: ConsumeConfig,
    pub publish: PublishConfig,
    /// Fixed correlation id for every outgoing message; random per call otherwise.
    pub correlation_id: Option<String>,
}

impl TransportConfig {
    /// Defaults for an RPC client: a private, exclusive, auto-deleted reply queue.
    pub fn rpc_client() -> Self {
        let mut cfg = TransportConfig::default();
        cfg.queues.options.exclusive = Some(true);
        cfg.queues.options.auto_delete = Some(true);
        cfg
    }

    /// Defaults for an RPC listener: a durable shared request queue.
    pub fn rpc_listener() -> Self {
        let mut cfg = TransportConfig::default();
        cfg.queues.options.durable = Some(true);
        cfg
    }

    pub fn pubsub_publisher() -> Self {
        TransportConfig::default()
    }

    /// Defaults for a subscriber: a durable queue shared by all its instances.
    pub fn pubsub_subscriber() -> Self {
        let mut cfg = TransportConfig::default();
        cfg.queues.options.durable = Some(true);
        cfg
    }

    /// Parses a JSON document on top of the role defaults.
    pub fn from_json(role: Role, raw: &str) -> Result<Self, AmqpError> {
        let overrides: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| AmqpError::ConfigurationError(e.to_string()))?;

        let mut merged = role_defaults(role);
        merge(&mut merged, overrides);

        serde_json::from_value(merged).map_err(|e| AmqpError::ConfigurationError(e.to_string()))
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn pin(mut self, pin: Pin) -> Self {
        self.pins.push(pin);
        self
    }

    pub fn exchange_name(mut self, name: &str) -> Self {
        self.exchange.name = name.to_owned();
        self
    }

    pub fn queue_naming(mut self, prefix: &str, separator: &str) -> Self {
        self.queues.naming = QueueNaming {
            prefix: prefix.to_owned(),
            separator: separator.to_owned(),
        };
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.channel.prefetch = prefetch;
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Validates the configuration for `role` and freezes it.
    ///
    /// Queue rules of the role are applied here, whatever way the
    /// configuration was built: listener and subscriber queues are always
    /// durable, the RPC reply queue is exclusive and auto-deleted unless
    /// configured otherwise.
    ///
    /// # Parameters
    /// * `role` - The component the settings are for
    ///
    /// # Returns
    /// Shared immutable settings, or a `ConfigurationError` naming the
    /// missing or invalid field
    pub fn normalize(self, role: Role) -> Result<Arc<Settings>, AmqpError> {
        let exchange_name = self.exchange.name.trim();
        if exchange_name.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "exchange name is mandatory".to_owned(),
            ));
        }

        if self.queues.naming.separator.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "queue separator must not be empty".to_owned(),
            ));
        }

        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned);

        match role {
            Role::PubSubSubscriber if name.is_none() => {
                return Err(AmqpError::ConfigurationError(
                    "'name' option is mandatory for subscribers".to_owned(),
                ))
            }
            Role::RpcListener | Role::PubSubSubscriber if self.pins.is_empty() => {
                return Err(AmqpError::ConfigurationError(
                    "at least one pin is required to listen".to_owned(),
                ))
            }
            _ => {}
        }

        let mut exchange = ExchangeDefinition::new(exchange_name).kind(self.exchange.kind);
        if self.exchange.options.durable {
            exchange = exchange.durable();
        }
        if self.exchange.options.auto_delete {
            exchange = exchange.delete();
        }
        if self.exchange.options.internal {
            exchange = exchange.internal();
        }
        if self.exchange.options.passive {
            exchange = exchange.passive();
        }

        let mut queue_options = self.queues.options;
        match role {
            Role::RpcListener | Role::PubSubSubscriber => queue_options.durable = Some(true),
            Role::RpcClient => {
                queue_options.exclusive.get_or_insert(true);
                queue_options.auto_delete.get_or_insert(true);
            }
            Role::PubSubPublisher => {}
        }

        Ok(Arc::new(Settings {
            name,
            pins: self.pins,
            exchange,
            naming: self.queues.naming,
            queue_id: self.queues.id,
            queue_options,
            prefetch: self.channel.prefetch,
            consume: self.consume,
            publish: self.publish,
            correlation_id: self.correlation_id,
        }))
    }
}

fn role_defaults(role: Role) -> serde_json::Value {
    match role {
        Role::RpcClient => json!({ "queues": { "options": { "exclusive": true, "auto_delete": true } } }),
        Role::RpcListener | Role::PubSubSubscriber => {
            json!({ "queues": { "options": { "durable": true } } })
        }
        Role::PubSubPublisher => json!({}),
    }
}

fn merge(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                merge(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, value) => *base = value,
    }
}

/// Normalized, immutable configuration of one transport component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub name: Option<String>,
    pub pins: Vec<Pin>,
    pub exchange: ExchangeDefinition,
    pub naming: QueueNaming,
    pub queue_id: Option<String>,
    pub queue_options: QueueOptions,
    pub prefetch: u16,
    pub consume: ConsumeConfig,
    pub publish: PublishConfig,
    pub correlation_id: Option<String>,
}

impl Settings {
    /// Applies the configured queue options to a queue called `name`.
    pub fn queue_definition(&self, name: &str) -> QueueDefinition {
        let opts = &self.queue_options;
        let mut def = QueueDefinition::new(name);

        if opts.durable.unwrap_or_default() {
            def = def.durable();
        }
        if opts.exclusive.unwrap_or_default() {
            def = def.exclusive();
        }
        if opts.auto_delete.unwrap_or_default() {
            def = def.delete();
        }
        if opts.passive {
            def = def.passive();
        }
        if let Some(ttl) = opts.message_ttl {
            def = def.ttl(ttl);
        }
        if let Some(max) = opts.max_length {
            def = def.max_length(max);
        }
        if let Some(max) = opts.max_length_bytes {
            def = def.max_length_bytes(max);
        }
        if let Some(exchange) = &opts.dead_letter_exchange {
            def = def.dead_letter(exchange, opts.dead_letter_routing_key.as_deref());
        }

        def
    }
}

/// Broker connection parameters used by [`crate::channel::new_amqp_channel`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "amqp-transport".to_owned(),
        }
    }
}

impl ConnectionConfig {
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "%2f",
            other => other.trim_start_matches('/'),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}
