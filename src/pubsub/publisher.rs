// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub Publisher
//!
//! Fire-and-forget broadcasting of actions to the topic exchange. A publish
//! resolves once the channel accepted the message; whether any subscriber
//! receives or handles it is never observed.

use crate::{
    channel::AmqpChannel,
    config::{Role, Settings, TransportConfig},
    errors::AmqpError,
    publisher,
    state::{Lifecycle, State},
    topic::resolve_client_topic,
    topology::TopologyDescriptor,
};
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// Setup of a pub/sub publisher. Only the exchange is declared: which queues
/// exist is up to the subscribers.
pub struct PubSubPublisher {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
}

impl PubSubPublisher {
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        config: TransportConfig,
    ) -> Result<PubSubPublisher, AmqpError> {
        Ok(PubSubPublisher {
            channel,
            settings: config.normalize(Role::PubSubPublisher)?,
        })
    }

    pub fn topology(&self) -> TopologyDescriptor {
        TopologyDescriptor::new(self.settings.exchange.clone())
    }

    pub async fn start(self) -> Result<PubSubClient, AmqpError> {
        let lifecycle = Lifecycle::new();
        let declared = self.topology().install(self.channel.as_ref()).await?;
        lifecycle.advance(State::TopologyDeclared);
        lifecycle.advance(State::Ready);

        debug!("pubsub publisher ready on {}", declared.exchange);

        Ok(PubSubClient {
            channel: self.channel,
            settings: self.settings,
            exchange: declared.exchange,
            lifecycle,
        })
    }
}

/// A started fire-and-forget publisher.
#[derive(Clone)]
pub struct PubSubClient {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
    exchange: String,
    lifecycle: Lifecycle,
}

impl PubSubClient {
    /// Publishes `args` under the routing key of its pattern.
    ///
    /// A correlation id is attached for tracing only; no reply is expected.
    ///
    /// # Parameters
    /// * `args` - The action arguments; the pattern comes from `meta$.pattern`
    ///   or the first matching configured pin
    ///
    /// # Returns
    /// Ok(()) once the channel accepted the message, `UnmatchedAction` when no
    /// routing key can be derived, or the publishing error
    pub async fn publish(&self, args: &Value) -> Result<(), AmqpError> {
        let topic = resolve_client_topic(args, &self.settings.pins)?;
        let payload = publisher::to_payload(args)?;

        let mut props = publisher::properties(&self.settings.publish, &Context::current());
        props.correlation_id = Some(publisher::correlation_id(&self.settings));

        debug!("publishing to {} with key {}", self.exchange, topic);

        self.channel
            .publish(&self.exchange, &topic, &payload, &props)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                err
            })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn state(&self) -> State {
        self.lifecycle.get()
    }
}
