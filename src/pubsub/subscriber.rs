// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Pub/sub subscriber.
//!
//! Handling is fail fast: a message that cannot be parsed or whose dispatch
//! fails is rejected without requeue and never comes back. Retries are left to
//! broker side dead-lettering.

use crate::{
    channel::{AmqpChannel, InboundMessage},
    config::{Role, Settings, TransportConfig},
    consumer::{self, parse_payload, ConsumerHandle, DeliveryHandler},
    dispatch::{DispatchError, Dispatcher},
    errors::AmqpError,
    state::{Lifecycle, State},
    topic::{build_queue_name, resolve_listen_topics},
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;

struct EventHandler {
    dispatcher: Arc<dyn Dispatcher>,
}

#[async_trait]
impl DeliveryHandler for EventHandler {
    fn name(&self) -> &str {
        "pubsub event"
    }

    async fn handle(&self, ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError> {
        let payload = parse_payload(msg)?;

        match self.dispatcher.dispatch(ctx, payload).await {
            Ok(_) => Ok(()),
            Err(DispatchError::Failed(reason)) => Err(AmqpError::Dispatch(reason.to_string())),
            Err(DispatchError::Aborted(reason)) => Err(AmqpError::Dispatch(reason)),
        }
    }
}

/// Setup of a pub/sub subscriber.
pub struct PubSubSubscriber {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
    dispatcher: Arc<dyn Dispatcher>,
    lifecycle: Lifecycle,
}

impl PubSubSubscriber {
    /// Creates the setup of a subscriber.
    ///
    /// # Parameters
    /// * `channel` - An open channel, shared with other components
    /// * `config` - Raw configuration; `name` and at least one pin are required
    /// * `dispatcher` - Receives every parsed message; its result is discarded
    ///
    /// # Returns
    /// The subscriber setup, or a `ConfigurationError` before any broker call
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        config: TransportConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<PubSubSubscriber, AmqpError> {
        Ok(PubSubSubscriber {
            channel,
            settings: config.normalize(Role::PubSubSubscriber)?,
            dispatcher,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn topology(&self) -> Result<TopologyDescriptor, AmqpError> {
        let name = self.settings.name.as_deref().ok_or_else(|| {
            AmqpError::ConfigurationError("'name' option is mandatory for subscribers".to_owned())
        })?;
        let queue = build_queue_name(name, &self.settings.naming)?;

        Ok(TopologyDescriptor::new(self.settings.exchange.clone())
            .queue(self.settings.queue_definition(&queue))
            .routing_keys(resolve_listen_topics(&self.settings.pins)))
    }

    pub fn state(&self) -> State {
        self.lifecycle.get()
    }

    /// Declares the exchange and the durable queue, binds every routing key,
    /// applies prefetch and starts consuming.
    pub async fn listen(self) -> Result<ConsumerHandle, AmqpError> {
        let declared = self.topology()?.install(self.channel.as_ref()).await?;
        self.lifecycle.advance(State::TopologyDeclared);

        let queue = declared.queue.ok_or_else(|| {
            AmqpError::DeclareQueueError("subscriber queue was not declared".to_owned())
        })?;

        self.channel.prefetch(self.settings.prefetch).await?;

        debug!("subscriber consuming {}", queue);

        consumer::spawn_consumer(
            self.channel.clone(),
            self.lifecycle,
            &queue,
            self.settings.prefetch,
            consumer::consume_options(&self.settings, &queue),
            Arc::new(EventHandler {
                dispatcher: self.dispatcher,
            }),
        )
        .await
    }
}
