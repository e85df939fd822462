// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Listener
//!
//! Serves requests from a shared queue bound to the routing keys of its pins.
//! Every request is dispatched to the host framework and its outcome is sent
//! back to the request's `reply_to` queue through the default exchange, with
//! the request's correlation id. The request is acknowledged once the reply was
//! accepted by the channel.

use crate::{
    channel::{AmqpChannel, InboundMessage, JSON_CONTENT_TYPE},
    config::{Role, Settings, TransportConfig},
    consumer::{self, parse_payload, ConsumerHandle, DeliveryHandler},
    dispatch::{DispatchError, Dispatcher},
    errors::AmqpError,
    publisher::{self, ERROR_REPLY_KIND},
    state::{Lifecycle, State},
    topic::{build_queue_name, resolve_listen_topics},
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default exchange, addressing queues directly by name
const DEFAULT_EXCHANGE: &str = "";

struct RequestHandler {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl RequestHandler {
    async fn reply(
        &self,
        ctx: &Context,
        request: &InboundMessage,
        reply_to: &str,
        body: &Value,
        kind: Option<&str>,
    ) -> Result<(), AmqpError> {
        let payload = publisher::to_payload(body)?;

        let mut props = publisher::properties(&self.settings.publish, ctx);
        props.correlation_id = request.correlation_id.clone();
        props.content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned());
        props.kind = kind.map(str::to_owned);

        self.channel
            .publish(DEFAULT_EXCHANGE, reply_to, &payload, &props)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing reply");
                err
            })
    }
}

#[async_trait]
impl DeliveryHandler for RequestHandler {
    fn name(&self) -> &str {
        "rpc request"
    }

    async fn handle(&self, ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError> {
        let payload = parse_payload(msg)?;

        let (body, kind) = match self.dispatcher.dispatch(ctx, payload).await {
            Ok(result) => (result, None),
            Err(DispatchError::Failed(reason)) => (reason, Some(ERROR_REPLY_KIND)),
            Err(DispatchError::Aborted(reason)) => return Err(AmqpError::Dispatch(reason)),
        };

        let Some(reply_to) = msg.reply_to.as_deref() else {
            warn!(
                routing_key = %msg.routing_key,
                "request has no reply_to, dropping the result"
            );
            return Ok(());
        };

        self.reply(ctx, msg, reply_to, &body, kind).await
    }
}

/// Setup of an RPC listener.
pub struct RpcListener {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
    dispatcher: Arc<dyn Dispatcher>,
    lifecycle: Lifecycle,
}

impl RpcListener {
    /// Creates the setup of an RPC listener.
    ///
    /// # Parameters
    /// * `channel` - An open channel, shared with other components
    /// * `config` - Raw configuration; at least one pin is required
    /// * `dispatcher` - Produces the reply of every request
    ///
    /// # Returns
    /// The listener setup, or a `ConfigurationError` before any broker call
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        config: TransportConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<RpcListener, AmqpError> {
        Ok(RpcListener {
            channel,
            settings: config.normalize(Role::RpcListener)?,
            dispatcher,
            lifecycle: Lifecycle::new(),
        })
    }

    /// The request queue is named after the listener, or after its routing keys
    /// when it has no name, so every instance serving the same pins shares it.
    pub fn topology(&self) -> Result<TopologyDescriptor, AmqpError> {
        let routing_keys = resolve_listen_topics(&self.settings.pins);
        let suffix = match &self.settings.name {
            Some(name) => name.clone(),
            None => routing_keys.join(&self.settings.naming.separator),
        };
        let queue = build_queue_name(&suffix, &self.settings.naming)?;

        Ok(TopologyDescriptor::new(self.settings.exchange.clone())
            .queue(self.settings.queue_definition(&queue))
            .routing_keys(routing_keys))
    }

    pub fn state(&self) -> State {
        self.lifecycle.get()
    }

    /// Declares the topology, applies prefetch and starts serving requests.
    pub async fn listen(self) -> Result<ConsumerHandle, AmqpError> {
        let declared = self.topology()?.install(self.channel.as_ref()).await?;
        self.lifecycle.advance(State::TopologyDeclared);

        let queue = declared.queue.ok_or_else(|| {
            AmqpError::DeclareQueueError("request queue was not declared".to_owned())
        })?;

        self.channel.prefetch(self.settings.prefetch).await?;

        debug!("rpc listener serving {}", queue);

        consumer::spawn_consumer(
            self.channel.clone(),
            self.lifecycle,
            &queue,
            self.settings.prefetch,
            consumer::consume_options(&self.settings, &queue),
            Arc::new(RequestHandler {
                channel: self.channel,
                settings: self.settings,
                dispatcher: self.dispatcher,
            }),
        )
        .await
    }
}
