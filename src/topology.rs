// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! A [`TopologyDescriptor`] captures everything one component needs on the broker:
//! its exchange, optionally a queue, and the routing keys that queue is bound
//! with. It is derived deterministically from the normalized settings, so
//! installing it again on every process start converges to the same broker
//! state. Installation stops at the first failure and does not clean up what was
//! already declared; channel closure is the recovery boundary.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Exchange, queue and bindings of one transport component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) routing_keys: Vec<String>,
}

/// Names the broker confirmed while installing a topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub exchange: String,
    pub queue: Option<String>,
}

impl TopologyDescriptor {
    pub fn new(exchange: ExchangeDefinition) -> TopologyDescriptor {
        TopologyDescriptor {
            exchange,
            queue: None,
            routing_keys: vec![],
        }
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = Some(def);
        self
    }

    pub fn routing_keys(mut self, keys: Vec<String>) -> Self {
        self.routing_keys = keys;
        self
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_ref().map(QueueDefinition::name)
    }

    /// One binding per routing key, in order.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        let Some(queue) = &self.queue else {
            return vec![];
        };

        self.routing_keys
            .iter()
            .map(|key| {
                QueueBinding::new(&queue.name)
                    .exchange(&self.exchange.name)
                    .routing_key(key)
            })
            .collect()
    }

    /// Declares the exchange, then the queue, then every binding.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<DeclaredTopology, AmqpError> {
        let exchange = channel.assert_exchange(&self.exchange).await?;

        let Some(def) = &self.queue else {
            return Ok(DeclaredTopology {
                exchange,
                queue: None,
            });
        };

        let queue = channel.assert_queue(def).await?;

        for key in &self.routing_keys {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue, exchange, key
            );
            channel.bind_queue(&queue, &exchange, key).await?;
        }

        Ok(DeclaredTopology {
            exchange,
            queue: Some(queue),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::predicate::eq;

    fn descriptor() -> TopologyDescriptor {
        TopologyDescriptor::new(ExchangeDefinition::new("app.topic").durable())
            .queue(QueueDefinition::new("app.orders").durable())
            .routing_keys(vec![
                "cmd.create.role.order".to_owned(),
                "cmd.cancel.role.order".to_owned(),
            ])
    }

    #[tokio::test]
    async fn declares_exchange_queue_and_every_binding() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_assert_exchange()
            .times(1)
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_assert_queue()
            .times(1)
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_bind_queue()
            .with(eq("app.orders"), eq("app.topic"), eq("cmd.create.role.order"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_bind_queue()
            .with(eq("app.orders"), eq("app.topic"), eq("cmd.cancel.role.order"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let declared = descriptor().install(&channel).await.unwrap();

        assert_eq!(declared.exchange, "app.topic");
        assert_eq!(declared.queue.as_deref(), Some("app.orders"));
    }

    #[tokio::test]
    async fn exchange_only_topology_declares_no_queue() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_assert_exchange()
            .times(1)
            .returning(|def| Ok(def.name().to_owned()));
        channel.expect_assert_queue().never();
        channel.expect_bind_queue().never();

        let declared = TopologyDescriptor::new(ExchangeDefinition::new("app.topic"))
            .install(&channel)
            .await
            .unwrap();

        assert_eq!(declared.queue, None);
    }

    #[tokio::test]
    async fn queue_failure_stops_before_binding() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_assert_exchange()
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_assert_queue()
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));
        channel.expect_bind_queue().never();

        let err = descriptor().install(&channel).await.unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("app.orders".to_owned()));
    }

    #[test]
    fn bindings_follow_routing_key_order() {
        let bindings = descriptor().bindings();

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].routing_key, "cmd.create.role.order");
        assert_eq!(bindings[1].queue_name, "app.orders");
        assert_eq!(bindings[1].exchange_name, "app.topic");
    }
}
