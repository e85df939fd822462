// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory [`AmqpChannel`] used by the unit tests.
//!
//! Publishes are routed to bound queues with topic matching (or straight to a
//! queue through the default exchange) and pushed to whoever consumes that
//! queue. Every broker call is recorded so tests can assert on it.

use crate::{
    channel::{AmqpChannel, ConsumeOptions, DeliveryStream, InboundMessage, PublishProperties},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

type Sender = UnboundedSender<Result<InboundMessage, AmqpError>>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
struct Broker {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: BTreeSet<(String, String, String)>,
    consumers: HashMap<String, Sender>,
    exchange_calls: usize,
    queue_calls: usize,
    bind_calls: Vec<(String, String, String)>,
    published: Vec<Published>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool, bool)>,
    prefetch: Vec<u16>,
    failing: HashSet<&'static str>,
}

#[derive(Default)]
pub(crate) struct MemoryChannel {
    broker: Mutex<Broker>,
    tags: AtomicU64,
}

impl MemoryChannel {
    pub fn new() -> Self {
        MemoryChannel::default()
    }

    /// Makes every later call of `op` fail.
    pub fn fail(&self, op: &'static str) {
        self.broker.lock().unwrap().failing.insert(op);
    }

    fn check(&self, op: &'static str) -> Result<(), AmqpError> {
        if self.broker.lock().unwrap().failing.contains(op) {
            return Err(AmqpError::ChannelError(format!("{} refused", op)));
        }
        Ok(())
    }

    /// Pushes a raw delivery to the consumer of `queue`.
    pub fn deliver(&self, queue: &str, mut msg: InboundMessage) -> u64 {
        let tag = self.tags.fetch_add(1, Ordering::SeqCst) + 1;
        msg.delivery_tag = tag;
        let broker = self.broker.lock().unwrap();
        if let Some(tx) = broker.consumers.get(queue) {
            let _ = tx.send(Ok(msg));
        }
        tag
    }

    /// Reports a channel fault on the consumer of `queue`.
    pub fn fault(&self, queue: &str, err: AmqpError) {
        let broker = self.broker.lock().unwrap();
        if let Some(tx) = broker.consumers.get(queue) {
            let _ = tx.send(Err(err));
        }
    }

    pub fn exchange_count(&self) -> usize {
        self.broker.lock().unwrap().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.broker.lock().unwrap().queues.len()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.broker.lock().unwrap().queues.get(name).cloned()
    }

    pub fn exchange_calls(&self) -> usize {
        self.broker.lock().unwrap().exchange_calls
    }

    pub fn queue_calls(&self) -> usize {
        self.broker.lock().unwrap().queue_calls
    }

    pub fn bind_calls(&self) -> Vec<(String, String, String)> {
        self.broker.lock().unwrap().bind_calls.clone()
    }

    pub fn binding_count(&self) -> usize {
        self.broker.lock().unwrap().bindings.len()
    }

    pub fn published(&self) -> Vec<Published> {
        self.broker.lock().unwrap().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.broker.lock().unwrap().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool, bool)> {
        self.broker.lock().unwrap().nacks.clone()
    }

    pub fn prefetch_calls(&self) -> Vec<u16> {
        self.broker.lock().unwrap().prefetch.clone()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.broker.lock().unwrap().consumers.contains_key(queue)
    }

    /// Waits until `count` deliveries have been acked or nacked.
    pub async fn settled(&self, count: usize) {
        self.wait_until(|b| b.acks.len() + b.nacks.len() >= count)
            .await;
    }

    /// Waits until `count` messages have been published.
    pub async fn published_at_least(&self, count: usize) {
        self.wait_until(|b| b.published.len() >= count).await;
    }

    async fn wait_until(&self, done: impl Fn(&Broker) -> bool) {
        for _ in 0..200 {
            if done(&self.broker.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<String, AmqpError> {
        self.check("assert_exchange")?;
        let mut broker = self.broker.lock().unwrap();
        broker.exchange_calls += 1;
        match broker.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                broker.exchanges.insert(def.name.clone(), def.clone());
                Ok(def.name.clone())
            }
        }
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.check("assert_queue")?;
        let mut broker = self.broker.lock().unwrap();
        broker.queue_calls += 1;
        match broker.queues.get(&def.name) {
            Some(existing) if existing != def => Err(AmqpError::DeclareQueueError(def.name.clone())),
            _ => {
                broker.queues.insert(def.name.clone(), def.clone());
                Ok(def.name.clone())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.check("bind_queue")?;
        let mut broker = self.broker.lock().unwrap();
        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        broker.bind_calls.push(binding.clone());
        broker.bindings.insert(binding);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        self.check("publish")?;
        let mut broker = self.broker.lock().unwrap();
        broker.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            broker
                .bindings
                .iter()
                .filter(|(_, ex, pattern)| ex == exchange && topic_matches(pattern, routing_key))
                .map(|(queue, _, _)| queue.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        for queue in targets {
            if let Some(tx) = broker.consumers.get(&queue) {
                let msg = InboundMessage {
                    delivery_tag: self.tags.fetch_add(1, Ordering::SeqCst) + 1,
                    payload: payload.to_vec(),
                    content_type: Some(properties.content_type.clone()),
                    correlation_id: properties.correlation_id.clone(),
                    reply_to: properties.reply_to.clone(),
                    kind: properties.kind.clone(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    headers: properties.headers.clone(),
                };
                let _ = tx.send(Ok(msg));
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        self.check("consume")?;
        let (tx, rx) = unbounded_channel();
        self.broker
            .lock()
            .unwrap()
            .consumers
            .insert(queue.to_owned(), tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.check("ack")?;
        self.broker.lock().unwrap().acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.check("nack")?;
        self.broker
            .lock()
            .unwrap()
            .nacks
            .push((delivery_tag, multiple, requeue));
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.check("prefetch")?;
        self.broker.lock().unwrap().prefetch.push(count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("cmd.sum.role.math", "cmd.sum.role.math"));
        assert!(topic_matches("cmd.*.role.math", "cmd.sum.role.math"));
        assert!(topic_matches("cmd.#", "cmd.sum.role.math"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("cmd.*", "cmd.sum.role.math"));
        assert!(!topic_matches("cmd.sum.role.user", "cmd.sum.role.math"));
    }
}
