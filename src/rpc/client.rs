// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! [`RpcPublisher`] declares the exchange and a private reply queue, then starts
//! consuming replies. The resulting [`RpcClient`] publishes requests and pairs
//! every reply with its call purely by correlation id; transport ordering plays
//! no part.
//!
//! Calls have no built-in timeout. A caller that gives up on a call must release
//! it with [`RpcClient::cancel`] (or use [`RpcClient::act_timeout`], which does so
//! itself); [`RpcClient::sweep_expired`] drops calls older than a given age.

use crate::{
    channel::{AmqpChannel, InboundMessage},
    config::{Role, Settings, TransportConfig},
    consumer::{self, parse_payload, ConsumerHandle, DeliveryHandler},
    errors::AmqpError,
    publisher::{self, ERROR_REPLY_KIND},
    state::{Lifecycle, State},
    topic::{build_queue_name, resolve_client_topic},
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

type Responder = oneshot::Sender<Result<Value, AmqpError>>;

/// An RPC call waiting for its reply.
#[derive(Debug)]
struct PendingCall {
    responder: Responder,
    created_at: Instant,
}

/// Calls in flight, keyed by correlation id.
///
/// Entries are removed under the lock and completed after it is released, so a
/// caller reacting to its reply can immediately use the table again.
#[derive(Debug, Clone, Default)]
struct PendingCalls(Arc<Mutex<HashMap<String, PendingCall>>>);

impl PendingCalls {
    async fn register(
        &self,
        correlation_id: &str,
    ) -> Result<oneshot::Receiver<Result<Value, AmqpError>>, AmqpError> {
        let mut calls = self.0.lock().await;
        if calls.contains_key(correlation_id) {
            return Err(AmqpError::ConfigurationError(format!(
                "correlation id `{}` is already in flight",
                correlation_id
            )));
        }

        let (responder, receiver) = oneshot::channel();
        calls.insert(
            correlation_id.to_owned(),
            PendingCall {
                responder,
                created_at: Instant::now(),
            },
        );

        Ok(receiver)
    }

    async fn take(&self, correlation_id: &str) -> Option<PendingCall> {
        self.0.lock().await.remove(correlation_id)
    }

    async fn resolve(&self, correlation_id: &str, result: Result<Value, AmqpError>) -> bool {
        match self.take(correlation_id).await {
            Some(call) => {
                let _ = call.responder.send(result);
                true
            }
            None => false,
        }
    }

    async fn reject_all(&self, err: &AmqpError) -> usize {
        let drained: Vec<PendingCall> = self.0.lock().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();

        for call in drained {
            let _ = call.responder.send(Err(err.clone()));
        }

        count
    }

    async fn expire(&self, max_age: Duration) -> usize {
        let expired: Vec<(String, PendingCall)> = {
            let mut calls = self.0.lock().await;
            let ids: Vec<String> = calls
                .iter()
                .filter(|(_, call)| call.created_at.elapsed() >= max_age)
                .map(|(id, _)| id.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|call| (id, call)))
                .collect()
        };
        let count = expired.len();

        for (id, call) in expired {
            let _ = call.responder.send(Err(AmqpError::Cancelled(id)));
        }

        count
    }

    async fn len(&self) -> usize {
        self.0.lock().await.len()
    }
}

/// Routes replies to the pending calls of one client.
struct ReplyHandler {
    pending: PendingCalls,
}

#[async_trait]
impl DeliveryHandler for ReplyHandler {
    fn name(&self) -> &str {
        "rpc reply"
    }

    async fn handle(&self, _ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError> {
        let Some(correlation_id) = msg.correlation_id.as_deref() else {
            warn!("dropping reply without correlation id");
            return Ok(());
        };

        let parsed = parse_payload(msg);
        let outcome = match &parsed {
            Ok(value) if msg.kind.as_deref() == Some(ERROR_REPLY_KIND) => {
                Err(AmqpError::Remote(value.clone()))
            }
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(err.clone()),
        };

        if !self.pending.resolve(correlation_id, outcome).await {
            warn!(
                correlation_id = correlation_id,
                "dropping reply with unmatched correlation id"
            );
            return Ok(());
        }

        debug!("reply {} delivered", correlation_id);
        parsed.map(|_| ())
    }

    async fn on_channel_error(&self, err: &AmqpError) {
        let rejected = self.pending.reject_all(err).await;
        if rejected > 0 {
            error!(
                error = err.to_string(),
                rejected = rejected,
                "rejected pending calls after channel fault"
            );
        }
    }
}

/// Setup of an RPC client.
pub struct RpcPublisher {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
    reply_queue: String,
    lifecycle: Lifecycle,
}

impl RpcPublisher {
    /// Creates the setup of an RPC client.
    ///
    /// The reply queue name is fixed here: `queues.id` when configured, a
    /// random UUID otherwise.
    ///
    /// # Parameters
    /// * `channel` - An open channel, shared with other components
    /// * `config` - Raw configuration, normalized for [`Role::RpcClient`]
    ///
    /// # Returns
    /// The client setup, or a `ConfigurationError` before any broker call
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        config: TransportConfig,
    ) -> Result<RpcPublisher, AmqpError> {
        let settings = config.normalize(Role::RpcClient)?;
        let id = settings
            .queue_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reply_queue = build_queue_name(&id, &settings.naming)?;

        Ok(RpcPublisher {
            channel,
            settings,
            reply_queue,
            lifecycle: Lifecycle::new(),
        })
    }

    /// The exchange and private reply queue this client declares.
    pub fn topology(&self) -> Result<TopologyDescriptor, AmqpError> {
        Ok(TopologyDescriptor::new(self.settings.exchange.clone())
            .queue(self.settings.queue_definition(&self.reply_queue)))
    }

    /// Declares the topology and starts consuming replies.
    ///
    /// # Returns
    /// A started client, or the first declaration or consume error. Nothing
    /// already declared is cleaned up on failure.
    pub async fn start(self) -> Result<RpcClient, AmqpError> {
        let topology = self.topology()?;

        self.channel.prefetch(self.settings.prefetch).await?;
        let declared = topology.install(self.channel.as_ref()).await?;
        self.lifecycle.advance(State::TopologyDeclared);

        let reply_queue = declared.queue.ok_or_else(|| {
            AmqpError::DeclareQueueError("reply queue was not declared".to_owned())
        })?;

        let pending = PendingCalls::default();
        let consumer = consumer::spawn_consumer(
            self.channel.clone(),
            self.lifecycle.clone(),
            &reply_queue,
            self.settings.prefetch,
            consumer::consume_options(&self.settings, &reply_queue),
            Arc::new(ReplyHandler {
                pending: pending.clone(),
            }),
        )
        .await?;

        debug!("rpc client consuming replies on {}", reply_queue);

        Ok(RpcClient {
            inner: Arc::new(ClientInner {
                channel: self.channel,
                settings: self.settings,
                exchange: declared.exchange,
                reply_queue,
                pending,
                lifecycle: self.lifecycle,
                consumer,
            }),
        })
    }
}

struct ClientInner {
    channel: Arc<dyn AmqpChannel>,
    settings: Arc<Settings>,
    exchange: String,
    reply_queue: String,
    pending: PendingCalls,
    lifecycle: Lifecycle,
    consumer: ConsumerHandle,
}

/// A started RPC client. Cheap to clone; clones share the pending calls.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

/// A published request whose reply has not been awaited yet.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<Result<Value, AmqpError>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the reply. Stays pending until a reply, cancellation or fault.
    pub async fn wait(self) -> Result<Value, AmqpError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::Cancelled(self.correlation_id)),
        }
    }
}

impl RpcClient {
    /// Publishes `args` and returns a handle on the reply.
    ///
    /// The call is registered under a fresh correlation id before publishing
    /// and forgotten again if the channel refuses the message.
    ///
    /// # Parameters
    /// * `args` - The action arguments, sent as the JSON body
    ///
    /// # Returns
    /// A [`PendingReply`], `Faulted` once the reply consumer is gone, or the
    /// routing and publishing error
    pub async fn request(&self, args: &Value) -> Result<PendingReply, AmqpError> {
        let inner = &self.inner;
        if inner.lifecycle.is_faulted() {
            return Err(AmqpError::Faulted);
        }

        let topic = resolve_client_topic(args, &inner.settings.pins)?;
        let payload = publisher::to_payload(args)?;
        let correlation_id = publisher::correlation_id(&inner.settings);

        let receiver = inner.pending.register(&correlation_id).await?;
        if inner.lifecycle.is_faulted() {
            inner.pending.take(&correlation_id).await;
            return Err(AmqpError::Faulted);
        }

        let mut props = publisher::properties(&inner.settings.publish, &Context::current());
        props.correlation_id = Some(correlation_id.clone());
        props.reply_to = Some(inner.reply_queue.clone());

        debug!(
            "publishing request {} to {} with key {}",
            correlation_id, inner.exchange, topic
        );

        if let Err(err) = inner
            .channel
            .publish(&inner.exchange, &topic, &payload, &props)
            .await
        {
            error!(error = err.to_string(), "error publishing request");
            inner.pending.take(&correlation_id).await;
            return Err(err);
        }

        Ok(PendingReply {
            correlation_id,
            receiver,
        })
    }

    /// Publishes `args` and waits for the correlated reply.
    pub async fn act(&self, args: &Value) -> Result<Value, AmqpError> {
        self.request(args).await?.wait().await
    }

    /// Like [`RpcClient::act`], releasing the call if no reply arrives in time.
    pub async fn act_timeout(&self, args: &Value, timeout: Duration) -> Result<Value, AmqpError> {
        let reply = self.request(args).await?;
        let correlation_id = reply.correlation_id.clone();

        match tokio::time::timeout(timeout, reply.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(&correlation_id).await;
                Err(AmqpError::Timeout(correlation_id))
            }
        }
    }

    /// Releases a pending call; its waiter gets [`AmqpError::Cancelled`].
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        self.inner
            .pending
            .resolve(
                correlation_id,
                Err(AmqpError::Cancelled(correlation_id.to_owned())),
            )
            .await
    }

    /// Cancels every call older than `max_age` and returns how many there were.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        self.inner.pending.expire(max_age).await
    }

    /// Number of calls still waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Name of the private queue replies arrive on.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// `Consuming` while replies can arrive, `Faulted` after a channel fault.
    pub fn state(&self) -> State {
        self.inner.lifecycle.get()
    }

    /// The consumer registered on the reply queue.
    pub fn consumer(&self) -> &ConsumerHandle {
        &self.inner.consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{MockAmqpChannel, JSON_CONTENT_TYPE},
        testing::MemoryChannel,
        topic::Pin,
    };
    use serde_json::json;

    fn config() -> TransportConfig {
        let mut cfg = TransportConfig::rpc_client()
            .exchange_name("app.topic")
            .queue_naming("app", ".")
            .pin(Pin::parse("role:math,cmd:sum").unwrap());
        cfg.queues.id = Some("foo".to_owned());
        cfg
    }

    async fn start(channel: &Arc<MemoryChannel>) -> RpcClient {
        RpcPublisher::new(channel.clone(), config())
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    fn reply(correlation_id: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            payload: payload.as_bytes().to_vec(),
            correlation_id: Some(correlation_id.to_owned()),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            ..InboundMessage::default()
        }
    }

    #[tokio::test]
    async fn start_declares_a_private_reply_queue() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        assert_eq!(client.reply_queue(), "app.foo");
        assert_eq!(client.exchange(), "app.topic");
        assert_eq!(client.state(), State::Consuming);
        assert!(client.consumer().started());
        assert_eq!(channel.prefetch_calls(), vec![1]);
        assert!(channel.has_consumer("app.foo"));

        let queue = channel.queue("app.foo").unwrap();
        assert!(queue.exclusive && queue.delete);
    }

    #[tokio::test]
    async fn reply_queue_is_chosen_once_per_client() {
        let channel = Arc::new(MemoryChannel::new());
        let mut cfg = config();
        cfg.queues.id = None;
        let setup = RpcPublisher::new(channel.clone(), cfg).unwrap();

        let described = setup.topology().unwrap();
        assert_eq!(described, setup.topology().unwrap());

        let expected = described.queue_name().unwrap().to_owned();
        let client = setup.start().await.unwrap();

        assert_eq!(client.reply_queue(), expected);
        assert!(channel.has_consumer(&expected));
    }

    #[tokio::test]
    async fn plain_default_config_still_gets_a_private_reply_queue() {
        let channel = Arc::new(MemoryChannel::new());
        let client = RpcPublisher::new(channel.clone(), TransportConfig::default())
            .unwrap()
            .start()
            .await
            .unwrap();

        let queue = channel.queue(client.reply_queue()).unwrap();
        assert!(queue.exclusive);
        assert!(queue.delete);
        assert!(!queue.durable);
    }

    #[tokio::test]
    async fn reply_with_matching_correlation_id_resolves_the_call() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                let args = json!({"role": "math", "cmd": "sum", "left": 1, "right": 2});
                let reply = client.act(&args).await;
                reply
            }
        });

        channel.published_at_least(1).await;
        let request = channel.published().remove(0);
        assert_eq!(request.exchange, "app.topic");
        assert_eq!(request.routing_key, "cmd.sum.role.math");
        assert_eq!(request.json()["left"], json!(1));
        assert_eq!(request.properties.reply_to.as_deref(), Some("app.foo"));
        assert_eq!(request.properties.content_type, JSON_CONTENT_TYPE);

        let correlation_id = request.properties.correlation_id.clone().unwrap();
        let tag = channel.deliver("app.foo", reply(&correlation_id, r#"{"answer":3}"#));

        assert_eq!(call.await.unwrap().unwrap(), json!({"answer": 3}));
        channel.settled(1).await;
        assert_eq!(channel.acks(), vec![tag]);
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_calls_pair_by_correlation_id() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let first = client
            .request(&json!({"role": "math", "cmd": "sum", "left": 1}))
            .await
            .unwrap();
        let second = client
            .request(&json!({"role": "math", "cmd": "sum", "left": 2}))
            .await
            .unwrap();
        assert_ne!(first.correlation_id(), second.correlation_id());
        assert_eq!(client.pending_count().await, 2);

        channel.deliver("app.foo", reply(second.correlation_id(), "2"));
        channel.deliver("app.foo", reply(first.correlation_id(), "1"));

        assert_eq!(second.wait().await.unwrap(), json!(2));
        assert_eq!(first.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn unmatched_reply_resolves_nothing() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let pending = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();
        let tag = channel.deliver("app.foo", reply("someone-else", "{}"));

        channel.settled(1).await;
        assert_eq!(channel.acks(), vec![tag]);
        assert_eq!(client.pending_count().await, 1);
        assert!(client.cancel(pending.correlation_id()).await);
    }

    #[tokio::test]
    async fn error_reply_rejects_the_call() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let pending = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();
        let mut msg = reply(pending.correlation_id(), r#"{"message":"division by zero"}"#);
        msg.kind = Some(ERROR_REPLY_KIND.to_owned());
        channel.deliver("app.foo", msg);

        assert_eq!(
            pending.wait().await.unwrap_err(),
            AmqpError::Remote(json!({"message": "division by zero"}))
        );
    }

    #[tokio::test]
    async fn malformed_reply_fails_the_call_and_is_rejected() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let pending = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();
        let tag = channel.deliver("app.foo", reply(pending.correlation_id(), "not json"));

        assert!(matches!(
            pending.wait().await,
            Err(AmqpError::MalformedMessage(_))
        ));
        channel.settled(1).await;
        assert_eq!(channel.nacks(), vec![(tag, false, false)]);
    }

    #[tokio::test]
    async fn publish_failure_rejects_and_forgets_the_call() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;
        channel.fail("publish");

        let err = client
            .act(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ChannelError(_)));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unroutable_action_is_not_published() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let err = client.act(&json!({"role": "user"})).await.unwrap_err();

        assert!(matches!(err, AmqpError::UnmatchedAction(_)));
        assert!(channel.published().is_empty());
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn channel_fault_rejects_every_pending_call() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let first = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();
        let second = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();

        channel.fault("app.foo", AmqpError::ChannelError("connection reset".to_owned()));

        for pending in [first, second] {
            assert_eq!(
                pending.wait().await.unwrap_err(),
                AmqpError::ChannelError("connection reset".to_owned())
            );
        }
        assert_eq!(client.state(), State::Faulted);
        assert_eq!(
            client.act(&json!({"role": "math", "cmd": "sum"})).await,
            Err(AmqpError::Faulted)
        );
    }

    #[tokio::test]
    async fn cancel_releases_the_pending_entry() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let pending = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();
        let id = pending.correlation_id().to_owned();

        assert!(client.cancel(&id).await);
        assert!(!client.cancel(&id).await);
        assert_eq!(pending.wait().await, Err(AmqpError::Cancelled(id)));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn act_timeout_cancels_the_call() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let err = client
            .act_timeout(
                &json!({"role": "math", "cmd": "sum"}),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::Timeout(_)));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_drops_old_calls() {
        let channel = Arc::new(MemoryChannel::new());
        let client = start(&channel).await;

        let pending = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();

        assert_eq!(client.sweep_expired(Duration::from_secs(3600)).await, 0);
        assert_eq!(client.sweep_expired(Duration::ZERO).await, 1);
        assert!(matches!(pending.wait().await, Err(AmqpError::Cancelled(_))));
    }

    #[tokio::test]
    async fn fixed_correlation_id_cannot_overlap() {
        let channel = Arc::new(MemoryChannel::new());
        let client = RpcPublisher::new(channel.clone(), config().correlation_id("fixed"))
            .unwrap()
            .start()
            .await
            .unwrap();

        let first = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap();
        assert_eq!(first.correlation_id(), "fixed");

        let err = client
            .request(&json!({"role": "math", "cmd": "sum"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn exchange_declaration_failure_aborts_start() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_prefetch().returning(|_| Ok(()));
        channel
            .expect_assert_exchange()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        channel.expect_assert_queue().never();
        channel.expect_consume().never();

        let result = RpcPublisher::new(Arc::new(channel), config())
            .unwrap()
            .start()
            .await;

        assert_eq!(
            result.err(),
            Some(AmqpError::DeclareExchangeError("app.topic".to_owned()))
        );
    }
}
