// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Selection
//!
//! Hosts register a transport by type (`amqp` for RPC, `amqp-pubsub` for topic
//! broadcast) and ask for either its client side or its listening side. The
//! pair selects one of four [`Transport`] variants.

use crate::{
    channel::AmqpChannel,
    config::TransportConfig,
    consumer::ConsumerHandle,
    dispatch::Dispatcher,
    errors::AmqpError,
    pubsub::{PubSubClient, PubSubPublisher, PubSubSubscriber},
    rpc::{RpcClient, RpcListener, RpcPublisher},
    state::State,
    topology::TopologyDescriptor,
};
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TransportType {
    #[serde(rename = "amqp")]
    Rpc,
    #[serde(rename = "amqp-pubsub")]
    PubSub,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Rpc => "amqp",
            TransportType::PubSub => "amqp-pubsub",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amqp" => Ok(TransportType::Rpc),
            "amqp-pubsub" => Ok(TransportType::PubSub),
            other => Err(AmqpError::ConfigurationError(format!(
                "unknown transport type `{}`",
                other
            ))),
        }
    }
}

/// Which side of a transport the host asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Client,
    Listen,
}

pub enum Transport {
    RpcClient(RpcPublisher),
    RpcListener(RpcListener),
    PubSubPublisher(PubSubPublisher),
    PubSubSubscriber(PubSubSubscriber),
}

/// A transport after its setup completed.
pub enum Started {
    Client(RpcClient),
    Publisher(PubSubClient),
    Listener(ConsumerHandle),
}

impl Started {
    pub fn state(&self) -> State {
        match self {
            Started::Client(client) => client.state(),
            Started::Publisher(publisher) => publisher.state(),
            Started::Listener(handle) => handle.state(),
        }
    }
}

impl Transport {
    /// Normalizes `config` for the selected variant. Listening sides need a
    /// dispatcher.
    pub fn new(
        kind: TransportType,
        hook: Hook,
        channel: Arc<dyn AmqpChannel>,
        config: TransportConfig,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Transport, AmqpError> {
        let require_dispatcher = || {
            dispatcher.clone().ok_or_else(|| {
                AmqpError::ConfigurationError(format!(
                    "a dispatcher is required to listen on `{}`",
                    kind
                ))
            })
        };

        match (kind, hook) {
            (TransportType::Rpc, Hook::Client) => {
                RpcPublisher::new(channel, config).map(Transport::RpcClient)
            }
            (TransportType::Rpc, Hook::Listen) => {
                RpcListener::new(channel, config, require_dispatcher()?)
                    .map(Transport::RpcListener)
            }
            (TransportType::PubSub, Hook::Client) => {
                PubSubPublisher::new(channel, config).map(Transport::PubSubPublisher)
            }
            (TransportType::PubSub, Hook::Listen) => {
                PubSubSubscriber::new(channel, config, require_dispatcher()?)
                    .map(Transport::PubSubSubscriber)
            }
        }
    }

    pub fn topology(&self) -> Result<TopologyDescriptor, AmqpError> {
        match self {
            Transport::RpcClient(client) => client.topology(),
            Transport::RpcListener(listener) => listener.topology(),
            Transport::PubSubPublisher(publisher) => Ok(publisher.topology()),
            Transport::PubSubSubscriber(subscriber) => subscriber.topology(),
        }
    }

    pub async fn start(self) -> Result<Started, AmqpError> {
        match self {
            Transport::RpcClient(client) => client.start().await.map(Started::Client),
            Transport::RpcListener(listener) => listener.listen().await.map(Started::Listener),
            Transport::PubSubPublisher(publisher) => {
                publisher.start().await.map(Started::Publisher)
            }
            Transport::PubSubSubscriber(subscriber) => {
                subscriber.listen().await.map(Started::Listener)
            }
        }
    }
}
