// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Abstraction
//!
//! Every transport component talks to the broker through [`AmqpChannel`], a small
//! async surface over an already open channel. The channel's lifecycle belongs to
//! its owner: this crate never closes or reopens it. Channel faults are reported
//! as an `Err` item on a delivery stream (or by the stream ending).
//!
//! [`LapinChannel`] implements the trait on top of `lapin`, and
//! [`new_amqp_channel`] opens a connection and channel for hosts that do not
//! manage one themselves.

use crate::{
    config::ConnectionConfig, errors::AmqpError, exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages persisted by the broker
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Stream of deliveries from one consumer. An `Err` item is a channel fault.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// A message delivered by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub mandatory: bool,
    pub headers: BTreeMap<String, String>,
}

/// Options of a consumer registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

/// The broker operations this transport relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange, succeeding when it already exists with the same parameters.
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<String, AmqpError>;

    /// Declares a queue and returns its (possibly broker generated) name.
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Publishes a message, resolving once the channel has accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;
}

/// [`AmqpChannel`] implementation over a `lapin` channel.
pub struct LapinChannel {
    channel: Arc<Channel>,
}

impl LapinChannel {
    pub fn new(channel: Arc<Channel>) -> Arc<LapinChannel> {
        Arc::new(LapinChannel { channel })
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<String, AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(def.name.clone())
            }
        }
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                    routing_key.to_owned(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    immediate: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!("broker refused the published message");
                Err(AmqpError::PublishingError("publisher confirm nack".to_owned()))
            }
            Err(err) => {
                error!(error = err.to_string(), "error confirming message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(inbound_message(delivery)),
                Err(err) => Err(AmqpError::ChannelError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }
}

fn basic_properties(props: &PublishProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut basic = BasicProperties::default()
        .with_content_type(ShortString::from(props.content_type.clone()))
        .with_headers(FieldTable::from(headers));

    if let Some(id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(app_id) = &props.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(expiration) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    basic
}

fn inbound_message(delivery: Delivery) -> InboundMessage {
    let props = &delivery.properties;

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        AMQPValue::LongString(s) => {
                            String::from_utf8_lossy(s.as_bytes()).into_owned()
                        }
                        AMQPValue::ShortString(s) => s.to_string(),
                        _ => return None,
                    };
                    Some((k.to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        payload: delivery.data,
    }
}

/// Opens a connection to RabbitMQ and creates a channel on it.
///
/// The returned connection must be kept alive by the caller for as long as the
/// channel is in use.
pub async fn new_amqp_channel(
    cfg: &ConnectionConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}
