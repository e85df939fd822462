// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module runs the consume loop shared by RPC listeners, subscribers and the
//! RPC client's reply queue. Each delivery is handled on its own task, inside a
//! consumer span, and is settled exactly once: acknowledged when its handler
//! succeeds, rejected without requeue otherwise (including handler panics). A
//! fault on the delivery stream marks the owning component as faulted and ends
//! the loop.

use crate::{
    channel::{AmqpChannel, ConsumeOptions, InboundMessage},
    config::Settings,
    errors::AmqpError,
    otel,
    state::{Lifecycle, State},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
    Context,
};
use serde_json::Value;
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-delivery behaviour of a consumer.
#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync + 'static {
    /// Name of the consumer spans.
    fn name(&self) -> &str;

    /// `Ok` acknowledges the message, `Err` rejects it without requeue.
    async fn handle(&self, ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError>;

    /// Called once when the delivery stream faults.
    async fn on_channel_error(&self, _err: &AmqpError) {}
}

/// A running consumer registration.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    prefetch: u16,
    consumer_tag: String,
    started: bool,
    lifecycle: Lifecycle,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// True once the broker accepted the consumer registration.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Current state of the component owning this consumer.
    pub fn state(&self) -> State {
        self.lifecycle.get()
    }

    /// True once the consume loop ended after a channel fault.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Consumer options for `queue` derived from the normalized settings.
pub(crate) fn consume_options(settings: &Settings, queue: &str) -> ConsumeOptions {
    ConsumeOptions {
        consumer_tag: settings
            .consume
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4())),
        no_ack: false,
        exclusive: settings.consume.exclusive,
        no_local: settings.consume.no_local,
    }
}

/// Parses a JSON payload. Empty or invalid content is malformed.
pub(crate) fn parse_payload(msg: &InboundMessage) -> Result<Value, AmqpError> {
    if msg.payload.iter().all(u8::is_ascii_whitespace) {
        return Err(AmqpError::MalformedMessage("empty payload".to_owned()));
    }

    serde_json::from_slice(&msg.payload).map_err(|e| AmqpError::MalformedMessage(e.to_string()))
}

/// Registers a consumer on `queue` and spawns its consume loop.
pub(crate) async fn spawn_consumer(
    channel: Arc<dyn AmqpChannel>,
    lifecycle: Lifecycle,
    queue: &str,
    prefetch: u16,
    options: ConsumeOptions,
    handler: Arc<dyn DeliveryHandler>,
) -> Result<ConsumerHandle, AmqpError> {
    let mut deliveries = channel.consume(queue, &options).await?;
    lifecycle.advance(State::Consuming);

    debug!("consuming queue: {} with tag: {}", queue, options.consumer_tag);

    let task = tokio::spawn({
        let queue = queue.to_owned();
        let lifecycle = lifecycle.clone();
        async move {
            let fault = loop {
                match deliveries.next().await {
                    Some(Ok(msg)) => {
                        tokio::spawn(consume(channel.clone(), handler.clone(), msg));
                    }
                    Some(Err(err)) => break err,
                    None => break AmqpError::ChannelError(format!("consumer of `{}` was cancelled", queue)),
                }
            };

            error!(error = fault.to_string(), queue = %queue, "consumer stopped");
            lifecycle.fault();
            handler.on_channel_error(&fault).await;
        }
    });

    Ok(ConsumerHandle {
        queue: queue.to_owned(),
        prefetch,
        consumer_tag: options.consumer_tag,
        started: true,
        lifecycle,
        task,
    })
}

/// Handles one delivery and settles it.
pub(crate) async fn consume(
    channel: Arc<dyn AmqpChannel>,
    handler: Arc<dyn DeliveryHandler>,
    msg: InboundMessage,
) -> Result<(), AmqpError> {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&msg, &tracer, handler.name());

    debug!(
        "received: {} - routing key: {}",
        msg.delivery_tag, msg.routing_key
    );

    let result = match AssertUnwindSafe(handler.handle(&ctx, &msg))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(AmqpError::Dispatch("handler panicked".to_owned())),
    };

    settle(channel.as_ref(), &msg, result, &mut span).await
}

async fn settle(
    channel: &dyn AmqpChannel,
    msg: &InboundMessage,
    result: Result<(), AmqpError>,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    match result {
        Ok(()) => match channel.ack(msg.delivery_tag).await {
            Err(e) => {
                error!("error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(e)
            }
            _ => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(())
            }
        },
        Err(reason) => {
            warn!(
                error = reason.to_string(),
                "rejecting message without requeue"
            );
            span.record_error(&reason);
            span.set_status(Status::Error {
                description: Cow::from(reason.to_string()),
            });

            if let Err(e) = channel.nack(msg.delivery_tag, false, false).await {
                error!("error whiling nack msg");
                span.record_error(&e);
                return Err(e);
            }

            Ok(())
        }
    }
}
