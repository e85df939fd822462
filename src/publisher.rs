// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing Helpers
//!
//! Shared by RPC requests, RPC replies and pub/sub broadcasts: JSON encoding,
//! correlation id generation and the message properties every outgoing message
//! carries (content type, message id, configured publish options and the
//! OpenTelemetry trace context).

use crate::{
    channel::{PublishProperties, JSON_CONTENT_TYPE},
    config::{PublishConfig, Settings},
    errors::AmqpError,
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;
use uuid::Uuid;

/// Message `type` marking an RPC reply that carries an action failure
pub const ERROR_REPLY_KIND: &str = "error";

/// Encodes `value` as a JSON message body.
pub(crate) fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(value).map_err(|err| {
        error!(error = err.to_string(), "error serializing payload");
        AmqpError::SerializeError(err.to_string())
    })
}

/// The configured correlation id, or a fresh random one.
pub(crate) fn correlation_id(settings: &Settings) -> String {
    settings
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Base properties of an outgoing message.
pub(crate) fn properties(cfg: &PublishConfig, ctx: &Context) -> PublishProperties {
    let mut headers = BTreeMap::new();
    otel::inject_context(ctx, &mut headers);

    PublishProperties {
        content_type: JSON_CONTENT_TYPE.to_owned(),
        message_id: Some(Uuid::new_v4().to_string()),
        app_id: cfg.app_id.clone(),
        expiration: cfg.expiration.clone(),
        priority: cfg.priority,
        persistent: cfg.persistent,
        mandatory: cfg.mandatory,
        headers,
        ..PublishProperties::default()
    }
}
