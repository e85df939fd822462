// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Callback
//!
//! The host framework plugs its action-matching engine in through [`Dispatcher`].
//! Returning from `dispatch` is the single response to a delivery: the value is
//! serialized into the RPC reply, or discarded for pub/sub.

use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use thiserror::Error;

/// Failure outcomes of a dispatch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// The action ran and reported an error. RPC listeners answer with an
    /// error reply carrying this value.
    #[error("action failed: {0}")]
    Failed(Value),

    /// The handler broke down before producing any response. The message is
    /// rejected and no reply is sent.
    #[error("handler aborted: {0}")]
    Aborted(String),
}

/// Entry point into the host framework's action dispatch.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, ctx: &Context, payload: Value) -> Result<Value, DispatchError>;
}
