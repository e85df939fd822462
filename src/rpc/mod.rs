// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Point-to-point RPC
//!
//! A client publishes a request carrying a correlation id and the name of its
//! private reply queue; a listener consumes it from a shared request queue,
//! dispatches it and publishes the result back to that reply queue under the same
//! correlation id.

pub mod client;
pub mod listener;

pub use client::{PendingReply, RpcClient, RpcPublisher};
pub use listener::RpcListener;
