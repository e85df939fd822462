// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Action Transport
//!
//! Carries the actions of a request/response dispatch framework over an AMQP
//! 0-9-1 broker, either as point-to-point RPC ([`rpc`]) or as topic based
//! pub/sub ([`pubsub`]). Components are built over an already open channel
//! ([`channel::AmqpChannel`]) and pick their variant through [`transport`].

mod consumer;
mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod pubsub;
pub mod queue;
pub mod rpc;
pub mod state;
pub mod topic;
pub mod topology;
pub mod transport;

pub use consumer::ConsumerHandle;
