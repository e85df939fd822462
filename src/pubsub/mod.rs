// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Pub/Sub
//!
//! Publishers only know the exchange; every subscriber owns a durable named
//! queue bound to the routing keys of its pins. Instances of one logical
//! subscriber share that queue and compete for its messages, while distinct
//! subscribers each get their own copy.

pub mod publisher;
pub mod subscriber;

pub use publisher::{PubSubClient, PubSubPublisher};
pub use subscriber::PubSubSubscriber;
