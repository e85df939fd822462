// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module provides the error taxonomy shared by every transport component.
//! Structural faults (configuration, topology declaration, channel loss) are
//! surfaced to the owner of a component, while per-message faults are absorbed
//! by the consumer loop and only show up here so they can be logged and traced.

use serde_json::Value;
use thiserror::Error;

/// Represents errors that can occur while setting up or running a transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmqpError {
    /// Missing or invalid setup parameters, raised before any broker call
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Transport-level fault reported by the channel
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}` with key `{2}`")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload: {0}")]
    SerializeError(String),

    /// Payload is empty or not valid JSON
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The dispatch callback reported a failure or aborted
    #[error("dispatch failure: {0}")]
    Dispatch(String),

    /// The remote listener answered with an error reply
    #[error("remote error: {0}")]
    Remote(Value),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// No configured pin matches the outgoing action
    #[error("no routing pattern matches action `{0}`")]
    UnmatchedAction(String),

    /// The component stopped after a channel fault
    #[error("transport is faulted")]
    Faulted,

    /// The pending call was released before a reply arrived
    #[error("call `{0}` was cancelled")]
    Cancelled(String),

    /// The pending call did not receive a reply in time
    #[error("call `{0}` timed out")]
    Timeout(String),
}

impl AmqpError {
    /// True for errors that stop a component rather than a single message.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            AmqpError::ConfigurationError(_)
                | AmqpError::ConnectionError
                | AmqpError::ChannelError(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(..)
                | AmqpError::ConsumerDeclarationError(_)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::Faulted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_error_names_every_part() {
        let err = AmqpError::BindingExchangeToQueueError(
            "app.topic".to_owned(),
            "app.orders".to_owned(),
            "cmd.create".to_owned(),
        );

        assert_eq!(
            err.to_string(),
            "failure to bind queue `app.orders` to exchange `app.topic` with key `cmd.create`"
        );
    }

    #[test]
    fn message_level_errors_are_not_structural() {
        assert!(!AmqpError::MalformedMessage("empty".to_owned()).is_structural());
        assert!(!AmqpError::Dispatch("boom".to_owned()).is_structural());
        assert!(AmqpError::ChannelError("closed".to_owned()).is_structural());
        assert!(AmqpError::DeclareQueueError("q".to_owned()).is_structural());
    }
}
