// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Error Types and Normalization
//!
//! This module provides the error type shared by every operation of the
//! client, split along the taxonomy of the crate: argument errors (caller
//! misuse, raised before any broker call) and broker failures (rejections
//! reported asynchronously by the server or transport).
//!
//! Broker failures arrive in heterogeneous shapes, either a protocol reply
//! with a numeric code and textual reason or a plain diagnostic string.
//! [`normalize`] converts both into a single logged line and a uniform
//! [`AmqpError`], and is guaranteed never to fail itself: it is the
//! last-resort path that keeps a blocked caller from hanging.

use crate::broker::BrokerError;
use thiserror::Error;
use tracing::error;

/// Represents errors that can occur during AMQP operations.
///
/// Argument errors are raised synchronously before the broker is touched;
/// the remaining variants are normalized broker failures, one per
/// operation, mirroring which call was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A required string argument was missing or empty
    #[error("required argument `{0}` must not be empty")]
    MissingArgument(&'static str),

    /// An operation referenced a channel name with no open channel
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    /// A channel name was reused while the previous channel is still open
    #[error("channel `{0}` is already open")]
    ChannelAlreadyOpen(String),

    /// An operation was issued before connecting to the broker
    #[error("not connected to the broker")]
    NotConnected,

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error closing the connection to the broker
    #[error("failure to disconnect")]
    DisconnectError,

    /// Error opening a channel on an established connection
    #[error("failure to open a channel")]
    ChannelError,

    /// Error closing the channel with the given name
    #[error("failure to close channel `{0}`")]
    CloseChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error binding an exchange to another exchange
    #[error("failure to bind exchange `{0}` to exchange `{1}`")]
    BindExchangeError(String, String),

    /// Error unbinding an exchange from another exchange
    #[error("failure to unbind exchange `{0}` from exchange `{1}`")]
    UnbindExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error unbinding a queue from an exchange
    #[error("failure to unbind queue `{0}` from exchange `{1}`")]
    UnbindQueueError(String, String),

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error starting or driving a consumer
    #[error("failure to consume from queue `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,
}

/// Converts a heterogeneous broker failure into a uniform error.
///
/// Logs one structured line with whatever detail the failure carries
/// (numeric reply code and reason for protocol failures, the plain
/// message otherwise) and returns the operation-specific `fallback`
/// variant. Never raises further errors.
pub(crate) fn normalize(err: &BrokerError, fallback: AmqpError) -> AmqpError {
    match err {
        BrokerError::Protocol { code, reason } => {
            error!(code, reason = reason.as_str(), "broker failure");
        }
        BrokerError::Other(message) => {
            error!(error = message.as_str(), "broker failure");
        }
    }

    fallback
}

/// Validates that a required string argument is non-empty.
pub(crate) fn require(field: &'static str, value: &str) -> Result<(), AmqpError> {
    if value.is_empty() {
        return Err(AmqpError::MissingArgument(field));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_the_operation_variant() {
        let err = BrokerError::Protocol {
            code: 406,
            reason: "PRECONDITION_FAILED".to_owned(),
        };

        assert_eq!(
            normalize(&err, AmqpError::DeclareQueueError("q1".to_owned())),
            AmqpError::DeclareQueueError("q1".to_owned())
        );
    }

    #[test]
    fn normalize_accepts_plain_diagnostics() {
        let err = BrokerError::Other("connection reset".to_owned());
        assert_eq!(
            normalize(&err, AmqpError::ConnectionError),
            AmqpError::ConnectionError
        );
    }

    #[test]
    fn require_rejects_empty_strings() {
        assert_eq!(
            require("queue", ""),
            Err(AmqpError::MissingArgument("queue"))
        );
        assert_eq!(require("queue", "q1"), Ok(()));
    }
}
