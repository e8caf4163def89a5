// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Broker Boundary
//!
//! This module defines the capability set the client consumes from the
//! underlying AMQP library. The library is an opaque collaborator: the
//! client only ever issues the asynchronous operations declared here and
//! interprets their results or failures, never protocol frames.
//!
//! The production implementation over lapin lives in [`crate::amqp`];
//! tests substitute mocks or an in-memory broker.

use crate::options::{ConnectOptions, ConsumeOptions, ExchangeSpec, HeaderValue, QueueSpec};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A failure reported by the broker library.
///
/// Either a protocol reply carrying a numeric code and textual reason, or
/// a plain diagnostic. This is the input shape of error normalization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker replied {code}: {reason}")]
    Protocol { code: u16, reason: String },

    #[error("{0}")]
    Other(String),
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Per-channel identifier used to acknowledge receipt
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Whether the broker redelivered the message
    pub redelivered: bool,
    /// Message payload
    pub body: Vec<u8>,
}

/// Callback invoked when the broker closes the connection on its own.
pub type CloseCallback = Box<dyn Fn(BrokerError) + Send + Sync>;

/// Stream of deliveries for one consumer subscription.
///
/// The stream ending means the broker cancelled the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Entry point of the broker library: establishes connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects to the broker.
    ///
    /// `on_close` is invoked at most once, at any later time, if the
    /// broker or transport tears the connection down.
    async fn connect(
        &self,
        options: &ConnectOptions,
        on_close: CloseCallback,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One live connection to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// One live channel, carrying every channel-scoped operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Declares a queue and returns its resolved name (the broker assigns
    /// one when the spec's name is blank).
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &HashMap<String, HeaderValue>,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Submits a message. Success means accepted by the local client
    /// buffer, not confirmed by the broker.
    async fn publish<'a>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &HashMap<String, HeaderValue>,
        mandatory: bool,
        immediate: bool,
        content_type: Option<&'a str>,
    ) -> Result<(), BrokerError>;

    /// Starts a consumer and returns its delivery stream.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Acknowledges one delivery by its tag.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Closes the channel.
    async fn close(&self) -> Result<(), BrokerError>;
}
