// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Lifecycle Handlers
//!
//! This module provides the registry of user-overridable callbacks, one per
//! lifecycle event of the client. Every entry defaults to a no-op and is
//! independently settable through a builder-style method, so callers only
//! override the events they care about.
//!
//! Handlers run inside the client's own callback chain, before the
//! operation's completion signal fires, so logic chained in a handler
//! observes the event strictly before the blocking caller resumes.

use crate::broker::{BrokerChannel, Delivery};
use crate::errors::AmqpError;
use std::sync::Arc;

/// A lifecycle callback over a typed event payload.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Payload of the connect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

/// Payload of the disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {}

/// Payload of the channel-open event.
#[derive(Clone)]
pub struct ChannelOpened {
    /// Caller-chosen channel name
    pub name: String,
    /// The freshly opened channel handle; the channel table entry is
    /// created right after this handler returns
    pub channel: Arc<dyn BrokerChannel>,
}

/// Payload of the channel-close event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosed {
    /// Caller-chosen channel name
    pub name: String,
    /// Diagnostic when the broker initiated the close
    pub reason: Option<String>,
}

/// Payload of the publish event, fired right after local submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    /// Payload size in bytes
    pub bytes: usize,
}

/// Payload of the consumer-cancel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerCancelled {
    pub queue: String,
    pub consumer_tag: String,
}

/// The set of user-overridable lifecycle callbacks of one client.
///
/// Consume is the one repeating entry: it fires once per delivered
/// message for the lifetime of the subscription.
#[derive(Clone)]
pub struct EventHandlers {
    pub(crate) on_connect: Handler<Connected>,
    pub(crate) on_connect_failure: Handler<AmqpError>,
    pub(crate) on_disconnect: Handler<Disconnected>,
    pub(crate) on_channel_open: Handler<ChannelOpened>,
    pub(crate) on_channel_close: Handler<ChannelClosed>,
    pub(crate) on_publish: Handler<Published>,
    pub(crate) on_consume: Handler<Delivery>,
    pub(crate) on_consume_cancel: Handler<ConsumerCancelled>,
    pub(crate) on_error: Handler<AmqpError>,
}

fn noop<E>() -> Handler<E> {
    Arc::new(|_| {})
}

impl Default for EventHandlers {
    fn default() -> EventHandlers {
        EventHandlers {
            on_connect: noop(),
            on_connect_failure: noop(),
            on_disconnect: noop(),
            on_channel_open: noop(),
            on_channel_close: noop(),
            on_publish: noop(),
            on_consume: noop(),
            on_consume_cancel: noop(),
            on_error: noop(),
        }
    }
}

impl EventHandlers {
    /// Creates a registry with every handler set to a no-op.
    pub fn new() -> EventHandlers {
        EventHandlers::default()
    }

    /// Sets the handler invoked after a successful connect.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_connect(mut self, f: impl Fn(&Connected) + Send + Sync + 'static) -> Self {
        self.on_connect = Arc::new(f);
        self
    }

    /// Sets the handler invoked when a connect attempt fails.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_connect_failure(mut self, f: impl Fn(&AmqpError) + Send + Sync + 'static) -> Self {
        self.on_connect_failure = Arc::new(f);
        self
    }

    /// Sets the handler invoked after a disconnect.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_disconnect(mut self, f: impl Fn(&Disconnected) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Arc::new(f);
        self
    }

    /// Sets the handler invoked after a channel opens.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_channel_open(mut self, f: impl Fn(&ChannelOpened) + Send + Sync + 'static) -> Self {
        self.on_channel_open = Arc::new(f);
        self
    }

    /// Sets the handler invoked after a channel closes, whether the caller
    /// or the broker initiated it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_channel_close(mut self, f: impl Fn(&ChannelClosed) + Send + Sync + 'static) -> Self {
        self.on_channel_close = Arc::new(f);
        self
    }

    /// Sets the handler invoked after a message is submitted for publishing.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_publish(mut self, f: impl Fn(&Published) + Send + Sync + 'static) -> Self {
        self.on_publish = Arc::new(f);
        self
    }

    /// Sets the handler invoked once per delivered message.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_consume(mut self, f: impl Fn(&Delivery) + Send + Sync + 'static) -> Self {
        self.on_consume = Arc::new(f);
        self
    }

    /// Sets the handler invoked when the broker cancels a consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_consume_cancel(
        mut self,
        f: impl Fn(&ConsumerCancelled) + Send + Sync + 'static,
    ) -> Self {
        self.on_consume_cancel = Arc::new(f);
        self
    }

    /// Sets the handler invoked with every normalized broker failure.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_error(mut self, f: impl Fn(&AmqpError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(f);
        self
    }
}
