// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Client: Blocking Facade and Operation Dispatch
//!
//! This module provides the [`Client`], the owner of the broker handle,
//! the channel table and the lifecycle handlers, and the home of dispatch
//! logic for every AMQP operation.
//!
//! Each operation has two call surfaces:
//!
//! - a high-level facade (`connect`, `open_channel`, `publish`, ...) that
//!   auto-creates a [`CompletionSignal`], drives the operation and waits
//!   for the signal before returning. In fully-asynchronous mode the same
//!   methods spawn the operation and return immediately, leaving every
//!   outcome to the handler registry.
//! - a low-level `*_async` variant accepting a caller-supplied signal, for
//!   callers batching several operations onto one shared signal or
//!   integrating with their own synchronization.
//!
//! Both surfaces validate required arguments before any broker call is
//! made. Every completion path, success or failure, fires the signal
//! exactly once, so a blocked caller can never hang on a broker-side
//! failure: failures are normalized, handed to the error handler, and
//! recorded on the signal.

use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, CloseCallback};
use crate::channel::ChannelTable;
use crate::errors::{self, require, AmqpError};
use crate::handlers::{
    ChannelClosed, ChannelOpened, Connected, ConsumerCancelled, Disconnected, EventHandlers,
    Published,
};
use crate::options::{
    ConnectOptions, ConsumeOptions, ExchangeSpec, HeaderValue, PublishOptions, QueueSpec,
};
use crate::signal::CompletionSignal;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Content type stamped on payloads published through `publish_json`.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A synchronous-looking client over an asynchronous AMQP library.
///
/// One instance owns one broker connection (lazily created on `connect`,
/// cleared on disconnect), a table of named channels, and a registry of
/// lifecycle handlers. Cloning is cheap and shares the same instance.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    broker: Arc<dyn Broker>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channels: ChannelTable,
    handlers: EventHandlers,
    acking_enabled: bool,
    blocking_enabled: bool,
}

/// Configures and creates a [`Client`].
pub struct ClientBuilder {
    broker: Arc<dyn Broker>,
    handlers: EventHandlers,
    acking_enabled: bool,
    blocking_enabled: bool,
}

impl ClientBuilder {
    /// Replaces the whole handler registry.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Disables automatic acknowledgment of consumed messages.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn without_acking(mut self) -> Self {
        self.acking_enabled = false;
        self
    }

    /// Enables fully-asynchronous mode: no implicit blocking and no
    /// signal auto-creation; every outcome surfaces through handlers.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fully_asynchronous(mut self) -> Self {
        self.blocking_enabled = false;
        self
    }

    /// Substitutes the broker implementation reached by this client.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                broker: self.broker,
                connection: Mutex::new(None),
                channels: ChannelTable::new(),
                handlers: self.handlers,
                acking_enabled: self.acking_enabled,
                blocking_enabled: self.blocking_enabled,
            }),
        }
    }
}

impl Client {
    /// Creates a client with default configuration: blocking mode,
    /// acking enabled, no-op handlers, lapin-backed broker.
    pub fn new() -> Client {
        Client::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            broker: Arc::new(crate::amqp::AmqpBroker::new()),
            handlers: EventHandlers::default(),
            acking_enabled: true,
            blocking_enabled: true,
        }
    }

    /// The live channel handle mapped to the given name.
    pub fn channel(&self, name: &str) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.inner.channels.get(name)
    }

    /// Whether a broker connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().unwrap().is_some()
    }

    /// Runs one operation through the blocking facade: register one
    /// completion on a fresh signal, drive the operation, wait. In
    /// fully-asynchronous mode the operation is spawned instead and the
    /// call returns at once.
    async fn run<F, Fut>(&self, op: F) -> Result<Option<String>, AmqpError>
    where
        F: FnOnce(Arc<ClientInner>, CompletionSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = CompletionSignal::new();
        signal.begin();

        let fut = op(self.inner.clone(), signal.clone());

        if self.inner.blocking_enabled {
            fut.await;
            signal.wait().await
        } else {
            tokio::spawn(fut);
            Ok(None)
        }
    }

    // ---- connect / disconnect ----

    /// Connects to the broker.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), AmqpError> {
        options.validate()?;
        self.run(move |inner, signal| inner.connect_op(options, signal))
            .await
            .map(|_| ())
    }

    /// Low-level connect firing the supplied signal on completion.
    pub async fn connect_async(
        &self,
        options: ConnectOptions,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        options.validate()?;
        self.inner.clone().connect_op(options, signal.clone()).await;
        Ok(())
    }

    /// Closes the connection and discards the broker handle.
    pub async fn disconnect(&self) -> Result<(), AmqpError> {
        self.connected()?;
        self.run(move |inner, signal| inner.disconnect_op(signal))
            .await
            .map(|_| ())
    }

    /// Low-level disconnect firing the supplied signal on completion.
    pub async fn disconnect_async(&self, signal: &CompletionSignal) -> Result<(), AmqpError> {
        self.connected()?;
        self.inner.clone().disconnect_op(signal.clone()).await;
        Ok(())
    }

    // ---- channels ----

    /// Opens a channel under a caller-chosen name.
    ///
    /// The name must not be mapped to an open channel already.
    pub async fn open_channel(&self, name: &str) -> Result<(), AmqpError> {
        self.validate_open_channel(name)?;
        let name = name.to_owned();
        self.run(move |inner, signal| inner.open_channel_op(name, signal))
            .await
            .map(|_| ())
    }

    /// Low-level channel open firing the supplied signal on completion.
    pub async fn open_channel_async(
        &self,
        name: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        self.validate_open_channel(name)?;
        self.inner
            .clone()
            .open_channel_op(name.to_owned(), signal.clone())
            .await;
        Ok(())
    }

    /// Closes the named channel and removes it from the channel table.
    pub async fn close_channel(&self, name: &str) -> Result<(), AmqpError> {
        self.channel_exists(name)?;
        let name = name.to_owned();
        self.run(move |inner, signal| inner.close_channel_op(name, signal))
            .await
            .map(|_| ())
    }

    /// Low-level channel close firing the supplied signal on completion.
    pub async fn close_channel_async(
        &self,
        name: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        self.channel_exists(name)?;
        self.inner
            .clone()
            .close_channel_op(name.to_owned(), signal.clone())
            .await;
        Ok(())
    }

    // ---- exchanges ----

    /// Declares an exchange on the named channel.
    pub async fn declare_exchange(
        &self,
        spec: ExchangeSpec,
        channel: &str,
    ) -> Result<(), AmqpError> {
        require("exchange", &spec.name)?;
        self.channel_exists(channel)?;
        let channel = channel.to_owned();
        self.run(move |inner, signal| inner.declare_exchange_op(spec, channel, signal))
            .await
            .map(|_| ())
    }

    /// Low-level exchange declare firing the supplied signal on completion.
    pub async fn declare_exchange_async(
        &self,
        spec: ExchangeSpec,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("exchange", &spec.name)?;
        self.channel_exists(channel)?;
        self.inner
            .clone()
            .declare_exchange_op(spec, channel.to_owned(), signal.clone())
            .await;
        Ok(())
    }

    /// Deletes an exchange.
    pub async fn delete_exchange(&self, name: &str, channel: &str) -> Result<(), AmqpError> {
        require("exchange", name)?;
        self.channel_exists(channel)?;
        let (name, channel) = (name.to_owned(), channel.to_owned());
        self.run(move |inner, signal| inner.delete_exchange_op(name, channel, signal))
            .await
            .map(|_| ())
    }

    /// Low-level exchange delete firing the supplied signal on completion.
    pub async fn delete_exchange_async(
        &self,
        name: &str,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("exchange", name)?;
        self.channel_exists(channel)?;
        self.inner
            .clone()
            .delete_exchange_op(name.to_owned(), channel.to_owned(), signal.clone())
            .await;
        Ok(())
    }

    /// Binds a destination exchange to a source exchange.
    ///
    /// An empty routing key is the default binding.
    pub async fn bind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
        channel: &str,
    ) -> Result<(), AmqpError> {
        require("source", source)?;
        require("destination", destination)?;
        self.channel_exists(channel)?;
        let args = (
            source.to_owned(),
            destination.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.run(move |inner, signal| inner.bind_exchange_op(args, false, signal))
            .await
            .map(|_| ())
    }

    /// Low-level exchange bind firing the supplied signal on completion.
    pub async fn bind_exchange_async(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("source", source)?;
        require("destination", destination)?;
        self.channel_exists(channel)?;
        let args = (
            source.to_owned(),
            destination.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.inner
            .clone()
            .bind_exchange_op(args, false, signal.clone())
            .await;
        Ok(())
    }

    /// Removes an exchange-to-exchange binding.
    pub async fn unbind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
        channel: &str,
    ) -> Result<(), AmqpError> {
        require("source", source)?;
        require("destination", destination)?;
        self.channel_exists(channel)?;
        let args = (
            source.to_owned(),
            destination.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.run(move |inner, signal| inner.bind_exchange_op(args, true, signal))
            .await
            .map(|_| ())
    }

    /// Low-level exchange unbind firing the supplied signal on completion.
    pub async fn unbind_exchange_async(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("source", source)?;
        require("destination", destination)?;
        self.channel_exists(channel)?;
        let args = (
            source.to_owned(),
            destination.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.inner
            .clone()
            .bind_exchange_op(args, true, signal.clone())
            .await;
        Ok(())
    }

    // ---- queues ----

    /// Declares a queue and returns its resolved name.
    ///
    /// A spec with a blank name asks the broker to assign one; the
    /// assigned name is the return value. In fully-asynchronous mode the
    /// spec's own name is echoed back and the resolved name travels on
    /// the signal instead.
    pub async fn declare_queue(&self, spec: QueueSpec, channel: &str) -> Result<String, AmqpError> {
        self.channel_exists(channel)?;
        let fallback = spec.name.clone();
        let channel = channel.to_owned();
        let resolved = self
            .run(move |inner, signal| inner.declare_queue_op(spec, channel, signal))
            .await?;
        Ok(resolved.unwrap_or(fallback))
    }

    /// Low-level queue declare; the resolved name travels on the signal.
    pub async fn declare_queue_async(
        &self,
        spec: QueueSpec,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        self.channel_exists(channel)?;
        self.inner
            .clone()
            .declare_queue_op(spec, channel.to_owned(), signal.clone())
            .await;
        Ok(())
    }

    /// Deletes a queue.
    pub async fn delete_queue(&self, name: &str, channel: &str) -> Result<(), AmqpError> {
        require("queue", name)?;
        self.channel_exists(channel)?;
        let (name, channel) = (name.to_owned(), channel.to_owned());
        self.run(move |inner, signal| inner.delete_queue_op(name, channel, signal))
            .await
            .map(|_| ())
    }

    /// Low-level queue delete firing the supplied signal on completion.
    pub async fn delete_queue_async(
        &self,
        name: &str,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("queue", name)?;
        self.channel_exists(channel)?;
        self.inner
            .clone()
            .delete_queue_op(name.to_owned(), channel.to_owned(), signal.clone())
            .await;
        Ok(())
    }

    /// Binds a queue to an exchange.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: HashMap<String, HeaderValue>,
        channel: &str,
    ) -> Result<(), AmqpError> {
        require("queue", queue)?;
        require("exchange", exchange)?;
        self.channel_exists(channel)?;
        let args = (
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.run(move |inner, signal| inner.bind_queue_op(args, Some(arguments), signal))
            .await
            .map(|_| ())
    }

    /// Low-level queue bind firing the supplied signal on completion.
    pub async fn bind_queue_async(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: HashMap<String, HeaderValue>,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("queue", queue)?;
        require("exchange", exchange)?;
        self.channel_exists(channel)?;
        let args = (
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.inner
            .clone()
            .bind_queue_op(args, Some(arguments), signal.clone())
            .await;
        Ok(())
    }

    /// Removes a queue-to-exchange binding.
    pub async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        channel: &str,
    ) -> Result<(), AmqpError> {
        require("queue", queue)?;
        require("exchange", exchange)?;
        self.channel_exists(channel)?;
        let args = (
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.run(move |inner, signal| inner.bind_queue_op(args, None, signal))
            .await
            .map(|_| ())
    }

    /// Low-level queue unbind firing the supplied signal on completion.
    pub async fn unbind_queue_async(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("queue", queue)?;
        require("exchange", exchange)?;
        self.channel_exists(channel)?;
        let args = (
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
            channel.to_owned(),
        );
        self.inner
            .clone()
            .bind_queue_op(args, None, signal.clone())
            .await;
        Ok(())
    }

    // ---- publish ----

    /// Publishes a message.
    ///
    /// Publishing is fire-and-forget at the protocol level: the publish
    /// handler and the signal fire right after local submission, not on
    /// a broker acknowledgment.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
        channel: &str,
    ) -> Result<(), AmqpError> {
        require("exchange", exchange)?;
        require("routing_key", routing_key)?;
        self.channel_exists(channel)?;
        let args = (exchange.to_owned(), routing_key.to_owned(), channel.to_owned());
        self.run(move |inner, signal| inner.publish_op(args, body, options, signal))
            .await
            .map(|_| ())
    }

    /// Low-level publish firing the supplied signal after submission.
    pub async fn publish_async(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
        channel: &str,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("exchange", exchange)?;
        require("routing_key", routing_key)?;
        self.channel_exists(channel)?;
        let args = (exchange.to_owned(), routing_key.to_owned(), channel.to_owned());
        self.inner
            .clone()
            .publish_op(args, body, options, signal.clone())
            .await;
        Ok(())
    }

    /// Publishes a JSON-serialized payload with the matching content type.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        channel: &str,
    ) -> Result<(), AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|_| AmqpError::SerializePayloadError)?;
        self.publish(
            exchange,
            routing_key,
            body,
            PublishOptions::default().content_type(JSON_CONTENT_TYPE),
            channel,
        )
        .await
    }

    // ---- consume ----

    /// Starts consuming from a queue.
    ///
    /// The consume handler fires once per delivered message for the
    /// lifetime of the subscription; unless no-ack was requested or
    /// acking is disabled on the client, each message is acknowledged by
    /// its delivery tag after the handler runs. The signal fires once per
    /// message too, so in blocking mode this call returns after the first
    /// delivery while the subscription keeps running.
    pub async fn consume(
        &self,
        queue: &str,
        channel: &str,
        options: ConsumeOptions,
    ) -> Result<(), AmqpError> {
        require("queue", queue)?;
        self.channel_exists(channel)?;
        let (queue, channel) = (queue.to_owned(), channel.to_owned());
        self.run(move |inner, signal| inner.consume_op(queue, channel, options, signal))
            .await
            .map(|_| ())
    }

    /// Low-level consume firing the supplied signal once per message.
    ///
    /// Callers commonly pre-register N begins on a shared signal, one per
    /// expected message, and wait for the count to drain.
    pub async fn consume_async(
        &self,
        queue: &str,
        channel: &str,
        options: ConsumeOptions,
        signal: &CompletionSignal,
    ) -> Result<(), AmqpError> {
        require("queue", queue)?;
        self.channel_exists(channel)?;
        self.inner
            .clone()
            .consume_op(queue.to_owned(), channel.to_owned(), options, signal.clone())
            .await;
        Ok(())
    }

    // ---- pre-flight validation ----

    fn connected(&self) -> Result<(), AmqpError> {
        if self.inner.connection.lock().unwrap().is_none() {
            return Err(AmqpError::NotConnected);
        }
        Ok(())
    }

    fn validate_open_channel(&self, name: &str) -> Result<(), AmqpError> {
        require("channel", name)?;
        self.connected()?;
        if self.inner.channels.contains(name) {
            return Err(AmqpError::ChannelAlreadyOpen(name.to_owned()));
        }
        Ok(())
    }

    fn channel_exists(&self, name: &str) -> Result<(), AmqpError> {
        require("channel", name)?;
        if !self.inner.channels.contains(name) {
            return Err(AmqpError::UnknownChannel(name.to_owned()));
        }
        Ok(())
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl ClientInner {
    /// Routes a broker failure through normalization: one logged line,
    /// the error handler, then the signal, in that order.
    fn fail(&self, err: &BrokerError, fallback: AmqpError, signal: &CompletionSignal) {
        let normalized = errors::normalize(err, fallback);
        (self.handlers.on_error)(&normalized);
        signal.fail(normalized);
    }

    /// Same path for failures detected locally (stale channel names in
    /// fully-asynchronous dispatch, table races).
    fn fail_local(&self, err: AmqpError, signal: &CompletionSignal) {
        (self.handlers.on_error)(&err);
        signal.fail(err);
    }

    fn current_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Invoked by the broker library when it tears the connection down.
    ///
    /// Clears the broker handle, drains the channel table firing the
    /// channel-close handler per entry, and hands the cause to the error
    /// handler. In-flight operations fail on their own paths and resolve
    /// their signals there.
    fn broker_closed(&self, err: BrokerError) {
        warn!(error = err.to_string(), "broker closed the connection");

        *self.connection.lock().unwrap() = None;

        let reason = err.to_string();
        for name in self.channels.drain() {
            (self.handlers.on_channel_close)(&ChannelClosed {
                name,
                reason: Some(reason.clone()),
            });
        }

        let normalized = errors::normalize(&err, AmqpError::ConnectionError);
        (self.handlers.on_error)(&normalized);
    }

    async fn connect_op(self: Arc<Self>, options: ConnectOptions, signal: CompletionSignal) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self);
        let on_close: CloseCallback = Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.broker_closed(err);
            }
        });

        match self.broker.connect(&options, on_close).await {
            Ok(connection) => {
                *self.connection.lock().unwrap() = Some(connection);
                (self.handlers.on_connect)(&Connected {
                    host: options.host.clone(),
                    port: options.port,
                    vhost: options.vhost.clone(),
                });
                debug!(host = options.host.as_str(), "connected");
                signal.end();
            }
            Err(err) => {
                let normalized = errors::normalize(&err, AmqpError::ConnectionError);
                (self.handlers.on_connect_failure)(&normalized);
                (self.handlers.on_error)(&normalized);
                signal.fail(normalized);
            }
        }
    }

    async fn disconnect_op(self: Arc<Self>, signal: CompletionSignal) {
        let taken = self.connection.lock().unwrap().take();
        let Some(connection) = taken else {
            self.fail_local(AmqpError::NotConnected, &signal);
            return;
        };

        // the handle is discarded either way; a failed close still leaves
        // the client disconnected
        self.channels.drain();

        match connection.close().await {
            Ok(()) => {
                (self.handlers.on_disconnect)(&Disconnected {});
                debug!("disconnected");
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::DisconnectError, &signal),
        }
    }

    async fn open_channel_op(self: Arc<Self>, name: String, signal: CompletionSignal) {
        let Some(connection) = self.current_connection() else {
            self.fail_local(AmqpError::NotConnected, &signal);
            return;
        };

        match connection.open_channel().await {
            Ok(channel) => {
                (self.handlers.on_channel_open)(&ChannelOpened {
                    name: name.clone(),
                    channel: channel.clone(),
                });

                if let Err(err) = self.channels.insert(&name, channel) {
                    self.fail_local(err, &signal);
                    return;
                }

                debug!(channel = name.as_str(), "channel opened");
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::ChannelError, &signal),
        }
    }

    async fn close_channel_op(self: Arc<Self>, name: String, signal: CompletionSignal) {
        let channel = match self.channels.get(&name) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        match channel.close().await {
            Ok(()) => {
                (self.handlers.on_channel_close)(&ChannelClosed {
                    name: name.clone(),
                    reason: None,
                });

                let _ = self.channels.remove(&name);
                debug!(channel = name.as_str(), "channel closed");
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::CloseChannelError(name), &signal),
        }
    }

    async fn declare_exchange_op(
        self: Arc<Self>,
        spec: ExchangeSpec,
        channel: String,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        match channel.declare_exchange(&spec).await {
            Ok(()) => {
                debug!(exchange = spec.name.as_str(), "exchange declared");
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::DeclareExchangeError(spec.name), &signal),
        }
    }

    async fn delete_exchange_op(
        self: Arc<Self>,
        name: String,
        channel: String,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        match channel.delete_exchange(&name).await {
            Ok(()) => {
                debug!(exchange = name.as_str(), "exchange deleted");
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::DeleteExchangeError(name), &signal),
        }
    }

    async fn bind_exchange_op(
        self: Arc<Self>,
        (source, destination, routing_key, channel): (String, String, String, String),
        unbind: bool,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        let outcome = if unbind {
            channel
                .unbind_exchange(&source, &destination, &routing_key)
                .await
        } else {
            channel
                .bind_exchange(&source, &destination, &routing_key)
                .await
        };

        match outcome {
            Ok(()) => signal.end(),
            Err(err) => {
                let fallback = if unbind {
                    AmqpError::UnbindExchangeError(source, destination)
                } else {
                    AmqpError::BindExchangeError(source, destination)
                };
                self.fail(&err, fallback, &signal);
            }
        }
    }

    async fn declare_queue_op(
        self: Arc<Self>,
        spec: QueueSpec,
        channel: String,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        match channel.declare_queue(&spec).await {
            Ok(resolved) => {
                debug!(queue = resolved.as_str(), "queue declared");
                signal.end_with(resolved);
            }
            Err(err) => self.fail(&err, AmqpError::DeclareQueueError(spec.name), &signal),
        }
    }

    async fn delete_queue_op(
        self: Arc<Self>,
        name: String,
        channel: String,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        match channel.delete_queue(&name).await {
            Ok(()) => {
                debug!(queue = name.as_str(), "queue deleted");
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::DeleteQueueError(name), &signal),
        }
    }

    async fn bind_queue_op(
        self: Arc<Self>,
        (queue, exchange, routing_key, channel): (String, String, String, String),
        arguments: Option<HashMap<String, HeaderValue>>,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        let outcome = match &arguments {
            Some(arguments) => {
                channel
                    .bind_queue(&queue, &exchange, &routing_key, arguments)
                    .await
            }
            None => channel.unbind_queue(&queue, &exchange, &routing_key).await,
        };

        match outcome {
            Ok(()) => signal.end(),
            Err(err) => {
                let fallback = if arguments.is_some() {
                    AmqpError::BindQueueError(queue, exchange)
                } else {
                    AmqpError::UnbindQueueError(queue, exchange)
                };
                self.fail(&err, fallback, &signal);
            }
        }
    }

    async fn publish_op(
        self: Arc<Self>,
        (exchange, routing_key, channel): (String, String, String),
        body: Vec<u8>,
        options: PublishOptions,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        let outcome = channel
            .publish(
                &exchange,
                &routing_key,
                &body,
                &options.headers,
                options.mandatory,
                options.immediate,
                options.content_type.as_deref(),
            )
            .await;

        match outcome {
            Ok(()) => {
                (self.handlers.on_publish)(&Published {
                    exchange,
                    routing_key,
                    bytes: body.len(),
                });
                signal.end();
            }
            Err(err) => self.fail(&err, AmqpError::PublishingError, &signal),
        }
    }

    async fn consume_op(
        self: Arc<Self>,
        queue: String,
        channel_name: String,
        options: ConsumeOptions,
        signal: CompletionSignal,
    ) {
        let channel = match self.channels.get(&channel_name) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail_local(err, &signal);
                return;
            }
        };

        match channel.consume(&queue, &options).await {
            Ok(stream) => {
                let consumer_tag = options.consumer_tag.clone().unwrap_or_default();
                tokio::spawn(Arc::clone(&self).consumer_loop(
                    channel,
                    stream,
                    queue,
                    consumer_tag,
                    options.no_ack,
                    signal,
                ));
            }
            Err(err) => self.fail(&err, AmqpError::ConsumerError(queue), &signal),
        }
    }

    /// Drives one subscription: per message, invoke the consume handler,
    /// acknowledge when acking applies, then fire the signal. The stream
    /// ending means the broker cancelled the consumer; the cancel handler
    /// runs and any still-pending completion is resolved.
    async fn consumer_loop(
        self: Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        mut stream: crate::broker::DeliveryStream,
        queue: String,
        consumer_tag: String,
        no_ack: bool,
        signal: CompletionSignal,
    ) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(delivery) => {
                    (self.handlers.on_consume)(&delivery);

                    if self.acking_enabled && !no_ack {
                        if let Err(err) = channel.ack(delivery.delivery_tag).await {
                            self.fail(&err, AmqpError::AckMessageError, &signal);
                            continue;
                        }
                    }

                    signal.end();
                }
                Err(err) => {
                    self.fail(&err, AmqpError::ConsumerError(queue.clone()), &signal)
                }
            }
        }

        debug!(queue = queue.as_str(), "consumer cancelled");
        (self.handlers.on_consume_cancel)(&ConsumerCancelled {
            queue,
            consumer_tag,
        });
        signal.end();
    }
}
