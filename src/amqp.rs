// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # Lapin Broker Implementation
//!
//! This module implements the broker capability set over lapin. It is the
//! only part of the crate that touches the AMQP library directly: it maps
//! the typed operation parameters onto lapin call shapes, converts lapin
//! failures into the normalized broker error form, and adapts consumer
//! streams into the delivery stream the dispatch layer drives.

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseCallback, Delivery, DeliveryStream,
};
use crate::options::{
    ConnectOptions, ConsumeOptions, ExchangeSpec, ExchangeType, HeaderValue, QueueSpec,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Reply code sent on caller-initiated connection and channel closes.
const REPLY_SUCCESS: u16 = 200;

/// Lapin-backed entry point of the broker boundary.
#[derive(Debug, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> AmqpBroker {
        AmqpBroker
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
        on_close: CloseCallback,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        debug!(host = options.host.as_str(), "creating amqp connection...");

        let mut properties = ConnectionProperties::default();
        if let Some(name) = &options.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let uri = options.uri();
        let connecting = open(&uri, properties, options.cert_chain.as_deref());

        let connection = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| BrokerError::Other("connection attempt timed out".to_owned()))?
                .map_err(into_broker_err)?,
            None => connecting.await.map_err(into_broker_err)?,
        };

        connection.on_error(move |err| on_close(into_broker_err(err)));
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

/// One live lapin connection.
pub struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(into_broker_err)?;

        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "normal shutdown")
            .await
            .map_err(into_broker_err)
    }
}

/// One live lapin channel.
pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.inner
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: false,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(into_broker_err)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(into_broker_err)
    }

    async fn bind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(into_broker_err)
    }

    async fn unbind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(into_broker_err)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let queue = self
            .inner
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: false,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(into_broker_err)?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(into_broker_err)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &HashMap<String, HeaderValue>,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                field_table(arguments),
            )
            .await
            .map_err(into_broker_err)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(into_broker_err)
    }

    async fn publish<'a>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &HashMap<String, HeaderValue>,
        mandatory: bool,
        immediate: bool,
        content_type: Option<&'a str>,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(field_table(headers));

        if let Some(content_type) = content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        // the returned publisher confirm is deliberately not awaited:
        // success means accepted by the local client buffer
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                body,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(into_broker_err)
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or_default(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(into_broker_err)?;

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(into_broker_err))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(into_broker_err)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "normal shutdown")
            .await
            .map_err(into_broker_err)
    }
}

async fn open(
    uri: &str,
    properties: ConnectionProperties,
    cert_chain: Option<&str>,
) -> Result<Connection, lapin::Error> {
    match cert_chain {
        Some(pem) => {
            let config = OwnedTLSConfig {
                cert_chain: Some(pem.to_owned()),
                ..OwnedTLSConfig::default()
            };
            Connection::connect_with_config(uri, properties, config).await
        }
        None => Connection::connect(uri, properties).await,
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn field_table(arguments: &HashMap<String, HeaderValue>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in arguments {
        let amqp_value = match value {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Uint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

fn into_broker_err(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(protocol) => BrokerError::Protocol {
            code: protocol.get_id(),
            reason: protocol.get_message().to_string(),
        },
        other => BrokerError::Other(other.to_string()),
    }
}
