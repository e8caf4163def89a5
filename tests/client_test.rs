// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! End-to-end tests against an in-memory broker implementing the broker
//! capability set: exchanges route published messages to bound queues,
//! queues buffer until a consumer subscribes, acknowledgments are
//! recorded per delivery tag.

use amqp_sync::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseCallback, Delivery, DeliveryStream,
};
use amqp_sync::options::{
    ConnectOptions, ConsumeOptions, ExchangeSpec, HeaderValue, PublishOptions, QueueSpec,
};
use amqp_sync::{AmqpError, Client, CompletionSignal, EventHandlers};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const GUARD: Duration = Duration::from_secs(10);

struct QueueBinding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct FakeConsumer {
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
    /// Whether deliveries to this consumer await an acknowledgment and
    /// get requeued if the channel closes first.
    track_unacked: bool,
}

#[derive(Default)]
struct FakeState {
    bindings: Mutex<Vec<QueueBinding>>,
    buffered: Mutex<HashMap<String, VecDeque<Delivery>>>,
    consumers: Mutex<HashMap<String, FakeConsumer>>,
    unacked: Mutex<Vec<(String, Delivery)>>,
    acks: Mutex<Vec<u64>>,
    next_tag: AtomicU64,
    next_queue: AtomicU64,
    on_close: Mutex<Option<CloseCallback>>,
}

/// In-memory stand-in for the AMQP library, shared across clients the
/// way one real broker is shared across connections.
#[derive(Clone, Default)]
struct FakeBroker {
    state: Arc<FakeState>,
}

impl FakeBroker {
    fn acks(&self) -> Vec<u64> {
        self.state.acks.lock().unwrap().clone()
    }

    /// Simulates the broker tearing the connection down.
    fn trigger_close(&self) {
        let callback = self.state.on_close.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(BrokerError::Other("connection forced".to_owned()));
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(
        &self,
        _options: &ConnectOptions,
        on_close: CloseCallback,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        *self.state.on_close.lock().unwrap() = Some(on_close);
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        Ok(Arc::new(FakeChannel {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_exchange(&self, _spec: &ExchangeSpec) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn delete_exchange(&self, _name: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn bind_exchange(
        &self,
        _source: &str,
        _destination: &str,
        _routing_key: &str,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn unbind_exchange(
        &self,
        _source: &str,
        _destination: &str,
        _routing_key: &str,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let name = if spec.name().is_empty() {
            format!("amq.gen-{}", self.state.next_queue.fetch_add(1, Ordering::SeqCst))
        } else {
            spec.name().to_owned()
        };

        self.state
            .buffered
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default();
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.state.buffered.lock().unwrap().remove(name);
        // dropping the sender cancels any live consumer
        self.state.consumers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &HashMap<String, HeaderValue>,
    ) -> Result<(), BrokerError> {
        self.state.bindings.lock().unwrap().push(QueueBinding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue: queue.to_owned(),
        });
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.state.bindings.lock().unwrap().retain(|b| {
            !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
        });
        Ok(())
    }

    async fn publish<'a>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _headers: &HashMap<String, HeaderValue>,
        _mandatory: bool,
        _immediate: bool,
        _content_type: Option<&'a str>,
    ) -> Result<(), BrokerError> {
        let targets: Vec<String> = self
            .state
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for queue in targets {
            let delivery = Delivery {
                delivery_tag: self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                body: body.to_vec(),
            };

            let sent = {
                let consumers = self.state.consumers.lock().unwrap();
                match consumers.get(&queue) {
                    Some(consumer) if consumer.sender.send(Ok(delivery.clone())).is_ok() => {
                        if consumer.track_unacked {
                            self.state
                                .unacked
                                .lock()
                                .unwrap()
                                .push((queue.clone(), delivery.clone()));
                        }
                        true
                    }
                    _ => false,
                }
            };

            if !sent {
                self.state
                    .buffered
                    .lock()
                    .unwrap()
                    .entry(queue)
                    .or_default()
                    .push_back(delivery);
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let track_unacked = !options.is_no_ack();
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let backlog = self
            .state
            .buffered
            .lock()
            .unwrap()
            .get_mut(queue)
            .map(|buffer| buffer.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for delivery in backlog {
            if track_unacked {
                self.state
                    .unacked
                    .lock()
                    .unwrap()
                    .push((queue.to_owned(), delivery.clone()));
            }
            let _ = sender.send(Ok(delivery));
        }

        self.state.consumers.lock().unwrap().insert(
            queue.to_owned(),
            FakeConsumer {
                sender,
                track_unacked,
            },
        );

        Ok(futures_util::stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state
            .unacked
            .lock()
            .unwrap()
            .retain(|(_, d)| d.delivery_tag != delivery_tag);
        self.state.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // dropping the senders cancels every live consumer; whatever they
        // left unacknowledged goes back to its queue marked redelivered
        self.state.consumers.lock().unwrap().clear();

        let requeued: Vec<(String, Delivery)> =
            self.state.unacked.lock().unwrap().drain(..).collect();
        let mut buffered = self.state.buffered.lock().unwrap();
        for (queue, mut delivery) in requeued {
            delivery.redelivered = true;
            buffered.entry(queue).or_default().push_back(delivery);
        }
        Ok(())
    }
}

fn connect_options() -> ConnectOptions {
    ConnectOptions::new("localhost", 5672, "/", "guest", "guest")
}

async fn connected(broker: &FakeBroker, handlers: EventHandlers) -> Client {
    let client = Client::builder()
        .broker(Arc::new(broker.clone()))
        .handlers(handlers)
        .build();

    timeout(GUARD, client.connect(connect_options()))
        .await
        .unwrap()
        .unwrap();
    timeout(GUARD, client.open_channel("ch1"))
        .await
        .unwrap()
        .unwrap();
    client
}

#[tokio::test]
async fn hundred_messages_flow_from_publisher_to_consumer() {
    let broker = FakeBroker::default();

    let publisher = connected(&broker, EventHandlers::new()).await;
    publisher
        .declare_exchange(ExchangeSpec::new("ex1"), "ch1")
        .await
        .unwrap();
    let queue = publisher
        .declare_queue(QueueSpec::new("q1"), "ch1")
        .await
        .unwrap();
    assert_eq!(queue, "q1");
    publisher
        .bind_queue("q1", "ex1", "rk", HashMap::new(), "ch1")
        .await
        .unwrap();

    for i in 0..100 {
        timeout(
            GUARD,
            publisher.publish(
                "ex1",
                "rk",
                format!("message-{i}").into_bytes(),
                PublishOptions::default(),
                "ch1",
            ),
        )
        .await
        .unwrap()
        .unwrap();
    }

    // a second client consumes: one begin per expected message on a
    // shared signal, one end per delivery
    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = received.clone();
    let handlers = EventHandlers::new().on_consume(move |delivery| {
        sink.lock()
            .unwrap()
            .push(String::from_utf8(delivery.body.clone()).unwrap());
    });

    let consumer = connected(&broker, handlers).await;

    let signal = CompletionSignal::new();
    for _ in 0..100 {
        signal.begin();
    }
    consumer
        .consume_async("q1", "ch1", ConsumeOptions::default(), &signal)
        .await
        .unwrap();

    timeout(GUARD, signal.wait())
        .await
        .expect("all 100 deliveries must arrive")
        .unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 100);
    assert_eq!(received[0], "message-0");
    assert_eq!(received[99], "message-99");

    // each delivery acknowledged exactly once
    let acks = broker.acks();
    assert_eq!(acks.len(), 100);
    assert_eq!(acks.iter().collect::<HashSet<_>>().len(), 100);
}

#[tokio::test]
async fn shared_signal_batches_publish_submissions() {
    let broker = FakeBroker::default();
    let client = connected(&broker, EventHandlers::new()).await;

    client
        .declare_exchange(ExchangeSpec::new("ex1"), "ch1")
        .await
        .unwrap();
    client
        .declare_queue(QueueSpec::new("q1"), "ch1")
        .await
        .unwrap();
    client
        .bind_queue("q1", "ex1", "rk", HashMap::new(), "ch1")
        .await
        .unwrap();

    let signal = CompletionSignal::new();
    for i in 0..100 {
        signal.begin();
        client
            .publish_async(
                "ex1",
                "rk",
                format!("batch-{i}").into_bytes(),
                PublishOptions::default(),
                "ch1",
                &signal,
            )
            .await
            .unwrap();
    }

    timeout(GUARD, signal.wait())
        .await
        .expect("batched publishes must all complete")
        .unwrap();
    assert_eq!(signal.pending(), 0);
}

#[tokio::test]
async fn acking_disabled_records_no_acknowledgments() {
    let broker = FakeBroker::default();

    let publisher = connected(&broker, EventHandlers::new()).await;
    publisher
        .declare_exchange(ExchangeSpec::new("ex1"), "ch1")
        .await
        .unwrap();
    publisher
        .declare_queue(QueueSpec::new("q1"), "ch1")
        .await
        .unwrap();
    publisher
        .bind_queue("q1", "ex1", "rk", HashMap::new(), "ch1")
        .await
        .unwrap();
    for _ in 0..10 {
        publisher
            .publish("ex1", "rk", b"m".to_vec(), PublishOptions::default(), "ch1")
            .await
            .unwrap();
    }

    let consumer = Client::builder()
        .broker(Arc::new(broker.clone()))
        .without_acking()
        .build();
    timeout(GUARD, consumer.connect(connect_options()))
        .await
        .unwrap()
        .unwrap();
    consumer.open_channel("ch1").await.unwrap();

    let signal = CompletionSignal::new();
    for _ in 0..10 {
        signal.begin();
    }
    consumer
        .consume_async("q1", "ch1", ConsumeOptions::default(), &signal)
        .await
        .unwrap();
    timeout(GUARD, signal.wait()).await.unwrap().unwrap();

    assert!(broker.acks().is_empty());
}

#[tokio::test]
async fn no_ack_option_suppresses_acknowledgments() {
    let broker = FakeBroker::default();

    let client = connected(&broker, EventHandlers::new()).await;
    client
        .declare_exchange(ExchangeSpec::new("ex1"), "ch1")
        .await
        .unwrap();
    client
        .declare_queue(QueueSpec::new("q1"), "ch1")
        .await
        .unwrap();
    client
        .bind_queue("q1", "ex1", "rk", HashMap::new(), "ch1")
        .await
        .unwrap();
    client
        .publish("ex1", "rk", b"m".to_vec(), PublishOptions::default(), "ch1")
        .await
        .unwrap();

    // acking is enabled on the client but this subscription opts out
    timeout(
        GUARD,
        client.consume("q1", "ch1", ConsumeOptions::default().no_ack()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(broker.acks().is_empty());
}

#[tokio::test]
async fn unacked_messages_are_redelivered_to_the_next_consumer() {
    let broker = FakeBroker::default();

    let publisher = connected(&broker, EventHandlers::new()).await;
    publisher
        .declare_exchange(ExchangeSpec::new("ex1"), "ch1")
        .await
        .unwrap();
    publisher
        .declare_queue(QueueSpec::new("q1"), "ch1")
        .await
        .unwrap();
    publisher
        .bind_queue("q1", "ex1", "rk", HashMap::new(), "ch1")
        .await
        .unwrap();
    for _ in 0..10 {
        publisher
            .publish("ex1", "rk", b"m".to_vec(), PublishOptions::default(), "ch1")
            .await
            .unwrap();
    }

    // first pass with acking disabled: the full batch arrives but stays
    // unacknowledged
    let first = Arc::new(Mutex::new(0usize));
    let first_sink = first.clone();
    let handlers = EventHandlers::new().on_consume(move |_| *first_sink.lock().unwrap() += 1);

    let skipper = Client::builder()
        .broker(Arc::new(broker.clone()))
        .handlers(handlers)
        .without_acking()
        .build();
    timeout(GUARD, skipper.connect(connect_options()))
        .await
        .unwrap()
        .unwrap();
    skipper.open_channel("ch1").await.unwrap();

    let signal = CompletionSignal::new();
    for _ in 0..10 {
        signal.begin();
    }
    skipper
        .consume_async("q1", "ch1", ConsumeOptions::default(), &signal)
        .await
        .unwrap();
    timeout(GUARD, signal.wait()).await.unwrap().unwrap();

    assert_eq!(*first.lock().unwrap(), 10);
    assert!(broker.acks().is_empty());

    // closing the channel requeues everything unacknowledged
    timeout(GUARD, skipper.close_channel("ch1"))
        .await
        .unwrap()
        .unwrap();

    // second pass with acking: the broker redelivers the full count
    let redelivered = Arc::new(Mutex::new(Vec::<bool>::new()));
    let second_sink = redelivered.clone();
    let handlers = EventHandlers::new()
        .on_consume(move |delivery| second_sink.lock().unwrap().push(delivery.redelivered));

    let consumer = connected(&broker, handlers).await;

    let signal = CompletionSignal::new();
    for _ in 0..10 {
        signal.begin();
    }
    consumer
        .consume_async("q1", "ch1", ConsumeOptions::default(), &signal)
        .await
        .unwrap();
    timeout(GUARD, signal.wait()).await.unwrap().unwrap();

    let redelivered = redelivered.lock().unwrap();
    assert_eq!(redelivered.len(), 10);
    assert!(redelivered.iter().all(|&r| r));
    assert_eq!(broker.acks().len(), 10);
}

#[tokio::test]
async fn server_named_queue_resolves_through_the_signal() {
    let broker = FakeBroker::default();
    let client = connected(&broker, EventHandlers::new()).await;

    let resolved = client
        .declare_queue(QueueSpec::server_named(), "ch1")
        .await
        .unwrap();
    assert!(resolved.starts_with("amq.gen-"));
}

#[tokio::test]
async fn broker_initiated_close_drains_the_channel_table() {
    let broker = FakeBroker::default();

    let closed = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = closed.clone();
    let errors = Arc::new(Mutex::new(Vec::<AmqpError>::new()));
    let error_sink = errors.clone();
    let handlers = EventHandlers::new()
        .on_channel_close(move |event| sink.lock().unwrap().push(event.name.clone()))
        .on_error(move |err| error_sink.lock().unwrap().push(err.clone()));

    let client = connected(&broker, handlers).await;
    assert!(client.is_connected());

    broker.trigger_close();

    assert!(!client.is_connected());
    assert!(client.channel("ch1").is_err());
    assert_eq!(closed.lock().unwrap().clone(), vec!["ch1".to_owned()]);
    assert_eq!(
        errors.lock().unwrap().clone(),
        vec![AmqpError::ConnectionError]
    );
}
