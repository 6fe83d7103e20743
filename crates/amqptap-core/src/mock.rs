//! In-memory broker for tests.
//!
//! Records every operation that reaches the "broker", lets tests inject
//! failures, deliveries and disconnects, and mimics AMQP channel semantics:
//! an operation error kills the channel, later calls fail as stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::broker::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Dialer, ExchangeKind,
    ExchangeOptions, MessageProperties, OutboundMessage, QueueOptions,
};
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    },
    BindExchange {
        destination: String,
        source: String,
        routing_key: String,
    },
    UnbindExchange {
        destination: String,
        source: String,
        routing_key: String,
    },
    DeleteExchange(String),
    DeclareQueue {
        name: String,
        options: QueueOptions,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    UnbindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    DeleteQueue(String),
    Consume {
        queue: String,
    },
    Publish(OutboundMessage),
}

type FailWhen = Box<dyn Fn(&Op) -> Option<BrokerError> + Send>;
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Default)]
struct State {
    ops: Vec<Op>,
    dial_attempts: usize,
    failing_dials: usize,
    failing_channels: usize,
    channels_opened: usize,
    closed_connections: usize,
    fail_when: Option<FailWhen>,
    consumers: Vec<(String, DeliverySender)>,
    deleted_while_consumed: Vec<String>,
    disconnect: Option<oneshot::Sender<BrokerError>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    state: Arc<Mutex<State>>,
}

impl MockBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_next_dials(&self, n: usize) {
        self.state().failing_dials = n;
    }

    pub(crate) fn fail_next_channels(&self, n: usize) {
        self.state().failing_channels = n;
    }

    /// Fail every operation for which `f` returns an error.
    pub(crate) fn fail_when(&self, f: impl Fn(&Op) -> Option<BrokerError> + Send + 'static) {
        self.state().fail_when = Some(Box::new(f));
    }

    pub(crate) fn dial_attempts(&self) -> usize {
        self.state().dial_attempts
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    pub(crate) fn closed_connections(&self) -> usize {
        self.state().closed_connections
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    /// Queues that were deleted while a consumer was still attached.
    pub(crate) fn deleted_while_consumed(&self) -> Vec<String> {
        self.state().deleted_while_consumed.clone()
    }

    /// Simulate the broker dropping the current connection.
    pub(crate) fn drop_connection(&self) {
        if let Some(tx) = self.state().disconnect.take() {
            let _ = tx.send(BrokerError::ConnectionClosed("connection reset by peer".into()));
        }
    }

    /// Queues that currently have a consumer.
    pub(crate) fn consumed_queues(&self) -> Vec<String> {
        self.state()
            .consumers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(queue, _)| queue.clone())
            .collect()
    }

    /// Push a delivery to the consumer of `queue`. False if nobody consumes.
    pub(crate) fn deliver(&self, queue: &str, delivery: Delivery) -> bool {
        self.state()
            .consumers
            .iter()
            .filter(|(q, _)| q == queue)
            .any(|(_, tx)| tx.send(Ok(delivery.clone())).is_ok())
    }

    /// Wait until `n` consumers are active.
    pub(crate) async fn wait_for_consumers(&self, n: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let queues = self.consumed_queues();
                if queues.len() >= n {
                    return queues;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("consumers did not start in time")
    }

    fn record(&self, op: Op) -> Result<(), BrokerError> {
        let mut state = self.state();
        let failure = state.fail_when.as_ref().and_then(|f| f(&op));
        state.ops.push(op);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub(crate) fn delivery(exchange: &str, routing_key: &str, body: &str) -> Delivery {
    Delivery {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        redelivered: false,
        delivery_tag: 1,
        properties: MessageProperties::default(),
        body: body.as_bytes().to_vec(),
    }
}

#[async_trait]
impl Dialer for MockBroker {
    type Connection = MockConnection;

    async fn dial(&self, _uri: &str) -> Result<MockConnection, BrokerError> {
        let mut state = self.state();
        state.dial_attempts += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(BrokerError::Dial("connection refused".into()));
        }

        let (tx, rx) = oneshot::channel();
        state.disconnect = Some(tx);
        Ok(MockConnection {
            broker: self.clone(),
            disconnected: Mutex::new(Some(rx)),
        })
    }
}

pub(crate) struct MockConnection {
    broker: MockBroker,
    disconnected: Mutex<Option<oneshot::Receiver<BrokerError>>>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<MockChannel, BrokerError> {
        let mut state = self.broker.state();
        if state.failing_channels > 0 {
            state.failing_channels -= 1;
            return Err(BrokerError::ConnectionClosed("channel open refused".into()));
        }
        state.channels_opened += 1;
        Ok(MockChannel {
            broker: self.broker.clone(),
            dead: AtomicBool::new(false),
        })
    }

    fn disconnected(&self) -> Option<oneshot::Receiver<BrokerError>> {
        self.disconnected.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.closed_connections += 1;
        state.consumers.clear();
        Ok(())
    }
}

pub(crate) struct MockChannel {
    broker: MockBroker,
    dead: AtomicBool,
}

impl MockChannel {
    fn exec(&self, op: Op) -> Result<(), BrokerError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed("channel already closed".into()));
        }
        let result = self.broker.record(op);
        if result.is_err() {
            self.dead.store(true, Ordering::SeqCst);
        }
        result
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.exec(Op::DeclareExchange {
            name: name.to_string(),
            kind,
            options,
        })
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.exec(Op::BindExchange {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.exec(Op::UnbindExchange {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.exec(Op::DeleteExchange(name.to_string()))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.exec(Op::DeclareQueue {
            name: name.to_string(),
            options,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.exec(Op::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.exec(Op::UnbindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.exec(Op::DeleteQueue(name.to_string()))?;

        let mut state = self.broker.state();
        if state
            .consumers
            .iter()
            .any(|(queue, tx)| queue == name && !tx.is_closed())
        {
            state.deleted_while_consumed.push(name.to_string());
        }
        // deleting a queue cancels its consumers
        state.consumers.retain(|(queue, _)| queue != name);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.exec(Op::Consume {
            queue: queue.to_string(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state().consumers.push((queue.to_string(), tx));
        Ok(stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.exec(Op::Publish(message.clone()))
    }
}
