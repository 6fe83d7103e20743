//! Exchange tapping.
//!
//! For every tapped exchange the worker creates an internal fanout exchange
//! bound to the source exchange and an exclusive queue bound to that fanout
//! exchange, then consumes the queue. Existing consumers of the source
//! exchange are not affected. Everything created in an epoch is removed
//! again before the epoch ends, whatever the reason it ends.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::binding::ExchangeBinding;
use crate::broker::{
    BrokerChannel, BrokerConnection, DeliveryStream, ExchangeKind, ExchangeOptions, QueueOptions,
};
use crate::config::DEFAULT_RETRY_DELAY;
use crate::control::{ControlReceiver, ControlSignal, ReconnectAction};
use crate::envelope::{Envelope, EnvelopeSender};
use crate::error::{BrokerError, TapError};
use crate::fanin::FanIn;
use crate::supervisor::Worker;
use crate::worker::{forward_deliveries, WorkerEvent};

/// Name of the fanout exchange tapping `exchange`.
pub fn tap_exchange_name(exchange: &str, suffix: &str) -> String {
    format!("__tap-exchange-for-{exchange}-{suffix}")
}

/// Name of the queue receiving the tapped traffic of `exchange`.
pub fn tap_queue_name(exchange: &str, suffix: &str) -> String {
    format!("__tap-queue-for-{exchange}-{suffix}")
}

/// A broker object created to implement a tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TapResource {
    Exchange(String),
    ExchangeBinding {
        destination: String,
        source: String,
        binding_key: String,
    },
    Queue(String),
    QueueBinding {
        queue: String,
        exchange: String,
    },
}

impl TapResource {
    fn is_queue_side(&self) -> bool {
        matches!(self, TapResource::Queue(_) | TapResource::QueueBinding { .. })
    }

    async fn remove<Ch: BrokerChannel>(&self, channel: &Ch) -> Result<(), BrokerError> {
        match self {
            TapResource::Exchange(name) => channel.delete_exchange(name).await,
            TapResource::ExchangeBinding {
                destination,
                source,
                binding_key,
            } => channel.unbind_exchange(destination, source, binding_key).await,
            TapResource::Queue(name) => channel.delete_queue(name).await,
            TapResource::QueueBinding { queue, exchange } => {
                channel.unbind_queue(queue, exchange, "").await
            }
        }
    }
}

impl fmt::Display for TapResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapResource::Exchange(name) => write!(f, "exchange {name}"),
            TapResource::ExchangeBinding {
                destination,
                source,
                binding_key,
            } => write!(f, "binding {source} -> {destination} ({binding_key})"),
            TapResource::Queue(name) => write!(f, "queue {name}"),
            TapResource::QueueBinding { queue, exchange } => {
                write!(f, "binding {exchange} -> {queue}")
            }
        }
    }
}

/// Taps a list of exchanges on one connection.
pub struct TapWorker {
    bindings: Vec<ExchangeBinding>,
    output: EnvelopeSender,
    setup_retry_delay: Duration,
    span: Span,
}

impl TapWorker {
    /// Create a tap worker pushing tapped messages onto `output`. Events are
    /// logged inside `span`.
    pub fn new(bindings: Vec<ExchangeBinding>, output: EnvelopeSender, span: Span) -> Self {
        Self {
            bindings,
            output,
            setup_retry_delay: DEFAULT_RETRY_DELAY,
            span,
        }
    }

    /// Delay before asking for a reconnect after a failed setup.
    pub fn with_setup_retry_delay(mut self, delay: Duration) -> Self {
        self.setup_retry_delay = delay;
        self
    }

    async fn run_epoch<C: BrokerConnection>(
        &mut self,
        connection: Arc<C>,
        control: ControlReceiver,
    ) -> ReconnectAction {
        let mut ledger = Vec::new();
        // consumers live as long as their channels
        let mut channels = Vec::with_capacity(self.bindings.len());
        let mut inputs = Vec::with_capacity(self.bindings.len() + 1);

        for binding in &self.bindings {
            match establish_tap(connection.as_ref(), binding, &mut ledger).await {
                Ok((channel, deliveries)) => {
                    channels.push(channel);
                    inputs.push(deliveries.map(WorkerEvent::Delivery).boxed());
                }
                Err(source) => {
                    tracing::error!(
                        exchange = %binding.exchange,
                        error = %source,
                        "Tap setup failed"
                    );
                    let _ = self
                        .output
                        .send(Envelope::Failed(TapError::Setup {
                            exchange: binding.exchange.clone(),
                            source,
                        }))
                        .await;
                    teardown(connection.as_ref(), &mut ledger).await;
                    drop(inputs);
                    drop(channels);
                    return self.backoff(&control).await;
                }
            }
        }

        inputs.push(control.into_stream().map(WorkerEvent::Control).boxed());
        let mut fanin = FanIn::new(inputs);
        tracing::info!(taps = self.bindings.len(), "Tapping exchanges");

        let action = forward_deliveries(&mut fanin, &self.output).await;

        // cancelling a consumer lets the broker auto-delete its queue, so the
        // consumers stay attached until the explicit deletes are done
        teardown(connection.as_ref(), &mut ledger).await;
        fanin.stop().await;
        drop(channels);
        action
    }

    /// Wait before the next attempt, unless told to shut down meanwhile.
    async fn backoff(&self, control: &ControlReceiver) -> ReconnectAction {
        tokio::select! {
            signal = control.recv() => match signal {
                Some(ControlSignal::Reconnect) => ReconnectAction::Reconnect,
                _ => ReconnectAction::Stop,
            },
            _ = tokio::time::sleep(self.setup_retry_delay) => ReconnectAction::Reconnect,
        }
    }
}

#[async_trait]
impl<C: BrokerConnection> Worker<C> for TapWorker {
    async fn run(&mut self, connection: Arc<C>, control: ControlReceiver) -> ReconnectAction {
        let span = self.span.clone();
        self.run_epoch(connection, control).instrument(span).await
    }
}

/// Create the tap topology for one exchange and start consuming it.
///
/// Every object is recorded in `ledger` as soon as it exists, so a failure
/// half way leaves the ledger describing exactly what must be removed.
async fn establish_tap<C: BrokerConnection>(
    connection: &C,
    binding: &ExchangeBinding,
    ledger: &mut Vec<TapResource>,
) -> Result<(C::Channel, DeliveryStream), BrokerError> {
    let suffix = Uuid::new_v4().simple().to_string();
    let exchange = tap_exchange_name(&binding.exchange, &suffix);
    let queue = tap_queue_name(&binding.exchange, &suffix);

    let channel = connection.open_channel().await?;

    let exchange_options = ExchangeOptions {
        durable: false,
        auto_delete: true,
        internal: true,
    };
    channel
        .declare_exchange(&exchange, ExchangeKind::Fanout, exchange_options)
        .await?;
    ledger.push(TapResource::Exchange(exchange.clone()));

    channel
        .bind_exchange(&exchange, &binding.exchange, &binding.binding_key)
        .await?;
    ledger.push(TapResource::ExchangeBinding {
        destination: exchange.clone(),
        source: binding.exchange.clone(),
        binding_key: binding.binding_key.clone(),
    });

    let queue_options = QueueOptions {
        durable: false,
        auto_delete: true,
        exclusive: true,
    };
    channel.declare_queue(&queue, queue_options).await?;
    ledger.push(TapResource::Queue(queue.clone()));

    channel.bind_queue(&queue, &exchange, "").await?;
    ledger.push(TapResource::QueueBinding {
        queue: queue.clone(),
        exchange: exchange.clone(),
    });

    let deliveries = channel
        .consume(&queue, &format!("amqptap-{suffix}"))
        .await?;

    tracing::debug!(
        exchange = %binding.exchange,
        binding_key = %binding.binding_key,
        tap_exchange = %exchange,
        tap_queue = %queue,
        "Tap established"
    );
    Ok((channel, deliveries))
}

/// Remove every resource in `ledger`: queue side first, then exchange side,
/// each in reverse creation order.
///
/// Runs on its own channel, opened on first use and again after the broker
/// closed it. A stale channel is reopened once per resource and the removal
/// retried once. Resources the broker already removed are skipped quietly,
/// other failures are logged and otherwise ignored.
pub(crate) async fn teardown<C: BrokerConnection>(connection: &C, ledger: &mut Vec<TapResource>) {
    if ledger.is_empty() {
        return;
    }

    let order: Vec<&TapResource> = ledger
        .iter()
        .rev()
        .filter(|r| r.is_queue_side())
        .chain(ledger.iter().rev().filter(|r| !r.is_queue_side()))
        .collect();

    let mut channel = None;
    for resource in order {
        let mut result = remove_on(connection, &mut channel, resource).await;
        if matches!(&result, Err(e) if e.is_stale_channel()) {
            tracing::debug!(resource = %resource, "Reopening teardown channel");
            channel = None;
            result = remove_on(connection, &mut channel, resource).await;
        }
        if result.is_err() {
            // a refused operation closes the channel
            channel = None;
        }

        match result {
            Ok(()) => tracing::debug!(resource = %resource, "Removed tap resource"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(resource = %resource, "Tap resource already removed")
            }
            Err(e) => tracing::warn!(resource = %resource, error = %e, "Removing tap resource failed"),
        }
    }

    ledger.clear();
}

async fn remove_on<C: BrokerConnection>(
    connection: &C,
    channel: &mut Option<C::Channel>,
    resource: &TapResource,
) -> Result<(), BrokerError> {
    if channel.is_none() {
        *channel = Some(connection.open_channel().await?);
    }
    match channel.as_ref() {
        Some(channel) => resource.remove(channel).await,
        None => Err(BrokerError::ChannelClosed("no teardown channel".into())),
    }
}
