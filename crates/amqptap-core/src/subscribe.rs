//! Queue subscription.
//!
//! Consumes an existing queue directly. Nothing is created on the broker,
//! so there is nothing to remove when an epoch ends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::control::{ControlReceiver, ReconnectAction};
use crate::envelope::{Envelope, EnvelopeSender};
use crate::error::{BrokerError, TapError};
use crate::fanin::FanIn;
use crate::supervisor::Worker;
use crate::worker::{forward_deliveries, WorkerEvent};

/// Consumes one queue and forwards its messages.
pub struct SubscribeWorker {
    queue: String,
    output: EnvelopeSender,
    span: Span,
}

impl SubscribeWorker {
    pub fn new(queue: impl Into<String>, output: EnvelopeSender, span: Span) -> Self {
        Self {
            queue: queue.into(),
            output,
            span,
        }
    }

    async fn run_epoch<C: BrokerConnection>(
        &mut self,
        connection: Arc<C>,
        control: ControlReceiver,
    ) -> ReconnectAction {
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(error = %e, "Could not open channel");
                return ReconnectAction::Reconnect;
            }
        };

        let consumer_tag = format!("amqptap-{}", Uuid::new_v4().simple());
        let deliveries = match channel.consume(&self.queue, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e @ BrokerError::ConnectionClosed(_)) => {
                tracing::warn!(error = %e, "Connection lost before consuming");
                return ReconnectAction::Reconnect;
            }
            Err(source) => {
                tracing::error!(queue = %self.queue, error = %source, "Consuming queue failed");
                let _ = self
                    .output
                    .send(Envelope::Failed(TapError::Consume {
                        queue: self.queue.clone(),
                        source,
                    }))
                    .await;
                return ReconnectAction::Stop;
            }
        };

        let inputs = vec![
            deliveries.map(WorkerEvent::Delivery).boxed(),
            control.into_stream().map(WorkerEvent::Control).boxed(),
        ];
        let mut fanin = FanIn::new(inputs);
        tracing::info!(queue = %self.queue, "Subscribed");

        let action = forward_deliveries(&mut fanin, &self.output).await;

        fanin.stop().await;
        drop(channel);
        action
    }
}

#[async_trait]
impl<C: BrokerConnection> Worker<C> for SubscribeWorker {
    async fn run(&mut self, connection: Arc<C>, control: ControlReceiver) -> ReconnectAction {
        let span = self.span.clone();
        self.run_epoch(connection, control).instrument(span).await
    }
}
