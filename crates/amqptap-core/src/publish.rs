//! Publishing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{Instrument, Span};

use crate::broker::{BrokerChannel, BrokerConnection, OutboundMessage};
use crate::control::{ControlReceiver, ControlSignal, ReconnectAction};
use crate::supervisor::Worker;

/// Publishes every message received on `outbound` until the stream ends.
///
/// A message that fails to publish is logged and dropped, publishing goes
/// on with the next one on a fresh channel. Messages waiting in `outbound` while the connection
/// is down are published after the supervisor has reconnected.
pub struct PublishWorker {
    outbound: mpsc::Receiver<OutboundMessage>,
    span: Span,
}

impl PublishWorker {
    pub fn new(outbound: mpsc::Receiver<OutboundMessage>, span: Span) -> Self {
        Self { outbound, span }
    }

    async fn run_epoch<C: BrokerConnection>(
        &mut self,
        connection: Arc<C>,
        control: ControlReceiver,
    ) -> ReconnectAction {
        let mut channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(error = %e, "Could not open channel");
                return ReconnectAction::Reconnect;
            }
        };
        tracing::debug!("Ready to publish");

        loop {
            tokio::select! {
                biased;
                signal = control.recv() => {
                    return match signal {
                        Some(ControlSignal::Reconnect) => ReconnectAction::Reconnect,
                        _ => ReconnectAction::Stop,
                    };
                }
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        tracing::debug!("Outbound stream closed");
                        return ReconnectAction::Stop;
                    };
                    match channel.publish(&message).await {
                        Ok(()) => tracing::trace!(
                            exchange = %message.exchange,
                            routing_key = %message.routing_key,
                            bytes = message.body.len(),
                            "Published"
                        ),
                        Err(e) => {
                            tracing::error!(
                                exchange = %message.exchange,
                                routing_key = %message.routing_key,
                                error = %e,
                                "Publish failed"
                            );
                            // the broker closes a channel on any refused operation
                            match connection.open_channel().await {
                                Ok(fresh) => channel = fresh,
                                Err(e) => {
                                    tracing::warn!(error = %e, "Could not reopen channel");
                                    return ReconnectAction::Reconnect;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<C: BrokerConnection> Worker<C> for PublishWorker {
    async fn run(&mut self, connection: Arc<C>, control: ControlReceiver) -> ReconnectAction {
        let span = self.span.clone();
        self.run_epoch(connection, control).instrument(span).await
    }
}
