//! Running state shared by the consuming workers.

use crate::broker::{Delivery, TappedMessage};
use crate::control::{ControlSignal, ReconnectAction};
use crate::envelope::{Envelope, EnvelopeSender};
use crate::error::BrokerError;
use crate::fanin::FanIn;

/// Item merged by a consuming worker's fan-in.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Delivery(Result<Delivery, BrokerError>),
    Control(ControlSignal),
}

/// Forward deliveries to `output` until a control signal says otherwise.
///
/// Returns `Stop` on shutdown or when nobody listens on `output` anymore,
/// `Reconnect` when the connection was lost.
pub(crate) async fn forward_deliveries(
    fanin: &mut FanIn<WorkerEvent>,
    output: &EnvelopeSender,
) -> ReconnectAction {
    while let Some(event) = fanin.recv().await {
        match event {
            WorkerEvent::Delivery(Ok(delivery)) => {
                tracing::trace!(
                    exchange = %delivery.exchange,
                    routing_key = %delivery.routing_key,
                    bytes = delivery.body.len(),
                    "Message received"
                );
                let envelope = Envelope::Delivered(TappedMessage::new(delivery));
                if output.send(envelope).await.is_err() {
                    tracing::debug!("Output closed, stopping");
                    return ReconnectAction::Stop;
                }
            }
            WorkerEvent::Delivery(Err(e)) => {
                tracing::warn!(error = %e, "Consumer failed");
            }
            WorkerEvent::Control(ControlSignal::Shutdown) => {
                tracing::info!("Shutdown requested");
                return ReconnectAction::Stop;
            }
            WorkerEvent::Control(ControlSignal::Reconnect) => {
                tracing::info!("Reconnect requested");
                return ReconnectAction::Reconnect;
            }
        }
    }

    ReconnectAction::Stop
}
