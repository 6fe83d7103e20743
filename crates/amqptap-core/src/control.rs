//! Control protocol shared by the connection supervisor and its workers.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Mutex};

/// Signal sent from a supervisor to the worker running the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// The connection was lost, tear down and let the supervisor redial.
    Reconnect,
    /// The supervisor is closing, tear down and stop. Sent at most once.
    Shutdown,
}

/// What a worker wants the supervisor to do after an epoch ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Close the connection, dial again and rerun the worker.
    Reconnect,
    /// Close the connection and return.
    Stop,
}

/// Sending half of the control path.
pub(crate) type ControlSender = mpsc::Sender<ControlSignal>;

/// Receiving half of the control path handed to workers.
///
/// The channel outlives connection epochs, so the receiver is shared behind
/// a mutex and each epoch borrows it through a cheap clone of this handle.
#[derive(Debug, Clone)]
pub struct ControlReceiver {
    inner: Arc<Mutex<mpsc::Receiver<ControlSignal>>>,
}

/// Create the single-slot control path of a supervisor.
pub(crate) fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        tx,
        ControlReceiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

impl ControlReceiver {
    /// Wait for the next control signal. Cancel safe.
    pub async fn recv(&self) -> Option<ControlSignal> {
        self.inner.lock().await.recv().await
    }

    /// Take a signal if one is pending, without waiting.
    pub(crate) fn try_recv(&self) -> Option<ControlSignal> {
        self.inner.try_lock().ok()?.try_recv().ok()
    }

    /// Turn the receiver into a stream suitable as a fan-in input.
    pub fn into_stream(self) -> BoxStream<'static, ControlSignal> {
        stream::unfold(self, |rx| async move {
            let signal = rx.recv().await?;
            Some((signal, rx))
        })
        .boxed()
    }
}
