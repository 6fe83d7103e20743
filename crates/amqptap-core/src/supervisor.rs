//! Connection supervision.
//!
//! A [`ConnectionSupervisor`] owns the broker connection of one worker. It
//! dials until the broker answers, runs the worker for as long as the
//! connection lives, and redials when the worker asks for it. Broker-initiated
//! disconnects and caller-initiated shutdown reach the worker over the same
//! control path, so a worker waits for both in one place.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc::error::TrySendError, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::broker::{BrokerConnection, Dialer};
use crate::config::SupervisorConfig;
use crate::control::{control_channel, ControlReceiver, ControlSender, ControlSignal, ReconnectAction};
use crate::error::{BrokerError, TapError};

/// Work done on one connection epoch.
///
/// The worker must return after observing a control signal, after tearing
/// down everything it created on the connection.
#[async_trait]
pub trait Worker<C: BrokerConnection>: Send {
    async fn run(&mut self, connection: Arc<C>, control: ControlReceiver) -> ReconnectAction;
}

#[async_trait]
impl<C, F, Fut> Worker<C> for F
where
    C: BrokerConnection,
    F: FnMut(Arc<C>, ControlReceiver) -> Fut + Send,
    Fut: Future<Output = ReconnectAction> + Send + 'static,
{
    async fn run(&mut self, connection: Arc<C>, control: ControlReceiver) -> ReconnectAction {
        (self)(connection, control).await
    }
}

type CloseOutcome = Option<Result<(), BrokerError>>;

/// Keeps one worker connected to one broker.
pub struct ConnectionSupervisor<D: Dialer> {
    uri: String,
    dialer: D,
    config: SupervisorConfig,
    span: Span,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    shutdown_requested: AtomicBool,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    done: watch::Sender<CloseOutcome>,
}

impl<D: Dialer> ConnectionSupervisor<D> {
    /// Create a supervisor. Events are logged inside `span`.
    pub fn new(uri: impl Into<String>, dialer: D, config: SupervisorConfig, span: Span) -> Self {
        let (control_tx, control_rx) = control_channel();
        let (done, _) = watch::channel(None);

        Self {
            uri: uri.into(),
            dialer,
            config,
            span,
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            control_tx,
            control_rx,
            done,
        }
    }

    /// True while a connection is established.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect and run `worker` until it asks to stop or [`close`] is called.
    ///
    /// Dial errors are never returned, they are retried forever. The result
    /// is that of closing the final connection.
    ///
    /// [`close`]: ConnectionSupervisor::close
    pub async fn connect<W>(&self, worker: &mut W) -> Result<(), TapError>
    where
        W: Worker<D::Connection>,
    {
        let result = self.supervise(worker).instrument(self.span.clone()).await;
        self.done.send_replace(Some(result.clone()));
        result.map_err(TapError::Close)
    }

    /// Ask the running worker to shut down and wait for [`connect`] to
    /// return. Calling it again waits for the same outcome.
    ///
    /// [`connect`]: ConnectionSupervisor::connect
    pub async fn close(&self) -> Result<(), TapError> {
        if !self.ever_connected.load(Ordering::SeqCst) {
            return Err(TapError::NotConnected);
        }

        let mut done = self.done.subscribe();
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!(parent: &self.span, "Sending shutdown signal");
            tokio::select! {
                _ = self.control_tx.send(ControlSignal::Shutdown) => {}
                _ = done.wait_for(Option::is_some) => {}
            }
        }

        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Err(e)) => Err(TapError::Close(e)),
            _ => Ok(()),
        }
    }

    async fn supervise<W>(&self, worker: &mut W) -> Result<(), BrokerError>
    where
        W: Worker<D::Connection>,
    {
        loop {
            let Some(connection) = self.redial().await else {
                tracing::info!("Shutdown requested while connecting");
                return Ok(());
            };
            let connection = Arc::new(connection);

            self.ever_connected.store(true, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            tracing::info!("Connected to broker");

            let cancel = CancellationToken::new();
            let watcher = connection.disconnected().map(|disconnected| {
                tokio::spawn(
                    watch_disconnect(disconnected, self.control_tx.clone(), cancel.clone())
                        .instrument(Span::current()),
                )
            });

            let action = worker.run(connection.clone(), self.control_rx.clone()).await;

            cancel.cancel();
            if let Some(watcher) = watcher {
                let _ = watcher.await;
            }

            let closed = connection.close().await;
            self.connected.store(false, Ordering::SeqCst);

            if action == ReconnectAction::Stop || self.shutdown_requested.load(Ordering::SeqCst) {
                match &closed {
                    Ok(()) => tracing::info!("Connection closed"),
                    Err(e) => tracing::warn!(error = %e, "Closing connection failed"),
                }
                return closed;
            }

            if let Err(e) = closed {
                tracing::debug!(error = %e, "Closing stale connection failed");
            }
            tracing::info!("Reconnecting");
        }
    }

    /// Dial until a connection is established. Returns `None` if shutdown
    /// is requested in the meantime.
    async fn redial(&self) -> Option<D::Connection> {
        loop {
            // reconnect signals left over from the last epoch are stale
            while let Some(signal) = self.control_rx.try_recv() {
                if signal == ControlSignal::Shutdown {
                    return None;
                }
            }
            if self.shutdown_requested.load(Ordering::SeqCst) {
                return None;
            }

            tokio::select! {
                biased;
                signal = self.control_rx.recv() => {
                    if signal != Some(ControlSignal::Reconnect) {
                        return None;
                    }
                }
                connection = self.dial_once() => {
                    if connection.is_some() {
                        return connection;
                    }
                }
            }
        }
    }

    async fn dial_once(&self) -> Option<D::Connection> {
        match self.dialer.dial(&self.uri).await {
            Ok(connection) => Some(connection),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in = ?self.config.retry_delay,
                    "Dial failed, retrying"
                );
                tokio::time::sleep(self.config.retry_delay).await;
                None
            }
        }
    }
}

/// Turn an unsolicited disconnect into a reconnect signal, unless the epoch
/// ends first.
async fn watch_disconnect(
    disconnected: oneshot::Receiver<BrokerError>,
    control: ControlSender,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        cause = disconnected => {
            let Ok(cause) = cause else { return };
            tracing::warn!(error = %cause, "Connection lost");
            match control.try_send(ControlSignal::Reconnect) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Control signal already pending, reconnect not queued");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBroker, MockConnection};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn supervisor(broker: &MockBroker) -> Arc<ConnectionSupervisor<MockBroker>> {
        let config = SupervisorConfig {
            retry_delay: Duration::from_millis(5),
        };
        Arc::new(ConnectionSupervisor::new(
            "amqp://mock",
            broker.clone(),
            config,
            Span::none(),
        ))
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_retries_dial_until_broker_is_reachable() {
        let broker = MockBroker::new();
        broker.fail_next_dials(3);
        let sup = supervisor(&broker);

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut worker = move |_conn: Arc<MockConnection>, _control: ControlReceiver| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { ReconnectAction::Stop }
        };

        assert_ok!(sup.connect(&mut worker).await);
        assert_eq!(broker.dial_attempts(), 4);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!sup.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_retries_wait_the_retry_delay() {
        let broker = MockBroker::new();
        broker.fail_next_dials(3);
        let sup = Arc::new(ConnectionSupervisor::new(
            "amqp://mock",
            broker.clone(),
            SupervisorConfig {
                retry_delay: Duration::from_secs(2),
            },
            Span::none(),
        ));

        let start = tokio::time::Instant::now();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let started = runs.clone();
        let mut worker = move |_conn: Arc<MockConnection>, _control: ControlReceiver| {
            started.lock().unwrap().push(start.elapsed());
            async { ReconnectAction::Stop }
        };

        assert_ok!(sup.connect(&mut worker).await);
        assert_eq!(broker.dial_attempts(), 4);

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        // three failed dials, each followed by the full delay
        assert!(runs[0] >= Duration::from_secs(6), "worker started after {:?}", runs[0]);
        assert!(runs[0] < Duration::from_secs(8), "worker started after {:?}", runs[0]);
    }

    #[tokio::test]
    async fn test_disconnect_triggers_reconnect() {
        let broker = MockBroker::new();
        let sup = supervisor(&broker);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_worker = seen.clone();
        let trigger = broker.clone();
        let mut epoch = 0;
        let mut worker = move |_conn: Arc<MockConnection>, control: ControlReceiver| {
            epoch += 1;
            let first = epoch == 1;
            let seen = seen_by_worker.clone();
            let trigger = trigger.clone();
            async move {
                if !first {
                    return ReconnectAction::Stop;
                }
                trigger.drop_connection();
                let signal = control.recv().await;
                seen.lock().unwrap().push(signal);
                ReconnectAction::Reconnect
            }
        };

        assert_ok!(sup.connect(&mut worker).await);
        assert_eq!(*seen.lock().unwrap(), vec![Some(ControlSignal::Reconnect)]);
        assert_eq!(broker.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_delivers_one_shutdown_and_waits() {
        let broker = MockBroker::new();
        let sup = supervisor(&broker);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_worker = seen.clone();
        let mut worker = move |_conn: Arc<MockConnection>, control: ControlReceiver| {
            let seen = seen_by_worker.clone();
            async move {
                loop {
                    let signal = control.recv().await;
                    seen.lock().unwrap().push(signal);
                    if signal == Some(ControlSignal::Shutdown) {
                        return ReconnectAction::Stop;
                    }
                }
            }
        };

        let running = sup.clone();
        let task = tokio::spawn(async move { running.connect(&mut worker).await });

        eventually(|| sup.connected()).await;
        assert_ok!(sup.close().await);

        assert_ok!(task.await.unwrap());
        assert_eq!(*seen.lock().unwrap(), vec![Some(ControlSignal::Shutdown)]);
        assert!(!sup.connected());
        assert_eq!(broker.closed_connections(), 1);

        // closing again sends nothing and returns the same outcome
        assert_ok!(sup.close().await);
        assert_eq!(sup.control_rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_before_connect_fails() {
        let broker = MockBroker::new();
        let sup = supervisor(&broker);

        let err = assert_err!(sup.close().await);
        assert!(matches!(err, TapError::NotConnected));
        assert_eq!(sup.control_rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_while_redialing() {
        let broker = MockBroker::new();
        let sup = supervisor(&broker);

        let outage = broker.clone();
        let mut worker = move |_conn: Arc<MockConnection>, _control: ControlReceiver| {
            outage.fail_next_dials(usize::MAX);
            async { ReconnectAction::Reconnect }
        };

        let running = sup.clone();
        let task = tokio::spawn(async move { running.connect(&mut worker).await });

        eventually(|| broker.dial_attempts() >= 3).await;
        assert!(!sup.connected());
        assert_ok!(sup.close().await);
        assert_ok!(task.await.unwrap());
    }
}
