//! Fan-in multiplexer.
//!
//! Merges a set of input streams, fixed when the multiplexer is built, into a
//! single output stream. One merge task owns the registry of input slots and
//! rebuilds its wait-set on every iteration, so closed inputs simply drop
//! out of it. The merge only ends through [`FanIn::stop`] (or by dropping
//! the handle), never because inputs ran dry.

use futures::future::{self, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Handle to a running fan-in.
pub struct FanIn<T> {
    output: Option<mpsc::Receiver<T>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> FanIn<T> {
    /// Start merging `inputs`.
    pub fn new(inputs: Vec<BoxStream<'static, T>>) -> Self {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(merge(inputs, out_tx, stop_rx));

        Self {
            output: Some(out_rx),
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Receive the next merged item. Returns `None` once stopped.
    pub async fn recv(&mut self) -> Option<T> {
        match self.output.as_mut() {
            Some(output) => output.recv().await,
            None => None,
        }
    }

    /// Stop merging and close the output stream.
    ///
    /// Items still buffered in the inputs or in the output are discarded.
    /// Returns after the merge task has exited.
    pub async fn stop(&mut self) {
        self.output = None;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Fan-in merge task failed");
            }
        }
    }

    /// True while the merge task is running.
    pub fn alive(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

async fn merge<T: Send + 'static>(
    inputs: Vec<BoxStream<'static, T>>,
    output: mpsc::Sender<T>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut slots: Vec<Option<BoxStream<'static, T>>> = inputs.into_iter().map(Some).collect();
    let mut round = 0usize;

    loop {
        let (idx, item) = {
            let mut waits: Vec<_> = slots
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, slot)| {
                    slot.as_mut()
                        .map(|input| async move { (idx, input.next().await) }.boxed())
                })
                .collect();

            if waits.is_empty() {
                let _ = (&mut stop).await;
                return;
            }

            // rotate so a busy low-index input cannot starve the others
            let offset = round % waits.len();
            waits.rotate_left(offset);
            round = round.wrapping_add(1);

            tokio::select! {
                biased;
                _ = &mut stop => return,
                ((idx, item), _, _) = future::select_all(waits) => (idx, item),
            }
        };

        match item {
            Some(item) => {
                tokio::select! {
                    biased;
                    _ = &mut stop => return,
                    sent = output.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            None => {
                tracing::trace!(input = idx, "Fan-in input closed");
                slots[idx] = None;
            }
        }
    }
}
