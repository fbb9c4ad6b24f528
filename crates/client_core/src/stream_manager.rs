//! Owns the single live subscription and its reader/dispatch tasks.
//!
//! A reader task awaits the event source and pushes into a bounded queue; a
//! dispatch task drains the queue and hands messages to a [`StreamSink`] in
//! arrival order. Shutdown is cooperative through a close signal and bounded
//! by a timeout, after which both tasks are aborted.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::protocol::RawMessage;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SyncError},
    transport::{EventSource, MessagingClient},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Failed,
}

/// Receives live events. Called from the dispatch task, one call at a time.
pub trait StreamSink: Send + Sync + 'static {
    fn on_message(&self, raw: RawMessage);
    fn on_failure(&self, error: &SyncError);
}

enum StreamItem {
    Message(RawMessage),
    Failed(SyncError),
    Ended,
}

struct ActiveStream {
    generation: u64,
    close: watch::Sender<bool>,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl ActiveStream {
    async fn shutdown(self, limit: Duration) {
        let ActiveStream {
            generation,
            close,
            mut reader,
            mut dispatcher,
        } = self;
        let _ = close.send(true);

        let joined = tokio::time::timeout(limit, async {
            let _ = (&mut dispatcher).await;
            let _ = (&mut reader).await;
        })
        .await;

        if joined.is_err() {
            warn!(
                generation,
                timeout_ms = limit.as_millis() as u64,
                "stream: close did not finish in time, aborting tasks; subscription handle may leak"
            );
            reader.abort();
            dispatcher.abort();
            let _ = dispatcher.await;
            let _ = reader.await;
        }
    }
}

struct Slot {
    state: StreamState,
    /// Bumped on every start so late completions can tell they were superseded.
    attempt: u64,
    active: Option<ActiveStream>,
}

struct Shared {
    slot: Mutex<Slot>,
    state_tx: watch::Sender<StreamState>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, slot: &mut Slot, next: StreamState) {
        slot.state = next;
        self.state_tx.send_replace(next);
    }

    /// Moves a still-current streaming attempt to `next`.
    fn finish(&self, attempt: u64, next: StreamState) -> bool {
        let mut slot = self.slot();
        if slot.attempt != attempt || slot.state != StreamState::Streaming {
            return false;
        }
        self.set_state(&mut slot, next);
        true
    }
}

pub struct StreamManager {
    shared: Arc<Shared>,
    queue_capacity: usize,
    stop_timeout: Duration,
}

impl StreamManager {
    pub fn new(queue_capacity: usize, stop_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Idle);
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: StreamState::Idle,
                    attempt: 0,
                    active: None,
                }),
                state_tx,
            }),
            queue_capacity: queue_capacity.max(1),
            stop_timeout,
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.slot().state
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state_tx.subscribe()
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.shared.slot().active.as_ref().map(|a| a.generation)
    }

    /// Opens the live subscription for `generation` and starts delivering
    /// to `sink`.
    ///
    /// Rejected with [`SyncError::AlreadyActive`] while a subscription is
    /// starting, streaming or stopping. An open failure leaves the manager
    /// in [`StreamState::Failed`] and is not retried.
    pub async fn start(
        &self,
        client: &dyn MessagingClient,
        generation: u64,
        sink: Arc<dyn StreamSink>,
    ) -> Result<()> {
        let (attempt, leftover) = {
            let mut slot = self.shared.slot();
            if matches!(
                slot.state,
                StreamState::Starting | StreamState::Streaming | StreamState::Stopping
            ) {
                return Err(SyncError::AlreadyActive);
            }
            slot.attempt += 1;
            self.shared.set_state(&mut slot, StreamState::Starting);
            (slot.attempt, slot.active.take())
        };
        if let Some(leftover) = leftover {
            leftover.shutdown(self.stop_timeout).await;
        }

        info!(generation, "stream: opening subscription");
        let source = match client.subscribe().await {
            Ok(source) => source,
            Err(err) => {
                let mut slot = self.shared.slot();
                if slot.attempt == attempt && slot.state == StreamState::Starting {
                    self.shared.set_state(&mut slot, StreamState::Failed);
                }
                warn!(generation, error = %format!("{err:#}"), "stream: subscription open failed");
                return Err(SyncError::Transport(err));
            }
        };

        let (close_tx, close_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);

        let cancelled = {
            let mut slot = self.shared.slot();
            if slot.attempt != attempt || slot.state != StreamState::Starting {
                Some(source)
            } else {
                let reader =
                    tokio::spawn(read_events(source, queue_tx, close_rx.clone(), generation));
                let dispatcher = tokio::spawn(dispatch_events(
                    Arc::clone(&self.shared),
                    attempt,
                    generation,
                    queue_rx,
                    close_rx,
                    sink,
                ));
                slot.active = Some(ActiveStream {
                    generation,
                    close: close_tx,
                    reader,
                    dispatcher,
                });
                self.shared.set_state(&mut slot, StreamState::Streaming);
                None
            }
        };

        match cancelled {
            None => info!(generation, "stream: subscription opened"),
            Some(mut source) => {
                info!(generation, "stream: start cancelled by stop before it completed");
                if let Err(err) = source.close().await {
                    warn!(generation, error = %format!("{err:#}"), "stream: closing cancelled subscription failed");
                }
            }
        }
        Ok(())
    }

    /// Closes the current subscription. Idempotent: a call made while another
    /// stop is in progress waits for it instead of starting a second teardown.
    /// Once this returns the sink receives no further messages.
    ///
    /// The teardown runs on its own task, so dropping this future part way
    /// still brings the manager back to [`StreamState::Idle`].
    pub async fn stop(&self) {
        let mut states = {
            let mut slot = self.shared.slot();
            match slot.state {
                StreamState::Idle => return,
                StreamState::Starting => {
                    self.shared.set_state(&mut slot, StreamState::Idle);
                    return;
                }
                StreamState::Stopping => {}
                StreamState::Streaming | StreamState::Failed => match slot.active.take() {
                    None => {
                        self.shared.set_state(&mut slot, StreamState::Idle);
                        return;
                    }
                    Some(active) => {
                        self.shared.set_state(&mut slot, StreamState::Stopping);
                        tokio::spawn(teardown(
                            Arc::clone(&self.shared),
                            active,
                            self.stop_timeout,
                        ));
                    }
                },
            }
            self.shared.state_tx.subscribe()
        };
        let _ = states
            .wait_for(|state| *state != StreamState::Stopping)
            .await;
    }

    /// Stops the current subscription, then starts one for `generation`.
    pub async fn replace(
        &self,
        client: &dyn MessagingClient,
        generation: u64,
        sink: Arc<dyn StreamSink>,
    ) -> Result<()> {
        self.stop().await;
        self.start(client, generation, sink).await
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if let Some(active) = self.shared.slot().active.take() {
            let _ = active.close.send(true);
        }
    }
}

async fn teardown(shared: Arc<Shared>, active: ActiveStream, limit: Duration) {
    let generation = active.generation;
    active.shutdown(limit).await;
    info!(generation, "stream: subscription stopped");

    let mut slot = shared.slot();
    if slot.state == StreamState::Stopping {
        shared.set_state(&mut slot, StreamState::Idle);
    }
}

async fn read_events(
    mut source: Box<dyn EventSource>,
    queue: mpsc::Sender<StreamItem>,
    mut close: watch::Receiver<bool>,
    generation: u64,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = close.changed() => break,
            next = source.next_event() => match next {
                Some(Ok(raw)) => StreamItem::Message(raw),
                Some(Err(err)) => StreamItem::Failed(SyncError::Transport(err)),
                None => StreamItem::Ended,
            },
        };
        let terminal = !matches!(item, StreamItem::Message(_));
        let delivered = tokio::select! {
            biased;
            _ = close.changed() => false,
            sent = queue.send(item) => sent.is_ok(),
        };
        if terminal || !delivered {
            break;
        }
    }

    if let Err(err) = source.close().await {
        warn!(generation, error = %format!("{err:#}"), "stream: event source close failed");
    }
    debug!(generation, "stream: reader exited");
}

async fn dispatch_events(
    shared: Arc<Shared>,
    attempt: u64,
    generation: u64,
    mut queue: mpsc::Receiver<StreamItem>,
    mut close: watch::Receiver<bool>,
    sink: Arc<dyn StreamSink>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = close.changed() => break,
            item = queue.recv() => item,
        };
        let Some(item) = item else {
            break;
        };
        if *close.borrow() {
            break;
        }
        match item {
            StreamItem::Message(raw) => sink.on_message(raw),
            StreamItem::Failed(error) => {
                warn!(generation, %error, "stream: subscription failed");
                if shared.finish(attempt, StreamState::Failed) {
                    sink.on_failure(&error);
                }
                break;
            }
            StreamItem::Ended => {
                info!(generation, "stream: feed ended by the network");
                shared.finish(attempt, StreamState::Idle);
                break;
            }
        }
    }
    debug!(generation, "stream: dispatcher exited");
}

#[cfg(test)]
#[path = "tests/stream_manager_tests.rs"]
mod tests;
