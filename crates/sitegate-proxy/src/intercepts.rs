//! Intercept queue and event fan-out.
//!
//! Request handlers never touch the recorder directly. Each block pushes an
//! [`InterceptRecord`] onto a bounded channel; a background flush task
//! drains it in batches (or on a timer) and applies the batch on a blocking
//! thread, so persistence never stalls the proxy's connection tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sitegate_core::{InterceptEvent, InterceptObserver, InterceptRecord, InterceptRecorder, SharedObserver};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sending half of the intercept queue.
#[derive(Clone, Debug)]
pub struct InterceptSender {
    tx: mpsc::Sender<InterceptRecord>,
}

impl InterceptSender {
    /// Enqueues a record without waiting. Returns false if it was dropped.
    pub fn push(&self, record: InterceptRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                warn!(
                    site_id = %record.site_id,
                    domain = %record.domain,
                    "Intercept queue full, dropping record"
                );
                false
            }
            Err(TrySendError::Closed(record)) => {
                debug!(site_id = %record.site_id, "Intercept queue closed, dropping record");
                false
            }
        }
    }
}

/// Bounded queue feeding the recorder from a background flush task.
pub struct InterceptQueue {
    sender: InterceptSender,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl InterceptQueue {
    /// Spawns the flush task.
    pub fn spawn(
        recorder: Arc<InterceptRecorder>,
        capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(flush_loop(
            recorder,
            rx,
            stop_rx,
            batch_size.max(1),
            flush_interval,
        ));

        Self {
            sender: InterceptSender { tx },
            stop_tx,
            task,
        }
    }

    pub fn sender(&self) -> InterceptSender {
        self.sender.clone()
    }

    /// Stops the flush task after writing everything still queued.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Intercept flush task failed: {}", e);
        }
    }
}

async fn flush_loop(
    recorder: Arc<InterceptRecorder>,
    mut rx: mpsc::Receiver<InterceptRecord>,
    mut stop_rx: oneshot::Receiver<()>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut pending = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    pending.push(record);
                    if pending.len() >= batch_size {
                        flush(&recorder, &mut pending).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(&recorder, &mut pending).await;
                }
            }
            _ = &mut stop_rx => {
                while let Ok(record) = rx.try_recv() {
                    pending.push(record);
                }
                break;
            }
        }
    }

    flush(&recorder, &mut pending).await;
    debug!("Intercept flush task stopped");
}

async fn flush(recorder: &Arc<InterceptRecorder>, pending: &mut Vec<InterceptRecord>) {
    if pending.is_empty() {
        return;
    }

    let batch = std::mem::take(pending);
    let recorder = Arc::clone(recorder);

    match tokio::task::spawn_blocking(move || recorder.record_batch(&batch)).await {
        Ok(applied) => debug!("Flushed {} intercept records", applied),
        Err(e) => warn!("Intercept flush failed: {}", e),
    }
}

/// Registered observers, shared between the server and its handlers.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<SharedObserver>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: SharedObserver) {
        self.inner.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Delivers an event to every observer.
    pub fn notify(&self, event: &InterceptEvent) {
        let observers = self.inner.read().clone();
        for observer in observers {
            observer.on_intercept(event);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("count", &self.len()).finish()
    }
}

/// Observer that forwards events into a bounded channel, dropping on overflow.
pub struct ChannelObserver {
    tx: mpsc::Sender<InterceptEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<InterceptEvent>) -> Self {
        Self { tx }
    }
}

impl InterceptObserver for ChannelObserver {
    fn on_intercept(&self, event: &InterceptEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(domain = %event.domain, "Intercept subscriber lagging, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
