//! Bounded Batcher
//!
//! Accumulates items and hands them to an async processing function once the
//! buffer reaches `batch_size` or every `interval`, whichever comes first.
//! Producers only hold the buffer lock long enough to push or swap; the
//! processing function always runs outside it. Failed batches are logged and
//! dropped, the caller may re-enqueue.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::metrics;

type Processor<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Shared<T> {
    buffer: Mutex<Vec<T>>,
    /// Serialises flush cycles so two snapshots are never processed at once
    flush_lock: tokio::sync::Mutex<()>,
    batch_size: usize,
    processor: Processor<T>,
}

impl<T: Send + 'static> Shared<T> {
    fn take_all(&self) -> Vec<T> {
        match self.buffer.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    async fn process(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }

        let _cycle = self.flush_lock.lock().await;
        let size = batch.len();
        match (self.processor)(batch).await {
            Ok(()) => {
                metrics::record_batcher_flush("success");
                debug!(size, "Batch flushed");
            }
            Err(e) => {
                metrics::record_batcher_flush("error");
                error!(size, error = %e, "Batch processing failed, batch dropped");
            }
        }
    }
}

pub struct BoundedBatcher<T> {
    shared: Arc<Shared<T>>,
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Size-triggered flushes still in flight
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> BoundedBatcher<T> {
    /// Create the batcher and start its flush timer. Must be called inside a
    /// tokio runtime. A zero interval is treated as one millisecond.
    pub fn new<F, Fut>(batch_size: usize, interval: Duration, processor: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let processor: Processor<T> = Arc::new(move |batch| Box::pin(processor(batch)));
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            flush_lock: tokio::sync::Mutex::new(()),
            batch_size: batch_size.max(1),
            processor,
        });

        let interval = interval.max(Duration::from_millis(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let timer_shared = Arc::clone(&shared);
        let timer = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let batch = timer_shared.take_all();
                        timer_shared.process(batch).await;
                    }
                }
            }
        });

        Self {
            shared,
            shutdown,
            timer: Mutex::new(Some(timer)),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Append one item; a full buffer is swapped out and processed on a
    /// separate task.
    pub fn add(&self, item: T) {
        let full = {
            let mut buffer = match self.shared.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.push(item);
            if buffer.len() >= self.shared.batch_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(async move { shared.process(batch).await });
            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.retain(|h| !h.is_finished());
                in_flight.push(handle);
            }
        }
    }

    /// Process whatever is buffered right now.
    pub async fn flush(&self) {
        let batch = self.shared.take_all();
        self.shared.process(batch).await;
    }

    /// Items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Stop the timer, wait for in-flight batches and drain the buffer.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let timer = self.timer.lock().ok().and_then(|mut t| t.take());
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Batcher timer task ended abnormally");
            }
        }

        let in_flight = self
            .in_flight
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default();
        for handle in in_flight {
            let _ = handle.await;
        }

        self.flush().await;
    }
}
