use super::IdentifyQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Delay before the first turn is handed out after the queue wakes up
pub const WARMUP_DELAY: Duration = Duration::from_millis(250);

/// Spacing between turns in one bucket. Above the documented 5 s minimum to
/// leave room for connection setup.
pub const BUCKET_PERIOD: Duration = Duration::from_secs(6);

/// In-process identify queue: one FIFO per `shard % max_concurrency` bucket,
/// drained one waiter per bucket per period.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    max_concurrency: u32,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    buckets: BTreeMap<u32, VecDeque<oneshot::Sender<()>>>,
    refill_running: bool,
}

impl LocalQueue {
    pub fn new(max_concurrency: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn max_concurrency(&self) -> u32 {
        self.inner.max_concurrency
    }

    /// Number of waiters still queued (including abandoned ones not yet skipped)
    pub fn pending(&self) -> usize {
        self.inner.state.lock().buckets.values().map(VecDeque::len).sum()
    }

    fn enqueue(&self, shard_id: u32) -> oneshot::Receiver<()> {
        let bucket = shard_id % self.inner.max_concurrency;
        let (tx, rx) = oneshot::channel();

        let mut state = self.inner.state.lock();
        state.buckets.entry(bucket).or_default().push_back(tx);
        if !state.refill_running {
            state.refill_running = true;
            tokio::spawn(refill(self.inner.clone()));
        }
        rx
    }
}

impl IdentifyQueue for LocalQueue {
    async fn await_turn(&self, shard_id: u32) {
        let rx = self.enqueue(shard_id);
        debug!("[SHARD-{}] Waiting for identify turn", shard_id);
        // The refill task owns the sender until it is used, so an error
        // here only happens if the runtime is shutting down.
        let _ = rx.await;
    }
}

async fn refill(inner: Arc<Inner>) {
    sleep(WARMUP_DELAY).await;

    loop {
        {
            let mut state = inner.state.lock();
            let mut granted = 0usize;
            for (bucket, queue) in state.buckets.iter_mut() {
                // Waiters that gave up are dropped without using the slot
                while let Some(tx) = queue.pop_front() {
                    if tx.send(()).is_ok() {
                        debug!(
                            "Allowing identify for bucket {} ({} left in queue)",
                            bucket,
                            queue.len()
                        );
                        granted += 1;
                        break;
                    }
                }
            }

            if granted == 0 {
                state.refill_running = false;
                return;
            }
        }

        sleep(BUCKET_PERIOD).await;
    }
}
