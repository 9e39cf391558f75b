use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Runs one periodic heartbeat timer.
///
/// The first tick fires after a random 5%-95% of the interval so that shards
/// started together do not heartbeat in lockstep; later ticks are spaced by
/// exactly one interval.
#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    worker: Option<Worker>,
}

#[derive(Debug)]
struct Worker {
    interval: Duration,
    cancel_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking, stopping any previous schedule first.
    pub async fn start<F, Fut>(&mut self, interval: Duration, mut callback: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop().await;

        let initial_delay = initial_delay(interval);
        debug!(
            "Starting heartbeat every {:?} (first in {:?})",
            interval, initial_delay
        );

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {}
                }
                // Not cancellable: stop() waits for this to return.
                callback().await;
            }
        });

        self.worker = Some(Worker {
            interval,
            cancel_tx,
            handle,
        });
    }

    /// Cancel the schedule and wait for an in-flight callback to finish.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.cancel_tx.send(());
        if let Err(e) = worker.handle.await {
            if e.is_panic() {
                warn!("Heartbeat callback panicked: {:?}", e);
            }
        }
    }

    /// Interval of the running schedule, if any
    pub fn current_interval(&self) -> Option<Duration> {
        self.worker.as_ref().map(|w| w.interval)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
    }
}

/// Random delay in [5%, 95%) of the interval
pub(crate) fn initial_delay(interval: Duration) -> Duration {
    interval.mul_f64(0.05 + rand::random::<f64>() * 0.9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_initial_delay_bounds() {
        let interval = Duration::from_millis(40_000);
        for _ in 0..1000 {
            let delay = initial_delay(interval);
            assert!(delay >= Duration::from_millis(2_000));
            assert!(delay < Duration::from_millis(38_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_jittered_then_every_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = HeartbeatScheduler::new();
        let started = Instant::now();

        scheduler
            .start(Duration::from_millis(40_000), move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Instant::now());
                }
            })
            .await;

        let first = rx.recv().await.unwrap();
        let first_delay = first - started;
        assert!(first_delay >= Duration::from_millis(2_000));
        assert!(first_delay < Duration::from_millis(38_000));

        let mut previous = first;
        for _ in 0..3 {
            let next = rx.recv().await.unwrap();
            let spacing = next - previous;
            assert!(spacing >= Duration::from_millis(40_000));
            assert!(spacing <= Duration::from_millis(40_001));
            previous = next;
        }

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_callback() {
        let finished = Arc::new(AtomicUsize::new(0));
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let mut scheduler = HeartbeatScheduler::new();

        let counter = finished.clone();
        scheduler
            .start(Duration::from_millis(1_000), move || {
                let counter = counter.clone();
                let entered_tx = entered_tx.clone();
                async move {
                    let _ = entered_tx.send(());
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        entered_rx.recv().await.unwrap();
        scheduler.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut scheduler = HeartbeatScheduler::new();
        scheduler.stop().await;

        let counter = count.clone();
        scheduler
            .start(Duration::from_millis(1_000), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        assert_eq!(scheduler.current_interval(), Some(Duration::from_millis(1_000)));

        scheduler.stop().await;
        scheduler.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.current_interval(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_schedule() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = HeartbeatScheduler::new();

        for generation in 0..2u32 {
            let tx = tx.clone();
            scheduler
                .start(Duration::from_millis(1_000), move || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(generation);
                    }
                })
                .await;
        }

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(1));
        }
        scheduler.stop().await;
    }
}
