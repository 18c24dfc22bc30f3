//! Global rate governance for outbound traffic.
//!
//! Two independent primitives plus a congestion signal:
//! - [`TokenBucket`] paces outbound HTTP fetches (capacity 5, refilled
//!   uniformly at 5 tokens/second by default). `acquire` is cancel-safe: a
//!   waiter abandoned mid-acquire never consumes a future token.
//! - [`LeakyBucket`] is a bounded FIFO of outbound notifications drained at
//!   a fixed cadence by a dedicated task, keeping a safety margin below the
//!   chat platform's hard message cap.
//! - [`LeakyBucket::is_congested`] reports when the queue depth exceeds the
//!   congestion threshold, letting the patrol engine skip a cycle instead
//!   of piling on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default fetch token capacity and refill rate (tokens per second).
pub const FETCH_TOKENS_PER_SECOND: usize = 5;

/// Default bound of the notification queue.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 1_000;

/// Default notification drain rate, messages per second. Kept below the
/// 30 msg/s external cap.
pub const NOTIFICATIONS_PER_SECOND: u32 = 25;

/// Queue depth above which the governor reports congestion.
pub const CONGESTION_DEPTH: usize = 50;

/// A token bucket refilled uniformly by a background task.
///
/// Tokens never accumulate beyond capacity. Dropping the bucket stops the
/// refill task.
pub struct TokenBucket {
    semaphore: Arc<Semaphore>,
    refiller: JoinHandle<()>,
}

impl TokenBucket {
    /// Create a bucket with the given capacity, refilled at
    /// `refill_per_second` tokens per second. Must be called from within a
    /// tokio runtime.
    pub fn new(capacity: usize, refill_per_second: usize) -> Self {
        let semaphore = Arc::new(Semaphore::new(capacity));
        let refill_handle = Arc::clone(&semaphore);
        let period = Duration::from_millis(1_000 / refill_per_second.max(1) as u64);
        let refiller = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if refill_handle.available_permits() < capacity {
                    refill_handle.add_permits(1);
                }
            }
        });
        Self { semaphore, refiller }
    }

    /// Bucket with the default fetch pacing (5 tokens, 5/s).
    pub fn for_fetches() -> Self {
        Self::new(FETCH_TOKENS_PER_SECOND, FETCH_TOKENS_PER_SECOND)
    }

    /// Take one token, waiting until one is available.
    ///
    /// Cancel-safe: dropping the returned future before completion leaves
    /// the bucket untouched.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .context("token bucket closed during shutdown")?;
        permit.forget();
        Ok(())
    }

    /// Tokens currently available without waiting.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop refills and fail all future acquires.
    pub fn close(&self) {
        self.semaphore.close();
        self.refiller.abort();
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.refiller.abort();
    }
}

/// Sending half of the bounded notification queue.
///
/// Cloneable; the queue closes (and the drainer exits) once every clone is
/// dropped.
#[derive(Clone)]
pub struct LeakyBucket<T> {
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> LeakyBucket<T> {
    /// Create a queue with the given hard capacity. The receiving half is
    /// handed to [`spawn_drainer`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a message, waiting only when the queue is at hard capacity.
    pub async fn enqueue(&self, msg: T) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .ok()
            .context("notification queue closed during shutdown")
    }

    /// Messages currently waiting to drain.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether the queue depth exceeds [`CONGESTION_DEPTH`].
    pub fn is_congested(&self) -> bool {
        self.depth() > CONGESTION_DEPTH
    }
}

/// Spawn the dedicated drainer task: pulls queued messages in FIFO order
/// and hands each to `deliver`, at most `per_second` per second.
///
/// The task exits once the queue is closed and fully drained.
pub fn spawn_drainer<T, F, Fut>(
    mut rx: mpsc::Receiver<T>,
    per_second: u32,
    deliver: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let period = Duration::from_millis(1_000 / u64::from(per_second.max(1)));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while let Some(msg) = rx.recv().await {
            tick.tick().await;
            deliver(msg).await;
        }
        tracing::debug!("notification drainer stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_starts_full() {
        let bucket = TokenBucket::new(5, 5);
        assert_eq!(bucket.available(), 5);
        for _ in 0..5 {
            bucket.acquire().await.expect("acquire");
        }
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(5, 5);
        for _ in 0..5 {
            bucket.acquire().await.expect("acquire");
        }

        let start = tokio::time::Instant::now();
        bucket.acquire().await.expect("acquire after refill");
        // One refill period (200ms at 5/s) must elapse before a token appears.
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_do_not_accumulate_beyond_capacity() {
        let bucket = TokenBucket::new(5, 5);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bucket.available(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_consume_a_token() {
        let bucket = TokenBucket::new(1, 5);
        bucket.acquire().await.expect("drain the only token");

        {
            let pending = bucket.acquire();
            tokio::pin!(pending);
            // Poll once so the waiter is queued, then drop it.
            let poll = futures_poll_once(&mut pending).await;
            assert!(poll.is_none());
        }

        // The abandoned waiter must not swallow the next refill.
        bucket.acquire().await.expect("acquire after abandonment");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_bucket_fails_acquire() {
        let bucket = TokenBucket::new(1, 5);
        bucket.close();
        assert!(bucket.acquire().await.is_err());
    }

    #[tokio::test]
    async fn queue_reports_depth_and_congestion() {
        let (queue, _rx) = LeakyBucket::new(1_000);
        assert_eq!(queue.depth(), 0);
        assert!(!queue.is_congested());

        for i in 0..=CONGESTION_DEPTH {
            queue.enqueue(i).await.expect("enqueue");
        }
        assert_eq!(queue.depth(), CONGESTION_DEPTH + 1);
        assert!(queue.is_congested());
    }

    #[tokio::test]
    async fn enqueue_fails_once_drainer_side_is_gone() {
        let (queue, rx) = LeakyBucket::new(4);
        drop(rx);
        assert!(queue.enqueue("msg").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drainer_preserves_fifo_order_and_cadence() {
        let (queue, rx) = LeakyBucket::new(100);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = spawn_drainer(rx, 25, move |msg: u32| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("lock").push(msg);
            }
        });

        let start = tokio::time::Instant::now();
        for i in 0..10u32 {
            queue.enqueue(i).await.expect("enqueue");
        }
        drop(queue);
        handle.await.expect("drainer");

        assert_eq!(*seen.lock().expect("lock"), (0..10).collect::<Vec<_>>());
        // Ten messages at 25/s never finish faster than ~360ms.
        assert!(start.elapsed() >= Duration::from_millis(340));
    }

    #[tokio::test(start_paused = true)]
    async fn drainer_counts_every_message() {
        let (queue, rx) = LeakyBucket::new(50);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let handle = spawn_drainer(rx, 25, move |_msg: &'static str| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..7 {
            queue.enqueue("notify").await.expect("enqueue");
        }
        drop(queue);
        handle.await.expect("drainer");
        assert_eq!(delivered.load(Ordering::SeqCst), 7);
    }

    /// Poll a future exactly once, returning its output if ready.
    async fn futures_poll_once<F: Future>(fut: &mut std::pin::Pin<&mut F>) -> Option<F::Output> {
        use std::task::Poll;
        std::future::poll_fn(|cx| match fut.as_mut().poll(cx) {
            Poll::Ready(out) => Poll::Ready(Some(out)),
            Poll::Pending => Poll::Ready(None),
        })
        .await
    }
}
