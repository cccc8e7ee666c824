//! FIFO admission gate with per-acquisition timeouts.
//!
//! All state lives behind one mutex, which is the single point where a
//! waiter leaves the queue. A queued waiter ends in exactly one of two ways:
//! `release()` pops it and hands over the slot, or its timeout fires and it
//! removes itself. Whichever takes the lock first wins; the other finds the
//! waiter already gone.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::ConcurrencyConfig;
use crate::error::{Result, TurnstileError};

struct Waiter {
    id: u64,
    wake: oneshot::Sender<()>,
}

struct State {
    in_use: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl State {
    /// Remove a queued waiter. Returns false if it already left the queue.
    fn dequeue(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Bounds how many guarded operations run at once.
///
/// Excess callers queue and are admitted strictly in arrival order.
pub struct ConcurrencySemaphore {
    capacity: usize,
    default_timeout: Option<Duration>,
    state: Mutex<State>,
}

impl ConcurrencySemaphore {
    /// Create a semaphore with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "semaphore capacity must be greater than zero");
        Self {
            capacity,
            default_timeout: None,
            state: Mutex::new(State {
                in_use: 0,
                waiters: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    /// Create a semaphore from configuration.
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        let mut semaphore = Self::new(config.max_concurrent);
        semaphore.default_timeout = config.acquire_timeout();
        semaphore
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.capacity - self.in_use()
    }

    /// Callers queued for a slot.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// The timeout applied by [`permit`](Self::permit) and [`run`](Self::run)
    /// when none is given.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Take a slot, waiting in line if none is free.
    ///
    /// Resolves without suspending when a slot is free. With a `timeout`, a
    /// caller still queued when it elapses is removed from the queue and gets
    /// [`TurnstileError::AcquireTimeout`]; the semaphore is left exactly as if
    /// it had never asked. Every successful call must be paired with one
    /// [`release`](Self::release); prefer [`permit`](Self::permit).
    ///
    /// Dropping the returned future while queued also withdraws the caller.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let (id, wake) = {
            let mut state = self.state.lock();
            if state.in_use < self.capacity {
                state.in_use += 1;
                trace!(in_use = state.in_use, "Concurrency slot acquired");
                return Ok(());
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, wake: tx });
            trace!(waiter = id, queued = state.waiters.len(), "Waiting for concurrency slot");
            (id, rx)
        };

        let mut pending = PendingAcquire {
            semaphore: self,
            id,
            wake: Some(wake),
        };

        match timeout {
            None => pending.granted().await,
            Some(limit) => {
                if tokio::time::timeout(limit, pending.granted()).await.is_err() {
                    match pending.withdraw() {
                        Withdrawal::TimedOut => {
                            debug!(waiter = id, ?limit, "Timed out waiting for concurrency slot");
                            return Err(TurnstileError::AcquireTimeout { waited: limit });
                        }
                        // Granted in the same instant the timer fired.
                        Withdrawal::Granted => {}
                        Withdrawal::Abandoned => std::future::pending::<()>().await,
                    }
                }
            }
        }

        pending.complete();
        Ok(())
    }

    /// Give a slot back, handing it straight to the longest waiter if any.
    ///
    /// # Panics
    ///
    /// Panics if no slot is held; that means an acquire/release pair was
    /// mismatched.
    pub fn release(&self) {
        let mut state = self.state.lock();
        assert!(
            state.in_use > 0,
            "ConcurrencySemaphore::release called with no slot held"
        );
        self.hand_over(&mut state);
    }

    /// Pass the caller's slot to the head waiter, or free it.
    fn hand_over(&self, state: &mut State) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.wake.send(()).is_ok() {
                trace!(waiter = waiter.id, in_use = state.in_use, "Concurrency slot handed over");
                return;
            }
        }
        state.in_use -= 1;
        trace!(in_use = state.in_use, "Concurrency slot released");
    }

    /// Acquire a slot that is released when the returned permit drops.
    ///
    /// Falls back to the configured default timeout when `timeout` is `None`.
    pub async fn permit(&self, timeout: Option<Duration>) -> Result<SemaphorePermit<'_>> {
        self.acquire(timeout.or(self.default_timeout)).await?;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Run `operation` while holding a slot.
    ///
    /// The slot is released however the operation ends, including by panic
    /// or cancellation.
    pub async fn run<F, T>(&self, timeout: Option<Duration>, operation: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.permit(timeout).await?;
        Ok(operation.await)
    }

    /// Zero the slot count and abandon every queued waiter.
    ///
    /// Abandoned waiters are neither granted nor timed out: they stay
    /// pending. Only for tests that need a clean semaphore.
    pub fn reset_for_test(&self) {
        let mut state = self.state.lock();
        state.in_use = 0;
        state.waiters.clear();
    }
}

/// How a queued waiter left the queue once its timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Withdrawal {
    /// Still queued: removed without ever holding a slot.
    TimedOut,
    /// `release()` handed over a slot before the timer won the lock.
    Granted,
    /// Dropped from the queue by `reset_for_test`.
    Abandoned,
}

/// A queued acquisition. Dropping it withdraws from the queue, or passes
/// on a slot that was granted but never observed.
struct PendingAcquire<'a> {
    semaphore: &'a ConcurrencySemaphore,
    id: u64,
    wake: Option<oneshot::Receiver<()>>,
}

impl PendingAcquire<'_> {
    /// Wait for the grant. A waiter abandoned by `reset_for_test` never resolves.
    async fn granted(&mut self) {
        let granted = match self.wake.as_mut() {
            Some(wake) => wake.await.is_ok(),
            None => false,
        };
        if !granted {
            std::future::pending::<()>().await;
        }
    }

    /// Leave the queue after a timeout, unless the slot was granted first.
    fn withdraw(&mut self) -> Withdrawal {
        let mut state = self.semaphore.state.lock();
        if state.dequeue(self.id) {
            self.wake = None;
            return Withdrawal::TimedOut;
        }
        let granted = matches!(self.wake.as_mut().map(|w| w.try_recv()), Some(Ok(())));
        if granted {
            Withdrawal::Granted
        } else {
            self.wake = None;
            Withdrawal::Abandoned
        }
    }

    /// The slot is now owned by the caller.
    fn complete(mut self) {
        self.wake = None;
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        let Some(mut wake) = self.wake.take() else {
            return;
        };
        let mut state = self.semaphore.state.lock();
        if state.dequeue(self.id) {
            trace!(waiter = self.id, "Withdrew cancelled concurrency waiter");
            return;
        }
        if wake.try_recv().is_ok() {
            self.semaphore.hand_over(&mut state);
        }
    }
}

/// A held concurrency slot, released on drop.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a ConcurrencySemaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Poll;
    use tokio::sync::mpsc;

    async fn wait_for_queue(semaphore: &ConcurrencySemaphore, len: usize) {
        while semaphore.waiting() < len {
            tokio::task::yield_now().await;
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_acquire_within_capacity_is_immediate() {
        let semaphore = ConcurrencySemaphore::new(3);
        for _ in 0..3 {
            semaphore.acquire(None).await.unwrap();
        }
        assert_eq!(semaphore.in_use(), 3);
        assert_eq!(semaphore.available(), 0);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiters_granted_in_fifo_order() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(3));
        for _ in 0..3 {
            semaphore.acquire(None).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for n in 4..=6 {
            let waiter = semaphore.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                waiter.acquire(None).await.unwrap();
                tx.send(n).unwrap();
            });
            wait_for_queue(&semaphore, n - 3).await;
        }

        settle().await;
        assert!(rx.try_recv().is_err(), "No waiter should run before a release");

        semaphore.release();
        assert_eq!(rx.recv().await, Some(4));
        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(semaphore.in_use(), 3);

        semaphore.release();
        assert_eq!(rx.recv().await, Some(5));
        semaphore.release();
        assert_eq!(rx.recv().await, Some(6));
        assert_eq!(semaphore.in_use(), 3);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_state_untouched() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        semaphore.acquire(None).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = semaphore
            .acquire(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(semaphore.waiting(), 0);
        assert_eq!(semaphore.in_use(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = semaphore.clone();
        tokio::spawn(async move {
            waiter.acquire(None).await.unwrap();
            tx.send(()).unwrap();
        });
        wait_for_queue(&semaphore, 1).await;

        semaphore.release();
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(semaphore.in_use(), 1);

        semaphore.release();
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_is_withdrawn() {
        let semaphore = ConcurrencySemaphore::new(1);
        semaphore.acquire(None).await.unwrap();

        let outcome =
            tokio::time::timeout(Duration::from_millis(10), semaphore.acquire(None)).await;
        assert!(outcome.is_err());
        assert_eq!(semaphore.waiting(), 0);

        semaphore.release();
        assert_eq!(semaphore.in_use(), 0);
    }

    /// Queue a waiter by hand, as `acquire` does once the semaphore is full.
    fn enqueue(semaphore: &ConcurrencySemaphore) -> PendingAcquire<'_> {
        let mut state = semaphore.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, wake: tx });
        PendingAcquire {
            semaphore,
            id,
            wake: Some(rx),
        }
    }

    #[test]
    fn test_withdraw_after_grant_keeps_the_slot() {
        let semaphore = ConcurrencySemaphore::new(1);
        semaphore.state.lock().in_use = 1;

        let mut pending = enqueue(&semaphore);
        semaphore.release();
        assert_eq!(pending.withdraw(), Withdrawal::Granted);
        pending.complete();

        assert_eq!(semaphore.in_use(), 1);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[test]
    fn test_withdraw_while_queued_times_out() {
        let semaphore = ConcurrencySemaphore::new(1);
        semaphore.state.lock().in_use = 1;

        let mut pending = enqueue(&semaphore);
        assert_eq!(pending.withdraw(), Withdrawal::TimedOut);
        drop(pending);

        assert_eq!(semaphore.in_use(), 1);
        assert_eq!(semaphore.waiting(), 0);
        semaphore.release();
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_before_deadline_wins_over_timeout() {
        let semaphore = ConcurrencySemaphore::new(1);
        semaphore.acquire(None).await.unwrap();

        let mut waiter = Box::pin(semaphore.acquire(Some(Duration::from_millis(10))));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        semaphore.release();
        tokio::time::advance(Duration::from_millis(10)).await;

        assert!(matches!(futures::poll!(waiter.as_mut()), Poll::Ready(Ok(()))));
        assert_eq!(semaphore.in_use(), 1);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[tokio::test]
    async fn test_granted_then_cancelled_waiter_passes_slot_on() {
        let semaphore = ConcurrencySemaphore::new(1);
        semaphore.acquire(None).await.unwrap();

        let mut first = Box::pin(semaphore.acquire(None));
        let mut second = Box::pin(semaphore.acquire(None));
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());
        assert_eq!(semaphore.waiting(), 2);

        semaphore.release();
        drop(first);

        assert!(matches!(futures::poll!(second.as_mut()), Poll::Ready(Ok(()))));
        assert_eq!(semaphore.in_use(), 1);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[tokio::test]
    async fn test_permit_releases_on_drop() {
        let semaphore = ConcurrencySemaphore::new(2);
        {
            let _permit = semaphore.permit(None).await.unwrap();
            assert_eq!(semaphore.in_use(), 1);
        }
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test]
    async fn test_run_releases_when_operation_fails() {
        let semaphore = ConcurrencySemaphore::new(1);
        let result = semaphore
            .run(None, async { Err::<(), &str>("subprocess exited with 1") })
            .await
            .unwrap();
        assert_eq!(result, Err("subprocess exited with 1"));
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_uses_default_timeout() {
        let config = ConcurrencyConfig {
            max_concurrent: 1,
            acquire_timeout_ms: Some(20),
        };
        let semaphore = ConcurrencySemaphore::from_config(&config);
        let _held = semaphore.permit(None).await.unwrap();

        let err = semaphore.permit(None).await.err().unwrap();
        assert!(matches!(
            err,
            TurnstileError::AcquireTimeout { waited } if waited == Duration::from_millis(20)
        ));
    }

    #[test]
    #[should_panic(expected = "no slot held")]
    fn test_release_underflow_panics() {
        let semaphore = ConcurrencySemaphore::new(1);
        semaphore.release();
    }

    #[tokio::test]
    async fn test_reset_abandons_waiters() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        semaphore.acquire(None).await.unwrap();

        let waiter = semaphore.clone();
        let handle = tokio::spawn(async move { waiter.acquire(None).await });
        wait_for_queue(&semaphore, 1).await;

        semaphore.reset_for_test();
        assert_eq!(semaphore.in_use(), 0);
        assert_eq!(semaphore.waiting(), 0);

        semaphore.acquire(None).await.unwrap();
        settle().await;
        assert!(!handle.is_finished());
        assert_eq!(semaphore.in_use(), 1);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_use_never_exceeds_capacity() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..50).map(|_| {
            let semaphore = semaphore.clone();
            let active = active.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                semaphore
                    .run(None, async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            })
        });
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.in_use(), 0);
        assert_eq!(semaphore.waiting(), 0);
    }
}
