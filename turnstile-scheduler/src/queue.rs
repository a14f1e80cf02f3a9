//! Bounded LIFO admission queue.
//!
//! The queue bounds how many requests run through a route at once.
//! Arriving requests acquire a [`Permit`] immediately while fewer than
//! `max_concurrency` are in flight; beyond that they suspend on a
//! waiter stack of at most `max_queue_size` entries. When a permit
//! frees up, the *most recently* suspended waiter resumes first: under
//! sustained overload the freshest demand is served while the oldest
//! waiters age toward their timeout and are shed. FIFO would instead
//! starve every caller equally.
//!
//! All operations are safe under arbitrary concurrent interleaving.
//! One mutex guards the parameters, the waiter stack, and the active
//! count; waiters enqueue under the lock and then suspend on a
//! per-waiter channel outside it, racing the wakeup against their
//! timer and the request's cancellation signal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Failures surfaced by [`Queue::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The waiter stack is at `max_queue_size`.
    #[error("queue is full")]
    QueueFull,

    /// The waiter aged past the queue's timeout.
    #[error("timed out waiting for a permit")]
    Timeout,

    /// The request was canceled while waiting.
    #[error("request canceled while waiting")]
    Canceled,

    /// The queue was closed before or during the wait.
    #[error("queue is closed")]
    Closed,
}

/// Queue parameters. Replaceable at runtime through
/// [`Queue::reconfigure`].
///
/// The defaults are what an argument-less `lifo()` declaration
/// resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum simultaneous in-flight requests.
    pub max_concurrency: usize,

    /// Maximum suspended waiters.
    pub max_queue_size: usize,

    /// Maximum time a waiter may stay suspended.
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrency: 100, max_queue_size: 100, timeout: Duration::from_secs(10) }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TURNSTILE_LIFO_MAX_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                config.max_concurrency = n;
            }
        }

        if let Ok(val) = std::env::var("TURNSTILE_LIFO_MAX_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_queue_size = n;
            }
        }

        if let Ok(val) = std::env::var("TURNSTILE_LIFO_TIMEOUT") {
            if let Ok(d) = humantime::parse_duration(&val) {
                config.timeout = d;
            }
        }

        config
    }
}

/// Observable snapshot of a queue. Read from atomics mirroring the
/// locked state, so it never blocks a waiter; it is not guaranteed to
/// be a strictly consistent cut.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Permits currently held.
    pub active_requests: usize,

    /// Waiters currently suspended.
    pub queued_requests: usize,

    /// Terminal flag; once set, never cleared.
    pub closed: bool,
}

struct Waiter {
    seq: u64,
    /// The wakeup carries the permit itself: a waiter whose future is
    /// dropped after the wakeup was sent still returns the permit,
    /// through the unconsumed message's own drop.
    tx: oneshot::Sender<Result<Permit, WaitError>>,
}

struct QueueState {
    config: QueueConfig,
    active: usize,
    /// Waiter stack; the last entry is the most recent waiter.
    waiters: Vec<Waiter>,
    closed: bool,
    next_seq: u64,
}

/// A bounded LIFO queue with an active-permit count.
pub struct Queue {
    /// Handed to permits so they can find their way back for release.
    weak_self: Weak<Queue>,
    state: Mutex<QueueState>,
    active: AtomicUsize,
    queued: AtomicUsize,
    closed: AtomicBool,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            state: Mutex::new(QueueState {
                config,
                active: 0,
                waiters: Vec::new(),
                closed: false,
                next_seq: 0,
            }),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// The current parameters.
    pub fn config(&self) -> QueueConfig {
        self.state.lock().unwrap().config
    }

    /// Lock-free status snapshot.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            active_requests: self.active.load(Ordering::Relaxed),
            queued_requests: self.queued.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    /// Acquire a permit, suspending on the waiter stack while the
    /// concurrency limit is reached.
    ///
    /// Fails with [`WaitError::QueueFull`] when the stack is at
    /// capacity (immediately when `max_concurrency` is zero: such a
    /// queue can never drain, so shedding at once is the only honest
    /// answer), [`WaitError::Timeout`] when the waiter's timer
    /// elapses, [`WaitError::Canceled`] when `cancel` fires first, and
    /// [`WaitError::Closed`] when the queue is or becomes closed.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<Permit, WaitError> {
        let (mut rx, seq, timeout) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(WaitError::Closed);
            }
            if state.config.max_concurrency == 0 {
                return Err(WaitError::QueueFull);
            }
            if state.active < state.config.max_concurrency {
                state.active += 1;
                self.publish(&state);
                return Ok(Permit::new(self.weak_self.clone()));
            }
            if state.waiters.len() >= state.config.max_queue_size {
                return Err(WaitError::QueueFull);
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { seq, tx });
            self.publish(&state);
            (rx, seq, state.config.timeout)
        };

        tokio::select! {
            // The wakeup wins ties against the timer and cancellation.
            biased;
            outcome = &mut rx => match outcome {
                Ok(result) => result,
                // Sender dropped without a verdict: the queue is gone.
                Err(_) => Err(WaitError::Closed),
            },
            _ = cancel.cancelled() => self.abandon(seq, &mut rx, WaitError::Canceled),
            _ = tokio::time::sleep(timeout) => self.abandon(seq, &mut rx, WaitError::Timeout),
        }
    }

    /// Timer or cancellation fired: test-and-remove this waiter from
    /// the stack. Losing the race against a wakeup delivered under the
    /// lock means the permit is already ours and must be honored.
    fn abandon(
        &self,
        seq: u64,
        rx: &mut oneshot::Receiver<Result<Permit, WaitError>>,
        err: WaitError,
    ) -> Result<Permit, WaitError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(pos) = state.waiters.iter().position(|w| w.seq == seq) {
                state.waiters.remove(pos);
                self.publish(&state);
                trace!(?err, "waiter left the stack");
                return Err(err);
            }
        }
        match rx.try_recv() {
            Ok(delivered) => delivered,
            Err(_) => Err(err),
        }
    }

    /// Atomically replace the parameters.
    ///
    /// Held permits are never revoked; a shrunk `max_concurrency` only
    /// constrains future acquisitions. A shrunk `max_queue_size`
    /// evicts the oldest waiters (the bottom of the stack) with
    /// [`WaitError::QueueFull`] until the stack fits. A grown
    /// `max_concurrency` wakes newly admissible waiters right away.
    pub fn reconfigure(&self, config: QueueConfig) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.config = config;
        while state.waiters.len() > state.config.max_queue_size {
            let evicted = state.waiters.remove(0);
            let _ = evicted.tx.send(Err(WaitError::QueueFull));
        }
        self.wake_admissible(&mut state);
        self.publish(&state);
    }

    /// Close the queue: wake every waiter with [`WaitError::Closed`]
    /// and refuse subsequent waits. Idempotent. Held permits stay
    /// valid until released.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(WaitError::Closed));
        }
        self.publish(&state);
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = state.active.saturating_sub(1);
        if !state.closed {
            self.wake_admissible(&mut state);
        }
        self.publish(&state);
    }

    /// Hand permits to the most recent waiters while capacity allows.
    /// The permit transfers under the lock, before the waiter resumes.
    fn wake_admissible(&self, state: &mut QueueState) {
        while state.active < state.config.max_concurrency {
            let Some(waiter) = state.waiters.pop() else { break };
            let permit = Permit::new(self.weak_self.clone());
            match waiter.tx.send(Ok(permit)) {
                Ok(()) => state.active += 1,
                // The waiter future is gone; neutralize the returned
                // permit (it was never accounted) and give the slot to
                // the next waiter instead.
                Err(rejected) => {
                    if let Ok(permit) = rejected {
                        permit.disarm();
                    }
                }
            }
        }
    }

    fn publish(&self, state: &QueueState) {
        self.active.store(state.active, Ordering::Relaxed);
        self.queued.store(state.waiters.len(), Ordering::Relaxed);
        self.closed.store(state.closed, Ordering::Relaxed);
    }
}

/// The right to run one in-flight request through the queue that
/// issued it.
///
/// Exactly one release happens per permit: either through the
/// consuming [`Permit::release`], or through `Drop` when the holder
/// unwinds or forgets. There is no path that releases twice. The
/// handle back to the queue is weak, so permits outliving their queue
/// release into nothing instead of keeping it alive.
#[must_use = "a permit admits exactly one request and must be released"]
pub struct Permit {
    queue: Option<Weak<Queue>>,
}

impl Permit {
    fn new(queue: Weak<Queue>) -> Self {
        Self { queue: Some(queue) }
    }

    /// Return the permit to the queue.
    pub fn release(mut self) {
        self.release_once();
    }

    /// Forget without releasing. Only for permits whose transfer was
    /// rejected before they were ever accounted; dropping one of those
    /// under the queue lock would otherwise re-enter it.
    fn disarm(mut self) {
        self.queue = None;
    }

    fn release_once(&mut self) {
        if let Some(queue) = self.queue.take().and_then(|weak| weak.upgrade()) {
            queue.release();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}
