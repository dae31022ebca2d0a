//! Bounded admission queue for a single local inference backend.
//!
//! Local engines (llama.cpp, Ollama, LM Studio, ...) usually serve one request
//! at a time. Every call into the backend is wrapped in a job and pushed
//! through an [`AdmissionQueue`]:
//!
//! - jobs are admitted strictly in arrival order, with no priorities;
//! - at most `concurrency` jobs run at the same time, process-wide;
//! - a running job owns a [`Slot`] which is released when its future finishes,
//!   whether it produced a value, an error value, or panicked;
//! - releasing a slot admits the next pending job before the finished job's
//!   output is handed back to its [`Ticket`].
//!
//! ```no_run
//! # async fn demo() {
//! use localbridge_queue::{AdmissionQueue, QueueOptions};
//!
//! let queue = AdmissionQueue::new(QueueOptions::default());
//! let ticket = queue.enqueue(|| async { 40 + 2 }).expect("unbounded queue");
//! assert_eq!(ticket.await.unwrap(), 42);
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default number of jobs allowed to run at once.
pub const DEFAULT_CONCURRENCY: usize = 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full: {max_pending} requests already waiting")]
    Full { max_pending: usize },

    #[error("job was abandoned before it produced a result")]
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum number of concurrently running jobs. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Maximum number of jobs waiting for a slot. `None` means unbounded.
    pub max_pending: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_pending: None,
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub limit: usize,
    pub max_pending: Option<usize>,
}

type BoxedJob = Box<dyn FnOnce(Slot) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct State {
    pending: VecDeque<BoxedJob>,
    running: usize,
    /// Set while one caller is starting jobs. Only that caller invokes job
    /// functions, which keeps start order equal to pop order.
    pumping: bool,
}

struct Shared {
    limit: usize,
    max_pending: Option<usize>,
    state: Mutex<State>,
}

impl Shared {
    // Nothing panics while the lock is held, so a poisoned lock still holds a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue bounding the number of concurrently running jobs.
///
/// Cloning is cheap; all clones share the same pending list and running
/// counter. Construct one per backend and hand clones to request handlers.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

impl AdmissionQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                limit: options.concurrency.max(1),
                max_pending: options.max_pending,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    running: 0,
                    pumping: false,
                }),
            }),
        }
    }

    /// Queue a job and return a [`Ticket`] resolving to the job's output.
    ///
    /// Once the job reaches the head of the queue and a slot is free, its
    /// function is called (jobs are started strictly in enqueue order) and
    /// the returned future is driven on its own Tokio task. Dropping the
    /// ticket does not cancel the job. When a pending bound is configured
    /// and every slot is busy with the bound already reached, the job is
    /// rejected with [`QueueError::Full`] and the queue is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn enqueue<F, Fut, T>(&self, job: F) -> Result<Ticket<T>, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: BoxedJob = Box::new(move |slot: Slot| {
            let started = job();
            Box::pin(async move {
                let output = started.await;
                drop(slot);
                // The caller may have stopped waiting; the output is discarded then.
                let _ = tx.send(output);
            })
        });

        {
            let mut state = self.shared.lock();
            if let Some(max_pending) = self.shared.max_pending {
                if state.running >= self.shared.limit && state.pending.len() >= max_pending {
                    warn!(
                        max_pending,
                        running = state.running,
                        "admission queue full, rejecting job"
                    );
                    return Err(QueueError::Full { max_pending });
                }
            }
            state.pending.push_back(boxed);
            debug!(
                pending = state.pending.len(),
                running = state.running,
                "job enqueued"
            );
        }

        self.pump();
        Ok(Ticket { rx })
    }

    /// Start jobs from the head of the queue while slots are free.
    ///
    /// The running counter is bumped under the same lock acquisition that pops
    /// the job, so concurrent pumps can never overshoot the limit. Only one
    /// caller starts jobs at a time; any other pump returns immediately and
    /// the active one picks up its work, because it only stops after seeing
    /// no admissible job under the lock.
    fn pump(&self) {
        {
            let mut state = self.shared.lock();
            if state.pumping {
                return;
            }
            state.pumping = true;
        }

        loop {
            let job = {
                let mut state = self.shared.lock();
                let next = if state.running < self.shared.limit {
                    state.pending.pop_front()
                } else {
                    None
                };
                let Some(job) = next else {
                    state.pumping = false;
                    return;
                };
                state.running += 1;
                debug!(
                    pending = state.pending.len(),
                    running = state.running,
                    "job admitted"
                );
                job
            };

            let slot = Slot {
                queue: self.clone(),
            };
            // The job function runs here, outside the lock. If it panics, its
            // slot and ticket sender are dropped during unwinding, which frees
            // the slot and resolves the ticket to `Abandoned`.
            match panic::catch_unwind(AssertUnwindSafe(|| job(slot))) {
                Ok(future) => {
                    tokio::spawn(future);
                }
                Err(_) => warn!("job function panicked before returning a future"),
            }
        }
    }

    fn release(&self) {
        {
            let mut state = self.shared.lock();
            state.running = state.running.saturating_sub(1);
            debug!(
                pending = state.pending.len(),
                running = state.running,
                "slot released"
            );
        }
        self.pump();
    }

    /// Discard every pending (not yet running) job and return how many were dropped.
    ///
    /// Tickets of discarded jobs resolve to [`QueueError::Abandoned`]. Running
    /// jobs are unaffected.
    pub fn clear(&self) -> usize {
        let discarded: Vec<BoxedJob> = self.shared.lock().pending.drain(..).collect();
        let count = discarded.len();
        // Dropped outside the lock: captured state may run arbitrary Drop code.
        drop(discarded);
        if count > 0 {
            warn!(discarded = count, "pending jobs cleared");
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        QueueStats {
            pending: state.pending.len(),
            running: state.running,
            limit: self.shared.limit,
            max_pending: self.shared.max_pending,
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }
}

/// A claimed concurrency slot. Dropping it frees the slot and re-pumps the queue.
pub struct Slot {
    queue: AdmissionQueue,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// Resolves to the output of a queued job.
#[derive(Debug)]
pub struct Ticket<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Ticket<T> {
    type Output = Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.map_err(|_| QueueError::Abandoned))
    }
}
