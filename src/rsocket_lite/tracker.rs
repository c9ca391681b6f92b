use std::pin::pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

/// How a wait on a [`CompletionTracker`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every expected signal arrived.
    Completed,
    /// A failed interaction released the tracker while `remaining` signals were still expected.
    Released { remaining: usize },
    /// The deadline passed with `remaining` signals outstanding.
    TimedOut { remaining: usize },
}

impl WaitOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WaitOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackerState {
    remaining: usize,
    failures: usize,
    released_with: Option<usize>,
}

impl TrackerState {
    fn outcome(&self) -> Option<WaitOutcome> {
        if self.remaining > 0 {
            return None;
        }
        Some(match self.released_with {
            Some(remaining) => WaitOutcome::Released { remaining },
            None => WaitOutcome::Completed,
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<TrackerState>,
    condvar: Condvar,
    notify: Notify,
}

/// A countdown of terminal events (responses, errors, completions) a caller waits for.
///
/// The remaining count only ever decreases and saturates at zero. Clones share the same count, so
/// any number of tasks or threads may signal while others wait, either asynchronously with
/// [`wait`](Self::wait) or from plain threads with [`wait_blocking`](Self::wait_blocking).
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    inner: Arc<Inner>,
}

impl CompletionTracker {
    /// Create a tracker expecting `expected` signals. Zero is already satisfied.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TrackerState {
                    remaining: expected,
                    failures: 0,
                    released_with: None,
                }),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .expect("completion tracker lock poisoned")
    }

    fn update(&self, f: impl FnOnce(&mut TrackerState)) {
        let reached_zero = {
            let mut state = self.lock();
            let before = state.remaining;
            f(&mut state);
            before > 0 && state.remaining == 0
        };
        if reached_zero {
            self.inner.condvar.notify_all();
            self.inner.notify.notify_waiters();
        }
    }

    /// Record one terminal event.
    pub fn signal(&self) {
        self.update(|state| state.remaining = state.remaining.saturating_sub(1));
    }

    /// Record a failed terminal event. It takes a slot like [`signal`](Self::signal) and is
    /// counted in [`failures`](Self::failures).
    pub fn fail(&self) {
        self.update(|state| {
            if state.remaining > 0 {
                state.remaining -= 1;
                state.failures += 1;
            }
        });
    }

    /// Release every waiter now. The wait reports how many signals were still outstanding.
    pub fn release(&self) {
        self.update(|state| {
            if state.remaining > 0 {
                state.released_with = Some(state.remaining);
                state.remaining = 0;
            }
        });
    }

    pub fn remaining(&self) -> usize {
        self.lock().remaining
    }

    pub fn failures(&self) -> usize {
        self.lock().failures
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    fn outcome(&self) -> Option<WaitOutcome> {
        self.lock().outcome()
    }

    /// Wait until the count reaches zero. There is no deadline.
    pub async fn wait(&self) -> WaitOutcome {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait until the count reaches zero or `timeout` passes.
    pub async fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => WaitOutcome::TimedOut {
                remaining: self.remaining(),
            },
        }
    }

    /// Block the calling thread until the count reaches zero, or `timeout` passes if given.
    ///
    /// Must not be called from within an async task.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> WaitOutcome {
        let state = self.lock();
        let state = match timeout {
            None => self
                .inner
                .condvar
                .wait_while(state, |state| state.remaining > 0)
                .expect("completion tracker lock poisoned"),
            Some(timeout) => {
                self.inner
                    .condvar
                    .wait_timeout_while(state, timeout, |state| state.remaining > 0)
                    .expect("completion tracker lock poisoned")
                    .0
            }
        };

        state.outcome().unwrap_or(WaitOutcome::TimedOut {
            remaining: state.remaining,
        })
    }
}
