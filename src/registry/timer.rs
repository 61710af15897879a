//! Schedule/cancel capability for grace-period teardown.
//!
//! Production code uses [`TokioTimer`]. Tests drive [`ManualTimer`] by hand
//! so grace expiry is deterministic.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub type TimerTask = Box<dyn FnOnce() + Send>;

pub trait GraceTimer: Send + Sync {
    /// Run `task` once after `delay` unless the returned handle is cancelled.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Cancels a scheduled task. Dropping the handle leaves the task armed.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TimerHandle")
    }
}

/// Sleeps on the tokio runtime it was created with.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    runtime: Handle,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Bound to the runtime of the calling task. Panics outside a runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl GraceTimer for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let sleeper = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || sleeper.abort())
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    armed: BTreeMap<u64, (Duration, TimerTask)>,
}

/// A clock that only moves when told to.
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Tasks scheduled and neither fired nor cancelled.
    pub fn armed(&self) -> usize {
        self.state.lock().armed.len()
    }

    /// Move the clock forward and run every task that fell due, earliest
    /// first. Returns how many ran.
    pub fn advance(&self, by: Duration) -> usize {
        let mut due = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;
            let ids: Vec<u64> = state
                .armed
                .iter()
                .filter(|(_, (at, _))| *at <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.armed.remove(&id).map(|(at, task)| (at, id, task)))
                .collect::<Vec<_>>()
        };
        due.sort_by_key(|(at, id, _)| (*at, *id));

        // Tasks run unlocked; they may schedule or cancel.
        let fired = due.len();
        for (_, _, task) in due {
            task();
        }
        fired
    }
}

impl GraceTimer for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let at = state.now + delay;
            state.armed.insert(id, (at, task));
            id
        };
        let state = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().armed.remove(&id);
            }
        })
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("armed", &state.armed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> TimerTask) {
        let hits = Arc::new(AtomicUsize::new(0));
        let make = {
            let hits = hits.clone();
            move || -> TimerTask {
                let hits = hits.clone();
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }
        };
        (hits, make)
    }

    #[test]
    fn test_manual_timer_fires_when_due() {
        let timer = ManualTimer::new();
        let (hits, task) = counter();
        let _handle = timer.schedule(Duration::from_secs(30), task());

        assert_eq!(timer.advance(Duration::from_secs(29)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timer.advance(Duration::from_secs(1)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.armed(), 0);

        // Fired tasks never run twice.
        assert_eq!(timer.advance(Duration::from_secs(60)), 0);
    }

    #[test]
    fn test_manual_timer_cancel() {
        let timer = ManualTimer::new();
        let (hits, task) = counter();
        let handle = timer.schedule(Duration::from_secs(5), task());
        handle.cancel();

        assert_eq!(timer.armed(), 0);
        timer.advance(Duration::from_secs(10));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_timer_task_may_reschedule() {
        let timer = ManualTimer::new();
        let inner = timer.clone();
        let _h = timer.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                let _ = inner.schedule(Duration::from_secs(1), Box::new(|| {}));
            }),
        );

        assert_eq!(timer.advance(Duration::from_secs(1)), 1);
        assert_eq!(timer.armed(), 1);
        assert_eq!(timer.advance(Duration::from_secs(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires_and_cancels() {
        let timer = TokioTimer::current();
        let (hits, task) = counter();

        let _kept = timer.schedule(Duration::from_secs(30), task());
        let cancelled = timer.schedule(Duration::from_secs(30), task());
        cancelled.cancel();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
