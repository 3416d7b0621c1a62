//! Per-worker deadline timers.
//!
//! [`TimeoutGuard::arm`] schedules a single-shot callback on the tokio
//! runtime; [`TimeoutGuard::disarm`] cancels it. Disarming is idempotent:
//! it is safe to call repeatedly, after the timer fired, or for an id that
//! was never armed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::types::JobId;

struct ArmedTimer {
    generation: u64,
    abort: AbortHandle,
}

type TimerMap = HashMap<JobId, ArmedTimer>;

/// Registry of armed deadline timers keyed by worker (job) id.
#[derive(Default)]
pub struct TimeoutGuard {
    timers: Arc<Mutex<TimerMap>>,
    generation: AtomicU64,
}

impl TimeoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_fire` to run once after `duration`.
    ///
    /// Re-arming an id replaces (and cancels) its previous timer. Must be
    /// called from within a tokio runtime.
    pub fn arm<F>(&self, worker_id: JobId, duration: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            // Claim the timer before firing so a concurrent disarm sees it
            // as already gone.
            let claimed = {
                let mut map = lock(&timers);
                match map.get(&worker_id) {
                    Some(t) if t.generation == generation => {
                        map.remove(&worker_id);
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                tracing::debug!(worker_id = %worker_id, "Worker deadline reached");
                on_fire();
            }
        });

        let previous = lock(&self.timers).insert(
            worker_id,
            ArmedTimer {
                generation,
                abort: handle.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.abort.abort();
        }
    }

    /// Cancel the timer for `worker_id`.
    ///
    /// Returns `true` if a pending timer was cancelled, `false` if there was
    /// nothing to cancel (never armed, already disarmed, or already fired).
    pub fn disarm(&self, worker_id: JobId) -> bool {
        match lock(&self.timers).remove(&worker_id) {
            Some(timer) => {
                timer.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, worker_id: JobId) -> bool {
        lock(&self.timers).contains_key(&worker_id)
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.timers).len()
    }
}

/// The map is only mutated in short non-panicking sections, so a poisoned
/// lock still holds consistent data.
fn lock(timers: &Mutex<TimerMap>) -> MutexGuard<'_, TimerMap> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&fired);
        (fired, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn fires_once_after_duration() {
        let guard = TimeoutGuard::new();
        let id = uuid::Uuid::new_v4();
        let (fired, on_fire) = counter();

        guard.arm(id, Duration::from_millis(20), on_fire);
        assert!(guard.is_armed(id));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!guard.is_armed(id), "fired timer must unregister itself");
    }

    #[tokio::test]
    async fn disarm_prevents_firing() {
        let guard = TimeoutGuard::new();
        let id = uuid::Uuid::new_v4();
        let (fired, on_fire) = counter();

        guard.arm(id, Duration::from_millis(30), on_fire);
        assert!(guard.disarm(id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disarm_twice_and_after_firing_is_harmless() {
        let guard = TimeoutGuard::new();
        let id = uuid::Uuid::new_v4();
        let (fired, on_fire) = counter();

        guard.arm(id, Duration::from_millis(10), on_fire);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(!guard.disarm(id));
        assert!(!guard.disarm(id));
        assert!(!guard.disarm(uuid::Uuid::new_v4()));
        assert_eq!(guard.armed_count(), 0);
    }

    #[tokio::test]
    async fn rearm_replaces_previous_timer() {
        let guard = TimeoutGuard::new();
        let id = uuid::Uuid::new_v4();
        let (first, on_first) = counter();
        let (second, on_second) = counter();

        guard.arm(id, Duration::from_millis(20), on_first);
        guard.arm(id, Duration::from_millis(40), on_second);
        assert_eq!(guard.armed_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
