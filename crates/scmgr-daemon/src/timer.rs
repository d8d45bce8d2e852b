//! Keyed delayed-task queue.
//!
//! Every delayed action in the daemon (save auto-revoke, deferred full
//! revoke on background, idle exit) is a [`TimerEvent`] parked in one
//! [`TimerQueue`] under a stable string key. Firing delivers the event as
//! data to a [`TimerTarget`]; nothing holds a callback into the registry.
//!
//! # Keys
//!
//! | Purpose | Key |
//! |---------|-----|
//! | save auto-revoke | `save_revoke:<token>:<serial>` |
//! | deferred full revoke | `full_revoke:<token>` |
//! | idle exit | `service_exit` |
//!
//! Scheduling a key that is already in flight replaces the earlier entry,
//! so no two tasks with one key coexist. Cancelling a key that already
//! fired or was never scheduled is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scmgr_core::oracle::TokenId;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Key of the idle-exit timer.
pub const SERVICE_EXIT_KEY: &str = "service_exit";

/// Upper bound on how long the driver sleeps with an empty queue.
const IDLE_POLL: Duration = Duration::from_secs(60);

// =============================================================================
// Clock
// =============================================================================

/// Time source for click windows and timer deadlines.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in milliseconds since the UNIX epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Events and keys
// =============================================================================

/// Payload delivered when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Save grant `serial` of `token_id` has expired.
    SaveRevoke { token_id: TokenId, serial: u64 },
    /// The owner of `token_id` stayed in the background too long.
    DeferredFullRevoke { token_id: TokenId },
    /// The registry has been empty for the idle-exit delay.
    ServiceExit,
}

impl TimerEvent {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SaveRevoke { .. } => "save_revoke",
            Self::DeferredFullRevoke { .. } => "full_revoke",
            Self::ServiceExit => "service_exit",
        }
    }
}

#[must_use]
pub fn save_revoke_key(token_id: TokenId, serial: u64) -> String {
    format!("save_revoke:{token_id}:{serial}")
}

#[must_use]
pub fn full_revoke_key(token_id: TokenId) -> String {
    format!("full_revoke:{token_id}")
}

// =============================================================================
// Queue
// =============================================================================

/// Ordering key: deadline first, then insertion order.
type Slot = (u64, u64);

#[derive(Debug, Default)]
struct QueueInner {
    entries: BTreeMap<Slot, (String, TimerEvent)>,
    by_key: HashMap<String, Slot>,
    next_seq: u64,
}

/// Deadline-ordered, key-addressed timer queue.
///
/// The queue owns no thread; a [`TimerDriver`] (or a test) pulls due
/// events with [`TimerQueue::take_due`].
#[derive(Debug, Default)]
pub struct TimerQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `event` under `key` at `deadline_ms`, replacing any
    /// in-flight task with the same key.
    pub fn schedule(&self, key: impl Into<String>, deadline_ms: u64, event: TimerEvent) {
        let key = key.into();
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(old) = inner.by_key.remove(&key) {
                inner.entries.remove(&old);
                trace!(key = %key, "replaced in-flight timer");
            }
            let slot = (deadline_ms, inner.next_seq);
            inner.next_seq = inner.next_seq.wrapping_add(1);
            inner.entries.insert(slot, (key.clone(), event));
            inner.by_key.insert(key, slot);
        }
        self.notify.notify_one();
    }

    /// Cancels `key`. Returns `true` if a pending task was removed.
    pub fn cancel(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.by_key.remove(key) {
            Some(slot) => {
                inner.entries.remove(&slot);
                true
            },
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_key
            .contains_key(key)
    }

    /// Deadline of `key`, if it is pending.
    #[must_use]
    pub fn deadline_of(&self, key: &str) -> Option<u64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_key
            .get(key)
            .map(|slot| slot.0)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .keys()
            .next()
            .map(|slot| slot.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every event due at `now_ms`, earliest first.
    pub fn take_due(&self, now_ms: u64) -> Vec<TimerEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = inner.entries.split_off(&(now_ms.saturating_add(1), 0));
        let due = std::mem::replace(&mut inner.entries, pending);
        due.into_values()
            .map(|(key, event)| {
                inner.by_key.remove(&key);
                debug!(key = %key, event = event.as_str(), "timer fired");
                event
            })
            .collect()
    }

    /// Resolves after the next [`TimerQueue::schedule`].
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Receiver of fired timer events.
pub trait TimerTarget: Send + Sync + 'static {
    fn timer_queue(&self) -> &TimerQueue;

    fn now_ms(&self) -> u64;

    fn fire(&self, event: TimerEvent);
}

/// Tokio task that sleeps until the next deadline and dispatches due
/// events to a [`TimerTarget`].
pub struct TimerDriver;

impl TimerDriver {
    /// Spawns the driver. It stops once `shutdown` carries `true` or its
    /// sender is dropped.
    pub fn spawn<T: TimerTarget>(
        target: Arc<T>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let now = target.now_ms();
                for event in target.timer_queue().take_due(now) {
                    target.fire(event);
                }

                let wait = target
                    .timer_queue()
                    .next_deadline()
                    .map_or(IDLE_POLL, |deadline| {
                        Duration::from_millis(deadline.saturating_sub(target.now_ms()))
                    })
                    .min(IDLE_POLL);

                tokio::select! {
                    () = tokio::time::sleep(wait) => {},
                    () = target.timer_queue().notified() => {},
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    },
                }
            }
            debug!("timer driver stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_due_in_deadline_order() {
        let queue = TimerQueue::new();
        queue.schedule(full_revoke_key(7), 300, TimerEvent::DeferredFullRevoke { token_id: 7 });
        let save = TimerEvent::SaveRevoke {
            token_id: 1,
            serial: 0,
        };
        queue.schedule(save_revoke_key(1, 0), 100, save);
        queue.schedule(SERVICE_EXIT_KEY, 200, TimerEvent::ServiceExit);

        assert!(queue.take_due(99).is_empty());
        assert_eq!(queue.take_due(200), vec![save, TimerEvent::ServiceExit]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(300));
        assert!(!queue.contains(SERVICE_EXIT_KEY));
    }

    #[test]
    fn test_same_deadline_keeps_insertion_order() {
        let queue = TimerQueue::new();
        let first = TimerEvent::SaveRevoke {
            token_id: 1,
            serial: 0,
        };
        let second = TimerEvent::SaveRevoke {
            token_id: 2,
            serial: 1,
        };
        queue.schedule(save_revoke_key(1, 0), 50, first);
        queue.schedule(save_revoke_key(2, 1), 50, second);
        assert_eq!(queue.take_due(50), vec![first, second]);
        assert_eq!(first.as_str(), "save_revoke");
    }

    #[test]
    fn test_reschedule_replaces_same_key() {
        let queue = TimerQueue::new();
        queue.schedule(SERVICE_EXIT_KEY, 100, TimerEvent::ServiceExit);
        queue.schedule(SERVICE_EXIT_KEY, 500, TimerEvent::ServiceExit);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.deadline_of(SERVICE_EXIT_KEY), Some(500));
        assert!(queue.take_due(100).is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let queue = TimerQueue::new();
        assert!(!queue.cancel("never"));
        queue.schedule(full_revoke_key(3), 10, TimerEvent::DeferredFullRevoke { token_id: 3 });
        assert!(queue.cancel(&full_revoke_key(3)));
        assert!(!queue.cancel(&full_revoke_key(3)));
        assert!(queue.is_empty());

        queue.schedule(full_revoke_key(3), 10, TimerEvent::DeferredFullRevoke { token_id: 3 });
        let _ = queue.take_due(10);
        // Already fired.
        assert!(!queue.cancel(&full_revoke_key(3)));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_is_past_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    struct Recorder {
        queue: TimerQueue,
        fired: Mutex<Vec<TimerEvent>>,
    }

    impl TimerTarget for Recorder {
        fn timer_queue(&self) -> &TimerQueue {
            &self.queue
        }

        fn now_ms(&self) -> u64 {
            SystemClock.now_ms()
        }

        fn fire(&self, event: TimerEvent) {
            self.fired.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_driver_fires_and_stops() {
        let target = Arc::new(Recorder {
            queue: TimerQueue::new(),
            fired: Mutex::new(Vec::new()),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = TimerDriver::spawn(Arc::clone(&target), stop_rx);

        let now = SystemClock.now_ms();
        target.queue.schedule(SERVICE_EXIT_KEY, now + 20, TimerEvent::ServiceExit);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while target.fired.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "timer never fired");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*target.fired.lock().unwrap(), vec![TimerEvent::ServiceExit]);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver did not stop")
            .unwrap();
    }
}
