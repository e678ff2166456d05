//! Ordered timer wheel: deadlines are kept in a `BTreeSet` ordered by
//! `(Instant, id)`, the trailing id breaking ties between timers that land
//! on the same instant so two timers never compare equal and get silently
//! merged into one slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline_nanos: u128,
    id: u64,
}

struct TimerEntry {
    /// The delay this timer was last (re)armed with, kept even for
    /// one-shot timers so `refresh` has something to re-apply.
    delay: Duration,
    recurring: bool,
    cb: Callback,
    /// `None` for an unconditional timer; `Some` for a condition timer,
    /// checked before each firing.
    still_alive: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

struct Inner {
    epoch: Instant,
    timers: BTreeSet<TimerKey>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
    tickled: bool,
    /// `now` as sampled by the previous `drain_expired` call, used to spot
    /// a clock jump backwards.
    last_sampled: Option<Instant>,
}

/// If a clock sample goes backwards by more than this much since the last
/// `drain_expired`, every pending timer is treated as expired rather than
/// left to fire (possibly much) later than intended.
const CLOCK_ROLLBACK_THRESHOLD: Duration = Duration::from_secs(3600);

/// A live timer registration. Dropping this handle does not cancel the
/// timer -- use `TimerManager::cancel` explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u64);

/// Hook invoked whenever a newly added timer becomes the new earliest
/// deadline, so the reactor can shrink its `epoll_wait` timeout instead of
/// blocking on a now-stale one. Debounced: fires at most once per reactor
/// iteration, the flag cleared by `next_timeout_ms`.
pub trait OnInsertedAtFront: Send + Sync {
    fn call(&self);
}

pub struct TimerManager {
    inner: Mutex<Inner>,
    on_inserted_at_front: Option<Arc<dyn OnInsertedAtFront>>,
}

impl TimerManager {
    pub fn new(on_inserted_at_front: Option<Arc<dyn OnInsertedAtFront>>) -> TimerManager {
        TimerManager {
            inner: Mutex::new(Inner {
                epoch: Instant::now(),
                timers: BTreeSet::new(),
                entries: HashMap::new(),
                next_id: 1,
                tickled: false,
                last_sampled: None,
            }),
            on_inserted_at_front,
        }
    }

    /// Schedule `cb` to run after `delay`, repeating every `delay` if
    /// `recurring` is true.
    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(delay, recurring, Arc::new(cb), None)
    }

    /// Like `add_timer`, but the callback only runs if `weak` can still be
    /// upgraded at the time the timer fires -- lets a timer be bound to an
    /// object's lifetime without that object remembering to cancel it.
    pub fn add_condition_timer<T, F>(
        &self,
        delay: Duration,
        weak: Weak<T>,
        cb: F,
        recurring: bool,
    ) -> TimerId
    where
        T: Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let still_alive: Box<dyn Fn() -> bool + Send + Sync> =
            Box::new(move || weak.upgrade().is_some());
        self.insert(delay, recurring, Arc::new(cb), Some(still_alive))
    }

    fn insert(
        &self,
        delay: Duration,
        recurring: bool,
        cb: Callback,
        still_alive: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    ) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        let deadline = Instant::now() + delay;
        let key = TimerKey { deadline_nanos: nanos_since(inner.epoch, deadline), id };

        let is_new_front = inner.timers.iter().next().map(|front| *front > key).unwrap_or(true);

        inner.timers.insert(key);
        inner.entries.insert(id, TimerEntry { delay, recurring, cb, still_alive });

        if is_new_front && !inner.tickled {
            inner.tickled = true;
            drop(inner);
            if let Some(hook) = &self.on_inserted_at_front {
                hook.call();
            }
        }

        TimerId(id)
    }

    /// Cancel a pending timer. Returns `false` if it had already fired or
    /// was never registered -- an out-of-range operation, not an error.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(&id.0).is_none() {
            return false;
        }
        if let Some(key) = inner.timers.iter().find(|k| k.id == id.0).copied() {
            inner.timers.remove(&key);
        }
        true
    }

    /// Push a pending timer's deadline out to its last-armed delay from
    /// now, keeping its callback and recurrence. Returns `false` if it
    /// wasn't pending.
    pub fn refresh(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let epoch = inner.epoch;
        let old_key = match inner.timers.iter().find(|k| k.id == id.0).copied() {
            Some(k) => k,
            None => return false,
        };
        let delay = match inner.entries.get(&id.0) {
            Some(entry) => entry.delay,
            None => return false,
        };
        inner.timers.remove(&old_key);
        let new_deadline = Instant::now() + delay;
        inner.timers.insert(TimerKey { deadline_nanos: nanos_since(epoch, new_deadline), id: id.0 });
        true
    }

    /// Re-time a pending timer to `new_delay`, keeping its existing
    /// recurrence: `from_now` controls whether the next deadline is
    /// `now + new_delay` (`true`) or the timer's previous deadline minus
    /// its previous delay, plus `new_delay` (`false` -- keeps the timer's
    /// original phase, useful for correcting drift without resetting when
    /// it next lands).
    pub fn reset(&self, id: TimerId, new_delay: Duration, from_now: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let epoch = inner.epoch;
        let old_key = match inner.timers.iter().find(|k| k.id == id.0).copied() {
            Some(k) => k,
            None => return false,
        };
        inner.timers.remove(&old_key);

        let deadline = if from_now {
            Instant::now() + new_delay
        } else {
            let old_deadline = epoch + Duration::from_nanos(old_key.deadline_nanos as u64);
            let old_delay = inner.entries.get(&id.0).map(|e| e.delay).unwrap_or(new_delay);
            let start = old_deadline.checked_sub(old_delay).unwrap_or(old_deadline);
            start + new_delay
        };

        inner.timers.insert(TimerKey { deadline_nanos: nanos_since(epoch, deadline), id: id.0 });

        if let Some(entry) = inner.entries.get_mut(&id.0) {
            entry.delay = new_delay;
        }
        true
    }

    /// Whether any timer is currently pending. Side-effect-free, unlike
    /// `next_timeout_ms`, which also clears the `on_inserted_at_front`
    /// debounce flag -- callers that just need to gate shutdown on "is
    /// there still a future timer" should use this instead.
    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().timers.is_empty()
    }

    /// Milliseconds until the next timer fires, or `None` if there are no
    /// pending timers (the reactor should then block indefinitely).
    /// Clears the debounce flag for `on_inserted_at_front`.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.tickled = false;

        inner.timers.iter().next().map(|key| {
            let deadline = inner.epoch + Duration::from_nanos(key.deadline_nanos as u64);
            let now = Instant::now();
            if deadline <= now {
                0
            } else {
                (deadline - now).as_millis() as u64
            }
        })
    }

    /// Pop every timer whose deadline has passed, re-arming recurring
    /// ones (skipping condition timers whose target has been dropped),
    /// and return their callbacks for the caller to run outside any lock
    /// this manager holds.
    ///
    /// If the sampled clock has jumped backwards by more than an hour
    /// since the previous call, every pending timer is drained regardless
    /// of its deadline -- see the clock-rollback note in the crate's
    /// design docs. No attempt is made to correct future deadlines beyond
    /// that; this is the entire recovery policy.
    pub fn drain_expired(&self) -> Vec<Callback> {
        let mut inner = self.inner.lock().unwrap();

        let now = Instant::now();
        let now_nanos = nanos_since(inner.epoch, now);

        let rolled_back = inner
            .last_sampled
            .map(|prev| prev.saturating_duration_since(now) > CLOCK_ROLLBACK_THRESHOLD)
            .unwrap_or(false);
        inner.last_sampled = Some(now);

        let expired: Vec<TimerKey> = if rolled_back {
            log::warn!("timer clock rolled back by more than an hour; draining all pending timers");
            inner.timers.iter().copied().collect()
        } else {
            inner
                .timers
                .iter()
                .take_while(|key| key.deadline_nanos <= now_nanos)
                .copied()
                .collect()
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for key in expired {
            inner.timers.remove(&key);
            let entry = match inner.entries.remove(&key.id) {
                Some(e) => e,
                None => continue,
            };

            let alive = entry.still_alive.as_ref().map(|f| f()).unwrap_or(true);
            if alive {
                callbacks.push(entry.cb.clone());
            }

            if entry.recurring && alive {
                let next = TimerKey { deadline_nanos: now_nanos + entry.delay.as_nanos(), id: key.id };
                inner.timers.insert(next);
                inner.entries.insert(key.id, entry);
            }
        }

        callbacks
    }
}

fn nanos_since(epoch: Instant, t: Instant) -> u128 {
    t.saturating_duration_since(epoch).as_nanos()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::TimerManager;

    #[test]
    fn fires_after_delay() {
        let mgr = TimerManager::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        mgr.add_timer(Duration::from_millis(10), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }, false);

        std::thread::sleep(Duration::from_millis(20));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mgr = TimerManager::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = mgr.add_timer(Duration::from_millis(10), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }, false);

        assert!(mgr.cancel(id));
        assert!(!mgr.cancel(id));

        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.drain_expired().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_rearms_itself() {
        let mgr = TimerManager::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = mgr.add_timer(Duration::from_millis(5), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }, true);

        std::thread::sleep(Duration::from_millis(12));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mgr.cancel(id));
    }

    #[test]
    fn condition_timer_skipped_after_drop() {
        let mgr = TimerManager::new(None);
        let token = Arc::new(());
        let weak = Arc::downgrade(&token);
        mgr.add_condition_timer(Duration::from_millis(10), weak, || {}, false);

        drop(token);
        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.drain_expired().is_empty());
    }

    #[test]
    fn next_timeout_reflects_nearest_deadline() {
        let mgr = TimerManager::new(None);
        assert!(mgr.next_timeout_ms().is_none());
        mgr.add_timer(Duration::from_millis(50), || {}, false);
        let remaining = mgr.next_timeout_ms().expect("a timer is pending");
        assert!(remaining <= 50);
    }

    #[test]
    fn reset_not_from_now_keeps_the_original_phase() {
        let mgr = TimerManager::new(None);
        let id = mgr.add_timer(Duration::from_millis(1_000), || {}, false);

        // Immediately reset to a 500ms period without rebasing from now;
        // the new deadline should sit close to 500ms from the *original*
        // add_timer call, not 500ms from this reset call (the two are
        // only a few microseconds apart here, so this mainly pins down
        // that `from_now = false` doesn't silently behave like `true`).
        assert!(mgr.reset(id, Duration::from_millis(500), false));
        let remaining = mgr.next_timeout_ms().expect("timer still pending");
        assert!(remaining <= 500, "expected ~500ms remaining, got {}ms", remaining);
    }

    #[test]
    fn reset_from_now_rebases_the_deadline() {
        let mgr = TimerManager::new(None);
        let id = mgr.add_timer(Duration::from_millis(1_000), || {}, false);

        assert!(mgr.reset(id, Duration::from_millis(30), true));
        std::thread::sleep(Duration::from_millis(40));
        let fired: Vec<_> = mgr.drain_expired();
        assert_eq!(fired.len(), 1, "reset(from_now=true) should make the timer due ~30ms out");
    }

    #[test]
    fn reset_of_unknown_timer_returns_false() {
        let mgr = TimerManager::new(None);
        let id = mgr.add_timer(Duration::from_millis(10), || {}, false);
        assert!(mgr.cancel(id));
        assert!(!mgr.reset(id, Duration::from_millis(10), true));
    }
}
