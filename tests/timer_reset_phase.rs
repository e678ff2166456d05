//! End-to-end: `TimerManager::reset` with `recurring` preserved and
//! `from_now = true`-equivalent rebasing should push the next deadline out
//! from *now*, not from the timer's original phase -- so after a
//! mid-flight reset to a longer period, the gap to the next firing
//! reflects the new period, not the old one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibersched::timer::TimerId;
use fibersched::TimerManager;

#[test]
fn reset_from_now_rebases_the_next_deadline() {
    let mgr = Arc::new(TimerManager::new(None));
    let count = Arc::new(AtomicUsize::new(0));
    let fire_times: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
    // Published after `add_timer` returns, but read only from firings
    // that happen strictly afterwards (the reactor always calls
    // `drain_expired` well after the timer was registered).
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let start = Instant::now();
    let mgr2 = mgr.clone();
    let count2 = count.clone();
    let fire_times2 = fire_times.clone();
    let id_slot2 = id_slot.clone();
    let id = mgr.add_timer(
        Duration::from_millis(20),
        move || {
            let n = count2.fetch_add(1, Ordering::SeqCst) + 1;
            fire_times2.lock().unwrap().push(start.elapsed());
            if n == 3 {
                if let Some(id) = *id_slot2.lock().unwrap() {
                    mgr2.reset(id, Duration::from_millis(40), true);
                }
            }
        },
        true,
    );
    *id_slot.lock().unwrap() = Some(id);

    // Poll drain_expired on a tight loop for a bounded window, simulating
    // what the reactor's idle loop would do every iteration.
    let deadline = start + Duration::from_millis(260);
    while Instant::now() < deadline {
        for cb in mgr.drain_expired() {
            cb();
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    let times = fire_times.lock().unwrap();
    assert!(times.len() >= 4, "expected at least 4 firings, got {:?}", *times);

    // First three firings roughly every 20ms; the fourth should land
    // ~40ms after the third (the reset period), not ~20ms.
    let gap_3_4 = times[3].saturating_sub(times[2]);
    assert!(
        gap_3_4 >= Duration::from_millis(30),
        "expected the post-reset gap to reflect the new 40ms period, got {:?}",
        gap_3_4
    );
}
