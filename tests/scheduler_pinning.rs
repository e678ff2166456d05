//! End-to-end: several closures pinned to specific worker threads all run
//! exactly once, each observed on the thread it was pinned to, and the
//! scheduler shuts down cleanly afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fibersched::{Config, Scheduler};

#[test]
fn pinned_tasks_run_on_their_assigned_worker() {
    let sched = Scheduler::new(3, Config::default());

    let remaining = Arc::new(AtomicUsize::new(5));
    let seen_threads: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5 {
        let worker = i % 3;
        let remaining = remaining.clone();
        let seen_threads = seen_threads.clone();
        sched.schedule_pinned(
            move || {
                let name = std::thread::current().name().unwrap().to_string();
                seen_threads.lock().unwrap().push((worker, name));
                remaining.fetch_sub(1, Ordering::SeqCst);
            },
            worker,
        );
    }

    // `run()` donates whichever thread calls it as worker 0; name that
    // thread to match the scheduler's own `{name}-worker-{n}` convention
    // for workers 1.. so the thread-name assertion below is uniform.
    let hook = Scheduler::default_idle_hook();
    let sched_clone = sched.clone();
    let runner = std::thread::Builder::new()
        .name("fibersched-worker-0".to_string())
        .spawn(move || sched_clone.run(hook))
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    sched.stop();
    runner.join().unwrap();

    assert_eq!(remaining.load(Ordering::SeqCst), 0);

    let seen = seen_threads.lock().unwrap();
    assert_eq!(seen.len(), 5);
    for (worker, thread_name) in seen.iter() {
        assert!(
            thread_name.ends_with(&format!("-{}", worker)),
            "task pinned to worker {} ran on thread {:?}",
            worker,
            thread_name
        );
    }
}
