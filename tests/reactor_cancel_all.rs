//! End-to-end: registering READ and WRITE on the same fd with two
//! distinct parked coroutines, then calling `cancel_all`, wakes both and
//! leaves nothing registered behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibersched::coroutine::Coroutine;
use fibersched::io_manager::IoEvent;
use fibersched::{Config, IOManager};

#[test]
fn cancel_all_wakes_both_registered_coroutines() {
    let (read_fd, write_fd) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
    let fd = std::os::fd::AsRawFd::as_raw_fd(&write_fd);

    let io = IOManager::new(1, Config::default()).unwrap();
    let woken = Arc::new(AtomicUsize::new(0));

    // Register interest in both halves of the write end from two separate
    // coroutines, each of which parks immediately afterwards.
    for _ in 0..2 {
        let io2 = io.clone();
        let woken2 = woken.clone();
        io.schedule(move || {
            // Only one of READ/WRITE can be registered per coroutine call
            // (`add_event` panics on a duplicate), so alternate between
            // them via a shared counter so each of the two coroutines
            // claims the other half.
            static NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
            let which = NEXT.fetch_add(1, Ordering::SeqCst);
            let event = if which % 2 == 0 { IoEvent::Read } else { IoEvent::Write };
            io2.add_event(fd, event, None).unwrap();
            Coroutine::yield_hold();
            woken2.fetch_add(1, Ordering::SeqCst);
        });
    }

    let runner = {
        let io = io.clone();
        std::thread::spawn(move || io.run())
    };

    std::thread::sleep(Duration::from_millis(30));
    assert!(io.cancel_all(fd));

    std::thread::sleep(Duration::from_millis(50));
    io.stop();
    runner.join().unwrap();

    assert_eq!(woken.load(Ordering::SeqCst), 2);
    // Nothing left registered: a second `cancel_all` finds nothing to do.
    assert!(!io.cancel_all(fd));

    drop(read_fd);
    drop(write_fd);
}
