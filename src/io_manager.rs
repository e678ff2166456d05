//! Epoll-backed reactor plugged into `Scheduler` through the `IdleHook`
//! seam: whenever a worker's ready queue runs dry, `IOManager::idle` does
//! one `epoll_wait` (bounded by the nearest timer deadline, or a fallback
//! ceiling so the run loop keeps re-checking `stopping`), drains whatever
//! timers came due, and turns ready fds back into ready-queue entries.
//!
//! A reactor-as-scheduler-subclass, overriding `idle()`/`tickle()`/
//! `onTimerInsertedAtFront()`, is a natural shape in a language with
//! virtual dispatch; Rust has no equivalent to lean on, so `IOManager`
//! instead *wraps* a `Scheduler` and implements `IdleHook` on itself.

use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::fcntl::OFlag;
use nix::unistd;

use crate::config::Config;
use crate::coroutine::Coroutine;
use crate::error::Result;
use crate::scheduler::{CoroutineId, IdleHook, Scheduler};
use crate::timer::{OnInsertedAtFront, TimerId, TimerManager};

const MAX_EVENTS: usize = 256;
/// Upper bound on how long a single `epoll_wait` blocks even with no timer
/// pending, so the run loop keeps re-checking `stopping` promptly.
const MAX_IDLE_TIMEOUT_MS: u64 = 3_000;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Which half of a socket's readiness is being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

enum EventTarget {
    /// Resume the coroutine that registered this event and then parked
    /// itself with `Coroutine::yield_hold()`.
    Resume(CoroutineId),
    /// Run this closure as a freshly spawned coroutine instead of
    /// resuming an existing one.
    Callback(Callback),
}

fn fire(scheduler: &Scheduler, target: EventTarget) {
    match target {
        EventTarget::Resume(id) => {
            // The coroutine may have been scheduled with a thread_hint
            // (schedule_pinned) well before it parked on this fd; look its
            // pin back up rather than re-enqueuing it as unpinned, or it
            // could get picked up by a different worker (violates P5).
            let hint = scheduler.coroutine_thread_hint(id);
            scheduler.readyq_push_resume(id, hint);
        }
        EventTarget::Callback(cb) => scheduler.schedule(move || cb()),
    }
}

#[derive(Default)]
struct FdState {
    read: Option<EventTarget>,
    write: Option<EventTarget>,
}

impl FdState {
    fn epoll_flags(&self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLET;
        if self.read.is_some() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write.is_some() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext { fd, state: Mutex::new(FdState::default()) }
    }
}

struct WakeHook {
    wake_write: RawFd,
}

impl OnInsertedAtFront for WakeHook {
    fn call(&self) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.wake_write) };
        let _ = unistd::write(fd, b"T");
    }
}

struct IOManagerCore {
    scheduler: Scheduler,
    epoll: Epoll,
    wake_read: RawFd,
    wake_write: RawFd,
    fd_table: RwLock<Vec<Option<Arc<FdContext>>>>,
    pending: AtomicUsize,
    timers: TimerManager,
}

/// A coroutine scheduler with an epoll-backed reactor grafted onto its
/// idle hook. Cheap to clone -- every clone shares the same epoll
/// instance, fd table, and ready queue.
#[derive(Clone)]
pub struct IOManager {
    core: Arc<IOManagerCore>,
}

impl IOManager {
    /// Convenience constructor: `thread_count` workers, the calling
    /// thread donated as worker 0 (see `Scheduler::new`).
    pub fn new(thread_count: usize, config: Config) -> Result<IOManager> {
        IOManager::with_options(thread_count, true, "fibersched", config)
    }

    /// Build a reactor over `thread_count` workers; see
    /// `Scheduler::with_options` for what `use_caller` and `name` control.
    pub fn with_options(
        thread_count: usize,
        use_caller: bool,
        name: impl Into<String>,
        config: Config,
    ) -> Result<IOManager> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(std::io::Error::from)?;

        let (wake_read, wake_write) =
            unistd::pipe2(OFlag::O_NONBLOCK).map_err(std::io::Error::from)?;
        let wake_read = wake_read.into_raw_fd();
        let wake_write = wake_write.into_raw_fd();

        let wake_event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, wake_read as u64);
        epoll
            .add(unsafe { BorrowedFd::borrow_raw(wake_read) }, wake_event)
            .map_err(std::io::Error::from)?;

        let timers = TimerManager::new(Some(Arc::new(WakeHook { wake_write })));

        Ok(IOManager {
            core: Arc::new(IOManagerCore {
                scheduler: Scheduler::with_options(thread_count, use_caller, name, config),
                epoll,
                wake_read,
                wake_write,
                fd_table: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
                timers,
            }),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.core.timers
    }

    pub fn config(&self) -> &Config {
        self.core.scheduler.config()
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.scheduler.schedule(f);
    }

    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.timers.add_timer(delay, cb, recurring)
    }

    /// Start the reactor. Blocks the calling thread as one of the
    /// scheduler's workers, same contract as `Scheduler::run`.
    pub fn run(&self) {
        let hook: Arc<dyn IdleHook> = Arc::new(self.clone());
        self.core.scheduler.run(hook);
    }

    pub fn stop(&self) {
        self.core.scheduler.stop();
    }

    /// Per spec: `IOManager.stopping()` additionally requires no pending
    /// I/O events and no future timers, not merely the bare scheduler
    /// condition -- a coroutine still parked on a fd, or a timer still
    /// armed, must not be abandoned by a `stop()` that races ahead of it.
    pub fn stopping(&self) -> bool {
        self.core.scheduler.stopping() && self.io_quiescent()
    }

    fn io_quiescent(&self) -> bool {
        self.core.pending.load(Ordering::Acquire) == 0 && !self.core.timers.has_pending()
    }

    /// Register interest in `event` on `fd`. If `cb` is `None`, the
    /// currently-running coroutine is captured and resumed when the event
    /// fires -- the caller is expected to `Coroutine::yield_hold()`
    /// immediately after this call returns. If `cb` is `Some`, it runs as
    /// a brand new coroutine instead, with no existing coroutine parked.
    ///
    /// # Panics
    /// Panics if `event` is already registered on `fd` (a programmer
    /// error: callers must `del_event`/`cancel_event` first), or if `cb`
    /// is `None` and this isn't called from inside a running coroutine.
    pub fn add_event(&self, fd: RawFd, event: IoEvent, cb: Option<Callback>) -> Result<()> {
        let ctx = self.fd_context(fd);
        let mut state = ctx.state.lock().unwrap();
        let had_any = !state.is_empty();

        match event {
            IoEvent::Read => assert!(state.read.is_none(), "fd {} already has a read event registered", fd),
            IoEvent::Write => assert!(state.write.is_none(), "fd {} already has a write event registered", fd),
        }

        let target = match cb {
            Some(cb) => EventTarget::Callback(cb),
            None => EventTarget::Resume(
                Coroutine::current_id()
                    .expect("add_event with no callback must run inside a coroutine"),
            ),
        };

        match event {
            IoEvent::Read => state.read = Some(target),
            IoEvent::Write => state.write = Some(target),
        }

        let mut epevent = EpollEvent::new(state.epoll_flags(), fd as u64);
        let raw = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if had_any {
            self.core.epoll.modify(raw, &mut epevent)
        } else {
            self.core.epoll.add(raw, epevent)
        };
        result.map_err(std::io::Error::from)?;

        self.core.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Deregister `event` on `fd` without firing whatever was waiting on
    /// it. Returns `false` if it wasn't registered -- an out-of-range
    /// operation, not an error.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx = match self.fd_context_if_exists(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().unwrap();

        let present = match event {
            IoEvent::Read => state.read.is_some(),
            IoEvent::Write => state.write.is_some(),
        };
        if !present {
            return false;
        }
        match event {
            IoEvent::Read => state.read = None,
            IoEvent::Write => state.write = None,
        }

        if !self.sync_epoll_registration(fd, &state) {
            return false;
        }
        self.core.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Deregister `event` on `fd` and fire whatever was waiting on it
    /// immediately, as if it had become ready. Returns `false` if it
    /// wasn't registered.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx = match self.fd_context_if_exists(fd) {
            Some(ctx) => ctx,
            None => return false,
        };

        let target = {
            let mut state = ctx.state.lock().unwrap();
            let existing = match event {
                IoEvent::Read => state.read.take(),
                IoEvent::Write => state.write.take(),
            };
            let existing = match existing {
                Some(t) => t,
                None => return false,
            };

            if !self.sync_epoll_registration(fd, &state) {
                // Registration unchanged in the kernel; put the target back.
                match event {
                    IoEvent::Read => state.read = Some(existing),
                    IoEvent::Write => state.write = Some(existing),
                }
                return false;
            }
            existing
        };

        self.core.pending.fetch_sub(1, Ordering::AcqRel);
        fire(&self.core.scheduler, target);
        true
    }

    /// Deregister every event on `fd` and fire whichever were waiting.
    /// Returns `false` if nothing was registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.fd_context_if_exists(fd) {
            Some(ctx) => ctx,
            None => return false,
        };

        let (read_target, write_target) = {
            let mut state = ctx.state.lock().unwrap();
            if state.is_empty() {
                return false;
            }
            let raw = unsafe { BorrowedFd::borrow_raw(fd) };
            // Always a DEL with an empty mask, even if the kernel
            // registration still technically covers events we're about
            // to clear anyway, rather than trying to be clever about
            // MOD vs DEL here.
            if let Err(e) = self.core.epoll.delete(raw) {
                log::error!("epoll_ctl(DEL) failed for fd {}: {}", fd, e);
                return false;
            }
            (state.read.take(), state.write.take())
        };

        let mut fired = 0usize;
        if let Some(t) = read_target {
            fire(&self.core.scheduler, t);
            fired += 1;
        }
        if let Some(t) = write_target {
            fire(&self.core.scheduler, t);
            fired += 1;
        }
        self.core.pending.fetch_sub(fired, Ordering::AcqRel);
        true
    }

    fn sync_epoll_registration(&self, fd: RawFd, state: &FdState) -> bool {
        let raw = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if state.is_empty() {
            self.core.epoll.delete(raw)
        } else {
            let mut epevent = EpollEvent::new(state.epoll_flags(), fd as u64);
            self.core.epoll.modify(raw, &mut epevent)
        };
        if let Err(e) = result {
            log::error!("epoll_ctl failed updating fd {}: {}", fd, e);
            return false;
        }
        true
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.core.fd_table.read().unwrap();
            if let Some(Some(ctx)) = table.get(idx) {
                return ctx.clone();
            }
        }

        let mut table = self.core.fd_table.write().unwrap();
        if idx >= table.len() {
            let grown = ((idx + 1) as f64 * 1.5) as usize;
            table.resize_with(grown.max(idx + 1), || None);
        }
        if table[idx].is_none() {
            table[idx] = Some(Arc::new(FdContext::new(fd)));
        }
        table[idx].clone().unwrap()
    }

    fn fd_context_if_exists(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.core.fd_table.read().unwrap();
        table.get(fd as usize).and_then(|slot| slot.clone())
    }

    fn handle_ready_fd(&self, fd: RawFd, triggered: EpollFlags) {
        let ctx = match self.fd_context_if_exists(fd) {
            Some(ctx) => ctx,
            None => return,
        };

        let mut readable = triggered.contains(EpollFlags::EPOLLIN);
        let mut writable = triggered.contains(EpollFlags::EPOLLOUT);
        if triggered.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            readable = true;
            writable = true;
        }

        let mut fired = Vec::with_capacity(2);
        {
            let mut state = ctx.state.lock().unwrap();
            if readable {
                if let Some(target) = state.read.take() {
                    fired.push(target);
                } else {
                    readable = false;
                }
            }
            if writable {
                if let Some(target) = state.write.take() {
                    fired.push(target);
                } else {
                    writable = false;
                }
            }
            if !readable && !writable {
                return;
            }
            self.sync_epoll_registration(fd, &state);
        }

        self.core.pending.fetch_sub(fired.len(), Ordering::AcqRel);
        for target in fired {
            fire(&self.core.scheduler, target);
        }
    }
}

impl IdleHook for IOManager {
    fn idle(&self, scheduler: &Scheduler) {
        if scheduler.stopping() && self.io_quiescent() {
            return;
        }

        let timeout_ms = self
            .core
            .timers
            .next_timeout_ms()
            .map(|ms| ms.min(MAX_IDLE_TIMEOUT_MS))
            .unwrap_or(MAX_IDLE_TIMEOUT_MS);
        let timeout = EpollTimeout::from(timeout_ms as u16);

        let mut events: Vec<EpollEvent> =
            (0..MAX_EVENTS).map(|_| EpollEvent::new(EpollFlags::empty(), 0)).collect();
        let n = match self.core.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => return,
            Err(e) => {
                log::error!("epoll_wait failed: {}", e);
                return;
            }
        };

        for cb in self.core.timers.drain_expired() {
            scheduler.schedule(move || cb());
        }

        for ev in &events[..n] {
            let fd = ev.data() as RawFd;
            if fd == self.core.wake_read {
                drain_wake_pipe(self.core.wake_read);
                continue;
            }
            self.handle_ready_fd(fd, ev.events());
        }
    }

    fn tickle(&self) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.core.wake_write) };
        let _ = unistd::write(fd, b"T");
    }

    fn quiescent(&self, _scheduler: &Scheduler) -> bool {
        self.io_quiescent()
    }
}

impl Drop for IOManagerCore {
    fn drop(&mut self) {
        let _ = unistd::close(self.epoll.as_raw_fd());
        let _ = unistd::close(self.wake_read);
        let _ = unistd::close(self.wake_write);
    }
}

fn drain_wake_pipe(wake_read: RawFd) {
    let fd = unsafe { BorrowedFd::borrow_raw(wake_read) };
    let mut buf = [0u8; 256];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }
}
