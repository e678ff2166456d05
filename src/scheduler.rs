//! FIFO coroutine scheduler over a fixed pool of OS threads.
//!
//! No work stealing, no priorities, no fair CPU accounting beyond the
//! thread-hint pinning below -- see the crate-level docs for the full
//! list of non-goals. Every coroutine lives in a slab-style arena keyed by
//! `CoroutineId`; the ready queue and anything that parks a coroutine (the
//! reactor, the timer manager) only ever hand around that id, never the
//! coroutine itself, which sidesteps the reference-cycle problem a
//! `Arc<Coroutine>`-based design would have.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::config::Config;
use crate::coroutine::{Coroutine, PanicPayload, State};

pub type CoroutineId = usize;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum ReadyEntry {
    Spawn(Task, Option<usize>),
    Resume(CoroutineId, Option<usize>),
}

impl ReadyEntry {
    fn thread_hint(&self) -> Option<usize> {
        match self {
            ReadyEntry::Spawn(_, hint) => *hint,
            ReadyEntry::Resume(_, hint) => *hint,
        }
    }
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Box<Coroutine>>>,
    free: Vec<CoroutineId>,
}

impl Arena {
    fn insert(&mut self, coro: Box<Coroutine>) -> CoroutineId {
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(coro);
            id
        } else {
            self.slots.push(Some(coro));
            self.slots.len() - 1
        }
    }

    fn take(&mut self, id: CoroutineId) -> Box<Coroutine> {
        self.slots[id]
            .take()
            .unwrap_or_else(|| panic!("coroutine {} is not in the arena (already running?)", id))
    }

    /// Whether `id` currently names a coroutine sitting in the arena --
    /// i.e. it exists and nothing else has already taken it out to run or
    /// released it after TERM/EXCEPT. Used to drop stale duplicate
    /// `Resume` entries (the spec's "payload.state == EXEC: continue"
    /// guard) rather than racing another dispatch for the same id.
    fn contains(&self, id: CoroutineId) -> bool {
        self.slots.get(id).map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn thread_hint_of(&self, id: CoroutineId) -> Option<usize> {
        self.slots.get(id)?.as_ref()?.thread_hint()
    }

    fn put_back(&mut self, id: CoroutineId, coro: Box<Coroutine>) {
        debug_assert!(self.slots[id].is_none());
        self.slots[id] = Some(coro);
    }

    fn release(&mut self, id: CoroutineId) {
        debug_assert!(self.slots[id].is_none());
        self.free.push(id);
    }
}

/// Hook point a `Scheduler` calls into when its ready queue is empty.
/// `IOManager` implements this with an epoll reactor; the plain
/// `Scheduler` falls back to a short cooperative sleep.
pub trait IdleHook: Send + Sync {
    /// Block (bounded) for new work, then return so the run loop can
    /// rescan the ready queue. Must itself poll `stopping` and return
    /// promptly once it is set.
    fn idle(&self, scheduler: &Scheduler);

    /// Wake any thread currently blocked inside `idle`.
    fn tickle(&self);

    /// Extra condition a worker must also satisfy, beyond `stopping()`
    /// and an empty ready queue, before it may stop running. The base
    /// scheduler has no extra state to drain, so this defaults to `true`;
    /// `IOManager` overrides it to require no pending fd registrations and
    /// no future timers (spec: "`IOManager.stopping()` additionally
    /// requires no pending I/O events and no future timers").
    fn quiescent(&self, _scheduler: &Scheduler) -> bool {
        true
    }
}

struct DefaultIdle;

impl IdleHook for DefaultIdle {
    fn idle(&self, scheduler: &Scheduler) {
        if scheduler.stopping() {
            return;
        }
        let (lock, cvar) = &*scheduler.core.idle_wait;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, std::time::Duration::from_millis(20));
    }

    fn tickle(&self) {}
}

pub(crate) struct SchedulerCore {
    name: String,
    ready: Mutex<VecDeque<ReadyEntry>>,
    arena: Mutex<Arena>,
    config: Config,
    thread_count: usize,
    use_caller: bool,
    stopping: AtomicBool,
    started: AtomicBool,
    active_threads: AtomicUsize,
    idle_wait: Arc<(Mutex<()>, Condvar)>,
    /// The hook passed to the currently running `run()` call, if any.
    /// Consulted on every enqueue so a ready queue transitioning from
    /// empty to non-empty can tickle whichever worker might be parked in
    /// `idle()` (spec §4.2: "if the queue was empty before the push, a
    /// `tickle` is fired").
    idle_hook: Mutex<Option<Arc<dyn IdleHook>>>,
}

/// A running (or not-yet-started) coroutine scheduler.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Convenience constructor: `thread_count` workers, the calling thread
    /// donated as worker 0 (`use_caller = true`), named `"fibersched"`.
    pub fn new(thread_count: usize, config: Config) -> Scheduler {
        Scheduler::with_options(thread_count, true, "fibersched", config)
    }

    /// Build a scheduler with `thread_count` workers. If `use_caller` is
    /// true, the thread that calls `run()` is donated as an additional
    /// worker (worker 0) rather than merely blocking on `join`; that
    /// thread must then be the one that eventually calls `run()`. `name`
    /// is used as the OS thread-name prefix for spawned workers and in
    /// log lines.
    pub fn with_options(
        thread_count: usize,
        use_caller: bool,
        name: impl Into<String>,
        config: Config,
    ) -> Scheduler {
        assert!(thread_count >= 1, "scheduler needs at least one thread");
        config.validate().expect("invalid scheduler config");

        Scheduler {
            core: Arc::new(SchedulerCore {
                name: name.into(),
                ready: Mutex::new(VecDeque::new()),
                arena: Mutex::new(Arena::default()),
                config,
                thread_count,
                use_caller,
                stopping: AtomicBool::new(true),
                started: AtomicBool::new(false),
                active_threads: AtomicUsize::new(0),
                idle_wait: Arc::new((Mutex::new(()), Condvar::new())),
                idle_hook: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn thread_count(&self) -> usize {
        self.core.thread_count
    }

    pub fn use_caller(&self) -> bool {
        self.core.use_caller
    }

    /// Schedule a closure to run as a new coroutine, with no thread
    /// preference.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_on(f, None);
    }

    /// Schedule a closure pinned to a specific worker thread (0-indexed).
    pub fn schedule_pinned<F>(&self, f: F, worker: usize)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(worker < self.core.thread_count, "no such worker thread");
        self.schedule_on(f, Some(worker));
    }

    fn schedule_on<F>(&self, f: F, hint: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_ready(ReadyEntry::Spawn(Box::new(f), hint));
    }

    /// Schedule a batch of closures in order; equivalent to calling
    /// `schedule` in a loop but takes the ready-queue lock once and
    /// tickles at most once for the whole batch.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Box<dyn FnOnce() + Send + 'static>>,
    {
        let was_empty = {
            let mut ready = self.core.ready.lock().unwrap();
            let was_empty = ready.is_empty();
            for task in tasks {
                ready.push_back(ReadyEntry::Spawn(task, None));
            }
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    pub(crate) fn push_ready(&self, entry: ReadyEntry) {
        let was_empty = {
            let mut ready = self.core.ready.lock().unwrap();
            let was_empty = ready.is_empty();
            ready.push_back(entry);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    pub(crate) fn readyq_push_resume(&self, id: CoroutineId, hint: Option<usize>) {
        self.push_ready(ReadyEntry::Resume(id, hint));
    }

    /// Wake whichever worker (if any) is currently parked in `hook.idle()`.
    /// A no-op before `run()` is called or after it returns, since nothing
    /// can be parked then.
    fn tickle(&self) {
        if let Some(hook) = self.core.idle_hook.lock().unwrap().as_ref() {
            hook.tickle();
        }
    }

    pub(crate) fn arena_insert(&self, coro: Box<Coroutine>) -> CoroutineId {
        self.core.arena.lock().unwrap().insert(coro)
    }

    /// The `thread_hint` a still-arena-resident coroutine was originally
    /// pinned with, if any. Used to re-pin a coroutine that parks on I/O
    /// or a timer and is later resumed by something (the reactor, a timer
    /// callback) that only knows its id, not the hint it was spawned with.
    pub(crate) fn coroutine_thread_hint(&self, id: CoroutineId) -> Option<usize> {
        self.core.arena.lock().unwrap().thread_hint_of(id)
    }

    pub fn stopping(&self) -> bool {
        self.core.stopping.load(Ordering::Acquire)
    }

    /// Start the worker threads. If `use_caller` was set at construction,
    /// the calling thread is donated as worker 0 and this call blocks
    /// until `stop()` drains the last worker; `run()` must then be called
    /// from the same thread that will eventually call `stop()`, per the
    /// `use_caller` precondition. Otherwise every worker -- including
    /// worker 0 -- is spawned on its own OS thread and this call simply
    /// blocks joining them, safe to invoke from any thread.
    ///
    /// `hook` drives what happens when a worker's ready queue is
    /// momentarily empty (an `IOManager` plugs its epoll reactor in here).
    pub fn run(&self, hook: Arc<dyn IdleHook>) {
        if self.core.started.swap(true, Ordering::AcqRel) {
            panic!("scheduler is already running");
        }
        self.core.stopping.store(false, Ordering::Release);
        *self.core.idle_hook.lock().unwrap() = Some(hook.clone());

        let first_spawned = if self.core.use_caller { 1 } else { 0 };
        let mut handles = Vec::with_capacity(self.core.thread_count - first_spawned);
        for worker in first_spawned..self.core.thread_count {
            let sched = self.clone();
            let hook = hook.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("{}-worker-{}", self.core.name, worker))
                    .spawn(move || sched.worker_loop(worker, hook))
                    .expect("failed to spawn scheduler worker thread"),
            );
        }

        if self.core.use_caller {
            self.worker_loop(0, hook);
        }

        for handle in handles {
            let _ = handle.join();
        }

        *self.core.idle_hook.lock().unwrap() = None;
        self.core.started.store(false, Ordering::Release);
    }

    /// Ask the scheduler to stop once the ready queue drains. Safe to call
    /// from any thread, including from inside a coroutine, for a scheduler
    /// built with `use_caller = false`. With `use_caller = true` it should
    /// be called from the thread that called `run()` -- `run()` never
    /// hands that thread's own stack to a coroutine, so nothing here
    /// actually requires that discipline, but callers should not rely on
    /// the relaxation since it's an implementation detail, not a
    /// guarantee.
    pub fn stop(&self) {
        self.core.stopping.store(true, Ordering::Release);
        let (_, cvar) = &*self.core.idle_wait;
        cvar.notify_all();
    }

    fn worker_loop(&self, worker: usize, hook: Arc<dyn IdleHook>) {
        self.core.active_threads.fetch_add(1, Ordering::AcqRel);
        loop {
            match self.pick_ready(worker, &*hook) {
                Some(entry) => self.dispatch(entry, worker),
                None => {
                    if self.stopping() && self.is_drained() && hook.quiescent(self) {
                        break;
                    }
                    hook.idle(self);
                    if self.stopping() && self.is_drained() && hook.quiescent(self) {
                        break;
                    }
                }
            }
        }
        self.core.active_threads.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_drained(&self) -> bool {
        self.core.ready.lock().unwrap().is_empty()
    }

    fn pick_ready(&self, worker: usize, hook: &dyn IdleHook) -> Option<ReadyEntry> {
        let mut ready = self.core.ready.lock().unwrap();
        let mut skipped = false;
        let mut found = None;
        let mut i = 0;
        while i < ready.len() {
            let hint = ready[i].thread_hint();
            if hint.is_some() && hint != Some(worker) {
                skipped = true;
                i += 1;
                continue;
            }
            // Spec §4.2: "if it.kind == coroutine and it.payload.state ==
            // EXEC: continue". In this arena-indexed design a coroutine
            // that's already EXEC (or already TERM/EXCEPT and released)
            // shows up as an empty arena slot -- e.g. a single coroutine
            // registered both READ and WRITE on one fd and both fired in
            // the same epoll batch, producing two `Resume` entries for the
            // same id. The first dispatch already claimed or finished it;
            // drop this stale duplicate rather than double-dispatching it.
            if let ReadyEntry::Resume(id, _) = &ready[i] {
                let id = *id;
                if !self.core.arena.lock().unwrap().contains(id) {
                    ready.remove(i);
                    continue;
                }
            }
            found = Some(i);
            break;
        }
        let picked = found.map(|i| ready.remove(i).unwrap());
        drop(ready);
        if skipped {
            hook.tickle();
        }
        picked
    }

    fn dispatch(&self, entry: ReadyEntry, worker: usize) {
        let (id, hint) = match entry {
            ReadyEntry::Spawn(task, hint) => {
                let coro = Coroutine::new(None, self.core.config.stack_size, task);
                coro.set_thread_hint(hint);
                let id = self.arena_insert(coro);
                self.core.arena.lock().unwrap().slots[id].as_ref().unwrap().set_id(id);
                (id, hint)
            }
            ReadyEntry::Resume(id, hint) => (id, hint),
        };

        let mut coro = self.core.arena.lock().unwrap().take(id);
        log::debug!("worker {} resuming coroutine {}", worker, id);
        coro.resume();

        match coro.state() {
            State::Ready => {
                self.core.arena.lock().unwrap().put_back(id, coro);
                self.readyq_push_resume(id, hint);
            }
            State::Hold => {
                // Parked: whatever caused the hold (a registered fd event,
                // a pending timer, ...) already knows this id and will
                // push a Resume entry once it fires.
                self.core.arena.lock().unwrap().put_back(id, coro);
            }
            State::Term => {
                log::debug!("coroutine {} finished", id);
                drop(coro);
                self.core.arena.lock().unwrap().release(id);
            }
            State::Except => {
                if let Some(payload) = coro.take_panic() {
                    log::warn!("coroutine {} discarded after panic: {}", id, panic_string(&payload));
                }
                drop(coro);
                self.core.arena.lock().unwrap().release(id);
            }
            State::Init | State::Exec => unreachable!("coroutine left resume() in state {:?}", coro.state()),
        }
    }

    /// The idle hook a plain `Scheduler` uses when nothing more specific
    /// (like an `IOManager`'s epoll reactor) is plugged in: a short
    /// condvar-bounded sleep.
    pub fn default_idle_hook() -> Arc<dyn IdleHook> {
        Arc::new(DefaultIdle)
    }
}

fn panic_string(payload: &PanicPayload) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    use super::{Config, Scheduler};

    #[test]
    fn runs_a_single_task_to_completion() {
        let sched = Scheduler::new(2, Config::default());
        let (tx, rx) = channel();
        sched.schedule(move || {
            tx.send(42).unwrap();
        });

        let hook = Scheduler::default_idle_hook();
        let sched_clone = sched.clone();
        let runner = std::thread::spawn(move || sched_clone.run(hook));

        assert_eq!(rx.recv().unwrap(), 42);

        // Give the run loop a moment to drain, then stop it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        sched.stop();
        runner.join().unwrap();
    }

    #[test]
    fn yielding_coroutine_is_resumed_again() {
        let sched = Scheduler::new(1, Config::default());
        let (tx, rx) = channel();
        sched.schedule(move || {
            tx.send(1).unwrap();
            crate::coroutine::Coroutine::yield_ready();
            tx.send(2).unwrap();
        });

        let hook = Scheduler::default_idle_hook();
        let sched_clone = sched.clone();
        let runner = std::thread::spawn(move || sched_clone.run(hook));

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);

        std::thread::sleep(std::time::Duration::from_millis(20));
        sched.stop();
        runner.join().unwrap();
    }

    #[test]
    fn thread_hint_pins_work_to_one_worker() {
        let sched = Scheduler::new(2, Config::default());
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        sched.schedule_pinned(
            move || {
                *seen2.lock().unwrap() = Some(std::thread::current().name().unwrap().to_string());
            },
            1,
        );

        let hook = Scheduler::default_idle_hook();
        let sched_clone = sched.clone();
        let runner = std::thread::spawn(move || sched_clone.run(hook));

        std::thread::sleep(std::time::Duration::from_millis(50));
        sched.stop();
        runner.join().unwrap();

        assert!(seen.lock().unwrap().as_deref().unwrap().ends_with("-1"));
    }
}
