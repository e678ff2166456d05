//! Stackful coroutines: a (register context, stack) pair that runs a
//! single closure to completion, possibly yielding control back to
//! whoever resumed it many times along the way.
//!
//! State machine:
//!
//! ```text
//! INIT --resume--> EXEC --yield_ready--> READY --resume--> EXEC -> ...
//!                    |--yield_hold--> HOLD --resume--> EXEC -> ...
//!                    |--returns / panics--> TERM / EXCEPT
//! ```
//!
//! Only the coroutine's driver (the scheduler) ever calls `resume`; only
//! the coroutine's own running closure ever calls `yield_ready`/
//! `yield_hold`/`current`. There is no support for one coroutine directly
//! resuming another -- the scheduler is always the one doing the
//! resuming, which keeps the thread-local bookkeeping below a plain
//! save/restore rather than a stack.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::context::CoroutineContext;
use crate::environment::Environment;

/// Lifecycle state of a `Coroutine`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Constructed, never resumed.
    Init,
    /// Currently running (somewhere on the call stack of `resume`).
    Exec,
    /// Yielded cooperatively, ready to be picked up again immediately.
    Ready,
    /// Yielded to wait on an external event (I/O, timer, a lock).
    Hold,
    /// Ran to completion.
    Term,
    /// The closure panicked.
    Except,
}

/// The panic payload captured from an EXCEPT coroutine's closure.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

pub struct Coroutine {
    name: Option<String>,
    state: State,
    ctx: CoroutineContext,
    stack: Option<ProtectedFixedSizeStack>,
    cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    panic: Option<PanicPayload>,
    /// This coroutine's slot in the scheduler's arena, set once by the
    /// scheduler right after the coroutine is first inserted. Lets code
    /// running inside the coroutine (e.g. `io_manager::add_event`) learn
    /// its own id without the scheduler threading it through every call.
    id: Cell<Option<usize>>,
    /// The worker thread this coroutine is pinned to, if it was submitted
    /// via `schedule_pinned`. Remembered here (rather than only on the
    /// ready-queue entry that first spawned it) so that anything which
    /// re-enqueues this coroutine after it parks on I/O or a timer --
    /// long after the original entry is gone -- can still honor the pin.
    thread_hint: Cell<Option<usize>>,
}

struct TrampolineInit {
    coroutine: *mut Coroutine,
}

thread_local! {
    // The currently-executing coroutine on this OS thread, if any.
    static CURRENT: Cell<*mut Coroutine> = Cell::new(std::ptr::null_mut());
    // The continuation to jump back into when the current coroutine yields.
    static PARENT: RefCell<Option<Context>> = RefCell::new(None);
}

impl Coroutine {
    /// Build a suspended coroutine, taking a stack from `pool`.
    pub fn new(
        name: Option<String>,
        stack_size: usize,
        cb: Box<dyn FnOnce() + Send + 'static>,
    ) -> Box<Coroutine> {
        let stack = Environment::current().stack_pool.take_stack(stack_size);
        let ctx = CoroutineContext::new(&stack, trampoline);
        Box::new(Coroutine {
            name,
            state: State::Init,
            ctx,
            stack: Some(stack),
            cb: Some(cb),
            panic: None,
            id: Cell::new(None),
            thread_hint: Cell::new(None),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The scheduler arena id for this coroutine, if one has been
    /// assigned yet (it hasn't, for a coroutine still sitting in a
    /// `ReadyEntry::Spawn` closure).
    pub fn id(&self) -> Option<usize> {
        self.id.get()
    }

    /// Called once by the scheduler right after this coroutine is first
    /// inserted into the arena.
    pub(crate) fn set_id(&self, id: usize) {
        self.id.set(Some(id));
    }

    /// The worker this coroutine is pinned to (`None` means "any worker"),
    /// per the `thread_hint` it was originally scheduled with.
    pub fn thread_hint(&self) -> Option<usize> {
        self.thread_hint.get()
    }

    /// Called once by the scheduler when this coroutine is first spawned.
    pub(crate) fn set_thread_hint(&self, hint: Option<usize>) {
        self.thread_hint.set(hint);
    }

    /// The arena id of the coroutine currently executing on this thread,
    /// or `None` if called outside of a running coroutine.
    pub fn current_id() -> Option<usize> {
        let ptr = CURRENT.with(|c| c.get());
        if ptr.is_null() {
            None
        } else {
            unsafe { &*ptr }.id()
        }
    }

    /// Take the panic payload out of an EXCEPT coroutine, if any.
    pub fn take_panic(&mut self) -> Option<PanicPayload> {
        self.panic.take()
    }

    /// Run this coroutine until it yields or finishes.
    ///
    /// # Panics
    /// Panics if called while the coroutine is already `EXEC`, or has
    /// already reached `TERM`/`EXCEPT` -- resetting a finished coroutine is
    /// the caller's job (build a new one), not this method's.
    pub fn resume(&mut self) {
        assert!(
            matches!(self.state, State::Init | State::Ready | State::Hold),
            "cannot resume coroutine {:?} in state {:?}",
            self.name,
            self.state
        );

        self.state = State::Exec;

        let this_ptr: *mut Coroutine = self;
        let prev_current = CURRENT.with(|c| c.replace(this_ptr));

        // The trampoline only runs once, on the very first resume; every
        // later resume jumps back into `yield_raw` inside the coroutine's
        // own stack, which ignores this payload's identity and just
        // treats it as a wake-up value.
        let payload = if self.stack.is_some() && self.cb.is_some() {
            Box::into_raw(Box::new(TrampolineInit { coroutine: this_ptr })) as usize
        } else {
            0
        };

        unsafe {
            let _ = self.ctx.resume(payload);
        }

        CURRENT.with(|c| c.set(prev_current));
    }

    /// Get a reference to the coroutine currently executing on this
    /// thread.
    ///
    /// # Panics
    /// Panics if called from outside a running coroutine.
    pub fn current() -> &'static mut Coroutine {
        let ptr = CURRENT.with(|c| c.get());
        assert!(!ptr.is_null(), "Coroutine::current() called outside of a coroutine");
        unsafe { &mut *ptr }
    }

    /// Yield back to the caller, marking this coroutine `READY` (will be
    /// resumed again as soon as the scheduler gets back around to it).
    pub fn yield_ready() {
        Self::current().state = State::Ready;
        yield_raw(0);
    }

    /// Yield back to the caller, marking this coroutine `HOLD` (waiting on
    /// some external event; only resumed once something re-readies it).
    pub fn yield_hold() {
        Self::current().state = State::Hold;
        yield_raw(0);
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        debug_assert!(
            matches!(self.state, State::Init | State::Term | State::Except),
            "dropping a coroutine that is still runnable loses its stack silently"
        );
        if let Some(stack) = self.stack.take() {
            Environment::current().stack_pool.give_stack(stack);
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

extern "C" fn trampoline(t: Transfer) -> ! {
    PARENT.with(|p| *p.borrow_mut() = Some(t.context));

    let init = unsafe { Box::from_raw(t.data as *mut TrampolineInit) };
    let coroutine: &mut Coroutine = unsafe { &mut *init.coroutine };

    let cb = coroutine
        .cb
        .take()
        .expect("coroutine trampoline entered without a callback");

    match panic::catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => {
            coroutine.state = State::Term;
        }
        Err(payload) => {
            log::error!(
                "coroutine '{}' panicked: {}",
                coroutine.name.as_deref().unwrap_or("<unnamed>"),
                panic_message(&payload),
            );
            coroutine.panic = Some(payload);
            coroutine.state = State::Except;
        }
    }

    // Never resumed again once TERM/EXCEPT, but if it somehow were, keep
    // handing control straight back rather than running off the stack.
    loop {
        yield_raw(0);
    }
}

fn panic_message(payload: &PanicPayload) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}

fn yield_raw(data: usize) -> usize {
    let parent = PARENT
        .with(|p| p.borrow_mut().take())
        .expect("yield called outside of a running coroutine");
    let Transfer { context, data } = unsafe { parent.resume(data) };
    PARENT.with(|p| *p.borrow_mut() = Some(context));
    data
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::{Coroutine, State};

    #[test]
    fn runs_to_completion() {
        let (tx, rx) = channel();
        let mut coro = Coroutine::new(
            None,
            64 * 1024,
            Box::new(move || {
                tx.send(1).unwrap();
            }),
        );
        coro.resume();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(coro.state(), State::Term);
    }

    #[test]
    fn yields_and_resumes() {
        let (tx, rx) = channel();
        let mut coro = Coroutine::new(
            None,
            64 * 1024,
            Box::new(move || {
                tx.send(1).unwrap();
                Coroutine::yield_ready();
                tx.send(2).unwrap();
            }),
        );

        coro.resume();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(coro.state(), State::Ready);

        coro.resume();
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(coro.state(), State::Term);
    }

    #[test]
    fn panic_becomes_except_state() {
        let mut coro = Coroutine::new(
            None,
            64 * 1024,
            Box::new(|| panic!("blew up inside a coroutine")),
        );
        coro.resume();
        assert_eq!(coro.state(), State::Except);
        assert!(coro.take_panic().is_some());
    }

    #[test]
    fn hold_then_ready_round_trip() {
        let mut coro = Coroutine::new(
            None,
            64 * 1024,
            Box::new(|| {
                Coroutine::yield_hold();
                Coroutine::yield_ready();
            }),
        );
        coro.resume();
        assert_eq!(coro.state(), State::Hold);
        coro.resume();
        assert_eq!(coro.state(), State::Ready);
        coro.resume();
        assert_eq!(coro.state(), State::Term);
    }
}
