//! Thin wrapper around the `context` crate's continuation-passing
//! `Context`/`Transfer` API.
//!
//! Hand-rolled per-architecture register save/restore in inline assembly
//! is a well-trodden path for this kind of switch, but it ties the crate
//! to nightly-only features and per-target asm maintenance; the `context`
//! crate already does this portably on stable, so this wrapper just
//! narrows its API to the shape `coroutine.rs` needs.
//!
//! A `CoroutineContext` holds the single point a coroutine is currently
//! suspended at. `resume` jumps into it, handing over `data`, and blocks
//! until the coroutine jumps back (by yielding or finishing); the point it
//! jumps back *from* becomes the new suspended point, replacing the old
//! one -- the "from" side is simply whoever calls `resume`.

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

/// One side of a context switch: the suspended point a coroutine (or the
/// native thread that spawned it) will resume into next.
pub struct CoroutineContext {
    inner: Option<Context>,
}

impl CoroutineContext {
    /// Build a context whose stack is `stack` and whose first resume
    /// enters `entry_fn`.
    pub fn new(stack: &ProtectedFixedSizeStack, entry_fn: extern "C" fn(Transfer) -> !) -> Self {
        CoroutineContext {
            inner: Some(Context::new(stack, entry_fn)),
        }
    }

    /// Jump into this context, handing over `data`. Blocks until the
    /// other side yields or terminates; returns the data it passed back
    /// and updates `self` to the new suspended point.
    ///
    /// # Safety
    /// `data` must encode a pointer the receiving trampoline expects, and
    /// the stack backing this context must outlive the jump.
    pub unsafe fn resume(&mut self, data: usize) -> usize {
        let ctx = self.inner.take().expect("resume of an empty CoroutineContext");
        let Transfer { context, data } = ctx.resume(data);
        self.inner = Some(context);
        data
    }
}

impl std::fmt::Debug for CoroutineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineContext")
            .field("resumable", &self.inner.is_some())
            .finish()
    }
}
