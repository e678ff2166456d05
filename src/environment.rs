//! Per-thread coroutine-related state.
//!
//! Every OS thread that ever runs a coroutine gets exactly one
//! `Environment`, lazily created on first use. Today it only needs to hold
//! the stack pool (the current/parent-continuation bookkeeping lives next
//! to the coroutine machinery in `coroutine.rs`, since it's tightly
//! coupled to `trampoline`/`yield_raw`), but it stays its own module
//! because the scheduler and the coroutine machinery both need to reach
//! it, and neither should own the other.

use std::cell::UnsafeCell;

use crate::stack::StackPool;

pub struct Environment {
    pub stack_pool: StackPool,
}

impl Environment {
    fn new() -> Environment {
        Environment {
            stack_pool: StackPool::new(),
        }
    }

    pub fn current() -> &'static mut Environment {
        thread_local! {
            static ENVIRONMENT: UnsafeCell<Environment> = UnsafeCell::new(Environment::new());
        }
        ENVIRONMENT.with(|env| unsafe { &mut *env.get() })
    }
}
