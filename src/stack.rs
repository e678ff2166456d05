//! Stack allocation and pooling.
//!
//! Guard-paged stacks are expensive to map and unmap, so finished
//! coroutines give their stack back to a per-thread pool instead of
//! freeing it.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

use context::stack::ProtectedFixedSizeStack;

pub struct StackPool {
    stacks: Vec<ProtectedFixedSizeStack>,
}

impl StackPool {
    pub fn new() -> StackPool {
        StackPool { stacks: Vec::new() }
    }

    /// Take a stack of at least `min_size` bytes from the pool, or
    /// allocate a fresh one.
    pub fn take_stack(&mut self, min_size: usize) -> ProtectedFixedSizeStack {
        match self.stacks.iter().position(|s| min_size <= s.len()) {
            Some(idx) => self.stacks.swap_remove(idx),
            None => ProtectedFixedSizeStack::new(min_size)
                .expect("failed to allocate coroutine stack"),
        }
    }

    /// Return a stack to the pool for reuse, subject to the cache cap.
    pub fn give_stack(&mut self, stack: ProtectedFixedSizeStack) {
        if self.stacks.len() < max_cached_stacks() {
            self.stacks.push(stack);
        }
    }
}

impl Default for StackPool {
    fn default() -> StackPool {
        StackPool::new()
    }
}

fn max_cached_stacks() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    match CACHED.load(Ordering::Relaxed) {
        0 => {}
        n => return n - 1,
    }

    let amt = env::var("RUST_MAX_CACHED_STACKS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10usize);

    CACHED.store(amt + 1, Ordering::Relaxed);
    amt
}

#[cfg(test)]
mod tests {
    use super::StackPool;

    #[test]
    fn stack_pool_caches() {
        let mut p = StackPool::new();
        let s = p.take_stack(1024 * 1024);
        p.give_stack(s);
        let s = p.take_stack(4096);
        assert!(s.len() >= 1024 * 1024);
    }
}
