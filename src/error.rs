//! Error type for the recoverable failure categories described in the
//! crate's error-handling design: system-call failures and out-of-range
//! queries. Programmer errors (double-registering an event, resetting a
//! running coroutine, stopping from the wrong thread) are not part of this
//! enum -- they remain `panic!`/`assert!` at the call site.

use std::io;

use thiserror::Error;

/// Recoverable failures surfaced by the scheduler, timer manager and
/// reactor.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call (`epoll_ctl`, `pipe`, `read`, `write`, ...) failed.
    #[error("system call failed: {0}")]
    Io(#[from] io::Error),

    /// A `Config` value failed validation (e.g. a zero stack size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
