// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! # coromio
//!
//! A stackful-coroutine scheduler with integrated asynchronous file and socket I/O,
//! cooperative interruption, and per-thread/per-coroutine context-local storage.
//!
//! coromio coroutines should not perform native blocking I/O directly. Instead, use the
//! primitives in [`tcp`], [`udp`], and [`pipe`], or fall back to [`scheduler::run_blocking`]
//! for third-party blocking calls that have no async equivalent.
//!
//! # Features
//!
//! ```norust
//! * a per-thread coroutine scheduler (see `Scheduler`);
//! * scheduler-aware TCP/UDP/pipe I/O (see `tcp`, `udp`, `pipe`);
//! * timers and sleeps (see `sleep`, `sleep_ms`);
//! * coroutine exit notification (see `JoinHandle`);
//! * cooperative interruption of a coroutine or a plain thread (see `error::InterruptKind`);
//! * thread-local and coroutine-local storage (see `tls::ThreadLocal`,
//!   `crls::CoroutineLocal`);
//! * a synchronous escape hatch for blocking third-party calls (see
//!   `scheduler::run_blocking`).
//! ```
//!
//! # Example
//!
//! See `demos/tcp_echo.rs` for a TCP echo server.

#![warn(missing_docs)]

pub mod config;
pub mod crls;
pub mod error;
pub mod interrupt;
pub mod io;
pub mod join_handle;
pub mod registrar;
pub mod scheduler;
pub mod scope_guard;
pub mod storage_block;
pub mod timer;
pub mod tls;

mod coroutine;
mod poller;

pub use config::Config;
pub use coroutine::State as CoroutineState;
pub use crls::CoroutineLocal;
pub use error::{Error, InterruptKind, Result};
pub use io::{pipe, tcp, udp};
pub use join_handle::{JoinError, JoinHandle};
pub use poller::Direction;
pub use scheduler::{CoroutineId, Scheduler, SchedulerHandle};
pub use tls::ThreadLocal;

use std::cell::RefCell;
use std::time::{Duration, Instant};

thread_local! {
    /// The coroutine currently running on this thread, if any. Set by
    /// [`scheduler::Scheduler::run`]'s loop around each `resume()` call; read by every
    /// scheduler-aware suspension point to find its own coroutine handle.
    pub(crate) static CURRENT_COROUTINE: RefCell<Option<coroutine::RcCoroutine>> =
        RefCell::new(None);
}

/// True if the calling code is currently running inside a coroutine.
pub fn in_coroutine() -> bool {
    CURRENT_COROUTINE.with(|c| c.borrow().is_some())
}

/// Spawn a new coroutine on the scheduler currently driving the calling coroutine.
///
/// # Panics
///
/// Panics if called outside of a coroutine (there is no "current scheduler" to spawn onto).
/// To start the first coroutine on a thread, use [`run_with_scheduler`] or construct a
/// [`Scheduler`] directly.
pub fn spawn<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + 'static,
    R: Send + 'static,
{
    scheduler::with_current_scheduler(|s| s.spawn(f))
}

/// Re-enqueue the current coroutine at the tail of its scheduler's ready queue, letting
/// other ready coroutines run before it resumes.
pub fn yield_now() -> Result<()> {
    scheduler::yield_now()
}

/// Interrupt another coroutine on the scheduler currently driving the calling coroutine.
/// Equivalent to `JoinHandle::interrupt`, for callers that only have a [`CoroutineId`].
pub fn interrupt(id: CoroutineId, kind: error::InterruptKind) {
    scheduler::interrupt_coroutine(id, kind)
}

/// Suspend the current coroutine for `duration`. A pending interruption still takes
/// priority and is raised instead of completing the sleep.
pub fn sleep(duration: Duration) -> Result<()> {
    scheduler::sleep_until(Instant::now() + duration)
}

/// As [`sleep`], expressed in milliseconds.
pub fn sleep_ms(ms: u64) -> Result<()> {
    sleep(Duration::from_millis(ms))
}

/// Attach a fresh [`Scheduler`] to the calling thread, submit `main_fn` as its first
/// coroutine, and run it to completion.
///
/// Returns an exit code suitable for a process's `main`: `0` if `main_fn` returned `Ok(())`,
/// `1` if it returned `Err`, panicked, or the scheduler itself surfaced an uncaught
/// coroutine error per §7's propagation policy.
pub fn run_with_scheduler<F>(main_fn: F) -> i32
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    let mut scheduler = match Scheduler::new(Config::default()) {
        Ok(s) => s,
        Err(_) => return 1,
    };
    let main_handle = scheduler.spawn(main_fn);
    match scheduler.run() {
        Ok(()) => match main_handle.join() {
            Ok(Ok(())) => 0,
            _ => 1,
        },
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_scheduler_returns_zero_on_clean_exit() {
        assert_eq!(run_with_scheduler(|| Ok(())), 0);
    }

    #[test]
    fn run_with_scheduler_returns_one_on_error() {
        let code = run_with_scheduler(|| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });
        assert_eq!(code, 1);
    }

    #[test]
    fn spawn_runs_nested_coroutine() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        scheduler.spawn(|| {
            let handle = spawn(|| 41 + 1);
            assert_eq!(handle.join().unwrap(), 42);
        });
        scheduler.run().unwrap();
    }

    #[test]
    fn in_coroutine_reflects_context() {
        assert!(!in_coroutine());
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        scheduler.spawn(|| {
            assert!(in_coroutine());
        });
        scheduler.run().unwrap();
    }
}
