// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Coroutine exit notification: the one-shot mailbox backing [`JoinHandle`].
//!
//! Grounded on mioco's `CoroutineHandle::exit_notificator()`/`mailbox()` pair (`lib.rs`) and
//! coio-rs's dedicated `join_handle.rs` (`JoinHandleSender`/`JoinHandleReceiver`, built on a
//! `MonoBarrier`); this version backs the OS-thread-blocking path with a `parking_lot`
//! `Mutex`+`Condvar` and the in-coroutine path with a cooperative `yield_now()` poll loop,
//! matching the spec's "block in the coroutine sense if called from a coroutine, in the
//! OS-thread sense otherwise".

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::coroutine::Outcome;
use crate::error::InterruptKind;
use crate::scheduler::CoroutineId;

type PanicPayload = Box<dyn Any + Send + 'static>;

/// A single-slot mailbox a [`JoinHandle`] polls or blocks on to learn a coroutine's outcome.
pub(crate) struct Mailbox<T> {
    slot: Mutex<Option<std::result::Result<T, PanicPayload>>>,
    ready: Condvar,
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        Mailbox {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Deliver a coroutine's finished [`Outcome`], downcasting its boxed return value back
    /// to `T`.
    ///
    /// # Panics
    ///
    /// Panics if the outcome's payload is not a `T` — can only happen if a `JoinHandle<T>`
    /// is paired with the wrong coroutine's mailbox, which this crate never does.
    pub(crate) fn deliver(&self, outcome: Outcome) {
        let result = match outcome {
            Outcome::Ok(payload) => Ok(*payload
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("JoinHandle<T> used with a mismatched coroutine"))),
            Outcome::Panicked(payload) => Err(payload),
        };
        *self.slot.lock() = Some(result);
        self.ready.notify_all();
    }

    fn try_take(&self) -> Option<std::result::Result<T, PanicPayload>> {
        self.slot.lock().take()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Block the calling OS thread until a result is delivered.
    pub(crate) fn wait(&self) -> std::result::Result<T, PanicPayload> {
        let mut guard = self.slot.lock();
        while guard.is_none() {
            self.ready.wait(&mut guard);
        }
        guard.take().unwrap()
    }
}

/// Why [`JoinHandle::join`] failed to produce the spawned coroutine's return value.
pub enum JoinError {
    /// The coroutine's closure panicked; carries the panic payload, as
    /// [`std::thread::Result`] does.
    Panicked(PanicPayload),
    /// `join()` was called from inside a coroutine that was itself interrupted while
    /// waiting.
    Interrupted(crate::error::Error),
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => write!(f, "JoinError::Panicked(..)"),
            JoinError::Interrupted(e) => write!(f, "JoinError::Interrupted({:?})", e),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => write!(f, "joined coroutine panicked"),
            JoinError::Interrupted(e) => write!(f, "join() interrupted: {}", e),
        }
    }
}

impl std::error::Error for JoinError {}

/// A handle to a spawned coroutine's eventual return value.
///
/// Returned by [`crate::spawn`] / [`crate::scheduler::Scheduler::spawn`]. Cloning is not
/// supported (there is exactly one mailbox per spawned coroutine); wrap in an `Rc`/`Arc` if
/// multiple waiters are needed.
pub struct JoinHandle<T> {
    mailbox: Arc<Mailbox<T>>,
    id: CoroutineId,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(mailbox: Arc<Mailbox<T>>, id: CoroutineId) -> Self {
        JoinHandle { mailbox, id }
    }

    /// This handle's coroutine's stable identity, usable with [`crate::interrupt`] or
    /// [`crate::scheduler::SchedulerHandle::interrupt`] to target it specifically.
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    /// Request that the spawned coroutine be interrupted. A no-op if it has already
    /// finished. Must be called from the thread driving its scheduler; for cross-thread use,
    /// go through [`crate::scheduler::SchedulerHandle::interrupt`] instead.
    pub fn interrupt(&self, kind: InterruptKind) {
        crate::scheduler::interrupt_coroutine(self.id, kind);
    }

    /// True if the spawned coroutine has already finished (successfully or by panicking).
    pub fn is_finished(&self) -> bool {
        self.mailbox.is_ready()
    }

    /// Wait for the spawned coroutine to finish and return its result.
    ///
    /// Called from inside a coroutine, this cooperatively yields to the scheduler between
    /// polls rather than blocking the OS thread (which would starve every other coroutine on
    /// the same scheduler). Called from plain OS-thread code, it blocks the thread.
    pub fn join(&self) -> std::result::Result<T, JoinError> {
        if crate::in_coroutine() {
            loop {
                if let Some(result) = self.mailbox.try_take() {
                    return result.map_err(JoinError::Panicked);
                }
                crate::scheduler::yield_now().map_err(JoinError::Interrupted)?;
            }
        } else {
            self.mailbox.wait().map_err(JoinError::Panicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_ok_outcome() {
        let mailbox: Mailbox<i32> = Mailbox::new();
        assert!(!mailbox.is_ready());
        mailbox.deliver(Outcome::Ok(Box::new(42i32)));
        assert!(mailbox.is_ready());
        assert_eq!(mailbox.wait().unwrap(), 42);
    }

    #[test]
    fn delivers_panic_outcome() {
        let mailbox: Mailbox<i32> = Mailbox::new();
        let payload: PanicPayload = Box::new("boom");
        mailbox.deliver(Outcome::Panicked(payload));
        assert!(mailbox.wait().is_err());
    }
}
