// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Thread-local storage, and the per-thread bookkeeping that makes coroutine-local storage
//! possible.
//!
//! Each thread owns exactly one TLS [`StorageBlock`] plus a *default* CRLS block used
//! whenever no coroutine is currently running on that thread. When the scheduler resumes a
//! coroutine it swaps `current_crls` to point at that coroutine's own CRLS block for the
//! duration of the resumption, then restores it.

use std::cell::RefCell;
use std::mem::{align_of, size_of};
use std::sync::OnceLock;

use crate::registrar::{Registrar, Slot};
use crate::storage_block::{drop_glue, StorageBlock};

/// The thread-local storage registrar. Independent from [`crate::crls::REGISTRAR`].
pub static REGISTRAR: Registrar = Registrar::new();

struct TlsState {
    block: StorageBlock,
    default_crls: Box<StorageBlock>,
    current_crls: *mut StorageBlock,
}

impl TlsState {
    fn new() -> Self {
        let mut default_crls = Box::new(crate::crls::new_block());
        let current_crls: *mut StorageBlock = &mut *default_crls;
        TlsState {
            block: StorageBlock::new(&REGISTRAR),
            default_crls,
            current_crls,
        }
    }
}

thread_local! {
    static STATE: RefCell<Option<TlsState>> = RefCell::new(None);
}

fn with_state<R>(f: impl FnOnce(&mut TlsState) -> R) -> R {
    STATE.with(|cell| {
        let mut guard = cell.borrow_mut();
        let state = guard.get_or_insert_with(TlsState::new);
        f(state)
    })
}

/// Install `new_block` as this thread's `current_crls` pointer, returning the previous one.
///
/// Used by the scheduler around a coroutine resumption: install the coroutine's own CRLS
/// block before transferring control to it, then restore the previous pointer (the
/// thread's default block, or an outer coroutine's block for nested resumption) afterward.
///
/// # Safety contract
///
/// `new_block` must outlive the period during which it is installed; the scheduler upholds
/// this by keeping the coroutine's CRLS block alive for its entire lifetime.
pub(crate) fn swap_current_crls(new_block: *mut StorageBlock) -> *mut StorageBlock {
    with_state(|state| std::mem::replace(&mut state.current_crls, new_block))
}

/// Run `f` against whichever CRLS block is currently installed on this thread: the active
/// coroutine's own block, or the thread's default block if no coroutine is running.
pub(crate) fn with_current_crls<R>(f: impl FnOnce(&mut StorageBlock) -> R) -> R {
    with_state(|state| {
        // SAFETY: current_crls always points at either `state.default_crls` or a block
        // owned by a live coroutine on this thread, upheld by `swap_current_crls`'s caller.
        let block = unsafe { &mut *state.current_crls };
        f(block)
    })
}

/// A variable with a separate value per thread (the crate's `thread_local_value<T>`).
pub struct ThreadLocal<T: 'static> {
    slot: OnceLock<Slot>,
    init: fn() -> T,
}

impl<T: 'static> ThreadLocal<T> {
    /// Declare a new thread-local variable with the given per-thread initializer.
    pub const fn new(init: fn() -> T) -> Self {
        ThreadLocal {
            slot: OnceLock::new(),
            init,
        }
    }

    fn slot(&self) -> Slot {
        *self.slot.get_or_init(|| {
            let destruct = if std::mem::needs_drop::<T>() {
                Some(drop_glue::<T> as fn(*mut u8))
            } else {
                None
            };
            REGISTRAR.register(size_of::<T>(), align_of::<T>(), None, destruct)
        })
    }

    /// Run `f` with a reference to this thread's value, constructing it on first access.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let slot = self.slot();
        with_state(|state| {
            let value = unsafe { state.block.get_or_init(slot, self.init) };
            f(value)
        })
    }

    /// Run `f` with a mutable reference to this thread's value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot();
        with_state(|state| {
            let value = unsafe { state.block.get_or_init(slot, self.init) };
            f(value)
        })
    }
}

// SAFETY: a `ThreadLocal<T>` only ever touches the calling thread's own TLS block,
// regardless of which thread declares the static, exactly like `std::thread::LocalKey`.
unsafe impl<T: 'static> Sync for ThreadLocal<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn values_are_per_thread() {
        static VAR: ThreadLocal<Cell<i32>> = ThreadLocal::new(|| Cell::new(0));
        VAR.with(|v| v.set(5));
        assert_eq!(VAR.with(|v| v.get()), 5);

        let handle = std::thread::spawn(|| VAR.with(|v| v.get()));
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn default_crls_is_installed_initially() {
        // Exercises the path indirectly: with_current_crls must not panic before any
        // coroutine has ever run on this thread, even with no CRLS variables registered.
        with_current_crls(|_block| {});
    }
}
