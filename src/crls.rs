// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Coroutine-local storage.
//!
//! Implemented identically to TLS, except the block lives inside a coroutine context and is
//! reachable only through `current_crls` (owned by the thread's TLS state, see
//! [`crate::tls`]). A coroutine-local variable performs a two-step lookup: read
//! `current_crls` through TLS, then index into that block.

use std::mem::{align_of, size_of};
use std::sync::OnceLock;

use crate::registrar::{Registrar, Slot};
use crate::storage_block::{drop_glue, StorageBlock};
use crate::tls;

/// The coroutine-local storage registrar. Independent from [`crate::tls::REGISTRAR`]:
/// thread-local and coroutine-local variables do not share indices or offsets.
pub static REGISTRAR: Registrar = Registrar::new();

/// Create a fresh, empty coroutine-local storage block, sized to the registrar's current
/// frozen total. Called once per coroutine context at construction time.
pub fn new_block() -> StorageBlock {
    StorageBlock::new(&REGISTRAR)
}

/// A variable with a separate value per coroutine.
///
/// Must be a `static`. Reading it while no coroutine is active reads and writes the owning
/// thread's default CRLS block instead.
pub struct CoroutineLocal<T: 'static> {
    slot: OnceLock<Slot>,
    init: fn() -> T,
}

impl<T: 'static> CoroutineLocal<T> {
    /// Declare a new coroutine-local variable with the given per-coroutine initializer.
    pub const fn new(init: fn() -> T) -> Self {
        CoroutineLocal {
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

    /// Run `f` with a reference to this coroutine's (or, outside a coroutine, this
    /// thread's default) value, constructing it on first access.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let slot = self.slot();
        tls::with_current_crls(|block| {
            let value = unsafe { block.get_or_init(slot, self.init) };
            f(value)
        })
    }

    /// Run `f` with a mutable reference to this coroutine's value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot();
        tls::with_current_crls(|block| {
            let value = unsafe { block.get_or_init(slot, self.init) };
            f(value)
        })
    }
}

// SAFETY: a `CoroutineLocal<T>` only ever touches the calling thread's `current_crls`
// block, never another thread's memory, regardless of which thread declares the static.
unsafe impl<T: 'static> Sync for CoroutineLocal<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn default_block_used_outside_coroutine() {
        static VAR: CoroutineLocal<Cell<i32>> = CoroutineLocal::new(|| Cell::new(0));
        VAR.with(|v| assert_eq!(v.get(), 0));
        VAR.with(|v| v.set(42));
        VAR.with(|v| assert_eq!(v.get(), 42));
    }

    #[test]
    fn swapping_current_block_isolates_values() {
        static VAR: CoroutineLocal<Cell<i32>> = CoroutineLocal::new(|| Cell::new(-1));

        VAR.with(|v| v.set(7));

        let mut other = new_block();
        let prev = tls::swap_current_crls(&mut other as *mut StorageBlock);
        VAR.with(|v| assert_eq!(v.get(), -1)); // fresh block, fresh default
        VAR.with(|v| v.set(99));

        tls::swap_current_crls(prev);
        VAR.with(|v| assert_eq!(v.get(), 7));
    }

    // S6: a coroutine-local variable set to 7 in coroutine A and 42 in coroutine B, with
    // yields interleaved between the two, reads back correctly in each regardless of
    // scheduling order.
    #[test]
    fn s6_isolated_across_interleaved_coroutines() {
        use crate::config::Config;
        use crate::scheduler::Scheduler;

        static VAR: CoroutineLocal<Cell<i32>> = CoroutineLocal::new(|| Cell::new(0));

        let mut scheduler = Scheduler::new(Config::new()).unwrap();

        scheduler.spawn(|| {
            VAR.with(|v| v.set(7));
            crate::yield_now().unwrap();
            VAR.with(|v| assert_eq!(v.get(), 7));
            crate::yield_now().unwrap();
            VAR.with(|v| assert_eq!(v.get(), 7));
        });

        scheduler.spawn(|| {
            crate::yield_now().unwrap();
            VAR.with(|v| assert_eq!(v.get(), 0)); // fresh default, not A's 7
            VAR.with(|v| v.set(42));
            crate::yield_now().unwrap();
            VAR.with(|v| assert_eq!(v.get(), 42));
        });

        scheduler.run().unwrap();
    }
}
