// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Per-instance context-local storage block.
//!
//! Shared implementation behind both [`crate::tls`] and [`crate::crls`]: a contiguous byte
//! buffer sized to the registrar's frozen total, plus a constructed-bit per slot. Variables
//! are constructed lazily on first access and destroyed in reverse registration order when
//! the block is dropped.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::registrar::{Registrar, Slot};

/// A raw, correctly-aligned byte block plus a constructed-bit per registered slot.
pub struct StorageBlock {
    registrar: &'static Registrar,
    ptr: NonNull<u8>,
    layout: Layout,
    constructed: Vec<bool>,
    /// True if `ptr` is a dangling placeholder (registrar has zero total size) rather than
    /// a real allocation that must be `dealloc`ed.
    placeholder: bool,
}

// The block just carries bytes; whether it's safe to move across threads is determined by
// the types stored in it, which is the caller's (ContextLocal<T>) responsibility, exactly
// like `std::thread_local!`'s contract.
unsafe impl Send for StorageBlock {}

impl StorageBlock {
    /// Create a new block sized to `registrar`'s current frozen total. Freezes the
    /// registrar if it wasn't already: the cumulative size is fixed on first block creation.
    pub fn new(registrar: &'static Registrar) -> Self {
        let (total, align) = registrar.freeze_and_total();
        let slot_count = registrar.slots().len();
        // Layout requires non-zero size for `alloc`; use a 1-byte placeholder layout when
        // there happen to be no registered variables at all.
        let layout = if total == 0 {
            Layout::from_size_align(1, align.max(1)).unwrap()
        } else {
            Layout::from_size_align(total, align.max(1)).unwrap()
        };
        let placeholder = total == 0;
        let ptr = if placeholder {
            // dangling-but-nonnull/aligned pointer that is never dereferenced, since no
            // slot can have a valid offset into a zero-sized block.
            NonNull::new(align.max(1) as *mut u8).unwrap()
        } else {
            match NonNull::new(unsafe { alloc_zeroed(layout) }) {
                Some(p) => p,
                None => std::alloc::handle_alloc_error(layout),
            }
        };
        StorageBlock {
            registrar,
            ptr,
            layout,
            constructed: vec![false; slot_count],
            placeholder,
        }
    }

    fn slot_ptr(&self, slot: Slot) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(slot.offset) }
    }

    /// Get the value at `slot`, constructing it via `init` if this is the first access in
    /// this block.
    ///
    /// # Safety
    ///
    /// The caller must always pass the same concrete `T` for a given `slot` (this is
    /// upheld by [`crate::tls::ThreadLocal`]/[`crate::crls::CoroutineLocal`], which each own
    /// exactly one `Slot` per variable).
    pub unsafe fn get_or_init<T>(&mut self, slot: Slot, init: impl FnOnce() -> T) -> &mut T {
        debug_assert!(slot.offset + slot.size <= self.layout.size() || self.layout.size() == 1);
        let p = self.slot_ptr(slot) as *mut T;
        if !self.constructed[slot.index] {
            p.write(init());
            self.constructed[slot.index] = true;
        }
        &mut *p
    }

    /// True if the variable at `slot` has been constructed in this block.
    pub fn is_constructed(&self, slot: Slot) -> bool {
        self.constructed[slot.index]
    }
}

/// Bound on destruction retry passes: a destructor may itself construct a different TLS
/// variable, so destruction is retried in full passes until one destructs nothing.
const MAX_DESTRUCTION_PASSES: usize = 16;

impl Drop for StorageBlock {
    fn drop(&mut self) {
        let slots = self.registrar.slots();
        for _ in 0..MAX_DESTRUCTION_PASSES {
            let mut destructed_any = false;
            // Reverse registration order. A full pass is re-scanned from scratch each time
            // so that a destructor which lazily constructs a different, already-passed slot
            // is still caught on the next pass.
            for slot in slots.iter().rev() {
                if self.constructed[slot.index] {
                    destructed_any = true;
                    if let Some(destruct) = slot.destruct {
                        destruct(self.slot_ptr(*slot));
                    }
                    self.constructed[slot.index] = false;
                }
            }
            if !destructed_any {
                break;
            }
        }
        if !self.placeholder {
            unsafe {
                dealloc(self.ptr.as_ptr(), self.layout);
            }
        }
    }
}

/// Type-erased drop glue used as a [`Slot`]'s `destruct` function pointer.
pub fn drop_glue<T>(ptr: *mut u8) {
    unsafe {
        std::ptr::drop_in_place(ptr as *mut T);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::Registrar;

    static REG: Registrar = Registrar::new();

    #[test]
    fn lazy_construct_and_destruct() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let slot = REG.register(
            std::mem::size_of::<Counted>(),
            std::mem::align_of::<Counted>(),
            None,
            Some(drop_glue::<Counted>),
        );

        let mut block = StorageBlock::new(&REG);
        assert!(!block.is_constructed(slot));
        unsafe {
            block.get_or_init(slot, || Counted);
        }
        assert!(block.is_constructed(slot));
        drop(block);
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }
}
