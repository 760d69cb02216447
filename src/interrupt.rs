// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Interruption machinery: an atomic, externally-settable request that a coroutine or
//! thread raises as an error at its next suspension point.
//!
//! Every coroutine context carries one [`InterruptFlag`]; the running thread (when no
//! coroutine is active) carries one too, resident in TLS. An external actor calls
//! [`InterruptFlag::interrupt`] on a target; the target's own suspension points call
//! [`InterruptFlag::check`] both before suspending and after resuming.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, InterruptKind};

const NONE: u8 = 0;
const EXECUTION: u8 = 1;
const USER: u8 = 2;

fn kind_to_tag(kind: InterruptKind) -> u8 {
    match kind {
        InterruptKind::Execution => EXECUTION,
        InterruptKind::User => USER,
    }
}

fn tag_to_kind(tag: u8) -> Option<InterruptKind> {
    match tag {
        EXECUTION => Some(InterruptKind::Execution),
        USER => Some(InterruptKind::User),
        _ => None,
    }
}

/// A single pending-interruption slot: first-wins, cleared on read.
#[derive(Default)]
pub struct InterruptFlag {
    tag: AtomicU8,
}

impl InterruptFlag {
    /// A flag with nothing pending.
    pub const fn new() -> Self {
        InterruptFlag {
            tag: AtomicU8::new(NONE),
        }
    }

    /// Request an interruption of `kind`. First-wins: if a different interruption is
    /// already pending, this call has no effect.
    pub fn interrupt(&self, kind: InterruptKind) {
        let _ = self
            .tag
            .compare_exchange(NONE, kind_to_tag(kind), Ordering::SeqCst, Ordering::SeqCst);
    }

    /// True if an interruption is currently pending, without clearing it.
    pub fn is_pending(&self) -> bool {
        self.tag.load(Ordering::SeqCst) != NONE
    }

    /// Read and clear the pending interruption, if any, returning the corresponding error.
    ///
    /// Called at every suspension point, both before suspending and after resuming.
    pub fn check(&self) -> Option<Error> {
        let tag = self.tag.swap(NONE, Ordering::SeqCst);
        tag_to_kind(tag).map(Error::Interrupted)
    }
}

// Running-thread (non-coroutine) interruption: the same mechanism, for scheduler-aware I/O
// functions invoked outside any coroutine. Kept as a plain `thread_local!`, not a
// registrar-backed context-local variable: the TLS registrar is frozen the moment the first
// coroutine runs on a thread (see `tls::TlsState::new`), and this flag must stay usable by
// `interrupt_thread`/`check_thread_interruption` at any point afterward, just as the original
// `thread_local_storage` keeps its interruption state as a dedicated member rather than a
// registered context-local.
thread_local! {
    static THREAD_INTERRUPT: InterruptFlag = InterruptFlag::new();
}

/// Request an interruption of the calling thread's non-coroutine context.
pub fn interrupt_thread(kind: InterruptKind) {
    THREAD_INTERRUPT.with(|flag| flag.interrupt(kind));
}

/// Check and clear the calling thread's non-coroutine interruption flag.
pub fn check_thread_interruption() -> crate::error::Result<()> {
    match THREAD_INTERRUPT.with(|flag| flag.check()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_wins_and_clears_on_read() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_pending());
        flag.interrupt(InterruptKind::Execution);
        flag.interrupt(InterruptKind::User); // ignored, execution already pending
        assert!(flag.is_pending());
        match flag.check() {
            Some(Error::Interrupted(InterruptKind::Execution)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!flag.is_pending());
        assert!(flag.check().is_none());
    }

    #[test]
    fn double_interrupt_delivers_once() {
        let flag = InterruptFlag::new();
        flag.interrupt(InterruptKind::User);
        flag.interrupt(InterruptKind::User);
        assert!(flag.check().is_some());
        assert!(flag.check().is_none());
    }

    #[test]
    fn thread_interruption_round_trips() {
        check_thread_interruption().unwrap();
        interrupt_thread(InterruptKind::User);
        assert!(check_thread_interruption().unwrap_err().is_interrupted());
        check_thread_interruption().unwrap();
    }
}
