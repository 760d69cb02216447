// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Coroutine contexts: a stack, a saved register state, a boxed user closure, a state
//! machine, and an exclusively-owned CRLS block.
//!
//! Grounded on mioco's `CoroutineSlabHandle`/`CoroutineControl` pair (`thread.rs`,
//! `lib.rs`) for the slab-indexed, `Rc<RefCell<_>>`-shared ownership model and state
//! machine, combined with the `context` crate's stackful-switch idiom as used by `corona`
//! and `coio-rs` in the retrieved pack.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use log::trace;

use crate::crls;
use crate::interrupt::InterruptFlag;
use crate::storage_block::StorageBlock;

/// A coroutine's lifecycle state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum State {
    New = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Finished = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::New,
            1 => State::Ready,
            2 => State::Running,
            3 => State::Blocked,
            _ => State::Finished,
        }
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(s: State) -> Self {
        AtomicState(AtomicU8::new(s as u8))
    }
    fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::SeqCst))
    }
    fn store(&self, s: State) {
        self.0.store(s as u8, Ordering::SeqCst);
    }
}

/// What a coroutine handed control back to the scheduler for.
pub enum Yield {
    /// Cooperative `yield_now()`: re-enqueue at the tail of the ready queue.
    Yielded,
    /// Blocked awaiting an fd and/or a timer; the scheduler registers the requested wait.
    Blocked,
    /// The user closure returned or panicked; `result` holds its outcome.
    Finished,
}

type BoxedPayload = Box<dyn Any + Send + 'static>;

/// The outcome of a coroutine's user closure.
pub enum Outcome {
    Ok(BoxedPayload),
    Panicked(BoxedPayload),
}

/// What a coroutine hands back to the scheduler when it suspends. Boxed and smuggled
/// through the `context` crate's `usize` data slot.
struct Handoff(Yield);

struct Shared {
    state: AtomicState,
    interrupt: InterruptFlag,
    /// Set by the scheduler when delivering an interruption to a currently-blocked
    /// coroutine: causes `check_interruption` to fire immediately on the next resume.
    fire_on_next_suspension: std::sync::atomic::AtomicBool,
}

/// A stackful coroutine context.
///
/// Owned by a scheduler via `Rc`; the `Context` inside is only ever touched by the thread
/// that owns the scheduler, matching the crate's no-cross-thread-migration model.
pub struct Coroutine {
    /// The context to switch *into* to resume this coroutine. `None` only while the
    /// coroutine is actually running (the slot briefly held elsewhere during the switch).
    context: UnsafeCell<Option<Context>>,
    /// Guard-paged stack backing this coroutine. Kept alive for the coroutine's lifetime;
    /// dropped only once the coroutine is FINISHED and its `Rc` count reaches zero.
    _stack: ProtectedFixedSizeStack,
    shared: Rc<Shared>,
    /// This coroutine's own CRLS block, installed as `current_crls` while it runs.
    crls: Box<StorageBlock>,
    closure: UnsafeCell<Option<Box<dyn FnOnce() -> BoxedPayload>>>,
    outcome: UnsafeCell<Option<Outcome>>,
}

pub type RcCoroutine = Rc<Coroutine>;

extern "C" fn trampoline(t: Transfer) -> ! {
    // SAFETY: `t.data` was set by `Coroutine::resume`'s first call to the coroutine's own
    // `*const Coroutine`, which stays alive for at least as long as this stack frame runs.
    let co = unsafe { &*(t.data as *const Coroutine) };

    // Stash the transfer so nested `suspend_to_scheduler` calls can find their way back to
    // the scheduler without threading a `Transfer` through every call site; updated in place
    // by `suspend_to_scheduler` on every subsequent resume.
    CURRENT_TRANSFER.with(|cell| unsafe { *cell.get() = Some(t) });

    let closure = unsafe { (*co.closure.get()).take() }.expect("coroutine entered twice");
    let result = panic::catch_unwind(AssertUnwindSafe(closure));
    let outcome = match result {
        Ok(payload) => Outcome::Ok(payload),
        Err(payload) => Outcome::Panicked(payload),
    };
    unsafe {
        *co.outcome.get() = Some(outcome);
    }
    co.shared.state.store(State::Finished);
    trace!("coroutine {:p} finished", co);

    let final_t = CURRENT_TRANSFER
        .with(|cell| unsafe { (*cell.get()).take() })
        .expect("transfer missing at coroutine exit");
    let handoff = Box::new(Handoff(Yield::Finished));
    let data = Box::into_raw(handoff) as usize;
    // SAFETY: `final_t.context` is the scheduler's resuming context, saved by the matching
    // `context::resume` call.
    unsafe {
        final_t.context.resume(data);
    }
    unreachable!("resumed a finished coroutine");
}

impl Coroutine {
    /// Build a new, not-yet-started coroutine with the given stack size, wrapping `f` so
    /// its return value is boxed as `Any` for uniform storage regardless of the original
    /// return type.
    pub fn new<F, R>(stack_size: usize, f: F) -> RcCoroutine
    where
        F: FnOnce() -> R + 'static,
        R: Send + 'static,
    {
        let stack = ProtectedFixedSizeStack::new(stack_size).expect("coroutine stack allocation");
        let context = Context::new(&stack, trampoline);
        let closure: Box<dyn FnOnce() -> BoxedPayload> =
            Box::new(move || Box::new(f()) as BoxedPayload);

        Rc::new(Coroutine {
            context: UnsafeCell::new(Some(context)),
            _stack: stack,
            shared: Rc::new(Shared {
                state: AtomicState::new(State::New),
                interrupt: InterruptFlag::new(),
                fire_on_next_suspension: std::sync::atomic::AtomicBool::new(false),
            }),
            crls: Box::new(crls::new_block()),
            closure: UnsafeCell::new(Some(closure)),
            outcome: UnsafeCell::new(None),
        })
    }

    pub fn state(&self) -> State {
        self.shared.state.load()
    }

    pub fn set_state(&self, s: State) {
        self.shared.state.store(s);
    }

    pub fn interrupt(&self, kind: crate::error::InterruptKind) {
        trace!("coroutine {:p} interrupted with {:?}", self, kind);
        self.shared.interrupt.interrupt(kind);
        if self.state() == State::Blocked {
            self.shared
                .fire_on_next_suspension
                .store(true, Ordering::SeqCst);
        }
    }

    /// Read and clear this coroutine's pending interruption, honoring a forced
    /// fire-on-resume request left by [`Coroutine::interrupt`] while it was blocked.
    pub fn check_interruption(&self) -> crate::error::Result<()> {
        let forced = self
            .shared
            .fire_on_next_suspension
            .swap(false, Ordering::SeqCst);
        match self.shared.interrupt.check() {
            Some(err) => Err(err),
            None if forced => Err(crate::error::Error::Interrupted(
                crate::error::InterruptKind::Execution,
            )),
            None => Ok(()),
        }
    }

    /// Take this coroutine's finished outcome. Only valid once, after `state() ==
    /// State::Finished`.
    pub fn take_outcome(&self) -> Option<Outcome> {
        unsafe { (*self.outcome.get()).take() }
    }

    /// Resume this coroutine from the scheduler's thread, installing its CRLS block for the
    /// duration of the run and restoring the previous one on return.
    ///
    /// Returns what the coroutine did before handing control back.
    pub fn resume(self: &Rc<Self>) -> Yield {
        debug_assert_eq!(self.state(), State::Ready);
        self.set_state(State::Running);
        trace!("coroutine {:p} resuming", Rc::as_ptr(self));

        let prev_crls = crate::tls::swap_current_crls(self.crls.as_ref() as *const StorageBlock as *mut StorageBlock);
        let _restore = crate::scope_guard::scope_guard(|| {
            crate::tls::swap_current_crls(prev_crls);
        });

        let context = unsafe { (*self.context.get()).take() }.expect("coroutine already running");
        let data = Rc::as_ptr(self) as usize;
        let t = unsafe { context.resume(data) };
        unsafe {
            *self.context.get() = Some(t.context);
        }

        // SAFETY: `t.data` is always a `Box<Handoff>` pointer we (or `trampoline`) produced.
        let handoff = unsafe { Box::from_raw(t.data as *mut Handoff) };
        trace!(
            "coroutine {:p} suspended to scheduler",
            Rc::as_ptr(self)
        );
        handoff.0
    }

    /// Called from inside the running coroutine to hand control back to the scheduler.
    ///
    /// # Safety
    ///
    /// Must only be called from the stack of a coroutine currently executing its own
    /// `resume()` call, i.e. from within the user closure or a suspension-point helper it
    /// calls into.
    pub unsafe fn suspend_to_scheduler(what: Yield) {
        CURRENT_TRANSFER.with(|cell| {
            let t = (*cell.get()).take().expect("suspend outside a coroutine");
            let handoff = Box::new(Handoff(what));
            let data = Box::into_raw(handoff) as usize;
            let back = t.context.resume(data);
            *cell.get() = Some(back);
        });
    }
}

thread_local! {
    /// The `Transfer` received by `trampoline`/a resumed coroutine, stashed here so that
    /// deeply nested suspension-point helpers can call `suspend_to_scheduler` without
    /// threading a `Transfer` through every call site.
    static CURRENT_TRANSFER: UnsafeCell<Option<Transfer>> = UnsafeCell::new(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_to_completion_and_reports_state() {
        let co = Coroutine::new(64 * 1024, || 41 + 1);
        assert_eq!(co.state(), State::New);
        co.set_state(State::Ready);
        match co.resume() {
            Yield::Finished => {}
            _ => panic!("expected immediate completion"),
        }
        assert_eq!(co.state(), State::Finished);
        match co.take_outcome() {
            Some(Outcome::Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 42),
            _ => panic!("expected Ok outcome"),
        }
    }

    #[test]
    fn panics_are_captured_as_outcome() {
        let co = Coroutine::new(64 * 1024, || -> i32 { panic!("boom") });
        co.set_state(State::Ready);
        co.resume();
        match co.take_outcome() {
            Some(Outcome::Panicked(_)) => {}
            _ => panic!("expected Panicked outcome"),
        }
    }

    #[test]
    fn interrupt_is_observed_by_check() {
        let co = Coroutine::new(64 * 1024, || ());
        co.interrupt(crate::error::InterruptKind::User);
        let err = co.check_interruption().unwrap_err();
        assert!(err.is_interrupted());
        co.check_interruption().unwrap();
    }
}
