// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! The per-thread scheduler: a ready queue, fd-binding table, timer heap and run loop.
//!
//! Grounded on mioco's `thread::Handler`/`FifoSchedulerThread` (`thread.rs`, `lib.rs`), but
//! with the teacher's cross-thread coroutine migration removed: one scheduler owns exactly
//! one OS thread and its coroutines never move off it. Cross-thread interaction (`submit`,
//! `request_stop`, `interrupt(target)`) is staged through a `parking_lot::Mutex` and wakes
//! the scheduler's poller, replacing the teacher's `mio_orig::Sender` channel-based staging
//! (no longer expressible against modern `mio`).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use mio::event::Source;
use mio::Token;
use parking_lot::Mutex;

use crate::config::Config;
use crate::coroutine::{Coroutine, RcCoroutine, State, Yield};
use crate::error::{Error, InterruptKind, Result};
use crate::join_handle::Mailbox;
use crate::poller::{Direction, Poller, PollerWaker, Readiness};
use crate::timer::{TimerHeap, TimerId};

/// Why a coroutine was moved from blocked back onto the ready queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WakeReason {
    /// Cooperative `yield_now()`.
    Yielded,
    /// The fd it was waiting on became ready.
    FdReady,
    /// Its timer fired (either a bare sleep, or the timeout half of `await_fd`).
    TimerFired,
}

thread_local! {
    static CURRENT_WAKE_REASON: std::cell::Cell<WakeReason> =
        std::cell::Cell::new(WakeReason::Yielded);
    static CURRENT_SCHEDULER: RefCell<*mut Scheduler> = RefCell::new(std::ptr::null_mut());
}

/// Run `f` with access to the scheduler driving the currently-executing coroutine.
///
/// # Panics
///
/// Panics if called outside of [`Scheduler::run`] (i.e. not from inside a coroutine, and
/// not from the thread that is actually running a scheduler).
pub(crate) fn with_current_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    CURRENT_SCHEDULER.with(|cell| {
        let ptr = *cell.borrow();
        assert!(!ptr.is_null(), "not running inside a scheduler");
        // SAFETY: the pointer is only ever non-null for the duration of `Scheduler::run`,
        // which holds `&mut self` for that entire stack frame; no other code can be
        // touching the scheduler concurrently since the scheduler's thread is the only
        // thread that ever mutates it.
        f(unsafe { &mut *ptr })
    })
}

struct FdWait {
    coroutine: RcCoroutine,
    timer: Option<TimerId>,
}

enum TimerTarget {
    Sleep(RcCoroutine),
    FdTimeout(Token),
}

struct StagingInner {
    spawns: Vec<Box<dyn FnOnce(&mut Scheduler) + Send>>,
    stop_requested: bool,
}

/// Cross-thread handle to a running scheduler: submit work, request a stop, or wake its
/// poller, all safely from another thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    staging: Arc<Mutex<StagingInner>>,
    waker: PollerWaker,
    alive: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Submit a coroutine-spawning job to run on the owning scheduler's thread.
    pub fn submit(&self, job: impl FnOnce(&mut Scheduler) + Send + 'static) {
        self.staging.lock().spawns.push(Box::new(job));
        let _ = self.waker.wake();
    }

    /// Request that the scheduler interrupt every coroutine it owns and shut down once
    /// they've all reached FINISHED.
    pub fn request_stop(&self) {
        self.staging.lock().stop_requested = true;
        let _ = self.waker.wake();
    }

    /// Number of coroutines currently alive (spawned but not yet FINISHED and dropped).
    pub fn coroutines_alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Request that the coroutine identified by `id` be interrupted, staged through the same
    /// mutex-guarded queue as [`SchedulerHandle::submit`] so it is safe to call from any
    /// thread, not only the one running the scheduler.
    pub fn interrupt(&self, id: CoroutineId, kind: InterruptKind) {
        self.staging
            .lock()
            .spawns
            .push(Box::new(move |s: &mut Scheduler| s.interrupt_one(id, kind)));
        let _ = self.waker.wake();
    }
}

/// A spawned coroutine's stable identity, used to target it for interruption (see
/// [`SchedulerHandle::interrupt`] and [`crate::interrupt`]) without needing to share its
/// (thread-confined) context handle across threads.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CoroutineId(usize);

/// Owns a ready queue, an fd-binding table, a timer heap, and a poller; drives coroutines
/// to completion on the thread that calls [`Scheduler::run`].
pub struct Scheduler {
    ready: VecDeque<(RcCoroutine, WakeReason)>,
    waiting_fd: HashMap<Token, FdWait>,
    timers: TimerHeap,
    timer_targets: HashMap<TimerId, TimerTarget>,
    poller: Poller,
    config: Config,
    next_token: usize,
    staging: Arc<Mutex<StagingInner>>,
    alive: Arc<AtomicUsize>,
    stopping: bool,
    finalizers: HashMap<usize, Box<dyn FnOnce(crate::coroutine::Outcome)>>,
    coroutines: HashMap<usize, RcCoroutine>,
}

impl Scheduler {
    pub fn new(config: Config) -> std::io::Result<Self> {
        Ok(Scheduler {
            ready: VecDeque::new(),
            waiting_fd: HashMap::new(),
            timers: TimerHeap::new(),
            timer_targets: HashMap::new(),
            poller: Poller::new(config.poll_capacity_hint)?,
            next_token: 0,
            staging: Arc::new(Mutex::new(StagingInner {
                spawns: Vec::new(),
                stop_requested: false,
            })),
            alive: Arc::new(AtomicUsize::new(0)),
            stopping: false,
            finalizers: HashMap::new(),
            coroutines: HashMap::new(),
            config,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            staging: self.staging.clone(),
            waker: self.poller.waker(),
            alive: self.alive.clone(),
        }
    }

    /// Allocate a fresh token for an I/O primitive's lifetime, registering `source` for
    /// readiness. The primitive is responsible for calling [`Scheduler::deregister`] (or
    /// simply being dropped through a wrapper that does so) when it goes away.
    pub fn register<S: Source>(&mut self, source: &mut S, direction: Direction) -> std::io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poller.add(source, token, direction)?;
        Ok(token)
    }

    pub fn reregister<S: Source>(&self, source: &mut S, token: Token, direction: Direction) -> std::io::Result<()> {
        self.poller.reregister(source, token, direction)
    }

    pub fn deregister<S: Source>(&self, source: &mut S) -> std::io::Result<()> {
        self.poller.remove(source)
    }

    /// Spawn a new coroutine onto this scheduler's ready queue.
    pub fn spawn<F, R>(&mut self, f: F) -> crate::join_handle::JoinHandle<R>
    where
        F: FnOnce() -> R + 'static,
        R: Send + 'static,
    {
        let mailbox = Arc::new(Mailbox::<R>::new());
        let co = Coroutine::new(self.config.stack_size, f);

        let mailbox_for_finalizer = mailbox.clone();
        let key = Rc::as_ptr(&co) as usize;
        self.finalizers.insert(
            key,
            Box::new(move |outcome| mailbox_for_finalizer.deliver(outcome)),
        );
        self.coroutines.insert(key, co.clone());

        self.alive.fetch_add(1, Ordering::SeqCst);
        co.set_state(State::Ready);
        debug!("scheduler: spawned coroutine {:p}", Rc::as_ptr(&co));
        self.ready.push_back((co, WakeReason::Yielded));
        crate::join_handle::JoinHandle::new(mailbox, CoroutineId(key))
    }

    /// Interrupt the coroutine identified by `id`, if it is still alive, waking it
    /// immediately if it is currently blocked on an fd or a timer.
    fn interrupt_one(&mut self, id: CoroutineId, kind: InterruptKind) {
        let co = match self.coroutines.get(&id.0) {
            Some(co) => co.clone(),
            None => return,
        };
        co.interrupt(kind);
        if co.state() != State::Blocked {
            return;
        }
        if let Some(token) = self
            .waiting_fd
            .iter()
            .find(|(_, w)| Rc::ptr_eq(&w.coroutine, &co))
            .map(|(t, _)| *t)
        {
            if let Some(fd_wait) = self.waiting_fd.remove(&token) {
                if let Some(timer) = fd_wait.timer {
                    self.timers.cancel(timer);
                    self.timer_targets.remove(&timer);
                }
                fd_wait.coroutine.set_state(State::Ready);
                self.ready.push_back((fd_wait.coroutine, WakeReason::Yielded));
            }
            return;
        }
        if let Some(timer_id) = self.timer_targets.iter().find_map(|(tid, target)| match target {
            TimerTarget::Sleep(c) if Rc::ptr_eq(c, &co) => Some(*tid),
            _ => None,
        }) {
            self.timers.cancel(timer_id);
            if let Some(TimerTarget::Sleep(c)) = self.timer_targets.remove(&timer_id) {
                c.set_state(State::Ready);
                self.ready.push_back((c, WakeReason::Yielded));
            }
        }
    }

    fn drain_staging(&mut self) {
        let (spawns, stop) = {
            let mut inner = self.staging.lock();
            (std::mem::take(&mut inner.spawns), inner.stop_requested)
        };
        for job in spawns {
            job(self);
        }
        if stop && !self.stopping {
            debug!("scheduler: stop requested, interrupting all coroutines");
            self.stopping = true;
            self.interrupt_all(InterruptKind::Execution);
        }
    }

    fn interrupt_all(&mut self, kind: InterruptKind) {
        for (co, _) in self.ready.iter() {
            co.interrupt(kind);
        }
        for wait in self.waiting_fd.values() {
            wait.coroutine.interrupt(kind);
        }
        for target in self.timer_targets.values() {
            if let TimerTarget::Sleep(co) = target {
                co.interrupt(kind);
            }
        }

        let mut woken: Vec<(RcCoroutine, WakeReason)> = self
            .waiting_fd
            .drain()
            .map(|(_, w)| {
                w.coroutine.set_state(State::Ready);
                (w.coroutine, WakeReason::Yielded)
            })
            .collect();

        // Bare `sleep_until`s live only in `timer_targets`, never in `waiting_fd` (see
        // `register_sleep`), so they need their own drain here, mirroring the `Sleep`
        // branch of `interrupt_one`.
        let sleeping: Vec<TimerId> = self
            .timer_targets
            .iter()
            .filter_map(|(tid, target)| match target {
                TimerTarget::Sleep(_) => Some(*tid),
                _ => None,
            })
            .collect();
        for tid in sleeping {
            self.timers.cancel(tid);
            if let Some(TimerTarget::Sleep(co)) = self.timer_targets.remove(&tid) {
                co.set_state(State::Ready);
                woken.push((co, WakeReason::Yielded));
            }
        }

        self.ready.extend(woken);
    }

    /// Run coroutines until none remain alive.
    pub fn run(&mut self) -> Result<()> {
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = self as *mut Scheduler);
        let _restore = crate::scope_guard::scope_guard(|| {
            CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = std::ptr::null_mut());
        });

        let mut first_error: Option<Error> = None;
        let mut readiness = Vec::new();

        loop {
            self.drain_staging();

            if let Some((co, reason)) = self.ready.pop_front() {
                CURRENT_WAKE_REASON.with(|c| c.set(reason));
                let prev_current = crate::CURRENT_COROUTINE.with(|c| c.replace(Some(co.clone())));
                let yielded = co.resume();
                crate::CURRENT_COROUTINE.with(|c| *c.borrow_mut() = prev_current);
                match yielded {
                    Yield::Yielded => {
                        co.set_state(State::Ready);
                        self.ready.push_back((co, WakeReason::Yielded));
                    }
                    Yield::Blocked => {
                        co.set_state(State::Blocked);
                        // registration into waiting_fd/timer_targets already performed by
                        // the suspension-point helper before it suspended.
                    }
                    Yield::Finished => {
                        trace!("scheduler: coroutine finished, {} still alive",
                            self.alive.load(Ordering::SeqCst).saturating_sub(1));
                        self.alive.fetch_sub(1, Ordering::SeqCst);
                        if let Some(outcome) = co.take_outcome() {
                            if let crate::coroutine::Outcome::Panicked(_) = &outcome {
                                if first_error.is_none() {
                                    first_error = Some(Error::Io(std::io::Error::new(
                                        std::io::ErrorKind::Other,
                                        "coroutine panicked",
                                    )));
                                }
                            }
                            let key = Rc::as_ptr(&co) as usize;
                            self.coroutines.remove(&key);
                            if let Some(finalize) = self.finalizers.remove(&key) {
                                finalize(outcome);
                            }
                        }
                    }
                }
                continue;
            }

            if self.alive.load(Ordering::SeqCst) == 0 {
                break;
            }

            let now = Instant::now();
            let mut wait = self.timers.next_wait(now);
            let cap = Duration::from_millis(self.config.poll_timeout_cap_ms);
            wait = Some(wait.map_or(cap, |w| w.min(cap)));

            readiness.clear();
            self.poller
                .wait(wait, &mut readiness)
                .map_err(Error::Io)?;

            for r in readiness.drain(..) {
                if let Some(fd_wait) = self.waiting_fd.remove(&r.token) {
                    if let Some(timer) = fd_wait.timer {
                        self.timers.cancel(timer);
                        self.timer_targets.remove(&timer);
                    }
                    fd_wait.coroutine.set_state(State::Ready);
                    self.ready.push_back((fd_wait.coroutine, WakeReason::FdReady));
                }
            }

            for id in self.timers.drain_expired(Instant::now()) {
                if let Some(target) = self.timer_targets.remove(&id) {
                    match target {
                        TimerTarget::Sleep(co) => {
                            co.set_state(State::Ready);
                            self.ready.push_back((co, WakeReason::TimerFired));
                        }
                        TimerTarget::FdTimeout(token) => {
                            if let Some(fd_wait) = self.waiting_fd.remove(&token) {
                                fd_wait.coroutine.set_state(State::Ready);
                                self.ready
                                    .push_back((fd_wait.coroutine, WakeReason::TimerFired));
                            }
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn register_fd_wait(&mut self, token: Token, co: RcCoroutine, deadline: Option<Instant>) {
        let timer = deadline.map(|d| {
            let id = self.timers.insert(d);
            self.timer_targets.insert(id, TimerTarget::FdTimeout(token));
            id
        });
        self.waiting_fd.insert(token, FdWait { coroutine: co, timer });
    }

    fn register_sleep(&mut self, co: RcCoroutine, deadline: Instant) {
        let id = self.timers.insert(deadline);
        self.timer_targets.insert(id, TimerTarget::Sleep(co));
    }
}

/// Run a blocking closure on a scratch OS thread without stalling the scheduler, mirroring
/// mioco's `sync()`. Must be called from inside a coroutine.
///
/// Implemented with a single-byte self-pipe rather than a busy-poll loop: the scratch thread
/// writes one byte once `f` completes, and the calling coroutine suspends on
/// [`crate::scheduler::await_fd`] waiting to read it, so no other coroutine on this
/// scheduler is starved while `f` runs.
///
/// # Panics
///
/// Panics if called outside of a coroutine.
pub fn run_blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    assert!(
        crate::in_coroutine(),
        "run_blocking() called outside of a coroutine"
    );

    let (mut sender, mut receiver) = mio::unix::pipe::new().map_err(Error::Io)?;
    let token = with_current_scheduler(|s| s.register(&mut receiver, Direction::Read))
        .map_err(Error::Io)?;

    let mailbox = Arc::new(crate::join_handle::Mailbox::<R>::new());
    let mailbox_for_thread = mailbox.clone();
    std::thread::spawn(move || {
        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(v) => crate::coroutine::Outcome::Ok(Box::new(v)),
            Err(payload) => crate::coroutine::Outcome::Panicked(payload),
        };
        mailbox_for_thread.deliver(outcome);
        use std::io::Write;
        let _ = sender.write_all(&[0]);
    });

    let mut buf = [0u8; 1];
    let read_result = crate::io::retry_until_ready(token, Direction::Read, None, || {
        use std::io::Read;
        receiver.read(&mut buf)
    });
    with_current_scheduler(|s| s.deregister(&mut receiver));
    read_result?;

    match mailbox.wait() {
        Ok(v) => Ok(v),
        Err(_payload) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "run_blocking closure panicked",
        ))),
    }
}

/// Interrupt the coroutine identified by `id`, which must belong to the scheduler currently
/// driving the calling coroutine.
pub fn interrupt_coroutine(id: CoroutineId, kind: InterruptKind) {
    with_current_scheduler(|s| s.interrupt_one(id, kind));
}

/// Re-enqueue the currently running coroutine at the tail of the ready queue and resume the
/// next one.
pub fn yield_now() -> Result<()> {
    let co = current_coroutine();
    co.check_interruption()?;
    unsafe {
        Coroutine::suspend_to_scheduler(Yield::Yielded);
    }
    co.check_interruption()
}

/// Suspend the current coroutine until `deadline`. Returns `Ok(())` once it elapses;
/// an interruption still takes priority and is raised instead.
pub fn sleep_until(deadline: Instant) -> Result<()> {
    let co = current_coroutine();
    co.check_interruption()?;
    with_current_scheduler(|s| s.register_sleep(co.clone(), deadline));
    unsafe {
        Coroutine::suspend_to_scheduler(Yield::Blocked);
    }
    co.check_interruption()
}

/// Suspend the current coroutine until `token` reports readiness for `direction`, or
/// `deadline` elapses first (raised as [`Error::TimedOut`]).
pub fn await_fd(token: Token, direction: Direction, deadline: Option<Instant>) -> Result<()> {
    let _ = direction;
    let co = current_coroutine();
    co.check_interruption()?;
    with_current_scheduler(|s| s.register_fd_wait(token, co.clone(), deadline));
    unsafe {
        Coroutine::suspend_to_scheduler(Yield::Blocked);
    }
    co.check_interruption()?;
    match CURRENT_WAKE_REASON.with(|c| c.get()) {
        WakeReason::TimerFired => Err(Error::TimedOut),
        WakeReason::FdReady | WakeReason::Yielded => Ok(()),
    }
}

fn current_coroutine() -> RcCoroutine {
    crate::CURRENT_COROUTINE.with(|cell| {
        cell.borrow()
            .clone()
            .expect("scheduler-aware suspension point called outside a coroutine")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1: ping-pong via pipe. Coroutine A writes bytes 1..9 with a 50ms yield between each;
    // coroutine B reads them one at a time and expects 1..9 in order, then EOF.
    #[test]
    fn s1_ping_pong_via_pipe() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_for_reader = received.clone();
        let start = Instant::now();

        scheduler.spawn(move || {
            let (mut w, mut r) = crate::io::pipe::pipe().unwrap();
            let writer = crate::spawn(move || {
                for byte in 1u8..=9 {
                    w.write(&[byte]).unwrap();
                    crate::sleep_ms(50).unwrap();
                }
            });
            let mut buf = [0u8; 1];
            loop {
                let n = r.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                received_for_reader.lock().push(buf[0]);
            }
            writer.join().unwrap();
        });

        scheduler.run().unwrap();

        assert_eq!(*received.lock(), (1u8..=9).collect::<Vec<_>>());
        assert!(
            start.elapsed() >= Duration::from_millis(400),
            "expected ping-pong to take at least 400ms, took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn alive_counter_reaches_zero_after_run() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        let handle = scheduler.handle();
        scheduler.spawn(|| {});
        scheduler.run().unwrap();
        assert_eq!(handle.coroutines_alive(), 0);
    }

    // request_stop() must wake a coroutine blocked in a bare `sleep_until`, not just one
    // blocked on an fd: such a coroutine lives only in `timer_targets`, never `waiting_fd`.
    #[test]
    fn request_stop_interrupts_bare_sleep() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        let handle = scheduler.handle();
        let slept_fully = Arc::new(Mutex::new(None));
        let slept_fully_for_sleeper = slept_fully.clone();

        scheduler.spawn(move || {
            let result = crate::sleep_ms(2_000);
            *slept_fully_for_sleeper.lock() = Some(result.is_ok());
        });
        scheduler.spawn(move || {
            // Let the sleeper register its timer before stopping the scheduler.
            crate::yield_now().unwrap();
            handle.request_stop();
        });

        let start = Instant::now();
        scheduler.run().unwrap();
        let elapsed = start.elapsed();

        assert_eq!(*slept_fully.lock(), Some(false));
        assert!(
            elapsed < Duration::from_millis(500),
            "request_stop() did not wake a bare sleep promptly, took {:?}",
            elapsed
        );
    }
}
