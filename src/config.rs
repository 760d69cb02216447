// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Scheduler configuration.
//!
//! Grounded on mioco's `Config`/`Mioco::new_configured` builder (`lib.rs`), narrowed to the
//! knobs this crate's single-thread-owns-one-scheduler model actually has. None of these
//! change observable semantics, only coarse timing and capacity.

/// Default coroutine stack size.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Upper bound applied to a computed poller wait when the scheduler has no pending timers,
/// so a scheduler idling on I/O alone still wakes up periodically to notice a cross-thread
/// `request_stop()`/`submit()` even if the wake mechanism were ever missed.
const DEFAULT_POLL_TIMEOUT_CAP_MS: u64 = 60_000;

/// Initial capacity hint for the poller's readiness buffer.
const DEFAULT_POLL_CAPACITY_HINT: usize = 256;

/// Scheduler construction options.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) stack_size: usize,
    pub(crate) poll_capacity_hint: usize,
    pub(crate) poll_timeout_cap_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            poll_capacity_hint: DEFAULT_POLL_CAPACITY_HINT,
            poll_timeout_cap_ms: DEFAULT_POLL_TIMEOUT_CAP_MS,
        }
    }
}

impl Config {
    /// Start building a new configuration with default values.
    pub fn new() -> Self {
        Config::default()
    }

    /// Set the default stack size (in bytes) for coroutines spawned on this scheduler.
    ///
    /// Should be a power of two; very small values will overflow and abort the process.
    /// The sane minimum is a couple of pages.
    pub fn set_stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the initial capacity hint for the poller's readiness event buffer.
    pub fn set_poll_capacity_hint(&mut self, hint: usize) -> &mut Self {
        self.poll_capacity_hint = hint;
        self
    }

    /// Set the maximum time, in milliseconds, the run loop will block in the poller when
    /// there are no pending timers.
    pub fn set_poll_timeout_cap_ms(&mut self, ms: u64) -> &mut Self {
        self.poll_timeout_cap_ms = ms;
        self
    }
}
