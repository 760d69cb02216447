// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Scheduler-aware I/O primitives.
//!
//! Every primitive in this module follows the same pattern (§4.7): attempt the underlying
//! non-blocking syscall; if it reports would-block, suspend the calling coroutine on
//! [`crate::scheduler::await_fd`] until the fd becomes ready (or a deadline passes); retry.
//! Grounded on mioco's `tcp`/`udp`/`unix` modules (referenced from `lib.rs`, bodies not
//! present in the retrieved pack) and on `lofty/net/tcp.hxx`+`lofty/net/udp.hxx` in
//! `original_source/` for the exact `connection`/`server`/`datagram`/`client` method names.

use std::io;
use std::time::Instant;

use mio::event::Source;
use mio::Token;

use crate::error::Result;
use crate::poller::Direction;
use crate::scheduler;

pub mod pipe;
pub mod tcp;
pub mod udp;

/// Register `source` with the scheduler driving the current coroutine, obtaining a token
/// used for all future `await_fd` calls on it.
pub(crate) fn register<S: Source>(source: &mut S, direction: Direction) -> io::Result<Token> {
    scheduler::with_current_scheduler(|s| s.register(source, direction))
}

/// Change the interest set of an already-registered source.
pub(crate) fn reregister<S: Source>(source: &mut S, token: Token, direction: Direction) -> io::Result<()> {
    scheduler::with_current_scheduler(|s| s.reregister(source, token, direction))
}

/// Deregister a source. Best-effort: called from `Drop` impls, where there is nothing
/// useful to do with an error.
pub(crate) fn deregister<S: Source>(source: &mut S) {
    scheduler::with_current_scheduler(|s| {
        let _ = s.deregister(source);
    });
}

/// Attempt `op` (a non-blocking syscall); on would-block, suspend on `token`/`direction`
/// (optionally bounded by `deadline`) and retry. This is the one pattern every
/// scheduler-aware I/O primitive's read/write/accept/connect/send/receive method is built
/// from.
pub(crate) fn retry_until_ready<T>(
    token: Token,
    direction: Direction,
    deadline: Option<Instant>,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                scheduler::await_fd(token, direction, deadline)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
