// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! A scheduler-aware byte-stream pipe.
//!
//! Grounded on mioco's `unix` module (`lib.rs`'s `pub mod unix;`, body not present in the
//! retrieved pack) and `lofty`'s file-descriptor-backed I/O objects in `original_source/`;
//! built on `mio::unix::pipe`, which already exposes a non-blocking `Sender`/`Receiver`
//! pair, so no raw `libc::pipe2` plumbing is needed here.

use std::io::{self, Read as _, Write as _};
use std::time::Instant;

use mio::unix::pipe::{Receiver, Sender};
use mio::Token;

use crate::error::Result;
use crate::io::{deregister, register, retry_until_ready};
use crate::poller::Direction;

/// The write half of a pipe.
pub struct Writer {
    inner: Sender,
    token: Token,
}

/// The read half of a pipe.
pub struct Reader {
    inner: Receiver,
    token: Token,
}

/// Create a new connected pipe: bytes written to the returned [`Writer`] are readable, in
/// order, from the returned [`Reader`]; dropping the `Writer` causes the `Reader` to observe
/// EOF.
pub fn pipe() -> Result<(Writer, Reader)> {
    let (mut sender, mut receiver) = mio::unix::pipe::new()?;
    let write_token = register(&mut sender, Direction::Write)?;
    let read_token = register(&mut receiver, Direction::Read)?;
    Ok((
        Writer {
            inner: sender,
            token: write_token,
        },
        Reader {
            inner: receiver,
            token: read_token,
        },
    ))
}

impl Writer {
    /// Write `buf`, suspending the calling coroutine if the pipe's buffer is full.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_deadline(buf, None)
    }

    /// As [`Writer::write`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes first.
    pub fn write_deadline(&mut self, buf: &[u8], deadline: Option<Instant>) -> Result<usize> {
        retry_until_ready(self.token, Direction::Write, deadline, || {
            self.inner.write(buf)
        })
    }

    /// No-op: a pipe has no internal buffering beyond the kernel's.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf).map_err(Into::into)
    }
    fn flush(&mut self) -> io::Result<()> {
        Writer::flush(self).map_err(Into::into)
    }
}

impl Reader {
    /// Read into `buf`, suspending the calling coroutine until at least one byte is
    /// available or EOF is reached.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_deadline(buf, None)
    }

    /// As [`Reader::read`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes first.
    pub fn read_deadline(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        retry_until_ready(self.token, Direction::Read, deadline, || self.inner.read(buf))
    }
}

impl io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(self, buf).map_err(Into::into)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        deregister(&mut self.inner);
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        deregister(&mut self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::Scheduler;

    #[test]
    fn write_then_read_round_trips() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        scheduler.spawn(|| {
            let (mut w, mut r) = pipe().unwrap();
            w.write(b"hello").unwrap();
            drop(w);
            let mut buf = [0u8; 16];
            let mut total = 0;
            loop {
                let n = r.read(&mut buf[total..]).unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            assert_eq!(&buf[..total], b"hello");
        });
        scheduler.run().unwrap();
    }
}
