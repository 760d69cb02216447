// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Scheduler-aware TCP server and connection.
//!
//! Grounded on mioco's `tcp` module (referenced from `lib.rs`'s `pub mod tcp;`, body not
//! present in the retrieved pack) and its `examples/echo.rs`
//! (`TcpListener::bind`/`accept`/`read`/`write_all`), plus `lofty/net/tcp.hxx` in
//! `original_source/` for the `server`/`connection` naming and the
//! unbound→listening→closed / open→half-closed→closed state machines (§4.7).

use std::io::{self, Read as _, Write as _};
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use mio::Token;

use crate::error::Result;
use crate::io::{deregister, register, reregister, retry_until_ready};
use crate::poller::Direction;

/// A bound, listening TCP socket. State machine: unbound → (`bind`) → listening →
/// (`accept`, may suspend) → listening, yielding a [`Connection`] per accepted peer; any
/// state → (`close`, i.e. `Drop`) → closed.
pub struct Server {
    listener: TcpListener,
    token: Token,
}

impl Server {
    /// Bind and start listening on `addr`.
    pub fn bind(addr: &SocketAddr) -> Result<Server> {
        let mut listener = TcpListener::bind(*addr)?;
        let token = register(&mut listener, Direction::Read)?;
        Ok(Server { listener, token })
    }

    /// The address this server is actually bound to (useful after binding to an ephemeral
    /// port with `:0`).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next incoming connection, suspending the calling coroutine until one
    /// arrives.
    pub fn accept(&mut self) -> Result<Connection> {
        self.accept_deadline(None)
    }

    /// As [`Server::accept`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes with no incoming connection.
    pub fn accept_deadline(&mut self, deadline: Option<Instant>) -> Result<Connection> {
        let (stream, peer) = retry_until_ready(self.token, Direction::Read, deadline, || {
            self.listener.accept()
        })?;
        Connection::from_stream(stream, peer)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        deregister(&mut self.listener);
    }
}

/// A connected TCP socket with cached local/remote endpoint info, exposing a buffered
/// `Read`/`Write` byte stream. State machine: open → (read/write, may suspend) → open, or
/// half-closed once the peer closes its read or write half; any state → (`close`, i.e.
/// `Drop`) → closed.
pub struct Connection {
    stream: TcpStream,
    token: Token,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Connection {
    fn from_stream(mut stream: TcpStream, peer: SocketAddr) -> Result<Connection> {
        let token = register(&mut stream, Direction::Both)?;
        let local = stream.local_addr()?;
        Ok(Connection {
            stream,
            token,
            local,
            peer,
        })
    }

    /// Connect to `addr`, suspending until the connection completes or fails.
    pub fn connect(addr: &SocketAddr) -> Result<Connection> {
        let mut stream = TcpStream::connect(*addr)?;
        let token = register(&mut stream, Direction::Write)?;
        crate::scheduler::await_fd(token, Direction::Write, None)?;
        if let Some(e) = stream.take_error()? {
            deregister(&mut stream);
            return Err(e.into());
        }
        reregister(&mut stream, token, Direction::Both)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        Ok(Connection {
            stream,
            token,
            local,
            peer,
        })
    }

    /// This end's local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Read into `buf`, suspending until at least one byte is available or EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_deadline(buf, None)
    }

    /// As [`Connection::read`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes first.
    pub fn read_deadline(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        retry_until_ready(self.token, Direction::Read, deadline, || self.stream.read(buf))
    }

    /// Write `buf`, suspending as needed until it is accepted by the kernel's send buffer.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_deadline(buf, None)
    }

    /// As [`Connection::write`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes first.
    pub fn write_deadline(&mut self, buf: &[u8], deadline: Option<Instant>) -> Result<usize> {
        retry_until_ready(self.token, Direction::Write, deadline, || {
            self.stream.write(buf)
        })
    }

    /// TCP has no user-space write buffering in this implementation; always a no-op.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    /// Half-close this connection's write side: the peer observes EOF on its next read,
    /// while this side can still read.
    pub fn shutdown_write(&mut self) -> Result<()> {
        self.stream.shutdown(Shutdown::Write)?;
        Ok(())
    }
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Connection::write(self, buf).map_err(Into::into)
    }
    fn flush(&mut self) -> io::Result<()> {
        Connection::flush(self).map_err(Into::into)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        deregister(&mut self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::Scheduler;
    use std::io::{Read, Write};

    #[test]
    fn echoes_one_line() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        scheduler.spawn(move || {
            let mut server = Server::bind(&addr).unwrap();
            let bound = server.local_addr().unwrap();

            crate::spawn(move || {
                let mut client = Connection::connect(&bound).unwrap();
                client.write_all(b"hello\n").unwrap();
                let mut buf = [0u8; 64];
                let mut total = 0;
                loop {
                    let n = client.read(&mut buf[total..]).unwrap();
                    total += n;
                    if buf[..total].contains(&b'\n') || n == 0 {
                        break;
                    }
                }
                assert_eq!(&buf[..total], b"hello\n");
            });

            let mut conn = server.accept().unwrap();
            let mut buf = [0u8; 64];
            let mut total = 0;
            loop {
                let n = conn.read(&mut buf[total..]).unwrap();
                total += n;
                if buf[..total].contains(&b'\n') {
                    break;
                }
            }
            conn.write_all(&buf[..total]).unwrap();
        });
        scheduler.run().unwrap();
    }
}
