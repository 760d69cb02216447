// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Scheduler-aware UDP server and client.
//!
//! Grounded on mioco's `udp` module (referenced from `lib.rs`'s
//! `#[cfg(not(windows))] pub mod udp;`, body not present in the retrieved pack) and
//! `lofty/net/udp.hxx` in `original_source/` for the `server::receive()`/`client::send()`
//! datagram-oriented naming (as opposed to `tcp`'s byte-stream `Read`/`Write`).

use std::net::SocketAddr;
use std::time::Instant;

use mio::net::UdpSocket;
use mio::Token;

use crate::error::Result;
use crate::io::{deregister, register, retry_until_ready};
use crate::poller::Direction;

/// Largest datagram this crate will read in one [`Server::receive`]/[`Client::receive`]
/// call; larger datagrams are truncated by the kernel per normal UDP semantics.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// A received datagram, paired with the address it came from.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// The datagram's payload.
    pub data: Vec<u8>,
    /// The address that sent it.
    pub from: SocketAddr,
}

/// A bound UDP socket that receives datagrams from arbitrary peers and can reply to them.
pub struct Server {
    socket: UdpSocket,
    token: Token,
}

impl Server {
    /// Bind to `addr`.
    pub fn bind(addr: &SocketAddr) -> Result<Server> {
        let mut socket = UdpSocket::bind(*addr)?;
        let token = register(&mut socket, Direction::Both)?;
        Ok(Server { socket, token })
    }

    /// The address this server is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive a single datagram, suspending the calling coroutine until one arrives.
    pub fn receive(&mut self) -> Result<Datagram> {
        self.receive_deadline(None)
    }

    /// As [`Server::receive`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes with nothing received.
    pub fn receive_deadline(&mut self, deadline: Option<Instant>) -> Result<Datagram> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = retry_until_ready(self.token, Direction::Read, deadline, || {
            self.socket.recv_from(&mut buf)
        })?;
        buf.truncate(n);
        Ok(Datagram { data: buf, from })
    }

    /// Send `buf` as one datagram to `to`, suspending if the socket's send buffer is full.
    pub fn send_to(&mut self, buf: &[u8], to: &SocketAddr) -> Result<usize> {
        self.send_to_deadline(buf, to, None)
    }

    /// As [`Server::send_to`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes first.
    pub fn send_to_deadline(
        &mut self,
        buf: &[u8],
        to: &SocketAddr,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        retry_until_ready(self.token, Direction::Write, deadline, || {
            self.socket.send_to(buf, *to)
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        deregister(&mut self.socket);
    }
}

/// A UDP endpoint bound to an ephemeral local port, used to send datagrams to (and receive
/// replies from) arbitrary peers.
pub struct Client {
    socket: UdpSocket,
    token: Token,
}

impl Client {
    /// Bind to an OS-assigned ephemeral port on the loopback interface's address family
    /// matching `connect_addr`.
    pub fn bind_ephemeral(peer_hint: &SocketAddr) -> Result<Client> {
        let any: SocketAddr = if peer_hint.is_ipv6() {
            "[::1]:0".parse().unwrap()
        } else {
            "127.0.0.1:0".parse().unwrap()
        };
        let mut socket = UdpSocket::bind(any)?;
        let token = register(&mut socket, Direction::Both)?;
        Ok(Client { socket, token })
    }

    /// This endpoint's local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send `buf` as one datagram to `to`.
    pub fn send(&mut self, buf: &[u8], to: &SocketAddr) -> Result<usize> {
        retry_until_ready(self.token, Direction::Write, None, || {
            self.socket.send_to(buf, *to)
        })
    }

    /// Receive a single datagram, suspending until one arrives.
    pub fn receive(&mut self) -> Result<Datagram> {
        self.receive_deadline(None)
    }

    /// As [`Client::receive`], but raises [`crate::error::Error::TimedOut`] if `deadline`
    /// passes with nothing received.
    pub fn receive_deadline(&mut self, deadline: Option<Instant>) -> Result<Datagram> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = retry_until_ready(self.token, Direction::Read, deadline, || {
            self.socket.recv_from(&mut buf)
        })?;
        buf.truncate(n);
        Ok(Datagram { data: buf, from })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        deregister(&mut self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::Scheduler;

    #[test]
    fn echoes_one_datagram() {
        let mut scheduler = Scheduler::new(Config::new()).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        scheduler.spawn(move || {
            let mut server = Server::bind(&addr).unwrap();
            let bound = server.local_addr().unwrap();

            crate::spawn(move || {
                let mut client = Client::bind_ephemeral(&bound).unwrap();
                client.send(b"ping", &bound).unwrap();
                let reply = client.receive().unwrap();
                assert_eq!(reply.data, b"ping");
                assert_eq!(reply.from, bound);
            });

            let datagram = server.receive().unwrap();
            assert_eq!(datagram.data, b"ping");
            server.send_to(&datagram.data, &datagram.from).unwrap();
        });
        scheduler.run().unwrap();
    }
}
