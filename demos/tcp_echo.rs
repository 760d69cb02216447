// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

use std::io::{Read, Write};
use std::net::SocketAddr;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";

fn main() {
    env_logger::init();

    let addr: SocketAddr = DEFAULT_LISTEN_ADDR.parse().unwrap();

    std::process::exit(coromio::run_with_scheduler(move || -> std::io::Result<()> {
        let mut server = coromio::tcp::Server::bind(&addr)?;
        println!("listening on {}", server.local_addr()?);

        loop {
            let mut conn = server.accept()?;
            coromio::spawn(move || -> std::io::Result<()> {
                let mut buf = [0u8; 16 * 1024];
                loop {
                    let n = conn.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    conn.write_all(&buf[..n])?;
                }
                Ok(())
            });
        }
    }));
}
