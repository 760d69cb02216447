// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

use std::net::SocketAddr;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5556";

fn main() {
    env_logger::init();

    let addr: SocketAddr = DEFAULT_LISTEN_ADDR.parse().unwrap();

    std::process::exit(coromio::run_with_scheduler(move || -> std::io::Result<()> {
        let mut server = coromio::udp::Server::bind(&addr)?;
        println!("listening on {}", server.local_addr()?);

        loop {
            let datagram = server.receive()?;
            server.send_to(&datagram.data, &datagram.from)?;
        }
    }));
}
