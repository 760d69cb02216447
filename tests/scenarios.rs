// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Integration tests for S2-S5, run against a real single-threaded scheduler. S1 and S6 are
//! covered as unit tests colocated with `scheduler.rs` and `crls.rs` respectively, since they
//! exercise internals not reachable through the public API alone.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use coromio::{tcp, udp, Config, Scheduler};

// S2 - TCP echo. A client coroutine connects to an ephemeral-port server, sends "hello\n",
// and reads until the newline.
#[test]
fn s2_tcp_echo() {
    let mut scheduler = Scheduler::new(Config::new()).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    scheduler.spawn(move || {
        let mut server = tcp::Server::bind(&addr).unwrap();
        let bound = server.local_addr().unwrap();

        let client = coromio::spawn(move || {
            let mut client = tcp::Connection::connect(&bound).unwrap();
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
        client.join().unwrap();
    });

    scheduler.run().unwrap();
}

// S3 - UDP echo. A client sends "ping" and expects it echoed back from the server's address.
#[test]
fn s3_udp_echo() {
    let mut scheduler = Scheduler::new(Config::new()).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    scheduler.spawn(move || {
        let mut server = udp::Server::bind(&addr).unwrap();
        let bound = server.local_addr().unwrap();

        let client = coromio::spawn(move || {
            let mut client = udp::Client::bind_ephemeral(&bound).unwrap();
            client.send(b"ping", &bound).unwrap();
            let reply = client.receive().unwrap();
            assert_eq!(reply.data, b"ping");
            assert_eq!(reply.from, bound);
        });

        let datagram = server.receive().unwrap();
        assert_eq!(datagram.data, b"ping");
        server.send_to(&datagram.data, &datagram.from).unwrap();
        client.join().unwrap();
    });

    scheduler.run().unwrap();
}

// S4 - interruption. Five coroutines each sleep 150ms; #2 and #3 are interrupted shortly
// after submission. #1, #4, #5 should reach FINISHED normally; #2 and #3 should observe the
// interruption at their sleep and finish without completing it.
#[test]
fn s4_interruption() {
    use coromio::InterruptKind;
    use parking_lot::Mutex;
    use std::sync::Arc;

    let mut scheduler = Scheduler::new(Config::new()).unwrap();
    let outcomes: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let outcomes_for_check = outcomes.clone();

    scheduler.spawn(move || {
        let mut handles = Vec::new();
        for i in 1..=5usize {
            let outcomes = outcomes.clone();
            handles.push(coromio::spawn(move || {
                let slept_fully = coromio::sleep_ms(150).is_ok();
                outcomes.lock().push((i, slept_fully));
            }));
        }

        // Let #2 and #3 reach their sleep before interrupting them specifically.
        coromio::yield_now().unwrap();
        handles[1].interrupt(InterruptKind::Execution);
        handles[2].interrupt(InterruptKind::Execution);

        for h in handles {
            h.join().ok();
        }
    });

    let start = Instant::now();
    scheduler.run().unwrap();
    let elapsed = start.elapsed();

    // #2 and #3 finished without waiting out their full 150ms sleep, so overall wall time
    // stays close to a single 150ms sleep rather than growing with the interrupted ones too.
    assert!(
        elapsed < Duration::from_millis(145 * 5),
        "interruption did not shorten the run: {:?}",
        elapsed
    );

    let mut results = outcomes_for_check.lock().clone();
    results.sort_by_key(|&(i, _)| i);
    assert_eq!(
        results,
        vec![(1, true), (2, false), (3, false), (4, true), (5, true)]
    );
}

// S5 - timeout. A coroutine awaits a pipe read with nothing to read and a 100ms deadline.
// Expected: TimedOut raised ~100ms later, and the pipe's descriptor cleanly released
// afterward (a fresh, unrelated pipe still works normally on the same scheduler).
#[test]
fn s5_timeout() {
    let mut scheduler = Scheduler::new(Config::new()).unwrap();

    scheduler.spawn(|| {
        let (_writer, mut reader) = coromio::pipe::pipe().unwrap();
        let start = Instant::now();
        let deadline = Instant::now() + Duration::from_millis(100);
        let mut buf = [0u8; 1];
        let result = reader.read_deadline(&mut buf, Some(deadline));
        let elapsed = start.elapsed();

        assert!(result.unwrap_err().is_timeout());
        assert!(
            elapsed >= Duration::from_millis(90),
            "timed out too early: {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_millis(1000),
            "timed out too late: {:?}",
            elapsed
        );

        drop(reader);

        let (mut w2, mut r2) = coromio::pipe::pipe().unwrap();
        w2.write(b"x").unwrap();
        drop(w2);
        let mut buf2 = [0u8; 1];
        assert_eq!(r2.read(&mut buf2).unwrap(), 1);
        assert_eq!(buf2[0], b'x');
    });

    scheduler.run().unwrap();
}
