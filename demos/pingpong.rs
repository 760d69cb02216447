// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Two coroutines passing bytes over a pipe, one per tick, with a small sleep between each —
//! the seed scenario S1 from the spec's testable-properties section, run as a standalone
//! demo rather than a test.

fn main() {
    env_logger::init();

    std::process::exit(coromio::run_with_scheduler(|| -> std::io::Result<()> {
        let (mut writer, mut reader) = coromio::pipe::pipe()?;

        let writer_done = coromio::spawn(move || -> std::io::Result<()> {
            for byte in 1u8..=9 {
                writer.write(&[byte])?;
                println!("sent {}", byte);
                coromio::sleep_ms(50).ok();
            }
            Ok(())
        });

        let reader_done = coromio::spawn(move || -> std::io::Result<()> {
            let mut buf = [0u8; 1];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                println!("received {}", buf[0]);
            }
            Ok(())
        });

        writer_done.join().ok();
        reader_done.join().ok();
        Ok(())
    }));
}
