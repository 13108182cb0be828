//! Host-fed worker pipeline.
//!
//! The host feeds tokens from a file into worker 0; workers 0..=3 form a
//! chain over default channels, each stage incrementing the token; worker 3
//! streams results back to the host, which drains them to an output file.
//! The host loop ticks until the tail worker raises the completion flag,
//! then performs a final drain, following the shape of the original manycore
//! demo's host application.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use commlink_rs::{Channel, ChannelTable, HostError, HostIo, Worker};

const TOKENS: u32 = 256;
const WORKERS: i32 = 4;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let input = "pipeline-input.bin";
    let output = "pipeline-output.bin";
    let bytes: Vec<u8> = (0..TOKENS).flat_map(u32::to_le_bytes).collect();
    fs::write(input, &bytes)?;

    // Channel i feeds worker i; channel WORKERS drains the tail.
    let mut channels = vec![Channel::host_input(input, 0, 4, 8)];
    for w in 0..WORKERS - 1 {
        channels.push(Channel::between(w, w + 1, 4, 2));
    }
    channels.push(Channel::host_output(WORKERS - 1, output, 4, 8));
    let table = ChannelTable::new(channels)?;

    let mut host = HostIo::init(&table)?;
    host.handle(&table)?; // initial fill before the workers start

    let mut heaps: Vec<Vec<u8>> = (0..WORKERS).map(|_| vec![0u8; 64 * 1024]).collect();
    let ranges: Vec<(usize, usize)> = heaps
        .iter_mut()
        .map(|h| (h.as_mut_ptr() as usize, h.len()))
        .collect();

    let done = AtomicBool::new(false);
    let done = &done;
    let table_ref = &table;

    thread::scope(|s| -> Result<(), HostError> {
        for w in 0..WORKERS {
            let (base, len) = ranges[w as usize];
            s.spawn(move || {
                // SAFETY: the heap ranges outlive the scope that joins every
                // worker; one init per worker id.
                let worker = unsafe { Worker::init(table_ref, w, base as *mut u8, len) };
                let rh = worker.read_handle(w as usize);
                let wh = worker.write_handle(w as usize + 1);
                let mut buf = [0u8; 4];
                for _ in 0..TOKENS {
                    worker.read(rh, &mut buf, 1);
                    let v = u32::from_le_bytes(buf) + 1;
                    worker.write(wh, &v.to_le_bytes(), 1);
                }
                if w == WORKERS - 1 {
                    done.store(true, Ordering::Release);
                }
            });
        }

        // Host loop: drain and refill until the tail finishes, then one
        // final drain for whatever is still buffered.
        while !done.load(Ordering::Acquire) {
            host.handle(table_ref)?;
            thread::sleep(Duration::from_millis(1));
        }
        host.handle(table_ref)?;
        Ok(())
    })?;

    print!("{}", host.dump(&table));
    println!(
        "moved {} tokens in, {} tokens out",
        host.count(0),
        host.count(WORKERS as usize)
    );

    let result = fs::read(output)?;
    let ok = result
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .enumerate()
        .all(|(i, v)| v == i as u32 + WORKERS as u32);
    println!(
        "pipeline output: {} tokens, each incremented {} times: {}",
        result.len() / 4,
        WORKERS,
        if ok { "ok" } else { "MISMATCH" }
    );

    fs::remove_file(input)?;
    fs::remove_file(output)?;
    Ok(())
}
