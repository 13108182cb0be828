use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::thread;

use commlink_rs::{Channel, ChannelTable, Worker};

const TOKENS: usize = 100_000;
const BATCH: usize = 256;

fn bench_default_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("default_channel");
    group.throughput(Throughput::Elements(TOKENS as u64));

    for token_size in [4u32, 64, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{token_size}B_tokens")),
            &token_size,
            |b, &tsize| {
                b.iter(|| {
                    let table =
                        ChannelTable::new(vec![Channel::between(0, 1, tsize, 1024)]).unwrap();
                    let mut heap0 = vec![0u8; 16 * 1024];
                    let mut heap1 = vec![0u8; 1025 * tsize as usize + 16 * 1024];
                    let (b0, l0) = (heap0.as_mut_ptr() as usize, heap0.len());
                    let (b1, l1) = (heap1.as_mut_ptr() as usize, heap1.len());
                    let table = &table;

                    thread::scope(|s| {
                        s.spawn(move || {
                            // SAFETY: heap ranges outlive the scope.
                            let w = unsafe { Worker::init(table, 0, b0 as *mut u8, l0) };
                            let h = w.write_handle(0);
                            let batch = vec![0x5au8; BATCH * tsize as usize];
                            let mut sent = 0;
                            while sent < TOKENS {
                                let n = BATCH.min(TOKENS - sent);
                                w.write(h, &batch, n);
                                sent += n;
                            }
                        });
                        s.spawn(move || {
                            // SAFETY: as above.
                            let w = unsafe { Worker::init(table, 1, b1 as *mut u8, l1) };
                            let h = w.read_handle(0);
                            let mut batch = vec![0u8; BATCH * tsize as usize];
                            let mut got = 0;
                            while got < TOKENS {
                                let n = BATCH.min(TOKENS - got);
                                w.read(h, &mut batch, n);
                                got += n;
                            }
                        });
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_default_channel);
criterion_main!(benches);
