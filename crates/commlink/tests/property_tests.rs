//! Property-based tests for the channel protocol invariants:
//! FIFO order, no loss/duplication, the level/space account, and peek
//! idempotence, under randomized token streams, ring geometries and batch
//! splits.

use proptest::prelude::*;
use std::sync::Barrier;
use std::thread;

use commlink_rs::{Channel, ChannelTable, Worker};

const HEAP: usize = 64 * 1024;

fn heaps(workers: usize) -> Vec<Vec<u8>> {
    (0..workers).map(|_| vec![0u8; HEAP]).collect()
}

fn range(heaps: &mut [Vec<u8>], i: usize) -> (usize, usize) {
    (heaps[i].as_mut_ptr() as usize, heaps[i].len())
}

proptest! {
    // Each case spins up real threads; keep the count moderate.
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// FIFO + no loss, no duplication: whatever batch splits the two sides
    /// use, the consumer sees exactly the producer's byte stream, in order.
    #[test]
    fn prop_fifo_no_loss_no_duplication(
        tokens in prop::collection::vec(any::<u32>(), 1..200),
        token_num in 1u32..8,
        write_chunk in 1usize..7,
        read_chunk in 1usize..7,
    ) {
        let table = ChannelTable::new(vec![Channel::between(0, 1, 4, token_num)]).unwrap();
        let mut heaps = heaps(2);
        let (b0, l0) = range(&mut heaps, 0);
        let (b1, l1) = range(&mut heaps, 1);
        let table = &table;
        let total = tokens.len();
        let bytes: Vec<u8> = tokens.iter().flat_map(|v| v.to_le_bytes()).collect();
        let bytes = &bytes;

        let received = thread::scope(|s| {
            s.spawn(move || {
                // SAFETY: heap ranges outlive the scope.
                let w = unsafe { Worker::init(table, 0, b0 as *mut u8, l0) };
                let h = w.write_handle(0);
                let mut sent = 0;
                while sent < total {
                    let n = write_chunk.min(total - sent);
                    w.write(h, &bytes[sent * 4..], n);
                    sent += n;
                }
            });
            let consumer = s.spawn(move || {
                // SAFETY: as above.
                let w = unsafe { Worker::init(table, 1, b1 as *mut u8, l1) };
                let h = w.read_handle(0);
                let mut out = vec![0u8; total * 4];
                let mut got = 0;
                while got < total {
                    let n = read_chunk.min(total - got);
                    w.read(h, &mut out[got * 4..], n);
                    got += n;
                }
                out
            });
            consumer.join().unwrap()
        });

        prop_assert_eq!(&received, bytes);
    }

    /// At a quiescent point with k tokens in flight, the consumer sees
    /// level == k and the producer sees space == token_num - k: the in-flight
    /// count never exceeds the advertised capacity and the account balances.
    #[test]
    fn prop_level_space_account(
        token_num in 1u32..10,
        in_flight in 0u32..10,
    ) {
        let in_flight = in_flight.min(token_num);
        let table = ChannelTable::new(vec![Channel::between(0, 1, 4, token_num)]).unwrap();
        let mut heaps = heaps(2);
        let (b0, l0) = range(&mut heaps, 0);
        let (b1, l1) = range(&mut heaps, 1);
        let table = &table;
        let quiescent = &Barrier::new(2);

        thread::scope(|s| {
            s.spawn(move || {
                // SAFETY: heap ranges outlive the scope.
                let w = unsafe { Worker::init(table, 0, b0 as *mut u8, l0) };
                let h = w.write_handle(0);
                for v in 0..in_flight {
                    w.write(h, &v.to_le_bytes(), 1);
                }
                quiescent.wait();
                assert_eq!(w.space(h), (token_num - in_flight) as usize);
                quiescent.wait(); // hold the quiescent point until both asserted
            });
            s.spawn(move || {
                // SAFETY: as above.
                let w = unsafe { Worker::init(table, 1, b1 as *mut u8, l1) };
                let h = w.read_handle(0);
                quiescent.wait();
                assert_eq!(w.level(h), in_flight as usize);
                quiescent.wait();
                // Drain so nothing is left in flight.
                let mut buf = [0u8; 4];
                for _ in 0..in_flight {
                    w.read(h, &mut buf, 1);
                }
            });
        });
    }

    /// On a stable ring, two successive peeks return the same prefix, a
    /// short peek is a prefix of a long one, and a read returns exactly the
    /// peeked tokens.
    #[test]
    fn prop_peek_idempotent_and_nondestructive(
        token_num in 1u32..8,
        in_flight in 1u32..8,
    ) {
        let in_flight = in_flight.min(token_num);
        let table = ChannelTable::new(vec![Channel::between(0, 1, 4, token_num)]).unwrap();
        let mut heaps = heaps(2);
        let (b0, l0) = range(&mut heaps, 0);
        let (b1, l1) = range(&mut heaps, 1);
        let table = &table;

        thread::scope(|s| {
            s.spawn(move || {
                // SAFETY: heap ranges outlive the scope.
                let w = unsafe { Worker::init(table, 0, b0 as *mut u8, l0) };
                let h = w.write_handle(0);
                for v in 100..100 + in_flight {
                    w.write(h, &v.to_le_bytes(), 1);
                }
            });
            s.spawn(move || {
                // SAFETY: as above.
                let w = unsafe { Worker::init(table, 1, b1 as *mut u8, l1) };
                let h = w.read_handle(0);
                while w.level(h) < in_flight as usize {
                    thread::yield_now();
                }
                let n = in_flight as usize;

                // Ask for more than is buffered: short count, no blocking.
                let mut first = vec![0u8; (n + 4) * 4];
                assert_eq!(w.peek(h, &mut first, n + 4), n);
                let mut second = vec![0u8; (n + 4) * 4];
                assert_eq!(w.peek(h, &mut second, n + 4), n);
                assert_eq!(&first[..n * 4], &second[..n * 4]);

                // A shorter peek sees the same prefix.
                let mut shorter = vec![0u8; n * 4];
                assert_eq!(w.peek(h, &mut shorter, 1), 1);
                assert_eq!(&shorter[..4], &first[..4]);

                // Reading consumes exactly what peek showed.
                let mut consumed = vec![0u8; n * 4];
                assert_eq!(w.read(h, &mut consumed, n), n);
                assert_eq!(&consumed[..], &first[..n * 4]);
            });
        });
    }
}
