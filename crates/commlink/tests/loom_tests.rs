//! Loom-based concurrency tests for the channel index protocol.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores thread interleavings of the core handoff: the
//! producer's Release store of the write index against the consumer's
//! Acquire load (and the symmetric pair on the read index), plus the
//! endpoint-publication rendezvous. The models use the same modular
//! one-slot-empty indices as the real endpoints, with a capacity small
//! enough to keep the state space tractable.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

/// Slot count: token_num = 2 plus the always-empty slot.
const CAP: i32 = 3;

fn wrap(mut n: i32) -> i32 {
    while n >= CAP {
        n -= CAP;
    }
    n
}

/// Minimal model of one default channel: modular indices, buffer and both
/// authoritative indices on the consumer side.
struct LoomRing {
    rp: AtomicI32,
    wp: AtomicI32,
    buf: UnsafeCell<[u32; CAP as usize]>,
}

unsafe impl Send for LoomRing {}
unsafe impl Sync for LoomRing {}

impl LoomRing {
    fn new() -> Self {
        Self {
            rp: AtomicI32::new(0),
            wp: AtomicI32::new(0),
            buf: UnsafeCell::new([0; CAP as usize]),
        }
    }

    /// Producer: enqueue unless full.
    fn push(&self, value: u32) -> bool {
        let wp = self.wp.load(Ordering::Relaxed); // producer owns wp
        let next = wrap(wp + 1);
        if self.rp.load(Ordering::Acquire) == next {
            return false; // full: one slot always stays empty
        }

        // SAFETY: slot `wp` is outside [rp, wp), so the consumer is not
        // looking at it until the Release store below.
        unsafe {
            (*self.buf.get())[wp as usize] = value;
        }
        self.wp.store(next, Ordering::Release);
        true
    }

    /// Consumer: dequeue unless empty.
    fn pop(&self) -> Option<u32> {
        let rp = self.rp.load(Ordering::Relaxed); // consumer owns rp
        if self.wp.load(Ordering::Acquire) == rp {
            return None;
        }

        // SAFETY: slot `rp` was published by the producer's Release store
        // that the Acquire load above synchronized with.
        let value = unsafe { (*self.buf.get())[rp as usize] };
        self.rp.store(wrap(rp + 1), Ordering::Release);
        Some(value)
    }
}

/// FIFO order survives every interleaving of one producer and one consumer.
#[test]
fn loom_spsc_fifo() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let ring2 = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            ring2.push(41);
            ring2.push(42);
        });

        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            for _ in 0..8 {
                if let Some(v) = ring.pop() {
                    received.push(v);
                }
                if received.len() == 2 {
                    break;
                }
                loom::thread::yield_now();
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();

        if !received.is_empty() {
            assert_eq!(received[0], 41);
        }
        if received.len() == 2 {
            assert_eq!(received[1], 42);
        }
    });
}

/// With token_num = 2, the third push fails until a pop frees a slot.
#[test]
fn loom_one_slot_stays_empty() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let ring2 = Arc::clone(&ring);

        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(!ring.push(3));

        let consumer = thread::spawn(move || ring2.pop());
        let value = consumer.join().unwrap();
        assert_eq!(value, Some(1));

        assert!(ring.push(3));
    });
}

/// The endpoint-publication rendezvous: a payload initialized before the
/// Release publish is visible to the peer after its Acquire load.
#[test]
fn loom_publish_rendezvous() {
    loom::model(|| {
        struct Slot {
            published: AtomicUsize,
            payload: UnsafeCell<u32>,
        }
        unsafe impl Send for Slot {}
        unsafe impl Sync for Slot {}

        let slot = Arc::new(Slot {
            published: AtomicUsize::new(0),
            payload: UnsafeCell::new(0),
        });
        let slot2 = Arc::clone(&slot);

        let creator = thread::spawn(move || {
            // Initialize the endpoint, then publish.
            // SAFETY: nobody reads the payload before the Release store.
            unsafe {
                *slot2.payload.get() = 7;
            }
            slot2.published.store(1, Ordering::Release);
        });

        let connector = thread::spawn(move || {
            let mut waited = 0;
            while slot.published.load(Ordering::Acquire) == 0 {
                waited += 1;
                if waited > 16 {
                    return None;
                }
                loom::thread::yield_now();
            }
            // SAFETY: the Acquire load synchronized with the publish.
            Some(unsafe { *slot.payload.get() })
        });

        creator.join().unwrap();
        if let Some(seen) = connector.join().unwrap() {
            assert_eq!(seen, 7);
        }
    });
}
