use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_utils::CachePadded;

use crate::arena::BumpArena;
use crate::backoff::Backoff;
use crate::invariants::{
    debug_assert_level_bounded, debug_assert_ring_index, debug_assert_space_bounded,
};
use crate::platform;
use crate::port::{publish, rendezvous, wrap, PortHeader, PortKind};
use crate::table::Channel;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// A default channel is one SPSC ring shared by exactly two workers. The ring
// buffer, the authoritative read index and the producer-written write index
// all live on the consumer side; the producer side carries a shadow of the
// read index so each worker polls availability out of its own endpoint.
//
// ## Modular Indices (one slot empty)
//
// `rp`, `wp` and the peek cursor `pp` are wrapped indices in [0, capacity)
// with capacity = token_num + 1. One slot is always left empty:
// - empty  <=>  rp == wp
// - full   <=>  wrap(wp + 1) == rp
// Indices advance one slot per token; wrap is a single subtraction, never a
// modulo in the hot path.
//
// ## Memory Ordering Protocol
//
// **Producer (write path):**
// 1. Read own `wp` (UnsafeCell, producer is the only writer)
// 2. Load the `rp` shadow with Acquire until the ring is not full
//    (synchronizes with the consumer's Release store after dequeue)
// 3. Copy the token into the consumer's buffer (no ordering needed - the
//    slot is outside [rp, wp), so the consumer does not look at it)
// 4. Store the consumer-side `wp` with Release (publishes the token bytes)
//
// **Consumer (read path):**
// 1. Read own `rp` (UnsafeCell, consumer is the only writer)
// 2. Load `wp` with Acquire until the ring is not empty
//    (synchronizes with the producer's Release store, making the token
//    bytes visible)
// 3. Copy the token out
// 4. Store the producer-side `rp` shadow with Release (frees the slot)
//
// ## Single-Writer Invariants
//
// Every mutable field has exactly one writer for the life of the channel:
// - `DefaultSrc::wp`, `DefaultSrc::dst`, `DefaultSrc::buf`: producer only
// - `DefaultSrc::rp` (shadow): consumer only (atomic)
// - `DefaultDst::rp`, `DefaultDst::pp`, `DefaultDst::src`, `DefaultDst::buf`:
//   consumer only
// - `DefaultDst::wp`: producer only (atomic)
// - buffer slot i: producer while i is outside [rp, wp), consumer inside
//
// The peer-written index on each side sits in its own cache line
// (CachePadded) so shadow updates do not bounce the owner's local fields.
//
// =============================================================================

/// Producer end of a worker-to-worker channel.
///
/// Lives in the producer worker's heap; holds a non-owning pointer to the
/// consumer end and a cached copy of the consumer's buffer base.
#[repr(C)]
pub(crate) struct DefaultSrc {
    pub(crate) header: PortHeader,
    /// Peer consumer endpoint, set once during the connect pass.
    dst: UnsafeCell<*const DefaultDst>,
    /// Cached consumer buffer base, set alongside `dst`.
    buf: UnsafeCell<*mut u8>,
    /// Local write index.
    wp: UnsafeCell<i32>,
    /// Shadow of the consumer's read index, written by the consumer after
    /// every dequeue.
    rp: CachePadded<AtomicI32>,
}

// SAFETY: shared across threads by design. Every field is either immutable
// after the handshake, atomic, or single-writer per the protocol comment
// above.
unsafe impl Sync for DefaultSrc {}

impl DefaultSrc {
    /// Allocate the producer endpoint and publish it into the table.
    pub(crate) fn create(arena: &BumpArena, channel: &Channel) {
        let port = arena.alloc_value(DefaultSrc {
            header: PortHeader::new(PortKind::DefaultSrc, channel.token_size, channel.token_num),
            dst: UnsafeCell::new(ptr::null()),
            buf: UnsafeCell::new(ptr::null_mut()),
            wp: UnsafeCell::new(0),
            rp: CachePadded::new(AtomicI32::new(0)),
        });
        publish(&channel.src.dev, port.cast());
    }

    /// Wait for the consumer endpoint, then cache its address and buffer base.
    pub(crate) fn connect(&self, channel: &Channel) {
        let peer = rendezvous(&channel.dst.dev).cast::<DefaultDst>();
        // SAFETY: dst/buf are producer-local; the acquire in rendezvous makes
        // the consumer's pre-publication initialization (including its buffer
        // pointer) visible.
        unsafe {
            *self.dst.get() = peer.as_ptr();
            *self.buf.get() = *peer.as_ref().buf.get();
        }
    }

    /// Enqueue exactly `count` tokens, blocking on backpressure.
    pub(crate) fn write(&self, buf: &[u8], count: usize) -> usize {
        let tsize = self.header.token_size as usize;
        let cap = self.header.capacity as i32;
        // SAFETY: producer-local fields; this thread is the single producer.
        let dst = unsafe { *self.dst.get() };
        let base = unsafe { *self.buf.get() };
        let mut wp = unsafe { *self.wp.get() };
        debug_assert_ring_index!("wp", wp, cap);

        let mut src_bytes = buf.as_ptr();
        for _ in 0..count {
            let next = wrap(wp + 1, cap);

            // Block until the ring is not full.
            let mut backoff = Backoff::new();
            while self.rp.load(Ordering::Acquire) == next {
                backoff.snooze();
            }

            // SAFETY: slot `wp` is outside [rp, wp), so the consumer will not
            // read it until the Release store below publishes it. The source
            // range is within `buf` (the dispatch layer checked the length).
            unsafe {
                ptr::copy_nonoverlapping(src_bytes, base.add(wp as usize * tsize), tsize);
                src_bytes = src_bytes.add(tsize);
                *self.wp.get() = next;
                // Publish the token: bytes first, then the index.
                (*dst).wp.store(next, Ordering::Release);
            }
            platform::wake(dst);
            wp = next;
        }
        count
    }

    /// Tokens writable without blocking.
    pub(crate) fn space(&self) -> usize {
        let cap = self.header.capacity as i32;
        // SAFETY: wp is producer-local.
        let wp = unsafe { *self.wp.get() };
        let rp = self.rp.load(Ordering::Acquire);
        let space = wrap(cap - 1 + rp - wp, cap);
        debug_assert_space_bounded!(space, self.header.token_num() as i32);
        space as usize
    }

    /// Called by the consumer after each dequeue to free the slot.
    #[inline]
    pub(crate) fn store_rp(&self, rp: i32) {
        self.rp.store(rp, Ordering::Release);
    }
}

/// Consumer end of a worker-to-worker channel.
///
/// Owns the ring buffer; both the buffer and the authoritative indices live
/// in the consumer worker's heap, so the producer pushes into remote memory
/// and the consumer polls locally.
#[repr(C)]
pub(crate) struct DefaultDst {
    pub(crate) header: PortHeader,
    /// Peer producer endpoint, set once during the connect pass.
    src: UnsafeCell<*const DefaultSrc>,
    /// Ring buffer storage (`capacity * token_size` bytes, bump-allocated).
    buf: UnsafeCell<*mut u8>,
    /// Local read index.
    rp: UnsafeCell<i32>,
    /// Peek cursor for non-destructive lookahead; trails `rp` whenever no
    /// peek is in flight.
    pp: UnsafeCell<i32>,
    /// Write index, stored by the producer after every enqueue.
    wp: CachePadded<AtomicI32>,
}

// SAFETY: shared across threads by design; see the protocol comment. The
// producer thread only touches `wp` (atomic) and the buffer slots outside
// [rp, wp).
unsafe impl Sync for DefaultDst {}

impl DefaultDst {
    /// Allocate the consumer endpoint plus its ring buffer and publish it.
    pub(crate) fn create(arena: &BumpArena, channel: &Channel) {
        let buf = arena.alloc(channel.capacity() as usize * channel.token_size as usize);
        let port = arena.alloc_value(DefaultDst {
            header: PortHeader::new(PortKind::DefaultDst, channel.token_size, channel.token_num),
            src: UnsafeCell::new(ptr::null()),
            buf: UnsafeCell::new(buf.as_ptr()),
            rp: UnsafeCell::new(0),
            pp: UnsafeCell::new(0),
            wp: CachePadded::new(AtomicI32::new(0)),
        });
        publish(&channel.dst.dev, port.cast());
    }

    /// Wait for the producer endpoint and record its address.
    pub(crate) fn connect(&self, channel: &Channel) {
        let peer = rendezvous(&channel.src.dev);
        // SAFETY: src is consumer-local.
        unsafe {
            *self.src.get() = peer.cast::<DefaultSrc>().as_ptr();
        }
    }

    /// Dequeue exactly `count` tokens, blocking until each is available.
    pub(crate) fn read(&self, out: &mut [u8], count: usize) -> usize {
        let tsize = self.header.token_size as usize;
        let cap = self.header.capacity as i32;
        // SAFETY: consumer-local fields; this thread is the single consumer.
        let src = unsafe { *self.src.get() };
        let base = unsafe { *self.buf.get() };
        let mut rp = unsafe { *self.rp.get() };
        debug_assert_ring_index!("rp", rp, cap);

        let mut dst_bytes = out.as_mut_ptr();
        for _ in 0..count {
            // Block until a token is ready.
            let mut backoff = Backoff::new();
            while self.wp.load(Ordering::Acquire) == rp {
                backoff.snooze();
            }

            // SAFETY: slot `rp` is inside [rp, wp); the Acquire load above
            // synchronized with the producer's Release store, so the token
            // bytes are visible. The output range is within `out`.
            unsafe {
                ptr::copy_nonoverlapping(base.add(rp as usize * tsize), dst_bytes, tsize);
                dst_bytes = dst_bytes.add(tsize);
            }

            let next = wrap(rp + 1, cap);
            // SAFETY: rp/pp are consumer-local.
            unsafe {
                *self.rp.get() = next;
                *self.pp.get() = next;
            }
            // SAFETY: the producer endpoint was connected during init and is
            // never freed. Free the slot only after the copy above.
            unsafe {
                (*src).store_rp(next);
            }
            platform::wake(src);
            rp = next;
        }
        count
    }

    /// Copy up to `count` tokens without consuming them. Never blocks;
    /// returns the number actually copied. The cursor always rewinds to `rp`
    /// so two successive peeks on a stable ring see the same prefix.
    pub(crate) fn peek(&self, out: &mut [u8], count: usize) -> usize {
        let tsize = self.header.token_size as usize;
        let cap = self.header.capacity as i32;
        // SAFETY: consumer-local fields.
        let base = unsafe { *self.buf.get() };
        let rp = unsafe { *self.rp.get() };
        let mut pp = unsafe { *self.pp.get() };
        let wp = self.wp.load(Ordering::Acquire);
        debug_assert_ring_index!("pp", pp, cap);

        let mut copied = 0;
        let mut dst_bytes = out.as_mut_ptr();
        while copied < count && pp != wp {
            // SAFETY: slot `pp` is inside [rp, wp), published by the Acquire
            // load of wp; the consumer does not free slots during a peek.
            unsafe {
                ptr::copy_nonoverlapping(base.add(pp as usize * tsize), dst_bytes, tsize);
                dst_bytes = dst_bytes.add(tsize);
            }
            pp = wrap(pp + 1, cap);
            copied += 1;
        }

        // SAFETY: pp is consumer-local. Rewind the lookahead.
        unsafe {
            *self.pp.get() = rp;
        }
        copied
    }

    /// Tokens readable without blocking.
    pub(crate) fn level(&self) -> usize {
        let cap = self.header.capacity as i32;
        let wp = self.wp.load(Ordering::Acquire);
        // SAFETY: rp is consumer-local.
        let rp = unsafe { *self.rp.get() };
        let level = wrap(cap + wp - rp, cap);
        debug_assert_level_bounded!(level, self.header.token_num() as i32);
        level as usize
    }
}
