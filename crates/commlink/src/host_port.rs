//! Worker-side endpoints over host-visible shared rings.
//!
//! A host channel's ring (its indices and its token buffer) lives inside
//! the table's shared region so the host loop can drain or fill it without
//! reaching into any worker's memory. The worker keeps local mirrors of its
//! own index for the fast path and reads the peer index through shared
//! memory on every poll: the host is authoritative for its own end and
//! there is no shadow.
//!
//! Worker-side waits on host channels spin without yielding into any idle
//! state. The host has no wake path to a worker, so a sleeping worker could
//! never be signalled; the only safe wait is a poll loop.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::arena::BumpArena;
use crate::invariants::{
    debug_assert_level_bounded, debug_assert_ring_index, debug_assert_space_bounded,
};
use crate::platform::{trap, TrapCode};
use crate::port::{publish, wrap, PortHeader, PortKind};
use crate::table::{Channel, ChannelEnd, ChannelTable};

/// Index pair at the head of a shared ring. Token bytes follow the header,
/// 8-byte aligned.
#[repr(C, align(8))]
pub(crate) struct SharedRing {
    pub(crate) rp: AtomicI32,
    pub(crate) wp: AtomicI32,
}

/// Bytes a shared ring occupies in the region: header plus `capacity` slots.
pub(crate) fn ring_footprint(capacity: u32, token_size: u32) -> usize {
    mem::size_of::<SharedRing>() + capacity as usize * token_size as usize
}

/// Resolve a ring offset inside the region to its header and buffer base.
///
/// # Safety
///
/// `offset` must have been baked into the table by the region layout, so the
/// footprint starting there lies inside the region.
pub(crate) unsafe fn ring_at(base: *mut u8, offset: u32) -> (*const SharedRing, *mut u8) {
    let head = base.add(offset as usize);
    (
        head.cast::<SharedRing>(),
        head.add(mem::size_of::<SharedRing>()),
    )
}

/// Worker-side endpoint of a host channel, either direction.
///
/// Direction is carried by the header kind: `HostSrc` writes into the shared
/// ring for the host to drain, `HostDst` reads what the host fed in.
#[repr(C)]
pub(crate) struct HostPort {
    pub(crate) header: PortHeader,
    /// Local mirror of the read index (reading direction).
    rp: UnsafeCell<i32>,
    /// Peek cursor (reading direction).
    pp: UnsafeCell<i32>,
    /// Local mirror of the write index (writing direction).
    wp: UnsafeCell<i32>,
    /// The shared index pair.
    ring: *const SharedRing,
    /// The shared token buffer.
    buf: *mut u8,
}

impl HostPort {
    /// Create the producer end: this worker writes, the host drains to a
    /// file. Traps TABLE unless the opposite end is the host sentinel.
    pub(crate) fn create_src(
        arena: &BumpArena,
        table: &ChannelTable,
        index: usize,
        channel: &Channel,
    ) {
        if !channel.dst.is_host() {
            trap!(
                TrapCode::Table,
                "host channel {index}: destination is not the host"
            );
        }
        Self::create(arena, table, channel, &channel.dst, &channel.src, PortKind::HostSrc);
    }

    /// Create the consumer end: the host feeds from a file, this worker
    /// reads. Traps TABLE unless the opposite end is the host sentinel.
    pub(crate) fn create_dst(
        arena: &BumpArena,
        table: &ChannelTable,
        index: usize,
        channel: &Channel,
    ) {
        if !channel.src.is_host() {
            trap!(
                TrapCode::Table,
                "host channel {index}: source is not the host"
            );
        }
        Self::create(arena, table, channel, &channel.src, &channel.dst, PortKind::HostDst);
    }

    fn create(
        arena: &BumpArena,
        table: &ChannelTable,
        channel: &Channel,
        host_end: &ChannelEnd,
        own_end: &ChannelEnd,
        kind: PortKind,
    ) {
        // SAFETY: the offset was baked in by the table's region layout.
        let (ring, buf) = unsafe { ring_at(table.region_base(), host_end.shm_off) };
        let port = arena.alloc_value(HostPort {
            header: PortHeader::new(kind, channel.token_size, channel.token_num),
            rp: UnsafeCell::new(0),
            pp: UnsafeCell::new(0),
            wp: UnsafeCell::new(0),
            ring,
            buf,
        });
        publish(&own_end.dev, port.cast());
    }

    // Host-channel endpoints have nothing to connect: the ring location was
    // baked into the table by the host before startup.

    /// Enqueue exactly `count` tokens for the host to drain. Blocks by
    /// polling the shared read index; never idles.
    pub(crate) fn write(&self, buf: &[u8], count: usize) -> usize {
        let tsize = self.header.token_size as usize;
        let cap = self.header.capacity as i32;
        // SAFETY: the ring lives in the table's region for the table's
        // lifetime; wp is worker-local.
        let ring = unsafe { &*self.ring };
        let mut wp = unsafe { *self.wp.get() };
        debug_assert_ring_index!("wp", wp, cap);

        let mut src_bytes = buf.as_ptr();
        for _ in 0..count {
            let next = wrap(wp + 1, cap);

            // The host polls; do not idle, spin.
            while ring.rp.load(Ordering::Acquire) == next {
                std::hint::spin_loop();
            }

            // SAFETY: slot `wp` is free (not full), and the host will not
            // read it until the Release store below publishes it.
            unsafe {
                ptr::copy_nonoverlapping(src_bytes, self.buf.add(wp as usize * tsize), tsize);
                src_bytes = src_bytes.add(tsize);
                *self.wp.get() = next;
            }
            ring.wp.store(next, Ordering::Release);
            wp = next;
        }
        count
    }

    /// Dequeue exactly `count` host-fed tokens. Blocks by polling the shared
    /// write index; never idles.
    pub(crate) fn read(&self, out: &mut [u8], count: usize) -> usize {
        let tsize = self.header.token_size as usize;
        let cap = self.header.capacity as i32;
        // SAFETY: see `write`; rp/pp are worker-local.
        let ring = unsafe { &*self.ring };
        let mut rp = unsafe { *self.rp.get() };
        debug_assert_ring_index!("rp", rp, cap);

        let mut dst_bytes = out.as_mut_ptr();
        for _ in 0..count {
            while ring.wp.load(Ordering::Acquire) == rp {
                std::hint::spin_loop();
            }

            // SAFETY: slot `rp` was published by the host's Release store of
            // wp, which the Acquire load above synchronized with.
            unsafe {
                ptr::copy_nonoverlapping(self.buf.add(rp as usize * tsize), dst_bytes, tsize);
                dst_bytes = dst_bytes.add(tsize);
            }

            let next = wrap(rp + 1, cap);
            // SAFETY: rp/pp are worker-local.
            unsafe {
                *self.rp.get() = next;
                *self.pp.get() = next;
            }
            ring.rp.store(next, Ordering::Release);
            rp = next;
        }
        count
    }

    /// Copy up to `count` tokens without consuming; cursor rewinds to the
    /// read index on every return.
    pub(crate) fn peek(&self, out: &mut [u8], count: usize) -> usize {
        let tsize = self.header.token_size as usize;
        let cap = self.header.capacity as i32;
        // SAFETY: see `read`.
        let ring = unsafe { &*self.ring };
        let rp = unsafe { *self.rp.get() };
        let mut pp = unsafe { *self.pp.get() };
        let wp = ring.wp.load(Ordering::Acquire);
        debug_assert_ring_index!("pp", pp, cap);

        let mut copied = 0;
        let mut dst_bytes = out.as_mut_ptr();
        while copied < count && pp != wp {
            // SAFETY: slot `pp` is inside [rp, wp), published by the Acquire
            // load of wp; slots are not freed during a peek.
            unsafe {
                ptr::copy_nonoverlapping(self.buf.add(pp as usize * tsize), dst_bytes, tsize);
                dst_bytes = dst_bytes.add(tsize);
            }
            pp = wrap(pp + 1, cap);
            copied += 1;
        }

        // SAFETY: pp is worker-local.
        unsafe {
            *self.pp.get() = rp;
        }
        copied
    }

    /// Tokens readable without blocking.
    pub(crate) fn level(&self) -> usize {
        let cap = self.header.capacity as i32;
        // SAFETY: see `read`.
        let ring = unsafe { &*self.ring };
        let wp = ring.wp.load(Ordering::Acquire);
        let rp = unsafe { *self.rp.get() };
        let level = wrap(cap + wp - rp, cap);
        debug_assert_level_bounded!(level, self.header.token_num() as i32);
        level as usize
    }

    /// Tokens writable without blocking.
    pub(crate) fn space(&self) -> usize {
        let cap = self.header.capacity as i32;
        // SAFETY: see `write`.
        let ring = unsafe { &*self.ring };
        let rp = ring.rp.load(Ordering::Acquire);
        let wp = unsafe { *self.wp.get() };
        let space = wrap(cap - 1 + rp - wp, cap);
        debug_assert_space_bounded!(space, self.header.token_num() as i32);
        space as usize
    }
}
