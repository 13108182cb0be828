//! Endpoint headers, opaque handles, and the table publication protocol.
//!
//! Every endpoint structure begins (repr(C), offset 0) with a [`PortHeader`]
//! carrying its kind tag and token geometry. The worker API dispatches on the
//! tag; the null-function-pointer traps of the C-style protocol become
//! wrong-variant traps at dispatch time.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::backoff::Backoff;
use crate::table::ChannelTable;

/// Which end of which transport an endpoint implements.
///
/// Producer kinds answer `write`/`space`; consumer kinds answer
/// `read`/`peek`/`level`. Everything else traps INVALID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum PortKind {
    /// Producer end of a worker-to-worker channel.
    DefaultSrc,
    /// Consumer end of a worker-to-worker channel.
    DefaultDst,
    /// Producer end of a worker-to-host channel.
    HostSrc,
    /// Consumer end of a worker-to-host channel.
    HostDst,
}

/// Common endpoint header, first field of every concrete port structure.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct PortHeader {
    pub(crate) kind: PortKind,
    pub(crate) token_size: u32,
    /// Physical slot count: `token_num + 1`, one slot always left empty so
    /// full and empty are distinguishable without a separate counter.
    pub(crate) capacity: u32,
}

impl PortHeader {
    pub(crate) fn new(kind: PortKind, token_size: u32, token_num: u32) -> Self {
        Self {
            kind,
            token_size,
            capacity: token_num + 1,
        }
    }

    #[inline]
    pub(crate) fn token_num(&self) -> u32 {
        self.capacity - 1
    }
}

/// Opaque endpoint handle returned by `Worker::read_handle` / `write_handle`.
///
/// Copyable and cheap; borrows the channel table so it cannot outlive the
/// shared structures it points into. Not `Send`: a handle belongs to the
/// worker thread that created its endpoint.
#[derive(Clone, Copy)]
pub struct Handle<'t> {
    port: NonNull<PortHeader>,
    _table: PhantomData<&'t ChannelTable>,
}

impl<'t> Handle<'t> {
    pub(crate) fn new(port: NonNull<PortHeader>) -> Self {
        Self {
            port,
            _table: PhantomData,
        }
    }

    pub(crate) fn header(&self) -> &PortHeader {
        // SAFETY: handles are only built from published endpoint pointers;
        // endpoints are never freed for the life of the process.
        unsafe { self.port.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> *mut PortHeader {
        self.port.as_ptr()
    }

    /// Bytes per token on this channel.
    pub fn token_size(&self) -> u32 {
        self.header().token_size
    }

    /// Advertised token capacity of this channel.
    pub fn token_num(&self) -> u32 {
        self.header().token_num()
    }
}

/// Wrap a ring index into `[0, capacity)` by subtraction.
///
/// Indices advance one slot at a time, so at most one subtraction runs; the
/// loop form covers the `level`/`space` arithmetic, which can exceed the
/// capacity by one full turn before wrapping.
#[inline]
pub(crate) fn wrap(mut n: i32, capacity: i32) -> i32 {
    while n >= capacity {
        n -= capacity;
    }
    n
}

/// Publish an endpoint into its table slot and wait for the store to drain.
///
/// The release store pairs with the acquire load in [`rendezvous`]; the
/// readback spin forces the publication to become visible before the create
/// pass moves on, so the peer's connect pass cannot miss it.
pub(crate) fn publish(slot: &AtomicPtr<PortHeader>, port: NonNull<PortHeader>) {
    slot.store(port.as_ptr(), Ordering::Release);
    while !std::ptr::eq(slot.load(Ordering::Relaxed), port.as_ptr()) {
        std::hint::spin_loop();
    }
}

/// Spin until the peer's endpoint appears in its table slot.
pub(crate) fn rendezvous(slot: &AtomicPtr<PortHeader>) -> NonNull<PortHeader> {
    let mut backoff = Backoff::new();
    loop {
        if let Some(port) = NonNull::new(slot.load(Ordering::Acquire)) {
            return port;
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_subtracts_at_most_one_turn() {
        assert_eq!(wrap(0, 4), 0);
        assert_eq!(wrap(3, 4), 3);
        assert_eq!(wrap(4, 4), 0);
        assert_eq!(wrap(7, 4), 3);
    }

    #[test]
    fn header_capacity_is_token_num_plus_one() {
        let h = PortHeader::new(PortKind::DefaultSrc, 4, 3);
        assert_eq!(h.capacity, 4);
        assert_eq!(h.token_num(), 3);
    }
}
