//! Per-worker context: discovery handshake and the channel API.
//!
//! Every worker calls [`Worker::init`] with the same shared table, its own
//! worker id and a private heap range. Init runs two passes over the table:
//!
//! 1. **create**: allocate and publish every endpoint this worker owns;
//! 2. **connect**: spin until each peer endpoint appears, then cache it.
//!
//! Publication order makes the rendezvous safe: an endpoint is fully
//! initialized before its pointer is release-stored into the table, and the
//! connect pass acquire-loads the pointer before dereferencing. After init
//! returns on every worker, all channels this worker touches are wired.

use std::ptr::NonNull;

use crate::arena::BumpArena;
use crate::default_port::{DefaultDst, DefaultSrc};
use crate::host_port::HostPort;
use crate::platform;
use crate::platform::{trap, TrapCode};
use crate::port::{Handle, PortHeader, PortKind};
use crate::table::{ChannelTable, ChannelType, NUM_CHANNELS};

/// A worker's view of the communication runtime.
///
/// Holds the worker-local state the protocol needs: the shared table, the
/// worker's own id, and the bump arena its endpoints were carved from. Not
/// `Send`: a worker context belongs to the execution context that created
/// it.
pub struct Worker<'t> {
    table: &'t ChannelTable,
    id: i32,
    /// Backing storage for this worker's endpoints and ring buffers.
    arena: BumpArena,
}

impl<'t> Worker<'t> {
    /// Build this worker's endpoints and rendezvous with every peer.
    ///
    /// Blocks until each channel this worker owns an end of has its other
    /// end published by the peer worker. Traps TABLE on a malformed entry,
    /// OOM if the heap is too small.
    ///
    /// # Safety
    ///
    /// `heap_base..heap_base + heap_size` must be valid, writable, and not
    /// aliased by any live reference. Endpoints and ring buffers are placed
    /// inside it and are handed to peer workers by pointer, so the range
    /// (like the table itself) must stay valid until every worker communicating
    /// over this worker's channels has finished. One `init` per worker id
    /// per table.
    pub unsafe fn init(
        table: &'t ChannelTable,
        id: i32,
        heap_base: *mut u8,
        heap_size: usize,
    ) -> Self {
        if id < 0 {
            trap!(TrapCode::Table, "worker id {id} is not a valid core");
        }
        let arena = BumpArena::new(platform::global_address(heap_base), heap_size);
        let worker = Self { table, id, arena };

        // Pass 1: create and publish local endpoints.
        for index in 0..NUM_CHANNELS {
            let channel = table.entry(index);
            if channel.src.core() == id {
                match channel.ty {
                    ChannelType::Invalid => {}
                    ChannelType::Default => {
                        if channel.dst.core() == id {
                            trap!(
                                TrapCode::Table,
                                "channel {index}: worker {id} is both ends"
                            );
                        }
                        DefaultSrc::create(&worker.arena, channel);
                    }
                    ChannelType::Host => {
                        HostPort::create_src(&worker.arena, table, index, channel);
                    }
                }
            }
            if channel.dst.core() == id {
                match channel.ty {
                    ChannelType::Invalid => {}
                    ChannelType::Default => DefaultDst::create(&worker.arena, channel),
                    ChannelType::Host => {
                        HostPort::create_dst(&worker.arena, table, index, channel);
                    }
                }
            }
        }

        // Pass 2: connect to the peers' endpoints. Host channels have
        // nothing to connect; their ring location was baked into the table.
        for index in 0..NUM_CHANNELS {
            let channel = table.entry(index);
            if channel.src.core() == id && channel.ty == ChannelType::Default {
                // SAFETY: published by this worker in pass 1.
                let port = &*channel.src.dev.load(std::sync::atomic::Ordering::Relaxed)
                    .cast_const()
                    .cast::<DefaultSrc>();
                port.connect(channel);
            }
            if channel.dst.core() == id && channel.ty == ChannelType::Default {
                // SAFETY: published by this worker in pass 1.
                let port = &*channel.dst.dev.load(std::sync::atomic::Ordering::Relaxed)
                    .cast_const()
                    .cast::<DefaultDst>();
                port.connect(channel);
            }
        }

        log::trace!("worker {id}: init complete");
        worker
    }

    /// This worker's id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Handle for reading from channel `index`. Traps TABLE if the index is
    /// out of range, this worker is not the consumer, or the endpoint was
    /// never published.
    pub fn read_handle(&self, index: usize) -> Handle<'t> {
        self.handle_for(index, false)
    }

    /// Handle for writing to channel `index`. Traps TABLE if the index is
    /// out of range, this worker is not the producer, or the endpoint was
    /// never published.
    pub fn write_handle(&self, index: usize) -> Handle<'t> {
        self.handle_for(index, true)
    }

    fn handle_for(&self, index: usize, writing: bool) -> Handle<'t> {
        if index >= NUM_CHANNELS {
            trap!(TrapCode::Table, "channel index {index} out of range");
        }
        let channel = self.table.entry(index);
        let end = if writing { &channel.src } else { &channel.dst };
        if end.core() != self.id {
            trap!(
                TrapCode::Table,
                "channel {index}: worker {} does not own the {} end",
                self.id,
                if writing { "source" } else { "destination" }
            );
        }
        match NonNull::new(end.dev.load(std::sync::atomic::Ordering::Acquire)) {
            Some(port) => Handle::new(port),
            None => trap!(TrapCode::Table, "channel {index}: endpoint not published"),
        }
    }

    /// Read exactly `count` tokens into `buf`. Blocks until each token is
    /// available; returns `count`.
    pub fn read(&self, handle: Handle<'t>, buf: &mut [u8], count: usize) -> usize {
        let header = handle.header();
        check_buffer(header, buf.len(), count);
        match header.kind {
            // SAFETY: kind tag identifies the concrete port type; endpoints
            // live for the process.
            PortKind::DefaultDst => unsafe { &*handle.as_ptr().cast::<DefaultDst>() }
                .read(buf, count),
            PortKind::HostDst => unsafe { &*handle.as_ptr().cast::<HostPort>() }.read(buf, count),
            PortKind::DefaultSrc | PortKind::HostSrc => {
                trap!(TrapCode::Invalid, "read on a producer handle")
            }
        }
    }

    /// Copy up to `count` tokens into `buf` without consuming them. Never
    /// blocks; returns the number copied.
    pub fn peek(&self, handle: Handle<'t>, buf: &mut [u8], count: usize) -> usize {
        let header = handle.header();
        check_buffer(header, buf.len(), count);
        match header.kind {
            // SAFETY: as in `read`.
            PortKind::DefaultDst => unsafe { &*handle.as_ptr().cast::<DefaultDst>() }
                .peek(buf, count),
            PortKind::HostDst => unsafe { &*handle.as_ptr().cast::<HostPort>() }.peek(buf, count),
            PortKind::DefaultSrc | PortKind::HostSrc => {
                trap!(TrapCode::Invalid, "peek on a producer handle")
            }
        }
    }

    /// Write exactly `count` tokens from `buf`. Blocks on backpressure;
    /// returns `count`.
    pub fn write(&self, handle: Handle<'t>, buf: &[u8], count: usize) -> usize {
        let header = handle.header();
        check_buffer(header, buf.len(), count);
        match header.kind {
            // SAFETY: as in `read`.
            PortKind::DefaultSrc => unsafe { &*handle.as_ptr().cast::<DefaultSrc>() }
                .write(buf, count),
            PortKind::HostSrc => unsafe { &*handle.as_ptr().cast::<HostPort>() }.write(buf, count),
            PortKind::DefaultDst | PortKind::HostDst => {
                trap!(TrapCode::Invalid, "write on a consumer handle")
            }
        }
    }

    /// Tokens readable without blocking.
    pub fn level(&self, handle: Handle<'t>) -> usize {
        match handle.header().kind {
            // SAFETY: as in `read`.
            PortKind::DefaultDst => unsafe { &*handle.as_ptr().cast::<DefaultDst>() }.level(),
            PortKind::HostDst => unsafe { &*handle.as_ptr().cast::<HostPort>() }.level(),
            PortKind::DefaultSrc | PortKind::HostSrc => {
                trap!(TrapCode::Invalid, "level on a producer handle")
            }
        }
    }

    /// Tokens writable without blocking.
    pub fn space(&self, handle: Handle<'t>) -> usize {
        match handle.header().kind {
            // SAFETY: as in `read`.
            PortKind::DefaultSrc => unsafe { &*handle.as_ptr().cast::<DefaultSrc>() }.space(),
            PortKind::HostSrc => unsafe { &*handle.as_ptr().cast::<HostPort>() }.space(),
            PortKind::DefaultDst | PortKind::HostDst => {
                trap!(TrapCode::Invalid, "space on a consumer handle")
            }
        }
    }
}

/// Token-count operations move `count * token_size` bytes; a short caller
/// buffer is API misuse, not a partial transfer.
fn check_buffer(header: &PortHeader, buf_len: usize, count: usize) {
    match count.checked_mul(header.token_size as usize) {
        Some(needed) if buf_len >= needed => {}
        _ => trap!(
            TrapCode::Invalid,
            "buffer of {buf_len} bytes for {count} tokens of {}",
            header.token_size
        ),
    }
}
