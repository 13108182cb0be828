//! CommLink - Dataflow Token Channels over Shared Memory
//!
//! A communications runtime connecting many compute workers through typed,
//! fixed-capacity, one-directional token channels. Each channel is a bounded
//! SPSC FIFO carrying fixed-size tokens between exactly one producer and one
//! consumer, coordinated purely through shared memory: no locks, no CAS, no
//! kernel involvement on the fast path.
//!
//! This is a Rust port of a manycore dataflow communication library; the
//! thread platform maps each worker id to one thread of the process.
//!
//! # Key Pieces
//!
//! - Declarative channel table: 32 indexed entries shared by every worker
//! - Worker-to-worker channels: SPSC rings with cross-thread shadowed indices
//! - Worker-to-host channels: rings in a host-visible region, drained/filled
//!   by the host loop ([`HostIo`]) between files and workers
//! - Two-pass discovery handshake: create + publish, then rendezvous
//! - Misconfiguration is fatal by design: traps 50/51/52 (OOM/TABLE/INVALID)
//!
//! # Example
//!
//! ```
//! use commlink_rs::{Channel, ChannelTable, Worker};
//! use std::thread;
//!
//! let table = ChannelTable::new(vec![Channel::between(0, 1, 4, 3)]).unwrap();
//!
//! // Worker heaps outlive the scope: endpoints inside them are shared until
//! // every worker has finished.
//! let mut heap0 = vec![0u8; 8192];
//! let mut heap1 = vec![0u8; 8192];
//! let (base0, len0) = (heap0.as_mut_ptr() as usize, heap0.len());
//! let (base1, len1) = (heap1.as_mut_ptr() as usize, heap1.len());
//!
//! let table = &table;
//! thread::scope(|s| {
//!     s.spawn(move || {
//!         // SAFETY: the heap range is exclusive to this worker and outlives
//!         // the scope that joins every peer.
//!         let worker = unsafe { Worker::init(table, 0, base0 as *mut u8, len0) };
//!         let h = worker.write_handle(0);
//!         worker.write(h, &7u32.to_le_bytes(), 1);
//!     });
//!     s.spawn(move || {
//!         // SAFETY: as above.
//!         let worker = unsafe { Worker::init(table, 1, base1 as *mut u8, len1) };
//!         let h = worker.read_handle(0);
//!         let mut buf = [0u8; 4];
//!         worker.read(h, &mut buf, 1);
//!         assert_eq!(u32::from_le_bytes(buf), 7);
//!     });
//! });
//! ```

mod arena;
mod backoff;
mod default_port;
mod host;
mod host_port;
mod invariants;
mod platform;
mod port;
mod table;
mod worker;

pub use arena::BumpArena;
pub use backoff::Backoff;
pub use host::{HostError, HostIo};
pub use platform::TrapCode;
pub use port::Handle;
pub use table::{Channel, ChannelEnd, ChannelTable, ChannelType, TableError, HOST, NUM_CHANNELS};
pub use worker::Worker;
