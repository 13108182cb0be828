//! The declarative channel table and the host-visible shared region.
//!
//! A table is a contiguous array of exactly [`NUM_CHANNELS`] entries built by
//! the host before startup and shared with every worker; the entry index is
//! the channel's name. Entries are immutable after construction except for
//! the endpoint publication slots, which the discovery handshake fills in.
//!
//! For host channels the table also owns the host-visible shared region: one
//! byte range holding each channel's `{rp, wp, buf}` ring at an offset baked
//! into the table entry at build time.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicPtr;

use thiserror::Error;

use crate::host_port::ring_footprint;
use crate::port::PortHeader;

/// Number of entries in every channel table.
pub const NUM_CHANNELS: usize = 32;

/// Sentinel worker id for the host end of a channel.
pub const HOST: i32 = -1;

/// Channel transport selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Unused table slot, ignored by everyone.
    Invalid,
    /// Worker-to-worker SPSC ring.
    Default,
    /// Ring in host-visible shared memory, drained/filled by the host loop.
    Host,
}

/// One end of a channel as seen in the shared table.
///
/// The original protocol overloaded a single pointer slot per end; here the
/// endpoint publication slot, the shared-ring offset and the host file name
/// are separate fields.
pub struct ChannelEnd {
    pub(crate) core: i32,
    /// Endpoint publication slot. Null until the owning worker's create pass
    /// publishes its endpoint; the rendezvous signal of the handshake.
    pub(crate) dev: AtomicPtr<PortHeader>,
    /// Byte offset of this channel's ring inside the shared region. Only
    /// meaningful on the host end of a host channel.
    pub(crate) shm_off: u32,
    /// File backing the host end of a host channel.
    pub(crate) file: Option<String>,
}

impl ChannelEnd {
    fn worker(core: i32) -> Self {
        Self {
            core,
            dev: AtomicPtr::new(std::ptr::null_mut()),
            shm_off: 0,
            file: None,
        }
    }

    fn host(file: &str) -> Self {
        Self {
            core: HOST,
            dev: AtomicPtr::new(std::ptr::null_mut()),
            shm_off: 0,
            file: Some(file.to_string()),
        }
    }

    /// Worker id of this end, or [`HOST`].
    pub fn core(&self) -> i32 {
        self.core
    }

    /// Whether this end is the host sentinel.
    pub fn is_host(&self) -> bool {
        self.core == HOST
    }
}

/// A single channel declaration: transport, endpoints, token geometry.
pub struct Channel {
    pub(crate) ty: ChannelType,
    pub(crate) src: ChannelEnd,
    pub(crate) dst: ChannelEnd,
    pub(crate) token_size: u32,
    pub(crate) token_num: u32,
}

impl Channel {
    /// An unused table slot.
    pub fn invalid() -> Self {
        Self {
            ty: ChannelType::Invalid,
            src: ChannelEnd::worker(0),
            dst: ChannelEnd::worker(0),
            token_size: 0,
            token_num: 0,
        }
    }

    /// A worker-to-worker channel carrying `token_num` tokens of
    /// `token_size` bytes from `src` to `dst`.
    pub fn between(src: i32, dst: i32, token_size: u32, token_num: u32) -> Self {
        Self {
            ty: ChannelType::Default,
            src: ChannelEnd::worker(src),
            dst: ChannelEnd::worker(dst),
            token_size,
            token_num,
        }
    }

    /// A host-fed channel: tokens stream from `file` into worker `dst`.
    pub fn host_input(file: &str, dst: i32, token_size: u32, token_num: u32) -> Self {
        Self {
            ty: ChannelType::Host,
            src: ChannelEnd::host(file),
            dst: ChannelEnd::worker(dst),
            token_size,
            token_num,
        }
    }

    /// A host-drained channel: worker `src` streams tokens out to `file`.
    ///
    /// The special file name `"stdout"` binds to standard output.
    pub fn host_output(src: i32, file: &str, token_size: u32, token_num: u32) -> Self {
        Self {
            ty: ChannelType::Host,
            src: ChannelEnd::worker(src),
            dst: ChannelEnd::host(file),
            token_size,
            token_num,
        }
    }

    /// Transport of this channel.
    pub fn channel_type(&self) -> ChannelType {
        self.ty
    }

    /// Bytes per token.
    pub fn token_size(&self) -> u32 {
        self.token_size
    }

    /// Advertised token capacity.
    pub fn token_num(&self) -> u32 {
        self.token_num
    }

    /// Physical ring slot count (`token_num + 1`).
    pub(crate) fn capacity(&self) -> u32 {
        self.token_num + 1
    }

    /// Producer end.
    pub fn src(&self) -> &ChannelEnd {
        &self.src
    }

    /// Consumer end.
    pub fn dst(&self) -> &ChannelEnd {
        &self.dst
    }
}

/// Errors rejected at table-build time.
#[derive(Debug, Error)]
pub enum TableError {
    /// More declarations than table slots.
    #[error("{count} channels declared, table holds {NUM_CHANNELS}")]
    TooManyChannels {
        /// Number of declarations passed in.
        count: usize,
    },
    /// A non-invalid entry with a zero token size.
    #[error("channel {index}: zero token size")]
    ZeroTokenSize {
        /// Table index of the offending entry.
        index: usize,
    },
    /// A non-invalid entry with a zero token count.
    #[error("channel {index}: zero token count")]
    ZeroTokenNum {
        /// Table index of the offending entry.
        index: usize,
    },
    /// The host-visible region would exceed the addressable offset range.
    #[error("host-visible region exceeds the 32-bit offset range")]
    RegionTooLarge,
}

/// Host-visible byte range holding the host-channel rings.
///
/// Backed by 8-byte words so every ring header and buffer base is 8-byte
/// aligned. All access after construction goes through raw pointers under
/// the ring protocol's single-writer discipline.
struct SharedRegion {
    storage: Box<[UnsafeCell<u64>]>,
}

// SAFETY: the region is plain shared memory. Every mutable location inside it
// has a single writer for the life of the table (ring indices via atomics,
// token slots fenced by the index handoff), so concurrent access is governed
// by the ring protocol, not by references.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    fn new(bytes: usize) -> Self {
        let words = bytes.div_ceil(8);
        let mut storage = Vec::with_capacity(words);
        storage.resize_with(words, || UnsafeCell::new(0));
        Self {
            storage: storage.into_boxed_slice(),
        }
    }

    fn base(&self) -> *mut u8 {
        self.storage.as_ptr() as *mut u8
    }
}

/// The shared channel table: [`NUM_CHANNELS`] entries plus the host-visible
/// region their host rings live in.
pub struct ChannelTable {
    entries: [Channel; NUM_CHANNELS],
    region: SharedRegion,
}

impl ChannelTable {
    /// Build a table from up to [`NUM_CHANNELS`] declarations; remaining
    /// slots are invalid. Lays out the shared region and bakes each host
    /// channel's ring offset into its host end.
    pub fn new(mut channels: Vec<Channel>) -> Result<Self, TableError> {
        if channels.len() > NUM_CHANNELS {
            return Err(TableError::TooManyChannels {
                count: channels.len(),
            });
        }
        channels.resize_with(NUM_CHANNELS, Channel::invalid);

        let mut cursor = 0usize;
        for (index, ch) in channels.iter_mut().enumerate() {
            match ch.ty {
                ChannelType::Invalid => continue,
                ChannelType::Default | ChannelType::Host => {
                    if ch.token_size == 0 {
                        return Err(TableError::ZeroTokenSize { index });
                    }
                    if ch.token_num == 0 {
                        return Err(TableError::ZeroTokenNum { index });
                    }
                }
            }

            if ch.ty == ChannelType::Host {
                let footprint = ring_footprint(ch.capacity(), ch.token_size);
                let off = u32::try_from(cursor).map_err(|_| TableError::RegionTooLarge)?;
                let end = if ch.src.is_host() {
                    &mut ch.src
                } else if ch.dst.is_host() {
                    &mut ch.dst
                } else {
                    // No host end to anchor a ring; the worker side traps
                    // TABLE and HostIo::init reports the entry.
                    continue;
                };
                end.shm_off = off;
                cursor += (footprint + 7) & !7;
            }
        }
        u32::try_from(cursor).map_err(|_| TableError::RegionTooLarge)?;

        let entries: [Channel; NUM_CHANNELS] = match channels.try_into() {
            Ok(entries) => entries,
            Err(_) => unreachable!("length fixed by resize_with above"),
        };

        Ok(Self {
            entries,
            region: SharedRegion::new(cursor),
        })
    }

    /// Entry at `index`. Panics if out of range; the worker API range-checks
    /// and traps before calling in.
    pub fn entry(&self, index: usize) -> &Channel {
        &self.entries[index]
    }

    /// All entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = &Channel> {
        self.entries.iter()
    }

    /// Base of the host-visible region.
    pub(crate) fn region_base(&self) -> *mut u8 {
        self.region.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_with_invalid_entries() {
        let table = ChannelTable::new(vec![Channel::between(0, 1, 4, 3)]).unwrap();
        assert_eq!(table.entry(0).channel_type(), ChannelType::Default);
        assert_eq!(table.entry(1).channel_type(), ChannelType::Invalid);
        assert_eq!(table.entries().count(), NUM_CHANNELS);
    }

    #[test]
    fn host_rings_get_disjoint_aligned_offsets() {
        let table = ChannelTable::new(vec![
            Channel::host_input("in.bin", 0, 4, 3),
            Channel::host_output(0, "out.bin", 8, 5),
        ])
        .unwrap();

        let first = table.entry(0).src();
        let second = table.entry(1).dst();
        assert!(first.is_host());
        assert!(second.is_host());
        assert_eq!(first.shm_off, 0);
        // header (8) + 4 slots * 4 bytes = 24, already 8-aligned
        assert_eq!(second.shm_off, 24);
        assert_eq!(second.shm_off % 8, 0);
    }

    #[test]
    fn zero_token_geometry_is_rejected() {
        assert!(matches!(
            ChannelTable::new(vec![Channel::between(0, 1, 0, 3)]),
            Err(TableError::ZeroTokenSize { index: 0 })
        ));
        assert!(matches!(
            ChannelTable::new(vec![Channel::between(0, 1, 4, 0)]),
            Err(TableError::ZeroTokenNum { index: 0 })
        ));
    }
}
