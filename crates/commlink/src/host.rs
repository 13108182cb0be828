//! Host-side drainer/feeder and table diagnostics.
//!
//! The host owns a descriptor per host channel: the backing file, its open
//! handle, and a running count of tokens moved. [`HostIo::handle`] is called
//! repeatedly (the host tick): for every host channel it drains the shared
//! ring into its file or refills the ring from it. The host writes back only
//! the index it owns (`rp` when draining, `wp` when filling), so it never
//! races the worker on the other index.

use std::fs::File;
use std::io::{self, Read, Write};
use std::ptr;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::host_port::ring_at;
use crate::platform::{trap, TrapCode};
use crate::port::wrap;
use crate::table::{Channel, ChannelTable, ChannelType, NUM_CHANNELS};

/// Errors raised by host-side file I/O.
///
/// All fatal to the host loop; EOF on an input file is not an error (the
/// feeder just stops early). Channel-table misconfiguration is not an error
/// value at all: it traps TABLE, on the host exactly as on the workers.
#[derive(Debug, Error)]
pub enum HostError {
    /// A host channel the descriptor table has no entry for; the table
    /// passed to `handle` is not the one `init` saw.
    #[error("host channel {index}: descriptor missing (table mismatch?)")]
    NoDescriptor {
        /// Table index of the offending entry.
        index: usize,
    },
    /// Opening the backing file failed.
    #[error("can't open '{file}': {source}")]
    Open {
        /// The file that failed to open.
        file: String,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// A token could not be fully written to the descriptor.
    #[error("short write of a token to '{file}': {source}")]
    TokenWrite {
        /// The file being drained into.
        file: String,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// A token could not be fully read (EOF mid-token or I/O failure).
    #[error("short read of a token from '{file}'")]
    TokenRead {
        /// The file being fed from.
        file: String,
    },
    /// Reading from the descriptor failed outright.
    #[error("read from '{file}' failed: {source}")]
    FileRead {
        /// The file being fed from.
        file: String,
        /// The underlying I/O error.
        source: io::Error,
    },
}

/// The byte stream behind a host channel.
enum HostStream {
    /// Input channel: tokens are read from this file.
    Input(File),
    /// Output channel: tokens are written to this file (truncated on open).
    Output(File),
    /// Output channel bound to standard output via the magic name "stdout".
    Stdout(io::Stdout),
}

/// Host descriptor: backing stream plus the running token count.
struct HostDesc {
    file: String,
    stream: HostStream,
    count: u64,
}

impl HostDesc {
    fn open(index: usize, file: &str, input: bool) -> Result<Self, HostError> {
        let stream = if input {
            HostStream::Input(File::open(file).map_err(|source| HostError::Open {
                file: file.to_string(),
                source,
            })?)
        } else if file == "stdout" {
            HostStream::Stdout(io::stdout())
        } else {
            HostStream::Output(File::create(file).map_err(|source| HostError::Open {
                file: file.to_string(),
                source,
            })?)
        };
        log::info!(
            "host channel {index:2}: {} file '{file}'",
            if input { " input" } else { "output" }
        );
        Ok(Self {
            file: file.to_string(),
            stream,
            count: 0,
        })
    }

    fn write_token(&mut self, token: &[u8]) -> Result<(), HostError> {
        let result = match &mut self.stream {
            HostStream::Output(f) => f.write_all(token),
            HostStream::Stdout(s) => s.write_all(token),
            HostStream::Input(_) => {
                return Err(HostError::TokenWrite {
                    file: self.file.clone(),
                    source: io::Error::new(
                        io::ErrorKind::Other,
                        "input descriptor on an output channel",
                    ),
                })
            }
        };
        result.map_err(|source| HostError::TokenWrite {
            file: self.file.clone(),
            source,
        })
    }

    /// Read one token. `Ok(false)` is clean EOF before the first byte;
    /// EOF mid-token is an error.
    fn read_token(&mut self, token: &mut [u8]) -> Result<bool, HostError> {
        let f = match &mut self.stream {
            HostStream::Input(f) => f,
            HostStream::Output(_) | HostStream::Stdout(_) => {
                return Err(HostError::TokenRead {
                    file: self.file.clone(),
                })
            }
        };
        let mut filled = 0;
        while filled < token.len() {
            match f.read(&mut token[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(HostError::TokenRead {
                        file: self.file.clone(),
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(HostError::FileRead {
                        file: self.file.clone(),
                        source,
                    })
                }
            }
        }
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), HostError> {
        let result = match &mut self.stream {
            HostStream::Output(f) => f.flush(),
            HostStream::Stdout(s) => s.flush(),
            HostStream::Input(_) => Ok(()),
        };
        result.map_err(|source| HostError::TokenWrite {
            file: self.file.clone(),
            source,
        })
    }
}

/// The host side of the runtime: one descriptor per host channel.
pub struct HostIo {
    descs: Vec<Option<HostDesc>>,
}

impl HostIo {
    /// Open a descriptor for every host channel in the table.
    ///
    /// Inputs open read-only; outputs are created and truncated, except the
    /// magic name `"stdout"`, which binds standard output. Fails on open
    /// errors; a host channel without exactly one host end traps TABLE.
    pub fn init(table: &ChannelTable) -> Result<Self, HostError> {
        let mut descs: Vec<Option<HostDesc>> = (0..NUM_CHANNELS).map(|_| None).collect();
        for (index, channel) in table.entries().enumerate() {
            if channel.channel_type() != ChannelType::Host {
                continue;
            }
            let (end, input) = match (channel.src().is_host(), channel.dst().is_host()) {
                (true, false) => (channel.src(), true),
                (false, true) => (channel.dst(), false),
                (true, true) => {
                    trap!(TrapCode::Table, "host channel {index}: both ends are the host")
                }
                (false, false) => {
                    trap!(TrapCode::Table, "host channel {index}: neither end is the host")
                }
            };
            // Host ends always carry a backing file name (ChannelEnd::host).
            let file = match end.file.as_deref() {
                Some(file) => file,
                None => unreachable!("host end without a backing file"),
            };
            descs[index] = Some(HostDesc::open(index, file, input)?);
        }
        Ok(Self { descs })
    }

    /// One host tick: drain every worker-to-host ring into its file, refill
    /// every host-to-worker ring from its file.
    pub fn handle(&mut self, table: &ChannelTable) -> Result<(), HostError> {
        for index in 0..NUM_CHANNELS {
            let channel = table.entry(index);
            if channel.channel_type() != ChannelType::Host {
                continue;
            }
            let desc = self.descs[index]
                .as_mut()
                .ok_or(HostError::NoDescriptor { index })?;
            if channel.dst().is_host() {
                drain(index, channel, table, desc)?;
            } else if channel.src().is_host() {
                fill(index, channel, table, desc)?;
            }
        }
        Ok(())
    }

    /// Tokens moved so far on channel `index` (0 for non-host channels).
    pub fn count(&self, index: usize) -> u64 {
        self.descs
            .get(index)
            .and_then(|d| d.as_ref())
            .map_or(0, |d| d.count)
    }

    /// Render the channel table for diagnostics, one line per declared
    /// channel.
    pub fn dump(&self, table: &ChannelTable) -> String {
        use std::fmt::Write as _;

        let mut out = String::from("Channel configuration:\n");
        for (index, channel) in table.entries().enumerate() {
            match channel.channel_type() {
                ChannelType::Invalid => {}
                ChannelType::Default => {
                    let _ = writeln!(
                        out,
                        "DEFAULT [{index:2}]: {:5} * {:2} bytes  |  [{:#x}] [{:#x}]  |  {:2} -> {:2}",
                        channel.token_num(),
                        channel.token_size(),
                        channel.src().dev.load(Ordering::Acquire) as usize,
                        channel.dst().dev.load(Ordering::Acquire) as usize,
                        channel.src().core(),
                        channel.dst().core(),
                    );
                }
                ChannelType::Host => {
                    let file = self.descs[index]
                        .as_ref()
                        .map_or("<unopened>", |d| d.file.as_str());
                    let count = self.count(index);
                    if channel.src().is_host() {
                        let _ = writeln!(
                            out,
                            "HOST    [{index:2}]: {:5} * {:2} bytes  |  [{:#x}]  |  '{file}' ({count} tokens) -> {:2}",
                            channel.token_num(),
                            channel.token_size(),
                            channel.dst().dev.load(Ordering::Acquire) as usize,
                            channel.dst().core(),
                        );
                    } else {
                        let _ = writeln!(
                            out,
                            "HOST    [{index:2}]: {:5} * {:2} bytes  |  [{:#x}]  |  {:2} -> '{file}' ({count} tokens)",
                            channel.token_num(),
                            channel.token_size(),
                            channel.src().dev.load(Ordering::Acquire) as usize,
                            channel.src().core(),
                        );
                    }
                }
            }
        }
        out
    }
}

/// Drain a worker-to-host ring into its descriptor. Only `rp` is written
/// back; `wp` belongs to the producing worker.
fn drain(
    index: usize,
    channel: &Channel,
    table: &ChannelTable,
    desc: &mut HostDesc,
) -> Result<(), HostError> {
    let cap = channel.capacity() as i32;
    let tsize = channel.token_size() as usize;
    // SAFETY: the offset was baked into the host end at table build.
    let (ring, buf) = unsafe { ring_at(table.region_base(), channel.dst().shm_off) };
    let ring = unsafe { &*ring };

    // Acquire on wp orders the token reads below after the worker's stores.
    let wp = ring.wp.load(Ordering::Acquire);
    let rp = ring.rp.load(Ordering::Relaxed); // host is the only rp writer
    let level = wrap(cap + wp - rp, cap);

    let mut token = vec![0u8; tsize];
    for k in 0..level {
        let slot = wrap(rp + k, cap) as usize;
        // SAFETY: slots [rp, wp) were published by the acquire above; the
        // worker will not reuse them until rp advances.
        unsafe {
            ptr::copy_nonoverlapping(buf.add(slot * tsize), token.as_mut_ptr(), tsize);
        }
        desc.write_token(&token)?;
        desc.count += 1;
    }
    desc.flush()?;

    // Release after the reads: the worker may overwrite the slots once it
    // sees the new rp.
    let new_rp = wrap(rp + level, cap);
    ring.rp.store(new_rp, Ordering::Release);
    if level > 0 {
        log::debug!("drain {index}: ({new_rp:2}/{wp:2} | {})", desc.count);
    }
    Ok(())
}

/// Refill a host-to-worker ring from its descriptor. Only `wp` is written
/// back; `rp` belongs to the consuming worker. Stops early on EOF.
fn fill(
    index: usize,
    channel: &Channel,
    table: &ChannelTable,
    desc: &mut HostDesc,
) -> Result<(), HostError> {
    let cap = channel.capacity() as i32;
    let tsize = channel.token_size() as usize;
    // SAFETY: the offset was baked into the host end at table build.
    let (ring, buf) = unsafe { ring_at(table.region_base(), channel.src().shm_off) };
    let ring = unsafe { &*ring };

    // Acquire on rp orders the slot writes below after the worker's reads of
    // the tokens previously there.
    let rp = ring.rp.load(Ordering::Acquire);
    let wp = ring.wp.load(Ordering::Relaxed); // host is the only wp writer
    let space = wrap(cap - 1 + rp - wp, cap);

    let mut token = vec![0u8; tsize];
    let mut moved = 0;
    for k in 0..space {
        if !desc.read_token(&mut token)? {
            break; // eof: the worker downstream blocks until more data appears
        }
        let slot = wrap(wp + k, cap) as usize;
        // SAFETY: slots [wp, rp - 1) are free; the worker will not read them
        // until the Release store of wp below.
        unsafe {
            ptr::copy_nonoverlapping(token.as_ptr(), buf.add(slot * tsize), tsize);
        }
        desc.count += 1;
        moved += 1;
    }

    let new_wp = wrap(wp + moved, cap);
    ring.wp.store(new_wp, Ordering::Release);
    if moved > 0 {
        log::debug!("fill {index}: ({rp:2}/{new_wp:2} | {})", desc.count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Channel;

    #[test]
    fn stdout_magic_name_binds_standard_output() {
        let table =
            ChannelTable::new(vec![Channel::host_output(0, "stdout", 4, 2)]).unwrap();
        let host = HostIo::init(&table).unwrap();
        assert!(matches!(
            host.descs[0],
            Some(HostDesc {
                stream: HostStream::Stdout(_),
                ..
            })
        ));
    }

    #[test]
    fn host_channel_needs_exactly_one_host_end() {
        let table =
            ChannelTable::new(vec![Channel::host_input("in.bin", crate::table::HOST, 4, 2)])
                .unwrap();
        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = HostIo::init(&table);
        }))
        .unwrap_err();
        let msg = err.downcast_ref::<String>().unwrap();
        assert!(msg.starts_with("trap 51"));
    }

    #[test]
    fn missing_input_file_fails_open() {
        let table = ChannelTable::new(vec![Channel::host_input(
            "/nonexistent/commlink-test-input.bin",
            0,
            4,
            2,
        )])
        .unwrap();
        assert!(matches!(HostIo::init(&table), Err(HostError::Open { .. })));
    }

    #[test]
    fn dump_names_every_declared_channel() {
        let table = ChannelTable::new(vec![
            Channel::between(0, 1, 4, 3),
            Channel::host_output(1, "stdout", 4, 2),
        ])
        .unwrap();
        let host = HostIo::init(&table).unwrap();
        let dump = host.dump(&table);
        assert!(dump.contains("DEFAULT [ 0]"));
        assert!(dump.contains("HOST    [ 1]"));
        assert!(dump.contains("'stdout'"));
        // Invalid slots are not rendered
        assert!(!dump.contains("[ 2]"));
    }
}
