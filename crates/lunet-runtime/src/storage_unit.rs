//! The write-once, block-indexed storage unit (spec §4.7): a data file of
//! fixed 4096-byte blocks acknowledged only once the corresponding bit in a
//! durable bitmap file has been fsynced, with writes to the same bitmap
//! byte serialised through a per-byte tracker rather than one fsync per
//! write.
//!
//! The original's explicit `step` field (`DATA_WRITE` → `DATA_FSYNC` →
//! `BM_WRITE` → `BM_FSYNC`) becomes a straight-line `async fn` here: each
//! `.await` point *is* a step transition, so there is nothing to dispatch
//! on. The per-bitmap-byte tracker and its waiter list, which is the part
//! of the chain that genuinely needs shared mutable state across
//! independently-submitted writes, is kept exactly as described.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use lunet_sdk::{CoroutineId, HostContext, HostValue, LunetError};

use crate::coref::CorefId;
use crate::runtime::Runtime;

/// Fixed block size for every write-once slot.
pub const BLOCK_SIZE: u64 = 4096;

const BITMAP_HEADER_LEN: usize = 16;
const BITMAP_MAGIC: [u8; 4] = *b"SUBM";

/// On-disk bitmap-file header (spec §6 wire format, supplemented from
/// `original_source/src/su.c`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub max_addresses: u64,
}

impl BitmapHeader {
    fn to_bytes(self) -> [u8; BITMAP_HEADER_LEN] {
        let mut buf = [0u8; BITMAP_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.max_addresses.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, LunetError> {
        if buf.len() < BITMAP_HEADER_LEN {
            return Err(LunetError::ArgumentError("bitmap header too short".into()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != BITMAP_MAGIC {
            return Err(LunetError::ProtocolError("bitmap file has the wrong magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let max_addresses = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok(BitmapHeader {
            magic,
            version,
            max_addresses,
        })
    }
}

struct Waiter {
    coroutine: CoroutineId,
    coref: CorefId,
    target_gen: u64,
    host: Arc<dyn HostContext>,
}

#[derive(Default)]
struct ByteTracker {
    gen: u64,
    inflight: bool,
    waiters: Vec<Waiter>,
}

/// A write-once storage unit backed by a data file and a bitmap file.
///
/// Cheaply cloneable: every field is already `Arc`-shared, since the
/// per-byte trackers (not a single outer lock) are what actually serialise
/// concurrent writers here.
#[derive(Clone)]
pub struct StorageUnit {
    data_file: Arc<std::fs::File>,
    bitmap_file: Arc<std::fs::File>,
    max_addresses: u64,
    committed: Arc<Mutex<Vec<u8>>>,
    pending: Arc<Mutex<Vec<u8>>>,
    trackers: Arc<DashMap<u64, ByteTracker>>,
    closing: Arc<AtomicBool>,
}

fn bit_location(address: u64) -> (usize, u8) {
    ((address / 8) as usize, 1u8 << (address % 8))
}

async fn write_at(file: Arc<std::fs::File>, offset: u64, data: Vec<u8>) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        use std::os::unix::fs::FileExt;
        file.write_all_at(&data, offset)
    })
    .await
    .expect("blocking write task panicked")
}

async fn fsync_file(file: Arc<std::fs::File>) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || file.sync_data())
        .await
        .expect("blocking fsync task panicked")
}

async fn read_at(file: Arc<std::fs::File>, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    })
    .await
    .expect("blocking read task panicked")
}

impl StorageUnit {
    /// Open (creating if absent) a storage unit backed by `data_path` and
    /// `bitmap_path`, sized for `max_addresses` blocks. If the bitmap file
    /// already exists its header is validated and `max_addresses` must
    /// match exactly (spec's "synchronous open error").
    pub async fn open(
        data_path: &str,
        bitmap_path: &str,
        max_addresses: u64,
    ) -> Result<StorageUnit, LunetError> {
        let data_path_owned = data_path.to_string();
        let data_file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(data_path_owned)
        })
        .await
        .expect("blocking open task panicked")
        .map_err(LunetError::from)?;

        let bitmap_path_owned = bitmap_path.to_string();
        let bits_len = ((max_addresses + 7) / 8) as usize;
        let (bitmap_file, committed_bits) = tokio::task::spawn_blocking(move || {
            open_or_create_bitmap(&bitmap_path_owned, max_addresses, bits_len)
        })
        .await
        .expect("blocking bitmap-open task panicked")
        .map_err(LunetError::from)?;

        Ok(StorageUnit {
            data_file: Arc::new(data_file),
            bitmap_file: Arc::new(bitmap_file),
            max_addresses,
            committed: Arc::new(Mutex::new(committed_bits)),
            pending: Arc::new(Mutex::new(vec![0u8; bits_len])),
            trackers: Arc::new(DashMap::new()),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// True once `write_once(address, _)` has returned success and its
    /// bitmap byte has been durably fsynced. Survives a reopen of the same
    /// data/bitmap file pair (spec §8 "Storage-unit durability").
    pub fn is_written(&self, address: u64) -> bool {
        if address >= self.max_addresses {
            return false;
        }
        let (byte_idx, mask) = bit_location(address);
        self.committed.lock()[byte_idx] & mask != 0
    }

    /// Read back the block written at `address`. Errors if `address` was
    /// never successfully written (spec §8 "Storage-unit durability": a
    /// `read` only ever observes data whose `write_once` was seen to
    /// succeed).
    pub async fn read(&self, address: u64) -> Result<Vec<u8>, LunetError> {
        if address >= self.max_addresses {
            return Err(LunetError::ArgumentError("address out of range".into()));
        }
        if !self.is_written(address) {
            return Err(LunetError::ArgumentError(
                "address has not been written".into(),
            ));
        }
        let offset = address * BLOCK_SIZE;
        read_at(Arc::clone(&self.data_file), offset, BLOCK_SIZE as usize)
            .await
            .map_err(LunetError::from)
    }

    /// Write `data` (exactly [`BLOCK_SIZE`] bytes) to `address` exactly
    /// once. `coroutine` resumes once the write, and the bitmap byte
    /// covering it, are both durably fsynced (spec §4.7's step machine).
    pub fn write_once(
        &self,
        runtime: &Arc<Runtime>,
        host: Arc<dyn HostContext>,
        coroutine: CoroutineId,
        address: u64,
        data: Vec<u8>,
    ) -> Result<(), LunetError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(LunetError::LifecycleError("storage unit closed".into()));
        }
        if address >= self.max_addresses {
            return Err(LunetError::ArgumentError("address out of range".into()));
        }
        if data.len() as u64 != BLOCK_SIZE {
            return Err(LunetError::ArgumentError(
                "data must be exactly one block".into(),
            ));
        }
        let (byte_idx, mask) = bit_location(address);
        if self.committed.lock()[byte_idx] & mask != 0 {
            return Err(LunetError::ArgumentError("block already committed".into()));
        }
        {
            let mut pending = self.pending.lock();
            if pending[byte_idx] & mask != 0 {
                return Err(LunetError::ArgumentError("block already pending".into()));
            }
            pending[byte_idx] |= mask;
        }

        let coref = runtime.coref_registry.create(coroutine);
        runtime.alive_set.mark_alive(coroutine);
        let unit = self.clone();
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            unit.run_chain(runtime, host, coref, coroutine, address, data, byte_idx, mask)
                .await;
        });
        Ok(())
    }

    async fn run_chain(
        &self,
        runtime: Arc<Runtime>,
        host: Arc<dyn HostContext>,
        coref: CorefId,
        coroutine: CoroutineId,
        address: u64,
        data: Vec<u8>,
        byte_idx: usize,
        mask: u8,
    ) {
        runtime.storage_trace.incr("su_data_write");
        let offset = address * BLOCK_SIZE;
        if let Err(e) = write_at(Arc::clone(&self.data_file), offset, data).await {
            self.fail_pending(&runtime, host.as_ref(), coref, coroutine, byte_idx, mask, e);
            return;
        }

        runtime.storage_trace.incr("su_data_fsync");
        if let Err(e) = fsync_file(Arc::clone(&self.data_file)).await {
            self.fail_pending(&runtime, host.as_ref(), coref, coroutine, byte_idx, mask, e);
            return;
        }

        runtime.storage_trace.incr("su_bm_write");
        let need_flush = {
            self.pending.lock()[byte_idx] &= !mask;
            self.committed.lock()[byte_idx] |= mask;

            let mut tracker = self.trackers.entry(byte_idx as u64).or_default();
            tracker.gen += 1;
            let target_gen = tracker.gen;
            tracker.waiters.push(Waiter {
                coroutine,
                coref,
                target_gen,
                host,
            });
            if tracker.inflight {
                false
            } else {
                tracker.inflight = true;
                true
            }
        };

        if need_flush {
            self.clone().spawn_flush(runtime, byte_idx);
        }
    }

    fn fail_pending(
        &self,
        runtime: &Runtime,
        host: &dyn HostContext,
        coref: CorefId,
        coroutine: CoroutineId,
        byte_idx: usize,
        mask: u8,
        err: std::io::Error,
    ) {
        self.pending.lock()[byte_idx] &= !mask;
        runtime.coref_registry.release(coref);
        let status = host.resume(
            coroutine,
            Err(format!("storage unit write failed: {err}")),
        );
        if !status.is_suspended() {
            runtime.alive_set.remove(coroutine);
        }
    }

    fn spawn_flush(self, runtime: Arc<Runtime>, byte_idx: usize) {
        tokio::spawn(async move {
            loop {
                let (byte_value, flush_gen) = {
                    let committed = self.committed.lock();
                    let tracker = self
                        .trackers
                        .get(&(byte_idx as u64))
                        .expect("tracker must exist while a flush is in flight");
                    (committed[byte_idx], tracker.gen)
                };

                let bm_offset = BITMAP_HEADER_LEN as u64 + byte_idx as u64;
                let result = match write_at(Arc::clone(&self.bitmap_file), bm_offset, vec![byte_value]).await {
                    Ok(()) => {
                        runtime.storage_trace.incr("su_bm_fsync");
                        fsync_file(Arc::clone(&self.bitmap_file)).await
                    }
                    Err(e) => Err(e),
                };

                let (ready, more_pending) = {
                    let mut tracker = self.trackers.get_mut(&(byte_idx as u64)).unwrap();
                    let waiters = std::mem::take(&mut tracker.waiters);
                    let (ready, remaining): (Vec<_>, Vec<_>) =
                        waiters.into_iter().partition(|w| w.target_gen <= flush_gen);
                    tracker.waiters = remaining;
                    let more = !tracker.waiters.is_empty();
                    tracker.inflight = more;
                    (ready, more)
                };

                for waiter in ready {
                    runtime.coref_registry.release(waiter.coref);
                    let completion = match &result {
                        Ok(()) => Ok(HostValue::Unit),
                        Err(e) => Err(format!("storage unit bitmap flush failed: {e}")),
                    };
                    let status = waiter.host.resume(waiter.coroutine, completion);
                    if !status.is_suspended() {
                        runtime.alive_set.remove(waiter.coroutine);
                    }
                }

                if !more_pending {
                    self.trackers.remove(&(byte_idx as u64));
                    break;
                }
            }
        });
    }

    /// Close the unit, failing every queued waiter with "storage unit
    /// closed" (spec §4.7's close/destruction rule). Idempotent.
    pub fn close(&self, runtime: &Runtime) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for mut entry in self.trackers.iter_mut() {
            for waiter in entry.waiters.drain(..) {
                runtime.coref_registry.release(waiter.coref);
                let status = waiter
                    .host
                    .resume(waiter.coroutine, Err("storage unit closed".to_string()));
                if !status.is_suspended() {
                    runtime.alive_set.remove(waiter.coroutine);
                }
            }
        }
        self.trackers.clear();
    }
}

fn open_or_create_bitmap(
    path: &str,
    max_addresses: u64,
    bits_len: usize,
) -> std::io::Result<(std::fs::File, Vec<u8>)> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let is_new = !std::path::Path::new(path).exists();
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    if is_new {
        let header = BitmapHeader {
            magic: BITMAP_MAGIC,
            version: 1,
            max_addresses,
        };
        file.write_all(&header.to_bytes())?;
        let bits = vec![0u8; bits_len];
        file.write_all(&bits)?;
        file.sync_data()?;
        Ok((file, bits))
    } else {
        let mut header_buf = [0u8; BITMAP_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_buf)?;
        let header = BitmapHeader::from_bytes(&header_buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if header.max_addresses != max_addresses {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "max_addresses mismatch against existing bitmap file",
            ));
        }
        let mut bits = vec![0u8; bits_len];
        file.read_exact(&mut bits)?;
        Ok((file, bits))
    }
}
