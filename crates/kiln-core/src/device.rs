use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

// Accelerator: the swappable device side of a SyncedBuffer
//
// kiln computes on host slices. An accelerator backend therefore only has to
// own byte blocks and move them across the host/device boundary; kernels are
// supplied elsewhere. SyncedBuffer drives these four primitives lazily, so a
// backend never sees a transfer that the freshness state says is redundant.
//
// SimulatedDevice is an in-process backend: blocks are Vec<u8> behind a
// mutex, an optional byte budget produces recoverable out-of-memory errors,
// and atomic counters expose how many transfers actually happened.

/// Handle to a block of accelerator memory.
///
/// The handle is opaque to kiln: only the accelerator that produced it can
/// interpret `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAlloc {
    id: u64,
    bytes: usize,
}

impl DeviceAlloc {
    pub fn new(id: u64, bytes: usize) -> Self {
        DeviceAlloc { id, bytes }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the block in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// A device that can hold mirrored tensor memory.
pub trait Accelerator: fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g. "sim:0").
    fn name(&self) -> String;

    /// Allocate `bytes` of zero-filled device memory.
    ///
    /// Failure is reported as [`Error::OutOfMemory`] and is recoverable.
    fn alloc(&self, bytes: usize) -> Result<DeviceAlloc>;

    /// Release a block previously returned by `alloc`.
    fn free(&self, alloc: &DeviceAlloc);

    /// Copy host bytes into a device block.
    fn upload(&self, src: &[u8], dst: &DeviceAlloc) -> Result<()>;

    /// Copy a device block into host bytes.
    fn download(&self, src: &DeviceAlloc, dst: &mut [u8]) -> Result<()>;
}

// Device statistics

/// Snapshot of a simulated device's allocation and transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Cumulative number of allocations served.
    pub allocations: u64,
    /// Blocks currently alive.
    pub live_blocks: usize,
    /// Bytes currently held by live blocks.
    pub bytes_in_use: usize,
    /// Cumulative host-to-device copies.
    pub uploads: u64,
    /// Cumulative device-to-host copies.
    pub downloads: u64,
}

// SimulatedDevice

/// An accelerator backed by host memory.
pub struct SimulatedDevice {
    ordinal: usize,
    budget: Option<usize>,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,

    // Atomic counters, so stats() never contends with transfers
    allocations: AtomicU64,
    uploads: AtomicU64,
    downloads: AtomicU64,
}

impl SimulatedDevice {
    /// Create a device with unlimited memory.
    pub fn new(ordinal: usize) -> Self {
        SimulatedDevice {
            ordinal,
            budget: None,
            blocks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            allocations: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
        }
    }

    /// Limit the total number of bytes that may be live at once.
    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    pub fn stats(&self) -> DeviceStats {
        let blocks = self.lock_blocks();
        DeviceStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            live_blocks: blocks.len(),
            bytes_in_use: blocks.values().map(Vec::len).sum(),
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
        }
    }

    fn lock_blocks(&self) -> MutexGuard<'_, HashMap<u64, Vec<u8>>> {
        // Blocks are plain bytes, a poisoned guard is still usable.
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("ordinal", &self.ordinal)
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Accelerator for SimulatedDevice {
    fn name(&self) -> String {
        format!("sim:{}", self.ordinal)
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceAlloc> {
        let mut blocks = self.lock_blocks();
        if let Some(budget) = self.budget {
            let in_use: usize = blocks.values().map(Vec::len).sum();
            if in_use + bytes > budget {
                log::warn!(
                    "{}: allocation of {} bytes exceeds budget ({} of {} in use)",
                    self.name(),
                    bytes,
                    in_use,
                    budget
                );
                return Err(Error::OutOfMemory {
                    device: self.name(),
                    bytes,
                });
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        blocks.insert(id, vec![0u8; bytes]);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceAlloc::new(id, bytes))
    }

    fn free(&self, alloc: &DeviceAlloc) {
        self.lock_blocks().remove(&alloc.id);
    }

    fn upload(&self, src: &[u8], dst: &DeviceAlloc) -> Result<()> {
        let mut blocks = self.lock_blocks();
        let block = blocks
            .get_mut(&dst.id)
            .ok_or_else(|| Error::Device(format!("{}: unknown block {}", self.name(), dst.id)))?;
        if src.len() > block.len() {
            return Err(Error::Device(format!(
                "{}: upload of {} bytes into block of {}",
                self.name(),
                src.len(),
                block.len()
            )));
        }
        block[..src.len()].copy_from_slice(src);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn download(&self, src: &DeviceAlloc, dst: &mut [u8]) -> Result<()> {
        let blocks = self.lock_blocks();
        let block = blocks
            .get(&src.id)
            .ok_or_else(|| Error::Device(format!("{}: unknown block {}", self.name(), src.id)))?;
        if dst.len() > block.len() {
            return Err(Error::Device(format!(
                "{}: download of {} bytes from block of {}",
                self.name(),
                dst.len(),
                block.len()
            )));
        }
        dst.copy_from_slice(&block[..dst.len()]);
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
