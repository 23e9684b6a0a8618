use std::fmt;
use std::sync::Arc;

use crate::device::{Accelerator, DeviceAlloc};
use crate::dtype::WithDType;
use crate::error::{Error, Result};

// SyncedBuffer: one block of typed data mirrored between host and device
//
// STATE MACHINE:
//
//   Uninitialized --host read/write--> HostFresh
//   Uninitialized --device read/write--> DeviceFresh   (zero-filled)
//   HostFresh     --device read--> Synced  (one upload)
//   DeviceFresh   --host read--> Synced    (one download)
//   any           --host write--> HostFresh
//   any           --device write--> DeviceFresh
//
// A side is allocated the first time it is touched and copied into only when
// the other side is strictly fresher, so each staleness transition costs at
// most one transfer. Read accessors never invalidate the side they copied
// from; write accessors make their side the sole source of truth.
//
// Reads take &mut self because a read may have to materialize a copy.

/// Which copy of a [`SyncedBuffer`] is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Neither side has been allocated.
    Uninitialized,
    /// The host copy is the only current one.
    HostFresh,
    /// The device copy is the only current one.
    DeviceFresh,
    /// Both copies exist and are bit-identical.
    Synced,
}

/// A fixed-length block of `T` with lazily synchronized host and device copies.
pub struct SyncedBuffer<T: WithDType> {
    len: usize,
    host: Option<Vec<T>>,
    device: Option<DeviceAlloc>,
    own_device: bool,
    accelerator: Option<Arc<dyn Accelerator>>,
    state: SyncState,
}

impl<T: WithDType> SyncedBuffer<T> {
    /// Create a buffer of `len` elements. Nothing is allocated until first access.
    pub fn new(len: usize, accelerator: Option<Arc<dyn Accelerator>>) -> Self {
        SyncedBuffer {
            len,
            host: None,
            device: None,
            own_device: false,
            accelerator,
            state: SyncState::Uninitialized,
        }
    }

    /// A buffer with no device side.
    pub fn host_only(len: usize) -> Self {
        Self::new(len, None)
    }

    // Accessors

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_size(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accelerator.as_ref()
    }

    // Host side

    /// Current host contents, downloading from the device if it is fresher.
    pub fn host_data(&mut self) -> Result<&[T]> {
        self.to_host()?;
        Ok(self.host_slot().as_slice())
    }

    /// Writable host contents. Marks the host as the only fresh copy.
    pub fn mutable_host_data(&mut self) -> Result<&mut [T]> {
        self.to_host()?;
        self.state = SyncState::HostFresh;
        Ok(self.host_slot().as_mut_slice())
    }

    /// Adopt `data` as the host copy without copying it.
    ///
    /// The previous host allocation, if any, is released.
    pub fn set_host_data(&mut self, data: Vec<T>) -> Result<()> {
        if data.len() != self.len {
            return Err(Error::BufferSize {
                expected: self.len,
                got: data.len(),
            });
        }
        self.host = Some(data);
        self.state = SyncState::HostFresh;
        Ok(())
    }

    // Device side

    /// Current device block, uploading from the host if it is fresher.
    pub fn device_data(&mut self) -> Result<&DeviceAlloc> {
        self.to_device()?;
        self.device_slot()
    }

    /// Writable device block. Marks the device as the only fresh copy.
    pub fn mutable_device_data(&mut self) -> Result<&DeviceAlloc> {
        self.to_device()?;
        self.state = SyncState::DeviceFresh;
        self.device_slot()
    }

    /// Adopt an externally owned device block without copying it.
    ///
    /// The block is not freed when this buffer is dropped. A previously owned
    /// block is released.
    pub fn set_device_data(&mut self, alloc: DeviceAlloc) -> Result<()> {
        let accel = self.accelerator.clone().ok_or(Error::NoAccelerator)?;
        if alloc.bytes() < self.byte_size() {
            return Err(Error::BufferSize {
                expected: self.byte_size(),
                got: alloc.bytes(),
            });
        }
        if let Some(old) = self.device.take() {
            if self.own_device {
                accel.free(&old);
            }
        }
        self.device = Some(alloc);
        self.own_device = false;
        self.state = SyncState::DeviceFresh;
        Ok(())
    }

    // Transitions

    fn to_host(&mut self) -> Result<()> {
        match self.state {
            SyncState::Uninitialized => {
                self.host_slot();
                self.state = SyncState::HostFresh;
            }
            SyncState::DeviceFresh => {
                let len = self.len;
                let host = self.host.get_or_insert_with(|| vec![T::zero(); len]);
                let (accel, device) = match (&self.accelerator, &self.device) {
                    (Some(a), Some(d)) => (a, d),
                    _ => return Err(Error::Device("device-fresh buffer has no device block".into())),
                };
                accel.download(device, bytemuck::cast_slice_mut(host.as_mut_slice()))?;
                self.state = SyncState::Synced;
            }
            SyncState::HostFresh | SyncState::Synced => {}
        }
        Ok(())
    }

    fn to_device(&mut self) -> Result<()> {
        let accel = self.accelerator.clone().ok_or(Error::NoAccelerator)?;
        match self.state {
            SyncState::Uninitialized => {
                self.ensure_device(&accel)?;
                self.state = SyncState::DeviceFresh;
            }
            SyncState::HostFresh => {
                self.ensure_device(&accel)?;
                let (host, device) = match (&self.host, &self.device) {
                    (Some(h), Some(d)) => (h, d),
                    _ => return Err(Error::Device("host-fresh buffer has no host copy".into())),
                };
                accel.upload(bytemuck::cast_slice(host.as_slice()), device)?;
                self.state = SyncState::Synced;
            }
            SyncState::DeviceFresh | SyncState::Synced => {}
        }
        Ok(())
    }

    fn ensure_device(&mut self, accel: &Arc<dyn Accelerator>) -> Result<()> {
        if self.device.is_none() {
            let block = accel.alloc(self.byte_size())?;
            log::trace!("{}: allocated {} bytes", accel.name(), block.bytes());
            self.device = Some(block);
            self.own_device = true;
        }
        Ok(())
    }

    fn host_slot(&mut self) -> &mut Vec<T> {
        let len = self.len;
        self.host.get_or_insert_with(|| vec![T::zero(); len])
    }

    fn device_slot(&self) -> Result<&DeviceAlloc> {
        self.device.as_ref().ok_or(Error::NoAccelerator)
    }
}

impl<T: WithDType> Drop for SyncedBuffer<T> {
    fn drop(&mut self) {
        if let (Some(accel), Some(block)) = (&self.accelerator, &self.device) {
            if self.own_device {
                accel.free(block);
            }
        }
    }
}

impl<T: WithDType> fmt::Debug for SyncedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedBuffer")
            .field("len", &self.len)
            .field("state", &self.state)
            .field("device", &self.accelerator.as_ref().map(|a| a.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;

    fn sim() -> (Arc<SimulatedDevice>, Arc<dyn Accelerator>) {
        let dev = Arc::new(SimulatedDevice::new(0));
        let accel: Arc<dyn Accelerator> = dev.clone();
        (dev, accel)
    }

    #[test]
    fn test_host_read_initializes_zeroed() -> Result<()> {
        let mut buf = SyncedBuffer::<f32>::host_only(4);
        assert_eq!(buf.state(), SyncState::Uninitialized);
        assert_eq!(buf.host_data()?, &[0.0; 4]);
        assert_eq!(buf.state(), SyncState::HostFresh);
        Ok(())
    }

    #[test]
    fn test_device_requires_accelerator() {
        let mut buf = SyncedBuffer::<f32>::host_only(4);
        assert!(matches!(buf.device_data(), Err(Error::NoAccelerator)));
        assert!(matches!(buf.mutable_device_data(), Err(Error::NoAccelerator)));
        assert_eq!(buf.state(), SyncState::Uninitialized);
    }

    #[test]
    fn test_host_write_then_device_read_uploads_once() -> Result<()> {
        let (dev, accel) = sim();
        let mut buf = SyncedBuffer::<f32>::new(3, Some(accel));
        buf.mutable_host_data()?.copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(buf.state(), SyncState::HostFresh);

        buf.device_data()?;
        assert_eq!(buf.state(), SyncState::Synced);
        buf.device_data()?;
        buf.host_data()?;
        assert_eq!(buf.state(), SyncState::Synced);

        let stats = dev.stats();
        assert_eq!(stats.uploads, 1);
        assert_eq!(stats.downloads, 0);
        Ok(())
    }

    #[test]
    fn test_device_write_then_host_read_downloads_once() -> Result<()> {
        let (dev, accel) = sim();
        let mut buf = SyncedBuffer::<f64>::new(2, Some(accel.clone()));
        let block = buf.mutable_device_data()?.clone();
        assert_eq!(buf.state(), SyncState::DeviceFresh);

        let values = [1.5f64, -2.5];
        accel.upload(bytemuck::cast_slice(&values), &block)?;

        assert_eq!(buf.host_data()?, &values);
        assert_eq!(buf.state(), SyncState::Synced);
        assert_eq!(buf.host_data()?, &values);
        assert_eq!(dev.stats().downloads, 1);
        Ok(())
    }

    #[test]
    fn test_mutation_invalidates_other_side() -> Result<()> {
        let (dev, accel) = sim();
        let mut buf = SyncedBuffer::<f32>::new(2, Some(accel));
        buf.mutable_host_data()?.copy_from_slice(&[1.0, 1.0]);
        buf.device_data()?;
        assert_eq!(buf.state(), SyncState::Synced);

        buf.mutable_host_data()?[0] = 7.0;
        assert_eq!(buf.state(), SyncState::HostFresh);
        buf.device_data()?;
        assert_eq!(dev.stats().uploads, 2);

        buf.mutable_device_data()?;
        assert_eq!(buf.state(), SyncState::DeviceFresh);
        assert_eq!(buf.host_data()?, &[7.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_uninitialized_device_is_zeroed() -> Result<()> {
        let (_dev, accel) = sim();
        let mut buf = SyncedBuffer::<f32>::new(5, Some(accel));
        buf.device_data()?;
        assert_eq!(buf.state(), SyncState::DeviceFresh);
        assert_eq!(buf.host_data()?, &[0.0; 5]);
        Ok(())
    }

    #[test]
    fn test_set_host_data_adopts_without_copy() -> Result<()> {
        let (dev, accel) = sim();
        let mut buf = SyncedBuffer::<f32>::new(3, Some(accel));
        assert!(matches!(
            buf.set_host_data(vec![1.0; 2]),
            Err(Error::BufferSize { expected: 3, got: 2 })
        ));

        let data = vec![4.0f32, 5.0, 6.0];
        let ptr = data.as_ptr();
        buf.set_host_data(data)?;
        assert_eq!(buf.state(), SyncState::HostFresh);
        assert_eq!(buf.host_data()?.as_ptr(), ptr);
        assert_eq!(dev.stats().uploads, 0);
        Ok(())
    }

    #[test]
    fn test_adopted_device_block_outlives_buffer() -> Result<()> {
        let (dev, accel) = sim();
        let external = accel.alloc(16)?;
        accel.upload(bytemuck::cast_slice(&[3.0f32, 4.0]), &external)?;
        {
            let mut buf = SyncedBuffer::<f32>::new(2, Some(accel.clone()));
            buf.set_device_data(external.clone())?;
            assert_eq!(buf.state(), SyncState::DeviceFresh);
            assert_eq!(buf.host_data()?, &[3.0, 4.0]);
        }
        assert_eq!(dev.stats().live_blocks, 1);

        {
            let mut owned = SyncedBuffer::<f32>::new(2, Some(accel.clone()));
            owned.device_data()?;
            assert_eq!(dev.stats().live_blocks, 2);
        }
        assert_eq!(dev.stats().live_blocks, 1);
        Ok(())
    }

    #[test]
    fn test_device_oom_leaves_host_usable() -> Result<()> {
        let dev = Arc::new(SimulatedDevice::new(0).with_budget(8));
        let mut buf = SyncedBuffer::<f32>::new(4, Some(dev as Arc<dyn Accelerator>));
        buf.mutable_host_data()?[0] = 2.0;

        let err = buf.device_data().unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(buf.state(), SyncState::HostFresh);
        assert_eq!(buf.host_data()?[0], 2.0);
        Ok(())
    }
}
