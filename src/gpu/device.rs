//! Emulated devices and their memory.

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::error::{setup_error, Result};
use crate::gpu::queue::CommandQueue;
use crate::gpu::{GLOBAL_MEM_BYTES, LOCAL_MEM_BYTES, MAX_GROUP_SIZE};

/// Static properties of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    /// Global memory in bytes.
    pub global_mem: usize,
    /// Local memory per work-group in bytes.
    pub local_mem: usize,
    pub max_group_size: usize,
}

struct DeviceState {
    info: DeviceInfo,
    allocated: AtomicUsize,
}

/// Handle to one emulated device. Clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    state: Arc<DeviceState>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.state.info)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

impl Device {
    fn new(info: DeviceInfo) -> Self {
        Device {
            state: Arc::new(DeviceState {
                info,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.state.info
    }

    pub fn id(&self) -> usize {
        self.state.info.id
    }

    /// Bytes currently held by live buffers of this device.
    pub fn allocated_bytes(&self) -> usize {
        self.state.allocated.load(Ordering::SeqCst)
    }

    /// Allocates `len` elements of `T::default()`.
    pub fn alloc<T>(&self, len: usize) -> Result<DeviceBuffer<T>>
    where
        T: Copy + Default + Send + Sync,
    {
        self.alloc_filled(len, T::default())
    }

    /// Allocates `len` elements initialised to `fill`.
    ///
    /// Fails with a setup error when the device's global memory would be
    /// exceeded.
    pub fn alloc_filled<T>(&self, len: usize, fill: T) -> Result<DeviceBuffer<T>>
    where
        T: Copy + Send + Sync,
    {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| setup_error(self.info().name.clone(), "allocation size overflows"))?;
        let capacity = self.info().global_mem;
        self.state
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .map_err(|used| {
                setup_error(
                    self.info().name.clone(),
                    format!("cannot allocate {bytes} bytes, {used} of {capacity} in use"),
                )
            })?;

        Ok(DeviceBuffer {
            inner: Arc::new(BufferInner {
                data: RwLock::new(vec![fill; len]),
                len,
                bytes,
                device: Arc::clone(&self.state),
            }),
        })
    }
}

/// Discovers the emulated devices.
#[derive(Debug)]
pub struct Platform {
    devices: Vec<Device>,
}

impl Platform {
    /// Exposes `count` identical devices.
    pub fn discover(count: usize) -> Result<Self> {
        Self::with_global_mem(count, GLOBAL_MEM_BYTES)
    }

    /// Exposes `count` devices with `global_mem` bytes each.
    pub fn with_global_mem(count: usize, global_mem: usize) -> Result<Self> {
        if count == 0 {
            return Err(setup_error("platform", "no devices available"));
        }
        let devices = (0..count)
            .map(|id| {
                Device::new(DeviceInfo {
                    id,
                    name: format!("emulated-gpu-{id}"),
                    global_mem,
                    local_mem: LOCAL_MEM_BYTES,
                    max_group_size: MAX_GROUP_SIZE,
                })
            })
            .collect();
        Ok(Platform { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

struct BufferInner<T> {
    data: RwLock<Vec<T>>,
    len: usize,
    bytes: usize,
    device: Arc<DeviceState>,
}

impl<T> Drop for BufferInner<T> {
    fn drop(&mut self) {
        self.device.allocated.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// A device allocation. Clones share the allocation, which is returned to the
/// device when the last handle is dropped.
pub struct DeviceBuffer<T> {
    inner: Arc<BufferInner<T>>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        DeviceBuffer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.inner.device.info.id)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl<T> DeviceBuffer<T> {
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn device_id(&self) -> usize {
        self.inner.device.info.id
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation<U>(&self, other: &DeviceBuffer<U>) -> bool {
        Arc::as_ptr(&self.inner) as *const () == Arc::as_ptr(&other.inner) as *const ()
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        self.inner
            .data
            .read()
            .map_err(|_| setup_error(self.inner.device.info.name.clone(), "buffer lock poisoned"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        self.inner
            .data
            .write()
            .map_err(|_| setup_error(self.inner.device.info.name.clone(), "buffer lock poisoned"))
    }
}

/// Devices of a platform with one in-order queue each.
///
/// Dropping the context drains and joins every queue.
pub struct Context {
    devices: Vec<Device>,
    queues: Vec<CommandQueue>,
}

impl Context {
    pub fn new(device_count: usize) -> Result<Self> {
        Self::from_platform(Platform::discover(device_count)?)
    }

    pub fn from_platform(platform: Platform) -> Result<Self> {
        let devices = platform.devices;
        let queues = devices
            .iter()
            .map(|d| CommandQueue::new(d.clone()))
            .collect::<Result<Vec<_>>>()?;
        info!(devices = devices.len(), "compute context ready");
        Ok(Context { devices, queues })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn queues(&self) -> &[CommandQueue] {
        &self.queues
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Waits until every queue has drained.
    pub fn finish(&self) -> Result<()> {
        for queue in &self.queues {
            queue.finish()?;
        }
        debug!("all queues drained");
        Ok(())
    }
}
