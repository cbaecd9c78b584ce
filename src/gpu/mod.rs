//! Emulated accelerator backend.
//!
//! The device model mirrors a GPU compute API closely enough that the kernels
//! keep their shape: a [`Platform`] exposes [`Device`]s, buffers are explicit
//! [`DeviceBuffer`] allocations, and all work goes through in-order
//! [`CommandQueue`]s whose commands complete [`Event`]s and take explicit wait
//! lists.
//!
//! Kernels execute as a 2-D grid of work-groups. Inside a group, lanes run in
//! lockstep phases separated by [`WorkGroup::barrier`]; groups are independent
//! and run in parallel on the rayon pool.

pub mod device;
pub mod engine;
pub mod kernels;
pub mod queue;
pub mod search;
pub mod workgroup;

pub use device::{Context, Device, DeviceBuffer, DeviceInfo, Platform};
pub use engine::GpuEngine;
pub use kernels::{ArgMinReduction, Kernel, Tiled16MatMul, TiledMatMul, Transpose};
pub use queue::{CommandQueue, Event, PendingLaunch, PendingRead};
pub use search::GpuNearest;
pub use workgroup::{LaunchStats, NDRange, WorkGroup};

/// Largest work-group the emulated devices accept.
pub const MAX_GROUP_SIZE: usize = 256;

/// Local memory available to one work-group, in bytes.
pub const LOCAL_MEM_BYTES: usize = 48 * 1024;

/// Global memory of one emulated device, in bytes.
pub const GLOBAL_MEM_BYTES: usize = 1 << 30;

/// Width of the arg-min reduction work-group.
pub const REDUCTION_WIDTH: usize = 256;
