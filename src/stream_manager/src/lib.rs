#![deny(missing_docs)]
#![warn(clippy::all)]

//! StreamManager is a software accelerator runtime providing in-order execution
//! streams, device memory, a kernel launch primitive and pitched memory transfers.

mod device_manager;
pub mod event;
pub mod handle;
mod idmap;
pub mod kernel;
pub mod stream;
mod stream_manager;
pub mod transfer;
pub mod utils;

pub use crate::device_manager::current_device;
pub use crate::event::StreamEvent;
pub use crate::handle::Handle;
pub use crate::kernel::{Dim3, KernelBody, KernelLaunch, ThreadContext};
pub use crate::stream::Stream;
pub use crate::stream_manager::StreamManager;
pub use crate::transfer::{CopyKind, CopyRegion};

use std::fmt;

/// Index of a device managed by StreamManager.
pub type DeviceId = usize;
/// Index of a stream, unique across all devices.
pub type StreamId = usize;
/// Address of a device allocation.
pub type DevicePtr = u64;

/// Closure executed by a stream worker as a host task.
pub type HostFn = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// Capabilities of one software device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfig {
    /// Worker threads a kernel launch may spread its blocks over.
    pub compute_units: usize,
    /// Maximum number of threads in one block.
    pub max_work_group_size: usize,
    /// Maximum shared memory bytes per block.
    pub local_mem_size: usize,
    /// Total bytes the device may hand out.
    pub global_mem_size: usize,
    /// Whether 3D pitched transfers are available.
    pub supports_3d_copy: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            compute_units: 4,
            max_work_group_size: 1024,
            local_mem_size: 48 * 1024,
            global_mem_size: 1 << 32,
            supports_3d_copy: true,
        }
    }
}

/// Operation executed in order on a stream.
pub enum StreamOperation {
    /// Launch(kernel)
    Launch(KernelLaunch),
    /// Memcpy(region)
    Memcpy(CopyRegion),
    /// Host(closure)
    Host(HostFn),
}

impl StreamOperation {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            StreamOperation::Launch(_) => "launch",
            StreamOperation::Memcpy(_) => "memcpy",
            StreamOperation::Host(_) => "host",
        }
    }
}

impl fmt::Debug for StreamOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOperation::Launch(launch) => write!(
                f,
                "Launch(grid={:?}, block={:?}, shared={})",
                launch.grid, launch.block, launch.shared_mem
            ),
            StreamOperation::Memcpy(region) => write!(f, "Memcpy({:?})", region),
            StreamOperation::Host(_) => write!(f, "Host"),
        }
    }
}

/// Errors reported by devices and streams.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// No device with this id.
    InvalidDevice(DeviceId),
    /// No stream with this id.
    InvalidStream(StreamId),
    /// Allocation of the given size failed.
    OutOfMemory(usize),
    /// Launch geometry rejected by the device.
    InvalidLaunch(String),
    /// Transfer shape the device cannot express.
    UnsupportedShape(String),
    /// Operation reported failure or panicked.
    TaskFailed(String),
    /// An awaited event failed, the operation was skipped.
    DependencyFailed(String),
    /// The stream worker is gone.
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDevice(id) => write!(f, "invalid device {}", id),
            Error::InvalidStream(id) => write!(f, "invalid stream {}", id),
            Error::OutOfMemory(size) => write!(f, "out of memory allocating {} bytes", size),
            Error::InvalidLaunch(msg) => write!(f, "invalid launch: {}", msg),
            Error::UnsupportedShape(msg) => write!(f, "unsupported transfer shape: {}", msg),
            Error::TaskFailed(msg) => write!(f, "task failed: {}", msg),
            Error::DependencyFailed(msg) => write!(f, "dependency failed: {}", msg),
            Error::Disconnected => write!(f, "stream worker disconnected"),
        }
    }
}

impl std::error::Error for Error {}
