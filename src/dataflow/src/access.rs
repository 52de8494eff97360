//! Access modes and targets.
//!
//! Modes and targets are marker types so that capability violations, like copying
//! out of a write-only accessor, are rejected by the compiler.

use stream_manager::{CopyKind, DeviceId};

/// Runtime value of an access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessMode {
    /// read
    Read,
    /// write
    Write,
    /// read_write
    ReadWrite,
    /// discard_write
    DiscardWrite,
    /// discard_read_write
    DiscardReadWrite,
}

impl AccessMode {
    /// Every mode except `Read` conflicts with any other access.
    pub fn is_write(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }

    /// Whether the previous contents must be present at the accessed location.
    pub fn needs_data(&self) -> bool {
        !matches!(self, AccessMode::DiscardWrite | AccessMode::DiscardReadWrite)
    }
}

/// Where an access touches the buffer's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// host copy
    Host,
    /// copy on a device
    Device(DeviceId),
}

impl Location {
    /// Whether this is the host copy.
    pub fn is_host(&self) -> bool {
        matches!(self, Location::Host)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Access mode marker.
pub trait Mode: sealed::Sealed + Send + Sync + 'static {
    /// runtime value
    const MODE: AccessMode;
}

/// Modes that may read.
pub trait Readable: Mode {}
/// Modes that may write.
pub trait Writable: Mode {}
/// Modes a copy may read from.
pub trait CopySource: Readable {}

macro_rules! mode {
    ($name:ident, $mode:ident, $doc:literal $(, $capability:ident)*) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl Mode for $name {
            const MODE: AccessMode = AccessMode::$mode;
        }

        $(impl $capability for $name {})*
    };
}

mode!(Read, Read, "read", Readable, CopySource);
mode!(Write, Write, "write", Writable);
mode!(ReadWrite, ReadWrite, "read_write", Readable, Writable, CopySource);
mode!(DiscardWrite, DiscardWrite, "discard_write", Writable);
mode!(DiscardReadWrite, DiscardReadWrite, "discard_read_write", Readable, Writable);

/// Access target marker.
pub trait Target: sealed::Sealed + Send + Sync + 'static {
    /// Whether accesses run on the host side.
    const IS_HOST: bool;

    /// Location touched by an access submitted to `device_id`.
    fn location(device_id: DeviceId) -> Location {
        if Self::IS_HOST {
            Location::Host
        } else {
            Location::Device(device_id)
        }
    }
}

/// Targets a copy may read from or write to.
pub trait CopyTarget: Target {}

/// Device global memory.
#[derive(Debug, Clone, Copy)]
pub struct GlobalBuffer;
/// Device memory read through the constant path.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBuffer;
/// The host copy of the buffer, accessed inside a command group.
#[derive(Debug, Clone, Copy)]
pub struct HostBuffer;

impl sealed::Sealed for GlobalBuffer {}
impl sealed::Sealed for ConstantBuffer {}
impl sealed::Sealed for HostBuffer {}

impl Target for GlobalBuffer {
    const IS_HOST: bool = false;
}
impl Target for ConstantBuffer {
    const IS_HOST: bool = false;
}
impl Target for HostBuffer {
    const IS_HOST: bool = true;
}

impl CopyTarget for GlobalBuffer {}
impl CopyTarget for HostBuffer {}

/// Transfer direction between two sides.
pub fn copy_kind(src_is_host: bool, dst_is_host: bool) -> CopyKind {
    match (src_is_host, dst_is_host) {
        (true, true) => CopyKind::HostToHost,
        (true, false) => CopyKind::HostToDevice,
        (false, true) => CopyKind::DeviceToHost,
        (false, false) => CopyKind::DeviceToDevice,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kind<S: CopyTarget, D: CopyTarget>() -> CopyKind {
        copy_kind(S::IS_HOST, D::IS_HOST)
    }

    #[test]
    fn test_modes() {
        assert!(!Read::MODE.is_write());
        assert!(DiscardWrite::MODE.is_write());
        assert!(!DiscardReadWrite::MODE.needs_data());
        assert!(Write::MODE.needs_data());
        assert_eq!(ReadWrite::MODE, AccessMode::ReadWrite);
    }

    #[test]
    fn test_copy_kind() {
        assert_eq!(kind::<GlobalBuffer, HostBuffer>(), CopyKind::DeviceToHost);
        assert_eq!(kind::<HostBuffer, GlobalBuffer>(), CopyKind::HostToDevice);
        assert_eq!(kind::<GlobalBuffer, GlobalBuffer>(), CopyKind::DeviceToDevice);
        assert_eq!(HostBuffer::location(2), Location::Host);
        assert_eq!(ConstantBuffer::location(2), Location::Device(2));
    }
}
