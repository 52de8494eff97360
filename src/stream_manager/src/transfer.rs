//! Raw transfer primitive for linear, 2D pitched and 3D pitched byte ranges.

use crate::Error;
use std::ptr;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    /// host to host
    HostToHost,
    /// host to device
    HostToDevice,
    /// device to host
    DeviceToHost,
    /// device to device
    DeviceToDevice,
}

impl CopyKind {
    /// Whether the destination is host memory.
    pub fn to_host(&self) -> bool {
        matches!(self, CopyKind::HostToHost | CopyKind::DeviceToHost)
    }

    /// Whether the source is host memory.
    pub fn from_host(&self) -> bool {
        matches!(self, CopyKind::HostToHost | CopyKind::HostToDevice)
    }
}

/// A byte range to transfer. Rows are `width` bytes, `height` rows form a slice and
/// `depth` slices form the region. Pitches are the distance in bytes between rows and
/// slices at the source and the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Direction
    pub kind: CopyKind,
    /// Source address
    pub src: u64,
    /// Source row pitch
    pub src_pitch: usize,
    /// Source slice pitch
    pub src_slice_pitch: usize,
    /// Destination address
    pub dst: u64,
    /// Destination row pitch
    pub dst_pitch: usize,
    /// Destination slice pitch
    pub dst_slice_pitch: usize,
    /// Bytes per row
    pub width: usize,
    /// Rows per slice
    pub height: usize,
    /// Slices
    pub depth: usize,
}

impl CopyRegion {
    /// Contiguous transfer of `bytes`.
    pub fn linear(kind: CopyKind, dst: u64, src: u64, bytes: usize) -> Self {
        CopyRegion {
            kind,
            src,
            src_pitch: bytes,
            src_slice_pitch: bytes,
            dst,
            dst_pitch: bytes,
            dst_slice_pitch: bytes,
            width: bytes,
            height: 1,
            depth: 1,
        }
    }

    /// `height` rows of `width` bytes.
    pub fn pitched_2d(
        kind: CopyKind,
        dst: u64,
        dst_pitch: usize,
        src: u64,
        src_pitch: usize,
        width: usize,
        height: usize,
    ) -> Self {
        CopyRegion {
            kind,
            src,
            src_pitch,
            src_slice_pitch: src_pitch * height,
            dst,
            dst_pitch,
            dst_slice_pitch: dst_pitch * height,
            width,
            height,
            depth: 1,
        }
    }

    /// `depth` slices of `height` rows of `width` bytes. `*_rows` is the number of rows
    /// in one slice of the surrounding allocation.
    #[allow(clippy::too_many_arguments)]
    pub fn pitched_3d(
        kind: CopyKind,
        dst: u64,
        dst_pitch: usize,
        dst_rows: usize,
        src: u64,
        src_pitch: usize,
        src_rows: usize,
        width: usize,
        height: usize,
        depth: usize,
    ) -> Self {
        CopyRegion {
            kind,
            src,
            src_pitch,
            src_slice_pitch: src_pitch * src_rows,
            dst,
            dst_pitch,
            dst_slice_pitch: dst_pitch * dst_rows,
            width,
            height,
            depth,
        }
    }

    /// Dimensionality of the shape.
    pub fn dimensions(&self) -> usize {
        if self.depth > 1 {
            3
        } else if self.height > 1 {
            2
        } else {
            1
        }
    }

    /// Bytes moved.
    pub fn bytes(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Reject shapes that would overlap rows or slices instead of truncating them.
    pub fn validate(&self) -> Result<(), Error> {
        if self.bytes() == 0 {
            return Ok(());
        }
        if self.src == 0 || self.dst == 0 {
            return Err(Error::UnsupportedShape("null address".to_string()));
        }
        if self.height > 1 && (self.width > self.src_pitch || self.width > self.dst_pitch) {
            return Err(Error::UnsupportedShape(format!(
                "row of {} bytes wider than pitch (src {}, dst {})",
                self.width, self.src_pitch, self.dst_pitch
            )));
        }
        if self.depth > 1
            && (self.src_pitch * self.height > self.src_slice_pitch
                || self.dst_pitch * self.height > self.dst_slice_pitch)
        {
            return Err(Error::UnsupportedShape(format!(
                "slice of {} rows taller than slice pitch (src {}, dst {})",
                self.height, self.src_slice_pitch, self.dst_slice_pitch
            )));
        }
        Ok(())
    }
}

/// Perform the transfer synchronously.
///
/// # Safety
///
/// Both address ranges described by `region` must be valid for the whole transfer and
/// must not be accessed by anyone else meanwhile.
pub unsafe fn copy(region: &CopyRegion) -> Result<(), Error> {
    region.validate()?;
    let src = region.src as usize as *const u8;
    let dst = region.dst as usize as *mut u8;
    for z in 0..region.depth {
        for y in 0..region.height {
            let src_row = src.add(z * region.src_slice_pitch + y * region.src_pitch);
            let dst_row = dst.add(z * region.dst_slice_pitch + y * region.dst_pitch);
            ptr::copy(src_row, dst_row, region.width);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn address<T>(v: &[T]) -> u64 {
        v.as_ptr() as u64
    }

    #[test]
    fn test_linear() {
        let src = (0..16u8).collect::<Vec<_>>();
        let mut dst = vec![0u8; 16];
        let region = CopyRegion::linear(
            CopyKind::HostToHost,
            dst.as_mut_ptr() as u64,
            address(&src),
            16,
        );
        assert_eq!(region.dimensions(), 1);
        unsafe { copy(&region).unwrap() };
        assert_eq!(src, dst);
    }

    #[test]
    fn test_pitched_2d() {
        // 4x4 source, copy the 2x3 block starting at row 1, column 1 into a 3 wide target
        let src = (0..16u8).collect::<Vec<_>>();
        let mut dst = vec![0u8; 6];
        let region = CopyRegion::pitched_2d(
            CopyKind::DeviceToHost,
            dst.as_mut_ptr() as u64,
            3,
            address(&src) + 5,
            4,
            3,
            2,
        );
        assert_eq!(region.dimensions(), 2);
        unsafe { copy(&region).unwrap() };
        assert_eq!(dst, vec![5, 6, 7, 9, 10, 11]);
    }

    #[test]
    fn test_pitched_3d() {
        // 2x2x2 corner of a 3x3x3 cube
        let src = (0..27u8).collect::<Vec<_>>();
        let mut dst = vec![0u8; 8];
        let region = CopyRegion::pitched_3d(
            CopyKind::DeviceToDevice,
            dst.as_mut_ptr() as u64,
            2,
            2,
            address(&src),
            3,
            3,
            2,
            2,
            2,
        );
        assert_eq!(region.dimensions(), 3);
        unsafe { copy(&region).unwrap() };
        assert_eq!(dst, vec![0, 1, 3, 4, 9, 10, 12, 13]);
    }

    #[test]
    fn test_reject_overlapping_rows() {
        let src = vec![0u8; 16];
        let mut dst = vec![0u8; 16];
        let region = CopyRegion::pitched_2d(
            CopyKind::HostToDevice,
            dst.as_mut_ptr() as u64,
            2,
            address(&src),
            4,
            4,
            4,
        );
        assert!(matches!(
            unsafe { copy(&region) },
            Err(Error::UnsupportedShape(_))
        ));
        assert!(CopyKind::HostToDevice.from_host());
        assert!(!CopyKind::HostToDevice.to_host());
    }
}
