//! Basic utils

use crate::Error;
use std::{
    alloc::{self, Layout},
    any::Any,
    ptr::NonNull,
    slice,
};

/// Zero-initialized host allocation aligned to [`HostMemory::ALIGNMENT`].
/// Backs both device allocations and the host copies of buffers.
pub struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: HostMemory owns its allocation exclusively; concurrent access to the bytes is
// ordered by the stream or the task graph that hands out the address.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Alignment of every allocation.
    pub const ALIGNMENT: usize = 64;

    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Result<Self, Error> {
        let layout = Layout::from_size_align(len.max(1), Self::ALIGNMENT)
            .map_err(|_| Error::OutOfMemory(len))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::OutOfMemory(len))?;
        Ok(HostMemory { ptr, len, layout })
    }

    /// Start address.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Start address for writing. Writers must be ordered with other users of the memory.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Start address as an integer.
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View as bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Reset every byte to zero.
    pub fn zero(&mut self) {
        self.as_mut_slice().iter_mut().for_each(|b| *b = 0);
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_memory() {
        let mut memory = HostMemory::zeroed(100).unwrap();
        assert_eq!(memory.len(), 100);
        assert_eq!(memory.address() % HostMemory::ALIGNMENT as u64, 0);
        assert!(memory.as_slice().iter().all(|&b| b == 0));
        memory.as_mut_slice()[42] = 7;
        assert_eq!(memory.as_slice()[42], 7);
        memory.zero();
        assert_eq!(memory.as_slice()[42], 0);
        let empty = HostMemory::zeroed(0).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload), "boom");
        let payload = std::panic::catch_unwind(|| panic!("{}", 3)).unwrap_err();
        assert_eq!(panic_message(payload), "3");
    }
}
