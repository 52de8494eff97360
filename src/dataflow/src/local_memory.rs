//! Work-group local memory carved out of the launch's shared memory.

use std::{marker::PhantomData, mem};

/// Context that can reach the shared memory of the current work-group.
pub trait LocalScope {
    /// Start of the work-group's shared memory.
    fn local_base(&self) -> *mut u8;
    /// Bytes of shared memory.
    fn local_len(&self) -> usize;
}

/// Hands out offsets in the shared memory of one command group's launch.
#[derive(Debug, Default)]
pub(crate) struct LocalMemoryAllocator {
    size: usize,
}

impl LocalMemoryAllocator {
    pub fn alloc<T>(&mut self, count: usize) -> LocalAccessor<T> {
        let align = mem::align_of::<T>();
        let offset = (self.size + align - 1) / align * align;
        self.size = offset + count * mem::size_of::<T>();
        LocalAccessor {
            offset,
            len: count,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Array of `T` in work-group local memory, shared by the items of one group and
/// zeroed at the start of every group.
pub struct LocalAccessor<T> {
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for LocalAccessor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LocalAccessor<T> {}

impl<T: Copy> LocalAccessor<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no element.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn element<S: LocalScope>(&self, scope: &S, i: usize) -> *mut T {
        assert!(i < self.len, "local index {} out of {}", i, self.len);
        assert!(
            self.offset + self.len * mem::size_of::<T>() <= scope.local_len(),
            "local memory was not reserved by this command group"
        );
        unsafe { scope.local_base().add(self.offset).cast::<T>().add(i) }
    }

    /// Read element `i`.
    pub fn get<S: LocalScope>(&self, scope: &S, i: usize) -> T {
        unsafe { *self.element(scope, i) }
    }

    /// Write element `i`.
    pub fn set<S: LocalScope>(&self, scope: &S, i: usize, value: T) {
        unsafe { *self.element(scope, i) = value }
    }
}
