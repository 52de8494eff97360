//! Typed views of a buffer. An accessor carries the mode and target it was created
//! with as type parameters and resolves back to its owning buffer.

use crate::{
    access::{AccessMode, Mode, Readable, Target, Writable},
    buffer::{BufferId, BufferImpl, Element},
    range::{Id, Range},
    task_graph::TaskNode,
};
use std::{
    fmt,
    marker::PhantomData,
    ops::Index,
    slice,
    sync::Arc,
};

/// Accessor bound to a command group.
pub struct Accessor<T, const D: usize, M, Tg> {
    buffer: Arc<BufferImpl>,
    base: *mut T,
    buffer_range: Range<D>,
    range: Range<D>,
    offset: Id<D>,
    handler_id: usize,
    placeholder: bool,
    _marker: PhantomData<(M, Tg)>,
}

// SAFETY: the task graph orders every task that dereferences `base` against the
// other accesses to the same buffer.
unsafe impl<T: Send + Sync, const D: usize, M: Mode, Tg: Target> Send for Accessor<T, D, M, Tg> {}
unsafe impl<T: Send + Sync, const D: usize, M: Mode, Tg: Target> Sync for Accessor<T, D, M, Tg> {}

impl<T: Element, const D: usize, M: Mode, Tg: Target> Accessor<T, D, M, Tg> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        buffer: Arc<BufferImpl>,
        base: *mut T,
        buffer_range: Range<D>,
        range: Range<D>,
        offset: Id<D>,
        handler_id: usize,
        placeholder: bool,
    ) -> Self {
        Accessor {
            buffer,
            base,
            buffer_range,
            range,
            offset,
            handler_id,
            placeholder,
            _marker: PhantomData,
        }
    }

    /// Accessed extent.
    pub fn range(&self) -> Range<D> {
        self.range
    }

    /// First accessed element, in buffer coordinates.
    pub fn offset(&self) -> Id<D> {
        self.offset
    }

    /// Number of accessed elements.
    pub fn count(&self) -> usize {
        self.range.size()
    }

    /// Extent of the whole buffer.
    pub fn buffer_range(&self) -> Range<D> {
        self.buffer_range
    }

    /// Resolve the accessor to the buffer it views.
    pub fn owning_buffer(&self) -> BufferId {
        self.buffer.id()
    }

    /// Access mode
    pub fn mode(&self) -> AccessMode {
        M::MODE
    }

    /// Whether the accessor was bound from a placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub(crate) fn buffer(&self) -> &Arc<BufferImpl> {
        &self.buffer
    }

    pub(crate) fn handler_id(&self) -> usize {
        self.handler_id
    }

    pub(crate) fn address(&self) -> u64 {
        self.base as u64
    }

    fn element(&self, id: Id<D>) -> *mut T {
        assert!(
            self.buffer_range.contains(id),
            "{:?} outside of buffer {:?}",
            id.as_array(),
            self.buffer_range.as_array()
        );
        // SAFETY: `id` lies inside the buffer
        unsafe { self.base.add(self.buffer_range.linearize(id)) }
    }
}

impl<T: Element, const D: usize, M: Readable, Tg: Target> Accessor<T, D, M, Tg> {
    /// Read the element at `id`.
    pub fn get<I: Into<Id<D>>>(&self, id: I) -> T {
        unsafe { *self.element(id.into()) }
    }
}

impl<T: Element, const D: usize, M: Writable, Tg: Target> Accessor<T, D, M, Tg> {
    /// Write the element at `id`.
    pub fn set<I: Into<Id<D>>>(&self, id: I, value: T) {
        unsafe { *self.element(id.into()) = value }
    }
}

impl<T: Element, const D: usize, M: Readable, Tg: Target> Index<Id<D>> for Accessor<T, D, M, Tg> {
    type Output = T;

    fn index(&self, id: Id<D>) -> &T {
        unsafe { &*self.element(id) }
    }
}

impl<T: Element, M: Readable, Tg: Target> Index<usize> for Accessor<T, 1, M, Tg> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        unsafe { &*self.element(Id::new([i])) }
    }
}

impl<T, const D: usize, M, Tg> Clone for Accessor<T, D, M, Tg> {
    fn clone(&self) -> Self {
        Accessor {
            buffer: Arc::clone(&self.buffer),
            base: self.base,
            buffer_range: self.buffer_range,
            range: self.range,
            offset: self.offset,
            handler_id: self.handler_id,
            placeholder: self.placeholder,
            _marker: PhantomData,
        }
    }
}

impl<T, const D: usize, M: Mode, Tg> fmt::Debug for Accessor<T, D, M, Tg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("buffer", &self.buffer.id())
            .field("mode", &M::MODE)
            .field("range", &self.range.as_array())
            .field("offset", &self.offset.as_array())
            .finish()
    }
}

/// Accessor created outside of a command group. It cannot be dereferenced; a command
/// group turns it into an [`Accessor`] with [`crate::Handler::require`].
pub struct PlaceholderAccessor<T, const D: usize, M, Tg> {
    buffer: Arc<BufferImpl>,
    buffer_range: Range<D>,
    range: Range<D>,
    offset: Id<D>,
    _marker: PhantomData<(fn() -> T, M, Tg)>,
}

impl<T: Element, const D: usize, M: Mode, Tg: Target> PlaceholderAccessor<T, D, M, Tg> {
    pub(crate) fn new(
        buffer: Arc<BufferImpl>,
        buffer_range: Range<D>,
        range: Range<D>,
        offset: Id<D>,
    ) -> Self {
        PlaceholderAccessor {
            buffer,
            buffer_range,
            range,
            offset,
            _marker: PhantomData,
        }
    }

    /// Buffer the placeholder views.
    pub fn owning_buffer(&self) -> BufferId {
        self.buffer.id()
    }

    pub(crate) fn buffer(&self) -> &Arc<BufferImpl> {
        &self.buffer
    }

    pub(crate) fn ranges(&self) -> (Range<D>, Range<D>, Id<D>) {
        (self.buffer_range, self.range, self.offset)
    }
}

impl<T, const D: usize, M, Tg> Clone for PlaceholderAccessor<T, D, M, Tg> {
    fn clone(&self) -> Self {
        PlaceholderAccessor {
            buffer: Arc::clone(&self.buffer),
            buffer_range: self.buffer_range,
            range: self.range,
            offset: self.offset,
            _marker: PhantomData,
        }
    }
}

/// Blocking host access to a buffer, obtained from [`crate::Queue::host_access`].
/// Tasks submitted later that conflict with it wait until the guard is dropped.
pub struct HostAccessor<T, const D: usize, M: Mode> {
    node: Arc<TaskNode>,
    _buffer: Arc<BufferImpl>,
    base: *mut T,
    range: Range<D>,
    _marker: PhantomData<M>,
}

impl<T: Element, const D: usize, M: Mode> HostAccessor<T, D, M> {
    pub(crate) fn new(
        node: Arc<TaskNode>,
        buffer: Arc<BufferImpl>,
        base: *mut T,
        range: Range<D>,
    ) -> Self {
        HostAccessor {
            node,
            _buffer: buffer,
            base,
            range,
            _marker: PhantomData,
        }
    }

    /// Extent of the buffer.
    pub fn range(&self) -> Range<D> {
        self.range
    }

    /// Task standing for the host access.
    pub fn node_id(&self) -> usize {
        self.node.id()
    }

    fn element(&self, id: Id<D>) -> *mut T {
        assert!(self.range.contains(id), "{:?} outside of buffer", id.as_array());
        unsafe { self.base.add(self.range.linearize(id)) }
    }
}

impl<T: Element, const D: usize, M: Readable> HostAccessor<T, D, M> {
    /// Read the element at `id`.
    pub fn get<I: Into<Id<D>>>(&self, id: I) -> T {
        unsafe { *self.element(id.into()) }
    }

    /// All elements, row-major.
    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.base, self.range.size()) }
    }
}

impl<T: Element, const D: usize, M: Writable> HostAccessor<T, D, M> {
    /// Write the element at `id`.
    pub fn set<I: Into<Id<D>>>(&mut self, id: I, value: T) {
        unsafe { *self.element(id.into()) = value }
    }

    /// All elements, row-major.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.base, self.range.size()) }
    }
}

impl<T, const D: usize, M: Mode> Drop for HostAccessor<T, D, M> {
    fn drop(&mut self) {
        self.node.finish(Ok(()));
    }
}
