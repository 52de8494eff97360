//! Buffers own the data shared by tasks and the access log their ordering is derived
//! from. Data lives on the host and lazily on devices; it is moved where an access
//! needs it by transfer tasks.

use crate::{
    access::{AccessMode, GlobalBuffer, HostBuffer, Location, Mode, Read, ConstantBuffer},
    access_log::AccessLog,
    accessor::{Accessor, PlaceholderAccessor},
    handler::Handler,
    range::{Id, Range},
    runtime::Runtime,
    task_graph::{ErrorList, TaskGraph, TaskNode},
    Error,
};
use std::{
    collections::{BTreeSet, HashMap},
    marker::PhantomData,
    mem,
    sync::{Arc, Mutex, MutexGuard},
};
use stream_manager::{
    utils::HostMemory, CopyRegion, DeviceId, DevicePtr, Handle, Stream, StreamOperation,
};

/// Id of a buffer, unique in one runtime.
pub type BufferId = usize;

/// Types a buffer can hold.
pub trait Element: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> Element for T {}

pub(crate) struct BufferState {
    pub log: AccessLog,
    host: HostMemory,
    device: HashMap<DeviceId, DevicePtr>,
    valid: BTreeSet<Location>,
}

impl BufferState {
    pub fn is_valid(&self, location: Location) -> bool {
        self.valid.contains(&location)
    }

    /// After a write only the written copy is current.
    pub fn mark_written(&mut self, location: Location) {
        self.valid.clear();
        self.valid.insert(location);
    }

    pub fn mark_valid(&mut self, location: Location) {
        self.valid.insert(location);
    }

    pub fn valid_locations(&self) -> Vec<Location> {
        self.valid.iter().copied().collect()
    }
}

/// Untyped part of a buffer, shared by the buffer handles and its accessors.
pub(crate) struct BufferImpl {
    id: BufferId,
    byte_size: usize,
    handle: Handle,
    state: Mutex<BufferState>,
}

impl BufferImpl {
    fn new(id: BufferId, byte_size: usize, handle: Handle) -> Result<Self, Error> {
        let mut valid = BTreeSet::new();
        valid.insert(Location::Host);
        Ok(BufferImpl {
            id,
            byte_size,
            handle,
            state: Mutex::new(BufferState {
                log: AccessLog::default(),
                host: HostMemory::zeroed(byte_size)?,
                device: HashMap::new(),
                valid,
            }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap()
    }

    /// Address of the copy at `location`, allocating device memory on first use.
    pub fn address(&self, state: &mut BufferState, location: Location) -> Result<u64, Error> {
        match location {
            Location::Host => Ok(state.host.address()),
            Location::Device(device_id) => {
                if let Some(&pointer) = state.device.get(&device_id) {
                    return Ok(pointer);
                }
                let pointer = self.handle.allocate(device_id, self.byte_size)?;
                log::debug!(
                    "Buffer {} allocated {} bytes on device {}",
                    self.id,
                    self.byte_size,
                    device_id
                );
                state.device.insert(device_id, pointer);
                Ok(pointer)
            }
        }
    }

    /// Make the data current at `target` before an access of `mode` there. The transfer
    /// task, if one is needed, is ordered like a read at `target` and returned. Later
    /// reads at `target` wait for it.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate(
        &self,
        state: &mut BufferState,
        mode: AccessMode,
        target: Location,
        graph: &TaskGraph,
        stream: &Stream,
        spawned: &[Arc<TaskNode>],
        errors: &ErrorList,
    ) -> Result<Option<Arc<TaskNode>>, Error> {
        if !mode.needs_data() || state.is_valid(target) {
            return Ok(None);
        }
        // prefer the host copy, it is reachable from every device
        let source = match state.valid_locations().first() {
            Some(&source) => source,
            None => return Ok(None),
        };
        let kind = crate::access::copy_kind(source.is_host(), target.is_host());
        let region = CopyRegion::linear(
            kind,
            self.address(state, target)?,
            self.address(state, source)?,
            self.byte_size,
        );
        log::debug!(
            "Buffer {} transfer {:?} from {:?} to {:?}",
            self.id,
            kind,
            source,
            target
        );
        let predecessors = state.log.compute_predecessors(AccessMode::Read, target);
        let node = graph.insert(
            "transfer",
            StreamOperation::Memcpy(region),
            stream,
            predecessors,
            spawned,
            Some(Arc::clone(errors)),
        )?;
        state
            .log
            .register_internal_access(Arc::clone(&node), AccessMode::Read, target);
        state.mark_valid(target);
        Ok(Some(node))
    }
}

impl Drop for BufferImpl {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for (&device_id, &pointer) in &state.device {
            if let Err(e) = self.handle.free(device_id, pointer) {
                log::warn!("Buffer {} free on device {} failed: {}", self.id, device_id, e);
            }
        }
    }
}

/// Typed handle to shared data of `D` dimensions. Clones refer to the same data;
/// dropping the last clone blocks until every task using the data finished.
pub struct Buffer<T: Element, const D: usize> {
    inner: Arc<BufferImpl>,
    handles: Arc<()>,
    range: Range<D>,
    _marker: PhantomData<T>,
}

impl<T: Element, const D: usize> Buffer<T, D> {
    fn allocate(runtime: &Runtime, range: Range<D>) -> Result<Self, Error> {
        let byte_size = range.size() * mem::size_of::<T>();
        let inner = BufferImpl::new(runtime.next_buffer_id(), byte_size, runtime.handle())?;
        log::debug!("Buffer {} created, {:?} elements", inner.id, range.as_array());
        Ok(Buffer {
            inner: Arc::new(inner),
            handles: Arc::new(()),
            range,
            _marker: PhantomData,
        })
    }

    /// Buffer of `range` default values.
    pub fn new(runtime: &Runtime, range: Range<D>) -> Result<Self, Error>
    where
        T: Default,
    {
        let buffer = Buffer::allocate(runtime, range)?;
        buffer.host_init(|host| host.iter_mut().for_each(|v| *v = T::default()));
        Ok(buffer)
    }

    /// Buffer holding a copy of `data`, laid out row-major.
    pub fn from_slice(runtime: &Runtime, range: Range<D>, data: &[T]) -> Result<Self, Error> {
        if data.len() != range.size() {
            return Err(Error::InvalidParameter(format!(
                "{} elements for a buffer of {:?}",
                data.len(),
                range.as_array()
            )));
        }
        let buffer = Buffer::allocate(runtime, range)?;
        buffer.host_init(|host| host.copy_from_slice(data));
        Ok(buffer)
    }

    fn host_init<F: FnOnce(&mut [T])>(&self, f: F) {
        let mut state = self.inner.lock();
        let count = self.range.size();
        let host = state.host.as_mut_ptr() as *mut T;
        // SAFETY: the host allocation holds `count` elements and no task exists yet
        f(unsafe { std::slice::from_raw_parts_mut(host, count) });
        state.mark_written(Location::Host);
    }

    /// Buffer id
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Extent of the buffer.
    pub fn range(&self) -> Range<D> {
        self.range
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.range.size()
    }

    /// Size in bytes.
    pub fn byte_size(&self) -> usize {
        self.inner.byte_size
    }

    pub(crate) fn inner(&self) -> &Arc<BufferImpl> {
        &self.inner
    }

    /// Accessor to the whole buffer on the command group's device.
    pub fn get_access<M: Mode>(
        &self,
        cgh: &mut Handler,
    ) -> Result<Accessor<T, D, M, GlobalBuffer>, Error> {
        cgh.bind(&self.inner, self.range, self.range, Id::zero(), false)
    }

    /// Accessor to the `range` elements starting at `offset`.
    pub fn get_access_ranged<M: Mode>(
        &self,
        cgh: &mut Handler,
        range: Range<D>,
        offset: Id<D>,
    ) -> Result<Accessor<T, D, M, GlobalBuffer>, Error> {
        cgh.bind(&self.inner, self.range, range, offset, false)
    }

    /// Read-only accessor through the constant path.
    pub fn get_constant_access(
        &self,
        cgh: &mut Handler,
    ) -> Result<Accessor<T, D, Read, ConstantBuffer>, Error> {
        cgh.bind(&self.inner, self.range, self.range, Id::zero(), false)
    }

    /// Accessor to the host copy, for host-side operations of a command group.
    pub fn get_host_access<M: Mode>(
        &self,
        cgh: &mut Handler,
    ) -> Result<Accessor<T, D, M, HostBuffer>, Error> {
        cgh.bind(&self.inner, self.range, self.range, Id::zero(), false)
    }

    /// Accessor created outside of a command group, bound later with
    /// [`Handler::require`].
    pub fn placeholder<M: Mode>(&self) -> PlaceholderAccessor<T, D, M, GlobalBuffer> {
        PlaceholderAccessor::new(Arc::clone(&self.inner), self.range, self.range, Id::zero())
    }
}

impl<T: Element, const D: usize> Clone for Buffer<T, D> {
    fn clone(&self) -> Self {
        Buffer {
            inner: Arc::clone(&self.inner),
            handles: Arc::clone(&self.handles),
            range: self.range,
            _marker: PhantomData,
        }
    }
}

impl<T: Element, const D: usize> Drop for Buffer<T, D> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handles) > 1 {
            return;
        }
        let (nodes, external) = {
            let state = self.inner.lock();
            (state.log.nodes(), state.log.external_count())
        };
        if !nodes.is_empty() {
            log::debug!(
                "Buffer {} waits for {} tasks, {} transfers",
                self.inner.id,
                nodes.len(),
                nodes.len() - external
            );
        }
        for node in nodes {
            if let Err(e) = node.wait() {
                log::warn!("Buffer {} released after failed task: {}", self.inner.id, e);
            }
        }
    }
}
