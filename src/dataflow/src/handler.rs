//! Handler is the command group: it collects the buffer accesses of one submission,
//! orders the submitted operation after the tasks those buffers name and registers the
//! new task with every touched buffer.

use crate::{
    access::{copy_kind, AccessMode, CopySource, CopyTarget, Location, Mode, Target, Writable},
    accessor::{Accessor, PlaceholderAccessor},
    buffer::{BufferImpl, Element},
    event::Event,
    local_memory::{LocalAccessor, LocalMemoryAllocator},
    queue::QueueInner,
    range::{default_block, grid_for, item_in_range, Group, Id, Item, NdItem, NdRange, Range},
    task_graph::TaskNode,
    Error,
};
use std::{
    mem,
    sync::{Arc, Mutex},
};
use stream_manager::{
    transfer, CopyKind, CopyRegion, Dim3, KernelBody, KernelLaunch, StreamOperation,
    ThreadContext,
};

#[derive(Clone)]
pub(crate) struct Requirement {
    buffer: Arc<BufferImpl>,
    mode: AccessMode,
    location: Location,
}

impl Requirement {
    fn same_as(&self, other: &Requirement) -> bool {
        self.buffer.id() == other.buffer.id()
            && self.mode == other.mode
            && self.location == other.location
    }
}

enum Work<'a> {
    Stream(StreamOperation),
    Inline(Box<dyn FnOnce() -> Result<(), Error> + 'a>),
}

// Start, pitch and slice height of one side of a copy.
struct View<const D: usize> {
    address: u64,
    layout: Range<D>,
    offset: Id<D>,
}

impl<const D: usize> View<D> {
    fn dense(address: u64, range: Range<D>) -> Self {
        View {
            address,
            layout: range,
            offset: Id::zero(),
        }
    }

    fn of<T: Element, M: Mode, Tg: Target>(accessor: &Accessor<T, D, M, Tg>) -> Self {
        View {
            address: accessor.address(),
            layout: accessor.buffer_range(),
            offset: accessor.offset(),
        }
    }

    fn start(&self, element: usize) -> u64 {
        self.address + (self.layout.linearize(self.offset) * element) as u64
    }
}

fn copy_region<const D: usize>(
    kind: CopyKind,
    src: &View<D>,
    dst: &View<D>,
    extent: Range<D>,
    element: usize,
    supports_3d_copy: bool,
) -> Result<CopyRegion, Error> {
    let row = |view: &View<D>| view.layout.get(D - 1) * element;
    Ok(match D {
        1 => CopyRegion::linear(
            kind,
            dst.start(element),
            src.start(element),
            extent.get(0) * element,
        ),
        2 => CopyRegion::pitched_2d(
            kind,
            dst.start(element),
            row(dst),
            src.start(element),
            row(src),
            extent.get(1) * element,
            extent.get(0),
        ),
        _ => {
            if !supports_3d_copy {
                return Err(Error::FeatureNotSupported(
                    "3D copies are not supported on this device".to_string(),
                ));
            }
            CopyRegion::pitched_3d(
                kind,
                dst.start(element),
                row(dst),
                dst.layout.get(1),
                src.start(element),
                row(src),
                src.layout.get(1),
                extent.get(2) * element,
                extent.get(1),
                extent.get(0),
            )
        }
    })
}

/// Command group handler, passed to the closure given to [`crate::Queue::submit`].
pub struct Handler {
    id: usize,
    queue: Arc<QueueInner>,
    requirements: Vec<Requirement>,
    spawned: Vec<Arc<TaskNode>>,
    operations: usize,
    local_memory: LocalMemoryAllocator,
}

impl Handler {
    pub(crate) fn new(id: usize, queue: Arc<QueueInner>) -> Self {
        Handler {
            id,
            queue,
            requirements: vec![],
            spawned: vec![],
            operations: 0,
            local_memory: LocalMemoryAllocator::default(),
        }
    }

    /// Device the command group submits to.
    pub fn device_id(&self) -> usize {
        self.queue.device_id
    }

    fn add_requirement(&mut self, requirement: Requirement) {
        if !self.requirements.iter().any(|r| r.same_as(&requirement)) {
            self.requirements.push(requirement);
        }
    }

    pub(crate) fn bind<T: Element, const D: usize, M: Mode, Tg: Target>(
        &mut self,
        buffer: &Arc<BufferImpl>,
        buffer_range: Range<D>,
        range: Range<D>,
        offset: Id<D>,
        placeholder: bool,
    ) -> Result<Accessor<T, D, M, Tg>, Error> {
        for i in 0..D {
            if offset[i] + range[i] > buffer_range[i] {
                return Err(Error::InvalidParameter(format!(
                    "access of {:?} at {:?} exceeds buffer {:?}",
                    range.as_array(),
                    offset.as_array(),
                    buffer_range.as_array()
                )));
            }
        }
        let location = Tg::location(self.queue.device_id);
        let address = {
            let mut state = buffer.lock();
            buffer.address(&mut state, location)?
        };
        self.add_requirement(Requirement {
            buffer: Arc::clone(buffer),
            mode: M::MODE,
            location,
        });
        Ok(Accessor::new(
            Arc::clone(buffer),
            address as usize as *mut T,
            buffer_range,
            range,
            offset,
            self.id,
            placeholder,
        ))
    }

    fn requirement_of<T: Element, const D: usize, M: Mode, Tg: Target>(
        &self,
        accessor: &Accessor<T, D, M, Tg>,
    ) -> Result<Requirement, Error> {
        if accessor.handler_id() != self.id {
            return Err(Error::InvalidParameter(format!(
                "accessor of buffer {} belongs to another command group",
                accessor.owning_buffer()
            )));
        }
        Ok(Requirement {
            buffer: Arc::clone(accessor.buffer()),
            mode: M::MODE,
            location: Tg::location(self.queue.device_id),
        })
    }

    // Locks the touched buffers in id order for residency transfers, predecessor
    // computation, insertion and registration. Host work runs after the locks are
    // released, so submissions from other threads never wait behind it.
    fn submit_task(
        &mut self,
        label: &'static str,
        requirements: &[Requirement],
        work: Work<'_>,
    ) -> Result<(), Error> {
        let mut buffers: Vec<Arc<BufferImpl>> = vec![];
        for requirement in requirements {
            if buffers.iter().all(|b| b.id() != requirement.buffer.id()) {
                buffers.push(Arc::clone(&requirement.buffer));
            }
        }
        buffers.sort_by_key(|b| b.id());
        let runtime = Arc::clone(&self.queue.runtime);
        let (node, inline) = {
            let mut states = buffers.iter().map(|b| b.lock()).collect::<Vec<_>>();
            let slot = |requirement: &Requirement| {
                buffers
                    .iter()
                    .position(|b| b.id() == requirement.buffer.id())
                    .unwrap_or_default()
            };
            let mut predecessors = vec![];
            for requirement in requirements {
                let k = slot(requirement);
                let transfer = buffers[k].migrate(
                    &mut states[k],
                    requirement.mode,
                    requirement.location,
                    &runtime.graph,
                    &self.queue.stream,
                    &self.spawned,
                    &self.queue.errors,
                )?;
                self.spawned.extend(transfer);
                predecessors.extend(
                    states[k]
                        .log
                        .compute_predecessors(requirement.mode, requirement.location),
                );
            }
            let errors = Some(Arc::clone(&self.queue.errors));
            let (node, inline) = match work {
                Work::Stream(operation) => {
                    let node = runtime.graph.insert(
                        label,
                        operation,
                        &self.queue.stream,
                        predecessors,
                        &self.spawned,
                        errors,
                    )?;
                    (node, None)
                }
                Work::Inline(f) => {
                    let node = runtime
                        .graph
                        .host_task(label, predecessors, &self.spawned, errors);
                    (node, Some(f))
                }
            };
            for requirement in requirements {
                let k = slot(requirement);
                states[k].log.register_external_access(
                    Arc::clone(&node),
                    requirement.mode,
                    requirement.location,
                );
                if requirement.mode.is_write() {
                    states[k].mark_written(requirement.location);
                }
            }
            (node, inline)
        };
        if let Some(f) = inline {
            node.run_inline(f);
        }
        self.spawned.push(node);
        self.operations += 1;
        Ok(())
    }

    // Residency transfers for accessors no operation consumed.
    fn submit_transfers(&mut self, requirements: &[Requirement]) -> Result<(), Error> {
        let runtime = Arc::clone(&self.queue.runtime);
        let mut requirements = requirements.to_vec();
        requirements.sort_by_key(|r| r.buffer.id());
        for requirement in &requirements {
            let mut state = requirement.buffer.lock();
            let transfer = requirement.buffer.migrate(
                &mut state,
                requirement.mode,
                requirement.location,
                &runtime.graph,
                &self.queue.stream,
                &self.spawned,
                &self.queue.errors,
            )?;
            self.spawned.extend(transfer);
        }
        Ok(())
    }

    fn launch(&mut self, label: &'static str, launch: KernelLaunch) -> Result<(), Error> {
        launch
            .validate(&self.queue.device_config)
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;
        log::debug!(
            "{} grid {:?} block {:?} shared {}",
            label,
            launch.grid,
            launch.block,
            launch.shared_mem
        );
        let requirements = self.requirements.clone();
        self.submit_task(label, &requirements, Work::Stream(StreamOperation::Launch(launch)))
    }

    /// Run `f` once on the device.
    pub fn single_task<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: 'static + Fn() + Send + Sync,
    {
        let body = KernelBody::per_block(move |_: &ThreadContext<'_>| f());
        let launch = KernelLaunch::new(
            Dim3::new(1, 1, 1),
            Dim3::new(1, 1, 1),
            self.local_memory.size(),
            body,
        );
        self.launch("single_task", launch)
    }

    /// Run `f` for every id of `range`.
    pub fn parallel_for<const D: usize, F>(&mut self, range: Range<D>, f: F) -> Result<(), Error>
    where
        F: 'static + Fn(Item<D>) + Send + Sync,
    {
        self.parallel_for_offset(range, Id::zero(), f)
    }

    /// Run `f` for every id of `range` shifted by `offset`.
    pub fn parallel_for_offset<const D: usize, F>(
        &mut self,
        range: Range<D>,
        offset: Id<D>,
        f: F,
    ) -> Result<(), Error>
    where
        F: 'static + Fn(Item<D>) + Send + Sync,
    {
        if range.size() == 0 {
            log::debug!("parallel_for over an empty range, nothing to launch");
            return Ok(());
        }
        let block = default_block::<D>(self.queue.device_config.max_work_group_size);
        let grid = grid_for(range, block);
        let body = KernelBody::per_thread(move |ctx: &ThreadContext<'_>| {
            if let Some(id) = item_in_range(ctx, range) {
                f(Item::new(id + offset, range, offset));
            }
        });
        let launch = KernelLaunch::new(grid, block, self.local_memory.size(), body);
        self.launch("parallel_for", launch)
    }

    /// Run `f` for every work item of `nd_range`, work-groups share local memory.
    pub fn parallel_for_nd<const D: usize, F>(
        &mut self,
        nd_range: NdRange<D>,
        f: F,
    ) -> Result<(), Error>
    where
        F: 'static + Fn(&NdItem<'_, D>) + Send + Sync,
    {
        nd_range.validate()?;
        let max_work_group_size = self.queue.device_config.max_work_group_size;
        if nd_range.local.size() > max_work_group_size {
            return Err(Error::InvalidParameter(format!(
                "work-group of {} items exceeds device limit {}",
                nd_range.local.size(),
                max_work_group_size
            )));
        }
        let body = KernelBody::per_thread(move |ctx: &ThreadContext<'_>| {
            f(&NdItem::from_context(ctx, nd_range))
        });
        let launch = KernelLaunch::new(
            nd_range.group_range().to_dim3(1),
            nd_range.local.to_dim3(1),
            self.local_memory.size(),
            body,
        );
        self.launch("parallel_for_nd", launch)
    }

    /// Run `f` once per work-group; items are reached through
    /// [`Group::parallel_for_work_item`].
    pub fn parallel_for_work_group<const D: usize, F>(
        &mut self,
        num_groups: Range<D>,
        group_size: Range<D>,
        f: F,
    ) -> Result<(), Error>
    where
        F: 'static + Fn(&Group<'_, D>) + Send + Sync,
    {
        let body = KernelBody::per_block(move |ctx: &ThreadContext<'_>| {
            f(&Group::from_context(ctx, num_groups, group_size))
        });
        let launch = KernelLaunch::new(
            num_groups.to_dim3(1),
            group_size.to_dim3(1),
            self.local_memory.size(),
            body,
        );
        self.launch("parallel_for_work_group", launch)
    }

    /// Reserve `count` elements of work-group local memory for the kernel of this
    /// command group.
    pub fn local_memory<T: Copy>(&mut self, count: usize) -> LocalAccessor<T> {
        self.local_memory.alloc(count)
    }

    fn check_extent<const D: usize>(src: Range<D>, dest: Range<D>) -> Result<(), Error> {
        if (0..D).any(|i| src[i] > dest[i]) {
            return Err(Error::InvalidParameter(format!(
                "copy of {:?} does not fit into {:?}",
                src.as_array(),
                dest.as_array()
            )));
        }
        Ok(())
    }

    /// Copy the elements of `src` into `dest`. The direction follows the targets.
    pub fn copy<T, const D: usize, MS, TS, MD, TD>(
        &mut self,
        src: &Accessor<T, D, MS, TS>,
        dest: &Accessor<T, D, MD, TD>,
    ) -> Result<(), Error>
    where
        T: Element,
        MS: CopySource,
        TS: CopyTarget,
        MD: Writable,
        TD: CopyTarget,
    {
        let requirements = vec![self.requirement_of(src)?, self.requirement_of(dest)?];
        Handler::check_extent(src.range(), dest.range())?;
        let kind = copy_kind(TS::IS_HOST, TD::IS_HOST);
        let region = copy_region(
            kind,
            &View::of(src),
            &View::of(dest),
            src.range(),
            mem::size_of::<T>(),
            self.queue.device_config.supports_3d_copy,
        )?;
        log::debug!(
            "copy {:?} buffer {} -> buffer {}, {} bytes",
            kind,
            src.owning_buffer(),
            dest.owning_buffer(),
            region.bytes()
        );
        self.submit_task("copy", &requirements, Work::Stream(StreamOperation::Memcpy(region)))
    }

    /// Copy host data into `dest`. The data is kept alive until the copy ran.
    pub fn copy_from_host<T, const D: usize, M, Tg>(
        &mut self,
        src: Arc<[T]>,
        dest: &Accessor<T, D, M, Tg>,
    ) -> Result<(), Error>
    where
        T: Element,
        M: Writable,
        Tg: CopyTarget,
    {
        let requirements = vec![self.requirement_of(dest)?];
        if src.len() < dest.count() {
            return Err(Error::InvalidParameter(format!(
                "{} host elements for an accessor of {}",
                src.len(),
                dest.count()
            )));
        }
        let kind = copy_kind(true, Tg::IS_HOST);
        let region = copy_region(
            kind,
            &View::dense(src.as_ptr() as u64, dest.range()),
            &View::of(dest),
            dest.range(),
            mem::size_of::<T>(),
            self.queue.device_config.supports_3d_copy,
        )?;
        log::debug!("copy {:?} into buffer {}", kind, dest.owning_buffer());
        let operation = StreamOperation::Host(Box::new(move || {
            // SAFETY: `src` is owned by this closure, the destination is ordered
            // by the task graph
            let result = unsafe { transfer::copy(&region) };
            drop(src);
            result
        }));
        self.submit_task("copy", &requirements, Work::Stream(operation))
    }

    /// Copy the elements of `src` into `dest`, row-major.
    pub fn copy_to_host<T, const D: usize, M, Tg>(
        &mut self,
        src: &Accessor<T, D, M, Tg>,
        dest: Arc<Mutex<Vec<T>>>,
    ) -> Result<(), Error>
    where
        T: Element,
        M: CopySource,
        Tg: CopyTarget,
    {
        let requirements = vec![self.requirement_of(src)?];
        let count = src.count();
        let len = dest.lock().unwrap().len();
        if len < count {
            return Err(Error::InvalidParameter(format!(
                "host vector of {} elements for an accessor of {}",
                len, count
            )));
        }
        let kind = copy_kind(Tg::IS_HOST, true);
        let src_view = View::of(src);
        let extent = src.range();
        let supports_3d_copy = self.queue.device_config.supports_3d_copy;
        // fail early on unsupported shapes
        copy_region(kind, &src_view, &View::dense(1, extent), extent, 1, supports_3d_copy)?;
        log::debug!("copy {:?} out of buffer {}", kind, src.owning_buffer());
        let operation = StreamOperation::Host(Box::new(move || {
            let mut dest = dest.lock().unwrap();
            if dest.len() < count {
                return Err(stream_manager::Error::TaskFailed(format!(
                    "host vector shrank to {} elements",
                    dest.len()
                )));
            }
            let dst_view = View::dense(dest.as_mut_ptr() as u64, extent);
            let region = copy_region(
                kind,
                &src_view,
                &dst_view,
                extent,
                mem::size_of::<T>(),
                supports_3d_copy,
            )
            .map_err(|e| stream_manager::Error::UnsupportedShape(e.to_string()))?;
            // SAFETY: `dest` is locked, the source is ordered by the task graph
            unsafe { transfer::copy(&region) }
        }));
        self.submit_task("copy", &requirements, Work::Stream(operation))
    }

    /// Copy `dest.count()` elements from `src` into `dest`.
    ///
    /// # Safety
    ///
    /// `src` must stay valid and unmodified until the copy finished.
    pub unsafe fn copy_from_ptr<T, const D: usize, M, Tg>(
        &mut self,
        src: *const T,
        dest: &Accessor<T, D, M, Tg>,
    ) -> Result<(), Error>
    where
        T: Element,
        M: Writable,
        Tg: CopyTarget,
    {
        let requirements = vec![self.requirement_of(dest)?];
        if src.is_null() {
            return Err(Error::InvalidParameter("null source pointer".to_string()));
        }
        let region = copy_region(
            copy_kind(true, Tg::IS_HOST),
            &View::dense(src as u64, dest.range()),
            &View::of(dest),
            dest.range(),
            mem::size_of::<T>(),
            self.queue.device_config.supports_3d_copy,
        )?;
        self.submit_task("copy", &requirements, Work::Stream(StreamOperation::Memcpy(region)))
    }

    /// Copy the elements of `src` to `dest`, row-major.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for `src.count()` elements until the copy finished and must
    /// not be accessed meanwhile.
    pub unsafe fn copy_to_ptr<T, const D: usize, M, Tg>(
        &mut self,
        src: &Accessor<T, D, M, Tg>,
        dest: *mut T,
    ) -> Result<(), Error>
    where
        T: Element,
        M: CopySource,
        Tg: CopyTarget,
    {
        let requirements = vec![self.requirement_of(src)?];
        if dest.is_null() {
            return Err(Error::InvalidParameter(
                "null destination pointer".to_string(),
            ));
        }
        let region = copy_region(
            copy_kind(Tg::IS_HOST, true),
            &View::of(src),
            &View::dense(dest as u64, src.range()),
            src.range(),
            mem::size_of::<T>(),
            self.queue.device_config.supports_3d_copy,
        )?;
        self.submit_task("copy", &requirements, Work::Stream(StreamOperation::Memcpy(region)))
    }

    /// Bring the host copy of the accessor's buffer up to date. Later host accesses
    /// are ordered after the transfer.
    pub fn update_host<T, const D: usize, M, Tg>(
        &mut self,
        accessor: &Accessor<T, D, M, Tg>,
    ) -> Result<(), Error>
    where
        T: Element,
        M: Mode,
        Tg: Target,
    {
        self.requirement_of(accessor)?;
        let requirement = Requirement {
            buffer: Arc::clone(accessor.buffer()),
            mode: AccessMode::Read,
            location: Location::Host,
        };
        let before = self.spawned.len();
        self.submit_transfers(&[requirement])?;
        if self.spawned.len() == before {
            log::debug!(
                "update_host of buffer {}: host copy is current",
                accessor.owning_buffer()
            );
        }
        self.operations += 1;
        Ok(())
    }

    /// Set every accessed element to `value`. Host targets are filled right away on
    /// the calling thread once the previous accesses finished.
    pub fn fill<T, const D: usize, M, Tg>(
        &mut self,
        accessor: &Accessor<T, D, M, Tg>,
        value: T,
    ) -> Result<(), Error>
    where
        T: Element,
        M: Writable,
        Tg: Target,
    {
        let requirement = self.requirement_of(accessor)?;
        if Tg::IS_HOST {
            let accessor = accessor.clone();
            let fill = move || {
                let range = accessor.range();
                for linear in 0..range.size() {
                    accessor.set(range.delinearize(linear) + accessor.offset(), value);
                }
                Ok(())
            };
            self.submit_task("fill", &[requirement], Work::Inline(Box::new(fill)))
        } else {
            let target = accessor.clone();
            self.parallel_for_offset(accessor.range(), accessor.offset(), move |item| {
                target.set(item.id(), value)
            })
        }
    }

    /// Bind a placeholder accessor to this command group.
    pub fn require<T, const D: usize, M, Tg>(
        &mut self,
        placeholder: &PlaceholderAccessor<T, D, M, Tg>,
    ) -> Result<Accessor<T, D, M, Tg>, Error>
    where
        T: Element,
        M: Mode,
        Tg: Target,
    {
        let (buffer_range, range, offset) = placeholder.ranges();
        self.bind(placeholder.buffer(), buffer_range, range, offset, true)
    }

    /// Event of the last task the command group spawned.
    pub fn event(&self) -> Event {
        Event::new(self.spawned.last().cloned())
    }

    /// Tasks spawned so far, transfers included.
    pub fn spawned_nodes(&self) -> &[Arc<TaskNode>] {
        &self.spawned
    }

    // A command group with accessors but no operation still makes the data resident.
    pub(crate) fn finalize(&mut self) -> Result<(), Error> {
        if self.operations == 0 && !self.requirements.is_empty() {
            let requirements = self.requirements.clone();
            self.submit_transfers(&requirements)?;
        }
        Ok(())
    }
}
