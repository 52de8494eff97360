//! Kernel launch primitive: a callable executed over a grid of blocks.

use crate::{utils::HostMemory, DeviceConfig, Error};
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Three dimensional extent or index, `x` varies fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dim3 {
    /// x
    pub x: usize,
    /// y
    pub y: usize,
    /// z
    pub z: usize,
}

impl Dim3 {
    /// Create Dim3
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Dim3 { x, y, z }
    }

    /// Number of points in the extent.
    pub fn volume(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Component by axis index.
    pub fn get(&self, axis: usize) -> usize {
        match axis {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            _ => 1,
        }
    }

    /// Index of the `linear`-th point of `extent`.
    pub fn unlinearize(linear: usize, extent: Dim3) -> Self {
        Dim3 {
            x: linear % extent.x,
            y: (linear / extent.x) % extent.y,
            z: linear / (extent.x * extent.y),
        }
    }
}

impl From<[usize; 3]> for Dim3 {
    fn from(v: [usize; 3]) -> Self {
        Dim3::new(v[0], v[1], v[2])
    }
}

/// What a kernel invocation sees.
pub struct ThreadContext<'a> {
    /// Number of blocks.
    pub grid_dim: Dim3,
    /// Threads per block.
    pub block_dim: Dim3,
    /// Index of the block.
    pub block_idx: Dim3,
    /// Index of the thread in its block.
    pub thread_idx: Dim3,
    shared: *mut u8,
    shared_len: usize,
    _block: PhantomData<&'a mut [u8]>,
}

impl<'a> ThreadContext<'a> {
    /// Global thread index on one axis.
    pub fn global_id(&self, axis: usize) -> usize {
        self.block_idx.get(axis) * self.block_dim.get(axis) + self.thread_idx.get(axis)
    }

    /// Shared memory of the block. Threads of one block run one after another.
    pub fn shared_memory(&self) -> *mut u8 {
        self.shared
    }

    /// Bytes of shared memory available to the block.
    pub fn shared_len(&self) -> usize {
        self.shared_len
    }
}

/// Callable run by a kernel.
pub type KernelFn = dyn Fn(&ThreadContext<'_>) + Send + Sync;

/// Granularity the kernel callable is invoked at.
#[derive(Clone)]
pub enum KernelBody {
    /// Invoked once for each thread of each block.
    PerThread(Arc<KernelFn>),
    /// Invoked once for each block with `thread_idx` zero.
    PerBlock(Arc<KernelFn>),
}

impl KernelBody {
    /// Body invoked for each thread.
    pub fn per_thread<F>(f: F) -> Self
    where
        F: 'static + Fn(&ThreadContext<'_>) + Send + Sync,
    {
        KernelBody::PerThread(Arc::new(f))
    }

    /// Body invoked for each block.
    pub fn per_block<F>(f: F) -> Self
    where
        F: 'static + Fn(&ThreadContext<'_>) + Send + Sync,
    {
        KernelBody::PerBlock(Arc::new(f))
    }
}

/// A kernel with its launch geometry.
#[derive(Clone)]
pub struct KernelLaunch {
    /// Number of blocks.
    pub grid: Dim3,
    /// Threads per block.
    pub block: Dim3,
    /// Shared memory bytes per block.
    pub shared_mem: usize,
    /// The callable.
    pub body: KernelBody,
}

impl KernelLaunch {
    /// Create KernelLaunch
    pub fn new(grid: Dim3, block: Dim3, shared_mem: usize, body: KernelBody) -> Self {
        KernelLaunch {
            grid,
            block,
            shared_mem,
            body,
        }
    }

    /// Check the geometry against device limits.
    pub fn validate(&self, config: &DeviceConfig) -> Result<(), Error> {
        if self.grid.volume() == 0 || self.block.volume() == 0 {
            return Err(Error::InvalidLaunch(format!(
                "empty launch grid={:?} block={:?}",
                self.grid, self.block
            )));
        }
        if self.block.volume() > config.max_work_group_size {
            return Err(Error::InvalidLaunch(format!(
                "block of {} threads exceeds device limit {}",
                self.block.volume(),
                config.max_work_group_size
            )));
        }
        if self.shared_mem > config.local_mem_size {
            return Err(Error::InvalidLaunch(format!(
                "{} bytes of shared memory exceed device limit {}",
                self.shared_mem, config.local_mem_size
            )));
        }
        Ok(())
    }

    /// Run every block, spreading blocks over the device's compute units.
    pub(crate) fn execute(&self, config: &DeviceConfig) -> Result<(), Error> {
        self.validate(config)?;
        let blocks = self.grid.volume();
        let units = config.compute_units.max(1).min(blocks);
        let next_block = AtomicUsize::new(0);
        let result = crossbeam::thread::scope(|s| {
            let mut workers = vec![];
            for _ in 0..units {
                let next_block = &next_block;
                workers.push(s.spawn(move |_| -> Result<(), Error> {
                    let mut shared = HostMemory::zeroed(self.shared_mem)?;
                    loop {
                        let linear = next_block.fetch_add(1, Ordering::Relaxed);
                        if linear >= blocks {
                            return Ok(());
                        }
                        shared.zero();
                        self.run_block(Dim3::unlinearize(linear, self.grid), &shared);
                    }
                }));
            }
            workers
                .into_iter()
                .map(|worker| match worker.join() {
                    Ok(result) => result,
                    Err(payload) => Err(Error::TaskFailed(format!(
                        "kernel panicked: {}",
                        crate::utils::panic_message(payload)
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
        });
        match result {
            Ok(result) => result.map(|_| ()),
            Err(payload) => Err(Error::TaskFailed(format!(
                "kernel panicked: {}",
                crate::utils::panic_message(payload)
            ))),
        }
    }

    fn run_block(&self, block_idx: Dim3, shared: &HostMemory) {
        let context = |thread_idx: Dim3| ThreadContext {
            grid_dim: self.grid,
            block_dim: self.block,
            block_idx,
            thread_idx,
            shared: shared.as_mut_ptr(),
            shared_len: self.shared_mem,
            _block: PhantomData,
        };
        match &self.body {
            KernelBody::PerBlock(f) => f(&context(Dim3::default())),
            KernelBody::PerThread(f) => {
                for linear in 0..self.block.volume() {
                    f(&context(Dim3::unlinearize(linear, self.block)));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_unlinearize() {
        let extent = Dim3::new(4, 3, 2);
        assert_eq!(extent.volume(), 24);
        assert_eq!(Dim3::unlinearize(0, extent), Dim3::new(0, 0, 0));
        assert_eq!(Dim3::unlinearize(5, extent), Dim3::new(1, 1, 0));
        assert_eq!(Dim3::unlinearize(23, extent), Dim3::new(3, 2, 1));
    }

    #[test]
    fn test_every_thread_runs_once() {
        let seen = Arc::new(Mutex::new(vec![]));
        let body = {
            let seen = Arc::clone(&seen);
            KernelBody::per_thread(move |ctx: &ThreadContext<'_>| {
                let x = ctx.global_id(0);
                let y = ctx.global_id(1);
                seen.lock().unwrap().push(y * 8 + x);
            })
        };
        let launch = KernelLaunch::new(Dim3::new(2, 2, 1), Dim3::new(4, 2, 1), 0, body);
        launch.execute(&DeviceConfig::default()).unwrap();
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_shared_memory_per_block() {
        let sums = Arc::new(Mutex::new(vec![]));
        let body = {
            let sums = Arc::clone(&sums);
            KernelBody::per_thread(move |ctx: &ThreadContext<'_>| {
                let shared = ctx.shared_memory() as *mut u32;
                unsafe {
                    *shared += 1;
                    if ctx.thread_idx.x == ctx.block_dim.x - 1 {
                        sums.lock().unwrap().push(*shared);
                    }
                }
            })
        };
        let launch = KernelLaunch::new(Dim3::new(3, 1, 1), Dim3::new(16, 1, 1), 4, body);
        launch.execute(&DeviceConfig::default()).unwrap();
        assert_eq!(*sums.lock().unwrap(), vec![16, 16, 16]);
    }

    #[test]
    fn test_per_block_body() {
        let count = Arc::new(AtomicUsize::new(0));
        let body = {
            let count = Arc::clone(&count);
            KernelBody::per_block(move |ctx: &ThreadContext<'_>| {
                assert_eq!(ctx.thread_idx, Dim3::default());
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let launch = KernelLaunch::new(Dim3::new(5, 2, 1), Dim3::new(64, 1, 1), 0, body);
        launch.execute(&DeviceConfig::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_validate() {
        let body = KernelBody::per_thread(|_: &ThreadContext<'_>| {});
        let config = DeviceConfig::default();
        let empty = KernelLaunch::new(Dim3::new(0, 1, 1), Dim3::new(1, 1, 1), 0, body.clone());
        assert!(matches!(empty.validate(&config), Err(Error::InvalidLaunch(_))));
        let huge = KernelLaunch::new(Dim3::new(1, 1, 1), Dim3::new(2048, 1, 1), 0, body.clone());
        assert!(matches!(huge.validate(&config), Err(Error::InvalidLaunch(_))));
        let shared = KernelLaunch::new(Dim3::new(1, 1, 1), Dim3::new(1, 1, 1), 1 << 20, body);
        assert!(matches!(shared.validate(&config), Err(Error::InvalidLaunch(_))));
    }

    #[test]
    fn test_panic_is_reported() {
        let body = KernelBody::per_thread(|ctx: &ThreadContext<'_>| {
            if ctx.global_id(0) == 3 {
                panic!("bad item");
            }
        });
        let launch = KernelLaunch::new(Dim3::new(1, 1, 1), Dim3::new(8, 1, 1), 0, body);
        match launch.execute(&DeviceConfig::default()) {
            Err(Error::TaskFailed(msg)) => assert!(msg.contains("bad item")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
