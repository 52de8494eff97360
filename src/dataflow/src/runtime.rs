//! The runtime owns the devices and the task graph. Queues and buffers are created
//! from it.

use crate::{
    builder::Builder,
    queue::{AsyncHandler, Queue},
    task_graph::TaskGraph,
    Error,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use stream_manager::{DeviceConfig, DeviceId, Handle};

pub(crate) struct RuntimeInner {
    pub handle: Handle,
    pub graph: TaskGraph,
    next_buffer_id: AtomicUsize,
    next_handler_id: AtomicUsize,
}

/// Runtime context.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub(crate) fn from_handle(handle: Handle) -> Result<Self, Error> {
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                handle,
                graph: TaskGraph::new()?,
                next_buffer_id: AtomicUsize::new(0),
                next_handler_id: AtomicUsize::new(0),
            }),
        })
    }

    /// Runtime with one device of default capabilities.
    pub fn new() -> Result<Self, Error> {
        Builder::new().build()
    }

    /// Configure the devices before building the runtime.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Number of devices
    pub fn device_count(&self) -> usize {
        self.inner.handle.device_count()
    }

    /// Capabilities of a device.
    pub fn device_config(&self, device_id: DeviceId) -> Result<DeviceConfig, Error> {
        Ok(self.inner.handle.device_config(device_id)?)
    }

    /// Create a queue on `device_id`. Errors of its failed tasks are logged by
    /// [`Queue::throw_asynchronous`].
    pub fn queue(&self, device_id: DeviceId) -> Result<Queue, Error> {
        Queue::new(Arc::clone(&self.inner), device_id, None)
    }

    /// Create a queue on `device_id` whose failed tasks are reported to `handler`.
    pub fn queue_with_handler<F>(&self, device_id: DeviceId, handler: F) -> Result<Queue, Error>
    where
        F: 'static + Fn(Vec<Error>) + Send + Sync,
    {
        let handler: AsyncHandler = Arc::new(handler);
        Queue::new(Arc::clone(&self.inner), device_id, Some(handler))
    }

    /// Block until every task of every queue finished.
    pub fn wait_all(&self) -> Result<(), Error> {
        self.inner.graph.drain()
    }

    pub(crate) fn next_buffer_id(&self) -> usize {
        self.inner.next_buffer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }
}

impl RuntimeInner {
    pub fn next_handler_id(&self) -> usize {
        self.next_handler_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.inner.graph.drain() {
            log::warn!("Runtime drain failed: {}", e);
        }
        log::info!("Runtime released");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Buffer, Range, Read, Write};
    use serial_test::serial;
    use std::sync::Mutex;

    #[serial]
    #[test]
    fn test_queues_share_graph() {
        let runtime = Runtime::builder().device_count(2).build().unwrap();
        assert_eq!(runtime.device_count(), 2);
        assert!(matches!(runtime.queue(2), Err(Error::Stream(_))));
        let q0 = runtime.queue(0).unwrap();
        let q1 = runtime.queue(1).unwrap();
        let buffer = Buffer::<u32, 1>::new(&runtime, Range::new([64])).unwrap();
        q0.submit(|cgh| {
            let acc = buffer.get_access::<Write>(cgh)?;
            cgh.parallel_for(Range::new([64]), move |item| acc.set(item.id(), item.get(0) as u32))
        })
        .unwrap();
        let sum = Arc::new(Mutex::new(0));
        let total = Arc::clone(&sum);
        q1.submit(|cgh| {
            let acc = buffer.get_access::<Read>(cgh)?;
            cgh.single_task(move || {
                *total.lock().unwrap() = (0..64).map(|i| acc.get(i)).sum::<u32>();
            })
        })
        .unwrap();
        runtime.wait_all().unwrap();
        assert_eq!(*sum.lock().unwrap(), (0..64).sum::<u32>());
    }

    #[serial]
    #[test]
    fn test_async_handler() {
        let runtime = Runtime::new().unwrap();
        let reported = Arc::new(Mutex::new(vec![]));
        let queue = {
            let reported = Arc::clone(&reported);
            runtime
                .queue_with_handler(0, move |errors| reported.lock().unwrap().extend(errors))
                .unwrap()
        };
        queue
            .submit(|cgh| cgh.single_task(|| panic!("kernel fault")))
            .unwrap();
        queue.wait_and_throw();
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(matches!(reported[0], Error::TaskFailed { .. }));
    }
}
