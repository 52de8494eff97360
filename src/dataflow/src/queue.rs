//! Queues submit command groups to one device. Each queue owns an in-order stream;
//! ordering between queues comes from the task graph alone.

use crate::{
    access::{Location, Mode},
    accessor::HostAccessor,
    buffer::{Buffer, Element},
    event::Event,
    handler::Handler,
    runtime::RuntimeInner,
    task_graph::{ErrorList, TaskNode},
    Error,
};
use std::sync::{Arc, Mutex};
use stream_manager::{DeviceConfig, DeviceId, Stream};

/// Receives the errors of failed tasks collected by a queue.
pub type AsyncHandler = Arc<dyn Fn(Vec<Error>) + Send + Sync>;

pub(crate) struct QueueInner {
    pub runtime: Arc<RuntimeInner>,
    pub device_id: DeviceId,
    pub device_config: DeviceConfig,
    pub stream: Stream,
    pub errors: ErrorList,
    async_handler: Option<AsyncHandler>,
    submitted: Mutex<Vec<Arc<TaskNode>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.handle.delete_stream(self.stream.id()) {
            log::warn!("Queue stream {} not released: {}", self.stream.id(), e);
        }
        let pending = self.errors.lock().unwrap().len();
        if pending > 0 {
            log::warn!("Queue dropped with {} unreported errors", pending);
        }
    }
}

/// Submission queue bound to one device. Clones share the stream and the error list.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        device_id: DeviceId,
        async_handler: Option<AsyncHandler>,
    ) -> Result<Self, Error> {
        let device_config = runtime.handle.device_config(device_id)?;
        let stream_id = runtime.handle.create_stream(device_id)?;
        let stream = runtime.handle.stream(stream_id)?;
        log::debug!("Queue on device {} uses stream {}", device_id, stream_id);
        Ok(Queue {
            inner: Arc::new(QueueInner {
                runtime,
                device_id,
                device_config,
                stream,
                errors: Arc::new(Mutex::new(vec![])),
                async_handler,
                submitted: Mutex::new(vec![]),
            }),
        })
    }

    /// Device of the queue
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Limits of the queue's device.
    pub fn device_config(&self) -> DeviceConfig {
        self.inner.device_config
    }

    /// Run `f` as a command group and return the event of the last task it spawned.
    /// Tasks spawned before `f` failed are kept and run.
    pub fn submit<F>(&self, f: F) -> Result<Event, Error>
    where
        F: FnOnce(&mut Handler) -> Result<(), Error>,
    {
        let id = self.inner.runtime.next_handler_id();
        let mut cgh = Handler::new(id, Arc::clone(&self.inner));
        let result = f(&mut cgh).and_then(|_| cgh.finalize());
        {
            let mut submitted = self.inner.submitted.lock().unwrap();
            submitted.retain(|node| !node.state().is_final());
            submitted.extend(cgh.spawned_nodes().iter().cloned());
        }
        match result {
            Ok(()) => {
                log::trace!(
                    "Command group {} spawned {} tasks",
                    id,
                    cgh.spawned_nodes().len()
                );
                Ok(cgh.event())
            }
            Err(e) => {
                log::debug!("Command group {} rejected: {}", id, e);
                Err(e)
            }
        }
    }

    /// Block until every task submitted through the queue finished. Failures are
    /// kept for [`Queue::throw_asynchronous`].
    pub fn wait(&self) {
        let submitted = std::mem::take(&mut *self.inner.submitted.lock().unwrap());
        for node in submitted {
            let _ = node.wait();
        }
    }

    /// [`Queue::wait`], then [`Queue::throw_asynchronous`].
    pub fn wait_and_throw(&self) {
        self.wait();
        self.throw_asynchronous();
    }

    /// Hand the errors collected so far to the async handler. Without a handler they
    /// are logged.
    pub fn throw_asynchronous(&self) {
        let errors = std::mem::take(&mut *self.inner.errors.lock().unwrap());
        if errors.is_empty() {
            return;
        }
        match &self.inner.async_handler {
            Some(handler) => handler(errors),
            None => {
                for e in errors {
                    log::warn!("Asynchronous error on device {}: {}", self.inner.device_id, e);
                }
            }
        }
    }

    /// Block until the host copy of `buffer` may be accessed with mode `M`. Tasks
    /// submitted later that conflict with the access wait until the guard is dropped.
    /// The buffer is only locked while the access is registered, not while waiting.
    pub fn host_access<T: Element, const D: usize, M: Mode>(
        &self,
        buffer: &Buffer<T, D>,
    ) -> Result<HostAccessor<T, D, M>, Error> {
        let inner = buffer.inner();
        let graph = &self.inner.runtime.graph;
        let (node, base) = {
            let mut state = inner.lock();
            let base = inner.address(&mut state, Location::Host)? as usize as *mut T;
            let transfer = inner.migrate(
                &mut state,
                M::MODE,
                Location::Host,
                graph,
                &self.inner.stream,
                &[],
                &self.inner.errors,
            )?;
            let mut predecessors = state.log.compute_predecessors(M::MODE, Location::Host);
            predecessors.extend(transfer);
            let node = graph.host_task("host_access", predecessors, &[], None);
            state
                .log
                .register_external_access(Arc::clone(&node), M::MODE, Location::Host);
            if M::MODE.is_write() {
                state.mark_written(Location::Host);
            }
            (node, base)
        };
        node.acquire()?;
        Ok(HostAccessor::new(node, Arc::clone(inner), base, buffer.range()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{DiscardWrite, Range, Read, ReadWrite, Runtime};
    use crossbeam::channel;
    use serial_test::serial;
    use std::{thread, time::Duration};

    #[serial]
    #[test]
    fn test_host_wait_leaves_buffer_unlocked() {
        let runtime = Runtime::new().unwrap();
        let queue = runtime.queue(0).unwrap();
        let a = Buffer::<u32, 1>::from_slice(&runtime, Range::new([4]), &[1, 2, 3, 4]).unwrap();
        let b = Buffer::<u32, 1>::new(&runtime, Range::new([4])).unwrap();
        let mut guard = queue.host_access::<u32, 1, ReadWrite>(&a).unwrap();
        guard.set(0, 10);
        let kernel = queue
            .submit(|cgh| {
                let src = a.get_access::<Read>(cgh)?;
                let dst = b.get_access::<DiscardWrite>(cgh)?;
                cgh.single_task(move || (0..4).for_each(|i| dst.set(i, src.get(i) * 2)))
            })
            .unwrap();
        // a host reader of `b` waits for the kernel, which waits for the guard
        let (read_tx, read_rx) = channel::unbounded();
        let reader = {
            let (queue, b) = (queue.clone(), b.clone());
            thread::spawn(move || {
                let host = queue.host_access::<u32, 1, Read>(&b).unwrap();
                read_tx.send(host.as_slice().to_vec()).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(20));
        let (submitted_tx, submitted_rx) = channel::unbounded();
        let submitter = {
            let (queue, b) = (queue.clone(), b.clone());
            thread::spawn(move || {
                let event = queue
                    .submit(|cgh| {
                        let acc = b.get_access::<Read>(cgh)?;
                        cgh.single_task(move || drop(acc.get(0)))
                    })
                    .unwrap();
                submitted_tx.send(event).unwrap();
            })
        };
        let event = submitted_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!event.is_complete());
        assert!(read_rx.try_recv().is_err());
        drop(guard);
        assert_eq!(
            read_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            vec![20, 4, 6, 8]
        );
        event.wait().unwrap();
        kernel.wait().unwrap();
        reader.join().unwrap();
        submitter.join().unwrap();
    }

    #[serial]
    #[test]
    fn test_host_access_after_failure() {
        let runtime = Runtime::new().unwrap();
        let queue = runtime.queue(0).unwrap();
        let buffer = Buffer::<u32, 1>::new(&runtime, Range::new([2])).unwrap();
        queue
            .submit(|cgh| {
                let acc = buffer.get_access::<DiscardWrite>(cgh)?;
                cgh.single_task(move || {
                    acc.set(0, 1);
                    panic!("device fault");
                })
            })
            .unwrap();
        assert!(matches!(
            queue.host_access::<u32, 1, Read>(&buffer),
            Err(Error::DependencyFailed { .. })
        ));
        // the failed access is final, discarding the contents needs no wait
        let mut host = queue.host_access::<u32, 1, DiscardWrite>(&buffer).unwrap();
        host.set(1, 5);
        drop(host);
        let host = queue.host_access::<u32, 1, Read>(&buffer).unwrap();
        assert_eq!(host.get(1), 5);
        queue.throw_asynchronous();
    }
}
