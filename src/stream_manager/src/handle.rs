//! Facade of StreamManager, callers share a Handle instead of the manager itself.

use crate::{DeviceConfig, DeviceId, DevicePtr, Error, Stream, StreamId, StreamManager};
use std::sync::{Arc, Mutex};

/// Handle for StreamManager
#[derive(Clone)]
pub struct Handle {
    backend: Arc<Mutex<StreamManager>>,
}

impl Handle {
    pub(crate) fn new(backend: StreamManager) -> Self {
        Handle {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    /// Number of devices.
    pub fn device_count(&self) -> usize {
        let stream_manager = self.backend.lock().unwrap();
        stream_manager.device_count()
    }

    /// Capabilities of a device.
    pub fn device_config(&self, device_id: DeviceId) -> Result<DeviceConfig, Error> {
        let stream_manager = self.backend.lock().unwrap();
        stream_manager.device_config(device_id)
    }

    /// Allocate device memory.
    pub fn allocate(&self, device_id: DeviceId, size: usize) -> Result<DevicePtr, Error> {
        let mut stream_manager = self.backend.lock().unwrap();
        stream_manager.allocate(device_id, size)
    }

    /// Free device memory.
    pub fn free(&self, device_id: DeviceId, pointer: DevicePtr) -> Result<(), Error> {
        let mut stream_manager = self.backend.lock().unwrap();
        stream_manager.free(device_id, pointer)
    }

    /// Bytes currently allocated on a device.
    pub fn memory_usage(&self, device_id: DeviceId) -> Result<usize, Error> {
        let stream_manager = self.backend.lock().unwrap();
        stream_manager.memory_usage(device_id)
    }

    /// Create a stream on a device.
    pub fn create_stream(&self, device_id: DeviceId) -> Result<StreamId, Error> {
        let mut stream_manager = self.backend.lock().unwrap();
        stream_manager.create_stream(device_id)
    }

    /// Get a handle to a stream; submitting through it does not lock the manager.
    pub fn stream(&self, stream_id: StreamId) -> Result<Stream, Error> {
        let stream_manager = self.backend.lock().unwrap();
        stream_manager.stream(stream_id)
    }

    /// Delete a stream.
    pub fn delete_stream(&self, stream_id: StreamId) -> Result<(), Error> {
        let mut stream_manager = self.backend.lock().unwrap();
        stream_manager.delete_stream(stream_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{KernelBody, KernelLaunch, StreamOperation, ThreadContext};
    use crate::{CopyKind, CopyRegion, Dim3};
    use serial_test::serial;
    use std::thread;

    #[serial]
    #[test]
    fn test_through_apis() {
        let stream_manager =
            StreamManager::from_configs(&[DeviceConfig::default(), DeviceConfig::default()]);
        let handle = stream_manager.run();
        assert_eq!(handle.device_count(), 2);
        let mut workers = vec![];
        for device_id in 0..2 {
            let handle = handle.clone();
            workers.push(thread::spawn(move || {
                let stream_id = handle.create_stream(device_id).unwrap();
                let stream = handle.stream(stream_id).unwrap();
                let pointer = handle.allocate(device_id, 64 * 4).unwrap();
                let body = KernelBody::per_thread(move |ctx: &ThreadContext<'_>| {
                    let i = ctx.global_id(0);
                    if i < 64 {
                        unsafe { *(pointer as usize as *mut u32).add(i) = (i + device_id) as u32 };
                    }
                });
                stream
                    .submit(StreamOperation::Launch(KernelLaunch::new(
                        Dim3::new(2, 1, 1),
                        Dim3::new(32, 1, 1),
                        0,
                        body,
                    )))
                    .unwrap();
                let mut output = vec![0u32; 64];
                stream
                    .submit(StreamOperation::Memcpy(CopyRegion::linear(
                        CopyKind::DeviceToHost,
                        output.as_mut_ptr() as u64,
                        pointer,
                        64 * 4,
                    )))
                    .unwrap()
                    .synchronize()
                    .unwrap();
                assert_eq!(output[10], 10 + device_id as u32);
                handle.free(device_id, pointer).unwrap();
                handle.delete_stream(stream_id).unwrap();
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(handle.memory_usage(0), Ok(0));
        assert!(handle.device_config(5).is_err());
    }
}
