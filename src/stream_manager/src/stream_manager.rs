use crate::device_manager::DeviceManager;
use crate::handle::Handle;
use crate::idmap::IdMap;
use crate::{DeviceConfig, DeviceId, DevicePtr, Error, Stream, StreamId};

/// StreamManager
pub struct StreamManager {
    device_managers: Vec<DeviceManager>,
    // stream_id -> device index
    streams: IdMap<DeviceId>,
}

impl Default for StreamManager {
    fn default() -> Self {
        StreamManager::new()
    }
}

impl StreamManager {
    /// Create a StreamManager with one default device.
    pub fn new() -> Self {
        StreamManager::from_configs(&[DeviceConfig::default()])
    }

    /// Create a StreamManager with one device per config.
    pub fn from_configs(configs: &[DeviceConfig]) -> Self {
        let device_managers = configs
            .iter()
            .enumerate()
            .map(|(device_id, &config)| DeviceManager::new(device_id, config))
            .collect::<Vec<_>>();
        log::info!("StreamManager with {} devices", device_managers.len());
        StreamManager {
            device_managers,
            streams: IdMap::new(),
        }
    }

    /// StreamManager Run
    pub fn run(self) -> Handle {
        Handle::new(self)
    }

    /// Number of devices.
    pub fn device_count(&self) -> usize {
        self.device_managers.len()
    }

    fn device(&self, device_id: DeviceId) -> Result<&DeviceManager, Error> {
        self.device_managers
            .get(device_id)
            .ok_or(Error::InvalidDevice(device_id))
    }

    fn device_mut(&mut self, device_id: DeviceId) -> Result<&mut DeviceManager, Error> {
        self.device_managers
            .get_mut(device_id)
            .ok_or(Error::InvalidDevice(device_id))
    }

    /// Capabilities of a device.
    pub fn device_config(&self, device_id: DeviceId) -> Result<DeviceConfig, Error> {
        Ok(self.device(device_id)?.config())
    }

    /// Allocate device memory
    pub fn allocate(&mut self, device_id: DeviceId, size: usize) -> Result<DevicePtr, Error> {
        self.device_mut(device_id)?.allocate(size)
    }

    /// Free device memory
    pub fn free(&mut self, device_id: DeviceId, pointer: DevicePtr) -> Result<(), Error> {
        if !self.device_mut(device_id)?.free(pointer) {
            log::warn!("Free of unknown pointer {:#x} on device {}", pointer, device_id);
        }
        Ok(())
    }

    /// Bytes currently allocated on a device.
    pub fn memory_usage(&self, device_id: DeviceId) -> Result<usize, Error> {
        Ok(self.device(device_id)?.memory_usage())
    }

    /// Create a stream on a device
    pub fn create_stream(&mut self, device_id: DeviceId) -> Result<StreamId, Error> {
        self.device(device_id)?;
        let stream_id = self.streams.insert(device_id);
        match self.device_mut(device_id)?.create_stream(stream_id) {
            Ok(_) => {
                log::debug!(
                    "Stream {} created on device {}, {} live streams",
                    stream_id,
                    device_id,
                    self.streams.len()
                );
                Ok(stream_id)
            }
            Err(e) => {
                self.streams.remove(stream_id);
                Err(e)
            }
        }
    }

    /// Get a handle to a stream
    pub fn stream(&self, stream_id: StreamId) -> Result<Stream, Error> {
        let &device_id = self
            .streams
            .get(stream_id)
            .ok_or(Error::InvalidStream(stream_id))?;
        self.device(device_id)?
            .stream(stream_id)
            .ok_or(Error::InvalidStream(stream_id))
    }

    /// Delete a stream. Operations already submitted still run.
    pub fn delete_stream(&mut self, stream_id: StreamId) -> Result<(), Error> {
        let device_id = self
            .streams
            .remove(stream_id)
            .ok_or(Error::InvalidStream(stream_id))?;
        self.device_mut(device_id)?.delete_stream(stream_id);
        Ok(())
    }

    /// Number of live streams per device.
    pub fn stream_count(&self) -> Vec<usize> {
        let mut counts = vec![0; self.device_managers.len()];
        for (_, &device_id) in &self.streams {
            counts[device_id] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CopyKind, CopyRegion, StreamOperation};
    use serial_test::serial;

    #[serial]
    #[test]
    fn test_multiple_devices() {
        let mut stream_manager =
            StreamManager::from_configs(&[DeviceConfig::default(), DeviceConfig::default()]);
        assert_eq!(stream_manager.device_count(), 2);
        for device_id in 0..2 {
            let stream_id = stream_manager.create_stream(device_id).unwrap();
            let stream = stream_manager.stream(stream_id).unwrap();
            assert_eq!(stream.device_id(), device_id);
            let pointer = stream_manager.allocate(device_id, 4).unwrap();
            let input = vec![device_id as u8 + 1; 4];
            let mut output = vec![0u8; 4];
            stream
                .submit(StreamOperation::Memcpy(CopyRegion::linear(
                    CopyKind::HostToDevice,
                    pointer,
                    input.as_ptr() as u64,
                    4,
                )))
                .unwrap();
            stream
                .submit(StreamOperation::Memcpy(CopyRegion::linear(
                    CopyKind::DeviceToHost,
                    output.as_mut_ptr() as u64,
                    pointer,
                    4,
                )))
                .unwrap()
                .synchronize()
                .unwrap();
            assert_eq!(output, input);
            stream_manager.free(device_id, pointer).unwrap();
        }
        assert_eq!(stream_manager.stream_count(), vec![1, 1]);
        assert_eq!(
            stream_manager.create_stream(2),
            Err(Error::InvalidDevice(2))
        );
    }

    #[serial]
    #[test]
    fn test_delete_stream() {
        let mut stream_manager = StreamManager::new();
        let stream_id = stream_manager.create_stream(0).unwrap();
        let stream = stream_manager.stream(stream_id).unwrap();
        stream_manager.delete_stream(stream_id).unwrap();
        assert!(stream_manager.stream(stream_id).is_err());
        assert_eq!(
            stream_manager.delete_stream(stream_id),
            Err(Error::InvalidStream(stream_id))
        );
        // a handle kept by the caller keeps the worker alive
        assert_eq!(stream.synchronize(), Ok(()));
    }
}
