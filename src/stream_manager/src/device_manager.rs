//! DeviceManager manages one software device.
//! It owns the device memory and spawns one executor thread per stream.

use crate::{
    stream::{Stream, Submission},
    transfer,
    utils::{panic_message, HostMemory},
    DeviceConfig, DeviceId, DevicePtr, Error, StreamEvent, StreamId, StreamOperation,
};
use crossbeam::channel;
use std::{
    cell::Cell,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    thread,
    time::Instant,
};

thread_local! {
    static CURRENT_DEVICE: Cell<Option<DeviceId>> = Cell::new(None);
}

/// Device made current on this thread by the last `Stream::activate`.
pub fn current_device() -> Option<DeviceId> {
    CURRENT_DEVICE.with(|device| device.get())
}

pub(crate) fn set_current_device(device_id: DeviceId) {
    CURRENT_DEVICE.with(|device| device.set(Some(device_id)));
}

pub(crate) struct DeviceManager {
    device_id: DeviceId,
    config: DeviceConfig,
    allocations: HashMap<DevicePtr, HostMemory>,
    allocated: usize,
    streams: HashMap<StreamId, Stream>,
}

impl DeviceManager {
    pub fn new(device_id: DeviceId, config: DeviceConfig) -> Self {
        DeviceManager {
            device_id,
            config,
            allocations: HashMap::new(),
            allocated: 0,
            streams: HashMap::new(),
        }
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    pub fn allocate(&mut self, size: usize) -> Result<DevicePtr, Error> {
        if self.allocated + size > self.config.global_mem_size {
            return Err(Error::OutOfMemory(size));
        }
        let memory = HostMemory::zeroed(size)?;
        let pointer = memory.address();
        self.allocated += size;
        self.allocations.insert(pointer, memory);
        Ok(pointer)
    }

    pub fn free(&mut self, pointer: DevicePtr) -> bool {
        match self.allocations.remove(&pointer) {
            Some(memory) => {
                self.allocated -= memory.len();
                true
            }
            None => false,
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.allocated
    }

    pub fn create_stream(&mut self, stream_id: StreamId) -> Result<Stream, Error> {
        let (tx, rx) = channel::unbounded();
        let device_id = self.device_id;
        let config = self.config;
        thread::Builder::new()
            .name(format!("stream-{}-{}", device_id, stream_id))
            .spawn(move || stream_executor(device_id, stream_id, config, rx))
            .map_err(|e| Error::TaskFailed(format!("cannot spawn stream worker: {}", e)))?;
        let stream = Stream::new(stream_id, device_id, tx);
        self.streams.insert(stream_id, stream.clone());
        Ok(stream)
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<Stream> {
        self.streams.get(&stream_id).cloned()
    }

    pub fn delete_stream(&mut self, stream_id: StreamId) -> bool {
        self.streams.remove(&stream_id).is_some()
    }
}

// Runs until every handle to the stream is dropped; queued operations still finish.
fn stream_executor(
    device_id: DeviceId,
    stream_id: StreamId,
    config: DeviceConfig,
    rx: channel::Receiver<Submission>,
) {
    set_current_device(device_id);
    for Submission { op, waits, event } in rx.iter() {
        let now = Instant::now();
        let name = op.name();
        let result = match wait_all(&waits) {
            Ok(()) => execute(op, &config),
            Err(e) => Err(Error::DependencyFailed(e.to_string())),
        };
        match &result {
            Ok(()) => log::debug!("Stream {} {} {:?}", stream_id, name, now.elapsed()),
            Err(e) => log::warn!("Stream {} {} failed: {}", stream_id, name, e),
        }
        event.resolve(result);
    }
    log::debug!("Stream {} on device {} exits", stream_id, device_id);
}

// Waits for every event even after a failure, so a skipped operation never resolves
// before the operations it was ordered after.
fn wait_all(waits: &[StreamEvent]) -> Result<(), Error> {
    waits
        .iter()
        .map(|event| event.synchronize())
        .fold(Ok(()), |first, result| first.and(result))
}

fn execute(op: StreamOperation, config: &DeviceConfig) -> Result<(), Error> {
    match op {
        StreamOperation::Launch(launch) => launch.execute(config),
        StreamOperation::Memcpy(region) => {
            if region.dimensions() == 3 && !config.supports_3d_copy {
                return Err(Error::UnsupportedShape(
                    "3D transfers are not supported on this device".to_string(),
                ));
            }
            // SAFETY: addresses come from live allocations kept alive by the submitter
            // until the operation's event resolves.
            unsafe { transfer::copy(&region) }
        }
        StreamOperation::Host(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(Error::TaskFailed(format!(
                "host task panicked: {}",
                panic_message(payload)
            ))),
        },
    }
}
