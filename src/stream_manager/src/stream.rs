//! In-order execution stream of one device.

use crate::{device_manager, DeviceId, Error, StreamEvent, StreamId, StreamOperation};
use crossbeam::channel;
use std::fmt;

pub(crate) struct Submission {
    pub op: StreamOperation,
    pub waits: Vec<StreamEvent>,
    pub event: StreamEvent,
}

/// Handle to a stream. Operations submitted through any clone run one after another
/// in submission order on the stream's worker.
#[derive(Clone)]
pub struct Stream {
    id: StreamId,
    device_id: DeviceId,
    tx: channel::Sender<Submission>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, device_id: DeviceId, tx: channel::Sender<Submission>) -> Self {
        Stream { id, device_id, tx }
    }

    /// Stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Device the stream executes on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Make the stream's device current on the calling thread.
    pub fn activate(&self) {
        device_manager::set_current_device(self.device_id);
    }

    /// Submit an operation, asynchronous.
    pub fn submit(&self, op: StreamOperation) -> Result<StreamEvent, Error> {
        self.submit_with(op, vec![])
    }

    /// Submit an operation that starts only after every event in `waits` resolved. If
    /// one of them failed the operation is skipped and fails with `DependencyFailed`.
    pub fn submit_with(
        &self,
        op: StreamOperation,
        waits: Vec<StreamEvent>,
    ) -> Result<StreamEvent, Error> {
        let event = StreamEvent::new();
        log::trace!(
            "Stream {} submit {} after {} events",
            self.id,
            op.name(),
            waits.len()
        );
        self.tx
            .send(Submission {
                op,
                waits,
                event: event.clone(),
            })
            .map_err(|_| Error::Disconnected)?;
        Ok(event)
    }

    /// Block until every operation submitted so far finished.
    pub fn synchronize(&self) -> Result<(), Error> {
        self.submit(StreamOperation::Host(Box::new(|| Ok(()))))?
            .synchronize()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Stream {}
