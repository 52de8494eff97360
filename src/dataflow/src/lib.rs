#![deny(missing_docs)]
#![warn(clippy::all)]

//! Dataflow orders asynchronous kernels and transfers over shared buffers. Command
//! groups declare how they access buffers; the runtime derives the dependency graph
//! from those declarations, moves data between host and devices and runs every task
//! once its predecessors finished.

pub mod access;
mod access_log;
pub mod accessor;
pub mod buffer;
pub mod builder;
pub mod error;
pub mod event;
pub mod handler;
pub mod local_memory;
pub mod queue;
pub mod range;
pub mod runtime;
pub mod task_graph;

pub use crate::access::{
    AccessMode, ConstantBuffer, DiscardReadWrite, DiscardWrite, GlobalBuffer, HostBuffer,
    Location, Read, ReadWrite, Write,
};
pub use crate::accessor::{Accessor, HostAccessor, PlaceholderAccessor};
pub use crate::buffer::{Buffer, BufferId, Element};
pub use crate::builder::Builder;
pub use crate::error::Error;
pub use crate::event::Event;
pub use crate::handler::Handler;
pub use crate::local_memory::{LocalAccessor, LocalScope};
pub use crate::queue::{AsyncHandler, Queue};
pub use crate::range::{Group, HItem, Id, Item, NdItem, NdRange, Range};
pub use crate::runtime::Runtime;
pub use crate::task_graph::{NodeId, TaskNode, TaskState};
