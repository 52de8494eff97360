//! Errors raised by submissions and reported by failed tasks.

use crate::task_graph::NodeId;
use std::fmt;

/// Error
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Rejected argument, raised before any task exists.
    InvalidParameter(String),
    /// Operation the device cannot perform, raised before any task exists.
    FeatureNotSupported(String),
    /// The task's own operation failed.
    TaskFailed {
        /// failed task
        node: NodeId,
        /// reported failure
        reason: String,
    },
    /// The task never ran because a task it depends on failed.
    DependencyFailed {
        /// skipped task
        node: NodeId,
        /// failure of the dependency
        cause: String,
    },
    /// Error from the execution backend.
    Stream(stream_manager::Error),
    /// Runtime misuse, e.g. submitting after shutdown.
    Runtime(String),
}

impl Error {
    /// Id of the task the error belongs to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Error::TaskFailed { node, .. } | Error::DependencyFailed { node, .. } => Some(*node),
            _ => None,
        }
    }

    pub(crate) fn from_task(node: NodeId, error: stream_manager::Error) -> Self {
        match error {
            stream_manager::Error::DependencyFailed(cause) => Error::DependencyFailed { node, cause },
            error => Error::TaskFailed {
                node,
                reason: error.to_string(),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            Error::FeatureNotSupported(msg) => write!(f, "feature not supported: {}", msg),
            Error::TaskFailed { node, reason } => write!(f, "task {} failed: {}", node, reason),
            Error::DependencyFailed { node, cause } => {
                write!(f, "task {} skipped, dependency failed: {}", node, cause)
            }
            Error::Stream(e) => write!(f, "stream error: {}", e),
            Error::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Stream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<stream_manager::Error> for Error {
    fn from(e: stream_manager::Error) -> Self {
        Error::Stream(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_task() {
        let e = Error::from_task(3, stream_manager::Error::DependencyFailed("x".to_string()));
        assert_eq!(
            e,
            Error::DependencyFailed {
                node: 3,
                cause: "x".to_string()
            }
        );
        assert_eq!(e.node(), Some(3));
        let e = Error::from_task(4, stream_manager::Error::Disconnected);
        assert!(matches!(e, Error::TaskFailed { node: 4, .. }));
        let e: Error = stream_manager::Error::InvalidStream(1).into();
        assert_eq!(e.node(), None);
        assert!(std::error::Error::source(&e).is_some());
    }
}
