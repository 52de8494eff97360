//! Events are user handles to tasks.

use crate::{
    task_graph::{NodeId, TaskNode, TaskState},
    Error,
};
use std::sync::Arc;

/// Handle to a submitted task. An event without a task (a command group that spawned
/// nothing) is complete.
#[derive(Clone, Debug, Default)]
pub struct Event {
    node: Option<Arc<TaskNode>>,
}

impl Event {
    pub(crate) fn new(node: Option<Arc<TaskNode>>) -> Self {
        Event { node }
    }

    /// Block until the task finished; returns its error if it failed.
    pub fn wait(&self) -> Result<(), Error> {
        match &self.node {
            Some(node) => node.wait(),
            None => Ok(()),
        }
    }

    /// Wait for every event, then report the first failure.
    pub fn wait_list(events: &[Event]) -> Result<(), Error> {
        events
            .iter()
            .map(|e| e.wait())
            .fold(Ok(()), |first, r| first.and(r))
    }

    /// Whether the task reached a final state, failed included.
    pub fn is_complete(&self) -> bool {
        self.state().is_final()
    }

    /// State of the task
    pub fn state(&self) -> TaskState {
        self.node
            .as_ref()
            .map_or(TaskState::Complete, |node| node.state())
    }

    /// Id of the task, `None` for an empty event.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node.as_ref().map(|node| node.id())
    }

    /// Ids of the tasks this task was ordered after.
    pub fn predecessors(&self) -> Vec<NodeId> {
        self.node
            .as_ref()
            .map_or_else(Vec::new, |node| node.predecessor_ids().to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_graph::TaskGraph;
    use serial_test::serial;

    #[serial]
    #[test]
    fn test_event_state() {
        let empty = Event::default();
        assert!(empty.is_complete());
        assert_eq!(empty.node_id(), None);
        assert!(empty.wait().is_ok());

        let graph = TaskGraph::new().unwrap();
        let held = graph.host_task("host", vec![], &[], None);
        held.acquire().unwrap();
        let event = Event::new(Some(Arc::clone(&held)));
        assert_eq!(event.state(), TaskState::Enqueued);
        assert!(!event.is_complete());
        held.finish(Err(Error::Runtime("broken".to_string())));
        assert!(event.is_complete());
        assert_eq!(event.state(), TaskState::Failed);
        assert!(Event::wait_list(&[empty, event.clone()]).is_err());
        assert!(event.predecessors().is_empty());
    }
}
