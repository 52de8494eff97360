//! Per-buffer log of the tasks that may still touch the buffer's data.

use crate::{
    access::{AccessMode, Location},
    task_graph::{TaskNode, TaskState},
};
use std::sync::Arc;

struct AccessEntry {
    mode: AccessMode,
    node: Arc<TaskNode>,
    location: Location,
    external: bool,
}

/// Access log of one buffer, ordered by registration.
#[derive(Default)]
pub(crate) struct AccessLog {
    entries: Vec<AccessEntry>,
}

impl AccessLog {
    /// Record an access made by a user operation.
    pub fn register_external_access(
        &mut self,
        node: Arc<TaskNode>,
        mode: AccessMode,
        location: Location,
    ) {
        self.register(node, mode, location, true);
    }

    /// Record an access made by a residency transfer.
    pub fn register_internal_access(
        &mut self,
        node: Arc<TaskNode>,
        mode: AccessMode,
        location: Location,
    ) {
        self.register(node, mode, location, false);
    }

    fn register(&mut self, node: Arc<TaskNode>, mode: AccessMode, location: Location, external: bool) {
        self.prune();
        // the writer was ordered after every entry, they are covered through it
        if mode.is_write() {
            self.entries.clear();
        }
        log::trace!(
            "Access {:?} at {:?} by task {} (external: {})",
            mode,
            location,
            node.id(),
            external
        );
        self.entries.push(AccessEntry {
            mode,
            node,
            location,
            external,
        });
    }

    /// Tasks a new access of `mode` at `location` must be ordered after.
    ///
    /// Reads wait for the last writer and for the transfers into `location`, writes wait
    /// for every entry. Either waits for the most recent access at another location.
    pub fn compute_predecessors(
        &mut self,
        mode: AccessMode,
        location: Location,
    ) -> Vec<Arc<TaskNode>> {
        self.prune();
        // discarding writes drop the old contents, failures before them do not matter
        let discards = !mode.needs_data();
        let relevant = |entry: &&AccessEntry| !(discards && entry.node.state() == TaskState::Failed);
        let mut predecessors: Vec<Arc<TaskNode>> = vec![];
        let mut add = |node: &Arc<TaskNode>| {
            if predecessors.iter().all(|p| p.id() != node.id()) {
                predecessors.push(Arc::clone(node));
            }
        };
        if mode.is_write() {
            self.entries.iter().filter(relevant).for_each(|e| add(&e.node));
        } else {
            if let Some(entry) = self.entries.iter().rev().find(|e| e.mode.is_write()) {
                add(&entry.node);
            }
            // transfers into this location fill the copy the read sees
            self.entries
                .iter()
                .filter(|e| !e.external && e.location == location)
                .for_each(|e| add(&e.node));
        }
        if let Some(entry) = self
            .entries
            .iter()
            .rev()
            .filter(relevant)
            .find(|e| e.location != location)
        {
            add(&entry.node);
        }
        predecessors
    }

    // Completed tasks need no ordering. Failed ones stay so later readers fail too.
    fn prune(&mut self) {
        self.entries.retain(|entry| !entry.node.is_complete());
    }

    /// Tasks still in the log.
    pub fn nodes(&self) -> Vec<Arc<TaskNode>> {
        self.entries.iter().map(|e| Arc::clone(&e.node)).collect()
    }

    /// Number of user accesses still in the log.
    pub fn external_count(&self) -> usize {
        self.entries.iter().filter(|e| e.external).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{task_graph::TaskGraph, Error};
    use serial_test::serial;

    const DEVICE: Location = Location::Device(0);

    fn ids(nodes: &[Arc<TaskNode>]) -> Vec<usize> {
        let mut ids = nodes.iter().map(|n| n.id()).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    fn task(graph: &TaskGraph) -> Arc<TaskNode> {
        graph.host_task("test", vec![], &[], None)
    }

    #[serial]
    #[test]
    fn test_write_read_write() {
        let graph = TaskGraph::new().unwrap();
        let mut log = AccessLog::default();
        let w1 = task(&graph);
        assert!(log.compute_predecessors(AccessMode::Write, DEVICE).is_empty());
        log.register_external_access(Arc::clone(&w1), AccessMode::Write, DEVICE);
        let r1_predecessors = log.compute_predecessors(AccessMode::Read, DEVICE);
        assert_eq!(ids(&r1_predecessors), vec![w1.id()]);
        let r1 = task(&graph);
        log.register_external_access(Arc::clone(&r1), AccessMode::Read, DEVICE);
        // a second reader does not wait for the first one
        assert_eq!(
            ids(&log.compute_predecessors(AccessMode::Read, DEVICE)),
            vec![w1.id()]
        );
        assert_eq!(
            ids(&log.compute_predecessors(AccessMode::Write, DEVICE)),
            vec![w1.id(), r1.id()]
        );
        let w2 = task(&graph);
        log.register_external_access(Arc::clone(&w2), AccessMode::Write, DEVICE);
        assert_eq!(log.nodes().len(), 1);
        assert_eq!(
            ids(&log.compute_predecessors(AccessMode::DiscardWrite, DEVICE)),
            vec![w2.id()]
        );
    }

    #[serial]
    #[test]
    fn test_other_location() {
        let graph = TaskGraph::new().unwrap();
        let mut log = AccessLog::default();
        let w = task(&graph);
        log.register_external_access(Arc::clone(&w), AccessMode::Write, DEVICE);
        let r = task(&graph);
        log.register_external_access(Arc::clone(&r), AccessMode::Read, DEVICE);
        // the host waits for the most recent device access, even a read
        assert_eq!(
            ids(&log.compute_predecessors(AccessMode::Read, Location::Host)),
            vec![w.id(), r.id()]
        );
        let transfer = task(&graph);
        log.register_internal_access(Arc::clone(&transfer), AccessMode::Read, Location::Host);
        assert_eq!(log.external_count(), 2);
        assert_eq!(
            ids(&log.compute_predecessors(AccessMode::Read, DEVICE)),
            vec![w.id(), transfer.id()]
        );
        // a host reader also waits for the transfer filling the host copy
        assert_eq!(
            ids(&log.compute_predecessors(AccessMode::Read, Location::Host)),
            vec![w.id(), r.id(), transfer.id()]
        );
    }

    #[serial]
    #[test]
    fn test_prune() {
        let graph = TaskGraph::new().unwrap();
        let mut log = AccessLog::default();
        let w = task(&graph);
        log.register_external_access(Arc::clone(&w), AccessMode::Write, DEVICE);
        w.finish(Ok(()));
        assert!(log.compute_predecessors(AccessMode::Read, DEVICE).is_empty());
        assert!(log.nodes().is_empty());
        let failed = task(&graph);
        log.register_external_access(Arc::clone(&failed), AccessMode::ReadWrite, DEVICE);
        failed.finish(Err(Error::Runtime("x".to_string())));
        assert_eq!(log.compute_predecessors(AccessMode::Read, DEVICE).len(), 1);
        assert!(log
            .compute_predecessors(AccessMode::DiscardWrite, DEVICE)
            .is_empty());
        assert_eq!(log.nodes().len(), 1);
    }
}
