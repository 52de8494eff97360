//! TaskGraph owns every submitted task until it finished.
//!
//! A scheduler thread keeps the tasks that cannot be enqueued yet. A task is enqueued
//! on its stream once each predecessor either completed or sits on a stream itself;
//! the stream worker then waits for the predecessors' stream events before running it.

use crate::Error;
use crossbeam::channel;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
};
use stream_manager::{Stream, StreamEvent, StreamOperation};

/// Id of a task, unique in one runtime.
pub type NodeId = usize;

/// Errors collected for asynchronous reporting.
pub(crate) type ErrorList = Arc<Mutex<Vec<Error>>>;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the task graph.
    NotEnqueued,
    /// Submitted to a stream, or held by the host.
    Enqueued,
    /// Finished successfully.
    Complete,
    /// The operation or one of its dependencies failed.
    Failed,
}

impl TaskState {
    /// Whether the task reached its last state.
    pub fn is_final(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

struct NodeStatus {
    state: TaskState,
    error: Option<Error>,
    stream_event: Option<StreamEvent>,
}

/// A unit of asynchronous work with the tasks it must run after.
pub struct TaskNode {
    id: NodeId,
    label: &'static str,
    operation: Mutex<Option<StreamOperation>>,
    // dropped once the task is final so finished chains can be reclaimed
    predecessors: Mutex<Vec<Arc<TaskNode>>>,
    predecessor_ids: Vec<NodeId>,
    stream: Option<Stream>,
    status: Mutex<NodeStatus>,
    finished: Condvar,
    errors: Option<ErrorList>,
    notify: channel::Sender<Command>,
}

impl TaskNode {
    /// Task id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Kind of work, used in logs.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.status.lock().unwrap().state
    }

    /// Whether the task completed successfully.
    pub fn is_complete(&self) -> bool {
        self.state() == TaskState::Complete
    }

    /// Ids of the tasks this one was ordered after.
    pub fn predecessor_ids(&self) -> &[NodeId] {
        &self.predecessor_ids
    }

    /// Failure of the task, if it failed.
    pub fn error(&self) -> Option<Error> {
        self.status.lock().unwrap().error.clone()
    }

    /// Block until the task is final. A task only starts after its predecessors
    /// finished, so this also waits for all of them.
    pub fn wait(&self) -> Result<(), Error> {
        let mut status = self.status.lock().unwrap();
        while !status.state.is_final() {
            status = self.finished.wait(status).unwrap();
        }
        match &status.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn set_enqueued(&self, stream_event: Option<StreamEvent>) {
        let mut status = self.status.lock().unwrap();
        if status.state == TaskState::NotEnqueued {
            status.state = TaskState::Enqueued;
            status.stream_event = stream_event;
        }
    }

    /// Move the task to its final state. Only the first call has an effect.
    pub(crate) fn finish(&self, result: Result<(), Error>) -> bool {
        {
            let mut status = self.status.lock().unwrap();
            if status.state.is_final() {
                return false;
            }
            match &result {
                Ok(()) => status.state = TaskState::Complete,
                Err(e) => {
                    status.state = TaskState::Failed;
                    status.error = Some(e.clone());
                }
            }
            status.stream_event = None;
        }
        self.finished.notify_all();
        self.predecessors.lock().unwrap().clear();
        // a task that never ran may still own accessors of its buffers
        self.operation.lock().unwrap().take();
        if let Err(e) = result {
            log::warn!("Task {} {} failed: {}", self.id, self.label, e);
            if let Some(errors) = &self.errors {
                errors.lock().unwrap().push(e);
            }
        } else {
            log::trace!("Task {} {} complete", self.id, self.label);
        }
        // the scheduler is gone after shutdown, nothing waits on it then
        let _ = self.notify.send(Command::Finished(self.id));
        true
    }

    fn wait_predecessors(&self) -> Result<(), String> {
        let predecessors = self.predecessors.lock().unwrap().clone();
        predecessors
            .iter()
            .map(|node| node.wait().map_err(|e| e.to_string()))
            .fold(Ok(()), |first, result| first.and(result))
    }

    fn dependency_failed(&self, cause: String) -> Error {
        Error::DependencyFailed {
            node: self.id,
            cause,
        }
    }

    /// Block until the predecessors finished, then run `f` on the calling thread and
    /// finish the task with its result.
    pub(crate) fn run_inline<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), Error>,
    {
        let result = match self.wait_predecessors() {
            Ok(()) => {
                self.set_enqueued(None);
                f()
            }
            Err(cause) => Err(self.dependency_failed(cause)),
        };
        self.finish(result);
    }

    /// Block until the predecessors finished and hand the task to the host, which
    /// finishes it later. Fails the task if a predecessor failed.
    pub(crate) fn acquire(&self) -> Result<(), Error> {
        if let Err(cause) = self.wait_predecessors() {
            let e = self.dependency_failed(cause);
            self.finish(Err(e.clone()));
            return Err(e);
        }
        self.set_enqueued(None);
        log::debug!("Task {} {} held by the host", self.id, self.label);
        Ok(())
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .field("predecessors", &self.predecessor_ids)
            .finish()
    }
}

/// Command to the scheduler
pub(crate) enum Command {
    /// Insert(node)
    Insert(Arc<TaskNode>),
    /// Finished(node_id)
    Finished(NodeId),
    /// Drain(reply_tx), reply once no task is pending or running
    Drain(channel::Sender<()>),
    /// Shutdown
    Shutdown,
}

enum Readiness {
    Wait,
    Ready(Vec<StreamEvent>, usize),
    Fail(String),
}

struct Scheduler {
    rx: channel::Receiver<Command>,
    pending: Vec<Arc<TaskNode>>,
    running: HashMap<NodeId, Arc<TaskNode>>,
    drains: Vec<channel::Sender<()>>,
}

impl Scheduler {
    fn run(mut self) {
        use Command::*;
        while let Ok(command) = self.rx.recv() {
            match command {
                Insert(node) => self.pending.push(node),
                Finished(node_id) => {
                    self.running.remove(&node_id);
                }
                Drain(reply) => self.drains.push(reply),
                Shutdown => break,
            }
            self.schedule();
            if self.pending.is_empty() && self.running.is_empty() {
                for reply in self.drains.drain(..) {
                    let _ = reply.send(());
                }
            }
        }
        for node in self.pending.drain(..) {
            node.finish(Err(Error::Runtime("task graph shut down".to_string())));
        }
        log::debug!("TaskGraph scheduler exits");
    }

    fn schedule(&mut self) {
        loop {
            let mut progress = false;
            let mut i = 0;
            while i < self.pending.len() {
                match readiness(&self.pending[i]) {
                    Readiness::Wait => i += 1,
                    Readiness::Fail(cause) => {
                        let node = self.pending.remove(i);
                        node.finish(Err(Error::DependencyFailed {
                            node: node.id,
                            cause,
                        }));
                        progress = true;
                    }
                    Readiness::Ready(waits, cross_stream) => {
                        let node = self.pending.remove(i);
                        self.dispatch(node, waits, cross_stream);
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn dispatch(&mut self, node: Arc<TaskNode>, waits: Vec<StreamEvent>, cross_stream: usize) {
        let operation = node.operation.lock().unwrap().take();
        let (operation, stream) = match (operation, &node.stream) {
            (Some(operation), Some(stream)) => (operation, stream),
            _ => {
                node.finish(Err(Error::Runtime(format!(
                    "task {} has nothing to enqueue",
                    node.id
                ))));
                return;
            }
        };
        log::debug!(
            "Task {} {} enqueued on stream {}, {} cross-stream waits",
            node.id,
            node.label,
            stream.id(),
            cross_stream
        );
        match stream.submit_with(operation, waits) {
            Ok(event) => {
                node.set_enqueued(Some(event.clone()));
                self.running.insert(node.id, Arc::clone(&node));
                event.then(move |result| {
                    let result = result
                        .clone()
                        .map_err(|e| Error::from_task(node.id, e));
                    node.finish(result);
                });
            }
            Err(e) => {
                node.finish(Err(Error::from_task(node.id, e)));
            }
        }
    }
}

// Same-stream predecessors are passed along with the others; stream order has resolved
// them before the worker reaches the task, they only carry failures over.
fn readiness(node: &TaskNode) -> Readiness {
    let predecessors = node.predecessors.lock().unwrap();
    let mut waits = vec![];
    let mut cross_stream = 0;
    let mut failure = None;
    let mut all_final = true;
    let mut blocked = false;
    for predecessor in predecessors.iter() {
        let status = predecessor.status.lock().unwrap();
        match status.state {
            TaskState::Complete => {}
            TaskState::Failed => {
                if failure.is_none() {
                    failure = status.error.as_ref().map(|e| e.to_string());
                }
            }
            TaskState::Enqueued => {
                all_final = false;
                match &status.stream_event {
                    Some(event) => {
                        if predecessor.stream != node.stream {
                            cross_stream += 1;
                        }
                        waits.push(event.clone());
                    }
                    None => blocked = true,
                }
            }
            TaskState::NotEnqueued => {
                all_final = false;
                blocked = true;
            }
        }
    }
    match failure {
        Some(cause) if all_final => Readiness::Fail(cause),
        Some(_) => Readiness::Wait,
        None if blocked => Readiness::Wait,
        None => Readiness::Ready(waits, cross_stream),
    }
}

fn merge(predecessors: Vec<Arc<TaskNode>>, spawned: &[Arc<TaskNode>]) -> Vec<Arc<TaskNode>> {
    let mut merged: Vec<Arc<TaskNode>> = vec![];
    for node in predecessors.into_iter().chain(spawned.iter().cloned()) {
        if merged.iter().all(|m| m.id != node.id) {
            merged.push(node);
        }
    }
    merged
}

/// TaskGraph
pub(crate) struct TaskGraph {
    tx: channel::Sender<Command>,
    scheduler: Mutex<Option<thread::JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl TaskGraph {
    pub fn new() -> Result<Self, Error> {
        let (tx, rx) = channel::unbounded();
        let scheduler = Scheduler {
            rx,
            pending: vec![],
            running: HashMap::new(),
            drains: vec![],
        };
        let join_handle = thread::Builder::new()
            .name("task-graph".to_string())
            .spawn(move || scheduler.run())
            .map_err(|e| Error::Runtime(format!("cannot spawn scheduler: {}", e)))?;
        Ok(TaskGraph {
            tx,
            scheduler: Mutex::new(Some(join_handle)),
            next_id: AtomicUsize::new(0),
        })
    }

    fn new_node(
        &self,
        label: &'static str,
        operation: Option<StreamOperation>,
        stream: Option<Stream>,
        predecessors: Vec<Arc<TaskNode>>,
        errors: Option<ErrorList>,
    ) -> Arc<TaskNode> {
        let predecessor_ids = predecessors.iter().map(|node| node.id).collect::<Vec<_>>();
        let predecessors = predecessors
            .into_iter()
            .filter(|node| !node.is_complete())
            .collect();
        Arc::new(TaskNode {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            label,
            operation: Mutex::new(operation),
            predecessors: Mutex::new(predecessors),
            predecessor_ids,
            stream,
            status: Mutex::new(NodeStatus {
                state: TaskState::NotEnqueued,
                error: None,
                stream_event: None,
            }),
            finished: Condvar::new(),
            errors,
            notify: self.tx.clone(),
        })
    }

    /// Insert an operation ordered after `predecessors` and everything the submitting
    /// command group spawned before.
    pub fn insert(
        &self,
        label: &'static str,
        operation: StreamOperation,
        stream: &Stream,
        predecessors: Vec<Arc<TaskNode>>,
        spawned: &[Arc<TaskNode>],
        errors: Option<ErrorList>,
    ) -> Result<Arc<TaskNode>, Error> {
        let node = self.new_node(
            label,
            Some(operation),
            Some(stream.clone()),
            merge(predecessors, spawned),
            errors,
        );
        log::debug!(
            "Task {} {} spawned after {:?}",
            node.id,
            label,
            node.predecessor_ids
        );
        self.tx
            .send(Command::Insert(Arc::clone(&node)))
            .map_err(|_| Error::Runtime("task graph shut down".to_string()))?;
        Ok(node)
    }

    /// Create a task the calling thread runs itself, ordered after `predecessors` and
    /// everything the submitting command group spawned before. Nothing waits here: the
    /// caller registers the task with its buffers first, releases them and then starts
    /// it with [`TaskNode::run_inline`] or [`TaskNode::acquire`].
    pub fn host_task(
        &self,
        label: &'static str,
        predecessors: Vec<Arc<TaskNode>>,
        spawned: &[Arc<TaskNode>],
        errors: Option<ErrorList>,
    ) -> Arc<TaskNode> {
        let node = self.new_node(label, None, None, merge(predecessors, spawned), errors);
        log::debug!(
            "Task {} {} runs on the host after {:?}",
            node.id,
            label,
            node.predecessor_ids
        );
        node
    }

    /// Block until every inserted task finished.
    pub fn drain(&self) -> Result<(), Error> {
        let (tx, rx) = channel::bounded(1);
        self.tx
            .send(Command::Drain(tx))
            .map_err(|_| Error::Runtime("task graph shut down".to_string()))?;
        rx.recv()
            .map_err(|_| Error::Runtime("task graph shut down".to_string()))
    }

    /// Stop the scheduler. Tasks still waiting fail.
    pub fn shutdown(&self) {
        if let Some(join_handle) = self.scheduler.lock().unwrap().take() {
            let _ = self.tx.send(Command::Shutdown);
            if join_handle.join().is_err() {
                log::warn!("TaskGraph scheduler panicked");
            }
        }
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use stream_manager::StreamManager;

    pub(crate) fn gate() -> (channel::Sender<()>, StreamOperation) {
        let (tx, rx) = channel::unbounded::<()>();
        let op = StreamOperation::Host(Box::new(move || {
            rx.recv_timeout(Duration::from_secs(10))
                .map_err(|_| stream_manager::Error::TaskFailed("gate closed".to_string()))
        }));
        (tx, op)
    }

    fn noop() -> StreamOperation {
        StreamOperation::Host(Box::new(|| Ok(())))
    }

    fn streams(n: usize) -> Vec<Stream> {
        let handle = StreamManager::new().run();
        (0..n)
            .map(|_| handle.stream(handle.create_stream(0).unwrap()).unwrap())
            .collect()
    }

    #[serial]
    #[test]
    fn test_cross_stream_order() {
        let graph = TaskGraph::new().unwrap();
        let streams = streams(3);
        let (open, gated) = gate();
        let first = graph
            .insert("gated", gated, &streams[0], vec![], &[], None)
            .unwrap();
        let second = graph
            .insert("after", noop(), &streams[1], vec![Arc::clone(&first)], &[], None)
            .unwrap();
        // stream 1 now waits on stream 0, unrelated work elsewhere goes on
        let unrelated = graph
            .insert("unrelated", noop(), &streams[2], vec![], &[], None)
            .unwrap();
        unrelated.wait().unwrap();
        assert_eq!(second.predecessor_ids(), &[first.id()]);
        assert!(!second.state().is_final());
        open.send(()).unwrap();
        second.wait().unwrap();
        assert!(first.is_complete());
        graph.drain().unwrap();
    }

    #[serial]
    #[test]
    fn test_failure_propagates() {
        let graph = TaskGraph::new().unwrap();
        let streams = streams(2);
        let errors: ErrorList = Arc::new(Mutex::new(vec![]));
        let failing = StreamOperation::Host(Box::new(|| {
            Err(stream_manager::Error::TaskFailed("boom".to_string()))
        }));
        let first = graph
            .insert("failing", failing, &streams[0], vec![], &[], Some(Arc::clone(&errors)))
            .unwrap();
        let second = graph
            .insert("same", noop(), &streams[0], vec![Arc::clone(&first)], &[], None)
            .unwrap();
        let third = graph
            .insert("cross", noop(), &streams[1], vec![Arc::clone(&second)], &[], None)
            .unwrap();
        assert!(matches!(first.wait(), Err(Error::TaskFailed { .. })));
        assert!(matches!(second.wait(), Err(Error::DependencyFailed { .. })));
        assert!(matches!(third.wait(), Err(Error::DependencyFailed { .. })));
        assert_eq!(third.state(), TaskState::Failed);
        graph.drain().unwrap();
        assert_eq!(errors.lock().unwrap().len(), 1);
        // inline tasks after a failure are skipped too
        let ran = Arc::new(Mutex::new(false));
        let inline = graph.host_task("inline", vec![third], &[], None);
        {
            let ran = Arc::clone(&ran);
            inline.run_inline(move || {
                *ran.lock().unwrap() = true;
                Ok(())
            });
        }
        assert_eq!(inline.state(), TaskState::Failed);
        assert!(!*ran.lock().unwrap());
    }

    #[serial]
    #[test]
    fn test_held_task_blocks_successors() {
        let graph = TaskGraph::new().unwrap();
        let streams = streams(1);
        let write = graph.insert("write", noop(), &streams[0], vec![], &[], None).unwrap();
        let held = graph.host_task("host", vec![Arc::clone(&write)], &[], None);
        assert_eq!(held.state(), TaskState::NotEnqueued);
        held.acquire().unwrap();
        assert!(write.is_complete());
        assert_eq!(held.state(), TaskState::Enqueued);
        let after = graph
            .insert("after", noop(), &streams[0], vec![Arc::clone(&held)], &[], None)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(after.state(), TaskState::NotEnqueued);
        assert!(held.finish(Ok(())));
        assert!(!held.finish(Err(Error::Runtime("late".to_string()))));
        after.wait().unwrap();
    }

    #[serial]
    #[test]
    fn test_merge_spawned() {
        let graph = TaskGraph::new().unwrap();
        let streams = streams(1);
        let (open, gated) = gate();
        let first = graph.insert("first", gated, &streams[0], vec![], &[], None).unwrap();
        let spawned = vec![Arc::clone(&first)];
        let second = graph
            .insert("second", noop(), &streams[0], vec![Arc::clone(&first)], &spawned, None)
            .unwrap();
        assert_eq!(second.predecessor_ids(), &[first.id()]);
        open.send(()).unwrap();
        graph.drain().unwrap();
        assert!(second.is_complete());
        graph.shutdown();
        assert!(graph.insert("late", noop(), &streams[0], vec![], &[], None).is_err());
    }
}
