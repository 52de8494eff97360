//! StreamEvent is the raw completion handle returned for every stream submission.

use crate::Error;
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

type Callback = Box<dyn FnOnce(&Result<(), Error>) + Send>;

struct EventState {
    result: Option<Result<(), Error>>,
    callbacks: Vec<Callback>,
}

struct Inner {
    state: Mutex<EventState>,
    resolved: Condvar,
}

/// Completion handle of one stream operation.
#[derive(Clone)]
pub struct StreamEvent {
    inner: Arc<Inner>,
}

impl StreamEvent {
    pub(crate) fn new() -> Self {
        StreamEvent {
            inner: Arc::new(Inner {
                state: Mutex::new(EventState {
                    result: None,
                    callbacks: vec![],
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Create an event that already carries its result.
    pub fn resolved(result: Result<(), Error>) -> Self {
        let event = StreamEvent::new();
        event.resolve(result);
        event
    }

    /// Non-blocking poll, `None` while the operation is pending.
    pub fn query(&self) -> Option<Result<(), Error>> {
        self.inner.state.lock().unwrap().result.clone()
    }

    /// Whether the operation finished, successfully or not.
    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().unwrap().result.is_some()
    }

    /// Block until the operation finished.
    pub fn synchronize(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self.inner.resolved.wait(state).unwrap();
        }
    }

    /// Block until the operation finished or the timeout elapsed.
    pub fn synchronize_timeout(&self, timeout: Duration) -> Option<Result<(), Error>> {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .resolved
            .wait_timeout_while(state, timeout, |state| state.result.is_none())
            .unwrap();
        state.result.clone()
    }

    /// Register a completion callback. It runs on the stream worker when the operation
    /// finishes, or right away on the calling thread if it already has.
    pub fn then<F>(&self, callback: F)
    where
        F: 'static + FnOnce(&Result<(), Error>) + Send,
    {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }

    /// Whether both handles refer to the same operation.
    pub fn same_as(&self, other: &StreamEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn resolve(&self, result: Result<(), Error>) {
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap();
            if state.result.is_some() {
                log::warn!("StreamEvent resolved twice, keeping the first result");
                return;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.inner.resolved.notify_all();
        for callback in callbacks {
            callback(&result);
        }
    }
}

impl fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEvent")
            .field("result", &self.query())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel;
    use std::thread;

    #[test]
    fn test_resolve_wakes_waiters() {
        let event = StreamEvent::new();
        assert!(event.query().is_none());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.synchronize())
        };
        event.resolve(Ok(()));
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert!(event.is_resolved());
    }

    #[test]
    fn test_callbacks() {
        let event = StreamEvent::new();
        let (tx, rx) = channel::unbounded();
        {
            let tx = tx.clone();
            event.then(move |result| tx.send(result.clone()).unwrap());
        }
        assert!(rx.try_recv().is_err());
        event.resolve(Err(Error::TaskFailed("x".to_string())));
        assert_eq!(rx.try_recv().unwrap(), Err(Error::TaskFailed("x".to_string())));
        // registered after resolution: runs immediately
        event.then(move |result| tx.send(result.clone()).unwrap());
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_first_result_wins() {
        let event = StreamEvent::resolved(Ok(()));
        event.resolve(Err(Error::Disconnected));
        assert_eq!(event.synchronize(), Ok(()));
        assert!(event.same_as(&event.clone()));
        assert!(!event.same_as(&StreamEvent::new()));
        assert!(StreamEvent::new()
            .synchronize_timeout(Duration::from_millis(10))
            .is_none());
    }
}
