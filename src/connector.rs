use crate::sync::{Condvar, Mutex};
use core::any::Any;
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Typed, blocking MPMC queue connecting a set of producer task threads to a
/// set of consumer task threads.
///
/// A connector carries a *producer count*: the number of upstream task
/// threads that may still push into it. Producers decrement the count via
/// [`Connector::producer_finished`] when they shut down; once the count
/// reaches zero and the queue drains, the connector is *terminated* and every
/// blocked consumer observes the terminal state (`None` from
/// [`Connector::consume`]). Termination therefore propagates along the graph
/// without any global coordinator.
///
/// Ordering: FIFO among items pushed by any single producer thread;
/// interleaving across producers is unspecified.
pub struct Connector<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Number of producer threads that have not yet finished.
    producer_count: usize,
    /// Set by a graph-wide forced termination; overrides the producer count.
    forced: bool,
    max_queue_size: usize,
}

impl<T> Default for Connector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Connector<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                producer_count: 0,
                forced: false,
                max_queue_size: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueues one record and wakes at most one waiting consumer.
    ///
    /// Producing into a force-terminated connector is a no-op: the producer
    /// has already been counted down, so the record is dropped.
    pub fn produce(&self, data: T) {
        let mut state = self.state.lock().expect("Connector::produce: [1]");
        if state.forced {
            return;
        }
        state.queue.push_back(data);
        if state.queue.len() > state.max_queue_size {
            state.max_queue_size = state.queue.len();
        }
        drop(state);
        self.cond.notify_one();
    }

    /// Dequeues one record, blocking while the queue is empty and the
    /// connector has live producers. Returns `None` once the connector is
    /// terminated and drained.
    pub fn consume(&self) -> Option<T> {
        let mut state = self.state.lock().expect("Connector::consume: [1]");
        loop {
            if let Some(data) = state.queue.pop_front() {
                return Some(data);
            }
            if state.terminated() {
                return None;
            }
            state = self
                .cond
                .wait(state)
                .expect("Connector::consume: [2]");
        }
    }

    /// Dequeues one record, waiting at most `timeout`.
    ///
    /// Returns `None` both on timeout and on termination; pollers re-check
    /// [`Connector::is_input_terminated`] to tell the cases apart.
    pub fn poll_consume(&self, timeout: Duration) -> Option<T> {
        #[cfg(feature = "loom")]
        {
            let _ = timeout;
            self.consume()
        }
        #[cfg(not(feature = "loom"))]
        {
            let deadline = std::time::Instant::now() + timeout;
            let mut state = self.state.lock().expect("Connector::poll_consume: [1]");
            loop {
                if let Some(data) = state.queue.pop_front() {
                    return Some(data);
                }
                if state.terminated() {
                    return None;
                }
                let now = std::time::Instant::now();
                let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
                else {
                    return None;
                };
                let (guard, _timed_out) = self
                    .cond
                    .wait_timeout(state, remaining)
                    .expect("Connector::poll_consume: [2]");
                state = guard;
            }
        }
    }

    /// Registers `count` additional producer threads.
    ///
    /// Called during edge application, before execution starts; the count
    /// only decreases afterwards.
    pub fn increment_producer_count(&self, count: usize) {
        let mut state = self
            .state
            .lock()
            .expect("Connector::increment_producer_count: [1]");
        state.producer_count += count;
    }

    /// Signals that one producer thread has finished.
    ///
    /// When the last producer finishes, **all** waiting consumers are woken
    /// so they can observe the terminal state.
    pub fn producer_finished(&self) {
        let mut state = self.state.lock().expect("Connector::producer_finished: [1]");
        state.producer_count = state
            .producer_count
            .checked_sub(1)
            .expect("Connector::producer_finished: [2]");
        let last = state.producer_count == 0;
        drop(state);
        if last {
            self.cond.notify_all();
        }
    }

    /// Forces the terminal state regardless of live producers and wakes all
    /// waiters. Used by graph-wide cancellation.
    pub fn terminate(&self) {
        let mut state = self.state.lock().expect("Connector::terminate: [1]");
        state.forced = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Wakes all consumers without changing state, letting sibling threads of
    /// a self-terminating task re-check their termination condition.
    pub fn wakeup_consumer(&self) {
        self.cond.notify_all();
    }

    /// Whether the connector is terminated: force-terminated, or drained with
    /// no live producers.
    pub fn is_input_terminated(&self) -> bool {
        self.state
            .lock()
            .expect("Connector::is_input_terminated: [1]")
            .terminated()
    }

    pub fn producer_count(&self) -> usize {
        self.state
            .lock()
            .expect("Connector::producer_count: [1]")
            .producer_count
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().expect("Connector::queue_size: [1]").queue.len()
    }

    /// Largest queue length ever observed; reported by task profiling.
    pub fn max_queue_size(&self) -> usize {
        self.state
            .lock()
            .expect("Connector::max_queue_size: [1]")
            .max_queue_size
    }
}

impl<T> State<T> {
    fn terminated(&self) -> bool {
        self.forced || (self.producer_count == 0 && self.queue.is_empty())
    }
}

impl<T> fmt::Debug for Connector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("Connector::fmt: [1]");
        f.debug_struct("Connector")
            .field("queue_size", &state.queue.len())
            .field("producer_count", &state.producer_count)
            .field("terminated", &state.terminated())
            .finish()
    }
}

/// Untyped view of a [`Connector`], used by graph-level bookkeeping where
/// connectors of heterogeneous record types live side by side.
///
/// The typed queue operations stay on [`Connector`]; this trait only carries
/// the producer-count protocol, forced termination, introspection, and an
/// `Any`-based escape hatch so edges can recover the typed connector.
pub trait AnyConnector: Send + Sync {
    fn increment_producer_count(&self, count: usize);
    fn producer_finished(&self);
    fn wakeup_consumer(&self);
    fn terminate(&self);
    fn is_input_terminated(&self) -> bool;
    fn producer_count(&self) -> usize;
    fn queue_size(&self) -> usize;
    fn max_queue_size(&self) -> usize;
    /// Name of the record type flowing through this connector.
    fn record_type_name(&self) -> &'static str;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + 'static> AnyConnector for Connector<T> {
    fn increment_producer_count(&self, count: usize) {
        Connector::increment_producer_count(self, count);
    }

    fn producer_finished(&self) {
        Connector::producer_finished(self);
    }

    fn wakeup_consumer(&self) {
        Connector::wakeup_consumer(self);
    }

    fn terminate(&self) {
        Connector::terminate(self);
    }

    fn is_input_terminated(&self) -> bool {
        Connector::is_input_terminated(self)
    }

    fn producer_count(&self) -> usize {
        Connector::producer_count(self)
    }

    fn queue_size(&self) -> usize {
        Connector::queue_size(self)
    }

    fn max_queue_size(&self) -> usize {
        Connector::max_queue_size(self)
    }

    fn record_type_name(&self) -> &'static str {
        core::any::type_name::<T>()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
