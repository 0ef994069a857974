use crate::{
    graph::TaskGraphConf,
    memory::{Memory, MemoryError},
    task::manager::{AnyTaskManager, TaskManagerProfile},
};
use std::thread::{self, JoinHandle};

/// Owns the worker threads executing a [`TaskGraphConf`].
///
/// `execute_graph` spawns one OS thread per task-manager replica (a task
/// with `num_threads == n` gets `n` threads sharing its connectors);
/// `wait_for_runtime` joins them, and `terminate_all` forces every connector
/// into the terminal state before joining. The graph's I/O surface is
/// re-exposed here so a caller drives the whole lifecycle through one
/// object.
pub struct TaskGraphRuntime<In: Send + 'static, Out: Send + 'static> {
    graph: TaskGraphConf<In, Out>,
    threads: Vec<JoinHandle<(String, TaskManagerProfile)>>,
    profiles: Vec<(String, TaskManagerProfile)>,
    executed: bool,
}

impl<In: Send + 'static, Out: Send + 'static> TaskGraphRuntime<In, Out> {
    pub fn new(graph: TaskGraphConf<In, Out>) -> Self {
        Self {
            graph,
            threads: Vec::new(),
            profiles: Vec::new(),
            executed: false,
        }
    }

    /// Finalizes the graph and spawns its worker threads. Idempotent.
    pub fn execute_graph(&mut self) {
        if self.executed {
            return;
        }
        self.executed = true;
        self.graph.finalize();
        let managers = self.graph.take_managers();
        log::debug!("spawning threads for {} task managers", managers.len());
        for (_, manager) in managers {
            for replica in 1..manager.num_threads() {
                self.spawn(manager.clone_for_thread(), replica);
            }
            self.spawn(manager, 0);
        }
    }

    fn spawn(&mut self, mut manager: Box<dyn AnyTaskManager>, replica: usize) {
        let thread_name = format!("{}-{replica}", manager.name());
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let profile = manager.run();
                (manager.name(), profile)
            })
            .expect("TaskGraphRuntime::spawn: [1]");
        self.threads.push(handle);
    }

    /// Submits one record to the graph input.
    pub fn produce_data(&self, data: In) {
        self.graph.produce_data(data);
    }

    /// Signals that the caller is done producing input.
    pub fn finish_producing_data(&self) {
        self.graph.finish_producing_data();
    }

    /// Dequeues one record from the graph output; `None` once the graph's
    /// producers all terminated.
    pub fn consume_data(&self) -> Option<Out> {
        self.graph.consume_data()
    }

    pub fn is_output_terminated(&self) -> bool {
        self.graph.is_output_terminated()
    }

    /// Releases a borrowed buffer on behalf of a caller outside the graph.
    pub fn release_memory<B: Send + 'static>(&self, memory: Memory<B>) -> Result<(), MemoryError> {
        self.graph.release_memory(memory)
    }

    /// Joins every worker thread. The caller must have ended the input
    /// stream (`finish_producing_data`) or forced termination first, or this
    /// blocks forever.
    pub fn wait_for_runtime(&mut self) {
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(entry) => self.profiles.push(entry),
                // User-task panics are not caught by the runtime; re-raise
                // on the waiting thread.
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
    }

    /// Cooperative cancellation: forces every connector terminal, wakes all
    /// waiters, and joins. In-flight `execute_task` calls complete.
    pub fn terminate_all(&mut self) {
        self.graph.terminate_all_connectors();
        self.wait_for_runtime();
    }

    /// Per-thread profiles, one entry per worker thread, available after
    /// [`TaskGraphRuntime::wait_for_runtime`].
    pub fn task_profiles(&self) -> &[(String, TaskManagerProfile)] {
        &self.profiles
    }

    pub fn graph(&self) -> &TaskGraphConf<In, Out> {
        &self.graph
    }
}
