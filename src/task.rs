pub(crate) mod manager;

pub use manager::TaskManagerProfile;

use crate::{
    connector::Connector,
    graph::comm::TaskGraphCommunicator,
    memory::{Memory, MemoryError, MemoryReleaseRule, ReleaseCountRule},
    types::HashMap,
    utils::short_type_name,
};
use core::time::Duration;
use std::sync::Arc;

/// A single stateful unit of computation in the dataflow graph.
///
/// Each instance corresponds to one thread of execution: the runtime calls
/// `initialize` once when the thread starts, `execute_task` once per input
/// record (with `None` for start-task and polling invocations), and
/// `shutdown` once when the upstream connector terminates. Replication,
/// whether across threads ([`ITask::num_threads`]) or across
/// execution-pipeline replicas, goes through [`ITask::copy`], which must
/// produce a fresh instance ready to be initialized.
///
/// Within `execute_task` the task may call [`TaskContext::add_result`] zero
/// or more times to emit outputs, and borrow pooled buffers from a named
/// memory edge via [`TaskContext::get_memory`].
pub trait ITask: Send + 'static {
    /// Record type consumed from the input connector.
    type Input: Send + 'static;
    /// Record type produced into the output connector.
    type Output: Send + 'static;

    /// Called once on the worker thread before any data is processed.
    fn initialize(&mut self, _ctx: &mut TaskContext<'_, Self::Output>) {}

    /// Processes one input record.
    ///
    /// `data` is `None` for the single invocation of a start task and for
    /// polling wakeups that elapsed without input.
    fn execute_task(&mut self, data: Option<Self::Input>, ctx: &mut TaskContext<'_, Self::Output>);

    /// Called once on the worker thread after the task's input terminated.
    fn shutdown(&mut self, _ctx: &mut TaskContext<'_, Self::Output>) {}

    /// Produces a fresh replica of this task for thread or pipeline
    /// replication.
    fn copy(&self) -> Self
    where
        Self: Sized;

    /// Whether this task is ready to terminate. The default terminates once
    /// the input connector does; tasks that feed themselves through a memory
    /// back-edge may override this.
    fn can_terminate(&self, input: Option<&Connector<Self::Input>>) -> bool {
        input.map_or(true, Connector::is_input_terminated)
    }

    fn name(&self) -> String
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    /// A start task has no input connector; its `execute_task` is invoked
    /// exactly once with `None`, then the task terminates.
    fn is_start_task(&self) -> bool {
        false
    }

    /// Number of worker threads sharing this task's connectors. Values above
    /// one replicate the task via [`ITask::copy`].
    fn num_threads(&self) -> usize {
        1
    }

    /// When set, the task polls its input: a consume that elapses without
    /// data invokes `execute_task(None)` instead of blocking indefinitely.
    fn poll_timeout(&self) -> Option<Duration> {
        None
    }

    /// Fill color of this task's node in generated DOT output.
    fn dot_fill_color(&self) -> String {
        "white".to_string()
    }
}

/// Connector pair wired to a task by a memory edge.
#[derive(Clone)]
pub(crate) struct MemoryEdgeHandles {
    pub(crate) acquisition: Arc<dyn crate::connector::AnyConnector>,
    pub(crate) release: Arc<dyn crate::connector::AnyConnector>,
}

pub(crate) type MemoryEdgeMap = HashMap<String, MemoryEdgeHandles>;

/// Per-invocation API handed to [`ITask`] callbacks.
///
/// Carries the task's output connector, its named memory edges, and the
/// pipeline coordinates assigned during graph copy.
pub struct TaskContext<'a, U: Send + 'static> {
    output: Option<&'a Arc<Connector<U>>>,
    memory: &'a MemoryEdgeMap,
    communicator: Option<&'a Arc<TaskGraphCommunicator>>,
    pipeline_id: usize,
    num_pipelines: usize,
}

impl<'a, U: Send + 'static> TaskContext<'a, U> {
    pub(crate) fn new(
        output: Option<&'a Arc<Connector<U>>>,
        memory: &'a MemoryEdgeMap,
        communicator: Option<&'a Arc<TaskGraphCommunicator>>,
        pipeline_id: usize,
        num_pipelines: usize,
    ) -> Self {
        Self {
            output,
            memory,
            communicator,
            pipeline_id,
            num_pipelines,
        }
    }

    /// Emits one output record into the task's output connector. A no-op for
    /// tasks without a downstream edge.
    pub fn add_result(&self, data: U) {
        if let Some(output) = self.output {
            output.produce(data);
        }
    }

    /// Identity of the execution-pipeline replica this task runs in, in
    /// `[0, num_pipelines)`.
    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    pub fn num_pipelines(&self) -> usize {
        self.num_pipelines
    }

    pub fn has_memory_edge(&self, name: &str) -> bool {
        self.memory.contains_key(name)
    }

    /// Borrows one buffer from the named memory edge, blocking while the
    /// pool is empty. The buffer is recycled after a matching
    /// [`TaskContext::release_memory`].
    pub fn get_memory<B: Send + 'static>(&self, name: &str) -> Result<Memory<B>, MemoryError> {
        self.get_memory_with_rule(name, ReleaseCountRule::new(1))
    }

    /// Borrows one buffer and attaches a release rule deciding when the
    /// memory manager may recycle it.
    pub fn get_memory_with_rule<B, R>(&self, name: &str, rule: R) -> Result<Memory<B>, MemoryError>
    where
        B: Send + 'static,
        R: MemoryReleaseRule,
    {
        let mut memory = self.acquire::<B>(name)?;
        memory.set_release_rule(Box::new(rule));
        Ok(memory)
    }

    /// Borrows one buffer from a dynamic memory edge, allocating `size`
    /// elements at acquisition time.
    pub fn get_dynamic_memory<B, R>(
        &self,
        name: &str,
        rule: R,
        size: usize,
    ) -> Result<Memory<B>, MemoryError>
    where
        B: Send + 'static,
        R: MemoryReleaseRule,
    {
        let mut memory = self.get_memory_with_rule(name, rule)?;
        memory.allocate(size)?;
        Ok(memory)
    }

    /// Returns a borrowed buffer to its memory manager, which recycles it
    /// once the buffer's release rule allows.
    ///
    /// Routing goes through the graph communicator by the buffer's address,
    /// so memory may be released by a different task (or a different
    /// pipeline replica's graph) than the one that borrowed it.
    pub fn release_memory<B: Send + 'static>(&self, memory: Memory<B>) -> Result<(), MemoryError> {
        let communicator = self
            .communicator
            .ok_or_else(|| MemoryError::UnknownAddress(memory.address().to_string()))?;
        communicator.release(memory)
    }

    pub(crate) fn output_connector(&self) -> Option<Arc<Connector<U>>> {
        self.output.cloned()
    }

    pub(crate) fn communicator(&self) -> Option<Arc<TaskGraphCommunicator>> {
        self.communicator.cloned()
    }

    fn acquire<B: Send + 'static>(&self, name: &str) -> Result<Memory<B>, MemoryError> {
        let handles = self
            .memory
            .get(name)
            .ok_or_else(|| MemoryError::UnknownEdge(name.to_string()))?;
        let connector = handles
            .acquisition
            .clone()
            .as_any_arc()
            .downcast::<Connector<Memory<B>>>()
            .map_err(|_| MemoryError::TypeMismatch(name.to_string()))?;
        connector
            .consume()
            .ok_or_else(|| MemoryError::Terminated(name.to_string()))
    }
}
