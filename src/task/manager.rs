use crate::{
    connector::{AnyConnector, Connector},
    graph::comm::TaskGraphCommunicator,
    task::{ITask, MemoryEdgeHandles, MemoryEdgeMap, TaskContext},
    types::TaskId,
};
use core::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing and queue statistics gathered by one task-manager thread.
#[must_use]
#[derive(Debug, Default, Clone)]
pub struct TaskManagerProfile {
    /// Total time spent inside the task's `execute_task`.
    pub compute_time: Duration,
    /// Total time spent blocked on the input connector.
    pub wait_time: Duration,
    /// Largest input queue length observed over the thread's lifetime.
    pub max_queue_size: usize,
}

/// Untyped handle to a task manager, used by graph-level bookkeeping.
///
/// The typed connectors live on [`TaskManager`]; this trait carries only the
/// operations the graph needs without knowing the task's record types:
/// connector wiring (erased), pipeline assignment, replication, and the
/// worker-thread body.
pub(crate) trait AnyTaskManager: Send {
    fn name(&self) -> String;
    fn num_threads(&self) -> usize;
    fn set_pipeline(&mut self, pipeline_id: usize, num_pipelines: usize);
    fn set_communicator(&mut self, communicator: Arc<TaskGraphCommunicator>);
    fn input_any(&self) -> Option<Arc<dyn AnyConnector>>;
    fn output_any(&self) -> Option<Arc<dyn AnyConnector>>;
    fn set_input_any(&mut self, connector: Arc<dyn AnyConnector>);
    fn set_output_any(&mut self, connector: Arc<dyn AnyConnector>);
    /// Wires a named memory edge. Returns `false` if the name is taken.
    fn add_memory_edge(&mut self, name: String, handles: MemoryEdgeHandles) -> bool;
    /// Replica for a deep graph copy: fresh task state, no connectors.
    fn clone_for_graph(&self) -> Box<dyn AnyTaskManager>;
    /// Replica for an additional worker thread: fresh task state, shared
    /// connectors and memory edges.
    fn clone_for_thread(&self) -> Box<dyn AnyTaskManager>;
    /// The worker-thread body: initialize, consume/execute until the input
    /// terminates, shut down, decrement downstream producer counts.
    fn run(&mut self) -> TaskManagerProfile;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Thread host wrapping one [`ITask`] replica together with its typed
/// connectors.
pub(crate) struct TaskManager<K: ITask> {
    id: TaskId,
    task: K,
    input: Option<Arc<Connector<K::Input>>>,
    output: Option<Arc<Connector<K::Output>>>,
    memory_edges: MemoryEdgeMap,
    communicator: Option<Arc<TaskGraphCommunicator>>,
    pipeline_id: usize,
    num_pipelines: usize,
    profile: TaskManagerProfile,
}

impl<K: ITask> TaskManager<K> {
    pub(crate) fn new(id: TaskId, task: K) -> Self {
        Self {
            id,
            task,
            input: None,
            output: None,
            memory_edges: MemoryEdgeMap::default(),
            communicator: None,
            pipeline_id: 0,
            num_pipelines: 1,
            profile: TaskManagerProfile::default(),
        }
    }

    /// Mutable access to the wrapped task; edges use this to attach
    /// type-specific state (rule schedulers, memory-manager addresses).
    pub(crate) fn task_mut(&mut self) -> &mut K {
        &mut self.task
    }

    fn initialize_task(&mut self) {
        let Self {
            task,
            output,
            memory_edges,
            communicator,
            pipeline_id,
            num_pipelines,
            ..
        } = self;
        let mut ctx = TaskContext::new(
            output.as_ref(),
            memory_edges,
            communicator.as_ref(),
            *pipeline_id,
            *num_pipelines,
        );
        task.initialize(&mut ctx);
    }

    fn invoke(&mut self, data: Option<K::Input>) {
        let Self {
            task,
            output,
            memory_edges,
            communicator,
            pipeline_id,
            num_pipelines,
            profile,
            ..
        } = self;
        let mut ctx = TaskContext::new(
            output.as_ref(),
            memory_edges,
            communicator.as_ref(),
            *pipeline_id,
            *num_pipelines,
        );
        let start = Instant::now();
        task.execute_task(data, &mut ctx);
        profile.compute_time += start.elapsed();
    }

    fn shutdown_task(&mut self) {
        let Self {
            task,
            output,
            memory_edges,
            communicator,
            pipeline_id,
            num_pipelines,
            ..
        } = self;
        let mut ctx = TaskContext::new(
            output.as_ref(),
            memory_edges,
            communicator.as_ref(),
            *pipeline_id,
            *num_pipelines,
        );
        task.shutdown(&mut ctx);
    }

    /// Decrements the producer count of every downstream connector this
    /// thread was counted into: the output edge and each memory-release
    /// edge.
    fn terminate_connections(&self) {
        if let Some(output) = &self.output {
            output.producer_finished();
        }
        for handles in self.memory_edges.values() {
            handles.release.producer_finished();
        }
    }
}

impl<K: ITask> AnyTaskManager for TaskManager<K> {
    fn name(&self) -> String {
        self.task.name()
    }

    fn num_threads(&self) -> usize {
        self.task.num_threads()
    }

    fn set_pipeline(&mut self, pipeline_id: usize, num_pipelines: usize) {
        self.pipeline_id = pipeline_id;
        self.num_pipelines = num_pipelines;
    }

    fn set_communicator(&mut self, communicator: Arc<TaskGraphCommunicator>) {
        self.communicator = Some(communicator);
    }

    fn input_any(&self) -> Option<Arc<dyn AnyConnector>> {
        self.input
            .clone()
            .map(|connector| connector as Arc<dyn AnyConnector>)
    }

    fn output_any(&self) -> Option<Arc<dyn AnyConnector>> {
        self.output
            .clone()
            .map(|connector| connector as Arc<dyn AnyConnector>)
    }

    fn set_input_any(&mut self, connector: Arc<dyn AnyConnector>) {
        let typed = connector
            .as_any_arc()
            .downcast::<Connector<K::Input>>()
            .expect("TaskManager::set_input_any: record type mismatch");
        self.input = Some(typed);
    }

    fn set_output_any(&mut self, connector: Arc<dyn AnyConnector>) {
        let typed = connector
            .as_any_arc()
            .downcast::<Connector<K::Output>>()
            .expect("TaskManager::set_output_any: record type mismatch");
        self.output = Some(typed);
    }

    fn add_memory_edge(&mut self, name: String, handles: MemoryEdgeHandles) -> bool {
        if self.memory_edges.contains_key(&name) {
            return false;
        }
        self.memory_edges.insert(name, handles);
        true
    }

    fn clone_for_graph(&self) -> Box<dyn AnyTaskManager> {
        Box::new(Self::new(self.id, self.task.copy()))
    }

    fn clone_for_thread(&self) -> Box<dyn AnyTaskManager> {
        Box::new(Self {
            id: self.id,
            task: self.task.copy(),
            input: self.input.clone(),
            output: self.output.clone(),
            memory_edges: self.memory_edges.clone(),
            communicator: self.communicator.clone(),
            pipeline_id: self.pipeline_id,
            num_pipelines: self.num_pipelines,
            profile: TaskManagerProfile::default(),
        })
    }

    fn run(&mut self) -> TaskManagerProfile {
        log::debug!(
            "task '{}' starting (pipeline {}/{})",
            self.name(),
            self.pipeline_id,
            self.num_pipelines
        );
        self.initialize_task();

        let input = self.input.clone();
        let mut start_pending = self.task.is_start_task();
        loop {
            if start_pending {
                start_pending = false;
                self.invoke(None);
                continue;
            }
            if self.task.can_terminate(input.as_deref()) {
                break;
            }
            let Some(input) = input.as_ref() else {
                break;
            };
            let waited = Instant::now();
            let data = match self.task.poll_timeout() {
                Some(timeout) => input.poll_consume(timeout),
                None => input.consume(),
            };
            self.profile.wait_time += waited.elapsed();
            match data {
                Some(record) => self.invoke(Some(record)),
                // A polling wakeup without data executes with `None`; a
                // terminal wakeup falls through so the loop head re-checks
                // `can_terminate`.
                None => {
                    if self.task.poll_timeout().is_some() && !input.is_input_terminated() {
                        self.invoke(None);
                    }
                }
            }
        }

        // Sibling threads of this task may still be blocked on the input;
        // wake them so they re-check their own termination condition.
        if let Some(input) = &input {
            input.wakeup_consumer();
        }
        self.shutdown_task();
        self.terminate_connections();
        if let Some(input) = &input {
            self.profile.max_queue_size = input.max_queue_size();
        }
        log::debug!(
            "task '{}' shut down (pipeline {})",
            self.name(),
            self.pipeline_id
        );
        self.profile.clone()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
