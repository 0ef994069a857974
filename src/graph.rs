pub(crate) mod comm;
pub mod dot;
mod edge;

use crate::{
    connector::{AnyConnector, Connector},
    memory::{Memory, MemoryAllocator, MemoryError, MemoryManager, MMType},
    rules::IRule,
    task::{
        manager::{AnyTaskManager, TaskManager},
        ITask,
    },
    types::{GraphId, IndexMap, TaskId},
};
use comm::TaskGraphCommunicator;
use dot::{DotModel, DotNode};
use edge::{
    EdgeDescriptor, GraphConsumerEdge, GraphProducerEdge, MemoryEdge, ProducerConsumerEdge,
    RuleEdge,
};
use core::marker::PhantomData;
use core::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;

/// Error kind for graph-construction failures.
///
/// All construction errors are fatal at build time, before any worker thread
/// is spawned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The graph was finalized; its topology can no longer change.
    #[error("graph is finalized and can no longer be modified")]
    GraphFinalized,
    /// The task handle was minted by a different graph.
    #[error("task handle does not belong to this graph")]
    ForeignTask,
    /// The producer already has a downstream edge; fan-out goes through a
    /// bookkeeper.
    #[error("task '{task}' already has an output connector bound")]
    OutputAlreadyBound { task: String },
    /// The consumer is already fed by the graph input.
    #[error("task '{task}' already has an input connector bound")]
    InputAlreadyBound { task: String },
    /// Memory edge names must be unique per task.
    #[error("memory edge name '{name}' is already attached to task '{task}'")]
    DuplicateMemoryEdge { task: String, name: String },
    /// The rule edge's target does not wrap a bookkeeper of the rule's input
    /// type.
    #[error("task '{task}' is not a bookkeeper accepting this rule's input type")]
    NotABookkeeper { task: String },
}

/// Typed reference to a task registered in a [`TaskGraphConf`].
///
/// Handles make edge construction type-checked at compile time: an edge can
/// only connect a producer of `U` to a consumer of `U`.
#[derive(Debug)]
pub struct TaskHandle<I, O> {
    id: TaskId,
    graph: GraphId,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for TaskHandle<I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for TaskHandle<I, O> {}

/// Untyped assembly state shared between the typed graph wrapper and its
/// edge descriptors.
pub(crate) struct GraphState {
    pub(crate) graph_id: GraphId,
    pub(crate) managers: IndexMap<TaskId, Box<dyn AnyTaskManager>>,
    pub(crate) edges: Vec<Arc<dyn EdgeDescriptor>>,
    /// Every connector created for this graph, for forced termination.
    pub(crate) connectors: Vec<Arc<dyn AnyConnector>>,
    pub(crate) input_any: Arc<dyn AnyConnector>,
    pub(crate) output_any: Arc<dyn AnyConnector>,
    pub(crate) communicator: Arc<TaskGraphCommunicator>,
    pub(crate) pipeline_id: usize,
    pub(crate) num_pipelines: usize,
    /// Unique address prefix for this graph instance; memory edges append
    /// their name to it when registering with the communicator.
    pub(crate) address: String,
    pub(crate) next_task: u32,
    pub(crate) finalized: bool,
    pub(crate) dot: DotModel,
}

/// Declarative assembly of a typed dataflow graph.
///
/// `In` and `Out` are the record types of the graph's input and output
/// connectors. Tasks are registered with [`TaskGraphConf::add_task`] and
/// wired with the `add_*_edge` family; every edge is applied eagerly, so
/// construction errors surface at the faulty call. After
/// [`TaskGraphConf::finalize`] the topology is immutable and the graph is
/// ready for a [`TaskGraphRuntime`](crate::runtime::TaskGraphRuntime).
pub struct TaskGraphConf<In: Send + 'static, Out: Send + 'static> {
    state: GraphState,
    input: Arc<Connector<In>>,
    output: Arc<Connector<Out>>,
}

impl<In: Send + 'static, Out: Send + 'static> Default for TaskGraphConf<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: Send + 'static, Out: Send + 'static> TaskGraphConf<In, Out> {
    pub fn new() -> Self {
        let graph_id = GraphId::fresh();
        let input = Arc::new(Connector::<In>::new());
        let output = Arc::new(Connector::<Out>::new());
        // The external caller producing through `produce_data` counts as one
        // producer of the input connector until `finish_producing_data`.
        input.increment_producer_count(1);
        let state = GraphState {
            graph_id,
            managers: IndexMap::default(),
            edges: Vec::new(),
            connectors: vec![input.clone(), output.clone()],
            input_any: input.clone(),
            output_any: output.clone(),
            communicator: Arc::new(TaskGraphCommunicator::new()),
            pipeline_id: 0,
            num_pipelines: 1,
            address: format!("g{}", graph_id.0),
            next_task: 1,
            finalized: false,
            dot: DotModel::default(),
        };
        Self {
            state,
            input,
            output,
        }
    }

    /// Registers a task and returns its typed handle.
    pub fn add_task<K: ITask>(&mut self, task: K) -> Result<TaskHandle<K::Input, K::Output>, GraphError> {
        self.ensure_mutable()?;
        Ok(self.register_task(task))
    }

    /// Connects `producer` to `consumer` with a typed connector.
    pub fn add_edge<T, U, W>(
        &mut self,
        producer: &TaskHandle<T, U>,
        consumer: &TaskHandle<U, W>,
    ) -> Result<(), GraphError>
    where
        T: Send + 'static,
        U: Send + 'static,
        W: Send + 'static,
    {
        self.ensure_mutable()?;
        self.check_handle(producer)?;
        self.check_handle(consumer)?;
        self.apply_edge(Arc::new(ProducerConsumerEdge::<U>::new(
            producer.id,
            consumer.id,
        )))
    }

    /// Attaches `rule` between a bookkeeper and a consumer. The rule
    /// instance is shared by every pipeline replica of the graph.
    pub fn add_rule_edge<R, W>(
        &mut self,
        bookkeeper: &TaskHandle<R::Input, ()>,
        rule: R,
        consumer: &TaskHandle<R::Output, W>,
    ) -> Result<(), GraphError>
    where
        R: IRule,
        W: Send + 'static,
    {
        self.ensure_mutable()?;
        self.check_handle(bookkeeper)?;
        self.check_handle(consumer)?;
        self.apply_edge(Arc::new(RuleEdge::new(bookkeeper.id, consumer.id, rule)))
    }

    /// Creates a memory manager serving `pool_size` buffers from `allocator`
    /// and wires its acquisition/release pair to `consumer` under `name`.
    pub fn add_memory_manager_edge<A, I, O>(
        &mut self,
        name: &str,
        consumer: &TaskHandle<I, O>,
        allocator: A,
        pool_size: usize,
        mm_type: MMType,
    ) -> Result<(), GraphError>
    where
        A: MemoryAllocator,
        I: Send + 'static,
        O: Send + 'static,
    {
        self.add_custom_memory_manager_edge(
            consumer,
            MemoryManager::new(name, pool_size, allocator, mm_type),
        )
    }

    /// Wires a caller-constructed memory manager to `consumer`.
    ///
    /// The manager is moved into the graph, so a memory manager can never be
    /// attached to two graphs.
    pub fn add_custom_memory_manager_edge<B, I, O>(
        &mut self,
        consumer: &TaskHandle<I, O>,
        manager: MemoryManager<B>,
    ) -> Result<(), GraphError>
    where
        B: Send + 'static,
        I: Send + 'static,
        O: Send + 'static,
    {
        self.ensure_mutable()?;
        self.check_handle(consumer)?;
        let name = manager.edge_name().to_string();
        let mm = self.register_task(manager);
        let result = self.apply_edge(Arc::new(MemoryEdge::<B>::new(name, mm.id, consumer.id)));
        if result.is_err() {
            self.state.managers.shift_remove(&mm.id);
            self.state.dot.nodes.pop();
        }
        result
    }

    /// Designates the task fed by the graph's input connector.
    pub fn set_graph_consumer_task<O>(&mut self, consumer: &TaskHandle<In, O>) -> Result<(), GraphError>
    where
        O: Send + 'static,
    {
        self.ensure_mutable()?;
        self.check_handle(consumer)?;
        self.apply_edge(Arc::new(GraphConsumerEdge::new(consumer.id)))
    }

    /// Adds a task producing into the graph's output connector.
    pub fn add_graph_producer_task<I>(&mut self, producer: &TaskHandle<I, Out>) -> Result<(), GraphError>
    where
        I: Send + 'static,
    {
        self.ensure_mutable()?;
        self.check_handle(producer)?;
        self.apply_edge(Arc::new(GraphProducerEdge::new(producer.id)))
    }

    /// Seals the graph; subsequent mutation attempts return
    /// [`GraphError::GraphFinalized`].
    pub fn finalize(&mut self) {
        self.state.finalized = true;
    }

    /// Submits one record to the graph's input connector.
    pub fn produce_data(&self, data: In) {
        self.input.produce(data);
    }

    /// Counts the external caller out of the input connector's producers;
    /// once the queue drains, the graph-consumer task observes termination.
    pub fn finish_producing_data(&self) {
        self.input.producer_finished();
    }

    /// Dequeues one record from the graph's output connector, blocking until
    /// data arrives or every graph producer terminated.
    pub fn consume_data(&self) -> Option<Out> {
        self.output.consume()
    }

    pub fn is_output_terminated(&self) -> bool {
        self.output.is_input_terminated()
    }

    /// Releases a borrowed buffer from outside the graph, routing it to its
    /// memory manager through the graph communicator.
    pub fn release_memory<B: Send + 'static>(&self, memory: Memory<B>) -> Result<(), MemoryError> {
        self.state.communicator.release(memory)
    }

    /// Renders a DOT description of the graph. `flags` is a bitwise-or of
    /// the `DOTGEN_FLAG_*` constants in [`dot`].
    pub fn gen_dot(&self, flags: u32) -> String {
        dot::render(&self.state, flags)
    }

    /// Deep-copies the graph for one execution-pipeline replica: every task
    /// is cloned via its `copy`, then every edge descriptor re-applies so
    /// that clone-to-clone connectors are created with identical topology.
    pub fn copy(&self, pipeline_id: usize, num_pipelines: usize) -> Self {
        self.copy_with(pipeline_id, num_pipelines, None, None, None)
    }

    pub(crate) fn duplicate(&self) -> Self {
        self.copy_with(
            self.state.pipeline_id,
            self.state.num_pipelines,
            None,
            None,
            None,
        )
    }

    pub(crate) fn copy_with(
        &self,
        pipeline_id: usize,
        num_pipelines: usize,
        input_override: Option<Arc<Connector<In>>>,
        output_override: Option<Arc<Connector<Out>>>,
        communicator: Option<Arc<TaskGraphCommunicator>>,
    ) -> Self {
        let input = input_override.unwrap_or_else(|| {
            let connector = Arc::new(Connector::<In>::new());
            connector.increment_producer_count(1);
            connector
        });
        let output = output_override.unwrap_or_else(|| Arc::new(Connector::<Out>::new()));
        let communicator =
            communicator.unwrap_or_else(|| Arc::clone(&self.state.communicator));
        let managers: IndexMap<_, _> = self
            .state
            .managers
            .iter()
            .map(|(&id, manager)| {
                let mut clone = manager.clone_for_graph();
                clone.set_pipeline(pipeline_id, num_pipelines);
                clone.set_communicator(Arc::clone(&communicator));
                (id, clone)
            })
            .collect();
        let mut state = GraphState {
            graph_id: self.state.graph_id,
            managers,
            edges: Vec::new(),
            connectors: vec![input.clone(), output.clone()],
            input_any: input.clone(),
            output_any: output.clone(),
            communicator,
            pipeline_id,
            num_pipelines,
            // A fresh prefix keeps every copy's memory addresses unique in
            // the shared communicator.
            address: format!("g{}:{}", GraphId::fresh().0, pipeline_id),
            next_task: self.state.next_task,
            finalized: false,
            dot: DotModel {
                nodes: self.state.dot.nodes.clone(),
                edges: Vec::new(),
            },
        };
        for edge in &self.state.edges {
            edge.apply(&mut state).expect("TaskGraphConf::copy: [1]");
            state.edges.push(Arc::clone(edge));
        }
        state.finalized = true;
        log::debug!(
            "copied graph {} as pipeline {}/{}",
            self.state.address,
            pipeline_id,
            num_pipelines
        );
        Self {
            state,
            input,
            output,
        }
    }

    pub(crate) fn take_managers(&mut self) -> IndexMap<TaskId, Box<dyn AnyTaskManager>> {
        core::mem::take(&mut self.state.managers)
    }

    pub(crate) fn terminate_all_connectors(&self) {
        for connector in &self.state.connectors {
            connector.terminate();
        }
    }

    fn apply_edge(&mut self, edge: Arc<dyn EdgeDescriptor>) -> Result<(), GraphError> {
        edge.apply(&mut self.state)?;
        self.state.edges.push(edge);
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), GraphError> {
        if self.state.finalized {
            return Err(GraphError::GraphFinalized);
        }
        Ok(())
    }

    fn check_handle<I, O>(&self, handle: &TaskHandle<I, O>) -> Result<(), GraphError> {
        if handle.graph != self.state.graph_id || !self.state.managers.contains_key(&handle.id) {
            return Err(GraphError::ForeignTask);
        }
        Ok(())
    }

    fn register_task<K: ITask>(&mut self, task: K) -> TaskHandle<K::Input, K::Output> {
        let id = NonZeroU32::new(self.state.next_task).expect("TaskGraphConf::register_task: [1]");
        self.state.next_task = self
            .state
            .next_task
            .checked_add(1)
            .expect("TaskGraphConf::register_task: [2]");
        self.state.dot.nodes.push(DotNode {
            id,
            name: task.name(),
            threads: task.num_threads(),
            color: task.dot_fill_color(),
        });
        let mut manager = TaskManager::new(id, task);
        manager.set_pipeline(self.state.pipeline_id, self.state.num_pipelines);
        manager.set_communicator(Arc::clone(&self.state.communicator));
        self.state.managers.insert(id, Box::new(manager));
        TaskHandle {
            id,
            graph: self.state.graph_id,
            _marker: PhantomData,
        }
    }
}
