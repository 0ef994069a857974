use super::dot::{DotEdge, DotEdgeKind, DotEndpoint};
use super::{GraphError, GraphState};
use crate::{
    connector::{AnyConnector, Connector},
    memory::{Memory, MemoryManager},
    rules::{Bookkeeper, IRule, RuleScheduler},
    sync::Mutex,
    task::{manager::TaskManager, MemoryEdgeHandles},
    types::TaskId,
};
use core::marker::PhantomData;
use std::sync::Arc;

/// Declarative graph-construction primitive.
///
/// An edge descriptor is applied once when the user adds it and once against
/// every deep copy of the graph, so that clone-to-clone connectors are
/// recreated with the same topology. Descriptors are immutable and shared
/// between a graph and its copies.
pub(crate) trait EdgeDescriptor: Send + Sync {
    /// Installs connectors against the state's manager map and updates
    /// producer counts. Must not mutate the state before its fallible checks
    /// have passed.
    fn apply(&self, state: &mut GraphState) -> Result<(), GraphError>;
}

/// Returns the consumer's input connector, creating and wiring one if the
/// consumer has none yet (a consumer fed by several producers shares a
/// single input connector).
fn consumer_input<U: Send + 'static>(state: &mut GraphState, consumer: TaskId) -> Arc<Connector<U>> {
    let manager = state
        .managers
        .get_mut(&consumer)
        .expect("edge::consumer_input: [1]");
    if let Some(existing) = manager.input_any() {
        existing
            .as_any_arc()
            .downcast::<Connector<U>>()
            .expect("edge::consumer_input: [2]")
    } else {
        let connector = Arc::new(Connector::<U>::new());
        manager.set_input_any(connector.clone());
        state.connectors.push(connector.clone());
        connector
    }
}

fn ensure_output_free(state: &GraphState, producer: TaskId) -> Result<(), GraphError> {
    let manager = state
        .managers
        .get(&producer)
        .expect("edge::ensure_output_free: [1]");
    if manager.output_any().is_some() {
        return Err(GraphError::OutputAlreadyBound {
            task: manager.name(),
        });
    }
    Ok(())
}

/// Binds the producer's output connector and counts its threads into the
/// connector's producers.
fn bind_output(state: &mut GraphState, producer: TaskId, connector: Arc<dyn AnyConnector>) {
    let manager = state
        .managers
        .get_mut(&producer)
        .expect("edge::bind_output: [1]");
    let threads = manager.num_threads();
    manager.set_output_any(connector.clone());
    connector.increment_producer_count(threads);
}

/// Plain producer-to-consumer dataflow edge carrying records of type `U`.
pub(crate) struct ProducerConsumerEdge<U> {
    producer: TaskId,
    consumer: TaskId,
    _marker: PhantomData<fn() -> U>,
}

impl<U> ProducerConsumerEdge<U> {
    pub(crate) fn new(producer: TaskId, consumer: TaskId) -> Self {
        Self {
            producer,
            consumer,
            _marker: PhantomData,
        }
    }
}

impl<U: Send + 'static> EdgeDescriptor for ProducerConsumerEdge<U> {
    fn apply(&self, state: &mut GraphState) -> Result<(), GraphError> {
        ensure_output_free(state, self.producer)?;
        let connector = consumer_input::<U>(state, self.consumer);
        bind_output(state, self.producer, connector);
        state.dot.edges.push(DotEdge {
            from: DotEndpoint::Task(self.producer),
            to: DotEndpoint::Task(self.consumer),
            type_name: core::any::type_name::<U>(),
            kind: DotEdgeKind::Data,
        });
        Ok(())
    }
}

/// Attaches a shared rule between a bookkeeper and a consumer.
pub(crate) struct RuleEdge<R: IRule> {
    bookkeeper: TaskId,
    consumer: TaskId,
    rule: Arc<Mutex<R>>,
    rule_name: String,
}

impl<R: IRule> RuleEdge<R> {
    pub(crate) fn new(bookkeeper: TaskId, consumer: TaskId, rule: R) -> Self {
        let rule_name = rule.name();
        Self {
            bookkeeper,
            consumer,
            rule: Arc::new(Mutex::new(rule)),
            rule_name,
        }
    }
}

impl<R: IRule> EdgeDescriptor for RuleEdge<R> {
    fn apply(&self, state: &mut GraphState) -> Result<(), GraphError> {
        {
            let manager = state
                .managers
                .get_mut(&self.bookkeeper)
                .expect("RuleEdge::apply: [1]");
            let name = manager.name();
            if manager
                .as_any_mut()
                .downcast_mut::<TaskManager<Bookkeeper<R::Input>>>()
                .is_none()
            {
                return Err(GraphError::NotABookkeeper { task: name });
            }
        }
        let connector = consumer_input::<R::Output>(state, self.consumer);
        // The bookkeeper is single-threaded; each rule edge counts as one
        // producer of the consumer's connector.
        connector.increment_producer_count(1);
        let manager = state
            .managers
            .get_mut(&self.bookkeeper)
            .expect("RuleEdge::apply: [2]")
            .as_any_mut()
            .downcast_mut::<TaskManager<Bookkeeper<R::Input>>>()
            .expect("RuleEdge::apply: [3]");
        manager
            .task_mut()
            .add_scheduler(Box::new(RuleScheduler::new(
                Arc::clone(&self.rule),
                connector,
            )));
        state.dot.edges.push(DotEdge {
            from: DotEndpoint::Task(self.bookkeeper),
            to: DotEndpoint::Task(self.consumer),
            type_name: core::any::type_name::<R::Output>(),
            kind: DotEdgeKind::Rule(self.rule_name.clone()),
        });
        Ok(())
    }
}

/// Wires a memory manager's release/acquisition connector pair to a
/// consumer under a per-task-unique edge name.
pub(crate) struct MemoryEdge<B: Send + 'static> {
    name: String,
    memory_manager: TaskId,
    consumer: TaskId,
    _marker: PhantomData<fn() -> B>,
}

impl<B: Send + 'static> MemoryEdge<B> {
    pub(crate) fn new(name: String, memory_manager: TaskId, consumer: TaskId) -> Self {
        Self {
            name,
            memory_manager,
            consumer,
            _marker: PhantomData,
        }
    }
}

impl<B: Send + 'static> EdgeDescriptor for MemoryEdge<B> {
    fn apply(&self, state: &mut GraphState) -> Result<(), GraphError> {
        let address = format!("{}:{}", state.address, self.name);
        let release = Arc::new(Connector::<Memory<B>>::new());
        let acquisition = Arc::new(Connector::<Memory<B>>::new());
        {
            let consumer = state
                .managers
                .get_mut(&self.consumer)
                .expect("MemoryEdge::apply: [1]");
            let consumer_name = consumer.name();
            let handles = MemoryEdgeHandles {
                acquisition: acquisition.clone(),
                release: release.clone(),
            };
            if !consumer.add_memory_edge(self.name.clone(), handles) {
                return Err(GraphError::DuplicateMemoryEdge {
                    task: consumer_name,
                    name: self.name.clone(),
                });
            }
            // The consumer's threads produce releases.
            release.increment_producer_count(consumer.num_threads());
        }
        {
            let manager = state
                .managers
                .get_mut(&self.memory_manager)
                .expect("MemoryEdge::apply: [2]");
            manager.set_input_any(release.clone());
            manager.set_output_any(acquisition.clone());
            acquisition.increment_producer_count(manager.num_threads());
            manager
                .as_any_mut()
                .downcast_mut::<TaskManager<MemoryManager<B>>>()
                .expect("MemoryEdge::apply: [3]")
                .task_mut()
                .set_edge_address(address.clone());
        }
        state.communicator.register(address, release.clone());
        state.connectors.push(release);
        state.connectors.push(acquisition);
        state.dot.edges.push(DotEdge {
            from: DotEndpoint::Task(self.consumer),
            to: DotEndpoint::Task(self.memory_manager),
            type_name: core::any::type_name::<Memory<B>>(),
            kind: DotEdgeKind::MemoryRelease,
        });
        state.dot.edges.push(DotEdge {
            from: DotEndpoint::Task(self.memory_manager),
            to: DotEndpoint::Task(self.consumer),
            type_name: core::any::type_name::<Memory<B>>(),
            kind: DotEdgeKind::MemoryAcquire,
        });
        Ok(())
    }
}

/// Routes the graph's input connector into the designated consumer task.
pub(crate) struct GraphConsumerEdge {
    consumer: TaskId,
}

impl GraphConsumerEdge {
    pub(crate) fn new(consumer: TaskId) -> Self {
        Self { consumer }
    }
}

impl EdgeDescriptor for GraphConsumerEdge {
    fn apply(&self, state: &mut GraphState) -> Result<(), GraphError> {
        let input = state.input_any.clone();
        let manager = state
            .managers
            .get_mut(&self.consumer)
            .expect("GraphConsumerEdge::apply: [1]");
        if manager.input_any().is_some() {
            return Err(GraphError::InputAlreadyBound {
                task: manager.name(),
            });
        }
        manager.set_input_any(input);
        state.dot.edges.push(DotEdge {
            from: DotEndpoint::GraphInput,
            to: DotEndpoint::Task(self.consumer),
            type_name: state.input_any.record_type_name(),
            kind: DotEdgeKind::Data,
        });
        Ok(())
    }
}

/// Routes a producer task into the graph's output connector.
pub(crate) struct GraphProducerEdge {
    producer: TaskId,
}

impl GraphProducerEdge {
    pub(crate) fn new(producer: TaskId) -> Self {
        Self { producer }
    }
}

impl EdgeDescriptor for GraphProducerEdge {
    fn apply(&self, state: &mut GraphState) -> Result<(), GraphError> {
        ensure_output_free(state, self.producer)?;
        let output = state.output_any.clone();
        bind_output(state, self.producer, output);
        state.dot.edges.push(DotEdge {
            from: DotEndpoint::Task(self.producer),
            to: DotEndpoint::GraphOutput,
            type_name: state.output_any.record_type_name(),
            kind: DotEdgeKind::Data,
        });
        Ok(())
    }
}
