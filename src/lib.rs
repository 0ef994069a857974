//! Hybrid CPU+GPU task-graph runtime.
//!
//! This crate executes directed graphs of stateful, typed tasks. Users
//! declaratively assemble a [`graph::TaskGraphConf`] out of tasks and edges;
//! the runtime binds each task to a pool of worker threads connected by
//! typed producer/consumer queues ([`connector::Connector`]). It provides:
//! - A producer-count termination protocol: connectors become terminal when
//!   their last upstream thread finishes and their queue drains, so shutdown
//!   propagates along the graph without a coordinator.
//! - A bookkeeper/rule subsystem ([`rules`]) letting one producer fan data
//!   out conditionally to many consumers with shared state.
//! - Bounded, recycled pools of typed buffers ([`memory`]) with explicit
//!   release-back edges as the graph's back-pressure mechanism.
//! - Whole-subgraph replication ([`pipeline`]) that routes each input across
//!   replicas via input rules and, with the `cuda` feature, pins each
//!   replica to its own GPU ([`cuda`]).
//!
//! Quick start:
//! 1. Implement [`task::ITask`] for each stage: `execute_task` consumes one
//!    record and emits outputs via [`task::TaskContext::add_result`].
//! 2. Register tasks with [`graph::TaskGraphConf::add_task`] and wire them
//!    with `add_edge`/`add_rule_edge`/`add_memory_manager_edge`; designate
//!    the graph's input and output tasks.
//! 3. Hand the graph to a [`runtime::TaskGraphRuntime`], call
//!    `execute_graph`, feed records with `produce_data`, end the stream with
//!    `finish_producing_data`, and drain `consume_data` until it returns
//!    `None`.
//!
//! Scheduling is static: exactly one OS thread per task-manager replica, no
//! work stealing, no coroutines. The only blocking points are consuming from
//! an empty connector and acquiring from an empty memory pool.

/// Typed blocking queues with producer-count termination.
///
/// Defines [`connector::Connector`] and the untyped [`connector::AnyConnector`]
/// view used by graph-level bookkeeping.
pub mod connector;
/// GPU binding layer: [`cuda::CudaTask`], [`cuda::CudaEnv`], and device
/// memory pools. Available with the `cuda` feature; the CPU engine is
/// complete without it.
#[cfg(feature = "cuda")]
pub mod cuda;
/// Graph assembly: [`graph::TaskGraphConf`], typed task handles, edge
/// construction, deep copies, and DOT rendering.
pub mod graph;
/// Recycled buffer pools: allocators, release rules, and the
/// [`memory::MemoryManager`] task serving a bounded pool over a
/// release-back edge.
pub mod memory;
/// Whole-subgraph replication: [`pipeline::ExecutionPipeline`] and its input
/// rules.
pub mod pipeline;
/// The bookkeeper fan-out task and the [`rules::IRule`] contract.
pub mod rules;
/// Worker-thread lifecycle: [`runtime::TaskGraphRuntime`].
pub mod runtime;
mod sync;
/// The [`task::ITask`] authoring contract and the per-invocation
/// [`task::TaskContext`].
pub mod task;
/// Core identifier and collection aliases.
pub mod types;
mod utils;
