#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use htg::{
    graph::{dot::DOTGEN_FLAG_HIDE_MEMORY_EDGES, GraphError, TaskGraphConf},
    memory::{AllocError, Memory, MemoryAllocator, MMType},
    pipeline::{ExecutionPipeline, PipelineInputRule},
    rules::{Bookkeeper, IRule},
    runtime::TaskGraphRuntime,
    task::{ITask, TaskContext},
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone)]
struct Doubler;

impl ITask for Doubler {
    type Input = u64;
    type Output = u64;

    fn execute_task(&mut self, data: Option<u64>, ctx: &mut TaskContext<'_, u64>) {
        if let Some(x) = data {
            ctx.add_result(x * 2);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[derive(Clone)]
struct AddOne;

impl ITask for AddOne {
    type Input = u64;
    type Output = u64;

    fn execute_task(&mut self, data: Option<u64>, ctx: &mut TaskContext<'_, u64>) {
        if let Some(x) = data {
            ctx.add_result(x + 1);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[derive(Clone)]
struct Forward;

impl ITask for Forward {
    type Input = u64;
    type Output = u64;

    fn execute_task(&mut self, data: Option<u64>, ctx: &mut TaskContext<'_, u64>) {
        if let Some(x) = data {
            ctx.add_result(x);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn linear_pipeline_transforms_and_terminates() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, u64>::new();
    let a = graph.add_task(Doubler).unwrap();
    let b = graph.add_task(AddOne).unwrap();
    let c = graph.add_task(Forward).unwrap();
    graph.set_graph_consumer_task(&a).unwrap();
    graph.add_edge(&a, &b).unwrap();
    graph.add_edge(&b, &c).unwrap();
    graph.add_graph_producer_task(&c).unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    for i in 1..=100 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();

    let mut outputs = BTreeSet::new();
    while let Some(value) = runtime.consume_data() {
        outputs.insert(value);
    }
    runtime.wait_for_runtime();

    let expected: BTreeSet<u64> = (1..=100).map(|i| 2 * i + 1).collect();
    assert_eq!(outputs, expected);
    assert!(runtime.is_output_terminated());
}

#[derive(Clone)]
struct KeyParity {
    forward_even: bool,
}

impl IRule for KeyParity {
    type Input = (u32, String);
    type Output = (u32, String);

    fn apply_rule(&mut self, data: &(u32, String), _pipeline_id: usize) -> Vec<(u32, String)> {
        if (data.0 % 2 == 0) == self.forward_even {
            vec![data.clone()]
        } else {
            vec![]
        }
    }
}

#[derive(Clone)]
struct PairSink {
    seen: Arc<Mutex<Vec<(u32, String)>>>,
}

impl ITask for PairSink {
    type Input = (u32, String);
    type Output = ();

    fn execute_task(&mut self, data: Option<(u32, String)>, _ctx: &mut TaskContext<'_, ()>) {
        if let Some(pair) = data {
            self.seen.lock().unwrap().push(pair);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn bookkeeper_fans_out_by_rule() {
    init_logging();
    let even_seen = Arc::new(Mutex::new(Vec::new()));
    let odd_seen = Arc::new(Mutex::new(Vec::new()));

    let mut graph = TaskGraphConf::<(u32, String), ()>::new();
    let bookkeeper = graph.add_task(Bookkeeper::new()).unwrap();
    let evens = graph
        .add_task(PairSink {
            seen: Arc::clone(&even_seen),
        })
        .unwrap();
    let odds = graph
        .add_task(PairSink {
            seen: Arc::clone(&odd_seen),
        })
        .unwrap();
    graph.set_graph_consumer_task(&bookkeeper).unwrap();
    graph
        .add_rule_edge(&bookkeeper, KeyParity { forward_even: true }, &evens)
        .unwrap();
    graph
        .add_rule_edge(&bookkeeper, KeyParity { forward_even: false }, &odds)
        .unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    for (key, value) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
        runtime.produce_data((key, value.to_string()));
    }
    runtime.finish_producing_data();
    runtime.wait_for_runtime();

    let evens = even_seen.lock().unwrap().clone();
    let odds = odd_seen.lock().unwrap().clone();
    assert_eq!(evens, vec![(2, "b".to_string()), (4, "d".to_string())]);
    assert_eq!(odds, vec![(1, "a".to_string()), (3, "c".to_string())]);
}

struct ByteAllocator {
    size: usize,
}

impl MemoryAllocator for ByteAllocator {
    type Item = Vec<u8>;

    fn allocate(&self, size: usize, _pipeline_id: usize) -> Result<Vec<u8>, AllocError> {
        Ok(vec![0; size])
    }

    fn default_size(&self) -> usize {
        self.size
    }
}

#[derive(Clone)]
struct HoldsMemory {
    addresses: Arc<Mutex<HashSet<usize>>>,
    hold: Duration,
}

impl ITask for HoldsMemory {
    type Input = u64;
    type Output = ();

    fn execute_task(&mut self, data: Option<u64>, ctx: &mut TaskContext<'_, ()>) {
        if data.is_none() {
            return;
        }
        let memory = ctx.get_memory::<Vec<u8>>("tile").unwrap();
        self.addresses
            .lock()
            .unwrap()
            .insert(memory.get().as_ptr() as usize);
        std::thread::sleep(self.hold);
        ctx.release_memory(memory).unwrap();
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn memory_pool_recycles_under_pressure() {
    init_logging();
    let addresses = Arc::new(Mutex::new(HashSet::new()));
    let mut graph = TaskGraphConf::<u64, ()>::new();
    let task = graph
        .add_task(HoldsMemory {
            addresses: Arc::clone(&addresses),
            hold: Duration::from_millis(10),
        })
        .unwrap();
    graph.set_graph_consumer_task(&task).unwrap();
    graph
        .add_memory_manager_edge("tile", &task, ByteAllocator { size: 16 }, 2, MMType::Static)
        .unwrap();

    let start = Instant::now();
    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    for i in 0..100 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();
    runtime.wait_for_runtime();

    assert!(start.elapsed() >= Duration::from_secs(1));
    let distinct = addresses.lock().unwrap().len();
    assert!(distinct <= 2, "pool of 2 issued {distinct} distinct buffers");
}

#[derive(Clone)]
struct PassThrough32;

impl ITask for PassThrough32 {
    type Input = u32;
    type Output = u32;

    fn execute_task(&mut self, data: Option<u32>, ctx: &mut TaskContext<'_, u32>) {
        if let Some(x) = data {
            ctx.add_result(x);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn execution_pipeline_broadcasts_by_default() {
    init_logging();
    let mut inner = TaskGraphConf::<u32, u32>::new();
    let stage = inner.add_task(PassThrough32).unwrap();
    inner.set_graph_consumer_task(&stage).unwrap();
    inner.add_graph_producer_task(&stage).unwrap();

    let mut outer = TaskGraphConf::<u32, u32>::new();
    let pipeline = outer
        .add_task(ExecutionPipeline::new(inner, 4))
        .unwrap();
    outer.set_graph_consumer_task(&pipeline).unwrap();
    outer.add_graph_producer_task(&pipeline).unwrap();

    let mut runtime = TaskGraphRuntime::new(outer);
    runtime.execute_graph();
    for i in 0..10 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();

    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    let mut total = 0usize;
    while let Some(value) = runtime.consume_data() {
        *counts.entry(value).or_default() += 1;
        total += 1;
    }
    runtime.wait_for_runtime();

    assert_eq!(total, 40);
    for i in 0..10 {
        assert_eq!(counts[&i], 4, "value {i} not seen by every replica");
    }
}

#[derive(Clone)]
struct TagWithPipeline;

impl ITask for TagWithPipeline {
    type Input = u32;
    type Output = (usize, u32);

    fn execute_task(&mut self, data: Option<u32>, ctx: &mut TaskContext<'_, (usize, u32)>) {
        if let Some(x) = data {
            ctx.add_result((ctx.pipeline_id(), x));
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

struct ModuloRule {
    modulus: u32,
}

impl PipelineInputRule<u32> for ModuloRule {
    fn select(&mut self, data: &u32, pipeline_id: usize) -> bool {
        (data % self.modulus) as usize == pipeline_id
    }
}

#[test]
fn execution_pipeline_routes_by_input_rule() {
    init_logging();
    let mut inner = TaskGraphConf::<u32, (usize, u32)>::new();
    let stage = inner.add_task(TagWithPipeline).unwrap();
    inner.set_graph_consumer_task(&stage).unwrap();
    inner.add_graph_producer_task(&stage).unwrap();

    let mut pipeline = ExecutionPipeline::new(inner, 4);
    pipeline.add_input_rule(ModuloRule { modulus: 4 });

    let mut outer = TaskGraphConf::<u32, (usize, u32)>::new();
    let pipeline = outer.add_task(pipeline).unwrap();
    outer.set_graph_consumer_task(&pipeline).unwrap();
    outer.add_graph_producer_task(&pipeline).unwrap();

    let mut runtime = TaskGraphRuntime::new(outer);
    runtime.execute_graph();
    for i in 0..16 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();

    let mut per_replica: BTreeMap<usize, BTreeSet<u32>> = BTreeMap::new();
    while let Some((pipeline_id, value)) = runtime.consume_data() {
        per_replica.entry(pipeline_id).or_default().insert(value);
    }
    runtime.wait_for_runtime();

    for replica in 0..4usize {
        let expected: BTreeSet<u32> =
            [replica as u32, replica as u32 + 4, replica as u32 + 8, replica as u32 + 12]
                .into_iter()
                .collect();
        assert_eq!(per_replica[&replica], expected);
    }
}

#[derive(Clone)]
struct LifecycleProbe {
    initialized: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
    shut_down: Arc<AtomicUsize>,
}

impl ITask for LifecycleProbe {
    type Input = u64;
    type Output = ();

    fn initialize(&mut self, _ctx: &mut TaskContext<'_, ()>) {
        self.initialized.fetch_add(1, Ordering::Relaxed);
    }

    fn execute_task(&mut self, _data: Option<u64>, _ctx: &mut TaskContext<'_, ()>) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn shutdown(&mut self, _ctx: &mut TaskContext<'_, ()>) {
        self.shut_down.fetch_add(1, Ordering::Relaxed);
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn empty_graph_shuts_down_without_executing() {
    init_logging();
    let probe = LifecycleProbe {
        initialized: Arc::new(AtomicUsize::new(0)),
        executed: Arc::new(AtomicUsize::new(0)),
        shut_down: Arc::new(AtomicUsize::new(0)),
    };
    let initialized = Arc::clone(&probe.initialized);
    let executed = Arc::clone(&probe.executed);
    let shut_down = Arc::clone(&probe.shut_down);

    let mut graph = TaskGraphConf::<u64, ()>::new();
    let task = graph.add_task(probe).unwrap();
    graph.set_graph_consumer_task(&task).unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    runtime.finish_producing_data();
    runtime.wait_for_runtime();

    assert_eq!(initialized.load(Ordering::Relaxed), 1);
    assert_eq!(executed.load(Ordering::Relaxed), 0);
    assert_eq!(shut_down.load(Ordering::Relaxed), 1);
}

#[derive(Clone)]
struct WideForward;

impl ITask for WideForward {
    type Input = u64;
    type Output = u64;

    fn execute_task(&mut self, data: Option<u64>, ctx: &mut TaskContext<'_, u64>) {
        if let Some(x) = data {
            ctx.add_result(x);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    fn num_threads(&self) -> usize {
        4
    }
}

#[test]
fn replicated_task_conserves_records() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, u64>::new();
    let task = graph.add_task(WideForward).unwrap();
    graph.set_graph_consumer_task(&task).unwrap();
    graph.add_graph_producer_task(&task).unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    for i in 0..100 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();

    let mut outputs = Vec::new();
    while let Some(value) = runtime.consume_data() {
        outputs.push(value);
    }
    runtime.wait_for_runtime();

    outputs.sort_unstable();
    assert_eq!(outputs, (0..100).collect::<Vec<_>>());
    // One profile entry per worker thread.
    assert_eq!(runtime.task_profiles().len(), 4);
}

#[derive(Clone)]
struct Poller {
    wakeups: Arc<AtomicUsize>,
}

impl ITask for Poller {
    type Input = u64;
    type Output = ();

    fn execute_task(&mut self, data: Option<u64>, _ctx: &mut TaskContext<'_, ()>) {
        if data.is_none() {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    fn poll_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(5))
    }
}

#[test]
fn polling_task_executes_without_input() {
    init_logging();
    let wakeups = Arc::new(AtomicUsize::new(0));
    let mut graph = TaskGraphConf::<u64, ()>::new();
    let task = graph
        .add_task(Poller {
            wakeups: Arc::clone(&wakeups),
        })
        .unwrap();
    graph.set_graph_consumer_task(&task).unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    std::thread::sleep(Duration::from_millis(60));
    runtime.finish_producing_data();
    runtime.wait_for_runtime();

    assert!(wakeups.load(Ordering::Relaxed) > 0);
}

#[derive(Clone)]
struct SlowSink;

impl ITask for SlowSink {
    type Input = u64;
    type Output = ();

    fn execute_task(&mut self, data: Option<u64>, _ctx: &mut TaskContext<'_, ()>) {
        if data.is_some() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn terminate_all_cancels_in_flight_work() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, ()>::new();
    let task = graph.add_task(SlowSink).unwrap();
    graph.set_graph_consumer_task(&task).unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    for i in 0..1000 {
        runtime.produce_data(i);
    }
    runtime.terminate_all();
    // Joined without draining the full queue.
}

#[derive(Clone)]
struct BorrowAndEmit;

impl ITask for BorrowAndEmit {
    type Input = u64;
    type Output = Memory<Vec<u8>>;

    fn execute_task(&mut self, data: Option<u64>, ctx: &mut TaskContext<'_, Memory<Vec<u8>>>) {
        if data.is_none() {
            return;
        }
        let memory = ctx.get_memory::<Vec<u8>>("frame").unwrap();
        ctx.add_result(memory);
    }

    fn copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn memory_released_outside_the_graph() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, Memory<Vec<u8>>>::new();
    let task = graph.add_task(BorrowAndEmit).unwrap();
    graph.set_graph_consumer_task(&task).unwrap();
    graph.add_graph_producer_task(&task).unwrap();
    graph
        .add_memory_manager_edge("frame", &task, ByteAllocator { size: 4 }, 1, MMType::Static)
        .unwrap();

    let mut runtime = TaskGraphRuntime::new(graph);
    runtime.execute_graph();
    for i in 0..3 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();

    // Pool size is 1: the second borrow can only proceed once the caller
    // releases the first buffer from outside the graph.
    let mut received = 0;
    while let Some(memory) = runtime.consume_data() {
        received += 1;
        runtime.release_memory(memory).unwrap();
    }
    runtime.wait_for_runtime();
    assert_eq!(received, 3);
}

#[test]
fn graph_copy_preserves_topology() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, u64>::new();
    let a = graph.add_task(Doubler).unwrap();
    let b = graph.add_task(AddOne).unwrap();
    graph.set_graph_consumer_task(&a).unwrap();
    graph.add_edge(&a, &b).unwrap();
    graph.add_graph_producer_task(&b).unwrap();

    let copy = graph.copy(1, 2);
    assert_eq!(graph.gen_dot(0), copy.gen_dot(0));

    // The copy is executable on its own.
    let mut runtime = TaskGraphRuntime::new(copy);
    runtime.execute_graph();
    for i in 1..=10 {
        runtime.produce_data(i);
    }
    runtime.finish_producing_data();
    let outputs: BTreeSet<u64> = core::iter::from_fn(|| runtime.consume_data()).collect();
    runtime.wait_for_runtime();
    assert_eq!(outputs, (1..=10).map(|i| 2 * i + 1).collect());
}

#[test]
fn construction_errors_fail_fast() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, u64>::new();
    let a = graph.add_task(Doubler).unwrap();
    let b = graph.add_task(AddOne).unwrap();
    let c = graph.add_task(Forward).unwrap();
    graph.add_edge(&a, &b).unwrap();

    // Fan-out without a bookkeeper is rejected.
    assert!(matches!(
        graph.add_edge(&a, &c),
        Err(GraphError::OutputAlreadyBound { .. })
    ));

    // A handle from another graph is rejected.
    let mut other = TaskGraphConf::<u64, u64>::new();
    let foreign = other.add_task(Doubler).unwrap();
    assert_eq!(graph.add_edge(&foreign, &c), Err(GraphError::ForeignTask));

    // Duplicate memory edge names on one task are rejected.
    graph
        .add_memory_manager_edge("scratch", &b, ByteAllocator { size: 1 }, 1, MMType::Static)
        .unwrap();
    assert!(matches!(
        graph.add_memory_manager_edge("scratch", &b, ByteAllocator { size: 1 }, 1, MMType::Static),
        Err(GraphError::DuplicateMemoryEdge { .. })
    ));

    // A rule edge must target a bookkeeper of the rule's input type.
    let sink = graph
        .add_task(PairSink {
            seen: Arc::new(Mutex::new(Vec::new())),
        })
        .unwrap();
    assert!(matches!(
        graph.add_rule_edge(&sink, KeyParity { forward_even: true }, &sink),
        Err(GraphError::NotABookkeeper { .. })
    ));

    // Nothing can be added after finalize.
    graph.finalize();
    assert_eq!(graph.add_task(Forward).map(|_| ()), Err(GraphError::GraphFinalized));
}

#[test]
fn dot_output_reflects_flags() {
    init_logging();
    let mut graph = TaskGraphConf::<u64, ()>::new();
    let task = graph
        .add_task(HoldsMemory {
            addresses: Arc::new(Mutex::new(HashSet::new())),
            hold: Duration::ZERO,
        })
        .unwrap();
    graph.set_graph_consumer_task(&task).unwrap();
    graph
        .add_memory_manager_edge("tile", &task, ByteAllocator { size: 1 }, 1, MMType::Static)
        .unwrap();

    let full = graph.gen_dot(0);
    assert!(full.contains("digraph"));
    assert!(full.contains("mm(static): tile"));
    assert!(full.contains("acquire"));

    let hidden = graph.gen_dot(DOTGEN_FLAG_HIDE_MEMORY_EDGES);
    assert!(!hidden.contains("acquire"));
}
