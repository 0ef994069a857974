use crate::{
    graph::TaskGraphConf,
    runtime::TaskGraphRuntime,
    sync::Mutex,
    task::{ITask, TaskContext},
};
use std::sync::Arc;

/// Decides which execution-pipeline replicas receive an input record.
///
/// A record is forwarded to replica `pipeline_id` only when every attached
/// rule returns `true` for it. Rules are shared between replicas of the
/// pipeline task itself, so each invocation is serialised.
pub trait PipelineInputRule<T>: Send {
    fn select(&mut self, data: &T, pipeline_id: usize) -> bool;
}

/// A task replicating an entire subgraph N ways.
///
/// At initialization the pipeline deep-copies its template graph once per
/// replica (each copy's tasks observe `pipeline_id` in `[0, N)`) and spawns
/// a nested runtime for each. Each input record is routed to the replicas
/// selected by the input rules (all of them by default), and the pipeline
/// signals its downstream connector only after every replica has drained
/// and terminated.
pub struct ExecutionPipeline<In, Out>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    graph: TaskGraphConf<In, Out>,
    num_pipelines: usize,
    input_rules: Vec<Arc<Mutex<dyn PipelineInputRule<In>>>>,
    replicas: Vec<TaskGraphRuntime<In, Out>>,
}

impl<In, Out> ExecutionPipeline<In, Out>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    /// Wraps `graph` as the template replicated `num_pipelines` ways.
    pub fn new(graph: TaskGraphConf<In, Out>, num_pipelines: usize) -> Self {
        assert!(
            num_pipelines > 0,
            "ExecutionPipeline::new: at least one pipeline is required"
        );
        Self {
            graph,
            num_pipelines,
            input_rules: Vec::new(),
            replicas: Vec::new(),
        }
    }

    /// Attaches an input rule. Without any rules every record is broadcast
    /// to all replicas.
    pub fn add_input_rule(&mut self, rule: impl PipelineInputRule<In> + 'static) {
        self.input_rules.push(Arc::new(Mutex::new(rule)));
    }

    pub fn num_pipelines(&self) -> usize {
        self.num_pipelines
    }
}

impl<In, Out> ITask for ExecutionPipeline<In, Out>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    type Input = In;
    type Output = Out;

    fn initialize(&mut self, ctx: &mut TaskContext<'_, Out>) {
        log::debug!(
            "execution pipeline expanding into {} replicas",
            self.num_pipelines
        );
        for pipeline_id in 0..self.num_pipelines {
            // Replicas produce straight into the pipeline's own output
            // connector and register their memory edges with the enclosing
            // graph's communicator.
            let replica = self.graph.copy_with(
                pipeline_id,
                self.num_pipelines,
                None,
                ctx.output_connector(),
                ctx.communicator(),
            );
            let mut runtime = TaskGraphRuntime::new(replica);
            runtime.execute_graph();
            self.replicas.push(runtime);
        }
    }

    fn execute_task(&mut self, data: Option<In>, _ctx: &mut TaskContext<'_, Out>) {
        let Some(data) = data else { return };
        'replicas: for (pipeline_id, replica) in self.replicas.iter().enumerate() {
            for rule in &self.input_rules {
                let selected = rule
                    .lock()
                    .expect("ExecutionPipeline::execute_task: [1]")
                    .select(&data, pipeline_id);
                if !selected {
                    continue 'replicas;
                }
            }
            replica.produce_data(data.clone());
        }
    }

    fn shutdown(&mut self, _ctx: &mut TaskContext<'_, Out>) {
        for replica in &self.replicas {
            replica.finish_producing_data();
        }
        for replica in &mut self.replicas {
            replica.wait_for_runtime();
        }
        log::debug!("execution pipeline drained {} replicas", self.replicas.len());
    }

    fn copy(&self) -> Self {
        Self {
            graph: self.graph.duplicate(),
            num_pipelines: self.num_pipelines,
            input_rules: self.input_rules.clone(),
            replicas: Vec::new(),
        }
    }

    fn name(&self) -> String {
        format!("execution pipeline x{}", self.num_pipelines)
    }

    fn dot_fill_color(&self) -> String {
        "lightskyblue".to_string()
    }
}
