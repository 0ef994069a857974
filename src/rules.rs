use crate::{
    connector::Connector,
    sync::Mutex,
    task::{ITask, TaskContext},
    utils::short_type_name,
};
use std::sync::Arc;

/// A stateful predicate fanning data out from a [`Bookkeeper`] to one
/// consumer.
///
/// Each input offered to the bookkeeper is passed to every attached rule;
/// the rule emits zero or more outputs, which are enqueued into the
/// consumer's connector. A single rule instance is shared by every pipeline
/// replica of an execution pipeline, so the scheduler serialises all
/// invocations behind a per-rule mutex.
pub trait IRule: Send + 'static {
    /// Record type offered by the bookkeeper.
    type Input: Send + 'static;
    /// Record type emitted towards the consumer.
    type Output: Send + 'static;

    /// Applies the rule to one record, returning the outputs to forward.
    fn apply_rule(&mut self, data: &Self::Input, pipeline_id: usize) -> Vec<Self::Output>;

    /// Whether the rule is done producing for the given pipeline. Once true,
    /// the scheduler counts the rule out of its consumer connector's
    /// producers; the default never self-terminates.
    fn can_terminate_rule(&self, _pipeline_id: usize) -> bool {
        false
    }

    /// Called when the bookkeeper shuts the rule's scheduler down for a
    /// pipeline.
    fn shutdown_rule(&mut self, _pipeline_id: usize) {}

    fn name(&self) -> String
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

/// Untyped view of a rule scheduler, letting a [`Bookkeeper`] hold
/// schedulers of heterogeneous output types.
pub(crate) trait AnyRuleScheduler<T>: Send {
    fn execute(&mut self, data: &T, pipeline_id: usize);
    fn shutdown(&mut self, pipeline_id: usize);
}

/// Binds one shared [`IRule`] to one output connector.
pub(crate) struct RuleScheduler<R: IRule> {
    rule: Arc<Mutex<R>>,
    connector: Arc<Connector<R::Output>>,
    rule_name: String,
    /// Set once this scheduler has counted its rule out of the connector's
    /// producers, either by rule self-termination or bookkeeper shutdown.
    terminated: bool,
}

impl<R: IRule> RuleScheduler<R> {
    pub(crate) fn new(rule: Arc<Mutex<R>>, connector: Arc<Connector<R::Output>>) -> Self {
        let rule_name = rule.lock().expect("RuleScheduler::new: [1]").name();
        Self {
            rule,
            connector,
            rule_name,
            terminated: false,
        }
    }

    fn check_rule_termination(&mut self, rule: &R, pipeline_id: usize) {
        if !self.terminated && rule.can_terminate_rule(pipeline_id) {
            self.terminated = true;
            self.connector.producer_finished();
            log::debug!(
                "rule '{}' terminated for pipeline {}",
                self.rule_name,
                pipeline_id
            );
        }
    }
}

impl<R: IRule> AnyRuleScheduler<R::Input> for RuleScheduler<R> {
    fn execute(&mut self, data: &R::Input, pipeline_id: usize) {
        let rule = Arc::clone(&self.rule);
        let mut rule = rule.lock().expect("RuleScheduler::execute: [1]");
        // The rule may have decided to stop while another pipeline held the
        // lock; re-check before and after applying.
        self.check_rule_termination(&rule, pipeline_id);
        if self.terminated {
            return;
        }
        for output in rule.apply_rule(data, pipeline_id) {
            self.connector.produce(output);
        }
        self.check_rule_termination(&rule, pipeline_id);
    }

    fn shutdown(&mut self, pipeline_id: usize) {
        let rule = Arc::clone(&self.rule);
        let mut rule = rule.lock().expect("RuleScheduler::shutdown: [1]");
        rule.shutdown_rule(pipeline_id);
        if !self.terminated {
            self.terminated = true;
            self.connector.producer_finished();
        }
    }
}

/// Fan-out task distributing each input to every attached rule scheduler.
///
/// Schedulers are attached by rule edges at graph-construction time (and
/// re-attached to each deep copy, sharing the rule instances across
/// pipelines). A bookkeeper is always single-threaded.
pub struct Bookkeeper<T: Send + 'static> {
    schedulers: Vec<Box<dyn AnyRuleScheduler<T>>>,
}

impl<T: Send + 'static> Bookkeeper<T> {
    pub fn new() -> Self {
        Self {
            schedulers: Vec::new(),
        }
    }

    pub(crate) fn add_scheduler(&mut self, scheduler: Box<dyn AnyRuleScheduler<T>>) {
        self.schedulers.push(scheduler);
    }
}

impl<T: Send + 'static> Default for Bookkeeper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ITask for Bookkeeper<T> {
    type Input = T;
    type Output = ();

    fn execute_task(&mut self, data: Option<T>, ctx: &mut TaskContext<'_, ()>) {
        let Some(data) = data else { return };
        for scheduler in &mut self.schedulers {
            scheduler.execute(&data, ctx.pipeline_id());
        }
    }

    fn shutdown(&mut self, ctx: &mut TaskContext<'_, ()>) {
        for scheduler in &mut self.schedulers {
            scheduler.shutdown(ctx.pipeline_id());
        }
    }

    fn copy(&self) -> Self {
        // Schedulers are wired per graph copy by the rule edges.
        Self::new()
    }

    fn name(&self) -> String {
        format!("bookkeeper<{}>", short_type_name::<T>())
    }

    fn dot_fill_color(&self) -> String {
        "aquamarine".to_string()
    }
}
