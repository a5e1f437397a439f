//! Shared node types and fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prompt_executor::core::memory::CacheConfig;
use prompt_executor::events::BufferingEventSink;
use prompt_executor::nodes::{AddAction, ConstAction, OutputAction};
use prompt_executor::{
    ActionRegistry, FlagChannel, ModelManager, NodeAction, NodeCtx, NodeOutput, NodeSpec,
    Notifier, Prompt, PromptExecutor, ResidentModels,
};

/// Wraps an action and counts its invocations
pub struct Counted<A> {
    inner: A,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl<A: NodeAction> NodeAction for Counted<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx).await
    }

    fn output_count(&self) -> usize {
        self.inner.output_count()
    }

    fn is_output_node(&self) -> bool {
        self.inner.is_output_node()
    }

    fn holds_resources(&self) -> bool {
        self.inner.holds_resources()
    }

    fn input_schema(&self) -> Option<Value> {
        self.inner.input_schema()
    }

    fn fingerprint(&self, inputs: &Map<String, Value>) -> Option<Value> {
        self.inner.fingerprint(inputs)
    }
}

/// Always raises
pub struct FailAction;

#[async_trait]
impl NodeAction for FailAction {
    fn name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        Err(anyhow::anyhow!("boom"))
    }
}

/// Panics instead of returning an error
pub struct PanicAction;

#[async_trait]
impl NodeAction for PanicAction {
    fn name(&self) -> &str {
        "panic"
    }

    async fn execute(&self, _ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let empty: Vec<Value> = Vec::new();
        Ok(NodeOutput::single(empty[0].clone()))
    }
}

/// Passes `value` through and raises the interrupt flag on the way out
pub struct InterruptAfterAction {
    flags: Arc<FlagChannel>,
}

#[async_trait]
impl NodeAction for InterruptAfterAction {
    fn name(&self) -> &str {
        "interrupt_after"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let value: Value = ctx.get_input("value")?;
        self.flags.set_interrupt();
        Ok(NodeOutput::single(value))
    }
}

/// Reports progress three times; the interrupt is raised after the first
/// report so the second one fails
pub struct SlowAction {
    flags: Arc<FlagChannel>,
}

#[async_trait]
impl NodeAction for SlowAction {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        ctx.progress.report(1, 3)?;
        self.flags.set_interrupt();
        ctx.progress.report(2, 3)?;
        ctx.progress.report(3, 3)?;
        Ok(NodeOutput::single(json!("done")))
    }
}

/// Loads a named model and returns a handle referencing it
pub struct LoaderAction {
    models: Arc<ResidentModels>,
}

#[async_trait]
impl NodeAction for LoaderAction {
    fn name(&self) -> &str {
        "loader"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let name: String = ctx.get_input("name")?;
        self.models.load(name.clone());
        Ok(NodeOutput::single(json!(format!("model:{}", name))))
    }

    fn holds_resources(&self) -> bool {
        true
    }
}

fn register_counted<A: NodeAction + 'static>(
    registry: &ActionRegistry,
    calls: &mut HashMap<String, Arc<AtomicUsize>>,
    action: A,
) {
    let counter = Arc::new(AtomicUsize::new(0));
    calls.insert(action.name().to_string(), counter.clone());
    registry.register(Arc::new(Counted {
        inner: action,
        calls: counter,
    }));
}

pub struct Harness {
    pub registry: ActionRegistry,
    pub flags: Arc<FlagChannel>,
    pub sink: Arc<BufferingEventSink>,
    pub notifier: Notifier,
    pub models: Arc<ResidentModels>,
    calls: HashMap<String, Arc<AtomicUsize>>,
}

impl Harness {
    pub fn new() -> Self {
        let registry = ActionRegistry::new();
        let flags = Arc::new(FlagChannel::new());
        let sink = Arc::new(BufferingEventSink::new());
        let notifier = Notifier::new().with_sink(sink.clone());
        let models = Arc::new(ResidentModels::new());
        let mut calls = HashMap::new();

        register_counted(&registry, &mut calls, ConstAction);
        register_counted(&registry, &mut calls, AddAction);
        register_counted(&registry, &mut calls, OutputAction);
        register_counted(&registry, &mut calls, FailAction);
        register_counted(&registry, &mut calls, PanicAction);
        register_counted(
            &registry,
            &mut calls,
            InterruptAfterAction {
                flags: flags.clone(),
            },
        );
        register_counted(
            &registry,
            &mut calls,
            SlowAction {
                flags: flags.clone(),
            },
        );
        register_counted(
            &registry,
            &mut calls,
            LoaderAction {
                models: models.clone(),
            },
        );

        Self {
            registry,
            flags,
            sink,
            notifier,
            models,
            calls,
        }
    }

    pub fn executor(&self) -> PromptExecutor {
        self.executor_with(CacheConfig::default())
    }

    pub fn executor_with(&self, cache: CacheConfig) -> PromptExecutor {
        let models: Arc<dyn ModelManager> = self.models.clone();
        PromptExecutor::new(
            self.registry.clone(),
            self.flags.clone(),
            self.notifier.clone(),
            models,
            cache,
        )
        .unwrap()
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls[name].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

/// `{1: const(5), 2: add(1, 1)}`
pub fn const_add_prompt() -> Prompt {
    Prompt::new()
        .with_node("1", NodeSpec::new("const").input("value", json!(5)))
        .with_node("2", NodeSpec::new("add").link("a", "1", 0).link("b", "1", 0))
}

pub fn outputs(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
