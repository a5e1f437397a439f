//! Runs one prompt at a time against the node output cache

use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::errors::{ExecutorError, Result};
use crate::core::memory::{CacheConfig, CacheKey, CacheStats, CachedOutput, NodeOutputCache};
use crate::events::{Event, Notifier};
use crate::executor::progress::ProgressHandle;
use crate::flags::FlagChannel;
use crate::models::ModelManager;
use crate::nodes::{ActionRegistry, NodeCtx};
use crate::prompt::{compare_node_ids, plan_execution, ExecutionPlan, InputValue, Prompt};
use crate::queue::{ExecutionStatus, JobOutputs, MessageKind, NodeResult, StatusMessage};

/// Result of one `execute` call. Node failures are reported here, never
/// returned as `Err`.
#[derive(Debug)]
pub struct ExecutionReport {
    pub prompt_id: String,
    /// `None` on success
    pub error: Option<ExecutorError>,
    /// Surfaced outputs of the requested nodes that produced a value
    pub outputs: JobOutputs,
    pub messages: Vec<StatusMessage>,
    /// Nodes invoked during this run, in order
    pub executed: Vec<String>,
    /// Nodes served from the cache
    pub cached: Vec<String>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.error, Some(ExecutorError::Interrupted { .. }))
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.is_success() {
            ExecutionStatus::success(self.messages.clone())
        } else {
            ExecutionStatus::error(self.messages.clone())
        }
    }
}

struct Run {
    prompt_id: String,
    client_id: Option<String>,
    extra_data: Value,
    job: u64,
    messages: Vec<StatusMessage>,
    executed: Vec<String>,
    cached: Vec<String>,
    available: HashMap<String, CachedOutput>,
}

impl Run {
    fn record(&mut self, kind: MessageKind, data: Value) {
        self.messages.push(StatusMessage::new(kind, data));
    }

    fn finish(self, outputs: &[String], error: Option<ExecutorError>) -> ExecutionReport {
        let outputs = outputs
            .iter()
            .filter_map(|node_id| {
                self.available.get(node_id).map(|output| {
                    (
                        node_id.clone(),
                        NodeResult {
                            values: output.values.as_ref().clone(),
                            ui: output.ui.clone(),
                        },
                    )
                })
            })
            .collect();
        ExecutionReport {
            prompt_id: self.prompt_id,
            error,
            outputs,
            messages: self.messages,
            executed: self.executed,
            cached: self.cached,
        }
    }
}

enum NodeFailure {
    Interrupted,
    Failed { message: String, inputs: Value },
}

/// Drives prompt execution. Owns the node output cache and is only used
/// from the worker thread.
pub struct PromptExecutor {
    registry: ActionRegistry,
    cache: NodeOutputCache,
    flags: Arc<FlagChannel>,
    notifier: Notifier,
    models: Arc<dyn ModelManager>,
    runs: u64,
}

impl PromptExecutor {
    pub fn new(
        registry: ActionRegistry,
        flags: Arc<FlagChannel>,
        notifier: Notifier,
        models: Arc<dyn ModelManager>,
        cache_config: CacheConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            cache: NodeOutputCache::new(cache_config)?,
            flags,
            notifier,
            models,
            runs: 0,
        })
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Validate without running anything
    pub fn validate(&self, prompt: &Prompt, outputs: &[String]) -> Result<ExecutionPlan> {
        plan_execution(prompt, &self.registry, outputs)
    }

    /// Drop every cached node output
    pub fn reset(&mut self) {
        info!("Clearing {} cached node outputs", self.cache.len());
        self.cache.clear();
    }

    pub fn compact_cache(&mut self) {
        self.cache.compact();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Execute a prompt, reusing cached node outputs where the cache key
    /// matches.
    pub async fn execute(
        &mut self,
        prompt: &Prompt,
        prompt_id: &str,
        outputs: &[String],
        extra_data: &Map<String, Value>,
    ) -> ExecutionReport {
        self.runs += 1;
        let mut run = Run {
            prompt_id: prompt_id.to_string(),
            client_id: extra_data
                .get("client_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            extra_data: Value::Object(extra_data.clone()),
            job: self.runs,
            messages: Vec::new(),
            executed: Vec::new(),
            cached: Vec::new(),
            available: HashMap::new(),
        };
        let started = Instant::now();

        run.record(MessageKind::ExecutionStart, json!({ "prompt_id": prompt_id }));
        self.publish(
            &run,
            Event::ExecutionStart {
                prompt_id: prompt_id.to_string(),
            },
        );

        let prepared = self
            .validate(prompt, outputs)
            .and_then(|plan| self.cache_keys(prompt, &plan).map(|keys| (plan, keys)));
        let (plan, keys) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("Prompt {} failed validation: {}", prompt_id, err);
                return self.fail(run, &[], err, None, Value::Null);
            }
        };

        let to_execute = self.resolve_cached(&mut run, prompt, &plan, &keys);
        run.record(
            MessageKind::ExecutionCached,
            json!({ "nodes": run.cached.clone(), "prompt_id": prompt_id }),
        );
        self.publish(
            &run,
            Event::ExecutionCached {
                prompt_id: prompt_id.to_string(),
                nodes: run.cached.clone(),
            },
        );

        for node_id in plan.order.iter().filter(|id| to_execute.contains(*id)) {
            let class_type = prompt
                .get(node_id)
                .map(|node| node.class_type.clone())
                .unwrap_or_default();

            if self.flags.is_interrupted() {
                return self.interrupt(run, &plan.outputs, node_id, &class_type);
            }

            match self.run_node(&mut run, prompt, node_id, &keys).await {
                Ok(()) => {}
                Err(NodeFailure::Interrupted) => {
                    return self.interrupt(run, &plan.outputs, node_id, &class_type);
                }
                Err(NodeFailure::Failed { message, inputs }) => {
                    let err = ExecutorError::node_execution(node_id.clone(), class_type, message);
                    return self.fail(run, &plan.outputs, err, Some(node_id), inputs);
                }
            }
        }

        self.cache.prune(run.job);
        run.record(MessageKind::ExecutionSuccess, json!({ "prompt_id": prompt_id }));
        self.publish(
            &run,
            Event::ExecutionSuccess {
                prompt_id: prompt_id.to_string(),
            },
        );
        info!(
            "Prompt {} finished in {:.2}s ({} executed, {} cached)",
            prompt_id,
            started.elapsed().as_secs_f64(),
            run.executed.len(),
            run.cached.len()
        );
        run.finish(&plan.outputs, None)
    }

    fn publish(&self, run: &Run, event: Event) {
        self.notifier.publish(event, run.client_id.as_deref());
    }

    /// Keys depend only on node type, literal inputs, upstream keys and
    /// fingerprints, never on node ids
    fn cache_keys(&self, prompt: &Prompt, plan: &ExecutionPlan) -> Result<HashMap<String, CacheKey>> {
        let mut keys: HashMap<String, CacheKey> = HashMap::new();
        for node_id in &plan.order {
            let node = prompt
                .get(node_id)
                .ok_or_else(|| ExecutorError::internal(format!("Planned node {} missing", node_id)))?;
            let action = self.registry.get(&node.class_type).ok_or_else(|| {
                ExecutorError::internal(format!("Node type {} vanished", node.class_type))
            })?;

            let mut inputs = Map::new();
            let mut literals = Map::new();
            for (name, input) in node.parsed_inputs() {
                match input {
                    InputValue::Literal(value) => {
                        inputs.insert(name.to_string(), json!({ "value": value }));
                        literals.insert(name.to_string(), value.clone());
                    }
                    InputValue::Link { node_id: upstream, slot } => {
                        let upstream_key = keys.get(upstream).ok_or_else(|| {
                            ExecutorError::internal(format!(
                                "Node {} ordered before its input {}",
                                node_id, upstream
                            ))
                        })?;
                        inputs.insert(
                            name.to_string(),
                            json!({ "link": upstream_key.to_string(), "slot": slot }),
                        );
                    }
                }
            }

            let signature = json!({
                "class_type": node.class_type,
                "inputs": inputs,
                "fingerprint": action.fingerprint(&literals),
            });
            keys.insert(node_id.clone(), CacheKey::from_signature(&signature)?);
        }
        Ok(keys)
    }

    /// Walk back from the outputs, stopping at cache hits. Returns the nodes
    /// that must run; hits are loaded into `run.available`.
    fn resolve_cached(
        &mut self,
        run: &mut Run,
        prompt: &Prompt,
        plan: &ExecutionPlan,
        keys: &HashMap<String, CacheKey>,
    ) -> HashSet<String> {
        let generation = self.models.residency_generation();
        let mut to_execute = HashSet::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = plan.outputs.clone();

        while let Some(node_id) = stack.pop() {
            if !seen.insert(node_id.clone()) {
                continue;
            }
            let Some(key) = keys.get(&node_id) else {
                continue;
            };
            if let Some(hit) = self.cache.get(key, generation, run.job) {
                run.available.insert(node_id.clone(), hit);
                run.cached.push(node_id);
                continue;
            }
            if let Some(node) = prompt.get(&node_id) {
                stack.extend(node.upstream().map(str::to_string));
            }
            to_execute.insert(node_id);
        }

        run.cached.sort_by(|a, b| compare_node_ids(a, b));
        debug!(
            "Prompt {}: {} nodes to execute, {} cached",
            run.prompt_id,
            to_execute.len(),
            run.cached.len()
        );
        to_execute
    }

    async fn run_node(
        &mut self,
        run: &mut Run,
        prompt: &Prompt,
        node_id: &str,
        keys: &HashMap<String, CacheKey>,
    ) -> std::result::Result<(), NodeFailure> {
        let failed = |message: String, inputs: &Map<String, Value>| NodeFailure::Failed {
            message,
            inputs: Value::Object(inputs.clone()),
        };
        let mut inputs = Map::new();
        let (node, action, key) = match (
            prompt.get(node_id),
            prompt.get(node_id).and_then(|n| self.registry.get(&n.class_type)),
            keys.get(node_id),
        ) {
            (Some(node), Some(action), Some(key)) => (node, action, *key),
            _ => return Err(failed(format!("Node {} is not runnable", node_id), &inputs)),
        };

        for (name, input) in node.parsed_inputs() {
            let value = match input {
                InputValue::Literal(value) => value.clone(),
                InputValue::Link { node_id: upstream, slot } => {
                    match run
                        .available
                        .get(upstream)
                        .and_then(|output| output.values.get(slot))
                    {
                        Some(value) => value.clone(),
                        None => {
                            return Err(failed(
                                format!("Output {} of node {} is not available", slot, upstream),
                                &inputs,
                            ))
                        }
                    }
                }
            };
            inputs.insert(name.to_string(), value);
        }

        self.publish(
            run,
            Event::Executing {
                prompt_id: run.prompt_id.clone(),
                node: Some(node_id.to_string()),
            },
        );

        let ctx = NodeCtx {
            prompt_id: run.prompt_id.clone(),
            node_id: node_id.to_string(),
            class_type: node.class_type.clone(),
            inputs,
            extra_data: run.extra_data.clone(),
            progress: ProgressHandle::new(
                self.flags.clone(),
                self.notifier.clone(),
                run.prompt_id.clone(),
                Some(node_id.to_string()),
                run.client_id.clone(),
            ),
        };

        let output = match AssertUnwindSafe(action.execute(&ctx)).catch_unwind().await {
            Ok(Ok(output)) => output,
            Err(panic) => {
                let message = format!("Node panicked: {}", panic_message(panic.as_ref()));
                error!("{} ({} {})", message, node.class_type, node_id);
                return Err(failed(message, &ctx.inputs));
            }
            Ok(Err(err)) => {
                let interrupted = err.chain().any(|cause| {
                    matches!(
                        cause.downcast_ref::<ExecutorError>(),
                        Some(ExecutorError::Interrupted { .. })
                    )
                });
                if interrupted {
                    return Err(NodeFailure::Interrupted);
                }
                return Err(failed(format!("{:#}", err), &ctx.inputs));
            }
        };

        let expected = action.output_count();
        if output.values.len() < expected {
            return Err(failed(
                format!(
                    "Node returned {} outputs, expected {}",
                    output.values.len(),
                    expected
                ),
                &ctx.inputs,
            ));
        }

        let cached = CachedOutput {
            values: Arc::new(output.values),
            ui: output.ui,
        };
        let generation = action
            .holds_resources()
            .then(|| self.models.residency_generation());
        self.cache.insert(key, cached.clone(), generation, run.job);

        if let Some(ui) = &cached.ui {
            self.publish(
                run,
                Event::Executed {
                    prompt_id: run.prompt_id.clone(),
                    node: node_id.to_string(),
                    output: ui.clone(),
                },
            );
        }
        run.available.insert(node_id.to_string(), cached);
        run.executed.push(node_id.to_string());
        Ok(())
    }

    fn interrupt(
        &mut self,
        mut run: Run,
        outputs: &[String],
        node_id: &str,
        class_type: &str,
    ) -> ExecutionReport {
        info!("Prompt {} interrupted at node {}", run.prompt_id, node_id);
        self.cache.prune(run.job);
        let executed = completed_nodes(&run);
        run.record(
            MessageKind::ExecutionInterrupted,
            json!({
                "prompt_id": run.prompt_id,
                "node_id": node_id,
                "node_type": class_type,
                "executed": executed,
            }),
        );
        self.publish(
            &run,
            Event::ExecutionInterrupted {
                prompt_id: run.prompt_id.clone(),
                node_id: Some(node_id.to_string()),
                node_type: Some(class_type.to_string()),
                executed,
            },
        );
        run.finish(outputs, Some(ExecutorError::interrupted(Some(node_id.to_string()))))
    }

    /// Record a failure. `node_id` is `None` for validation errors, which
    /// leave the cache untouched.
    fn fail(
        &mut self,
        mut run: Run,
        outputs: &[String],
        err: ExecutorError,
        node_id: Option<&str>,
        inputs: Value,
    ) -> ExecutionReport {
        let node_type = match &err {
            ExecutorError::NodeExecution { class_type, .. } => Some(class_type.clone()),
            _ => None,
        };
        let node_id = node_id.or(err.node_id()).map(str::to_string);
        let message = match &err {
            ExecutorError::NodeExecution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if node_type.is_some() {
            error!("!!! Exception during processing !!! {}", err);
            self.cache.prune(run.job);
        }

        let executed = completed_nodes(&run);
        run.record(
            MessageKind::ExecutionError,
            json!({
                "prompt_id": run.prompt_id,
                "node_id": node_id,
                "node_type": node_type,
                "executed": executed,
                "exception_message": message,
                "exception_type": err.category(),
                "current_inputs": inputs,
            }),
        );
        self.publish(
            &run,
            Event::ExecutionError {
                prompt_id: run.prompt_id.clone(),
                node_id,
                node_type,
                executed,
                exception_message: message,
                current_inputs: inputs,
            },
        );
        run.finish(outputs, Some(err))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Nodes whose outputs exist in this run, cached ones included
fn completed_nodes(run: &Run) -> Vec<String> {
    let mut nodes: Vec<String> = run.cached.iter().chain(run.executed.iter()).cloned().collect();
    nodes.sort_by(|a, b| compare_node_ids(a, b));
    nodes
}
