// SPDX-License-Identifier: MIT
//! Workflow executor — runs a skill's step DAG deterministically.
//!
//! Levels execute in order; steps within a level run concurrently under a
//! bounded semaphore against an immutable snapshot of earlier results, so
//! same-level steps never observe one another. Results are folded back in
//! declared step order to keep logging and downstream decisions
//! deterministic.

pub mod dag;
pub mod template;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mcp::{ToolArguments, ToolCallResult};
use crate::skills::{parse_duration, OnError, OutputFormat, Skill, WorkflowStep};
use self::template::{StepResult, TemplateContext};

/// Step results larger than this are truncated before they enter the
/// template context.
pub const MAX_RESULT_SIZE: usize = 1 << 20;

const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// How the executor reaches tools — in production the router, in tests a
/// mock.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on concurrently running steps within a level.
    pub max_parallel: usize,
    /// Bound on skill-composition nesting.
    pub max_depth: usize,
    /// Wall-clock bound on a whole workflow run.
    pub deadline: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_depth: 5,
            deadline: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Completed,
    Partial,
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Partial => "partial",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: WorkflowStatus,
    pub result: ToolCallResult,
    /// Step id → reason, for every step that never ran.
    pub skipped: HashMap<String, String>,
}

tokio::task_local! {
    /// Skill names currently executing on this call path. Crossing the
    /// tool-call boundary into a nested skill carries the stack along.
    static CALL_STACK: Vec<String>;
}

pub struct Executor {
    caller: Arc<dyn ToolCaller>,
    config: ExecutorConfig,
}

enum StepOutcome {
    Success(StepResult),
    Failed(String),
    CondFalse,
    CondError(String),
    Cancelled,
}

impl Executor {
    pub fn new(caller: Arc<dyn ToolCaller>, config: ExecutorConfig) -> Self {
        Self { caller, config }
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        skill: &Skill,
        arguments: Option<ToolArguments>,
    ) -> Result<ExecutionOutcome> {
        if skill.workflow.is_empty() {
            bail!("skill '{}' has no workflow steps", skill.name);
        }

        // Composition guards: revisiting a skill name is a cycle; the call
        // stack depth is bounded.
        let stack = CALL_STACK.try_with(|s| s.clone()).unwrap_or_default();
        if stack.iter().any(|n| n == &skill.name) {
            bail!(
                "circular dependency: skill '{}' is already executing ({})",
                skill.name,
                stack.join(" -> ")
            );
        }
        if stack.len() >= self.config.max_depth {
            bail!(
                "max workflow depth {} exceeded at skill '{}'",
                self.config.max_depth,
                skill.name
            );
        }
        let mut nested_stack = stack;
        nested_stack.push(skill.name.clone());

        if cancel.is_cancelled() {
            bail!("workflow cancelled");
        }

        let inputs = resolve_inputs(skill, arguments)?;
        let levels = dag::plan_levels(&skill.workflow).map_err(|e| anyhow!("planning: {e}"))?;

        // The workflow-wide deadline cancels a token shared by every step;
        // the flag tells deadline apart from caller cancellation afterwards.
        let wf_cancel = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        {
            let token = wf_cancel.clone();
            let flag = Arc::clone(&deadline_hit);
            let deadline = self.config.deadline;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        flag.store(true, Ordering::Relaxed);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut results: HashMap<String, StepResult> = HashMap::new();
        let mut skipped: HashMap<String, String> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut any_failed = false;
        let mut halt: Option<String> = None;

        'levels: for level in &levels {
            if wf_cancel.is_cancelled() {
                if deadline_hit.load(Ordering::Relaxed) {
                    halt = Some("workflow deadline exceeded".into());
                    break;
                }
                wf_cancel.cancel();
                bail!("workflow cancelled");
            }

            // Partition: dependents of failed or skipped steps never run.
            // A skipped dependency carries its reason forward.
            let mut runnable: Vec<usize> = Vec::new();
            for &idx in level {
                let step = &skill.workflow[idx];
                if let Some(dep) = step.depends_on.iter().find(|d| failed.contains(d.as_str())) {
                    skipped.insert(step.id.clone(), format!("dependency '{dep}' failed"));
                    debug!(step = %step.id, dep = %dep, "step skipped: dependency failed");
                } else if let Some(reason) = step
                    .depends_on
                    .iter()
                    .find_map(|d| skipped.get(d.as_str()).cloned())
                {
                    skipped.insert(step.id.clone(), reason);
                } else {
                    runnable.push(idx);
                }
            }

            // Same-level steps resolve against this snapshot only.
            let snapshot = Arc::new(TemplateContext {
                inputs: inputs.clone(),
                steps: results.clone(),
            });

            let mut handles = Vec::with_capacity(runnable.len());
            for &idx in &runnable {
                let step = skill.workflow[idx].clone();
                let ctx = Arc::clone(&snapshot);
                let caller = Arc::clone(&self.caller);
                let sem = Arc::clone(&semaphore);
                let token = wf_cancel.clone();
                let stack = nested_stack.clone();
                handles.push((
                    idx,
                    tokio::spawn(async move {
                        let _permit = tokio::select! {
                            permit = sem.acquire_owned() => match permit {
                                Ok(p) => p,
                                Err(_) => return StepOutcome::Cancelled,
                            },
                            _ = token.cancelled() => return StepOutcome::Cancelled,
                        };
                        run_step(&*caller, &step, &ctx, &token, stack).await
                    }),
                ));
            }

            // Fold outcomes back in declared order.
            for (idx, handle) in handles {
                let step = &skill.workflow[idx];
                let outcome = handle
                    .await
                    .unwrap_or_else(|e| StepOutcome::Failed(format!("step task panicked: {e}")));
                match outcome {
                    StepOutcome::Success(result) => {
                        results.insert(step.id.clone(), result);
                    }
                    StepOutcome::CondFalse => {
                        debug!(step = %step.id, "condition evaluated to false");
                        skipped
                            .insert(step.id.clone(), "condition evaluated to false".into());
                    }
                    StepOutcome::CondError(msg) => {
                        halt = Some(format!("step '{}' condition: {msg}", step.id));
                        break 'levels;
                    }
                    StepOutcome::Cancelled => {
                        if deadline_hit.load(Ordering::Relaxed) {
                            halt = Some("workflow deadline exceeded".into());
                            break 'levels;
                        }
                        wf_cancel.cancel();
                        bail!("workflow cancelled");
                    }
                    StepOutcome::Failed(msg) => {
                        warn!(step = %step.id, error = %msg, policy = ?step.on_error, "step failed");
                        match step.on_error {
                            OnError::Fail => {
                                halt = Some(format!("step '{}' failed: {msg}", step.id));
                                break 'levels;
                            }
                            OnError::Skip => {
                                failed.insert(step.id.clone());
                                any_failed = true;
                            }
                            OnError::Continue => {
                                // Dependents can inspect steps.«id».is_error.
                                results.insert(step.id.clone(), StepResult::new(msg, true));
                                any_failed = true;
                            }
                        }
                    }
                }
            }
        }
        wf_cancel.cancel();

        if let Some(reason) = halt {
            return Ok(ExecutionOutcome {
                status: WorkflowStatus::Failed,
                result: ToolCallResult::error(format!(
                    "Workflow \"{}\" failed: {reason}",
                    skill.name
                )),
                skipped,
            });
        }

        let final_ctx = TemplateContext {
            inputs,
            steps: results.clone(),
        };
        let result = match assemble_output(skill, &results, &final_ctx) {
            Ok(text) => ToolCallResult::text(text),
            Err(e) => {
                return Ok(ExecutionOutcome {
                    status: WorkflowStatus::Failed,
                    result: ToolCallResult::error(format!(
                        "Workflow \"{}\" failed: resolving output: {e}",
                        skill.name
                    )),
                    skipped,
                })
            }
        };

        Ok(ExecutionOutcome {
            status: if any_failed {
                WorkflowStatus::Partial
            } else {
                WorkflowStatus::Completed
            },
            result,
            skipped,
        })
    }
}

/// Apply declared defaults and check required inputs and enum membership.
fn resolve_inputs(skill: &Skill, arguments: Option<ToolArguments>) -> Result<Map<String, Value>> {
    let mut inputs = arguments.unwrap_or_default();
    for (name, decl) in &skill.inputs {
        if !inputs.contains_key(name) {
            if let Some(default) = &decl.default {
                inputs.insert(name.clone(), default.clone());
            } else if decl.required {
                bail!("required input '{name}' is missing");
            }
        }
        if let Some(value) = inputs.get(name) {
            if !decl.choices.is_empty() && !decl.choices.contains(value) {
                bail!(
                    "input '{name}' must be one of {:?}",
                    decl.choices
                        .iter()
                        .map(template::stringify)
                        .collect::<Vec<_>>()
                );
            }
        }
    }
    Ok(inputs)
}

async fn run_step(
    caller: &dyn ToolCaller,
    step: &WorkflowStep,
    ctx: &TemplateContext,
    cancel: &CancellationToken,
    stack: Vec<String>,
) -> StepOutcome {
    if let Some(condition) = step.condition.as_deref().filter(|c| !c.trim().is_empty()) {
        match template::evaluate_condition(condition, ctx) {
            Ok(true) => {}
            Ok(false) => return StepOutcome::CondFalse,
            Err(e) => return StepOutcome::CondError(e.to_string()),
        }
    }

    let args = match template::resolve_args(&step.args, ctx) {
        Ok(args) => args,
        Err(e) => return StepOutcome::Failed(format!("resolving arguments: {e}")),
    };

    let timeout = step.timeout.as_deref().and_then(parse_duration);
    let attempts = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1).max(1);
    let backoff = step
        .retry
        .as_ref()
        .and_then(|r| parse_duration(&r.backoff))
        .unwrap_or(Duration::ZERO);

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return StepOutcome::Cancelled;
        }
        if attempt > 1 {
            debug!(step = %step.id, attempt, "retrying step");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return StepOutcome::Cancelled,
            }
        }

        // A per-step timeout cancels only this step's tool call.
        let step_cancel = cancel.child_token();
        let call = CALL_STACK.scope(
            stack.clone(),
            caller.call_tool(&step_cancel, &step.tool, args.clone()),
        );
        let outcome = match timeout {
            Some(dur) => match tokio::time::timeout(dur, call).await {
                Ok(r) => r,
                Err(_) => {
                    step_cancel.cancel();
                    Err(anyhow!("step timed out after {}", step.timeout.as_deref().unwrap_or("?")))
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(result) if !result.is_error => {
                let mut text = result.combined_text();
                if text.len() > MAX_RESULT_SIZE {
                    text.truncate(MAX_RESULT_SIZE);
                }
                return StepOutcome::Success(StepResult::new(text, false));
            }
            // A tool-reported error counts as a failure for retry purposes.
            Ok(result) => last_error = result.combined_text(),
            Err(e) => {
                if cancel.is_cancelled() {
                    return StepOutcome::Cancelled;
                }
                last_error = e.to_string();
            }
        }
    }
    StepOutcome::Failed(last_error)
}

/// Assemble the output stage over the final results. `merged` keeps
/// workflow order; an `include` list restricts membership only.
fn assemble_output(
    skill: &Skill,
    results: &HashMap<String, StepResult>,
    ctx: &TemplateContext,
) -> Result<String> {
    let output = skill.output.clone().unwrap_or_default();
    match output.format {
        OutputFormat::Merged => {
            let mut parts = Vec::new();
            for step in &skill.workflow {
                if !output.include.is_empty() && !output.include.contains(&step.id) {
                    continue;
                }
                if let Some(result) = results.get(&step.id) {
                    if !result.is_error {
                        parts.push(result.text.clone());
                    }
                }
            }
            Ok(parts.join(MERGE_SEPARATOR))
        }
        OutputFormat::Last => {
            let last = skill
                .workflow
                .iter()
                .rev()
                .find_map(|step| results.get(&step.id));
            Ok(last.map(|r| r.text.clone()).unwrap_or_default())
        }
        OutputFormat::Custom => {
            let tmpl = output
                .template
                .as_deref()
                .ok_or_else(|| anyhow!("output.template is required for custom format"))?;
            Ok(template::stringify(&template::resolve_string(tmpl, ctx)?))
        }
    }
}
