// SPDX-License-Identifier: MIT
//! Skill documents — YAML frontmatter + markdown body.
//!
//! A skill is a reusable knowledge document; one with a non-empty workflow
//! is executable. The frontmatter carries identity, typed inputs, the
//! workflow DAG and the output stage; the body is the prompt content served
//! through `prompts/get`.

pub mod expand;
pub mod service;
pub mod store;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::mcp::Tool;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("name regex"));

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillState {
    #[default]
    Draft,
    Active,
    Disabled,
}

impl std::fmt::Display for SkillState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkillState::Draft => "draft",
            SkillState::Active => "active",
            SkillState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// A declared workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillInput {
    #[serde(rename = "type", default)]
    pub kind: InputType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Skip,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Duration literal, e.g. `1s`, `500ms`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backoff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_on_error")]
    pub on_error: OnError,
    /// Duration literal bounding this step's tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn is_default_on_error(v: &OnError) -> bool {
    *v == OnError::Fail
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Merged,
    Last,
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOutput {
    #[serde(default)]
    pub format: OutputFormat,
    /// Restricts `merged` output to these step ids. Membership only — the
    /// merged text keeps workflow order, not include-list order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "is_default_state")]
    pub state: SkillState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, SkillInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflow: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<WorkflowOutput>,
    #[serde(
        rename = "allowed-tools",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_tools: Vec<String>,
    /// Markdown body; lives outside the frontmatter.
    #[serde(skip)]
    pub body: String,
}

fn is_default_state(s: &SkillState) -> bool {
    *s == SkillState::Draft
}

/// `depends_on` accepts a scalar or a list.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

// ─── SKILL.md parsing ────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("SKILL.md must start with a '---' frontmatter fence")]
    MissingFrontmatter,
    #[error("unterminated frontmatter: closing '---' fence not found")]
    UnterminatedFrontmatter,
    #[error("invalid frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Parse a SKILL.md document. Environment expansion is applied to the
/// frontmatter only; the body is kept byte-for-byte.
pub fn parse_skill_md(content: &str) -> Result<Skill, SkillError> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
        .ok_or(SkillError::MissingFrontmatter)?;

    let (front, body) = match rest.find("\n---") {
        Some(idx) => {
            let front = &rest[..idx + 1];
            let after = &rest[idx + 4..];
            let body = after
                .strip_prefix('\n')
                .or_else(|| after.strip_prefix("\r\n"))
                .unwrap_or(after);
            (front, body)
        }
        None => return Err(SkillError::UnterminatedFrontmatter),
    };

    let expanded = expand::expand_env(front);
    let mut skill: Skill = serde_yaml::from_str(&expanded)?;
    skill.body = body.to_string();
    Ok(skill)
}

/// Serialize back to SKILL.md form. Inverse of [`parse_skill_md`] up to
/// YAML map ordering; the body round-trips byte-identically.
pub fn to_skill_md(skill: &Skill) -> Result<String, SkillError> {
    let front = serde_yaml::to_string(skill)?;
    Ok(format!("---\n{front}---\n{}", skill.body))
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Skill {
    pub fn is_executable(&self) -> bool {
        !self.workflow.is_empty()
    }

    /// Hard validation — gate for every store write.
    pub fn validate(&self) -> Result<(), SkillError> {
        if self.name.is_empty() {
            return Err(SkillError::Invalid("name is required".into()));
        }
        if !NAME_RE.is_match(&self.name) {
            return Err(SkillError::Invalid(format!(
                "name {:?} must match [A-Za-z0-9_-]+",
                self.name
            )));
        }
        if self.description.is_empty() {
            return Err(SkillError::Invalid("description is required".into()));
        }

        if self.is_executable() {
            let mut seen = HashSet::new();
            for (i, step) in self.workflow.iter().enumerate() {
                if step.id.is_empty() {
                    return Err(SkillError::Invalid(format!("workflow[{i}]: id is required")));
                }
                if !seen.insert(step.id.as_str()) {
                    return Err(SkillError::Invalid(format!(
                        "workflow: duplicate step id '{}'",
                        step.id
                    )));
                }
                if step.tool.is_empty() {
                    return Err(SkillError::Invalid(format!(
                        "workflow step '{}': tool is required",
                        step.id
                    )));
                }
                if let Some(timeout) = &step.timeout {
                    if parse_duration(timeout).is_none() {
                        return Err(SkillError::Invalid(format!(
                            "workflow step '{}': invalid timeout {timeout:?}",
                            step.id
                        )));
                    }
                }
                if let Some(retry) = &step.retry {
                    if retry.max_attempts == 0 {
                        return Err(SkillError::Invalid(format!(
                            "workflow step '{}': retry.max_attempts must be at least 1",
                            step.id
                        )));
                    }
                    if !retry.backoff.is_empty() && parse_duration(&retry.backoff).is_none() {
                        return Err(SkillError::Invalid(format!(
                            "workflow step '{}': invalid retry.backoff {:?}",
                            step.id, retry.backoff
                        )));
                    }
                }
            }
            for step in &self.workflow {
                for dep in &step.depends_on {
                    if !seen.contains(dep.as_str()) {
                        return Err(SkillError::Invalid(format!(
                            "workflow step '{}': depends_on references unknown step '{dep}'",
                            step.id
                        )));
                    }
                }
            }
            // Cycle check is the planner's duplicate/dangling/cycle pass.
            crate::workflow::dag::plan_levels(&self.workflow)
                .map_err(|e| SkillError::Invalid(e.to_string()))?;
        }

        if let Some(output) = &self.output {
            if output.format == OutputFormat::Custom && output.template.is_none() {
                return Err(SkillError::Invalid(
                    "output.template is required for custom format".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validation plus advisory warnings; `available_tools` enables the
    /// unknown-tool check against the live catalog.
    pub fn validate_full(&self, available_tools: Option<&HashSet<String>>) -> ValidationReport {
        let mut report = ValidationReport::default();
        if let Err(e) = self.validate() {
            report.errors.push(e.to_string());
        }

        if let Some(available) = available_tools {
            if !available.is_empty() {
                for step in &self.workflow {
                    if !available.contains(&step.tool) {
                        report.warnings.push(format!(
                            "step '{}' references tool '{}' which is not currently available",
                            step.id, step.tool
                        ));
                    }
                }
            }
        }

        // A dependent of an on_error:skip step with no condition will be
        // skipped whenever that step fails.
        for step in &self.workflow {
            if step.on_error != OnError::Skip {
                continue;
            }
            for other in &self.workflow {
                if other.condition.is_none() && other.depends_on.contains(&step.id) {
                    report.warnings.push(format!(
                        "step '{}' has no condition but depends on a step with on_error: skip",
                        other.id
                    ));
                }
            }
        }
        report
    }

    /// The MCP tool form of an executable skill — schema built from the
    /// declared inputs.
    pub fn to_tool(&self) -> Tool {
        let mut properties = Map::new();
        let mut required: Vec<String> = Vec::new();
        for (name, input) in &self.inputs {
            let mut prop = Map::new();
            let kind = match input.kind {
                InputType::String => "string",
                InputType::Number => "number",
                InputType::Boolean => "boolean",
                InputType::Object => "object",
                InputType::Array => "array",
            };
            prop.insert("type".into(), json!(kind));
            if !input.description.is_empty() {
                prop.insert("description".into(), json!(input.description));
            }
            if !input.choices.is_empty() {
                prop.insert("enum".into(), json!(input.choices));
            }
            properties.insert(name.clone(), Value::Object(prop));
            if input.required {
                required.push(name.clone());
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), json!("object"));
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), json!(required));
        }

        Tool {
            name: self.name.clone(),
            title: None,
            description: self.description.clone(),
            input_schema: Value::Object(schema),
        }
    }
}

/// Parse a duration literal: `500ms`, `30s`, `2m`, `1h`; a bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = num.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}
