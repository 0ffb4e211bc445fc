//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Stage execution order. Jobs referencing an undeclared stage fail
    /// validation at load time.
    pub stages: Vec<String>,
    /// Pipeline-level variables, overridable per stage and per job.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Stage-level variable overrides, keyed by stage name.
    #[serde(default)]
    pub stage_variables: HashMap<String, HashMap<String, String>>,
    /// Jobs in declaration order. Declaration order breaks dispatch ties.
    pub jobs: Vec<JobDefinition>,
    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub stage: String,
    /// Ordered shell commands. The first non-zero exit aborts the rest.
    pub script: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Names of jobs this job depends on.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Paths (relative to the job directory) published on success.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub when: WhenPolicy,
    #[serde(default)]
    pub allow_failure: bool,
    /// Additional attempts after the first failure. Timeouts are not retried.
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Predicate deciding whether a job runs given its dependencies' outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenPolicy {
    Always,
    #[default]
    OnSuccess,
    OnFailure,
    Manual,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDefinition {
    #[serde(default)]
    pub on: HookCondition,
    /// Message template, interpolated against pipeline variables plus
    /// `${{ pipeline }}` and `${{ verdict }}`.
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
}

impl JobDefinition {
    /// Minimal definition with defaults matching the serde defaults.
    pub fn new(name: impl Into<String>, stage: impl Into<String>, script: Vec<String>) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            script,
            variables: HashMap::new(),
            needs: Vec::new(),
            artifacts: Vec::new(),
            when: WhenPolicy::default(),
            allow_failure: false,
            retries: 0,
            timeout_seconds: default_timeout_seconds(),
            shell: default_shell(),
        }
    }
}
