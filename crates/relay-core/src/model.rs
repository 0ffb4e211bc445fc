//! Compiled pipeline model.
//!
//! [`Pipeline::load`] turns a user-authored [`PipelineDefinition`] into an
//! index-based model: job and stage names are resolved to integer indices
//! exactly once, so every later component works with indices and all
//! unknown-reference validation lives here.

use crate::error::{Error, Result};
use crate::ids::JobId;
use crate::interpolation;
use crate::pipeline::{HookDefinition, JobDefinition, PipelineDefinition, WhenPolicy};
use std::collections::HashMap;

/// A job with all name references resolved to indices.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Index into [`Pipeline::stages`].
    pub stage: usize,
    pub script: Vec<String>,
    pub variables: HashMap<String, String>,
    pub needs: Vec<JobId>,
    pub artifacts: Vec<String>,
    pub when: WhenPolicy,
    pub allow_failure: bool,
    pub retries: u32,
    pub timeout_seconds: u64,
    pub shell: String,
}

/// Validated, immutable pipeline. Constructed once per invocation.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<String>,
    /// Jobs in declaration order; a job's position is its [`JobId`].
    pub jobs: Vec<Job>,
    pub variables: HashMap<String, String>,
    /// Stage-level variable overrides, indexed like [`Pipeline::stages`].
    pub stage_variables: Vec<HashMap<String, String>>,
    pub hooks: Vec<HookDefinition>,
    name_to_job: HashMap<String, JobId>,
}

impl Pipeline {
    /// Validate a definition and compile it into the index-based model.
    ///
    /// Pure construction: no side effects, no I/O. All reference errors
    /// (unknown stage, unknown dependency, duplicate job names, malformed
    /// interpolation syntax) surface here, before anything executes.
    pub fn load(definition: PipelineDefinition) -> Result<Self> {
        if definition.stages.is_empty() {
            return Err(Error::Validation("pipeline declares no stages".into()));
        }
        if definition.jobs.is_empty() {
            return Err(Error::Validation("pipeline declares no jobs".into()));
        }

        let mut stage_index = HashMap::new();
        for (idx, stage) in definition.stages.iter().enumerate() {
            if stage_index.insert(stage.clone(), idx).is_some() {
                return Err(Error::Validation(format!("duplicate stage '{stage}'")));
            }
        }

        let mut name_to_job = HashMap::new();
        for (idx, job) in definition.jobs.iter().enumerate() {
            if name_to_job.insert(job.name.clone(), JobId(idx)).is_some() {
                return Err(Error::DuplicateJob(job.name.clone()));
            }
        }

        let mut jobs = Vec::with_capacity(definition.jobs.len());
        for (idx, def) in definition.jobs.iter().enumerate() {
            let job = Self::compile_job(JobId(idx), def, &stage_index, &name_to_job)?;
            // A needs target must be declared earlier or sit in an
            // earlier/equal stage; anything else could not be satisfied
            // under stage ordering and is rejected here, not at runtime.
            for &dep in &job.needs {
                let target = &definition.jobs[dep.index()];
                if dep.index() > idx && stage_index[&target.stage] > job.stage {
                    return Err(Error::Validation(format!(
                        "job '{}' needs '{}', which is declared later and in a later stage",
                        def.name, target.name
                    )));
                }
            }
            jobs.push(job);
        }

        for (stage, vars) in &definition.stage_variables {
            if !stage_index.contains_key(stage) {
                return Err(Error::Validation(format!(
                    "stage_variables references undeclared stage '{stage}'"
                )));
            }
            for value in vars.values() {
                interpolation::check_syntax(value)
                    .map_err(|e| Error::Validation(format!("in stage '{stage}': {e}")))?;
            }
        }

        let mut stage_variables = vec![HashMap::new(); definition.stages.len()];
        for (stage, vars) in definition.stage_variables {
            stage_variables[stage_index[&stage]] = vars;
        }

        for value in definition.variables.values() {
            interpolation::check_syntax(value)
                .map_err(|e| Error::Validation(format!("in pipeline variables: {e}")))?;
        }

        Ok(Self {
            name: definition.name,
            stages: definition.stages,
            jobs,
            variables: definition.variables,
            stage_variables,
            hooks: definition.hooks,
            name_to_job,
        })
    }

    fn compile_job(
        id: JobId,
        def: &JobDefinition,
        stage_index: &HashMap<String, usize>,
        name_to_job: &HashMap<String, JobId>,
    ) -> Result<Job> {
        let stage = *stage_index
            .get(&def.stage)
            .ok_or_else(|| Error::UnknownStage {
                job: def.name.clone(),
                stage: def.stage.clone(),
            })?;

        let mut needs = Vec::with_capacity(def.needs.len());
        for dep in &def.needs {
            let dep_id = *name_to_job
                .get(dep)
                .ok_or_else(|| Error::UnknownDependency {
                    job: def.name.clone(),
                    needs: dep.clone(),
                })?;
            needs.push(dep_id);
        }

        for text in def.script.iter().chain(def.variables.values()) {
            interpolation::check_syntax(text)
                .map_err(|e| Error::Validation(format!("in job '{}': {e}", def.name)))?;
        }

        Ok(Job {
            id,
            name: def.name.clone(),
            stage,
            script: def.script.clone(),
            variables: def.variables.clone(),
            needs,
            artifacts: def.artifacts.clone(),
            when: def.when,
            allow_failure: def.allow_failure,
            retries: def.retries,
            timeout_seconds: def.timeout_seconds,
            shell: def.shell.clone(),
        })
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.index()]
    }

    pub fn job_by_name(&self, name: &str) -> Option<&Job> {
        self.name_to_job.get(name).map(|id| self.job(*id))
    }

    /// Effective variables for a job: job > stage > pipeline.
    pub fn variables_for(&self, id: JobId) -> HashMap<String, String> {
        let job = self.job(id);
        let mut vars = self.variables.clone();
        vars.extend(self.stage_variables[job.stage].clone());
        vars.extend(job.variables.clone());
        vars
    }
}
