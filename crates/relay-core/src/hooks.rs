//! Pipeline completion hooks.
//!
//! Hooks are evaluated exactly once against the frozen [`RunReport`];
//! they can notify an external collaborator but never alter run state.

use crate::error::Result;
use crate::interpolation::{MissingVarPolicy, VariableScope};
use crate::model::Pipeline;
use crate::pipeline::HookCondition;
use crate::report::{RunReport, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::warn;

/// Payload handed to a notifier for each matching hook.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub pipeline: String,
    pub verdict: Verdict,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// External notification collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<()>;
}

impl HookCondition {
    fn matches(&self, verdict: Verdict) -> bool {
        match self {
            HookCondition::Always => true,
            HookCondition::OnSuccess => verdict == Verdict::Succeeded,
            HookCondition::OnFailure => verdict == Verdict::Failed,
        }
    }
}

/// Evaluate every declared hook against the final report.
///
/// Hook message templates see the pipeline variables plus `pipeline` and
/// `verdict`. Delivery failures are logged and swallowed: reporting must
/// complete even when a notifier is unreachable.
pub async fn fire_hooks(pipeline: &Pipeline, report: &RunReport, notifier: &dyn Notifier) {
    if pipeline.hooks.is_empty() {
        return;
    }

    let mut extras = HashMap::new();
    extras.insert("pipeline".to_string(), report.pipeline.clone());
    extras.insert(
        "verdict".to_string(),
        match report.verdict {
            Verdict::Succeeded => "succeeded".to_string(),
            Verdict::Failed => "failed".to_string(),
        },
    );
    let scope = VariableScope::build(&[&pipeline.variables], &extras, &[]);

    for hook in &pipeline.hooks {
        if !hook.on.matches(report.verdict) {
            continue;
        }
        let message = scope
            .interpolate("hooks", &hook.message, MissingVarPolicy::Warn)
            .unwrap_or_else(|_| hook.message.clone());
        let payload = NotificationPayload {
            pipeline: report.pipeline.clone(),
            verdict: report.verdict,
            message,
            timestamp: Utc::now(),
        };
        if let Err(e) = notifier.send(&payload).await {
            warn!(error = %e, "hook notification failed");
        }
    }
}
