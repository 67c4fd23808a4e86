//! Execution coordinator: the single entry point for running candidate code.
//!
//! Resolves the policy, runs static analysis, and hands safe source to the
//! executor. Holds no per-call state, so one coordinator serves any number
//! of concurrent executions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzer::{self, AnalysisReport};
use crate::config::{Config, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::executor::{ExecutionRequest, Executor, ProcessExecutor};
use crate::outcome::ExecutionOutcome;
use crate::policy::PolicyRegistry;

/// What a caller asks to run. Omitted limits and policy take the
/// configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSubmission {
    pub source: String,
    pub entry_point: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub keyword_arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

impl ExecutionSubmission {
    pub fn new(source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
            ..Self::default()
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_keyword_arguments(mut self, keyword_arguments: Map<String, Value>) -> Self {
        self.keyword_arguments = keyword_arguments;
        self
    }

    pub fn with_policy(mut self, policy_name: impl Into<String>) -> Self {
        self.policy_name = Some(policy_name.into());
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: f64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_memory_limit(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }
}

pub struct ExecutionCoordinator {
    registry: Arc<PolicyRegistry>,
    executor: Arc<dyn Executor>,
    settings: SandboxConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        executor: Arc<dyn Executor>,
        settings: SandboxConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
        }
    }

    /// Production wiring: builtin plus configured policies, process executor.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = PolicyRegistry::with_files(&config.policies.files)?;
        info!(
            "Loaded {} policies ({} aliases)",
            registry.len(),
            registry.aliases().len()
        );
        let executor = ProcessExecutor::new(config.worker.clone());
        Ok(Self::new(
            Arc::new(registry),
            Arc::new(executor),
            config.sandbox.clone(),
        ))
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Runs a submission end to end.
    ///
    /// Errors are reserved for configuration problems (unknown policy,
    /// invalid limits, sandbox disabled). Anything the candidate code does
    /// comes back as an [`ExecutionOutcome`].
    pub async fn execute(&self, submission: ExecutionSubmission) -> Result<ExecutionOutcome> {
        let execution_id = Uuid::new_v4();
        if !self.settings.enabled {
            warn!("[{execution_id}] Refusing execution: sandbox disabled");
            return Err(SandboxError::Disabled);
        }

        let policy_name = submission
            .policy_name
            .as_deref()
            .unwrap_or(self.settings.default_policy.as_str());
        let whitelist = self.registry.resolve(policy_name)?;

        let report = analyzer::analyze(&submission.source, &whitelist);
        if !report.is_safe {
            warn!(
                "[{execution_id}] Rejected '{}' under {}: {}",
                submission.entry_point,
                whitelist.name(),
                report.summary()
            );
            return Ok(ExecutionOutcome::SecurityRejected { report });
        }

        let request = ExecutionRequest::new(
            submission.source,
            submission.entry_point,
            submission.arguments,
            submission
                .timeout_seconds
                .unwrap_or(self.settings.default_timeout_secs),
            submission
                .memory_limit_mb
                .unwrap_or(self.settings.default_memory_limit_mb),
        )?
        .with_keyword_arguments(submission.keyword_arguments)?;

        info!(
            "[{execution_id}] Executing '{}' under {} (timeout {}s, memory {}MB, score {:.2})",
            request.entry_point(),
            whitelist.name(),
            request.timeout_seconds(),
            request.memory_limit_mb(),
            report.security_score
        );

        let outcome = self.executor.run(&request, &whitelist).await;
        match &outcome {
            ExecutionOutcome::Success { wall_time_ms, .. } => {
                info!("[{execution_id}] Completed in {wall_time_ms}ms")
            }
            other => warn!(
                "[{execution_id}] Finished with {}: {}",
                other.label(),
                other.error_summary().unwrap_or_default()
            ),
        }
        Ok(outcome)
    }

    /// Static analysis only, against the named (or default) policy.
    pub fn analyze(&self, source: &str, policy_name: Option<&str>) -> Result<AnalysisReport> {
        let whitelist = self
            .registry
            .resolve(policy_name.unwrap_or(self.settings.default_policy.as_str()))?;
        Ok(analyzer::analyze(source, &whitelist))
    }
}
