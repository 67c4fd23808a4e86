//! `Executor` trait: runs analyzed source under resource limits.
//!
//! [`ProcessExecutor`] is the production backend: one short-lived Python
//! worker process per request, bounded by rlimits and a wall-clock deadline.
//! The coordinator only sees the trait, so tests can swap in a recording
//! executor.

mod worker;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::analyzer::{self, parser};
use crate::config::WorkerConfig;
use crate::error::{Result, SandboxError};
use crate::outcome::ExecutionOutcome;
use crate::policy::Whitelist;

use worker::{WorkerPayload, WorkerSpec};

/// Longest wall-clock budget a single request may ask for.
pub const MAX_TIMEOUT_SECS: f64 = 600.0;

/// Largest memory budget a single request may ask for.
pub const MAX_MEMORY_LIMIT_MB: u64 = 16 * 1024;

/// A validated, immutable execution request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    source: String,
    entry_point: String,
    arguments: Vec<Value>,
    keyword_arguments: Map<String, Value>,
    timeout_seconds: f64,
    memory_limit_mb: u64,
}

impl ExecutionRequest {
    pub fn new(
        source: impl Into<String>,
        entry_point: impl Into<String>,
        arguments: Vec<Value>,
        timeout_seconds: f64,
        memory_limit_mb: u64,
    ) -> Result<Self> {
        let entry_point = entry_point.into();
        if !is_identifier(&entry_point) || parser::is_keyword(&entry_point) {
            return Err(SandboxError::InvalidRequest(format!(
                "entry point '{entry_point}' is not a valid identifier"
            )));
        }
        if !(timeout_seconds.is_finite() && timeout_seconds > 0.0) {
            return Err(SandboxError::InvalidRequest(format!(
                "timeout must be a positive number of seconds, got {timeout_seconds}"
            )));
        }
        if timeout_seconds > MAX_TIMEOUT_SECS {
            return Err(SandboxError::InvalidRequest(format!(
                "timeout {timeout_seconds}s exceeds the maximum of {MAX_TIMEOUT_SECS}s"
            )));
        }
        if memory_limit_mb == 0 {
            return Err(SandboxError::InvalidRequest(
                "memory limit must be positive".to_string(),
            ));
        }
        if memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            return Err(SandboxError::InvalidRequest(format!(
                "memory limit {memory_limit_mb}MB exceeds the maximum of {MAX_MEMORY_LIMIT_MB}MB"
            )));
        }
        Ok(Self {
            source: source.into(),
            entry_point,
            arguments,
            keyword_arguments: Map::new(),
            timeout_seconds,
            memory_limit_mb,
        })
    }

    /// Adds keyword arguments; every key must be a valid parameter name.
    pub fn with_keyword_arguments(mut self, keyword_arguments: Map<String, Value>) -> Result<Self> {
        if let Some(bad) = keyword_arguments
            .keys()
            .find(|k| !is_identifier(k) || parser::is_keyword(k))
        {
            return Err(SandboxError::InvalidRequest(format!(
                "keyword argument '{bad}' is not a valid identifier"
            )));
        }
        self.keyword_arguments = keyword_arguments;
        Ok(self)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn keyword_arguments(&self) -> &Map<String, Value> {
        &self.keyword_arguments
    }

    pub fn timeout_seconds(&self) -> f64 {
        self.timeout_seconds
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// Abstraction over execution backends.
///
/// Implementations never fail: every problem with the candidate code or
/// its worker is reported as an [`ExecutionOutcome`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `request` against `whitelist` and reports how it went.
    async fn run(&self, request: &ExecutionRequest, whitelist: &Whitelist) -> ExecutionOutcome;

    /// Human-readable description of the backend.
    ///
    /// Used in status output, e.g. `"process (python3)"`.
    fn description(&self) -> String;
}

/// Runs each request in a fresh interpreter process.
pub struct ProcessExecutor {
    config: WorkerConfig,
}

impl ProcessExecutor {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, request: &ExecutionRequest, whitelist: &Whitelist) -> ExecutionOutcome {
        // Never trust that the caller analyzed with the same whitelist.
        let report = analyzer::analyze(request.source(), whitelist);
        if !report.is_safe {
            warn!(
                "Executor refused source under policy '{}': {}",
                whitelist.name(),
                report.summary()
            );
            return ExecutionOutcome::SecurityRejected { report };
        }

        let payload = WorkerPayload {
            source: request.source(),
            entry_point: request.entry_point(),
            arguments: request.arguments(),
            keyword_arguments: request.keyword_arguments(),
            policy: whitelist,
            memory_limit_mb: request.memory_limit_mb(),
            max_output_bytes: self.config.max_output_bytes,
        };
        let payload = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionOutcome::internal_failure(
                    "SandboxInternalError",
                    format!("cannot encode worker payload: {e}"),
                    0,
                )
            }
        };
        debug!("Dispatching '{}' to a worker", request.entry_point());

        let spec = WorkerSpec {
            python: self.config.python.clone(),
            timeout: request.timeout(),
            memory_limit_mb: request.memory_limit_mb(),
            interpreter_overhead_mb: self.config.interpreter_overhead_mb,
            max_output_bytes: self.config.max_output_bytes,
        };
        let mut supervisor = AbortOnDrop(tokio::spawn(worker::supervise(spec, payload)));
        match (&mut supervisor.0).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Worker supervisor task failed: {e}");
                ExecutionOutcome::internal_failure(
                    "SandboxInternalError",
                    format!("worker supervisor failed: {e}"),
                    0,
                )
            }
        }
    }

    fn description(&self) -> String {
        format!("process ({})", self.config.python)
    }
}

/// Aborts the supervisor task when the caller stops waiting. The task owns
/// the worker child, which is killed when dropped.
struct AbortOnDrop(JoinHandle<ExecutionOutcome>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Worker tests need a real interpreter; they skip when there is none.
    pub fn python3_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }
}
