//! `ExecutionOutcome`: the one return contract of an execution.
//!
//! Every path through the coordinator ends in one of these variants (or a
//! configuration error). Outcomes are plain data: callers persist them as
//! execution history and never see candidate-code exceptions as host errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analyzer::AnalysisReport;

/// Which limit a worker ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Timeout,
    Memory,
}

impl ResourceKind {
    /// Unit of `limit` / `observed` for this kind.
    pub fn unit(self) -> &'static str {
        match self {
            ResourceKind::Timeout => "s",
            ResourceKind::Memory => "MB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        return_value: Value,
        stdout_capture: String,
        stderr_capture: String,
        wall_time_ms: u64,
        peak_memory_mb: f64,
        /// True if either captured stream was clipped.
        output_truncated: bool,
    },
    RuntimeFailure {
        exception_kind: String,
        message: String,
        stdout_capture: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
        wall_time_ms: u64,
    },
    SecurityRejected {
        report: AnalysisReport,
    },
    /// `limit` and `observed` are seconds for timeouts and megabytes for memory.
    ResourceExceeded {
        kind: ResourceKind,
        limit: f64,
        observed: f64,
    },
}

impl ExecutionOutcome {
    /// Failure raised by the sandbox itself rather than by candidate code
    /// (worker crash, spawn failure, ...).
    pub(crate) fn internal_failure(
        exception_kind: &str,
        message: impl Into<String>,
        wall_time_ms: u64,
    ) -> Self {
        ExecutionOutcome::RuntimeFailure {
            exception_kind: exception_kind.to_string(),
            message: message.into(),
            stdout_capture: String::new(),
            traceback: None,
            wall_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Tag as it appears on the wire.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::RuntimeFailure { .. } => "runtime_failure",
            ExecutionOutcome::SecurityRejected { .. } => "security_rejected",
            ExecutionOutcome::ResourceExceeded { .. } => "resource_exceeded",
        }
    }

    /// Human-readable description of a non-success outcome.
    pub fn error_summary(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                message,
                ..
            } => Some(if message.is_empty() {
                exception_kind.clone()
            } else {
                format!("{exception_kind}: {message}")
            }),
            ExecutionOutcome::SecurityRejected { report } => {
                Some(format!("SecurityRejected: {}", report.summary()))
            }
            ExecutionOutcome::ResourceExceeded {
                kind,
                limit,
                observed,
            } => Some(format!(
                "ResourceExceeded: {} limit {limit}{unit} (observed {observed:.2}{unit})",
                match kind {
                    ResourceKind::Timeout => "timeout",
                    ResourceKind::Memory => "memory",
                },
                unit = kind.unit(),
            )),
        }
    }
}
