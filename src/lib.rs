//! funcbox: secure execution core for user- and LLM-authored Python functions.
//!
//! Source goes through static analysis against a named policy, then runs in
//! a resource-bounded worker process. Every run ends in an
//! [`ExecutionOutcome`]; only configuration problems are errors.

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod policy;
pub mod testing;

pub use analyzer::{analyze, AnalysisReport, Violation};
pub use config::Config;
pub use coordinator::{ExecutionCoordinator, ExecutionSubmission};
pub use error::{Result, SandboxError};
pub use executor::{ExecutionRequest, Executor, ProcessExecutor};
pub use outcome::{ExecutionOutcome, ResourceKind};
pub use policy::{PolicyRegistry, Whitelist};
