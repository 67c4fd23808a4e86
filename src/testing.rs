//! Test runner for candidate functions.
//!
//! A test case is an input plus either an expected output or an expected
//! error fragment. Cases run through the coordinator like any other
//! execution, so they get the same analysis, limits and outcome contract.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::coordinator::{ExecutionCoordinator, ExecutionSubmission};
use crate::outcome::ExecutionOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Object → keyword arguments, array → positional arguments,
    /// null → no arguments, anything else → one positional argument.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
    /// Case-insensitive fragment the error summary must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub description: String,
}

impl TestCase {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
            expected_output: None,
            expected_error: None,
            timeout_seconds: None,
            description: String::new(),
        }
    }

    pub fn expecting(mut self, output: Value) -> Self {
        self.expected_output = Some(output);
        self
    }

    pub fn expecting_error(mut self, fragment: impl Into<String>) -> Self {
        self.expected_error = Some(fragment.into());
        self
    }

    /// Splits `input` into positional and keyword arguments.
    pub fn call_arguments(&self) -> (Vec<Value>, Map<String, Value>) {
        match &self.input {
            Value::Null => (Vec::new(), Map::new()),
            Value::Array(items) => (items.clone(), Map::new()),
            Value::Object(map) => (Vec::new(), map.clone()),
            scalar => (vec![scalar.clone()], Map::new()),
        }
    }
}

/// The function a suite exercises.
#[derive(Debug, Clone)]
pub struct FunctionUnderTest {
    pub source: String,
    pub entry_point: String,
    pub policy_name: Option<String>,
}

impl FunctionUnderTest {
    pub fn new(source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
            policy_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    pub execution_time_ms: u64,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Expected output, or the expected error fragment as a string.
    pub expected: Option<Value>,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteSummary {
    pub function_name: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Percentage, 0.0 for an empty suite.
    pub success_rate: f64,
    pub total_execution_time_ms: u64,
    pub avg_execution_time_ms: f64,
    pub results: Vec<TestResult>,
    pub timestamp: DateTime<Utc>,
}

impl TestSuiteSummary {
    pub fn from_results(function_name: impl Into<String>, results: Vec<TestResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let total_execution_time_ms: u64 = results.iter().map(|r| r.execution_time_ms).sum();
        let (success_rate, avg_execution_time_ms) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                passed as f64 / total as f64 * 100.0,
                total_execution_time_ms as f64 / total as f64,
            )
        };
        Self {
            function_name: function_name.into(),
            total,
            passed,
            failed: total - passed,
            success_rate,
            total_execution_time_ms,
            avg_execution_time_ms,
            results,
            timestamp: Utc::now(),
        }
    }
}

/// Runs one case. Never fails: configuration errors become failed results.
pub async fn run_test_case(
    coordinator: &ExecutionCoordinator,
    function: &FunctionUnderTest,
    case: &TestCase,
) -> TestResult {
    let (arguments, keyword_arguments) = case.call_arguments();
    let mut submission =
        ExecutionSubmission::new(function.source.clone(), function.entry_point.clone())
            .with_arguments(arguments)
            .with_keyword_arguments(keyword_arguments);
    submission.policy_name = function.policy_name.clone();
    submission.timeout_seconds = case.timeout_seconds;

    let started = Instant::now();
    let executed = coordinator.execute(submission).await;
    let execution_time_ms: u64 = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    let expected_error = case
        .expected_error
        .as_ref()
        .map(|fragment| Value::String(fragment.clone()));
    let result = |passed: bool,
                  output: Option<Value>,
                  error: Option<String>,
                  expected: Option<Value>,
                  details: &str| {
        TestResult {
            test_name: case.name.clone(),
            passed,
            execution_time_ms,
            output,
            error,
            expected,
            details: details.to_string(),
            timestamp: Utc::now(),
        }
    };

    match executed {
        Ok(ExecutionOutcome::Success { return_value, .. }) => {
            if case.expected_error.is_some() {
                return result(
                    false,
                    Some(return_value),
                    None,
                    expected_error,
                    "Expected error but function executed successfully",
                );
            }
            let passed = compare_outputs(&return_value, case.expected_output.as_ref());
            result(
                passed,
                Some(return_value),
                None,
                case.expected_output.clone(),
                if passed {
                    "Output matches expected"
                } else {
                    "Output differs from expected"
                },
            )
        }
        Ok(outcome) => {
            let summary = outcome.error_summary().unwrap_or_default();
            match &case.expected_error {
                Some(fragment) => {
                    let passed = summary.to_lowercase().contains(&fragment.to_lowercase());
                    result(
                        passed,
                        None,
                        Some(summary),
                        expected_error,
                        if passed {
                            "Expected error occurred"
                        } else {
                            "Different error than expected"
                        },
                    )
                }
                None => result(
                    false,
                    None,
                    Some(summary),
                    case.expected_output.clone(),
                    "Unexpected error during execution",
                ),
            }
        }
        Err(e) => result(
            false,
            None,
            Some(e.to_string()),
            case.expected_output.clone().or(expected_error),
            "Exception during test execution",
        ),
    }
}

/// Runs every case with at most `concurrency` in flight. Results keep the
/// order of `cases`.
pub async fn run_test_suite(
    coordinator: &ExecutionCoordinator,
    function: &FunctionUnderTest,
    cases: &[TestCase],
    concurrency: usize,
) -> TestSuiteSummary {
    let results: Vec<TestResult> = stream::iter(cases)
        .map(|case| run_test_case(coordinator, function, case))
        .buffered(concurrency.max(1))
        .collect()
        .await;
    let summary = TestSuiteSummary::from_results(function.entry_point.clone(), results);
    info!(
        "Test suite for {}: {}/{} passed ({:.1}%)",
        summary.function_name, summary.passed, summary.total, summary.success_rate
    );
    summary
}

/// True if `actual` satisfies `expected`. A missing expectation always
/// passes; numbers compare by value, so `5` matches `5.0`.
pub fn compare_outputs(actual: &Value, expected: Option<&Value>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    match (actual, expected) {
        (Value::Number(a), Value::Number(e)) => numbers_equal(a, e),
        (Value::Array(a), Value::Array(e)) => {
            a.len() == e.len() && a.iter().zip(e).all(|(a, e)| compare_outputs(a, Some(e)))
        }
        (Value::Object(a), Value::Object(e)) => {
            a.len() == e.len()
                && e.iter()
                    .all(|(key, e)| a.get(key).is_some_and(|a| compare_outputs(a, Some(e))))
        }
        _ => actual == expected,
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
