//! One worker process per execution.
//!
//! The host writes a JSON payload to the worker's stdin and reads exactly one
//! JSON report back from its stdout. Everything the host knows about the run
//! comes from that report, the exit status and the wall clock.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::outcome::{ExecutionOutcome, ResourceKind};
use crate::policy::Whitelist;

/// Python side of the worker, run with `python3 -c`.
const HARNESS: &str = include_str!("harness.py");

/// Report budget on top of the two captured streams (return value, traceback).
const REPORT_OVERHEAD_BYTES: usize = 16 * 1024 * 1024;

/// Interpreter-level stderr kept for crash diagnostics.
const STDERR_CAP_BYTES: usize = 64 * 1024;

/// How much interpreter stderr is quoted in a `WorkerCrashed` message.
const STDERR_TAIL_CHARS: usize = 400;

/// Everything needed to launch and police one worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec {
    pub python: String,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    pub interpreter_overhead_mb: u64,
    pub max_output_bytes: usize,
}

impl WorkerSpec {
    fn report_cap(&self) -> usize {
        REPORT_OVERHEAD_BYTES.saturating_add(self.max_output_bytes.saturating_mul(2))
    }
}

/// Payload written to the worker's stdin.
#[derive(Debug, Serialize)]
pub(crate) struct WorkerPayload<'a> {
    pub source: &'a str,
    pub entry_point: &'a str,
    pub arguments: &'a [Value],
    pub keyword_arguments: &'a Map<String, Value>,
    pub policy: &'a Whitelist,
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
}

/// The worker's single stdout document.
#[derive(Debug, Deserialize)]
struct WorkerReport {
    #[serde(flatten)]
    status: WorkerStatus,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    peak_memory_mb: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WorkerStatus {
    Ok {
        #[serde(default)]
        return_value: Value,
    },
    Error {
        exception_kind: String,
        message: String,
        #[serde(default)]
        traceback: Option<String>,
    },
    MemoryExceeded,
}

/// Bytes read from one worker pipe, up to a cap.
#[derive(Debug, Default)]
struct CapturedStream {
    data: Vec<u8>,
    /// The worker wrote more than the cap; the excess was discarded.
    overflowed: bool,
}

// ── launch ──────────────────────────────────────────────

/// rlimits installed in the child between fork and exec.
#[derive(Debug, Clone, Copy)]
struct WorkerLimits {
    address_space_bytes: u64,
    cpu_seconds: u64,
}

impl WorkerLimits {
    fn for_spec(spec: &WorkerSpec) -> Self {
        let address_space_mb = spec
            .memory_limit_mb
            .saturating_add(spec.interpreter_overhead_mb);
        Self {
            address_space_bytes: address_space_mb.saturating_mul(1024 * 1024),
            // CPU time is a backstop for the wall-clock deadline.
            cpu_seconds: spec.timeout.as_secs_f64().ceil() as u64 + 1,
        }
    }
}

#[cfg(unix)]
fn apply_rlimits(limits: &WorkerLimits) -> std::io::Result<()> {
    unsafe {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let v = limits.address_space_bytes as libc::rlim_t;
            let as_limit = libc::rlimit {
                rlim_cur: v,
                rlim_max: v,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &as_limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = limits.address_space_bytes;
        }

        // Hard limit one second later, so the soft limit delivers SIGXCPU.
        let v = limits.cpu_seconds as libc::rlim_t;
        let cpu = libc::rlimit {
            rlim_cur: v,
            rlim_max: v + 1,
        };
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let zero = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &zero) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_FSIZE, &zero) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn build_command(spec: &WorkerSpec) -> Command {
    let mut cmd = Command::new(&spec.python);
    // No -I: isolated mode also ignores PYTHONHASHSEED. The harness drops
    // the working directory from sys.path itself.
    cmd.args(["-S", "-s", "-B", "-c", HARNESS])
        .env_clear()
        .env("LC_ALL", "C")
        .env("PYTHONHASHSEED", "0")
        .env("PYTHONIOENCODING", "utf-8")
        .env("PYTHONUTF8", "1")
        .current_dir("/")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Interpreter lookup (and version-manager shims) still need PATH.
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }

    #[cfg(unix)]
    {
        let limits = WorkerLimits::for_spec(spec);
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&limits));
        }
    }
    cmd
}

// ── supervision ─────────────────────────────────────────

/// Runs one worker to completion or to its deadline.
///
/// Meant to be spawned as its own task: the deadline is enforced here, so an
/// abandoned caller does not leave a runaway worker behind.
pub(crate) async fn supervise(spec: WorkerSpec, payload: Vec<u8>) -> ExecutionOutcome {
    let started = Instant::now();
    let mut child = match build_command(&spec).spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Cannot start worker '{}': {e}", spec.python);
            return ExecutionOutcome::internal_failure(
                "WorkerSpawnFailed",
                format!("cannot start interpreter '{}': {e}", spec.python),
                elapsed_ms(started),
            );
        }
    };
    debug!(
        "Worker {:?} started ({} byte payload, {}MB + {}MB address space, {:?} deadline)",
        child.id(),
        payload.len(),
        spec.memory_limit_mb,
        spec.interpreter_overhead_mb,
        spec.timeout
    );

    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill().await;
        return ExecutionOutcome::internal_failure(
            "WorkerSpawnFailed",
            "worker pipes were not captured",
            elapsed_ms(started),
        );
    };

    let feed = async move {
        // A worker that dies before reading closes the pipe; its exit status
        // tells the rest of the story.
        if let Err(e) = stdin.write_all(&payload).await {
            debug!("Worker stdin closed early: {e}");
        }
        let _ = stdin.shutdown().await;
    };
    let io = async {
        let (_, out, err, status) = tokio::join!(
            feed,
            read_capped(stdout, spec.report_cap()),
            read_capped(stderr, STDERR_CAP_BYTES),
            child.wait()
        );
        (out, err, status)
    };
    let finished = tokio::time::timeout(spec.timeout, io).await;

    match finished {
        Ok((stdout, stderr, status)) => {
            let status = match status {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("Cannot collect worker exit status: {e}");
                    None
                }
            };
            classify(&spec, stdout, stderr, status, elapsed_ms(started))
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("Cannot kill timed-out worker: {e}");
            }
            let observed = started.elapsed().as_secs_f64();
            warn!(
                "Worker killed after {observed:.3}s (deadline {:?})",
                spec.timeout
            );
            ExecutionOutcome::ResourceExceeded {
                kind: ResourceKind::Timeout,
                limit: spec.timeout.as_secs_f64(),
                observed: round_millis(observed),
            }
        }
    }
}

/// Reads `reader` to EOF, keeping at most `cap` bytes.
///
/// Keeps draining after the cap so the worker never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.data.len());
                if n > room {
                    captured.overflowed = true;
                }
                captured.data.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Worker pipe read failed: {e}");
                break;
            }
        }
    }
    captured
}

// ── classification ──────────────────────────────────────

/// Turns what the worker left behind into an outcome.
fn classify(
    spec: &WorkerSpec,
    stdout: CapturedStream,
    stderr: CapturedStream,
    status: Option<ExitStatus>,
    wall_time_ms: u64,
) -> ExecutionOutcome {
    let signal = status.and_then(exit_signal);
    let memory_limit = spec.memory_limit_mb as f64;

    if signal == Some(libc::SIGXCPU) {
        warn!("Worker exceeded its CPU time limit");
        return ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::Timeout,
            limit: spec.timeout.as_secs_f64(),
            observed: round_millis(wall_time_ms as f64 / 1000.0),
        };
    }

    if let Ok(report) = serde_json::from_slice::<WorkerReport>(&stdout.data) {
        return match report.status {
            WorkerStatus::Ok { return_value } => ExecutionOutcome::Success {
                return_value,
                stdout_capture: report.stdout,
                stderr_capture: report.stderr,
                wall_time_ms,
                peak_memory_mb: report.peak_memory_mb,
                output_truncated: report.truncated,
            },
            WorkerStatus::Error {
                exception_kind,
                message,
                traceback,
            } => ExecutionOutcome::RuntimeFailure {
                exception_kind,
                message,
                stdout_capture: report.stdout,
                traceback,
                wall_time_ms,
            },
            WorkerStatus::MemoryExceeded => {
                warn!("Worker ran out of memory ({memory_limit}MB limit)");
                ExecutionOutcome::ResourceExceeded {
                    kind: ResourceKind::Memory,
                    limit: memory_limit,
                    observed: memory_limit.max(report.peak_memory_mb),
                }
            }
        };
    }

    if stdout.overflowed {
        return ExecutionOutcome::internal_failure(
            "OutputLimitExceeded",
            format!("worker report exceeded {} bytes", spec.report_cap()),
            wall_time_ms,
        );
    }

    let stderr_text = String::from_utf8_lossy(&stderr.data);
    let killed_by_memory = matches!(
        signal,
        Some(libc::SIGKILL) | Some(libc::SIGSEGV) | Some(libc::SIGABRT)
    );
    if killed_by_memory || stderr_text.contains("MemoryError") {
        warn!("Worker died without a report, treating as memory exhaustion (signal {signal:?})");
        return ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::Memory,
            limit: memory_limit,
            observed: memory_limit,
        };
    }

    let exit = match status {
        Some(status) => status.to_string(),
        None => "an unknown status".to_string(),
    };
    let tail = stderr_tail(&stderr_text);
    warn!("Worker exited with {exit} without a report");
    ExecutionOutcome::internal_failure(
        "WorkerCrashed",
        if tail.is_empty() {
            format!("worker exited with {exit} without a report")
        } else {
            format!("worker exited with {exit} without a report: {tail}")
        },
        wall_time_ms,
    )
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

fn stderr_tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::python3_available;
    use crate::policy::PolicyRegistry;
    use serde_json::json;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Arc;

    fn spec(timeout_secs: f64, memory_limit_mb: u64) -> WorkerSpec {
        WorkerSpec {
            python: "python3".to_string(),
            timeout: Duration::from_secs_f64(timeout_secs),
            memory_limit_mb,
            interpreter_overhead_mb: 256,
            max_output_bytes: 1024,
        }
    }

    fn standard() -> Arc<Whitelist> {
        PolicyRegistry::builtin().unwrap().resolve("default").unwrap()
    }

    fn captured(text: &str) -> CapturedStream {
        CapturedStream {
            data: text.as_bytes().to_vec(),
            overflowed: false,
        }
    }

    async fn run_worker(
        spec: WorkerSpec,
        source: &str,
        entry_point: &str,
        arguments: Vec<Value>,
        keyword_arguments: Map<String, Value>,
    ) -> ExecutionOutcome {
        let whitelist = standard();
        let payload = serde_json::to_vec(&WorkerPayload {
            source,
            entry_point,
            arguments: &arguments,
            keyword_arguments: &keyword_arguments,
            policy: &whitelist,
            memory_limit_mb: spec.memory_limit_mb,
            max_output_bytes: spec.max_output_bytes,
        })
        .unwrap();
        supervise(spec, payload).await
    }

    // ── classification ──────────────────────────────────

    #[test]
    fn test_classify_success_report() {
        let report = r#"{"status":"ok","return_value":[1,2],"stdout":"hi\n","stderr":"",
            "truncated":false,"peak_memory_mb":11.5}"#;
        let outcome = classify(
            &spec(1.0, 64),
            captured(report),
            CapturedStream::default(),
            Some(ExitStatus::from_raw(0)),
            42,
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                return_value: json!([1, 2]),
                stdout_capture: "hi\n".to_string(),
                stderr_capture: String::new(),
                wall_time_ms: 42,
                peak_memory_mb: 11.5,
                output_truncated: false,
            }
        );
    }

    #[test]
    fn test_classify_error_report() {
        let report = r#"{"status":"error","exception_kind":"KeyError","message":"'x'",
            "traceback":null,"stdout":"partial","stderr":"","truncated":false,"peak_memory_mb":10}"#;
        let outcome = classify(
            &spec(1.0, 64),
            captured(report),
            CapturedStream::default(),
            Some(ExitStatus::from_raw(0)),
            7,
        );
        match outcome {
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                message,
                stdout_capture,
                traceback,
                wall_time_ms,
            } => {
                assert_eq!(exception_kind, "KeyError");
                assert_eq!(message, "'x'");
                assert_eq!(stdout_capture, "partial");
                assert!(traceback.is_none());
                assert_eq!(wall_time_ms, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_memory_report_uses_peak() {
        let report = r#"{"status":"memory_exceeded","stdout":"","stderr":"","truncated":false,
            "peak_memory_mb":80.0}"#;
        let outcome = classify(
            &spec(1.0, 64),
            captured(report),
            CapturedStream::default(),
            Some(ExitStatus::from_raw(0)),
            7,
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::ResourceExceeded {
                kind: ResourceKind::Memory,
                limit: 64.0,
                observed: 80.0,
            }
        );
    }

    #[test]
    fn test_classify_sigkill_without_report_is_memory() {
        let outcome = classify(
            &spec(1.0, 32),
            CapturedStream::default(),
            CapturedStream::default(),
            Some(ExitStatus::from_raw(libc::SIGKILL)),
            7,
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::ResourceExceeded {
                kind: ResourceKind::Memory,
                limit: 32.0,
                observed: 32.0,
            }
        );
    }

    #[test]
    fn test_classify_memory_error_on_stderr() {
        let outcome = classify(
            &spec(1.0, 32),
            CapturedStream::default(),
            captured("Fatal Python error: MemoryError\n"),
            Some(ExitStatus::from_raw(256)),
            7,
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::ResourceExceeded {
                kind: ResourceKind::Memory,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_sigxcpu_is_timeout() {
        let outcome = classify(
            &spec(2.0, 64),
            CapturedStream::default(),
            CapturedStream::default(),
            Some(ExitStatus::from_raw(libc::SIGXCPU)),
            3000,
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::ResourceExceeded {
                kind: ResourceKind::Timeout,
                limit: 2.0,
                observed: 3.0,
            }
        );
    }

    #[test]
    fn test_classify_garbage_is_worker_crash() {
        let outcome = classify(
            &spec(1.0, 64),
            captured("not json"),
            captured("Traceback: something broke"),
            Some(ExitStatus::from_raw(256)),
            7,
        );
        match outcome {
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                message,
                ..
            } => {
                assert_eq!(exception_kind, "WorkerCrashed");
                assert!(message.contains("something broke"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_overflowed_report() {
        let outcome = classify(
            &spec(1.0, 64),
            CapturedStream {
                data: b"{\"status\":\"ok\",\"return_value\":\"xxxx".to_vec(),
                overflowed: true,
            },
            CapturedStream::default(),
            Some(ExitStatus::from_raw(0)),
            7,
        );
        match outcome {
            ExecutionOutcome::RuntimeFailure { exception_kind, .. } => {
                assert_eq!(exception_kind, "OutputLimitExceeded")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = format!("{}END", "x".repeat(1000));
        let tail = stderr_tail(&long);
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn test_limits_from_spec() {
        let limits = WorkerLimits::for_spec(&spec(1.5, 64));
        assert_eq!(limits.cpu_seconds, 3);
        assert_eq!(limits.address_space_bytes, 320 * 1024 * 1024);
    }

    // ── real worker ─────────────────────────────────────

    #[tokio::test]
    async fn test_worker_returns_value() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let outcome = run_worker(
            spec(5.0, 64),
            "def add(a, b):\n    return a + b\n",
            "add",
            vec![json!(2), json!(3)],
            Map::new(),
        )
        .await;
        match outcome {
            ExecutionOutcome::Success { return_value, .. } => assert_eq!(return_value, json!(5)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_reports_exception() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let outcome = run_worker(
            spec(5.0, 64),
            "def f():\n    return 1 / 0\n",
            "f",
            vec![],
            Map::new(),
        )
        .await;
        match outcome {
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                traceback,
                ..
            } => {
                assert_eq!(exception_kind, "ZeroDivisionError");
                assert!(traceback.unwrap().contains("<candidate>"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_infinite_loop_times_out() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let started = Instant::now();
        let outcome = run_worker(
            spec(1.0, 64),
            "def f():\n    while True:\n        pass\n",
            "f",
            vec![],
            Map::new(),
        )
        .await;
        match outcome {
            ExecutionOutcome::ResourceExceeded {
                kind,
                limit,
                observed,
            } => {
                assert_eq!(kind, ResourceKind::Timeout);
                assert_eq!(limit, 1.0);
                assert!(observed >= 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_worker_memory_blowup() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let outcome = run_worker(
            spec(10.0, 64),
            "def f():\n    return [0] * (200 * 1024 * 1024)\n",
            "f",
            vec![],
            Map::new(),
        )
        .await;
        match outcome {
            ExecutionOutcome::ResourceExceeded { kind, limit, .. } => {
                assert_eq!(kind, ResourceKind::Memory);
                assert_eq!(limit, 64.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_captures_print_and_truncates() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let outcome = run_worker(
            spec(5.0, 64),
            "def f():\n    print('hello')\n    print('x' * 5000)\n    return None\n",
            "f",
            vec![],
            Map::new(),
        )
        .await;
        match outcome {
            ExecutionOutcome::Success {
                return_value,
                stdout_capture,
                output_truncated,
                ..
            } => {
                assert_eq!(return_value, Value::Null);
                assert!(stdout_capture.starts_with("hello\n"));
                assert_eq!(stdout_capture.len(), 1024);
                assert!(output_truncated);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_keyword_arguments() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let mut kwargs = Map::new();
        kwargs.insert("name".to_string(), json!("Ada"));
        kwargs.insert("greeting".to_string(), json!("Hi"));
        let outcome = run_worker(
            spec(5.0, 64),
            "def greet(name, greeting='Hello'):\n    return f'{greeting}, {name}!'\n",
            "greet",
            vec![],
            kwargs,
        )
        .await;
        match outcome {
            ExecutionOutcome::Success { return_value, .. } => {
                assert_eq!(return_value, json!("Hi, Ada!"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_missing_entry_point() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let outcome = run_worker(spec(5.0, 64), "", "main", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                traceback,
                ..
            } => {
                assert_eq!(exception_kind, "EntryPointNotFound");
                assert!(traceback.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_converts_return_values() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let source = "def f():\n    return (1, 2 ** 70, {3: 'a'}, {2, 1}, float('inf'))\n";
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::Success { return_value, .. } => assert_eq!(
                return_value,
                json!([1, "1180591620717411303424", {"3": "a"}, [1, 2], "inf"])
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_guards_imports_at_runtime() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        // Skips the analyzer on purpose: the worker must refuse on its own.
        let source = "import os\ndef f():\n    return os.getcwd()\n";
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                message,
                ..
            } => {
                assert_eq!(exception_kind, "ImportError");
                assert!(message.contains("os"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_hides_private_module_attributes() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let source = "import random\ndef f():\n    return random._os\n";
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure { exception_kind, .. } => {
                assert_eq!(exception_kind, "AttributeError")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_refuses_formatter_field_lookup() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let source = r#"import string
def f():
    fmt = string.Formatter()
    ga = lambda o, n: fmt.get_field('0.' + n, [o], {})[0]
    base = ga(ga((), '__cl' + 'ass__'), '__ba' + 'se__')
    for c in ga(base, '__subcl' + 'asses__')():
        if c.__name__ == '_wrap_close':
            return ga(ga(c, '__init__'), '__glo' + 'bals__')['listdir']('/')
    return None
"#;
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure {
                exception_kind,
                message,
                ..
            } => {
                assert_eq!(exception_kind, "AttributeError");
                assert!(message.contains("Formatter"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_blocks_os_calls_reached_through_subclasses() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        for call in ["['listdir']('/')", "['system']('true')"] {
            let source = format!(
                "def f():\n    for c in ().__class__.__base__.__subclasses__():\n        if c.__name__ == '_wrap_close':\n            return c.__init__.__globals__{call}\n    return None\n"
            );
            let outcome = run_worker(spec(5.0, 64), &source, "f", vec![], Map::new()).await;
            match outcome {
                ExecutionOutcome::RuntimeFailure {
                    exception_kind,
                    message,
                    ..
                } => {
                    assert_eq!(exception_kind, "PermissionError");
                    assert!(message.contains("os."), "{message}");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_worker_blocks_forward_reference_evaluation() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let source = "import typing\ndef f():\n    ref = typing.Optional['__import__(\"os\").listdir(\"/\")'].__args__[0]\n    return ref._evaluate({}, {}, frozenset())\n";
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure { exception_kind, .. } => {
                assert_eq!(exception_kind, "PermissionError")
            }
            other => panic!("unexpected {other:?}"),
        }

        let source = "import typing\ndef f():\n    return typing.get_type_hints\n";
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure { exception_kind, .. } => {
                assert_eq!(exception_kind, "AttributeError")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_printing_repr_does_not_corrupt_report() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let source = r#"class Loud:
    def __repr__(self):
        print('repr called')
        return 'Loud()'

    def __del__(self):
        print('finalized')

kept = []

def f():
    kept.append(Loud())
    return kept[0]
"#;
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::Success {
                return_value,
                stdout_capture,
                ..
            } => {
                assert_eq!(return_value, json!("Loud()"));
                assert_eq!(stdout_capture, "repr called\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_runs_preloaded_stdlib_helpers() {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let source = r#"import datetime
import random
from collections import abc, namedtuple

Pair = namedtuple('Pair', 'a b')

def f():
    random.seed(7)
    day = datetime.datetime.strptime('2024-01-02', '%Y-%m-%d')
    return [day.year, Pair(1, 2).b, isinstance([], abc.Sequence), random.randint(1, 1)]
"#;
        let outcome = run_worker(spec(5.0, 64), source, "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::Success { return_value, .. } => {
                assert_eq!(return_value, json!([2024, 2, true, 1]))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_spawn_failure() {
        let mut bad = spec(5.0, 64);
        bad.python = "/nonexistent/python3".to_string();
        let outcome = run_worker(bad, "def f():\n    return 1\n", "f", vec![], Map::new()).await;
        match outcome {
            ExecutionOutcome::RuntimeFailure { exception_kind, .. } => {
                assert_eq!(exception_kind, "WorkerSpawnFailed")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
