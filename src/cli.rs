//! Command-line parsing for the `funcbox` binary.

use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};

use crate::coordinator::ExecutionSubmission;
use crate::testing::TestCase;

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub config_path: Option<String>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Version,
    Run(RunArgs),
    Analyze {
        source_file: String,
        policy: Option<String>,
    },
    Test(TestArgs),
    Policies,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunInput {
    /// JSON submission document; `-` reads stdin.
    Request(String),
    Inline {
        source_file: String,
        entry_point: String,
        arguments: Vec<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunArgs {
    pub input: RunInput,
    pub policy: Option<String>,
    pub timeout_seconds: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    pub keyword_arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestArgs {
    pub source_file: String,
    pub entry_point: String,
    pub cases_file: String,
    pub policy: Option<String>,
    pub concurrency: usize,
}

/// Default number of test cases run at once.
pub const DEFAULT_TEST_CONCURRENCY: usize = 4;

/// Parses arguments (without the program name).
pub fn parse_args<I, S>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::<String>::into);
    let mut config_path = None;

    // Global options come before the subcommand.
    let subcommand = loop {
        let Some(arg) = args.next() else {
            return Ok(Cli {
                config_path,
                command: Command::Help,
            });
        };
        match arg.as_str() {
            "-h" | "--help" => {
                return Ok(Cli {
                    config_path,
                    command: Command::Help,
                })
            }
            "-V" | "--version" => {
                return Ok(Cli {
                    config_path,
                    command: Command::Version,
                })
            }
            "-c" | "--config" => config_path = Some(value_for(&arg, args.next())?),
            _ => break arg,
        }
    };

    let rest: Vec<String> = args.collect();
    if rest.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Cli {
            config_path,
            command: Command::Help,
        });
    }
    let command = match subcommand.as_str() {
        "run" => Command::Run(parse_run(rest)?),
        "analyze" => {
            let mut flags = Flags::parse(rest, &["--policy"])?;
            let source_file = flags.single_positional("analyze", "SOURCE_FILE")?;
            Command::Analyze {
                source_file,
                policy: flags.take("--policy"),
            }
        }
        "test" => Command::Test(parse_test(rest)?),
        "policies" => {
            let flags = Flags::parse(rest, &[])?;
            if !flags.positional.is_empty() {
                bail!("policies takes no arguments");
            }
            Command::Policies
        }
        other => bail!("unknown command '{other}' (expected run, analyze, test or policies)"),
    };
    Ok(Cli {
        config_path,
        command,
    })
}

fn parse_run(rest: Vec<String>) -> Result<RunArgs> {
    let mut flags = Flags::parse(
        rest,
        &["--request", "--policy", "--timeout", "--memory", "--kwargs"],
    )?;
    let input = match flags.take("--request") {
        Some(path) => {
            if !flags.positional.is_empty() {
                bail!("run: --request cannot be combined with SOURCE_FILE ENTRY_POINT");
            }
            RunInput::Request(path)
        }
        None => {
            let mut positional = std::mem::take(&mut flags.positional).into_iter();
            let (Some(source_file), Some(entry_point)) = (positional.next(), positional.next())
            else {
                bail!("run: expected --request FILE or SOURCE_FILE ENTRY_POINT [ARG_JSON]...");
            };
            RunInput::Inline {
                source_file,
                entry_point,
                arguments: positional.map(|a| parse_argument(&a)).collect(),
            }
        }
    };

    let timeout_seconds = flags
        .take("--timeout")
        .map(|v| v.parse::<f64>().with_context(|| format!("--timeout: invalid number '{v}'")))
        .transpose()?;
    let memory_limit_mb = flags
        .take("--memory")
        .map(|v| v.parse::<u64>().with_context(|| format!("--memory: invalid number '{v}'")))
        .transpose()?;
    let keyword_arguments = flags
        .take("--kwargs")
        .map(|v| match serde_json::from_str::<Value>(&v) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(anyhow!("--kwargs: expected a JSON object, got '{v}'")),
        })
        .transpose()?;

    Ok(RunArgs {
        input,
        policy: flags.take("--policy"),
        timeout_seconds,
        memory_limit_mb,
        keyword_arguments,
    })
}

fn parse_test(rest: Vec<String>) -> Result<TestArgs> {
    let mut flags = Flags::parse(rest, &["--policy", "--concurrency"])?;
    let [source_file, entry_point, cases_file]: [String; 3] = std::mem::take(&mut flags.positional)
        .try_into()
        .map_err(|_| anyhow!("test: expected SOURCE_FILE ENTRY_POINT CASES_FILE"))?;
    let concurrency = match flags.take("--concurrency") {
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => bail!("--concurrency: expected a positive integer, got '{v}'"),
        },
        None => DEFAULT_TEST_CONCURRENCY,
    };
    Ok(TestArgs {
        source_file,
        entry_point,
        cases_file,
        policy: flags.take("--policy"),
        concurrency,
    })
}

/// Positional arguments are JSON; anything that does not parse is a string.
fn parse_argument(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn value_for(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| anyhow!("{flag} requires a value"))
}

/// `--flag value` pairs plus the positionals left over.
struct Flags {
    values: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Flags {
    fn parse(args: Vec<String>, known: &[&str]) -> Result<Self> {
        let mut values = Vec::new();
        let mut positional = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg.starts_with("--") {
                if !known.contains(&arg.as_str()) {
                    bail!("unknown option '{arg}'");
                }
                let value = value_for(&arg, args.next())?;
                values.push((arg, value));
            } else {
                positional.push(arg);
            }
        }
        Ok(Self { values, positional })
    }

    /// Last value given for `flag`.
    fn take(&mut self, flag: &str) -> Option<String> {
        let index = self.values.iter().rposition(|(f, _)| f == flag)?;
        Some(self.values.remove(index).1)
    }

    fn single_positional(&mut self, command: &str, name: &str) -> Result<String> {
        match std::mem::take(&mut self.positional).as_slice() {
            [one] => Ok(one.clone()),
            _ => bail!("{command}: expected exactly one {name}"),
        }
    }
}

// ── input loading ───────────────────────────────────────

/// Reads a file, or stdin for `-`.
pub fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("cannot read stdin")?;
        return Ok(content);
    }
    std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))
}

impl RunArgs {
    /// Builds the submission, with command-line flags taking precedence
    /// over a request document.
    pub fn into_submission(self) -> Result<ExecutionSubmission> {
        let mut submission = match self.input {
            RunInput::Request(path) => {
                let document = read_input(&path)?;
                serde_json::from_str::<ExecutionSubmission>(&document)
                    .with_context(|| format!("{path}: invalid execution request"))?
            }
            RunInput::Inline {
                source_file,
                entry_point,
                arguments,
            } => ExecutionSubmission::new(read_input(&source_file)?, entry_point)
                .with_arguments(arguments),
        };
        if let Some(policy) = self.policy {
            submission.policy_name = Some(policy);
        }
        if let Some(timeout) = self.timeout_seconds {
            submission.timeout_seconds = Some(timeout);
        }
        if let Some(memory) = self.memory_limit_mb {
            submission.memory_limit_mb = Some(memory);
        }
        if let Some(kwargs) = self.keyword_arguments {
            submission.keyword_arguments = kwargs;
        }
        Ok(submission)
    }
}

/// Loads test cases: a JSON array of cases, or `{"test_cases": [...]}`.
pub fn load_test_cases(path: &str) -> Result<Vec<TestCase>> {
    let document = read_input(path)?;
    let value: Value =
        serde_json::from_str(&document).with_context(|| format!("{path}: invalid JSON"))?;
    let cases = match value {
        Value::Object(mut map) if map.contains_key("test_cases") => {
            map.remove("test_cases").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(cases).with_context(|| format!("{path}: invalid test cases"))
}
