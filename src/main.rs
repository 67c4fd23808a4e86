use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use funcbox::cli::{self, Command};
use funcbox::testing::{self, FunctionUnderTest};
use funcbox::{Config, ExecutionCoordinator};

fn print_help() {
    println!(
        "\
funcbox v{}

Runs user- or LLM-authored Python functions behind static analysis and a
resource-bounded worker process. Results are printed to stdout as JSON.

USAGE:
    funcbox [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    run SOURCE_FILE ENTRY_POINT [ARG_JSON]...
                       Execute a function. Each ARG_JSON is a positional
                       argument (plain words are passed as strings)
    run --request FILE Execute a JSON submission document ('-' for stdin)
    analyze SOURCE_FILE
                       Static analysis only
    test SOURCE_FILE ENTRY_POINT CASES_FILE
                       Run a JSON list of test cases against a function
    policies           List the available policies and aliases

OPTIONS:
    -c, --config PATH      Configuration file [default: config/funcbox.toml if present]
    --policy NAME          Policy to analyze and run under [default: from config]
    --timeout SECS         Wall-clock limit for run
    --memory MB            Memory limit for run
    --kwargs JSON          Keyword arguments for run, as a JSON object
    --concurrency N        Test cases run at once [default: {}]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

EXIT STATUS:
    0 on success (or a safe analysis, or all tests passing), 1 otherwise,
    2 on usage or configuration errors.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                       Log level filter for tracing (logs go to stderr)
                                   (e.g. debug, funcbox=debug,warn)
    FUNCBOX_SANDBOX_ENABLED        Override [sandbox] enabled
    FUNCBOX_DEFAULT_TIMEOUT_SECS   Override [sandbox] default_timeout_secs
    FUNCBOX_DEFAULT_MEMORY_MB      Override [sandbox] default_memory_limit_mb
    FUNCBOX_PYTHON                 Override [worker] python

EXAMPLES:
    funcbox run add.py add 2 3
    funcbox run greet.py greet --kwargs '{{\"name\": \"Ada\"}}'
    echo '{{\"source\": \"def f(): return 1\", \"entry_point\": \"f\"}}' | funcbox run --request -
    funcbox --config /etc/funcbox.toml test sort.py sort_numbers cases.json",
        env!("CARGO_PKG_VERSION"),
        cli::DEFAULT_TEST_CONCURRENCY,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match cli::parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}\nTry 'funcbox --help' for more information.");
            std::process::exit(2);
        }
    };

    match cli.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("funcbox v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("funcbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load_or_default(cli.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };
    info!(
        "Sandbox {} (default policy {}, {}s, {}MB, interpreter {})",
        if config.sandbox.enabled { "enabled" } else { "disabled" },
        config.sandbox.default_policy,
        config.sandbox.default_timeout_secs,
        config.sandbox.default_memory_limit_mb,
        config.worker.python
    );

    let coordinator = match ExecutionCoordinator::from_config(&config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let ok = match run_command(&coordinator, cli.command).await {
        Ok(ok) => ok,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Runs one subcommand, printing its JSON result. Returns whether the
/// result counts as a success for the exit status.
async fn run_command(coordinator: &ExecutionCoordinator, command: Command) -> Result<bool> {
    match command {
        Command::Run(args) => {
            let submission = args.into_submission()?;
            let outcome = coordinator.execute(submission).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(outcome.is_success())
        }
        Command::Analyze {
            source_file,
            policy,
        } => {
            let source = cli::read_input(&source_file)?;
            let report = coordinator.analyze(&source, policy.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.is_safe)
        }
        Command::Test(args) => {
            let source = cli::read_input(&args.source_file)?;
            let cases = cli::load_test_cases(&args.cases_file)
                .with_context(|| format!("cannot load test cases from {}", args.cases_file))?;
            let mut function = FunctionUnderTest::new(source, args.entry_point);
            function.policy_name = args.policy;
            let summary =
                testing::run_test_suite(coordinator, &function, &cases, args.concurrency).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(summary.failed == 0)
        }
        Command::Policies => {
            let registry = coordinator.registry();
            let mut listing = serde_json::Map::new();
            for name in registry.names() {
                let whitelist = registry.resolve(&name)?;
                listing.insert(
                    name,
                    serde_json::json!({
                        "version": whitelist.version(),
                        "description": whitelist.description(),
                        "modules": whitelist.modules().map(|(m, _)| m).collect::<Vec<_>>(),
                    }),
                );
            }
            let aliases: serde_json::Map<String, serde_json::Value> = registry
                .aliases()
                .into_iter()
                .map(|(alias, target)| (alias, serde_json::Value::String(target)))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "policies": listing,
                    "aliases": aliases,
                }))?
            );
            Ok(true)
        }
        Command::Help | Command::Version => Ok(true),
    }
}
