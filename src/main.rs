use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, warn};

use epic_driver::config::{store_path_from_env, ToolCommands, DEFAULT_MAX_ITERATIONS};
use epic_driver::epic::load_epic;
use epic_driver::error::{EXIT_CONFIG, EXIT_STORY_FAILED};
use epic_driver::logging::init_logging;
use epic_driver::store::{StateStore, StoreError};
use epic_driver::{Driver, DriverConfig, DriverError, RunReport};

#[derive(Parser, Debug)]
#[command(name = "epic-driver")]
#[command(about = "Drive the stories of an epic through implementation, quality gates, tests and QA", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the epic document
    epic: PathBuf,

    /// Source directory checked by the quality gate
    #[arg(long, default_value = "src")]
    source_dir: PathBuf,

    /// Test root scanned for test batches
    #[arg(long, default_value = "tests")]
    test_dir: PathBuf,

    /// Skip the QUALITY phase
    #[arg(long)]
    skip_quality: bool,

    /// Skip the TEST_AUTO phase
    #[arg(long)]
    skip_tests: bool,

    /// Return to IMPL when a verification phase fails (default)
    #[arg(long, overrides_with = "no_retry")]
    retry: bool,

    /// Fail a story on its first failed verification phase
    #[arg(long, overrides_with = "retry")]
    no_retry: bool,

    /// Iteration budget per story
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// Debug logging for the driver
    #[arg(short, long)]
    verbose: bool,

    /// Stop after the first failed story
    #[arg(long)]
    halt_on_failure: bool,

    /// Shell command that generates code for a story (prompt on stdin)
    #[arg(long, value_name = "COMMAND")]
    agent_command: Option<String>,

    /// Type checker executable
    #[arg(long, value_name = "PROGRAM")]
    type_checker: Option<String>,

    /// Linter executable
    #[arg(long, value_name = "PROGRAM")]
    linter: Option<String>,

    /// Test runner executable
    #[arg(long, value_name = "PROGRAM")]
    test_runner: Option<String>,

    /// Python interpreter used for compile validation
    #[arg(long, value_name = "PROGRAM")]
    python: Option<String>,

    /// Accept a failing QA gate as WAIVED, recording this reason
    #[arg(long, value_name = "REASON")]
    waive_qa: Option<String>,

    /// Skip compile and focused-test validation after implementation
    #[arg(long)]
    skip_validation: bool,
}

impl Cli {
    fn into_config(self) -> DriverConfig {
        let defaults = ToolCommands::default();
        let tools = ToolCommands {
            type_checker: self.type_checker.unwrap_or(defaults.type_checker),
            linter: self.linter.unwrap_or(defaults.linter),
            test_runner: self.test_runner.unwrap_or(defaults.test_runner),
            python: self.python.unwrap_or(defaults.python),
        };

        let mut config = DriverConfig::new(self.epic)
            .with_source_dir(self.source_dir)
            .with_test_dir(self.test_dir)
            .with_store_path(store_path_from_env())
            .with_skip_quality(self.skip_quality)
            .with_skip_tests(self.skip_tests)
            .with_retry(self.retry || !self.no_retry)
            .with_max_iterations(self.max_iterations)
            .with_verbose(self.verbose)
            .with_halt_on_failure(self.halt_on_failure)
            .with_validate(!self.skip_validation)
            .with_tools(tools);
        if let Some(command) = self.agent_command {
            config = config.with_agent_command(command);
        }
        if let Some(reason) = self.waive_qa {
            config = config.with_waiver(reason);
        }
        config
    }
}

async fn open_store(config: &DriverConfig) -> Result<StateStore, DriverError> {
    let path = config.store_path.clone();
    let backup_dir = config.backup_dir();
    let store = tokio::task::spawn_blocking(move || StateStore::open(path, backup_dir))
        .await
        .map_err(|err| DriverError::Startup(StoreError::Task(err.to_string())))?
        .map_err(DriverError::Startup)?;
    Ok(store.with_lock_timeout(config.timeouts.store_lock_timeout))
}

async fn drive(config: DriverConfig) -> Result<RunReport, DriverError> {
    config.validate()?;
    let epic = load_epic(&config.epic_path)?;
    let store = open_store(&config).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next step");
            let _ = cancel_tx.send(true);
        }
    });

    let driver = Driver::standard(config, store).with_cancellation(cancel_rx);
    Ok(driver.run(&epic).await)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let code = match runtime.block_on(drive(cli.into_config())) {
        Ok(report) => {
            print!("{}", report.render(std::io::stdout().is_terminal()));
            report.exit_code()
        }
        Err(err) => {
            error!(error = %err, "driver aborted");
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_STORY_FAILED as u8))
}
