use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{EngineConfig, StorageBackend};
use crate::interpreter::{
    Engine, MockAiProvider, Program, Providers, RunRequest, StaticToolRunner, TracingObserver, Val,
};
use crate::storage::{self, Filter};

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(about = "Flowgate - deterministic flow execution engine", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a flow from a lowered program and print the execution result
    Run {
        /// Lowered program (JSON)
        #[arg(short = 'p', long = "program")]
        program: PathBuf,

        /// Flow to run
        #[arg(short = 'f', long = "flow")]
        flow: String,

        /// Flow input (JSON object)
        #[arg(long, default_value = "{}")]
        input: String,

        /// Caller identity (JSON object)
        #[arg(long, default_value = "{}")]
        identity: String,

        /// Storage backend
        #[arg(long, value_enum)]
        backend: Option<StorageBackend>,

        /// Directory for last_execution.json
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },

    /// Show how a where clause would be planned for a record
    Plan {
        /// Lowered program (JSON)
        #[arg(short = 'p', long = "program")]
        program: PathBuf,

        /// Record name
        #[arg(short = 'r', long = "record")]
        record: String,

        /// Filter (JSON)
        #[arg(long = "where")]
        filter: String,
    },

    /// Print the effective configuration
    Config,
}

/// Run the CLI by parsing process arguments
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli)
}

/// Run the CLI with provided arguments
pub fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli)
}

fn load_program(path: &Path) -> Result<Program> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read program {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid program {}", path.display()))
}

fn parse_json(label: &str, raw: &str) -> Result<Val> {
    serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", label))
}

fn run_cli_with_args(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            program,
            flow,
            input,
            identity,
            backend,
            artifacts_dir,
        } => {
            let config = EngineConfig::builder()
                .config_path(cli.config)
                .database_url(cli.database_url)
                .backend(backend)
                .artifacts_dir(artifacts_dir)
                .build()?;
            let program = load_program(&program)?;
            let request = RunRequest::new(flow)
                .input(parse_json("input", &input)?)
                .identity(parse_json("identity", &identity)?);

            let mut store = storage::open(&config.storage).context("Failed to open storage")?;
            let mut tools = StaticToolRunner::new();
            let mut ai = MockAiProvider::new();
            let mut observer = TracingObserver;
            let providers = Providers {
                tools: &mut tools,
                ai: &mut ai,
                observer: &mut observer,
            };

            let engine = Engine::new(program, config);
            match engine.run(store.as_mut(), providers, request) {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(failure) => {
                    println!("{}", serde_json::to_string_pretty(&failure)?);
                    return Err(failure.into());
                }
            }
        }

        Commands::Plan {
            program,
            record,
            filter,
        } => {
            let program = load_program(&program)?;
            let schema = program
                .record(&record)
                .with_context(|| format!("Unknown record '{}'", record))?;
            let filter: Filter = serde_json::from_str(&filter).context("--where is not a valid filter")?;
            let plan = storage::plan(schema, &filter)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }

        Commands::Config => {
            let config = EngineConfig::builder()
                .config_path(cli.config)
                .database_url(cli.database_url)
                .build()?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
