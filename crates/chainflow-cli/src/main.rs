//! Chainflow CLI — run, validate and inspect agent chains.
//!
//! A thin front door over chainflow-core: chains come from YAML files (or
//! the SQLite store), agents from an agents YAML file.

mod agents;
mod commands;

use clap::{Parser, Subcommand};
use commands::run::RunOptions;

/// Chainflow — agent chain orchestration
#[derive(Parser)]
#[command(name = "chainflow", version, about = "Chainflow — agent chain orchestration")]
pub struct Cli {
    /// Path to the SQLite database file (chains and execution history)
    #[arg(long, env = "CHAINFLOW_DB_PATH", default_value = "chainflow.db")]
    db: String,

    /// Agents YAML file; without it every referenced agent is an echo agent
    #[arg(long, env = "CHAINFLOW_AGENTS")]
    agents: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a chain from a YAML file
    Run {
        /// Path to the chain YAML file
        file: String,
        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Validate a chain YAML file without executing it
    Validate {
        /// Path to the chain YAML file
        file: String,
    },

    /// Store a chain definition in the database
    Save {
        /// Path to the chain YAML file
        file: String,
    },

    /// Execute a stored chain by id
    Exec {
        /// Chain ID
        chain_id: String,
        #[command(flatten)]
        exec: ExecArgs,
    },

    /// List recorded executions of a chain
    History {
        /// Chain ID
        chain_id: String,
        /// Maximum number of executions to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print one execution record
    Show {
        /// Execution ID
        execution_id: String,
    },
}

#[derive(clap::Args)]
struct ExecArgs {
    /// The chain's initial input
    #[arg(long, short = 'i', default_value = "")]
    input: String,
    /// Initial context entries as key=value (value may be JSON)
    #[arg(long = "context", short = 'c')]
    context: Vec<String>,
    /// Override the chain's mode: sequential | parallel | conditional
    #[arg(long)]
    mode: Option<String>,
    /// Stream events as SSE frames instead of printing the final result
    #[arg(long)]
    stream: bool,
}

impl ExecArgs {
    fn options<'a>(&'a self, cli_agents: Option<&'a str>, db: &'a str) -> RunOptions<'a> {
        RunOptions {
            input: &self.input,
            context: &self.context,
            mode: self.mode.as_deref(),
            stream: self.stream,
            agents_file: cli_agents,
            db_path: db,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chainflow_core=warn,chainflow_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let agents = cli.agents.as_deref();
    let result = match &cli.command {
        Some(Commands::Run { file, exec }) => {
            commands::run::run(file, exec.options(agents, &cli.db)).await
        }
        Some(Commands::Validate { file }) => commands::validate::validate(file, agents).await,
        Some(Commands::Save { file }) => commands::history::save(file, &cli.db).await,
        Some(Commands::Exec { chain_id, exec }) => {
            commands::run::exec(chain_id, exec.options(agents, &cli.db)).await
        }
        Some(Commands::History { chain_id, limit }) => {
            commands::history::list(chain_id, &cli.db, *limit).await
        }
        Some(Commands::Show { execution_id }) => {
            commands::history::show(execution_id, &cli.db).await
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
