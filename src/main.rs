use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use overseer::api::server::{ServerConfig, start_server};
use overseer::monitor::MonitorConfig;
use overseer::phases::PhaseRegistry;
use overseer::store::EngineDb;

#[derive(Parser)]
#[command(name = "overseer")]
#[command(version, about = "Task & phase orchestration engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: store, hooks, monitor loops, and the HTTP API
    Serve {
        #[arg(long, default_value = "4150")]
        port: u16,

        /// Path to the SQLite database
        #[arg(long, default_value = ".overseer/engine.db")]
        db: PathBuf,

        /// Phase definition TOML; the built-in pipeline if omitted
        #[arg(long)]
        phases: Option<PathBuf>,

        /// Guardian scan interval in seconds
        #[arg(long, default_value = "30")]
        guardian_interval: u64,

        /// Conductor scan interval in seconds
        #[arg(long, default_value = "300")]
        conductor_interval: u64,

        /// Seconds without a heartbeat before a worker counts as stale
        #[arg(long, default_value = "120")]
        staleness_threshold: u64,

        /// Seconds a nudged worker gets before the forced failure
        #[arg(long, default_value = "180")]
        nudge_grace: u64,

        /// Alert when more workers than this are active (0 = off)
        #[arg(long, default_value = "0")]
        max_workers: usize,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Print the loaded phase pipeline
    Phases {
        #[arg(long)]
        phases: Option<PathBuf>,
    },
    /// One-shot queue and ticket summary from a database file
    Status {
        #[arg(long, default_value = ".overseer/engine.db")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "overseer=debug" } else { "overseer=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            db,
            phases,
            guardian_interval,
            conductor_interval,
            staleness_threshold,
            nudge_grace,
            max_workers,
            dev,
        } => {
            let config = ServerConfig {
                port,
                db_path: db,
                phases_path: phases,
                monitor: MonitorConfig {
                    guardian_interval: Duration::from_secs(guardian_interval),
                    conductor_interval: Duration::from_secs(conductor_interval),
                    staleness_threshold: Duration::from_secs(staleness_threshold),
                    nudge_grace_period: Duration::from_secs(nudge_grace),
                    max_active_workers: max_workers,
                },
                dev_mode: dev,
            };
            start_server(config).await
        }
        Commands::Phases { phases } => {
            let registry = match phases {
                Some(path) => PhaseRegistry::load(&path)?,
                None => PhaseRegistry::default_pipeline(),
            };
            for def in registry.ordered() {
                let marker = if def.is_terminal { " (terminal)" } else { "" };
                println!("{:>2}. {}{}", def.sequence, def.id, marker);
                if !def.done_criteria.is_empty() {
                    println!("      criteria: {}", def.done_criteria.join(", "));
                }
                if !def.transitions.is_empty() {
                    println!("      -> {}", def.transitions.join(" | "));
                }
                for task in &def.initial_tasks {
                    println!("      spawns: {} [{}]", task.task_type, task.priority);
                }
            }
            Ok(())
        }
        Commands::Status { db } => {
            let db = EngineDb::new(&db)?;
            let counts = db.count_tasks_by_status()?;
            println!("Tasks:");
            if counts.is_empty() {
                println!("  (none)");
            }
            for (status, count) in &counts {
                println!("  {:<10} {}", status, count);
            }
            let tickets = db.active_tickets()?;
            println!("Active tickets: {}", tickets.len());
            for ticket in &tickets {
                println!("  {}  {}  [{}]", ticket.id, ticket.title, ticket.phase_id);
            }
            Ok(())
        }
    }
}
