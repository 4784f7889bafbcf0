use anyhow::Context;
use clap::{Parser, Subcommand};
use conveyor_harness::{config, services};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conveyor-harness")]
#[command(about = "Conveyor durable messaging harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Idempotently create every Conveyor table and index on each store.
    EnsureSchema,

    /// Run the multi-store outbox dispatcher until ctrl-c.
    OutboxDispatcher,

    /// Run the multi-store inbox dispatcher until ctrl-c.
    InboxDispatcher,

    /// Run cron materialization plus timer/job-run dispatch until ctrl-c.
    Scheduler,

    /// Run one fan-out pass for a topic.
    Fanout {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        work_key: Option<String>,
    },

    /// Run the retention cleanup service until ctrl-c.
    Cleanup,

    /// Print per-store queue depths.
    Status,

    /// Enqueue a single outbox message on the primary store.
    Enqueue {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::HarnessConfig::from_env().context("load harness config")?;

    match cli.command {
        Command::EnsureSchema => services::ensure_schema(&cfg).await,
        Command::OutboxDispatcher => services::run_outbox_dispatcher(&cfg).await,
        Command::InboxDispatcher => services::run_inbox_dispatcher(&cfg).await,
        Command::Scheduler => services::run_scheduler(&cfg).await,
        Command::Fanout { topic, work_key } => {
            services::run_fanout(&cfg, &topic, work_key.as_deref()).await
        }
        Command::Cleanup => services::run_cleanup(&cfg).await,
        Command::Status => services::print_status(&cfg).await,
        Command::Enqueue { topic, payload } => services::enqueue(&cfg, &topic, &payload).await,
    }
}
