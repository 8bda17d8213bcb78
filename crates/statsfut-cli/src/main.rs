use anyhow::Result;
use clap::{Parser, Subcommand};
use statsfut_sync::UpdateMode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "statsfut")]
#[command(about = "StatsFut match maintenance and smart live updates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Remove duplicate matches (same date, home and away team).
    Dedup {
        /// Report what would be removed without deleting anything.
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the adaptive update loop until Ctrl-C.
    Poll {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
    /// Run the external update routine once.
    Update {
        #[arg(long, default_value = "live")]
        mode: UpdateMode,
    },
    /// Create the matches table when the web app does not manage it.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Poll { once: false }) {
        Commands::Dedup { dry_run, json } => {
            let report = statsfut_sync::run_dedup_from_env(dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let verb = if report.dry_run { "would remove" } else { "removed" };
                println!(
                    "found {} duplicate groups; {} {} duplicate matches",
                    report.groups_found, verb, report.records_deleted
                );
            }
        }
        Commands::Poll { once } => {
            if let Some(outcome) = statsfut_sync::run_poller_from_env(once).await? {
                println!(
                    "cycle complete: mode={} full_sync={} live_update={} next_in={}s",
                    outcome.mode.label(),
                    outcome.full_sync_attempted,
                    outcome.live_update_attempted,
                    outcome.sleep_for.as_secs()
                );
            }
        }
        Commands::Update { mode } => {
            statsfut_sync::run_update_from_env(mode).await?;
            println!("{mode} update complete");
        }
        Commands::Migrate => {
            statsfut_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
