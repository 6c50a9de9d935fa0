mod cli;
mod oauth_flow;
mod state;
mod sync_run;
mod vault;

use clap::Parser;
use cli::{Cli, Command, DedupeAction};
use state::AppState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let state = Arc::new(AppState::initialize().await.expect("failed to initialize calsync app state"));

    match cli.command {
        Command::Authenticate => oauth_flow::authenticate(state).await?,
        Command::Revoke => oauth_flow::revoke(state).await?,
        Command::SyncNow { vault } => {
            let counters = sync_run::run_sync(state, &vault).await?;
            print_counters(&counters);
        }
        Command::ForceResetSync => {
            sync_run::force_reset_sync(state).await?;
            println!("Cleared IdMap and lastSyncTime. Credentials were left untouched.");
        }
        Command::Dedupe { action } => {
            let dry_run = matches!(action, DedupeAction::DryRun);
            let counters = sync_run::dedupe(state, dry_run).await?;
            if !dry_run {
                print_counters(&counters);
            }
        }
        Command::Daemon { vault } => sync_run::run_daemon(state, vault).await?,
    }

    Ok(())
}

fn print_counters(counters: &calsync_core::SyncCounters) {
    println!(
        "created={} updated={} deleted={} skipped={} errors={} auth_errors={}",
        counters.created, counters.updated, counters.deleted, counters.skipped, counters.errors, counters.auth_errors
    );
}
