use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// One-way reconciling sync between a local markdown task vault and a
/// remote calendar, standing in for the excluded host UI (SPEC_FULL.md §6).
#[derive(Debug, Parser)]
#[command(name = "calsync", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the PKCE authorization-code flow and store the refresh token.
    Authenticate,
    /// Revoke the stored refresh token and clear local credential state.
    Revoke,
    /// Run one reconciliation pass against the given vault directory.
    SyncNow {
        #[arg(long)]
        vault: PathBuf,
    },
    /// Clear the persisted IdMap and lastSyncTime without touching credentials.
    ForceResetSync,
    /// Orphan-sweep maintenance: remove plugin-owned events with no valid task mapping.
    Dedupe {
        #[command(subcommand)]
        action: DedupeAction,
    },
    /// Run the periodic scheduler in the foreground (spec.md §4.9): ticks
    /// every `syncIntervalMinutes`, re-entrancy-guarded against overlap with
    /// itself and with a concurrent `sync-now`.
    Daemon {
        #[arg(long)]
        vault: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum DedupeAction {
    /// Report what would be deleted without making any changes.
    DryRun,
    /// Execute the orphan sweep.
    Exec,
}
