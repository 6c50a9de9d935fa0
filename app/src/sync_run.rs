use crate::state::AppState;
use crate::vault;
use anyhow::{Context, Result};
use calsync_calendar::{apply_results, execute_all, fetch_plugin_owned_events, plan};
use calsync_core::{BatchOp, OperationType, SyncCounters};
use calsync_parser::{rrule_lines, DescriptionSettings};
use calsync_scheduler::Scheduler;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// One full reconciliation run (spec.md §4 end to end, SPEC_FULL.md §7):
/// parse the vault, fetch the remote event set, plan, execute, apply
/// results, and persist the updated `IdMap`/`lastSyncTime`.
pub async fn run_sync(state: Arc<AppState>, vault_root: &Path) -> Result<SyncCounters> {
    let tasks = vault::scan_vault(vault_root).await.context("scan vault for tasks")?;
    run_reconciliation(state, tasks).await
}

/// Orphan-sweep-only maintenance pass (SPEC_FULL.md §8 `dedupe`): reuses
/// the planner with an empty task list, but only acts on the ops the
/// orphan sweep produces (`task_id.is_none()`) — ops that would delete a
/// real `IdMap` entry just because no local tasks were supplied are
/// discarded rather than executed.
pub async fn dedupe(state: Arc<AppState>, dry_run: bool) -> Result<SyncCounters> {
    let access_token = state.ensure_access_token().await?;
    let settings = state.settings().await;

    let remote_events = fetch_plugin_owned_events(&state.http, &access_token, &settings.calendar_id)
        .await
        .context("fetch remote events")?;
    let id_map = state.storage.load_id_map().await?;

    let plan_result = plan(&[], &remote_events, &id_map, recurrence_for_event, &description_settings(&settings));
    let orphan_ops: Vec<BatchOp> = plan_result
        .ops
        .into_iter()
        .filter(|op| op.operation_type == OperationType::Delete && op.task_id.is_none())
        .collect();

    if dry_run {
        println!("{} orphan event(s) would be deleted:", orphan_ops.len());
        for op in &orphan_ops {
            println!("  {}", op.path);
        }
        return Ok(SyncCounters::default());
    }

    if orphan_ops.is_empty() {
        return Ok(SyncCounters::default());
    }

    let mut id_map = id_map;
    let state_for_token = state.clone();
    let (ops, results) = execute_all(
        state.http.clone(),
        settings.calendar_id.clone(),
        orphan_ops,
        settings.executor.clone(),
        move || {
            let state = state_for_token.clone();
            async move { state.ensure_access_token().await.map_err(Into::into) }
        },
        Arc::new(AtomicBool::new(false)),
    )
    .await;

    let counters = apply_results(&ops, &results, &mut id_map);
    state.storage.save_id_map(&id_map).await?;
    Ok(counters)
}

/// `calsync daemon` (spec.md §4.9): runs the periodic sync trigger in the
/// foreground. The scheduler drops any tick that lands while a run is
/// already in progress; `sync-now` run concurrently against the same
/// process would share this guard too, but each CLI invocation is its own
/// process, so here the guard only ever serializes the ticker against
/// itself. Blocks until interrupted (Ctrl-C).
pub async fn run_daemon(state: Arc<AppState>, vault_root: PathBuf) -> Result<()> {
    let settings = state.settings().await;
    if !settings.auto_sync {
        println!("auto_sync is disabled in settings; nothing to do.");
        return Ok(());
    }

    let scheduler = Scheduler::new();
    let handle = scheduler.spawn_periodic(settings.sync_interval_minutes, move || {
        let state = state.clone();
        let vault_root = vault_root.clone();
        async move {
            match run_sync(state, &vault_root).await {
                Ok(counters) => tracing::info!(
                    created = counters.created,
                    updated = counters.updated,
                    deleted = counters.deleted,
                    skipped = counters.skipped,
                    errors = counters.errors,
                    auth_errors = counters.auth_errors,
                    "scheduled sync finished"
                ),
                Err(err) => tracing::error!(error = %err, "scheduled sync failed"),
            }
        }
    });

    println!(
        "calsync daemon running; syncing every {} minute(s). Press Ctrl-C to stop.",
        settings.sync_interval_minutes.max(1)
    );

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    handle.abort();
    Ok(())
}

/// `force-reset-sync` (spec.md §6): clears the `IdMap` and `lastSyncTime`
/// without touching stored credentials, so the next run treats every
/// plugin-owned remote event as unmapped.
pub async fn force_reset_sync(state: Arc<AppState>) -> Result<()> {
    state.storage.clear_id_map().await?;
    state.storage.clear_last_sync_time().await?;
    Ok(())
}

async fn run_reconciliation(state: Arc<AppState>, tasks: Vec<calsync_core::Task>) -> Result<SyncCounters> {
    let access_token = state.ensure_access_token().await?;
    let settings = state.settings().await;

    let remote_events = fetch_plugin_owned_events(&state.http, &access_token, &settings.calendar_id)
        .await
        .context("fetch remote events")?;
    let mut id_map = state.storage.load_id_map().await?;

    let plan_result = plan(
        &tasks,
        &remote_events,
        &id_map,
        recurrence_for_event,
        &description_settings(&settings),
    );

    let state_for_token = state.clone();
    let (ops, results) = execute_all(
        state.http.clone(),
        settings.calendar_id.clone(),
        plan_result.ops,
        settings.executor.clone(),
        move || {
            let state = state_for_token.clone();
            async move { state.ensure_access_token().await.map_err(Into::into) }
        },
        Arc::new(AtomicBool::new(false)),
    )
    .await;

    let counters = apply_results(&ops, &results, &mut id_map);

    state.storage.save_id_map(&id_map).await?;
    state.storage.save_last_sync_time(Utc::now()).await?;

    Ok(counters)
}

fn recurrence_for_event(task: &calsync_core::Task) -> Vec<String> {
    task.recurrence_rule
        .as_deref()
        .map(rrule_lines)
        .unwrap_or_default()
}

fn description_settings(settings: &calsync_core::Settings) -> DescriptionSettings {
    DescriptionSettings {
        vault_name: String::new(),
        include_metadata: settings.include_description_metadata,
        default_duration_minutes: settings.default_duration_minutes,
    }
}
