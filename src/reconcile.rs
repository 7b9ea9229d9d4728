use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{nearest_open_slot, now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability;

/// A blackout landed on existing appointments; resolve them off the hot
/// path. Best-effort and logged — never silently dropped, never inline
/// with the blackout write.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileTask {
    /// `None` for tenant-wide blackouts.
    pub resource_id: Option<Ulid>,
    pub blackout_id: Ulid,
}

enum Resolution {
    Move,
    Flag,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task: drains reconcile requests and periodically sweeps for
/// anything a dropped request missed.
pub async fn run_reconciler(engine: Arc<Engine>) {
    let Some(mut rx) = engine.take_reconcile_rx() else {
        warn!("reconciler already running for this engine");
        return;
    };
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            task = rx.recv() => {
                match task {
                    Some(task) => {
                        metrics::counter!(observability::RECONCILE_RUNS_TOTAL).increment(1);
                        reconcile_resources(&engine, task.resource_id).await;
                    }
                    None => {
                        info!("reconcile channel closed, reconciler stopping");
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                reconcile_resources(&engine, None).await;
            }
        }
    }
}

/// Background task that compacts the journal once enough churn accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_journal().await {
                Ok(()) => info!("journal compacted after {appends} appends"),
                Err(e) => warn!("journal compaction failed: {e}"),
            }
        }
    }
}

async fn reconcile_resources(engine: &Engine, resource_id: Option<Ulid>) {
    let targets: Vec<Ulid> = match resource_id {
        Some(rid) => vec![rid],
        None => engine.resource_ids(),
    };
    for rid in targets {
        reconcile_resource(engine, rid).await;
    }
}

/// One pass over a resource: find future active appointments sitting inside
/// blackout time and either move them to the nearest open slot or flag them
/// for manual review.
async fn reconcile_resource(engine: &Engine, resource_id: Ulid) {
    let Some(rs) = engine.get_resource(&resource_id) else {
        return;
    };
    let globals = engine.globals_snapshot();
    let holidays = engine.current_holidays();
    let now = now_ms();

    // Collect under the read guard, act after dropping it — the moves
    // re-acquire locks through the normal reservation path.
    let mut pending: Vec<(Ulid, Result<Resolution, EngineError>, Ms, Ms)> = Vec::new();
    {
        let guard = rs.read().await;
        for appt in &guard.appointments {
            if !appt.status.is_active() || appt.needs_review || appt.span.start < now {
                continue;
            }
            let covering: Vec<&BlackoutInterval> = guard
                .blackouts
                .iter()
                .chain(globals.iter())
                .filter(|b| crate::engine::blackout_hits(guard.tz, b, &appt.span))
                .collect();
            if covering.is_empty() {
                continue;
            }
            let resolution = if covering.iter().all(|b| b.auto_reschedule) {
                Ok(Resolution::Move)
            } else if covering.iter().all(|b| !b.auto_reschedule) {
                Ok(Resolution::Flag)
            } else {
                // Most-restrictive wins: contradictory policies resolve to
                // manual review, surfaced as its own error for the log.
                Err(EngineError::BlackoutOverlapUnresolved(appt.id))
            };
            pending.push((
                appt.id,
                resolution,
                appt.span.start,
                appt.span.duration_ms(),
            ));
        }
    }

    for (appt_id, resolution, start, duration) in pending {
        match resolution {
            Ok(Resolution::Move) => {
                let found = {
                    let guard = rs.read().await;
                    nearest_open_slot(
                        &guard,
                        &globals,
                        start,
                        duration,
                        engine.config.search_window_days,
                        engine.config.search_granularity_min,
                        &holidays,
                        false,
                        Some(appt_id),
                    )
                };
                match found {
                    Some(new_start) => {
                        match engine
                            .reschedule_appointment(appt_id, new_start, &holidays, false)
                            .await
                        {
                            Ok(_) => {
                                metrics::counter!(observability::RECONCILE_MOVED_TOTAL)
                                    .increment(1);
                                info!("reconciler moved appointment {appt_id} to {new_start}");
                            }
                            Err(e) => {
                                debug!("reconciler move of {appt_id} failed: {e}");
                                flag(engine, appt_id, "auto-reschedule failed").await;
                            }
                        }
                    }
                    None => flag(engine, appt_id, "no open slot in search window").await,
                }
            }
            Ok(Resolution::Flag) => flag(engine, appt_id, "blackout requires manual review").await,
            Err(e) => {
                warn!("reconciler: {e}");
                flag(engine, appt_id, "conflicting blackout policies").await;
            }
        }
    }
}

async fn flag(engine: &Engine, appt_id: Ulid, reason: &str) {
    metrics::counter!(observability::RECONCILE_FLAGGED_TOTAL).increment(1);
    if let Err(e) = engine.flag_appointment(appt_id, reason.to_string()).await {
        warn!("reconciler could not flag {appt_id}: {e}");
    }
}
