mod availability;
mod blackout;
mod conflict;
mod error;
mod mutations;
mod queries;
mod recurrence;
mod reserve;
mod series;

pub use availability::{merge_overlapping, nearest_open_slot, open_slots, subtract_intervals};
pub use blackout::{blocked_ranges, hits_span as blackout_hits, is_blocked};
pub use conflict::{find_conflicts, Obstacle};
pub use error::EngineError;
pub use recurrence::{expand, occurrence_starts, validate_pattern, Expansion};
pub use reserve::{ReserveOptions, ReserveOutcome};
pub use series::{ActionScope, GenerationReport, OccurrenceAction, OccurrenceOutcome};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::journal::Journal;
use crate::locks::{LockService, SlotLocks};
use crate::model::*;
use crate::notify::{ChangeKind, NotifyHub, OccurrenceChange};
use crate::reconcile::ReconcileTask;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedSeriesState = Arc<RwLock<SeriesState>>;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group
/// commit:
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then the non-append command
                            flush_and_respond(&mut journal, &mut batch);
                            handle_non_append(&mut journal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut journal, &mut batch);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(journal: &mut Journal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
        .record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(journal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(journal: &mut Journal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

// ── Event application ────────────────────────────────────

/// Side effect of a resource-level event on the owning series' counters.
pub(super) enum SeriesEffect {
    Occupied {
        slot: SeriesSlot,
        appointment_id: Ulid,
    },
    Transition {
        slot: SeriesSlot,
        to: AppointmentStatus,
    },
    /// Terminal override from a bulk cancel — wins over auto-completion.
    StatusForced {
        series_id: Ulid,
        status: SeriesStatus,
    },
}

impl SeriesEffect {
    fn series_id(&self) -> Ulid {
        match self {
            SeriesEffect::Occupied { slot, .. } | SeriesEffect::Transition { slot, .. } => {
                slot.series_id
            }
            SeriesEffect::StatusForced { series_id, .. } => *series_id,
        }
    }
}

/// Apply an event directly to a ResourceState (no locking — caller holds
/// the write guard). Returns the series-counter effects for the engine to
/// apply under the series guard.
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
) -> Vec<SeriesEffect> {
    let mut effects = Vec::new();
    match event {
        Event::AppointmentBooked {
            id,
            resource_id,
            span,
            series,
            label,
        } => {
            rs.insert_appointment(Appointment {
                id: *id,
                span: *span,
                status: AppointmentStatus::Pending,
                series: *series,
                original_start: None,
                label: label.clone(),
                needs_review: false,
            });
            entity_map.insert(*id, *resource_id);
            if let Some(slot) = series {
                effects.push(SeriesEffect::Occupied {
                    slot: *slot,
                    appointment_id: *id,
                });
            }
        }
        Event::AppointmentRescheduled { id, span, .. } => {
            rs.move_appointment(*id, *span);
            if let Some(appt) = rs.appointment_mut(*id) {
                appt.needs_review = false;
            }
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(appt) = rs.appointment_mut(*id) {
                let old = appt.status;
                appt.status = *status;
                if old != *status
                    && let Some(slot) = appt.series {
                        effects.push(SeriesEffect::Transition {
                            slot,
                            to: *status,
                        });
                    }
            }
        }
        Event::AppointmentFlagged { id, .. } => {
            if let Some(appt) = rs.appointment_mut(*id) {
                appt.needs_review = true;
            }
        }
        Event::BlackoutCreated {
            resource_id: Some(resource_id),
            blackout,
        } => {
            rs.blackouts.push(blackout.clone());
            entity_map.insert(blackout.id, *resource_id);
        }
        Event::BlackoutRemoved { id, .. } => {
            rs.remove_blackout(*id);
            entity_map.remove(id);
        }
        Event::SeriesTruncated {
            id, from_sequence, ..
        } => {
            for appt in rs.appointments.iter_mut() {
                if let Some(slot) = appt.series
                    && slot.series_id == *id
                    && slot.sequence >= *from_sequence
                    && appt.status.is_active()
                {
                    appt.status = AppointmentStatus::Cancelled;
                    effects.push(SeriesEffect::Transition {
                        slot,
                        to: AppointmentStatus::Cancelled,
                    });
                }
            }
            // Pushed last so the terminal status wins over any
            // auto-completion triggered by the cancellations above.
            effects.push(SeriesEffect::StatusForced {
                series_id: *id,
                status: SeriesStatus::Cancelled,
            });
        }
        Event::ResourceUpdated {
            name,
            hours,
            buffer,
            ..
        } => {
            rs.name = name.clone();
            rs.hours = *hours;
            rs.buffer = *buffer;
        }
        // Map-level and series-level events are handled by the engine.
        _ => {}
    }
    effects
}

fn apply_effect_to_series(series: &mut SeriesState, effect: &SeriesEffect, at: Ms) {
    match effect {
        SeriesEffect::Occupied {
            slot,
            appointment_id,
        } => {
            series.insert_occurrence(slot.sequence, *appointment_id);
        }
        SeriesEffect::Transition { to, .. } => {
            match to {
                AppointmentStatus::Completed | AppointmentStatus::NoShow => {
                    series.completed_count += 1;
                }
                AppointmentStatus::Cancelled => series.cancelled_count += 1,
                _ => {}
            }
            maybe_autocomplete(series);
        }
        SeriesEffect::StatusForced { status, .. } => {
            series.status = *status;
        }
    }
    series.updated_at = at;
}

/// Series finishes itself once every planned occurrence is consumed,
/// unless staff forced another status meanwhile.
fn maybe_autocomplete(series: &mut SeriesState) {
    if series.status == SeriesStatus::Active
        && series.total_planned > 0
        && series.completed_count + series.cancelled_count >= series.total_planned
    {
        series.status = SeriesStatus::Completed;
    }
}

// ── The engine ───────────────────────────────────────────

pub struct Engine {
    pub(crate) state: DashMap<Ulid, SharedResourceState>,
    pub(crate) series: DashMap<Ulid, SharedSeriesState>,
    /// Reverse lookup: appointment/blackout id → resource id.
    pub(crate) entity_to_resource: DashMap<Ulid, Ulid>,
    /// Tenant-wide blackouts, applied to every resource.
    global_blackouts: StdRwLock<Vec<BlackoutInterval>>,
    /// Snapshot used by background tasks; API calls take an explicit handle.
    holidays: StdRwLock<Arc<HolidaySnapshot>>,
    pub(crate) locks: Arc<dyn LockService>,
    journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    reconcile_tx: mpsc::Sender<ReconcileTask>,
    reconcile_rx: StdMutex<Option<mpsc::Receiver<ReconcileTask>>>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(
        journal_path: PathBuf,
        config: EngineConfig,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let (reconcile_tx, reconcile_rx) = mpsc::channel(1024);
        let locks: Arc<dyn LockService> = Arc::new(SlotLocks::new(config.lock_timeout));

        let engine = Self {
            state: DashMap::new(),
            series: DashMap::new(),
            entity_to_resource: DashMap::new(),
            global_blackouts: StdRwLock::new(Vec::new()),
            holidays: StdRwLock::new(Arc::new(HolidaySnapshot::default())),
            locks,
            journal_tx,
            notify,
            reconcile_tx,
            reconcile_rx: StdMutex::new(Some(reconcile_rx)),
            config,
        };

        // Replay — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use
        // blocking_read/blocking_write here because this may run inside an
        // async context (e.g. lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceRegistered {
                id,
                name,
                tz,
                hours,
                buffer,
            } => {
                let rs = ResourceState::new(*id, name.clone(), *tz, *hours, *buffer);
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::SeriesCreated {
                id,
                resource_id,
                pattern,
                total_planned,
                at,
            } => {
                self.series.insert(
                    *id,
                    Arc::new(RwLock::new(SeriesState {
                        id: *id,
                        resource_id: *resource_id,
                        pattern: pattern.clone(),
                        status: SeriesStatus::Active,
                        total_planned: *total_planned,
                        completed_count: 0,
                        cancelled_count: 0,
                        appointments: Vec::new(),
                        created_at: *at,
                        updated_at: *at,
                    })),
                );
            }
            Event::SeriesStatusChanged { id, status, at } => {
                if let Some(entry) = self.series.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    guard.status = *status;
                    guard.updated_at = *at;
                }
            }
            Event::SeriesPlanAdjusted { id, total_planned } => {
                if let Some(entry) = self.series.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    guard.total_planned = *total_planned;
                    maybe_autocomplete(&mut guard);
                }
            }
            Event::BlackoutCreated {
                resource_id: None,
                blackout,
            } => {
                self.global_blackouts
                    .write()
                    .expect("global blackout lock poisoned")
                    .push(blackout.clone());
            }
            Event::BlackoutRemoved {
                id,
                resource_id: None,
            } => {
                self.global_blackouts
                    .write()
                    .expect("global blackout lock poisoned")
                    .retain(|b| b.id != *id);
            }
            other => {
                let Some(resource_id) = event_resource_id(other) else {
                    return;
                };
                if let Some(entry) = self.state.get(&resource_id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    let effects = apply_to_resource(&mut guard, other, &self.entity_to_resource);
                    drop(guard);
                    for effect in &effects {
                        self.apply_series_effect_sync(effect);
                    }
                }
            }
        }
    }

    fn apply_series_effect_sync(&self, effect: &SeriesEffect) {
        let series_id = effect.series_id();
        if let Some(entry) = self.series.get(&series_id) {
            let arc = entry.value().clone();
            let mut guard = arc.try_write().expect("replay: uncontended write");
            apply_effect_to_series(&mut guard, effect, now_ms());
        }
    }

    pub(super) async fn apply_series_effects(&self, effects: &[SeriesEffect]) {
        for effect in effects {
            let Some(arc) = self.get_series(&effect.series_id()) else {
                continue;
            };
            let mut guard = arc.write().await;
            apply_effect_to_series(&mut guard, effect, now_ms());
        }
    }

    /// Write an event to the journal via the background group-commit writer.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_series(&self, id: &Ulid) -> Option<SharedSeriesState> {
        self.series.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// Journal-append + apply + series bookkeeping + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        let effects = apply_to_resource(rs, event, &self.entity_to_resource);
        self.apply_series_effects(&effects).await;
        if let Some(change) = change_for(event) {
            self.notify.send(change);
        }
        Ok(())
    }

    /// Lookup appointment → resource, acquire the resource write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_for_entity(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }

    // ── Holiday snapshot handle ──────────────────────────

    /// Install the snapshot background tasks (reconciler) read. API calls
    /// still take their own explicit handle.
    pub fn install_holidays(&self, snapshot: Arc<HolidaySnapshot>) {
        *self.holidays.write().expect("holiday lock poisoned") = snapshot;
    }

    pub fn current_holidays(&self) -> Arc<HolidaySnapshot> {
        self.holidays.read().expect("holiday lock poisoned").clone()
    }

    pub(crate) fn globals_snapshot(&self) -> Vec<BlackoutInterval> {
        self.global_blackouts
            .read()
            .expect("global blackout lock poisoned")
            .clone()
    }

    pub(super) fn with_globals_mut<R>(
        &self,
        f: impl FnOnce(&mut Vec<BlackoutInterval>) -> R,
    ) -> R {
        let mut globals = self
            .global_blackouts
            .write()
            .expect("global blackout lock poisoned");
        f(&mut globals)
    }

    // ── Reconciliation plumbing ──────────────────────────

    pub(crate) fn enqueue_reconcile(&self, task: ReconcileTask) {
        if self.reconcile_tx.try_send(task).is_err() {
            tracing::warn!("reconcile queue full, task dropped — periodic sweep will catch it");
        }
    }

    /// Hand the reconcile receiver to the background task. Callable once.
    pub fn take_reconcile_rx(&self) -> Option<mpsc::Receiver<ReconcileTask>> {
        self.reconcile_rx
            .lock()
            .expect("reconcile lock poisoned")
            .take()
    }

    // ── Journal maintenance ──────────────────────────────

    /// Rewrite the journal with only the events needed to recreate the
    /// current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Snapshot the maps first; guards are awaited one at a time so the
        // compactor never blocks writers for long.
        let resources: Vec<SharedResourceState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let all_series: Vec<SharedSeriesState> =
            self.series.iter().map(|e| e.value().clone()).collect();

        for rs in &resources {
            let guard = rs.read().await;
            events.push(Event::ResourceRegistered {
                id: guard.id,
                name: guard.name.clone(),
                tz: guard.tz,
                hours: guard.hours,
                buffer: guard.buffer,
            });
        }

        for arc in &all_series {
            let guard = arc.read().await;
            events.push(Event::SeriesCreated {
                id: guard.id,
                resource_id: guard.resource_id,
                pattern: guard.pattern.clone(),
                total_planned: guard.total_planned,
                at: guard.created_at,
            });
        }

        for b in self.globals_snapshot() {
            events.push(Event::BlackoutCreated {
                resource_id: None,
                blackout: b,
            });
        }

        // Appointments, resource blackouts and terminal series statuses
        // replay on top of the re-registered resources and series.
        for rs in &resources {
            let guard = rs.read().await;
            for b in &guard.blackouts {
                events.push(Event::BlackoutCreated {
                    resource_id: Some(guard.id),
                    blackout: b.clone(),
                });
            }
            for appt in &guard.appointments {
                events.push(Event::AppointmentBooked {
                    id: appt.id,
                    resource_id: guard.id,
                    span: match appt.original_start {
                        Some(orig) => Span::new(orig, orig + appt.span.duration_ms()),
                        None => appt.span,
                    },
                    series: appt.series,
                    label: appt.label.clone(),
                });
                if appt.original_start.is_some() {
                    events.push(Event::AppointmentRescheduled {
                        id: appt.id,
                        resource_id: guard.id,
                        span: appt.span,
                    });
                }
                if appt.status != AppointmentStatus::Pending {
                    events.push(Event::AppointmentStatusChanged {
                        id: appt.id,
                        resource_id: guard.id,
                        status: appt.status,
                    });
                }
                if appt.needs_review {
                    events.push(Event::AppointmentFlagged {
                        id: appt.id,
                        resource_id: guard.id,
                        reason: "restored from journal".into(),
                    });
                }
            }
        }

        for arc in &all_series {
            let guard = arc.read().await;
            if guard.status != SeriesStatus::Active {
                events.push(Event::SeriesStatusChanged {
                    id: guard.id,
                    status: guard.status,
                    at: guard.updated_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Extract the resource_id from a resource-scoped event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AppointmentBooked { resource_id, .. }
        | Event::AppointmentRescheduled { resource_id, .. }
        | Event::AppointmentStatusChanged { resource_id, .. }
        | Event::AppointmentFlagged { resource_id, .. }
        | Event::SeriesTruncated { resource_id, .. } => Some(*resource_id),
        Event::BlackoutCreated { resource_id, .. } | Event::BlackoutRemoved { resource_id, .. } => {
            *resource_id
        }
        Event::ResourceRegistered { id, .. } | Event::ResourceUpdated { id, .. } => Some(*id),
        Event::SeriesCreated { .. }
        | Event::SeriesStatusChanged { .. }
        | Event::SeriesPlanAdjusted { .. } => None,
    }
}

/// Map an event to the fire-and-forget notification it produces, if any.
fn change_for(event: &Event) -> Option<OccurrenceChange> {
    match event {
        Event::AppointmentBooked {
            id, resource_id, ..
        } => Some(OccurrenceChange {
            resource_id: *resource_id,
            appointment_id: Some(*id),
            kind: ChangeKind::Booked,
        }),
        Event::AppointmentRescheduled {
            id, resource_id, ..
        } => Some(OccurrenceChange {
            resource_id: *resource_id,
            appointment_id: Some(*id),
            kind: ChangeKind::Rescheduled,
        }),
        Event::AppointmentStatusChanged {
            id,
            resource_id,
            status,
        } => {
            let kind = match status {
                AppointmentStatus::Cancelled => ChangeKind::Cancelled,
                AppointmentStatus::Completed => ChangeKind::Completed,
                AppointmentStatus::NoShow => ChangeKind::NoShow,
                _ => return None,
            };
            Some(OccurrenceChange {
                resource_id: *resource_id,
                appointment_id: Some(*id),
                kind,
            })
        }
        Event::AppointmentFlagged {
            id, resource_id, ..
        } => Some(OccurrenceChange {
            resource_id: *resource_id,
            appointment_id: Some(*id),
            kind: ChangeKind::FlaggedForReview,
        }),
        Event::BlackoutCreated {
            resource_id: Some(resource_id),
            ..
        } => Some(OccurrenceChange {
            resource_id: *resource_id,
            appointment_id: None,
            kind: ChangeKind::BlackoutCreated,
        }),
        Event::SeriesTruncated { resource_id, .. } => Some(OccurrenceChange {
            resource_id: *resource_id,
            appointment_id: None,
            kind: ChangeKind::SeriesCancelled,
        }),
        _ => None,
    }
}
