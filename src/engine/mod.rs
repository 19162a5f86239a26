mod assign;
mod error;
mod ledger;
mod queries;
mod reschedule;
mod slots;
mod status;
#[cfg(test)]
mod tests;

pub use assign::{FamilyRequest, TrialRequest};
pub use error::EngineError;
pub use status::{requires_confirmation, transition_allowed, transition_defined};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTeacher = Arc<RwLock<TeacherState>>;
pub type SharedTrial = Arc<RwLock<TrialRecord>>;
pub type SharedFamily = Arc<RwLock<FamilyGroup>>;
pub type SharedSession = Arc<RwLock<SessionOccurrence>>;

pub(super) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's scheduling engine: teachers with their slot calendars,
/// trial and family records, and the session ledger, all rebuilt from the
/// WAL on startup.
pub struct Engine {
    pub teachers: DashMap<Ulid, SharedTeacher>,
    pub trials: DashMap<Ulid, SharedTrial>,
    pub families: DashMap<Ulid, SharedFamily>,
    pub sessions: DashMap<Ulid, SharedSession>,
    /// Occupant id (student or family) → session ids in append order.
    pub(super) sessions_by_occupant: DashMap<Ulid, Vec<Ulid>>,
    /// Monotonic assignment counter backing round-robin selection.
    pub(super) assign_seq: AtomicU64,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            teachers: DashMap::new(),
            trials: DashMap::new(),
            families: DashMap::new(),
            sessions: DashMap::new(),
            sessions_by_occupant: DashMap::new(),
            assign_seq: AtomicU64::new(0),
            wal_tx,
            notify,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context (lazy tenant creation).
        for event in &events {
            engine.replay_apply(event);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_teacher(&self, id: &Ulid) -> Option<SharedTeacher> {
        self.teachers.get(id).map(|e| e.value().clone())
    }

    pub fn get_trial(&self, id: &Ulid) -> Option<SharedTrial> {
        self.trials.get(id).map(|e| e.value().clone())
    }

    pub fn get_family(&self, id: &Ulid) -> Option<SharedFamily> {
        self.families.get(id).map(|e| e.value().clone())
    }

    pub fn get_session(&self, id: &Ulid) -> Option<SharedSession> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Claim the next assignment sequence number.
    pub(super) fn next_assign_seq(&self) -> u64 {
        self.assign_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a session in the map and the per-occupant index.
    /// Idempotent on the index so compacted WALs replay cleanly.
    pub(super) fn index_session(&self, session: SessionOccurrence) {
        let id = session.id;
        let occupant_id = session.occupant.id();
        self.sessions.insert(id, Arc::new(RwLock::new(session)));
        let mut ids = self.sessions_by_occupant.entry(occupant_id).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    // ── Replay ───────────────────────────────────────────

    fn replay_apply(&self, event: &Event) {
        match event {
            Event::TeacherRegistered { id, name, category } => {
                self.teachers.insert(
                    *id,
                    Arc::new(RwLock::new(TeacherState::new(*id, name.clone(), category.clone()))),
                );
            }
            Event::SlotPublished { teacher_id, key } => {
                if let Some(teacher) = self.get_teacher(teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    guard.slots.entry(*key).or_insert_with(SlotState::open).available = true;
                }
            }
            Event::SlotWithdrawn { teacher_id, key } => {
                if let Some(teacher) = self.get_teacher(teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    if let Some(slot) = guard.slots.get_mut(key) {
                        slot.available = false;
                    }
                }
            }
            Event::SlotReserved { teacher_id, key, occupant } => {
                if let Some(teacher) = self.get_teacher(teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    if let Some(slot) = guard.slots.get_mut(key) {
                        slot.booked = true;
                        slot.occupant = Some(*occupant);
                    }
                }
            }
            Event::SlotFreed { teacher_id, key } => {
                if let Some(teacher) = self.get_teacher(teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    if let Some(slot) = guard.slots.get_mut(key) {
                        slot.booked = false;
                        slot.occupant = None;
                    }
                }
            }
            Event::TrialBooked { trial, session_id } => {
                let seq = self.next_assign_seq();
                if let Some(teacher) = self.get_teacher(&trial.teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    guard.last_assigned_seq = seq;
                    if let (Some(date), Some(time)) = (trial.trial_date, trial.trial_time) {
                        slots::mark_reserved(
                            &mut guard,
                            SlotKey::new(date, time),
                            Occupant::Student(trial.id),
                        );
                    }
                }
                if let (Some(date), Some(time)) = (trial.trial_date, trial.trial_time) {
                    self.index_session(SessionOccurrence::scheduled(
                        *session_id,
                        Occupant::Student(trial.id),
                        1,
                        SlotKey::new(date, time),
                    ));
                }
                self.trials.insert(trial.id, Arc::new(RwLock::new(trial.clone())));
            }
            Event::FamilyBooked { group, members, session_id } => {
                let seq = self.next_assign_seq();
                if let Some(teacher) = self.get_teacher(&group.teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    guard.last_assigned_seq = seq;
                    if let (Some(date), Some(time)) = (group.trial_date, group.trial_time) {
                        slots::mark_reserved(
                            &mut guard,
                            SlotKey::new(date, time),
                            Occupant::Family(group.id),
                        );
                    }
                }
                if let (Some(date), Some(time)) = (group.trial_date, group.trial_time) {
                    self.index_session(SessionOccurrence::scheduled(
                        *session_id,
                        Occupant::Family(group.id),
                        1,
                        SlotKey::new(date, time),
                    ));
                }
                for member in members {
                    self.trials.insert(member.id, Arc::new(RwLock::new(member.clone())));
                }
                self.families.insert(group.id, Arc::new(RwLock::new(group.clone())));
            }
            Event::StatusChanged { occupant, to, .. } => match occupant {
                Occupant::Student(id) => {
                    if let Some(trial) = self.get_trial(id) {
                        trial.try_write().expect("replay: uncontended write").status = *to;
                    }
                }
                Occupant::Family(id) => {
                    if let Some(family) = self.get_family(id) {
                        let mut guard = family.try_write().expect("replay: uncontended write");
                        guard.status = *to;
                        let member_ids = guard.member_ids.clone();
                        drop(guard);
                        for mid in member_ids {
                            if let Some(member) = self.get_trial(&mid) {
                                member.try_write().expect("replay: uncontended write").status = *to;
                            }
                        }
                    }
                }
            },
            Event::Rescheduled { occupant, teacher_id, old, new, reason, session_id } => {
                // The event is the unit of work: it moves the reservation
                // as well as the record and ledger state.
                if let Some(teacher) = self.get_teacher(teacher_id) {
                    let mut guard = teacher.try_write().expect("replay: uncontended write");
                    if let Some(old_key) = old {
                        slots::mark_freed(&mut guard, *old_key);
                    }
                    slots::mark_reserved(&mut guard, *new, *occupant);
                }
                match occupant {
                    Occupant::Student(id) => {
                        if let Some(trial) = self.get_trial(id) {
                            let mut guard = trial.try_write().expect("replay: uncontended write");
                            guard.trial_date = Some(new.date);
                            guard.trial_time = Some(new.time);
                        }
                    }
                    Occupant::Family(id) => {
                        if let Some(family) = self.get_family(id) {
                            let mut guard = family.try_write().expect("replay: uncontended write");
                            guard.trial_date = Some(new.date);
                            guard.trial_time = Some(new.time);
                            let member_ids = guard.member_ids.clone();
                            drop(guard);
                            for mid in member_ids {
                                if let Some(member) = self.get_trial(&mid) {
                                    let mut m = member.try_write().expect("replay: uncontended write");
                                    m.trial_date = Some(new.date);
                                    m.trial_time = Some(new.time);
                                }
                            }
                        }
                    }
                }
                if let Some(session) = self.get_session(session_id) {
                    let mut guard = session.try_write().expect("replay: uncontended write");
                    reschedule::apply_to_session(&mut guard, *new, *reason);
                }
            }
            Event::SessionAppended { session } => {
                self.index_session(session.clone());
            }
            Event::SessionCompleted { id, actual_minutes, notes, completed_at } => {
                if let Some(session) = self.get_session(id) {
                    let mut guard = session.try_write().expect("replay: uncontended write");
                    guard.status = SessionStatus::Completed;
                    guard.actual_minutes = Some(*actual_minutes);
                    guard.notes = notes.clone();
                    guard.completed_at = Some(*completed_at);
                }
            }
        }
    }

    // ── Compaction ───────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Teachers and their calendars, sorted for stable output.
        let mut teacher_ids: Vec<Ulid> = self.teachers.iter().map(|e| *e.key()).collect();
        teacher_ids.sort();
        for tid in &teacher_ids {
            let Some(teacher) = self.get_teacher(tid) else { continue };
            let guard = teacher.try_read().expect("compact: uncontended read");
            events.push(Event::TeacherRegistered {
                id: guard.id,
                name: guard.name.clone(),
                category: guard.category.clone(),
            });
            for (key, slot) in &guard.slots {
                events.push(Event::SlotPublished { teacher_id: guard.id, key: *key });
                if !slot.available {
                    events.push(Event::SlotWithdrawn { teacher_id: guard.id, key: *key });
                }
                if slot.booked
                    && let Some(occupant) = slot.occupant
                {
                    events.push(Event::SlotReserved {
                        teacher_id: guard.id,
                        key: *key,
                        occupant,
                    });
                }
            }
        }

        // Family groups carry their members; individual trials follow.
        // Ids are ULIDs, so sorting approximates original booking order and
        // keeps the round-robin counters sensible after replay.
        let mut family_ids: Vec<Ulid> = self.families.iter().map(|e| *e.key()).collect();
        family_ids.sort();
        for fid in &family_ids {
            let Some(family) = self.get_family(fid) else { continue };
            let group = family.try_read().expect("compact: uncontended read").clone();
            let members: Vec<TrialRecord> = group
                .member_ids
                .iter()
                .filter_map(|mid| self.get_trial(mid))
                .map(|m| m.try_read().expect("compact: uncontended read").clone())
                .collect();
            let session_id = self.trial_session_id(Occupant::Family(group.id));
            events.push(Event::FamilyBooked {
                group,
                members,
                session_id: session_id.unwrap_or_else(Ulid::new),
            });
        }

        let mut trial_ids: Vec<Ulid> = self.trials.iter().map(|e| *e.key()).collect();
        trial_ids.sort();
        for tid in &trial_ids {
            let Some(trial) = self.get_trial(tid) else { continue };
            let record = trial.try_read().expect("compact: uncontended read").clone();
            if record.family_id.is_some() {
                continue; // emitted with its FamilyBooked
            }
            let session_id = self.trial_session_id(Occupant::Student(record.id));
            events.push(Event::TrialBooked {
                trial: record,
                session_id: session_id.unwrap_or_else(Ulid::new),
            });
        }

        // Sessions last: they overwrite the fresh trial sessions created by
        // the booking events above, restoring reschedule provenance and
        // completion state.
        let mut session_ids: Vec<Ulid> = self.sessions.iter().map(|e| *e.key()).collect();
        session_ids.sort();
        for sid in &session_ids {
            let Some(session) = self.get_session(sid) else { continue };
            let snapshot = session.try_read().expect("compact: uncontended read").clone();
            events.push(Event::SessionAppended { session: snapshot });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn trial_session_id(&self, occupant: Occupant) -> Option<Ulid> {
        let ids = self.sessions_by_occupant.get(&occupant.id())?;
        ids.first().copied()
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
