use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Fold a reschedule into a session occurrence: capture the original
/// schedule on the first move, then bump the count and shift the
/// scheduled cell. Shared by the live path and WAL replay.
pub(super) fn apply_to_session(
    session: &mut SessionOccurrence,
    new: SlotKey,
    reason: RescheduleReason,
) {
    if session.original_date.is_none() {
        session.original_date = Some(session.scheduled_date);
        session.original_time = Some(session.scheduled_time);
    }
    session.reschedule_count += 1;
    session.reschedule_reason = Some(reason);
    session.scheduled_date = new.date;
    session.scheduled_time = new.time;
}

impl Engine {
    /// Move a reservation from `old` to `new` on the same teacher, in
    /// memory. The two cells are touched under separate lock acquisitions,
    /// so a rival can grab `new` in between; when that happens the old
    /// reservation is put back and the original conflict is surfaced. Only
    /// a failed compensation leaves the record inconsistent. Durability is
    /// the caller's job: the one composite event it commits afterwards
    /// carries the slot movement, and replay re-applies it.
    pub(super) async fn swap_reservation(
        &self,
        teacher_id: Ulid,
        old: Option<SlotKey>,
        new: SlotKey,
        occupant: Occupant,
    ) -> Result<(), EngineError> {
        if let Some(old_key) = old {
            self.free_slot_local(teacher_id, old_key).await?;
        }
        match self.reserve_slot_local(teacher_id, new, occupant).await {
            Ok(()) => Ok(()),
            Err(err @ (EngineError::SlotConflict { .. } | EngineError::SlotUnavailable { .. })) => {
                if let Some(old_key) = old
                    && let Err(comp) = self.reserve_slot_local(teacher_id, old_key, occupant).await
                {
                    metrics::counter!(crate::observability::RESCHEDULE_INCONSISTENT_TOTAL)
                        .increment(1);
                    tracing::error!(
                        occupant = %occupant.id(),
                        teacher = %teacher_id,
                        %old_key,
                        "reschedule compensation failed: {comp}"
                    );
                    return Err(EngineError::Inconsistent {
                        occupant: occupant.id(),
                        detail: format!(
                            "lost {new} ({err}) and could not restore {old_key}: {comp}"
                        ),
                    });
                }
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    /// Put the slots back after a swap whose commit failed: the movement
    /// never became durable, so memory must not keep it either.
    async fn unwind_swap(
        &self,
        teacher_id: Ulid,
        old: Option<SlotKey>,
        new: SlotKey,
        occupant: Occupant,
    ) {
        let restore = match old {
            Some(old_key) => {
                self.swap_reservation(teacher_id, Some(new), old_key, occupant).await
            }
            None => self.free_slot_local(teacher_id, new).await,
        };
        if let Err(e) = restore {
            metrics::counter!(crate::observability::RESCHEDULE_INCONSISTENT_TOTAL).increment(1);
            tracing::error!(
                occupant = %occupant.id(),
                teacher = %teacher_id,
                "could not restore reservation after failed commit: {e}"
            );
        }
    }

    async fn precheck_target(
        &self,
        teacher_id: Ulid,
        new: SlotKey,
    ) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = teacher.read().await;
        match guard.slot(&new) {
            None => Err(EngineError::SlotUnavailable { teacher_id, key: new }),
            Some(slot) if !slot.available => {
                Err(EngineError::SlotUnavailable { teacher_id, key: new })
            }
            // A target someone already holds at check time is unavailable;
            // SlotConflict is reserved for losing the race after the check.
            Some(slot) if slot.booked => {
                Err(EngineError::SlotUnavailable { teacher_id, key: new })
            }
            Some(_) => Ok(()),
        }
    }

    /// Reschedule an individual trial to a new cell on its teacher.
    pub async fn reschedule_trial(
        &self,
        trial_id: Ulid,
        new: SlotKey,
        reason: RescheduleReason,
    ) -> Result<(), EngineError> {
        let trial = self.get_trial(&trial_id).ok_or(EngineError::NotFound(trial_id))?;
        let mut guard = trial.write().await;
        if guard.family_id.is_some() {
            return Err(EngineError::PartOfFamily(trial_id));
        }
        let teacher_id = guard.teacher_id;
        let old = match (guard.trial_date, guard.trial_time) {
            (Some(date), Some(time)) => Some(SlotKey::new(date, time)),
            _ => None,
        };
        if old == Some(new) {
            return Err(EngineError::Unchanged(new));
        }
        // Cheap reject before the old reservation is given up. The swap
        // re-checks under the write lock, so this is advisory only.
        self.precheck_target(teacher_id, new).await?;

        let occupant = Occupant::Student(trial_id);
        let session_id = self.trial_session_id(occupant).ok_or_else(|| {
            EngineError::Inconsistent {
                occupant: trial_id,
                detail: "trial has no session occurrence".into(),
            }
        })?;
        self.swap_reservation(teacher_id, old, new, occupant).await?;

        // Steps 2-5 become durable as this one event; replay re-applies
        // the slot movement along with the record and ledger updates.
        let event = Event::Rescheduled {
            occupant,
            teacher_id,
            old,
            new,
            reason,
            session_id,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.unwind_swap(teacher_id, old, new, occupant).await;
            return Err(e);
        }
        guard.trial_date = Some(new.date);
        guard.trial_time = Some(new.time);
        if let Some(session) = self.get_session(&session_id) {
            let mut s = session.write().await;
            apply_to_session(&mut s, new, reason);
        }
        self.notify.send(trial_id, &event);
        self.notify.send(teacher_id, &event);
        Ok(())
    }

    /// Reschedule a family group's shared trial session. Member records
    /// mirror the group's schedule, so all member locks are held across
    /// the commit, in sorted id order.
    pub async fn reschedule_family(
        &self,
        family_id: Ulid,
        new: SlotKey,
        reason: RescheduleReason,
    ) -> Result<(), EngineError> {
        let family = self.get_family(&family_id).ok_or(EngineError::NotFound(family_id))?;
        let mut group = family.write().await;
        let teacher_id = group.teacher_id;
        let old = match (group.trial_date, group.trial_time) {
            (Some(date), Some(time)) => Some(SlotKey::new(date, time)),
            _ => None,
        };
        if old == Some(new) {
            return Err(EngineError::Unchanged(new));
        }
        self.precheck_target(teacher_id, new).await?;

        let mut member_ids = group.member_ids.clone();
        member_ids.sort();
        let mut member_guards = Vec::with_capacity(member_ids.len());
        for mid in &member_ids {
            let member = self.get_trial(mid).ok_or(EngineError::NotFound(*mid))?;
            member_guards.push(member.write_owned().await);
        }

        let occupant = Occupant::Family(family_id);
        let session_id = self.trial_session_id(occupant).ok_or_else(|| {
            EngineError::Inconsistent {
                occupant: family_id,
                detail: "family has no session occurrence".into(),
            }
        })?;
        self.swap_reservation(teacher_id, old, new, occupant).await?;

        let event = Event::Rescheduled {
            occupant,
            teacher_id,
            old,
            new,
            reason,
            session_id,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.unwind_swap(teacher_id, old, new, occupant).await;
            return Err(e);
        }
        group.trial_date = Some(new.date);
        group.trial_time = Some(new.time);
        for member in &mut member_guards {
            member.trial_date = Some(new.date);
            member.trial_time = Some(new.time);
        }
        if let Some(session) = self.get_session(&session_id) {
            let mut s = session.write().await;
            apply_to_session(&mut s, new, reason);
        }
        self.notify.send(family_id, &event);
        self.notify.send(teacher_id, &event);
        Ok(())
    }
}
