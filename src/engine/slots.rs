use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// The conditional check behind every reservation: the cell must exist,
/// be opted in, and be unbooked. Evaluated under the teacher's write
/// lock by all callers.
pub(super) fn check_reservable(
    state: &TeacherState,
    teacher_id: Ulid,
    key: SlotKey,
) -> Result<(), EngineError> {
    match state.slots.get(&key) {
        None => Err(EngineError::SlotUnavailable { teacher_id, key }),
        Some(slot) if !slot.available => Err(EngineError::SlotUnavailable { teacher_id, key }),
        Some(slot) if slot.booked => Err(EngineError::SlotConflict { teacher_id, key }),
        Some(_) => Ok(()),
    }
}

pub(super) fn mark_reserved(state: &mut TeacherState, key: SlotKey, occupant: Occupant) {
    if let Some(slot) = state.slots.get_mut(&key) {
        slot.booked = true;
        slot.occupant = Some(occupant);
    }
}

pub(super) fn mark_freed(state: &mut TeacherState, key: SlotKey) {
    if let Some(slot) = state.slots.get_mut(&key) {
        slot.booked = false;
        slot.occupant = None;
    }
}

/// Slot Store: every mutation of a teacher's calendar goes through these
/// methods; nothing else writes `SlotState` fields.
impl Engine {
    pub async fn register_teacher(
        &self,
        id: Ulid,
        name: String,
        category: String,
    ) -> Result<(), EngineError> {
        if self.teachers.len() >= MAX_TEACHERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many teachers"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("teacher name too long"));
        }
        if category.len() > MAX_CATEGORY_LEN {
            return Err(EngineError::LimitExceeded("category too long"));
        }
        if self.teachers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::TeacherRegistered {
            id,
            name: name.clone(),
            category: category.clone(),
        };
        self.wal_append(&event).await?;
        self.teachers.insert(
            id,
            std::sync::Arc::new(tokio::sync::RwLock::new(TeacherState::new(id, name, category))),
        );
        self.notify.send(id, &event);
        Ok(())
    }

    /// Teacher opts in a slot. Re-publishing an existing cell just flips
    /// `available` back on; booking state is untouched.
    pub async fn publish_slot(&self, teacher_id: Ulid, key: SlotKey) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = teacher.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_TEACHER && !guard.slots.contains_key(&key) {
            return Err(EngineError::LimitExceeded("too many slots for teacher"));
        }

        let event = Event::SlotPublished { teacher_id, key };
        self.wal_append(&event).await?;
        guard.slots.entry(key).or_insert_with(SlotState::open).available = true;
        self.notify.send(teacher_id, &event);
        Ok(())
    }

    /// Teacher opts a slot out. Slots are never deleted, only toggled, so
    /// booking history stays attached to the cell. Rejected while booked.
    pub async fn withdraw_slot(&self, teacher_id: Ulid, key: SlotKey) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = teacher.write().await;
        let slot = guard
            .slots
            .get(&key)
            .copied()
            .ok_or(EngineError::NotFound(teacher_id))?;
        if slot.booked {
            return Err(EngineError::SlotConflict { teacher_id, key });
        }

        let event = Event::SlotWithdrawn { teacher_id, key };
        self.wal_append(&event).await?;
        if let Some(slot) = guard.slots.get_mut(&key) {
            slot.available = false;
        }
        self.notify.send(teacher_id, &event);
        Ok(())
    }

    /// Conditional reservation: succeeds only when the slot is currently
    /// `available && !booked`. The check and the write happen under one
    /// write lock, so two racing callers can never both succeed — this is
    /// the one true race in the system and it is resolved here, never by
    /// read-then-write in calling code.
    pub async fn reserve_slot(
        &self,
        teacher_id: Ulid,
        key: SlotKey,
        occupant: Occupant,
    ) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = teacher.write().await;
        check_reservable(&guard, teacher_id, key)?;

        let event = Event::SlotReserved { teacher_id, key, occupant };
        self.wal_append(&event).await?;
        mark_reserved(&mut guard, key, occupant);
        self.notify.send(teacher_id, &event);
        Ok(())
    }

    /// Reservation for composite flows (booking, reschedule): the same
    /// conditional update, applied in memory only. The caller folds the
    /// slot change into the one composite event it commits afterwards,
    /// and replay of that event re-applies it.
    pub(super) async fn reserve_slot_local(
        &self,
        teacher_id: Ulid,
        key: SlotKey,
        occupant: Occupant,
    ) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = teacher.write().await;
        check_reservable(&guard, teacher_id, key)?;
        mark_reserved(&mut guard, key, occupant);
        Ok(())
    }

    /// In-memory counterpart of `free_slot`, same idempotence.
    pub(super) async fn free_slot_local(
        &self,
        teacher_id: Ulid,
        key: SlotKey,
    ) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = teacher.write().await;
        if !guard.slots.contains_key(&key) {
            return Err(EngineError::NotFound(teacher_id));
        }
        mark_freed(&mut guard, key);
        Ok(())
    }

    /// Free a reservation. Idempotent: freeing an already-free slot is a
    /// no-op, only an unknown (teacher, date, time) errors.
    pub async fn free_slot(&self, teacher_id: Ulid, key: SlotKey) -> Result<(), EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = teacher.write().await;
        let slot = guard
            .slots
            .get(&key)
            .copied()
            .ok_or(EngineError::NotFound(teacher_id))?;
        if !slot.booked {
            return Ok(());
        }

        let event = Event::SlotFreed { teacher_id, key };
        self.wal_append(&event).await?;
        mark_freed(&mut guard, key);
        self.notify.send(teacher_id, &event);
        Ok(())
    }

    /// All opted-in slots for one teacher-day, booked ones annotated, in
    /// time order. The UI layer renders these to distinguish free from
    /// taken.
    pub async fn list_available(
        &self,
        teacher_id: Ulid,
        date: chrono::NaiveDate,
    ) -> Result<Vec<SlotView>, EngineError> {
        let teacher = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = teacher.read().await;
        Ok(guard
            .slots
            .iter()
            .filter(|(key, slot)| key.date == date && slot.available)
            .map(|(key, slot)| SlotView {
                time: key.time,
                booked: slot.booked,
                occupant: slot.occupant,
            })
            .collect())
    }
}
