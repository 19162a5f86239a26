use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, now_ms};

/// Session History Ledger: the trial occurrence is created by booking;
/// paid sessions are appended here as the package progresses.
impl Engine {
    /// Append the next scheduled occurrence for a student or family.
    /// Session numbers are dense: the new occurrence gets one past the
    /// count already on record.
    pub async fn append_session(
        &self,
        occupant_id: Ulid,
        key: SlotKey,
    ) -> Result<SessionOccurrence, EngineError> {
        let occupant = if self.families.contains_key(&occupant_id) {
            Occupant::Family(occupant_id)
        } else if self.trials.contains_key(&occupant_id) {
            Occupant::Student(occupant_id)
        } else {
            return Err(EngineError::NotFound(occupant_id));
        };

        let existing = self
            .sessions_by_occupant
            .get(&occupant_id)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if existing >= MAX_SESSIONS_PER_STUDENT {
            return Err(EngineError::LimitExceeded("too many sessions for student"));
        }

        let session = SessionOccurrence::scheduled(
            Ulid::new(),
            occupant,
            existing as u32 + 1,
            key,
        );
        let event = Event::SessionAppended {
            session: session.clone(),
        };
        self.wal_append(&event).await?;
        self.index_session(session.clone());
        self.notify.send(occupant_id, &event);
        Ok(session)
    }

    /// Mark a session as held. Rejected once completed; the ledger keeps
    /// exactly one completion per occurrence.
    pub async fn complete_session(
        &self,
        session_id: Ulid,
        actual_minutes: u32,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        if actual_minutes > MAX_SESSION_MINUTES {
            return Err(EngineError::LimitExceeded("session length out of range"));
        }
        if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let session = self
            .get_session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let mut guard = session.write().await;
        if guard.status == SessionStatus::Completed {
            return Err(EngineError::AlreadyCompleted(session_id));
        }

        let completed_at = now_ms();
        let event = Event::SessionCompleted {
            id: session_id,
            actual_minutes,
            notes: notes.clone(),
            completed_at,
        };
        self.wal_append(&event).await?;
        guard.status = SessionStatus::Completed;
        guard.actual_minutes = Some(actual_minutes);
        guard.notes = notes;
        guard.completed_at = Some(completed_at);
        self.notify.send(guard.occupant.id(), &event);
        Ok(())
    }
}
