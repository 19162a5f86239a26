use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Read-only views. Everything clones snapshots out from under the locks;
/// callers never hold engine state across an await.
impl Engine {
    pub async fn list_teachers(&self) -> Vec<TeacherInfo> {
        let mut ids: Vec<Ulid> = self.teachers.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(teacher) = self.get_teacher(&id) else { continue };
            let guard = teacher.read().await;
            out.push(TeacherInfo {
                id: guard.id,
                name: guard.name.clone(),
                category: guard.category.clone(),
            });
        }
        out
    }

    /// Full session history for a student or family, ordered by session
    /// number. A family member's history includes the occurrences shared
    /// through its group.
    pub async fn history(&self, occupant_id: Ulid) -> Result<Vec<SessionOccurrence>, EngineError> {
        let mut session_ids: Vec<Ulid> = Vec::new();
        let push_for = |id: Ulid, session_ids: &mut Vec<Ulid>| {
            if let Some(ids) = self.sessions_by_occupant.get(&id) {
                session_ids.extend(ids.iter().copied());
            }
        };

        if self.families.contains_key(&occupant_id) {
            push_for(occupant_id, &mut session_ids);
        } else if let Some(trial) = self.get_trial(&occupant_id) {
            let family_id = trial.read().await.family_id;
            push_for(occupant_id, &mut session_ids);
            if let Some(fid) = family_id {
                push_for(fid, &mut session_ids);
            }
        } else {
            return Err(EngineError::NotFound(occupant_id));
        }

        let mut out = Vec::with_capacity(session_ids.len());
        for sid in session_ids {
            let Some(session) = self.get_session(&sid) else { continue };
            out.push(session.read().await.clone());
        }
        out.sort_by_key(|s| (s.session_number, s.id));
        Ok(out)
    }

    /// Snapshot of one trial record.
    pub async fn trial_view(&self, trial_id: Ulid) -> Result<TrialRecord, EngineError> {
        let trial = self.get_trial(&trial_id).ok_or(EngineError::NotFound(trial_id))?;
        let snapshot = trial.read().await.clone();
        Ok(snapshot)
    }

    /// Snapshot of one family group.
    pub async fn family_view(&self, family_id: Ulid) -> Result<FamilyGroup, EngineError> {
        let family = self.get_family(&family_id).ok_or(EngineError::NotFound(family_id))?;
        let snapshot = family.read().await.clone();
        Ok(snapshot)
    }
}
