use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedTeacher};

/// Booking request for one individual student.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRequest {
    pub name: String,
    pub age: Option<u8>,
    pub phone: String,
    pub country: String,
    pub platform: String,
    pub category: String,
    pub sales_agent: String,
    pub supervisor: Option<String>,
    pub slot: SlotKey,
    pub notes: Option<String>,
}

/// Booking request for siblings sharing one trial slot.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyRequest {
    pub parent_name: String,
    pub phone: String,
    pub country: String,
    pub platform: String,
    pub category: String,
    pub sales_agent: String,
    pub slot: SlotKey,
    pub members: Vec<MemberSpec>,
    pub notes: Option<String>,
}

/// Short human-readable code agents quote on the phone. The tail of the
/// ULID is random enough at this scale.
fn short_code(prefix: &str, id: Ulid) -> String {
    let s = id.to_string();
    format!("{prefix}-{}", &s[s.len() - 6..])
}

impl Engine {
    /// Round-robin candidate selection: among teachers of `category` with
    /// the requested cell open, prefer the least-recently-assigned, ties
    /// broken by id ascending so the choice is deterministic.
    async fn pick_candidate(&self, category: &str, key: SlotKey, exclude: &[Ulid]) -> Option<Ulid> {
        // Snapshot the Arcs first; a DashMap guard must not be held across
        // the lock awaits below.
        let candidates: Vec<SharedTeacher> =
            self.teachers.iter().map(|e| e.value().clone()).collect();
        let mut best: Option<(u64, Ulid)> = None;
        for teacher in candidates {
            let guard = teacher.read().await;
            if exclude.contains(&guard.id) || guard.category != category || !guard.slot_open(&key) {
                continue;
            }
            let rank = (guard.last_assigned_seq, guard.id);
            if best.is_none_or(|b| rank < b) {
                best = Some(rank);
            }
        }
        best.map(|(_, id)| id)
    }

    /// Reserve the requested cell on a round-robin teacher. The
    /// reservation is in-memory only: the caller commits it as part of
    /// its booking event, and rolls it back if the commit fails. A lost
    /// reservation race excludes that teacher and re-runs selection, up
    /// to the retry bound.
    async fn assign_and_reserve(
        &self,
        category: &str,
        key: SlotKey,
        occupant: Occupant,
    ) -> Result<Ulid, EngineError> {
        let mut excluded: Vec<Ulid> = Vec::new();
        for attempt in 0..MAX_ASSIGN_RETRIES {
            let Some(teacher_id) = self.pick_candidate(category, key, &excluded).await else {
                break;
            };
            match self.reserve_slot_local(teacher_id, key, occupant).await {
                Ok(()) => {
                    let seq = self.next_assign_seq();
                    if let Some(teacher) = self.get_teacher(&teacher_id) {
                        teacher.write().await.last_assigned_seq = seq;
                    }
                    return Ok(teacher_id);
                }
                Err(
                    EngineError::SlotConflict { .. } | EngineError::SlotUnavailable { .. },
                ) => {
                    tracing::debug!(
                        teacher = %teacher_id,
                        %key,
                        attempt,
                        "assignment lost reservation race, retrying"
                    );
                    metrics::counter!(crate::observability::ASSIGN_RETRIES_TOTAL).increment(1);
                    excluded.push(teacher_id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::NoCandidate {
            category: category.to_string(),
        })
    }

    /// Book a trial for one student: pick a teacher, reserve the slot,
    /// create the record and its first session occurrence.
    pub async fn book_trial(&self, req: TrialRequest) -> Result<TrialRecord, EngineError> {
        if self.trials.len() >= MAX_TRIALS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many trials"));
        }
        if req.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if req.category.len() > MAX_CATEGORY_LEN {
            return Err(EngineError::LimitExceeded("category too long"));
        }
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let id = Ulid::new();
        let occupant = Occupant::Student(id);
        let teacher_id = self.assign_and_reserve(&req.category, req.slot, occupant).await?;

        let trial = TrialRecord {
            id,
            code: short_code("TR", id),
            name: req.name,
            age: req.age,
            phone: req.phone,
            country: req.country,
            platform: req.platform,
            category: req.category,
            teacher_id,
            sales_agent: req.sales_agent,
            supervisor: req.supervisor,
            trial_date: Some(req.slot.date),
            trial_time: Some(req.slot.time),
            status: TrialStatus::Pending,
            notes: req.notes,
            family_id: None,
        };
        let session_id = Ulid::new();
        let event = Event::TrialBooked {
            trial: trial.clone(),
            session_id,
        };
        // One commit for the whole booking; the reservation travels inside
        // the event. Until it lands the cell is only held in memory, so on
        // failure it goes back on the market.
        if let Err(e) = self.wal_append(&event).await {
            let _ = self.free_slot_local(teacher_id, req.slot).await;
            return Err(e);
        }
        self.trials.insert(
            id,
            std::sync::Arc::new(tokio::sync::RwLock::new(trial.clone())),
        );
        self.index_session(SessionOccurrence::scheduled(session_id, occupant, 1, req.slot));
        self.notify.send(id, &event);
        self.notify.send(teacher_id, &event);
        Ok(trial)
    }

    /// Book a family trial: one reservation, one group record, one member
    /// record per sibling, one shared session occurrence.
    pub async fn book_family(&self, req: FamilyRequest) -> Result<FamilyGroup, EngineError> {
        if req.members.is_empty() {
            return Err(EngineError::LimitExceeded("family has no members"));
        }
        if req.members.len() > MAX_FAMILY_MEMBERS {
            return Err(EngineError::LimitExceeded("too many family members"));
        }
        if self.trials.len() + req.members.len() > MAX_TRIALS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many trials"));
        }
        if req.parent_name.len() > MAX_NAME_LEN
            || req.members.iter().any(|m| m.name.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if req.category.len() > MAX_CATEGORY_LEN {
            return Err(EngineError::LimitExceeded("category too long"));
        }
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        for member in &req.members {
            if self.trials.contains_key(&member.id) {
                return Err(EngineError::AlreadyExists(member.id));
            }
        }

        let family_id = Ulid::new();
        let occupant = Occupant::Family(family_id);
        let teacher_id = self.assign_and_reserve(&req.category, req.slot, occupant).await?;

        let member_ids: Vec<Ulid> = req.members.iter().map(|m| m.id).collect();
        let members: Vec<TrialRecord> = req
            .members
            .iter()
            .map(|m| TrialRecord {
                id: m.id,
                code: short_code("FM", m.id),
                name: m.name.clone(),
                age: m.age,
                phone: req.phone.clone(),
                country: req.country.clone(),
                platform: req.platform.clone(),
                category: req.category.clone(),
                teacher_id,
                sales_agent: req.sales_agent.clone(),
                supervisor: None,
                trial_date: Some(req.slot.date),
                trial_time: Some(req.slot.time),
                status: TrialStatus::Pending,
                notes: None,
                family_id: Some(family_id),
            })
            .collect();
        let group = FamilyGroup {
            id: family_id,
            code: short_code("FM", family_id),
            parent_name: req.parent_name,
            phone: req.phone,
            country: req.country,
            platform: req.platform,
            category: req.category,
            teacher_id,
            sales_agent: req.sales_agent,
            trial_date: Some(req.slot.date),
            trial_time: Some(req.slot.time),
            status: TrialStatus::Pending,
            member_ids,
            notes: req.notes,
        };
        let session_id = Ulid::new();
        let event = Event::FamilyBooked {
            group: group.clone(),
            members: members.clone(),
            session_id,
        };
        if let Err(e) = self.wal_append(&event).await {
            let _ = self.free_slot_local(teacher_id, req.slot).await;
            return Err(e);
        }
        for member in members {
            self.trials.insert(
                member.id,
                std::sync::Arc::new(tokio::sync::RwLock::new(member)),
            );
        }
        self.families.insert(
            family_id,
            std::sync::Arc::new(tokio::sync::RwLock::new(group.clone())),
        );
        self.index_session(SessionOccurrence::scheduled(session_id, occupant, 1, req.slot));
        self.notify.send(family_id, &event);
        self.notify.send(teacher_id, &event);
        Ok(group)
    }
}
