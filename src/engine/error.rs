use ulid::Ulid;

use crate::model::{Role, SlotKey, TrialStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Reservation lost to another caller: the slot is already booked.
    SlotConflict {
        teacher_id: Ulid,
        key: SlotKey,
    },
    /// Reschedule target is missing, withdrawn or booked by someone else.
    SlotUnavailable {
        teacher_id: Ulid,
        key: SlotKey,
    },
    /// Reschedule onto the slot the trial already occupies.
    Unchanged(SlotKey),
    /// (from, to) pair not present in the transition table.
    InvalidTransition {
        from: TrialStatus,
        to: TrialStatus,
    },
    /// Transition exists but this role may not perform it.
    PermissionDenied {
        role: Role,
        from: TrialStatus,
        to: TrialStatus,
    },
    /// No qualified teacher with an open slot, retries exhausted.
    NoCandidate {
        category: String,
    },
    /// A family member cannot be mutated individually.
    PartOfFamily(Ulid),
    /// A compensating action failed after a partial slot swap; the
    /// record needs manual reconciliation.
    Inconsistent {
        occupant: Ulid,
        detail: String,
    },
    AlreadyCompleted(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotConflict { teacher_id, key } => {
                write!(f, "slot conflict: teacher {teacher_id} at {key} is already booked")
            }
            EngineError::SlotUnavailable { teacher_id, key } => {
                write!(f, "slot unavailable: teacher {teacher_id} at {key}")
            }
            EngineError::Unchanged(key) => {
                write!(f, "reschedule unchanged: trial already occupies {key}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::PermissionDenied { role, from, to } => {
                write!(f, "permission denied: {} may not move {from} -> {to}", role.as_str())
            }
            EngineError::NoCandidate { category } => {
                write!(f, "no qualified teacher with an open slot for category: {category}")
            }
            EngineError::PartOfFamily(id) => {
                write!(f, "record {id} belongs to a family group; mutate the group instead")
            }
            EngineError::Inconsistent { occupant, detail } => {
                write!(f, "inconsistent state for {occupant}, manual reconciliation required: {detail}")
            }
            EngineError::AlreadyCompleted(id) => write!(f, "session already completed: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
