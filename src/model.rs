use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — used for completion timestamps.
pub type Ms = i64;

/// One bookable cell in a teacher's calendar: a (date, time-of-day) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl SlotKey {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self { date, time }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.date, self.time.format("%H:%M"))
    }
}

/// Who holds a reservation: an individual student or a family group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Occupant {
    Student(Ulid),
    Family(Ulid),
}

impl Occupant {
    pub fn id(&self) -> Ulid {
        match self {
            Occupant::Student(id) | Occupant::Family(id) => *id,
        }
    }

    pub fn is_family(&self) -> bool {
        matches!(self, Occupant::Family(_))
    }
}

/// Actor role supplied by the authentication layer. Closed set — the
/// transition table matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Teacher,
    Sales,
    Admin,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Sales => "sales",
            Role::Admin => "admin",
            Role::Supervisor => "supervisor",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "teacher" => Ok(Role::Teacher),
            "sales" => Ok(Role::Sales),
            "admin" => Ok(Role::Admin),
            "supervisor" => Ok(Role::Supervisor),
            _ => Err(()),
        }
    }
}

/// Trial/student lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Confirmed,
    TrialCompleted,
    TrialGhosted,
    AwaitingPayment,
    Paid,
    Active,
    Expired,
    Cancelled,
    Dropped,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Pending => "pending",
            TrialStatus::Confirmed => "confirmed",
            TrialStatus::TrialCompleted => "trial-completed",
            TrialStatus::TrialGhosted => "trial-ghosted",
            TrialStatus::AwaitingPayment => "awaiting-payment",
            TrialStatus::Paid => "paid",
            TrialStatus::Active => "active",
            TrialStatus::Expired => "expired",
            TrialStatus::Cancelled => "cancelled",
            TrialStatus::Dropped => "dropped",
        }
    }
}

impl FromStr for TrialStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "pending" => Ok(TrialStatus::Pending),
            "confirmed" => Ok(TrialStatus::Confirmed),
            "trial-completed" => Ok(TrialStatus::TrialCompleted),
            "trial-ghosted" => Ok(TrialStatus::TrialGhosted),
            "awaiting-payment" => Ok(TrialStatus::AwaitingPayment),
            "paid" => Ok(TrialStatus::Paid),
            "active" => Ok(TrialStatus::Active),
            "expired" => Ok(TrialStatus::Expired),
            "cancelled" => Ok(TrialStatus::Cancelled),
            "dropped" => Ok(TrialStatus::Dropped),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trial was moved. Closed set supplied by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescheduleReason {
    TrialCompletedByTeacher,
    ByStudentClient,
    ByTeacher,
    TechnicalIssue,
}

impl RescheduleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RescheduleReason::TrialCompletedByTeacher => "trial-completed-by-teacher",
            RescheduleReason::ByStudentClient => "by-student-client",
            RescheduleReason::ByTeacher => "by-teacher",
            RescheduleReason::TechnicalIssue => "technical-issue",
        }
    }
}

impl FromStr for RescheduleReason {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "trial-completed-by-teacher" => Ok(RescheduleReason::TrialCompletedByTeacher),
            "by-student-client" => Ok(RescheduleReason::ByStudentClient),
            "by-teacher" => Ok(RescheduleReason::ByTeacher),
            "technical-issue" => Ok(RescheduleReason::TechnicalIssue),
            _ => Err(()),
        }
    }
}

/// Booking state of one slot cell.
///
/// `booked == true` always implies `occupant.is_some()`; the slot store
/// maintains this, nothing else writes these fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    /// Teacher opted in for this cell.
    pub available: bool,
    pub booked: bool,
    pub occupant: Option<Occupant>,
}

impl SlotState {
    pub fn open() -> Self {
        Self {
            available: true,
            booked: false,
            occupant: None,
        }
    }
}

/// A teacher and their calendar. Slots are never removed, only toggled.
#[derive(Debug, Clone)]
pub struct TeacherState {
    pub id: Ulid,
    pub name: String,
    /// Qualification tag matched against booking requests.
    pub category: String,
    pub slots: BTreeMap<SlotKey, SlotState>,
    /// Global assignment sequence number of this teacher's most recent
    /// assignment. Round-robin prefers the smallest value.
    pub last_assigned_seq: u64,
}

impl TeacherState {
    pub fn new(id: Ulid, name: String, category: String) -> Self {
        Self {
            id,
            name,
            category,
            slots: BTreeMap::new(),
            last_assigned_seq: 0,
        }
    }

    pub fn slot(&self, key: &SlotKey) -> Option<&SlotState> {
        self.slots.get(key)
    }

    /// True when the cell can accept a new reservation right now.
    pub fn slot_open(&self, key: &SlotKey) -> bool {
        self.slots
            .get(key)
            .is_some_and(|s| s.available && !s.booked)
    }
}

/// One individual student's trial record. When `family_id` is set the
/// record is a member whose schedule and status are derived from the
/// owning FamilyGroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Ulid,
    /// Human-readable code shown to agents.
    pub code: String,
    pub name: String,
    pub age: Option<u8>,
    pub phone: String,
    pub country: String,
    /// Videoconferencing choice.
    pub platform: String,
    pub category: String,
    pub teacher_id: Ulid,
    pub sales_agent: String,
    pub supervisor: Option<String>,
    pub trial_date: Option<NaiveDate>,
    pub trial_time: Option<NaiveTime>,
    pub status: TrialStatus,
    pub notes: Option<String>,
    pub family_id: Option<Ulid>,
}

/// Aggregate root for siblings sharing one trial slot and one status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyGroup {
    pub id: Ulid,
    pub code: String,
    pub parent_name: String,
    pub phone: String,
    pub country: String,
    pub platform: String,
    pub category: String,
    pub teacher_id: Ulid,
    pub sales_agent: String,
    pub trial_date: Option<NaiveDate>,
    pub trial_time: Option<NaiveTime>,
    pub status: TrialStatus,
    pub member_ids: Vec<Ulid>,
    pub notes: Option<String>,
}

impl FamilyGroup {
    pub fn student_count(&self) -> usize {
        self.member_ids.len()
    }
}

/// One member of a family booking request. The `members` column of
/// `INSERT INTO families` is a JSON array of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub age: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// One scheduled meeting instance, trial or paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOccurrence {
    pub id: Ulid,
    pub occupant: Occupant,
    /// Ordinal within the student's package; 1 for the trial.
    pub session_number: u32,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub status: SessionStatus,
    pub reschedule_count: u32,
    /// First-ever values. Set by the first reschedule, then immutable.
    pub original_date: Option<NaiveDate>,
    pub original_time: Option<NaiveTime>,
    pub reschedule_reason: Option<RescheduleReason>,
    pub actual_minutes: Option<u32>,
    pub notes: Option<String>,
    pub completed_at: Option<Ms>,
}

impl SessionOccurrence {
    pub fn scheduled(id: Ulid, occupant: Occupant, session_number: u32, key: SlotKey) -> Self {
        Self {
            id,
            occupant,
            session_number,
            scheduled_date: key.date,
            scheduled_time: key.time,
            status: SessionStatus::Scheduled,
            reschedule_count: 0,
            original_date: None,
            original_time: None,
            reschedule_reason: None,
            actual_minutes: None,
            notes: None,
            completed_at: None,
        }
    }
}

/// The event types — this is the WAL record format. Composite operations
/// (booking, reschedule) are single events so replay never reconstructs a
/// half-applied unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TeacherRegistered {
        id: Ulid,
        name: String,
        category: String,
    },
    SlotPublished {
        teacher_id: Ulid,
        key: SlotKey,
    },
    SlotWithdrawn {
        teacher_id: Ulid,
        key: SlotKey,
    },
    SlotReserved {
        teacher_id: Ulid,
        key: SlotKey,
        occupant: Occupant,
    },
    SlotFreed {
        teacher_id: Ulid,
        key: SlotKey,
    },
    TrialBooked {
        trial: TrialRecord,
        session_id: Ulid,
    },
    FamilyBooked {
        group: FamilyGroup,
        members: Vec<TrialRecord>,
        session_id: Ulid,
    },
    StatusChanged {
        occupant: Occupant,
        from: TrialStatus,
        to: TrialStatus,
    },
    Rescheduled {
        occupant: Occupant,
        teacher_id: Ulid,
        old: Option<SlotKey>,
        new: SlotKey,
        reason: RescheduleReason,
        session_id: Ulid,
    },
    SessionAppended {
        session: SessionOccurrence,
    },
    SessionCompleted {
        id: Ulid,
        actual_minutes: u32,
        notes: Option<String>,
        completed_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherInfo {
    pub id: Ulid,
    pub name: String,
    pub category: String,
}

/// One row of `list_available`: an opted-in slot, booked or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub time: NaiveTime,
    pub booked: bool,
    pub occupant: Option<Occupant>,
}
