//! Hard bounds. Everything user-supplied is checked against one of these
//! before it reaches the WAL.

pub const MAX_TEACHERS_PER_TENANT: usize = 10_000;
pub const MAX_SLOTS_PER_TEACHER: usize = 50_000;
pub const MAX_TRIALS_PER_TENANT: usize = 500_000;
pub const MAX_SESSIONS_PER_STUDENT: usize = 10_000;
pub const MAX_FAMILY_MEMBERS: usize = 12;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CATEGORY_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_SESSION_MINUTES: u32 = 24 * 60;

/// How many times the assigner re-runs candidate selection after losing
/// a reservation race before giving up with NoCandidate.
pub const MAX_ASSIGN_RETRIES: usize = 3;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;
