use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

use TrialStatus::*;

/// Is (from, to) in the lifecycle table at all, for any role?
pub fn transition_defined(from: TrialStatus, to: TrialStatus) -> bool {
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Confirmed, TrialCompleted)
            | (Confirmed, TrialGhosted)
            | (TrialCompleted, AwaitingPayment)
            | (TrialCompleted, Dropped)
            | (TrialGhosted, AwaitingPayment)
            | (TrialGhosted, Dropped)
            | (AwaitingPayment, Paid)
            | (AwaitingPayment, Dropped)
            | (AwaitingPayment, TrialCompleted) // revert
            | (Paid, Active)
            | (Active, Expired)
            | (Active, Cancelled)
            | (Expired, AwaitingPayment) // renewal
            | (Pending, Cancelled)
            | (Confirmed, Cancelled)
    )
}

/// Role gating for a defined transition. Exhaustive over `Role` so adding
/// a role forces this table to be revisited.
pub fn transition_allowed(role: Role, from: TrialStatus, to: TrialStatus) -> bool {
    if !transition_defined(from, to) {
        return false;
    }
    match (from, to) {
        (Pending, Confirmed) | (Confirmed, TrialCompleted) | (Confirmed, TrialGhosted) => {
            match role {
                Role::Teacher | Role::Admin => true,
                Role::Sales | Role::Supervisor => false,
            }
        }
        (TrialCompleted, AwaitingPayment)
        | (TrialCompleted, Dropped)
        | (TrialGhosted, AwaitingPayment)
        | (TrialGhosted, Dropped)
        | (AwaitingPayment, Paid)
        | (AwaitingPayment, Dropped)
        | (AwaitingPayment, TrialCompleted)
        | (Paid, Active)
        | (Expired, AwaitingPayment) => match role {
            Role::Sales | Role::Admin => true,
            Role::Teacher | Role::Supervisor => false,
        },
        (Active, Expired) | (Active, Cancelled) | (Pending, Cancelled) | (Confirmed, Cancelled) => {
            matches!(role, Role::Admin)
        }
        _ => false,
    }
}

/// Transitions the UI must confirm with the acting user before invoking
/// the mutation. Purely advisory here — the engine never checks it.
pub fn requires_confirmation(from: TrialStatus, to: TrialStatus) -> bool {
    matches!((from, to), (Confirmed, TrialCompleted) | (Confirmed, TrialGhosted))
}

fn check_transition(role: Role, from: TrialStatus, to: TrialStatus) -> Result<(), EngineError> {
    if !transition_defined(from, to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    if !transition_allowed(role, from, to) {
        return Err(EngineError::PermissionDenied { role, from, to });
    }
    Ok(())
}

/// Outcomes the notification/reporting collaborators care about.
fn notify_worthy(to: TrialStatus) -> bool {
    matches!(to, TrialCompleted | TrialGhosted | Paid)
}

impl Engine {
    /// Move an individual trial to `to`. Family members cannot be moved
    /// here — their status is derived from the group.
    pub async fn change_status(
        &self,
        role: Role,
        trial_id: Ulid,
        to: TrialStatus,
    ) -> Result<(), EngineError> {
        let trial = self.get_trial(&trial_id).ok_or(EngineError::NotFound(trial_id))?;
        let mut guard = trial.write().await;
        if guard.family_id.is_some() {
            return Err(EngineError::PartOfFamily(trial_id));
        }
        let from = guard.status;
        check_transition(role, from, to)?;

        let event = Event::StatusChanged {
            occupant: Occupant::Student(trial_id),
            from,
            to,
        };
        self.wal_append(&event).await?;
        guard.status = to;
        if notify_worthy(to) {
            self.notify.send(trial_id, &event);
        }
        Ok(())
    }

    /// Move a family group and every member to `to` as one unit. All
    /// member locks are held (in sorted id order) across the WAL commit so
    /// no reader can observe some members updated and others not.
    pub async fn change_family_status(
        &self,
        role: Role,
        family_id: Ulid,
        to: TrialStatus,
    ) -> Result<(), EngineError> {
        let family = self.get_family(&family_id).ok_or(EngineError::NotFound(family_id))?;
        let mut group = family.write().await;
        let from = group.status;
        check_transition(role, from, to)?;

        let mut member_ids = group.member_ids.clone();
        member_ids.sort();
        let mut member_guards = Vec::with_capacity(member_ids.len());
        for mid in &member_ids {
            let member = self.get_trial(mid).ok_or(EngineError::NotFound(*mid))?;
            member_guards.push(member.write_owned().await);
        }

        let event = Event::StatusChanged {
            occupant: Occupant::Family(family_id),
            from,
            to,
        };
        self.wal_append(&event).await?;
        group.status = to;
        for member in &mut member_guards {
            member.status = to;
        }
        if notify_worthy(to) {
            self.notify.send(family_id, &event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;

    const ALL: [TrialStatus; 10] = [
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
    ];

    #[test]
    fn closure_exactly_sixteen_edges() {
        let mut defined = 0;
        for from in ALL {
            for to in ALL {
                if transition_defined(from, to) {
                    defined += 1;
                }
            }
        }
        assert_eq!(defined, 16);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for to in ALL {
            assert!(!transition_defined(Cancelled, to));
            assert!(!transition_defined(Dropped, to));
        }
    }

    #[test]
    fn expired_reenters_via_awaiting_payment_only() {
        for to in ALL {
            assert_eq!(transition_defined(Expired, to), to == AwaitingPayment);
        }
    }

    #[test]
    fn self_transitions_never_defined() {
        for s in ALL {
            assert!(!transition_defined(s, s));
        }
    }

    #[test]
    fn teacher_confirms_sales_does_not() {
        assert!(transition_allowed(Role::Teacher, Pending, Confirmed));
        assert!(transition_allowed(Role::Admin, Pending, Confirmed));
        assert!(!transition_allowed(Role::Sales, Pending, Confirmed));
        assert!(!transition_allowed(Role::Supervisor, Pending, Confirmed));
    }

    #[test]
    fn sales_owns_payment_pipeline() {
        assert!(transition_allowed(Role::Sales, TrialCompleted, AwaitingPayment));
        assert!(transition_allowed(Role::Sales, AwaitingPayment, Paid));
        assert!(transition_allowed(Role::Sales, Paid, Active));
        assert!(!transition_allowed(Role::Teacher, AwaitingPayment, Paid));
    }

    #[test]
    fn cancellation_is_admin_only() {
        assert!(transition_allowed(Role::Admin, Pending, Cancelled));
        assert!(transition_allowed(Role::Admin, Active, Cancelled));
        assert!(!transition_allowed(Role::Sales, Pending, Cancelled));
        assert!(!transition_allowed(Role::Teacher, Active, Cancelled));
    }

    #[test]
    fn awaiting_payment_can_revert_to_trial_completed() {
        assert!(transition_allowed(Role::Sales, AwaitingPayment, TrialCompleted));
    }

    #[test]
    fn supervisor_holds_no_transitions() {
        for from in ALL {
            for to in ALL {
                assert!(!transition_allowed(Role::Supervisor, from, to));
            }
        }
    }

    #[test]
    fn undefined_pair_denied_for_every_role() {
        // pending → trial-completed skips confirmed
        for role in [Role::Teacher, Role::Sales, Role::Admin, Role::Supervisor] {
            assert!(!transition_allowed(role, Pending, TrialCompleted));
        }
    }

    #[test]
    fn confirmation_prompt_only_for_trial_outcomes() {
        assert!(requires_confirmation(Confirmed, TrialCompleted));
        assert!(requires_confirmation(Confirmed, TrialGhosted));
        assert!(!requires_confirmation(Pending, Confirmed));
        assert!(!requires_confirmation(AwaitingPayment, Paid));
    }
}
