//! The report status state machine, as one pure table.
//!
//! Automatic transitions (engine-driven) leave `PendingVerification` for one
//! of the four decision statuses. Everything after that is moderator or
//! citizen driven and merely validated here: the engine exposes the
//! primitives but never triggers them on its own.

use civicwatch_common::ReportStatus;

/// Whether `from -> to` is a legal transition, automatic or manual.
pub fn transition_allowed(from: ReportStatus, to: ReportStatus) -> bool {
    use ReportStatus::*;
    matches!(
        (from, to),
        // Automatic decisions.
        (PendingVerification, Verified | Rejected | Duplicate | Flagged)
            // Flag review: a moderator resolves the flag either way.
            | (Flagged, Verified | Rejected)
            // Work lifecycle.
            | (Verified, InProgress | Resolved)
            | (InProgress, Resolved)
            // Citizen confirmation or dispute.
            | (Resolved, Closed | InProgress)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicwatch_common::ReportStatus::*;

    const ALL: [ReportStatus; 8] = [
        PendingVerification,
        Verified,
        Rejected,
        Duplicate,
        Flagged,
        InProgress,
        Resolved,
        Closed,
    ];

    #[test]
    fn every_decision_status_is_reachable_from_pending() {
        for to in ALL {
            if to.is_decision() {
                assert!(transition_allowed(PendingVerification, to), "pending -> {to}");
            }
        }
    }

    #[test]
    fn decision_statuses_only_from_pending() {
        for from in ALL {
            if from == PendingVerification {
                continue;
            }
            assert!(!transition_allowed(from, Duplicate), "{from} -> duplicate");
            assert!(!transition_allowed(from, PendingVerification), "{from} -> pending");
        }
    }

    #[test]
    fn resolved_only_reachable_from_verified_or_in_progress() {
        for from in ALL {
            let allowed = transition_allowed(from, Resolved);
            assert_eq!(
                allowed,
                matches!(from, Verified | InProgress),
                "{from} -> resolved"
            );
        }
    }

    #[test]
    fn closed_only_from_resolved() {
        for from in ALL {
            assert_eq!(transition_allowed(from, Closed), from == Resolved, "{from} -> closed");
        }
    }

    #[test]
    fn reopen_path() {
        assert!(transition_allowed(Resolved, InProgress));
        assert!(!transition_allowed(Closed, InProgress));
        assert!(!transition_allowed(Closed, Resolved));
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for to in ALL {
            assert!(!transition_allowed(Rejected, to), "rejected -> {to}");
            assert!(!transition_allowed(Duplicate, to), "duplicate -> {to}");
            assert!(!transition_allowed(Closed, to), "closed -> {to}");
        }
    }
}
