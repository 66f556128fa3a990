//! Write-once rules for journal records.
//!
//! Shared by every journal backend so the in-memory and filesystem stores
//! accept exactly the same transitions.

use crate::core::types::{EffectRecord, EffectStatus, RunId};
use crate::error::{OrchestratorError, Result};

/// Validate replacing `existing` with `next` for the same `(run_id, effect_id)`.
///
/// Accepted: a fresh record in any status, `pending -> pending` (attempt
/// bookkeeping) and `pending -> completed|failed`. A settled record is never
/// overwritten.
pub fn check_put(run_id: &RunId, existing: Option<&EffectRecord>, next: &EffectRecord) -> Result<()> {
    if next.effect_id.ordinal() != next.ordinal {
        return Err(OrchestratorError::InvalidState(format!(
            "effect id {} does not match ordinal {}",
            next.effect_id, next.ordinal
        )));
    }
    let Some(existing) = existing else {
        return Ok(());
    };
    if existing.status.is_settled() {
        return Err(OrchestratorError::AlreadySettled {
            run_id: run_id.clone(),
            effect_id: existing.effect_id.clone(),
            status: existing.status,
        });
    }
    if existing.kind != next.kind || existing.fingerprint != next.fingerprint {
        return Err(OrchestratorError::InvalidState(format!(
            "effect {} in run {run_id} cannot change its request",
            existing.effect_id
        )));
    }
    Ok(())
}

/// Move a failed record back to pending, keeping its error in the history.
pub fn reopen(run_id: &RunId, record: &mut EffectRecord) -> Result<()> {
    if record.status != EffectStatus::Failed {
        return Err(OrchestratorError::InvalidState(format!(
            "effect {} in run {run_id} is {}, only failed effects can be reopened",
            record.effect_id, record.status
        )));
    }
    if let Some(error) = record.error.take() {
        record.failure_history.push(error);
    }
    record.status = EffectStatus::Pending;
    record.attempts = 0;
    record.settled_at = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EffectKind;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn pending() -> EffectRecord {
        EffectRecord::pending(
            1,
            EffectKind::Task {
                task: "A".to_string(),
            },
            json!({"x": 5}),
            "fp".to_string(),
            DateTime::<Utc>::UNIX_EPOCH,
        )
    }

    #[test]
    fn pending_may_settle() {
        let run_id = RunId::from("run-1");
        let existing = pending();
        let mut next = existing.clone();
        next.complete(json!({"y": 10}), DateTime::<Utc>::UNIX_EPOCH);
        check_put(&run_id, Some(&existing), &next).expect("settle");
        check_put(&run_id, None, &next).expect("fresh completed");
    }

    #[test]
    fn settled_records_are_write_once() {
        let run_id = RunId::from("run-1");
        let mut settled = pending();
        settled.fail("boom".to_string(), DateTime::<Utc>::UNIX_EPOCH);
        let mut next = settled.clone();
        next.complete(json!({"y": 10}), DateTime::<Utc>::UNIX_EPOCH);

        let err = check_put(&run_id, Some(&settled), &next).expect_err("write once");
        assert!(matches!(
            err,
            OrchestratorError::AlreadySettled {
                status: EffectStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn pending_record_cannot_change_request() {
        let run_id = RunId::from("run-1");
        let existing = pending();
        let mut next = existing.clone();
        next.fingerprint = "other".to_string();
        assert!(check_put(&run_id, Some(&existing), &next).is_err());
    }

    #[test]
    fn reopen_keeps_history_and_resets_budget() {
        let run_id = RunId::from("run-1");
        let mut record = pending();
        record.attempts = 3;
        record.fail("boom".to_string(), DateTime::<Utc>::UNIX_EPOCH);

        reopen(&run_id, &mut record).expect("reopen");
        assert_eq!(record.status, EffectStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.failure_history, vec!["boom".to_string()]);
        assert!(reopen(&run_id, &mut record).is_err());
    }
}
