//! Lifecycle rules: automatic expiration and the human transitions.

use aot_core::{Attribution, FieldChange, FieldValue, Opportunity, OpportunityState, Tracked, TrackedField};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleDecision {
    Unchanged,
    /// Past due with no human override: move New to Expired.
    Expire,
    /// Past due but a human decision protects the state; note only. Raised once
    /// per closing date.
    ProtectedPastDue,
}

/// Decide the automatic transition for `record` on `run_date`.
pub fn evaluate(record: &Opportunity, run_date: NaiveDate) -> LifecycleDecision {
    if !record.is_past_due(run_date) {
        return LifecycleDecision::Unchanged;
    }
    if record.has_state_override() {
        if record.state.value == OpportunityState::Expired || record.past_due_noted == record.closing_date.value {
            LifecycleDecision::Unchanged
        } else {
            LifecycleDecision::ProtectedPastDue
        }
    } else if record.state.value == OpportunityState::New {
        LifecycleDecision::Expire
    } else {
        LifecycleDecision::Unchanged
    }
}

/// Remember that the current past closing date has been reported.
pub fn mark_past_due_noted(record: &mut Opportunity, run_date: NaiveDate) -> FieldChange {
    let before = record.past_due_noted.map(|d| d.render());
    record.past_due_noted = record.closing_date.value;
    FieldChange {
        field: TrackedField::PastDueNotice,
        before,
        after: record.past_due_noted.map(|d| d.render()),
        attribution: Attribution::engine(run_date),
    }
}

/// Set `state` by automation and return the audit entry.
pub fn expire(record: &mut Opportunity, run_date: NaiveDate) -> FieldChange {
    let before = record.state.value;
    record.state = Tracked::new(OpportunityState::Expired, Attribution::engine(run_date));
    FieldChange {
        field: TrackedField::State,
        before: Some(before.render()),
        after: Some(OpportunityState::Expired.render()),
        attribution: Attribution::engine(run_date),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("`{current}` is terminal; no further transitions are allowed")]
    Terminal { current: &'static str },
    #[error("a human edit cannot set state `{target}`; use reopen to return an expired record to new")]
    TargetNotAllowed { target: &'static str },
    #[error("only expired records can be reopened (current state `{current}`)")]
    NotExpired { current: &'static str },
}

/// Human edit of `state`. Sets the override so automation leaves it alone.
/// Returns `None` when the record already holds `target`.
pub fn human_transition(
    record: &mut Opportunity,
    target: OpportunityState,
    run_date: NaiveDate,
) -> Result<Option<FieldChange>, TransitionError> {
    let current = record.state.value;
    if !matches!(
        target,
        OpportunityState::Applied | OpportunityState::InProgress | OpportunityState::Discarded
    ) {
        return Err(TransitionError::TargetNotAllowed {
            target: target.as_str(),
        });
    }
    if current == target {
        return Ok(None);
    }
    if current == OpportunityState::Discarded {
        return Err(TransitionError::Terminal {
            current: current.as_str(),
        });
    }

    record.state = Tracked::new(target, Attribution::human(run_date));
    Ok(Some(FieldChange {
        field: TrackedField::State,
        before: Some(current.render()),
        after: Some(target.render()),
        attribution: Attribution::human(run_date),
    }))
}

/// Human reopen: Expired back to New with the state override cleared, so the
/// record can expire again if its closing date is still past on a later run.
pub fn reopen(
    record: &mut Opportunity,
    closing_date: Option<NaiveDate>,
    run_date: NaiveDate,
) -> Result<Vec<FieldChange>, TransitionError> {
    if record.state.value != OpportunityState::Expired {
        return Err(TransitionError::NotExpired {
            current: record.state.value.as_str(),
        });
    }

    let mut changes = vec![FieldChange {
        field: TrackedField::State,
        before: Some(OpportunityState::Expired.render()),
        after: Some(OpportunityState::New.render()),
        attribution: Attribution::human(run_date),
    }];
    record.state = Tracked::new(OpportunityState::New, Attribution::engine(run_date));

    if let Some(date) = closing_date {
        let before = record.closing_date.value.as_ref().map(FieldValue::render);
        record.closing_date = aot_core::Field::with_value(date, Attribution::human(run_date));
        changes.push(FieldChange {
            field: TrackedField::ClosingDate,
            before,
            after: Some(date.render()),
            attribution: Attribution::human(run_date),
        });
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aot_core::{Field, RelevanceTier};
    use std::collections::BTreeSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(closing: Option<NaiveDate>, state: Tracked<OpportunityState>) -> Opportunity {
        let seen = date(2023, 12, 1);
        Opportunity {
            name: "Beca de investigación".into(),
            entity: "Minciencias".into(),
            description: Field::empty(),
            category: Field::empty(),
            areas: BTreeSet::new(),
            opening_date: Field::empty(),
            closing_date: Field::from_option(closing, Attribution::automated("minciencias", seen)),
            amount: Field::empty(),
            source_url: Field::empty(),
            requirements: Field::empty(),
            required_documents: Field::empty(),
            notes: Field::empty(),
            source_portals: BTreeSet::from(["minciencias".to_string()]),
            relevance: RelevanceTier::Low,
            state,
            first_seen: seen,
            last_seen: seen,
            past_due_noted: None,
        }
    }

    fn automated(state: OpportunityState) -> Tracked<OpportunityState> {
        Tracked::new(state, Attribution::engine(date(2023, 12, 1)))
    }

    #[test]
    fn past_due_new_record_expires() {
        let r = record(Some(date(2024, 1, 1)), automated(OpportunityState::New));
        assert_eq!(evaluate(&r, date(2024, 2, 1)), LifecycleDecision::Expire);
        assert_eq!(evaluate(&r, date(2024, 1, 1)), LifecycleDecision::Unchanged);
    }

    #[test]
    fn unknown_closing_date_never_expires() {
        let r = record(None, automated(OpportunityState::New));
        assert_eq!(evaluate(&r, date(2030, 1, 1)), LifecycleDecision::Unchanged);
    }

    #[test]
    fn override_protects_state_but_notes_past_due() {
        let r = record(
            Some(date(2024, 1, 1)),
            Tracked::new(OpportunityState::Applied, Attribution::human(date(2023, 12, 10))),
        );
        assert_eq!(evaluate(&r, date(2024, 2, 1)), LifecycleDecision::ProtectedPastDue);
    }

    #[test]
    fn protected_past_due_is_reported_once_per_closing_date() {
        let mut r = record(
            Some(date(2024, 1, 1)),
            Tracked::new(OpportunityState::Applied, Attribution::human(date(2023, 12, 10))),
        );
        let change = mark_past_due_noted(&mut r, date(2024, 2, 1));
        assert_eq!(change.after.as_deref(), Some("2024-01-01"));
        assert_eq!(evaluate(&r, date(2024, 3, 1)), LifecycleDecision::Unchanged);
        assert_eq!(evaluate(&r, date(2024, 6, 1)), LifecycleDecision::Unchanged);

        r.closing_date = Field::with_value(date(2024, 1, 20), Attribution::automated("minciencias", date(2024, 6, 1)));
        assert_eq!(evaluate(&r, date(2024, 6, 1)), LifecycleDecision::ProtectedPastDue);
    }

    #[test]
    fn discarded_is_terminal() {
        let mut r = record(None, Tracked::new(OpportunityState::Discarded, Attribution::human(date(2024, 1, 1))));
        let err = human_transition(&mut r, OpportunityState::Applied, date(2024, 2, 1)).unwrap_err();
        assert!(matches!(err, TransitionError::Terminal { .. }));
        assert_eq!(human_transition(&mut r, OpportunityState::Discarded, date(2024, 2, 1)), Ok(None));
    }

    #[test]
    fn human_transition_sets_override() {
        let mut r = record(None, automated(OpportunityState::Expired));
        let change = human_transition(&mut r, OpportunityState::Applied, date(2024, 2, 1))
            .unwrap()
            .unwrap();
        assert_eq!(change.before.as_deref(), Some("expired"));
        assert_eq!(change.after.as_deref(), Some("applied"));
        assert!(r.has_state_override());
        assert!(human_transition(&mut r, OpportunityState::New, date(2024, 2, 1)).is_err());
    }

    #[test]
    fn reopen_clears_override_and_records_closing_date() {
        let mut r = record(
            Some(date(2024, 1, 1)),
            Tracked::new(OpportunityState::Expired, Attribution::engine(date(2024, 2, 1))),
        );
        let changes = reopen(&mut r, Some(date(2024, 6, 30)), date(2024, 2, 5)).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(r.state.value, OpportunityState::New);
        assert!(!r.has_state_override());
        assert!(r.closing_date.is_human_override());
        assert_eq!(evaluate(&r, date(2024, 3, 1)), LifecycleDecision::Unchanged);
        assert_eq!(evaluate(&r, date(2024, 7, 1)), LifecycleDecision::Expire);

        assert!(matches!(
            reopen(&mut r, None, date(2024, 3, 1)),
            Err(TransitionError::NotExpired { current: "new" })
        ));
    }
}
