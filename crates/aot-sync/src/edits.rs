//! Human edits applied through the CLI.

use aot_core::{
    Attribution, Field, FieldChange, IdentityKey, KeyRejection, MergePlan, Opportunity, OpportunityState,
    RecordUpdate, TrackedField,
};
use chrono::NaiveDate;
use thiserror::Error;

use crate::lifecycle::{self, TransitionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanEdit {
    SetState {
        name: String,
        entity: String,
        state: OpportunityState,
        note: Option<String>,
    },
    Reopen {
        name: String,
        entity: String,
        closing_date: Option<NaiveDate>,
    },
}

impl HumanEdit {
    fn target(&self) -> (&str, &str) {
        match self {
            HumanEdit::SetState { name, entity, .. } | HumanEdit::Reopen { name, entity, .. } => (name.as_str(), entity.as_str()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error("invalid record identity: {0}")]
    InvalidKey(KeyRejection),
    #[error("no stored opportunity matches {0}")]
    NotFound(IdentityKey),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Turn a human edit into a single-record merge plan. An edit that changes
/// nothing yields an empty plan.
pub fn plan_edit(edit: &HumanEdit, records: &[Opportunity], run_date: NaiveDate) -> Result<MergePlan, EditError> {
    let (name, entity) = edit.target();
    let key = IdentityKey::new(name, entity).map_err(EditError::InvalidKey)?;
    let stored = records
        .iter()
        .find(|r| r.identity_key().ok().as_ref() == Some(&key))
        .ok_or_else(|| EditError::NotFound(key.clone()))?;

    let mut record = stored.clone();
    let mut changes: Vec<FieldChange> = Vec::new();
    match edit {
        HumanEdit::SetState { state, note, .. } => {
            changes.extend(lifecycle::human_transition(&mut record, *state, run_date)?);
            if let Some(note) = note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                changes.push(set_note(&mut record, note, run_date));
            }
        }
        HumanEdit::Reopen { closing_date, .. } => {
            changes.extend(lifecycle::reopen(&mut record, *closing_date, run_date)?);
        }
    }

    let mut plan = MergePlan::new(run_date);
    if !changes.is_empty() {
        plan.updates.push(RecordUpdate { key, record, changes });
    }
    Ok(plan)
}

fn set_note(record: &mut Opportunity, note: &str, run_date: NaiveDate) -> FieldChange {
    let before = record.notes.value.clone();
    let after = match &before {
        Some(existing) if !existing.is_empty() => format!("{existing}\n{run_date}: {note}"),
        _ => format!("{run_date}: {note}"),
    };
    record.notes = Field::with_value(after.clone(), Attribution::human(run_date));
    FieldChange {
        field: TrackedField::Notes,
        before,
        after: Some(after),
        attribution: Attribution::human(run_date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::consolidate::ConsolidationEngine;
    use aot_core::RawCandidate;
    use chrono::Utc;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn stored() -> Vec<Opportunity> {
        let engine = ConsolidationEngine::new(Arc::new(EngineConfig::default()));
        let candidate = RawCandidate::new("fulbright", "Beca Fulbright Doctorado", "Fulbright Colombia", Utc::now());
        engine.consolidate(vec![candidate], &[], date(2025, 3, 1)).plan.inserts
    }

    #[test]
    fn mark_applied_records_note_and_override() {
        let edit = HumanEdit::SetState {
            name: "beca fulbright doctorado".into(),
            entity: "FULBRIGHT COLOMBIA".into(),
            state: OpportunityState::Applied,
            note: Some("Enviada con carta del director".into()),
        };
        let plan = plan_edit(&edit, &stored(), date(2025, 3, 10)).unwrap();
        assert_eq!(plan.updates.len(), 1);
        let record = &plan.updates[0].record;
        assert_eq!(record.state.value, OpportunityState::Applied);
        assert!(record.has_state_override());
        assert_eq!(record.notes.value.as_deref(), Some("2025-03-10: Enviada con carta del director"));
    }

    #[test]
    fn unknown_record_is_reported() {
        let edit = HumanEdit::Reopen {
            name: "Otra beca".into(),
            entity: "DAAD".into(),
            closing_date: None,
        };
        assert!(matches!(plan_edit(&edit, &stored(), date(2025, 3, 10)), Err(EditError::NotFound(_))));
    }

    #[test]
    fn reopen_requires_expired() {
        let edit = HumanEdit::Reopen {
            name: "Beca Fulbright Doctorado".into(),
            entity: "Fulbright Colombia".into(),
            closing_date: None,
        };
        assert!(matches!(
            plan_edit(&edit, &stored(), date(2025, 3, 10)),
            Err(EditError::Transition(TransitionError::NotExpired { .. }))
        ));
    }
}
