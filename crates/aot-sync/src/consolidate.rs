//! Consolidation engine: same-run dedup, merge against the store, lifecycle.
//!
//! Matching is exact on the normalized identity key. Nothing here touches the
//! store; the output is a [`MergePlan`] the store applies all-or-nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use aot_core::{
    Amount, Attribution, Category, Field, FieldChange, FieldValue, IdentityKey, MergePlan, Opportunity,
    OpportunityState, RawCandidate, RecordUpdate, Tracked, TrackedField,
};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::lifecycle::{self, LifecycleDecision};
use crate::scoring::RelevanceScorer;

/// A value together with the source that supplied it.
#[derive(Debug, Clone, PartialEq)]
pub struct Picked<T> {
    pub value: T,
    pub source_id: String,
}

/// All candidates of one run that share an identity key, folded into one.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCandidate {
    pub key: IdentityKey,
    pub name: String,
    pub entity: String,
    pub description: Option<Picked<String>>,
    pub category: Option<Picked<Category>>,
    pub areas: BTreeSet<String>,
    pub source_url: Option<Picked<String>>,
    pub opening_date: Option<Picked<NaiveDate>>,
    pub closing_date: Option<Picked<NaiveDate>>,
    pub amount: Option<Picked<Amount>>,
    pub requirements: Option<Picked<String>>,
    pub required_documents: Option<Picked<String>>,
    pub sources: BTreeSet<String>,
    pub closed_hint: bool,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn pick_first<T>(slot: &mut Option<Picked<T>>, value: Option<T>, source_id: &str) {
    if slot.is_none() {
        if let Some(value) = value {
            *slot = Some(Picked {
                value,
                source_id: source_id.to_string(),
            });
        }
    }
}

impl MergedCandidate {
    fn from_raw(key: IdentityKey, raw: RawCandidate) -> Self {
        let mut merged = Self {
            key,
            name: raw.name.trim().to_string(),
            entity: raw.entity.trim().to_string(),
            description: None,
            category: None,
            areas: BTreeSet::new(),
            source_url: None,
            opening_date: None,
            closing_date: None,
            amount: None,
            requirements: None,
            required_documents: None,
            sources: BTreeSet::new(),
            closed_hint: false,
        };
        merged.absorb(raw);
        merged
    }

    /// Fold another candidate in: known beats unknown, the longer description wins.
    fn absorb(&mut self, raw: RawCandidate) {
        let source = raw.source_id.as_str();
        if let Some(description) = non_blank(raw.description) {
            let longer = self
                .description
                .as_ref()
                .map_or(true, |d| description.chars().count() > d.value.chars().count());
            if longer {
                self.description = Some(Picked {
                    value: description,
                    source_id: source.to_string(),
                });
            }
        }
        let category = (raw.category != Category::Other).then_some(raw.category);
        pick_first(&mut self.category, category, source);
        pick_first(&mut self.source_url, non_blank(raw.source_url), source);
        pick_first(&mut self.opening_date, raw.opening_date, source);
        pick_first(&mut self.closing_date, raw.closing_date, source);
        pick_first(&mut self.amount, raw.amount, source);
        pick_first(&mut self.requirements, non_blank(raw.requirements), source);
        pick_first(&mut self.required_documents, non_blank(raw.required_documents), source);
        self.areas
            .extend(raw.areas.into_iter().map(|a| a.trim().to_string()).filter(|a| !a.is_empty()));
        self.closed_hint |= raw.closed_hint;
        self.sources.insert(raw.source_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedCandidate {
    pub source_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleNote {
    pub key: String,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ConsolidationOutcome {
    pub plan: MergePlan,
    pub dropped: Vec<DroppedCandidate>,
    pub notes: Vec<LifecycleNote>,
    /// Candidates folded into another candidate of the same run.
    pub same_run_merges: usize,
    /// Records moved to Expired by this cycle.
    pub expired: Vec<IdentityKey>,
}

pub struct ConsolidationEngine {
    scorer: RelevanceScorer,
}

impl ConsolidationEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            scorer: RelevanceScorer::new(config),
        }
    }

    pub fn scorer(&self) -> &RelevanceScorer {
        &self.scorer
    }

    /// Group the run's candidates by identity key. Candidates without a usable
    /// key are dropped with a reason.
    pub fn dedup_candidates(
        &self,
        candidates: Vec<RawCandidate>,
    ) -> (Vec<MergedCandidate>, Vec<DroppedCandidate>, usize) {
        let mut groups: BTreeMap<IdentityKey, MergedCandidate> = BTreeMap::new();
        let mut dropped = Vec::new();
        let mut merges = 0;

        for raw in candidates {
            let key = match raw.identity_key() {
                Ok(key) => key,
                Err(reason) => {
                    warn!(source_id = %raw.source_id, name = %raw.name, %reason, "dropping malformed candidate");
                    dropped.push(DroppedCandidate {
                        source_id: raw.source_id,
                        name: raw.name,
                        reason: reason.to_string(),
                    });
                    continue;
                }
            };
            match groups.get_mut(&key) {
                Some(existing) => {
                    info!(key = %key, source_id = %raw.source_id, "merging same-run duplicate");
                    existing.absorb(raw);
                    merges += 1;
                }
                None => {
                    groups.insert(key.clone(), MergedCandidate::from_raw(key, raw));
                }
            }
        }
        (groups.into_values().collect(), dropped, merges)
    }

    /// Build the merge plan for one run. An empty candidate list is a resync:
    /// every stored record is rescored and re-evaluated.
    pub fn consolidate(
        &self,
        candidates: Vec<RawCandidate>,
        existing: &[Opportunity],
        run_date: NaiveDate,
    ) -> ConsolidationOutcome {
        let (merged, dropped, same_run_merges) = self.dedup_candidates(candidates);

        let mut index: BTreeMap<IdentityKey, &Opportunity> = BTreeMap::new();
        for record in existing {
            match record.identity_key() {
                Ok(key) => {
                    if index.contains_key(&key) {
                        warn!(key = %key, "store holds a duplicate identity; keeping the first record");
                    } else {
                        index.insert(key, record);
                    }
                }
                Err(reason) => warn!(name = %record.name, %reason, "stored record has no usable identity"),
            }
        }

        let mut plan = MergePlan::new(run_date);
        let mut notes = Vec::new();
        let mut expired = Vec::new();
        let mut matched: BTreeSet<IdentityKey> = BTreeSet::new();

        for candidate in &merged {
            if candidate.closed_hint {
                debug!(key = %candidate.key, "portal lists this posting as closed");
            }
            match index.get(&candidate.key) {
                Some(stored) => {
                    matched.insert(candidate.key.clone());
                    let mut record = (*stored).clone();
                    let mut changes = refresh_from_candidate(&mut record, candidate, run_date);
                    self.finish_cycle(&candidate.key, &mut record, run_date, &mut changes, &mut notes, &mut expired);
                    if candidate.closed_hint && record.state.value == OpportunityState::New {
                        notes.push(LifecycleNote {
                            key: candidate.key.to_string(),
                            name: record.name.clone(),
                            message: "portal marks this posting as closed".to_string(),
                        });
                    }
                    if !changes.is_empty() {
                        plan.updates.push(RecordUpdate {
                            key: candidate.key.clone(),
                            record,
                            changes,
                        });
                    }
                }
                None => {
                    let mut record = new_record(candidate, run_date);
                    record.relevance = self.scorer.tier(&record);
                    let mut changes = Vec::new();
                    self.finish_cycle(&candidate.key, &mut record, run_date, &mut changes, &mut notes, &mut expired);
                    info!(key = %candidate.key, state = record.state.value.as_str(), "new opportunity");
                    plan.inserts.push(record);
                }
            }
        }

        for (key, stored) in &index {
            if matched.contains(key) {
                continue;
            }
            let mut record = (*stored).clone();
            let mut changes = Vec::new();
            self.finish_cycle(key, &mut record, run_date, &mut changes, &mut notes, &mut expired);
            if !changes.is_empty() {
                plan.updates.push(RecordUpdate {
                    key: key.clone(),
                    record,
                    changes,
                });
            }
        }

        info!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            dropped = dropped.len(),
            same_run_merges,
            "merge plan ready"
        );
        ConsolidationOutcome {
            plan,
            dropped,
            notes,
            same_run_merges,
            expired,
        }
    }

    /// Rescore and apply the lifecycle rule; runs for every record every cycle.
    fn finish_cycle(
        &self,
        key: &IdentityKey,
        record: &mut Opportunity,
        run_date: NaiveDate,
        changes: &mut Vec<FieldChange>,
        notes: &mut Vec<LifecycleNote>,
        expired: &mut Vec<IdentityKey>,
    ) {
        let tier = self.scorer.tier(record);
        if tier != record.relevance {
            changes.push(FieldChange {
                field: TrackedField::Relevance,
                before: Some(record.relevance.render()),
                after: Some(tier.render()),
                attribution: Attribution::engine(run_date),
            });
            record.relevance = tier;
        }

        match lifecycle::evaluate(record, run_date) {
            LifecycleDecision::Unchanged => {}
            LifecycleDecision::Expire => {
                info!(key = %key, "closing date passed; expiring");
                changes.push(lifecycle::expire(record, run_date));
                expired.push(key.clone());
            }
            LifecycleDecision::ProtectedPastDue => {
                let closing = record.closing_date.value.map(|d| d.render()).unwrap_or_default();
                info!(key = %key, state = record.state.value.as_str(), %closing, "past due but state set by a human");
                notes.push(LifecycleNote {
                    key: key.to_string(),
                    name: record.name.clone(),
                    message: format!(
                        "closing date {closing} has passed; state `{}` kept (set by a human)",
                        record.state.value.as_str()
                    ),
                });
                changes.push(lifecycle::mark_past_due_noted(record, run_date));
            }
        }
    }
}

/// Replace an automation-owned field with a known incoming value.
fn refresh_field<T: FieldValue>(
    field: &mut Field<T>,
    incoming: Option<&Picked<T>>,
    name: TrackedField,
    run_date: NaiveDate,
    changes: &mut Vec<FieldChange>,
) {
    let Some(incoming) = incoming else {
        return;
    };
    if field.is_human_override() || field.value.as_ref() == Some(&incoming.value) {
        return;
    }
    let attribution = Attribution::automated(&incoming.source_id, run_date);
    changes.push(FieldChange {
        field: name,
        before: field.value.as_ref().map(FieldValue::render),
        after: Some(incoming.value.render()),
        attribution: attribution.clone(),
    });
    *field = Field::with_value(incoming.value.clone(), attribution);
}

fn render_set(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn union_into(
    target: &mut BTreeSet<String>,
    incoming: &BTreeSet<String>,
    name: TrackedField,
    source_id: &str,
    run_date: NaiveDate,
    changes: &mut Vec<FieldChange>,
) {
    if incoming.is_subset(target) {
        return;
    }
    let before = render_set(target);
    target.extend(incoming.iter().cloned());
    changes.push(FieldChange {
        field: name,
        before: Some(before),
        after: Some(render_set(target)),
        attribution: Attribution::automated(source_id, run_date),
    });
}

fn refresh_from_candidate(record: &mut Opportunity, candidate: &MergedCandidate, run_date: NaiveDate) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let lead_source = candidate.sources.iter().next().cloned().unwrap_or_default();

    refresh_field(
        &mut record.description,
        candidate.description.as_ref(),
        TrackedField::Description,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.category,
        candidate.category.as_ref(),
        TrackedField::Category,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.opening_date,
        candidate.opening_date.as_ref(),
        TrackedField::OpeningDate,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.closing_date,
        candidate.closing_date.as_ref(),
        TrackedField::ClosingDate,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.amount,
        candidate.amount.as_ref(),
        TrackedField::Amount,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.source_url,
        candidate.source_url.as_ref(),
        TrackedField::SourceUrl,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.requirements,
        candidate.requirements.as_ref(),
        TrackedField::Requirements,
        run_date,
        &mut changes,
    );
    refresh_field(
        &mut record.required_documents,
        candidate.required_documents.as_ref(),
        TrackedField::RequiredDocuments,
        run_date,
        &mut changes,
    );
    union_into(
        &mut record.areas,
        &candidate.areas,
        TrackedField::Areas,
        &lead_source,
        run_date,
        &mut changes,
    );
    union_into(
        &mut record.source_portals,
        &candidate.sources,
        TrackedField::SourcePortals,
        &lead_source,
        run_date,
        &mut changes,
    );

    let previous = record.last_seen;
    if record.advance_last_seen(run_date) {
        changes.push(FieldChange {
            field: TrackedField::LastSeen,
            before: Some(previous.render()),
            after: Some(run_date.render()),
            attribution: Attribution::automated(&lead_source, run_date),
        });
    }
    changes
}

fn to_field<T>(picked: &Option<Picked<T>>, run_date: NaiveDate) -> Field<T>
where
    T: Clone,
{
    match picked {
        Some(p) => Field::with_value(p.value.clone(), Attribution::automated(&p.source_id, run_date)),
        None => Field::empty(),
    }
}

fn new_record(candidate: &MergedCandidate, run_date: NaiveDate) -> Opportunity {
    Opportunity {
        name: candidate.name.clone(),
        entity: candidate.entity.clone(),
        description: to_field(&candidate.description, run_date),
        category: to_field(&candidate.category, run_date),
        areas: candidate.areas.clone(),
        opening_date: to_field(&candidate.opening_date, run_date),
        closing_date: to_field(&candidate.closing_date, run_date),
        amount: to_field(&candidate.amount, run_date),
        source_url: to_field(&candidate.source_url, run_date),
        requirements: to_field(&candidate.requirements, run_date),
        required_documents: to_field(&candidate.required_documents, run_date),
        notes: Field::empty(),
        source_portals: candidate.sources.clone(),
        relevance: Default::default(),
        state: Tracked::new(OpportunityState::New, Attribution::engine(run_date)),
        first_seen: run_date,
        last_seen: run_date,
        past_due_noted: None,
    }
}
