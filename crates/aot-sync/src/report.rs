//! Run report: counts, highlights, failures. Rendered as markdown and JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aot_core::{fold_text, Category, IdentityKey, MergePlan, Opportunity, OpportunityState, TrackedField, Writer};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use strsim::jaro_winkler;
use tokio::fs;
use uuid::Uuid;

use crate::consolidate::{ConsolidationOutcome, DroppedCandidate, LifecycleNote};
use crate::orchestrator::SourceOutcome;
use crate::RunMode;

pub const SUMMARY_MAX_WORDS: usize = 15;
pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub new: usize,
    pub updated: usize,
    pub expiring_soon: usize,
    /// Records currently in the Expired state.
    pub expired: usize,
    pub expired_this_run: usize,
    pub total: usize,
    pub failed_sources: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub entity: String,
    pub summary: String,
    pub relevance: String,
    pub closing_date: Option<NaiveDate>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiringEntry {
    pub name: String,
    pub entity: String,
    pub closing_date: NaiveDate,
    pub days_left: i64,
    pub state: String,
    pub relevance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChangeEntry {
    pub key: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub by: String,
}

/// One attributed field update, for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChangeEntry {
    pub key: String,
    pub field: TrackedField,
    pub before: Option<String>,
    pub after: Option<String>,
    pub writer: Writer,
    pub source_id: Option<String>,
    pub run_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearDuplicate {
    pub entity: String,
    pub first: String,
    pub second: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub mode: RunMode,
    pub generated_at: DateTime<Utc>,
    pub expiry_warning_days: i64,
    pub counts: ReportCounts,
    pub by_relevance: BTreeMap<String, usize>,
    pub by_state: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub new_opportunities: Vec<ReportEntry>,
    pub expiring_soon: Vec<ExpiringEntry>,
    pub state_changes: Vec<StateChangeEntry>,
    pub field_changes: Vec<FieldChangeEntry>,
    pub sources: Vec<SourceOutcome>,
    pub failed_sources: Vec<FailedSource>,
    pub notes: Vec<LifecycleNote>,
    pub dropped: Vec<DroppedCandidate>,
    pub near_duplicates: Vec<NearDuplicate>,
}

pub struct ReportInput<'a> {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub mode: RunMode,
    pub expiry_warning_days: i64,
    /// The store after this run's merge plan was applied.
    pub records: &'a [Opportunity],
    pub consolidation: &'a ConsolidationOutcome,
    pub sources: &'a [SourceOutcome],
}

fn category_label(category: Category) -> &'static str {
    match category {
        Category::Scholarship => "Scholarship",
        Category::Mobility => "Mobility",
        Category::CallForProposals => "Call for proposals",
        Category::Competition => "Competition",
        Category::Other => "",
    }
}

/// Remove every case-insensitive occurrence of `needle` from `haystack`.
fn strip_ignoring_case(haystack: &str, needle: &str) -> String {
    let lower = |c: char| c.to_lowercase().next().unwrap_or(c);
    let hay: Vec<char> = haystack.chars().collect();
    let pat: Vec<char> = needle.chars().map(lower).collect();
    if pat.is_empty() {
        return haystack.to_string();
    }
    let mut out = String::with_capacity(haystack.len());
    let mut i = 0;
    while i < hay.len() {
        let matches = i + pat.len() <= hay.len() && hay[i..i + pat.len()].iter().map(|c| lower(*c)).eq(pat.iter().copied());
        if matches {
            i += pat.len();
        } else {
            out.push(hay[i]);
            i += 1;
        }
    }
    out
}

/// Short one-line summary of at most fifteen words.
pub fn summarize(record: &Opportunity) -> String {
    let name = record.name.trim();
    if name.is_empty() {
        return String::new();
    }
    let entity_short = record.entity.split(" - ").next().unwrap_or_default().trim();
    let cleaned = strip_ignoring_case(name, entity_short);
    let cleaned = cleaned
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '-' | ':' | ','))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let cleaned = if cleaned.is_empty() { name.to_string() } else { cleaned };

    let label = record.category.value.map(category_label).unwrap_or_default();
    let prefix = if !label.is_empty() && !fold_text(&cleaned).contains(&fold_text(label)) {
        format!("{label}: ")
    } else {
        String::new()
    };
    let suffix = match &record.amount.value {
        Some(amount) if amount.to_string().len() < 30 => format!(". {amount}"),
        _ => String::new(),
    };

    let summary = format!("{prefix}{cleaned}{suffix}");
    let words: Vec<&str> = summary.split_whitespace().collect();
    if words.len() > SUMMARY_MAX_WORDS {
        format!("{}...", words[..SUMMARY_MAX_WORDS].join(" "))
    } else {
        summary
    }
}

/// Closing date in `[run_date, run_date + warning_days]` and not settled.
pub fn expiring_soon(records: &[Opportunity], run_date: NaiveDate, warning_days: i64) -> Vec<ExpiringEntry> {
    let mut out: Vec<ExpiringEntry> = records
        .iter()
        .filter(|r| !r.state.value.is_settled())
        .filter_map(|r| {
            let days_left = r.days_until_close(run_date)?;
            let closing_date = r.closing_date.value?;
            (0..=warning_days).contains(&days_left).then(|| ExpiringEntry {
                name: r.name.clone(),
                entity: r.entity.clone(),
                closing_date,
                days_left,
                state: r.state.value.as_str().to_string(),
                relevance: r.relevance.as_str().to_string(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.days_left.cmp(&b.days_left).then_with(|| a.name.cmp(&b.name)));
    out
}

/// Similar names within one entity. Informational; these are never merged.
pub fn near_duplicates(records: &[Opportunity]) -> Vec<NearDuplicate> {
    let mut by_entity: BTreeMap<String, Vec<(IdentityKey, &Opportunity)>> = BTreeMap::new();
    for record in records {
        if let Ok(key) = record.identity_key() {
            by_entity.entry(key.entity().to_string()).or_default().push((key, record));
        }
    }

    let mut out = Vec::new();
    for group in by_entity.values() {
        for (i, (key_a, a)) in group.iter().enumerate() {
            for (key_b, b) in &group[i + 1..] {
                if key_a == key_b {
                    continue;
                }
                let score = jaro_winkler(key_a.name(), key_b.name());
                if score >= NEAR_DUPLICATE_THRESHOLD {
                    out.push(NearDuplicate {
                        entity: a.entity.clone(),
                        first: a.name.clone(),
                        second: b.name.clone(),
                        score,
                    });
                }
            }
        }
    }
    out
}

/// Every attributed update in the plan except `last_seen` bookkeeping.
pub fn field_changes(plan: &MergePlan) -> Vec<FieldChangeEntry> {
    plan.updates
        .iter()
        .flat_map(|update| {
            update
                .changes
                .iter()
                .filter(|c| c.field != TrackedField::LastSeen)
                .map(move |c| FieldChangeEntry {
                    key: update.key.to_string(),
                    field: c.field,
                    before: c.before.clone(),
                    after: c.after.clone(),
                    writer: c.attribution.writer,
                    source_id: c.attribution.source_id.clone(),
                    run_date: c.attribution.run_date,
                })
        })
        .collect()
}

fn count_by<F>(records: &[Opportunity], label: F) -> BTreeMap<String, usize>
where
    F: Fn(&Opportunity) -> &'static str,
{
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(label(record).to_string()).or_default() += 1;
    }
    counts
}

pub fn build_report(input: ReportInput<'_>) -> RunReport {
    let plan = &input.consolidation.plan;
    let expiring = expiring_soon(input.records, input.run_date, input.expiry_warning_days);

    let new_opportunities = plan
        .inserts
        .iter()
        .map(|r| ReportEntry {
            name: r.name.clone(),
            entity: r.entity.clone(),
            summary: summarize(r),
            relevance: r.relevance.as_str().to_string(),
            closing_date: r.closing_date.value,
            source_url: r.source_url.value.clone(),
        })
        .collect::<Vec<_>>();

    let mut state_changes: Vec<StateChangeEntry> = plan
        .state_changes()
        .map(|(update, change)| StateChangeEntry {
            key: update.key.to_string(),
            from: change.before.clone(),
            to: change.after.clone(),
            by: if change.attribution.is_human() { "human" } else { "engine" }.to_string(),
        })
        .collect();
    for insert in plan.inserts.iter().filter(|r| r.state.value == OpportunityState::Expired) {
        state_changes.push(StateChangeEntry {
            key: insert.identity_key().map(|k| k.to_string()).unwrap_or_else(|_| insert.name.clone()),
            from: Some(OpportunityState::New.as_str().to_string()),
            to: Some(OpportunityState::Expired.as_str().to_string()),
            by: "engine".to_string(),
        });
    }

    let failed_sources: Vec<FailedSource> = input
        .sources
        .iter()
        .filter_map(|o| match &o.status {
            crate::orchestrator::SourceStatus::Failed { reason } => Some(FailedSource {
                source_id: o.source_id.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        })
        .collect();

    let counts = ReportCounts {
        new: plan.inserts.len(),
        updated: plan.updates.len(),
        expiring_soon: expiring.len(),
        expired: input
            .records
            .iter()
            .filter(|r| r.state.value == OpportunityState::Expired)
            .count(),
        expired_this_run: input.consolidation.expired.len(),
        total: input.records.len(),
        failed_sources: failed_sources.len(),
    };

    RunReport {
        run_id: input.run_id,
        run_date: input.run_date,
        mode: input.mode,
        generated_at: Utc::now(),
        expiry_warning_days: input.expiry_warning_days,
        counts,
        by_relevance: count_by(input.records, |r| r.relevance.as_str()),
        by_state: count_by(input.records, |r| r.state.value.as_str()),
        by_category: count_by(input.records, |r| r.category.value.unwrap_or_default().as_str()),
        new_opportunities,
        expiring_soon: expiring,
        state_changes,
        field_changes: field_changes(plan),
        sources: input.sources.to_vec(),
        failed_sources,
        notes: input.consolidation.notes.clone(),
        dropped: input.consolidation.dropped.clone(),
        near_duplicates: near_duplicates(input.records),
    }
}

pub fn subject(report: &RunReport) -> String {
    let c = &report.counts;
    let mut subject = format!(
        "[AOT] {}: {} new, {} expiring soon",
        report.run_date, c.new, c.expiring_soon
    );
    if c.failed_sources > 0 {
        subject.push_str(&format!(", {} failed source(s)", c.failed_sources));
    }
    subject
}

fn push_counts(out: &mut Vec<String>, title: &str, counts: &BTreeMap<String, usize>) {
    let joined = counts
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ");
    out.push(format!("- {title}: {}", if joined.is_empty() { "none".to_string() } else { joined }));
}

pub fn render_markdown(report: &RunReport) -> String {
    let c = &report.counts;
    let mut lines = vec![
        "# Academic Opportunity Report".to_string(),
        String::new(),
        format!("- Run date: {}", report.run_date),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Mode: {}", report.mode.as_str()),
        format!("- New: {}", c.new),
        format!("- Updated: {}", c.updated),
        format!(
            "- Expiring within {} days: {}",
            report.expiry_warning_days, c.expiring_soon
        ),
        format!("- Expired: {} ({} this run)", c.expired, c.expired_this_run),
        format!("- Total tracked: {}", c.total),
        format!("- Failed sources: {}", c.failed_sources),
    ];
    push_counts(&mut lines, "By relevance", &report.by_relevance);
    push_counts(&mut lines, "By state", &report.by_state);
    push_counts(&mut lines, "By category", &report.by_category);

    if !report.new_opportunities.is_empty() {
        lines.extend([String::new(), "## New opportunities".to_string()]);
        for entry in &report.new_opportunities {
            let closing = entry
                .closing_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            lines.push(format!(
                "- **{}** ({}) [{}] closes {}: {}",
                entry.name, entry.entity, entry.relevance, closing, entry.summary
            ));
        }
    }

    if !report.expiring_soon.is_empty() {
        lines.extend([String::new(), "## Expiring soon".to_string()]);
        for entry in &report.expiring_soon {
            lines.push(format!(
                "- {} ({}): {} days left, closes {} [{}]",
                entry.name, entry.entity, entry.days_left, entry.closing_date, entry.state
            ));
        }
    }

    if !report.state_changes.is_empty() {
        lines.extend([String::new(), "## State changes".to_string()]);
        for change in &report.state_changes {
            lines.push(format!(
                "- `{}`: {} -> {} ({})",
                change.key,
                change.from.as_deref().unwrap_or("-"),
                change.to.as_deref().unwrap_or("-"),
                change.by
            ));
        }
    }

    if !report.field_changes.is_empty() {
        lines.extend([String::new(), "## Field changes".to_string()]);
        for change in &report.field_changes {
            let by = match (&change.writer, &change.source_id) {
                (Writer::Human, _) => "human".to_string(),
                (Writer::Automation, Some(source)) => source.clone(),
                (Writer::Automation, None) => "engine".to_string(),
            };
            lines.push(format!(
                "- `{}` {}: {} -> {} ({}, {})",
                change.key,
                change.field.as_str(),
                change.before.as_deref().unwrap_or("-"),
                change.after.as_deref().unwrap_or("-"),
                by,
                change.run_date
            ));
        }
    }

    if !report.sources.is_empty() {
        lines.extend([String::new(), "## Sources".to_string()]);
        for source in &report.sources {
            let status = match &source.status {
                crate::orchestrator::SourceStatus::Ok { candidates } => format!("ok, {candidates} candidates"),
                crate::orchestrator::SourceStatus::Failed { reason } => format!("FAILED: {reason}"),
            };
            lines.push(format!("- {}: {} ({} ms)", source.source_id, status, source.elapsed_ms));
        }
    }

    if !report.notes.is_empty() {
        lines.extend([String::new(), "## Notes".to_string()]);
        lines.extend(report.notes.iter().map(|n| format!("- {}: {}", n.name, n.message)));
    }

    if !report.dropped.is_empty() {
        lines.extend([String::new(), "## Dropped candidates".to_string()]);
        lines.extend(
            report
                .dropped
                .iter()
                .map(|d| format!("- {} `{}`: {}", d.source_id, d.name, d.reason)),
        );
    }

    if !report.near_duplicates.is_empty() {
        lines.extend([String::new(), "## Possible duplicates (not merged)".to_string()]);
        lines.extend(report.near_duplicates.iter().map(|d| {
            format!("- {}: \"{}\" / \"{}\" ({:.2})", d.entity, d.first, d.second, d.score)
        }));
    }

    lines.push(String::new());
    lines.join("\n")
}

pub fn report_dir_for(reports_root: &Path, report: &RunReport) -> PathBuf {
    reports_root.join(format!("{}_{}", report.run_date, report.run_id))
}

/// Write `report.md` and `report.json`; returns the run directory.
pub async fn write_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = report_dir_for(reports_root, report);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    fs::write(dir.join("report.md"), render_markdown(report))
        .await
        .context("writing report.md")?;
    let json = serde_json::to_vec_pretty(report).context("serializing report")?;
    fs::write(dir.join("report.json"), json)
        .await
        .context("writing report.json")?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aot_core::{Amount, Attribution, Field, FieldChange, RecordUpdate, RelevanceTier, Tracked};
    use std::collections::BTreeSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(name: &str, entity: &str, closing: Option<NaiveDate>, state: OpportunityState) -> Opportunity {
        let seen = date(2025, 3, 1);
        Opportunity {
            name: name.into(),
            entity: entity.into(),
            description: Field::empty(),
            category: Field::empty(),
            areas: BTreeSet::new(),
            opening_date: Field::empty(),
            closing_date: Field::from_option(closing, Attribution::automated("test", seen)),
            amount: Field::empty(),
            source_url: Field::empty(),
            requirements: Field::empty(),
            required_documents: Field::empty(),
            notes: Field::empty(),
            source_portals: BTreeSet::new(),
            relevance: RelevanceTier::Medium,
            state: Tracked::new(state, Attribution::engine(seen)),
            first_seen: seen,
            last_seen: seen,
            past_due_noted: None,
        }
    }

    #[test]
    fn summary_strips_entity_and_adds_category_and_amount() {
        let mut r = record("ICETEX - Crédito condonable para maestría", "ICETEX", None, OpportunityState::New);
        r.category = Field::with_value(Category::Scholarship, Attribution::engine(date(2025, 3, 1)));
        r.amount = Field::with_value(Amount::new(13_000_000.0, "COP"), Attribution::engine(date(2025, 3, 1)));
        assert_eq!(
            summarize(&r),
            "Scholarship: Crédito condonable para maestría. COP 13000000"
        );
    }

    #[test]
    fn summary_is_capped_at_fifteen_words() {
        let long = "Programa de apoyo a la formación doctoral en ciencias sociales humanas y cognitivas para jóvenes investigadores de Colombia";
        let r = record(long, "Minciencias", None, OpportunityState::New);
        let summary = summarize(&r);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.split_whitespace().count(), SUMMARY_MAX_WORDS);
    }

    #[test]
    fn expiring_soon_window_excludes_settled_records() {
        let run = date(2025, 3, 1);
        let records = vec![
            record("En ventana", "A", Some(date(2025, 3, 10)), OpportunityState::New),
            record("Hoy", "A", Some(run), OpportunityState::InProgress),
            record("Ya aplicada", "A", Some(date(2025, 3, 5)), OpportunityState::Applied),
            record("Descartada", "A", Some(date(2025, 3, 5)), OpportunityState::Discarded),
            record("Muy lejos", "A", Some(date(2025, 5, 1)), OpportunityState::New),
            record("Pasada", "A", Some(date(2025, 2, 1)), OpportunityState::New),
            record("Sin fecha", "A", None, OpportunityState::New),
        ];
        let names: Vec<String> = expiring_soon(&records, run, 15).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["Hoy".to_string(), "En ventana".to_string()]);
    }

    #[test]
    fn near_duplicates_stay_within_entity() {
        let records = vec![
            record("Beca Doctoral 2025", "DAAD", None, OpportunityState::New),
            record("Beca Doctorado 2025", "DAAD", None, OpportunityState::New),
            record("Beca Doctorado 2025", "OEA", None, OpportunityState::New),
            record("Movilidad corta", "DAAD", None, OpportunityState::New),
        ];
        let found = near_duplicates(&records);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity, "DAAD");
        assert!(found[0].score >= NEAR_DUPLICATE_THRESHOLD);
    }

    #[test]
    fn field_changes_carry_source_and_run_date() {
        let run = date(2025, 4, 1);
        let record = record("Beca DAAD", "DAAD", Some(date(2025, 9, 1)), OpportunityState::New);
        let key = record.identity_key().unwrap();
        let mut plan = MergePlan::new(run);
        plan.updates.push(RecordUpdate {
            key: key.clone(),
            record,
            changes: vec![
                FieldChange {
                    field: TrackedField::ClosingDate,
                    before: Some("2025-08-01".into()),
                    after: Some("2025-09-01".into()),
                    attribution: Attribution::automated("daad", run),
                },
                FieldChange {
                    field: TrackedField::LastSeen,
                    before: Some("2025-03-01".into()),
                    after: Some("2025-04-01".into()),
                    attribution: Attribution::automated("daad", run),
                },
            ],
        });

        let entries = field_changes(&plan);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key.to_string());
        assert_eq!(entries[0].field, TrackedField::ClosingDate);
        assert_eq!(entries[0].source_id.as_deref(), Some("daad"));
        assert_eq!(entries[0].run_date, run);
    }
}
