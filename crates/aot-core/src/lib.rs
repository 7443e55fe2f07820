//! Core domain model, identity keys and field attribution for AOT.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "aot-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Scholarship,
    Mobility,
    CallForProposals,
    Competition,
    #[default]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Scholarship => "scholarship",
            Category::Mobility => "mobility",
            Category::CallForProposals => "call-for-proposals",
            Category::Competition => "competition",
            Category::Other => "other",
        }
    }

    /// Refine a portal's default category from the wording of a title.
    pub fn infer(text: &str, fallback: Category) -> Category {
        let folded = fold_text(text);
        let has = |needles: &[&str]| needles.iter().any(|n| folded.contains(n));
        if has(&["beca", "scholarship", "fellowship"]) {
            Category::Scholarship
        } else if has(&["movilidad", "mobility", "intercambio", "exchange", "estancia", "pasantia"]) {
            Category::Mobility
        } else if has(&["concurso", "premio", "competition", "award", "contest"]) {
            Category::Competition
        } else if has(&["convocatoria", "call for", "grant", "financiacion", "funding"]) {
            Category::CallForProposals
        } else {
            fallback
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceTier {
    High,
    Medium,
    #[default]
    Low,
}

impl RelevanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceTier::High => "high",
            RelevanceTier::Medium => "medium",
            RelevanceTier::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityState {
    #[default]
    New,
    Expired,
    Applied,
    InProgress,
    Discarded,
}

impl OpportunityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityState::New => "new",
            OpportunityState::Expired => "expired",
            OpportunityState::Applied => "applied",
            OpportunityState::InProgress => "in_progress",
            OpportunityState::Discarded => "discarded",
        }
    }

    /// States that no longer need the user's attention before a deadline.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            OpportunityState::Expired | OpportunityState::Applied | OpportunityState::Discarded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStateError(String);

impl fmt::Display for ParseStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown state `{}` (expected new, expired, applied, in-progress or discarded)",
            self.0
        )
    }
}

impl std::error::Error for ParseStateError {}

impl FromStr for OpportunityState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_text(s).replace(' ', "_").as_str() {
            "new" | "nueva" => Ok(OpportunityState::New),
            "expired" | "vencida" => Ok(OpportunityState::Expired),
            "applied" | "aplicada" => Ok(OpportunityState::Applied),
            "in_progress" | "inprogress" | "en_proceso" => Ok(OpportunityState::InProgress),
            "discarded" | "descartada" => Ok(OpportunityState::Discarded),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}

/// Who last wrote a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Writer {
    #[default]
    Automation,
    Human,
}

/// Provenance attached to every stored value: last writer, confirming source and run date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub writer: Writer,
    #[serde(default)]
    pub source_id: Option<String>,
    pub run_date: NaiveDate,
}

impl Attribution {
    pub fn automated(source_id: impl Into<String>, run_date: NaiveDate) -> Self {
        Self {
            writer: Writer::Automation,
            source_id: Some(source_id.into()),
            run_date,
        }
    }

    /// Engine-internal decisions (expiration, rescoring) carry no source.
    pub fn engine(run_date: NaiveDate) -> Self {
        Self {
            writer: Writer::Automation,
            source_id: None,
            run_date,
        }
    }

    pub fn human(run_date: NaiveDate) -> Self {
        Self {
            writer: Writer::Human,
            source_id: None,
            run_date,
        }
    }

    pub fn is_human(&self) -> bool {
        self.writer == Writer::Human
    }
}

/// Optional stored value with its last-writer attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub attribution: Option<Attribution>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            attribution: None,
        }
    }

    pub fn with_value(value: T, attribution: Attribution) -> Self {
        Self {
            value: Some(value),
            attribution: Some(attribution),
        }
    }

    pub fn from_option(value: Option<T>, attribution: Attribution) -> Self {
        match value {
            Some(value) => Self::with_value(value, attribution),
            None => Self::empty(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.value.is_some()
    }

    /// True when a human wrote this field last; automation must leave it alone.
    pub fn is_human_override(&self) -> bool {
        self.attribution.as_ref().is_some_and(Attribution::is_human)
    }
}

/// Always-present stored value with its last-writer attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracked<T> {
    pub value: T,
    pub attribution: Attribution,
}

impl<T> Tracked<T> {
    pub fn new(value: T, attribution: Attribution) -> Self {
        Self { value, attribution }
    }

    pub fn is_human_override(&self) -> bool {
        self.attribution.is_human()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub value: f64,
    pub currency: String,
}

impl Amount {
    pub fn new(value: f64, currency: impl Into<String>) -> Self {
        Self {
            value,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.fract() == 0.0 {
            write!(f, "{} {:.0}", self.currency, self.value)
        } else {
            write!(f, "{} {:.2}", self.currency, self.value)
        }
    }
}

/// Human-readable rendering used for change audit lines.
pub trait FieldValue: Clone + PartialEq {
    fn render(&self) -> String;
}

impl FieldValue for String {
    fn render(&self) -> String {
        self.clone()
    }
}

impl FieldValue for NaiveDate {
    fn render(&self) -> String {
        self.format("%Y-%m-%d").to_string()
    }
}

impl FieldValue for Amount {
    fn render(&self) -> String {
        self.to_string()
    }
}

impl FieldValue for Category {
    fn render(&self) -> String {
        self.as_str().to_string()
    }
}

impl FieldValue for RelevanceTier {
    fn render(&self) -> String {
        self.as_str().to_string()
    }
}

impl FieldValue for OpportunityState {
    fn render(&self) -> String {
        self.as_str().to_string()
    }
}

fn fold_char(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

fn is_combining_mark(c: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&c)
}

/// Lower-case and strip diacritics, keeping punctuation. One output char per
/// input char except decomposed combining marks, which are dropped.
pub fn fold_case_and_accents(input: &str) -> String {
    input
        .chars()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| fold_char(c.to_lowercase().next().unwrap_or(c)))
        .collect()
}

/// Lower-case, strip diacritics and punctuation, collapse whitespace.
pub fn fold_text(input: &str) -> String {
    fold_case_and_accents(input)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRejection {
    EmptyName,
    EmptyEntity,
}

impl fmt::Display for KeyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRejection::EmptyName => f.write_str("name is empty after normalization"),
            KeyRejection::EmptyEntity => f.write_str("entity is empty after normalization"),
        }
    }
}

/// Normalized (name, entity) pair; equal keys mean the same opportunity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    name: String,
    entity: String,
}

impl IdentityKey {
    pub fn new(name: &str, entity: &str) -> Result<Self, KeyRejection> {
        let name = fold_text(name);
        if name.is_empty() {
            return Err(KeyRejection::EmptyName);
        }
        let entity = fold_text(entity);
        if entity.is_empty() {
            return Err(KeyRejection::EmptyEntity);
        }
        Ok(Self { name, entity })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.name, self.entity)
    }
}

/// Handoff contract from source adapters into the consolidation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_id: String,
    pub name: String,
    pub entity: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub opening_date: Option<NaiveDate>,
    #[serde(default)]
    pub closing_date: Option<NaiveDate>,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub required_documents: Option<String>,
    /// Surrounding page text kept for field extraction.
    #[serde(default)]
    pub context_text: String,
    /// The portal labelled the posting as closed.
    #[serde(default)]
    pub closed_hint: bool,
    pub fetched_at: DateTime<Utc>,
}

impl RawCandidate {
    pub fn new(
        source_id: impl Into<String>,
        name: impl Into<String>,
        entity: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            entity: entity.into(),
            description: None,
            category: Category::Other,
            areas: Vec::new(),
            source_url: None,
            opening_date: None,
            closing_date: None,
            amount: None,
            requirements: None,
            required_documents: None,
            context_text: String::new(),
            closed_hint: false,
            fetched_at,
        }
    }

    pub fn identity_key(&self) -> Result<IdentityKey, KeyRejection> {
        IdentityKey::new(&self.name, &self.entity)
    }
}

/// Fields whose updates are recorded in the change audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Description,
    Category,
    Areas,
    OpeningDate,
    ClosingDate,
    Amount,
    SourceUrl,
    Requirements,
    RequiredDocuments,
    Notes,
    SourcePortals,
    Relevance,
    State,
    LastSeen,
    PastDueNotice,
}

impl TrackedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackedField::Description => "description",
            TrackedField::Category => "category",
            TrackedField::Areas => "areas",
            TrackedField::OpeningDate => "opening_date",
            TrackedField::ClosingDate => "closing_date",
            TrackedField::Amount => "amount",
            TrackedField::SourceUrl => "source_url",
            TrackedField::Requirements => "requirements",
            TrackedField::RequiredDocuments => "required_documents",
            TrackedField::Notes => "notes",
            TrackedField::SourcePortals => "source_portals",
            TrackedField::Relevance => "relevance",
            TrackedField::State => "state",
            TrackedField::LastSeen => "last_seen",
            TrackedField::PastDueNotice => "past_due_notice",
        }
    }
}

/// One attributable field update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: TrackedField,
    pub before: Option<String>,
    pub after: Option<String>,
    pub attribution: Attribution,
}

/// The central tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub name: String,
    pub entity: String,
    #[serde(default)]
    pub description: Field<String>,
    #[serde(default)]
    pub category: Field<Category>,
    #[serde(default)]
    pub areas: BTreeSet<String>,
    #[serde(default)]
    pub opening_date: Field<NaiveDate>,
    #[serde(default)]
    pub closing_date: Field<NaiveDate>,
    #[serde(default)]
    pub amount: Field<Amount>,
    #[serde(default)]
    pub source_url: Field<String>,
    #[serde(default)]
    pub requirements: Field<String>,
    #[serde(default)]
    pub required_documents: Field<String>,
    #[serde(default)]
    pub notes: Field<String>,
    #[serde(default)]
    pub source_portals: BTreeSet<String>,
    pub relevance: RelevanceTier,
    pub state: Tracked<OpportunityState>,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    /// Past closing date already reported while a human-set state protected the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub past_due_noted: Option<NaiveDate>,
}

impl Opportunity {
    pub fn identity_key(&self) -> Result<IdentityKey, KeyRejection> {
        IdentityKey::new(&self.name, &self.entity)
    }

    pub fn has_state_override(&self) -> bool {
        self.state.is_human_override()
    }

    /// Returns true when the date actually moved forward.
    pub fn advance_last_seen(&mut self, date: NaiveDate) -> bool {
        if date > self.last_seen {
            self.last_seen = date;
            true
        } else {
            false
        }
    }

    pub fn is_past_due(&self, run_date: NaiveDate) -> bool {
        self.closing_date.value.is_some_and(|d| d < run_date)
    }

    pub fn days_until_close(&self, run_date: NaiveDate) -> Option<i64> {
        self.closing_date
            .value
            .map(|d| d.signed_duration_since(run_date).num_days())
    }
}

/// Proposed replacement of one stored record plus the audit of what changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub key: IdentityKey,
    pub record: Opportunity,
    pub changes: Vec<FieldChange>,
}

impl RecordUpdate {
    pub fn state_change(&self) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == TrackedField::State)
    }
}

/// Inserts and updates proposed for one run; applied to the store all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub run_date: NaiveDate,
    pub inserts: Vec<Opportunity>,
    pub updates: Vec<RecordUpdate>,
}

impl MergePlan {
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            inserts: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn state_changes(&self) -> impl Iterator<Item = (&RecordUpdate, &FieldChange)> {
        self.updates
            .iter()
            .filter_map(|u| u.state_change().map(|c| (u, c)))
    }
}
