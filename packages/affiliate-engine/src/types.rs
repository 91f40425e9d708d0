use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ValidationError;

/// Network used when a record names no affiliate network.
pub const DIRECT_NETWORK: &str = "direct";

// ============================================================================
// FIELDS
// ============================================================================

/// Canonical program attributes. Raw source keys are mapped onto these
/// by a [`crate::mapping::FieldMappingTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Domain,
    Network,
    Niche,
    Commission,
    CookieDays,
    PayoutMinimum,
    SignupUrl,
    Description,
    Tags,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Domain => "domain",
            Field::Network => "network",
            Field::Niche => "niche",
            Field::Commission => "commission",
            Field::CookieDays => "cookie_days",
            Field::PayoutMinimum => "payout_minimum",
            Field::SignupUrl => "signup_url",
            Field::Description => "description",
            Field::Tags => "tags",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionKind {
    /// Percentage of sale value.
    Percentage,
    /// Fixed amount per conversion.
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Commission {
    pub kind: CommissionKind,
    pub amount: f64,
}

impl Commission {
    pub fn percentage(amount: f64) -> Self {
        Self {
            kind: CommissionKind::Percentage,
            amount,
        }
    }

    pub fn flat(amount: f64) -> Self {
        Self {
            kind: CommissionKind::Flat,
            amount,
        }
    }
}

impl fmt::Display for Commission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CommissionKind::Percentage => write!(f, "{}%", self.amount),
            CommissionKind::Flat => write!(f, "{} flat", self.amount),
        }
    }
}

/// A validated, typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Commission(Commission),
    Tags(Vec<String>),
}

impl FieldValue {
    /// Two values are compatible when one could legitimately replace the
    /// other. A percentage commission and a flat commission describe
    /// different program terms and are never compatible.
    pub fn is_compatible_with(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Text(_), FieldValue::Text(_)) => true,
            (FieldValue::Number(_), FieldValue::Number(_)) => true,
            (FieldValue::Tags(_), FieldValue::Tags(_)) => true,
            (FieldValue::Commission(a), FieldValue::Commission(b)) => a.kind == b.kind,
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(text) => f.write_str(text),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Commission(c) => write!(f, "{c}"),
            FieldValue::Tags(tags) => f.write_str(&tags.join(",")),
        }
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Deterministic key that defines "the same real-world program":
/// `{network}:{domain}` with both parts normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Build a key from an already-normalized domain and optional network.
    pub fn new(domain: &str, network: Option<&str>) -> Self {
        let network = network
            .map(normalize_network)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DIRECT_NETWORK.to_string());
        Self(format!("{network}:{domain}"))
    }

    /// Derive a key from unnormalized parts.
    pub fn derive(domain: &str, network: Option<&str>) -> Result<Self, ValidationError> {
        let domain = normalize_domain(domain).ok_or_else(|| ValidationError::InvalidValue {
            field: Field::Domain,
            reason: format!("'{domain}' is not a registrable domain"),
        })?;
        Ok(Self::new(&domain, network))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Normalize a domain or URL to its bare lowercase host without `www.`.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&candidate).ok()?;
    let host = url.host_str()?.trim_end_matches('.').to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some(host.to_string())
}

pub fn normalize_network(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ============================================================================
// RAW RECORDS
// ============================================================================

/// Content fingerprint of a raw record (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record exactly as a source delivered it.
///
/// Raw records are never modified after ingestion; the index keeps them
/// for audit and merge replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub ingested_at: DateTime<Utc>,
    pub trust_rank: u32,
    /// Pins a specific mapping version; latest is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_version: Option<u32>,
}

impl RawRecord {
    pub fn new(source: impl Into<String>, trust_rank: u32, ingested_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            fields: BTreeMap::new(),
            ingested_at,
            trust_rank,
            mapping_version: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_mapping_version(mut self, version: u32) -> Self {
        self.mapping_version = Some(version);
        self
    }

    /// Stable fingerprint over everything that makes the record unique.
    ///
    /// `fields` is a BTreeMap and serde_json objects are key-ordered, so the
    /// serialization (and therefore the hash) is deterministic.
    pub fn id(&self) -> RecordId {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update([0]);
        hasher.update(self.ingested_at.to_rfc3339().as_bytes());
        hasher.update([0]);
        hasher.update(self.trust_rank.to_be_bytes());
        hasher.update(self.mapping_version.unwrap_or(0).to_be_bytes());
        let fields = serde_json::to_vec(&self.fields).unwrap_or_default();
        hasher.update(&fields);
        RecordId(hex::encode(hasher.finalize()))
    }
}

// ============================================================================
// CANONICAL PROGRAMS
// ============================================================================

/// Where a canonical field value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub record_id: RecordId,
    pub trust_rank: u32,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: FieldValue,
    pub provenance: Provenance,
}

/// The single merged view of one real-world program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProgram {
    pub key: IdentityKey,
    pub fields: BTreeMap<Field, FieldEntry>,
    /// Records currently supplying at least one field value.
    pub contributors: BTreeSet<RecordId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl CanonicalProgram {
    pub fn value(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field).map(|entry| &entry.value)
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        self.value(field).and_then(FieldValue::as_text)
    }

    pub fn commission(&self) -> Option<Commission> {
        match self.value(Field::Commission) {
            Some(FieldValue::Commission(c)) => Some(*c),
            _ => None,
        }
    }

    pub fn tags(&self) -> &[String] {
        match self.value(Field::Tags) {
            Some(FieldValue::Tags(tags)) => tags,
            _ => &[],
        }
    }

    /// Recompute contributors from field provenance.
    pub(crate) fn refresh_contributors(&mut self) {
        self.contributors = self
            .fields
            .values()
            .map(|entry| entry.provenance.record_id.clone())
            .collect();
    }
}

// ============================================================================
// MERGE RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Added,
    Updated,
    Skipped,
    Conflicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Incompatible value from a source that does not outrank the current one.
    IncompatibleKeptExisting,
    /// Incompatible value from a strictly higher-trust source; it replaced
    /// the current value but the disagreement is still surfaced.
    IncompatibleOverriddenByTrust,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub key: IdentityKey,
    pub field: Field,
    pub existing: FieldValue,
    pub incoming: FieldValue,
    pub chosen: FieldValue,
    pub reason: ConflictReason,
    pub existing_source: String,
    pub incoming_source: String,
    pub incoming_record: RecordId,
}

/// Counts of merge outcomes plus every conflict observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub conflicted: usize,
    pub conflicts: Vec<ConflictDescriptor>,
}

impl MergeResult {
    pub fn single(outcome: MergeOutcome, conflicts: Vec<ConflictDescriptor>) -> Self {
        let mut result = Self {
            conflicts,
            ..Default::default()
        };
        result.count(outcome);
        result
    }

    pub fn count(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Added => self.added += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Skipped => self.skipped += 1,
            MergeOutcome::Conflicted => self.conflicted += 1,
        }
    }

    pub fn absorb(&mut self, other: MergeResult) {
        self.added += other.added;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.conflicted += other.conflicted;
        self.conflicts.extend(other.conflicts);
    }

    pub fn total(&self) -> usize {
        self.added + self.updated + self.skipped + self.conflicted
    }

    /// The outcome of a single-record result.
    pub fn outcome(&self) -> Option<MergeOutcome> {
        if self.total() != 1 {
            return None;
        }
        Some(if self.added == 1 {
            MergeOutcome::Added
        } else if self.updated == 1 {
            MergeOutcome::Updated
        } else if self.skipped == 1 {
            MergeOutcome::Skipped
        } else {
            MergeOutcome::Conflicted
        })
    }
}
