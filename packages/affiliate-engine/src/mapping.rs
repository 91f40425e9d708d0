//! Per-source field mapping tables.
//!
//! Every source ships records with its own keys and formats. A
//! [`FieldMappingTable`] states, per source and version, which raw key feeds
//! which canonical [`Field`] and how the raw value is parsed. Records are
//! validated against their table at ingestion time, so the merge step only
//! ever sees typed [`FieldValue`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConfigError, ValidationError};
use crate::types::{
    normalize_domain, normalize_network, Commission, Field, FieldValue, IdentityKey, Provenance,
    RawRecord, RecordId,
};

/// How a raw JSON value becomes a [`FieldValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Text,
    Lowercase,
    Domain,
    Url,
    Number,
    Integer,
    Commission,
    Tags,
}

impl Transform {
    pub fn apply(&self, field: Field, raw: &Value) -> Result<FieldValue, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidValue { field, reason };

        match self {
            Transform::Text => text(raw).map(FieldValue::Text).ok_or_else(|| invalid(expected("text", raw))),
            Transform::Lowercase => text(raw)
                .map(|t| FieldValue::Text(t.to_lowercase()))
                .ok_or_else(|| invalid(expected("text", raw))),
            Transform::Domain => text(raw)
                .and_then(|t| normalize_domain(&t))
                .map(FieldValue::Text)
                .ok_or_else(|| invalid(expected("domain", raw))),
            Transform::Url => text(raw)
                .and_then(|t| url::Url::parse(&t).ok())
                .filter(|u| matches!(u.scheme(), "http" | "https"))
                .map(|u| FieldValue::Text(u.to_string()))
                .ok_or_else(|| invalid(expected("http(s) url", raw))),
            Transform::Number => number(raw)
                .map(FieldValue::Number)
                .ok_or_else(|| invalid(expected("number", raw))),
            Transform::Integer => number(raw)
                .filter(|n| n.fract() == 0.0)
                .map(FieldValue::Number)
                .ok_or_else(|| invalid(expected("integer", raw))),
            Transform::Commission => commission(raw)
                .map(FieldValue::Commission)
                .ok_or_else(|| invalid(expected("commission", raw))),
            Transform::Tags => tags(raw)
                .map(FieldValue::Tags)
                .ok_or_else(|| invalid(expected("tag list", raw))),
        }
    }
}

fn expected(what: &str, raw: &Value) -> String {
    format!("expected {what}, got {raw}")
}

fn text(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn number(raw: &Value) -> Option<f64> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite() && *n >= 0.0)
}

/// Accepts `12`, `"12%"`, `"$5"`, `"5 flat"` or `{"kind": "flat", "amount": 5}`.
fn commission(raw: &Value) -> Option<Commission> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64().map(Commission::percentage),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            if let Some(pct) = s.strip_suffix('%') {
                pct.trim().parse().ok().map(Commission::percentage)
            } else if let Some(flat) = s.strip_prefix('$') {
                flat.trim().parse().ok().map(Commission::flat)
            } else if let Some(flat) = s.strip_suffix("flat") {
                flat.trim().parse().ok().map(Commission::flat)
            } else {
                s.parse().ok().map(Commission::percentage)
            }
        }
        Value::Object(_) => serde_json::from_value(raw.clone()).ok(),
        _ => None,
    }?;

    (parsed.amount.is_finite() && parsed.amount >= 0.0).then_some(parsed)
}

fn tags(raw: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match raw {
        Value::Array(values) => values.iter().filter_map(text).collect(),
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => return None,
    };

    let mut tags: Vec<String> = items
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    Some(tags)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: Field,
    #[serde(default)]
    pub transform: Transform,
}

/// Mapping from one source's raw keys to canonical fields, at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMappingTable {
    pub source: String,
    pub version: u32,
    pub rules: BTreeMap<String, FieldRule>,
}

impl FieldMappingTable {
    pub fn new(source: impl Into<String>, version: u32) -> Self {
        Self {
            source: source.into(),
            version,
            rules: BTreeMap::new(),
        }
    }

    pub fn map(mut self, raw_key: impl Into<String>, field: Field, transform: Transform) -> Self {
        self.rules.insert(raw_key.into(), FieldRule { field, transform });
        self
    }

    /// A table must be able to derive an identity key and must not feed one
    /// field from two raw keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for rule in self.rules.values() {
            if !seen.insert(rule.field) {
                return Err(ConfigError::AmbiguousField {
                    source_id: self.source.clone(),
                    version: self.version,
                    field: rule.field,
                });
            }
        }

        if !seen.contains(&Field::Domain) {
            return Err(ConfigError::MissingIdentityField {
                source_id: self.source.clone(),
                version: self.version,
                field: Field::Domain,
            });
        }
        Ok(())
    }

    /// Apply the table to a raw record. Unmapped keys and null values are
    /// ignored; a mapped value that fails its transform rejects the record.
    pub fn apply(&self, record: &RawRecord) -> Result<BTreeMap<Field, FieldValue>, ValidationError> {
        let mut fields = BTreeMap::new();

        for (raw_key, raw_value) in &record.fields {
            let Some(rule) = self.rules.get(raw_key) else {
                debug!(source = %record.source, key = %raw_key, "ignoring unmapped field");
                continue;
            };
            if raw_value.is_null() {
                continue;
            }

            let transform = match rule.field {
                Field::Domain => Transform::Domain,
                _ => rule.transform,
            };
            let mut value = transform.apply(rule.field, raw_value)?;
            if rule.field == Field::Network {
                if let FieldValue::Text(network) = &value {
                    value = FieldValue::Text(normalize_network(network));
                }
            }
            fields.insert(rule.field, value);
        }

        if !fields.contains_key(&Field::Domain) {
            return Err(ValidationError::MissingField(Field::Domain));
        }
        Ok(fields)
    }
}

/// A raw record after mapping: typed fields plus identity and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub id: RecordId,
    pub key: IdentityKey,
    pub provenance: Provenance,
    pub fields: BTreeMap<Field, FieldValue>,
}

/// All mapping tables, keyed by source then version.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    tables: BTreeMap<String, BTreeMap<u32, FieldMappingTable>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: impl IntoIterator<Item = FieldMappingTable>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for table in tables {
            registry.register(table)?;
        }
        Ok(registry)
    }

    /// Load a JSON array of tables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let tables: Vec<FieldMappingTable> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_tables(tables)
    }

    pub fn register(&mut self, table: FieldMappingTable) -> Result<(), ConfigError> {
        table.validate()?;

        let versions = self.tables.entry(table.source.clone()).or_default();
        if versions.contains_key(&table.version) {
            return Err(ConfigError::DuplicateMapping {
                source_id: table.source,
                version: table.version,
            });
        }
        versions.insert(table.version, table);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// The pinned version, or the latest registered one.
    pub fn resolve(&self, source: &str, version: Option<u32>) -> Result<&FieldMappingTable, ValidationError> {
        let versions = self
            .tables
            .get(source)
            .ok_or_else(|| ValidationError::UnknownSource(source.to_string()))?;

        let table = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        table.ok_or_else(|| ValidationError::UnknownMappingVersion {
            source_id: source.to_string(),
            version: version.unwrap_or_default(),
        })
    }

    pub fn map_record(&self, record: &RawRecord) -> Result<MappedRecord, ValidationError> {
        let table = self.resolve(&record.source, record.mapping_version)?;
        let fields = table.apply(record)?;

        let domain = fields
            .get(&Field::Domain)
            .and_then(FieldValue::as_text)
            .ok_or(ValidationError::MissingField(Field::Domain))?;
        let network = fields.get(&Field::Network).and_then(FieldValue::as_text);
        let key = IdentityKey::new(domain, network);

        let id = record.id();
        Ok(MappedRecord {
            provenance: Provenance {
                source: record.source.clone(),
                record_id: id.clone(),
                trust_rank: record.trust_rank,
                ingested_at: record.ingested_at,
            },
            id,
            key,
            fields,
        })
    }
}
