//! Deterministic field-by-field merge.
//!
//! Precedence for a single field, highest first:
//! 1. higher source trust rank
//! 2. more recent ingestion timestamp
//! 3. the configured [`TieBreak`] policy
//!
//! Semantically incompatible values (different [`FieldValue`] shapes, or a
//! percentage vs a flat commission) are surfaced as conflicts. The existing
//! value is kept unless the incoming source strictly outranks it on trust.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mapping::MappedRecord;
use crate::types::{
    CanonicalProgram, ConflictDescriptor, ConflictReason, FieldEntry, MergeOutcome, Provenance,
};

/// Resolution when trust rank and ingestion time are both equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lexicographically smaller (source, record id) wins. Independent of
    /// arrival order.
    #[default]
    SourceOrder,
    /// First writer wins.
    KeepExisting,
    /// Last writer wins.
    PreferIncoming,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "source_order" => Ok(TieBreak::SourceOrder),
            "keep_existing" => Ok(TieBreak::KeepExisting),
            "prefer_incoming" => Ok(TieBreak::PreferIncoming),
            other => Err(format!(
                "unknown tie-break policy '{other}' (expected source_order, keep_existing or prefer_incoming)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Incoming,
    Existing,
    /// Both values come from the same record.
    Same,
}

pub fn precedence(existing: &Provenance, incoming: &Provenance, tie_break: TieBreak) -> Precedence {
    if existing.record_id == incoming.record_id {
        return Precedence::Same;
    }

    let by_rank = incoming
        .trust_rank
        .cmp(&existing.trust_rank)
        .then_with(|| incoming.ingested_at.cmp(&existing.ingested_at));

    match by_rank {
        Ordering::Greater => Precedence::Incoming,
        Ordering::Less => Precedence::Existing,
        Ordering::Equal => match tie_break {
            TieBreak::KeepExisting => Precedence::Existing,
            TieBreak::PreferIncoming => Precedence::Incoming,
            TieBreak::SourceOrder => {
                let incoming_order = (&incoming.source, &incoming.record_id);
                let existing_order = (&existing.source, &existing.record_id);
                if incoming_order < existing_order {
                    Precedence::Incoming
                } else {
                    Precedence::Existing
                }
            }
        },
    }
}

/// The result of merging one record into the current state.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// Next state. `version` still holds the version it was derived from;
    /// the index assigns the new one on commit.
    pub program: CanonicalProgram,
    pub outcome: MergeOutcome,
    pub conflicts: Vec<ConflictDescriptor>,
}

impl MergePlan {
    /// Whether committing this plan changes canonical state.
    pub fn mutates(&self) -> bool {
        matches!(self.outcome, MergeOutcome::Added | MergeOutcome::Updated)
    }
}

pub fn merge_record(
    current: Option<&CanonicalProgram>,
    incoming: &MappedRecord,
    tie_break: TieBreak,
    now: DateTime<Utc>,
) -> MergePlan {
    let Some(current) = current else {
        return MergePlan {
            program: create(incoming, now),
            outcome: MergeOutcome::Added,
            conflicts: Vec::new(),
        };
    };

    let mut next = current.clone();
    let mut changed = false;
    let mut conflicts = Vec::new();

    for (field, value) in &incoming.fields {
        let Some(entry) = next.fields.get_mut(field) else {
            next.fields.insert(
                *field,
                FieldEntry {
                    value: value.clone(),
                    provenance: incoming.provenance.clone(),
                },
            );
            changed = true;
            continue;
        };

        let winner = precedence(&entry.provenance, &incoming.provenance, tie_break);
        if winner == Precedence::Same {
            continue;
        }

        if !entry.value.is_compatible_with(value) {
            let outranks = incoming.provenance.trust_rank > entry.provenance.trust_rank;
            let (chosen, reason) = if outranks {
                (value.clone(), ConflictReason::IncompatibleOverriddenByTrust)
            } else {
                (entry.value.clone(), ConflictReason::IncompatibleKeptExisting)
            };

            conflicts.push(ConflictDescriptor {
                key: incoming.key.clone(),
                field: *field,
                existing: entry.value.clone(),
                incoming: value.clone(),
                chosen,
                reason,
                existing_source: entry.provenance.source.clone(),
                incoming_source: incoming.provenance.source.clone(),
                incoming_record: incoming.id.clone(),
            });

            if outranks {
                entry.value = value.clone();
                entry.provenance = incoming.provenance.clone();
                changed = true;
            }
            continue;
        }

        if winner == Precedence::Incoming {
            // Provenance moves even when the value is equal, so later
            // lower-ranked records cannot displace it.
            entry.value = value.clone();
            entry.provenance = incoming.provenance.clone();
            changed = true;
        }
    }

    let outcome = if changed {
        next.refresh_contributors();
        next.last_modified = now;
        MergeOutcome::Updated
    } else if !conflicts.is_empty() {
        MergeOutcome::Conflicted
    } else {
        MergeOutcome::Skipped
    };

    MergePlan {
        program: next,
        outcome,
        conflicts,
    }
}

fn create(incoming: &MappedRecord, now: DateTime<Utc>) -> CanonicalProgram {
    let fields = incoming
        .fields
        .iter()
        .map(|(field, value)| {
            (
                *field,
                FieldEntry {
                    value: value.clone(),
                    provenance: incoming.provenance.clone(),
                },
            )
        })
        .collect();

    let mut program = CanonicalProgram {
        key: incoming.key.clone(),
        fields,
        contributors: Default::default(),
        version: 0,
        created_at: now,
        last_modified: now,
    };
    program.refresh_contributors();
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Commission, Field, FieldValue, IdentityKey, RecordId};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(id: &str, source: &str, trust: u32, secs: i64, fields: &[(Field, FieldValue)]) -> MappedRecord {
        let record_id: RecordId = serde_json::from_value(serde_json::json!(id)).unwrap();
        MappedRecord {
            id: record_id.clone(),
            key: IdentityKey::from("direct:fitgear.com"),
            provenance: Provenance {
                source: source.to_string(),
                record_id,
                trust_rank: trust,
                ingested_at: at(secs),
            },
            fields: fields.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }

    fn pct(n: f64) -> FieldValue {
        FieldValue::Commission(Commission::percentage(n))
    }

    fn apply(records: &[&MappedRecord], tie_break: TieBreak) -> CanonicalProgram {
        let mut state: Option<CanonicalProgram> = None;
        for r in records {
            let plan = merge_record(state.as_ref(), r, tie_break, at(1_000));
            state = Some(plan.program);
        }
        state.unwrap()
    }

    #[test]
    fn higher_trust_wins_over_recency() {
        let existing = record("a", "feed", 2, 10, &[]).provenance;
        let incoming = record("b", "scrape", 1, 20, &[]).provenance;
        assert_eq!(precedence(&existing, &incoming, TieBreak::SourceOrder), Precedence::Existing);
        assert_eq!(precedence(&incoming, &existing, TieBreak::SourceOrder), Precedence::Incoming);
    }

    #[test]
    fn equal_trust_prefers_recent() {
        let existing = record("a", "feed", 1, 10, &[]).provenance;
        let incoming = record("b", "feed", 1, 20, &[]).provenance;
        assert_eq!(precedence(&existing, &incoming, TieBreak::KeepExisting), Precedence::Incoming);
    }

    #[test]
    fn full_tie_follows_policy() {
        let existing = record("b", "zeta", 1, 10, &[]).provenance;
        let incoming = record("a", "alpha", 1, 10, &[]).provenance;

        assert_eq!(precedence(&existing, &incoming, TieBreak::KeepExisting), Precedence::Existing);
        assert_eq!(precedence(&existing, &incoming, TieBreak::PreferIncoming), Precedence::Incoming);
        assert_eq!(precedence(&existing, &incoming, TieBreak::SourceOrder), Precedence::Incoming);
        assert_eq!(precedence(&incoming, &existing, TieBreak::SourceOrder), Precedence::Existing);
    }

    #[test]
    fn tie_break_parses_from_config_strings() {
        assert_eq!("keep_existing".parse::<TieBreak>().unwrap(), TieBreak::KeepExisting);
        assert!("coin_flip".parse::<TieBreak>().is_err());
    }

    #[test]
    fn new_key_is_added() {
        let a = record("a", "feed", 1, 10, &[(Field::Commission, pct(10.0))]);
        let plan = merge_record(None, &a, TieBreak::SourceOrder, at(50));
        assert_eq!(plan.outcome, MergeOutcome::Added);
        assert_eq!(plan.program.contributors.len(), 1);
    }

    #[test]
    fn higher_trust_commission_updates() {
        let a = record("a", "feed", 1, 10, &[(Field::Commission, pct(10.0))]);
        let b = record("b", "network", 2, 5, &[(Field::Commission, pct(12.0))]);

        let first = merge_record(None, &a, TieBreak::SourceOrder, at(50)).program;
        let plan = merge_record(Some(&first), &b, TieBreak::SourceOrder, at(60));

        assert_eq!(plan.outcome, MergeOutcome::Updated);
        assert_eq!(plan.program.commission(), Some(Commission::percentage(12.0)));
    }

    #[test]
    fn arrival_order_does_not_change_the_result() {
        let a = record(
            "a",
            "feed",
            1,
            30,
            &[
                (Field::Commission, pct(10.0)),
                (Field::Name, FieldValue::Text("FitGear".into())),
            ],
        );
        let b = record(
            "b",
            "network",
            3,
            10,
            &[
                (Field::Commission, FieldValue::Commission(Commission::flat(5.0))),
                (Field::CookieDays, FieldValue::Number(30.0)),
            ],
        );

        let ab = apply(&[&a, &b], TieBreak::SourceOrder);
        let ba = apply(&[&b, &a], TieBreak::SourceOrder);

        assert_eq!(ab.fields, ba.fields);
        assert_eq!(ab.contributors, ba.contributors);
        assert_eq!(ab.commission(), Some(Commission::flat(5.0)));
    }

    #[test]
    fn incompatible_lower_trust_value_is_kept_out_and_reported() {
        let a = record("a", "network", 2, 10, &[(Field::Commission, pct(10.0))]);
        let b = record(
            "b",
            "scrape",
            2,
            20,
            &[(Field::Commission, FieldValue::Commission(Commission::flat(5.0)))],
        );

        let first = merge_record(None, &a, TieBreak::SourceOrder, at(50)).program;
        let plan = merge_record(Some(&first), &b, TieBreak::SourceOrder, at(60));

        assert_eq!(plan.outcome, MergeOutcome::Conflicted);
        assert_eq!(plan.program.commission(), Some(Commission::percentage(10.0)));
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].reason, ConflictReason::IncompatibleKeptExisting);
        assert_eq!(plan.conflicts[0].chosen, pct(10.0));
    }

    #[test]
    fn same_record_is_skipped() {
        let a = record("a", "feed", 1, 10, &[(Field::Commission, pct(10.0))]);
        let first = merge_record(None, &a, TieBreak::PreferIncoming, at(50)).program;
        let plan = merge_record(Some(&first), &a, TieBreak::PreferIncoming, at(60));

        assert_eq!(plan.outcome, MergeOutcome::Skipped);
        assert!(!plan.mutates());
        assert_eq!(plan.program, first);
    }
}
