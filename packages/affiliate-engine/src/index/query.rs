//! Structured program queries, deterministic ordering and pagination.
//!
//! Every sort order ends with the identity key, so two searches over the
//! same index state always return the same sequence.

use std::cmp::Ordering;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{CanonicalProgram, CommissionKind, Field};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

const CURSOR_PREFIX: &str = "offset:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Text relevance, highest first. Without a text filter every program
    /// scores zero and this falls back to identity key order.
    #[default]
    Relevance,
    /// Percentage commission, highest first; flat or missing commissions last.
    Commission,
    RecentlyModified,
    IdentityKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niche: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_commission_percent: Option<f64>,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl ProgramQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn niche(mut self, niche: impl Into<String>) -> Self {
        self.niche = Some(niche.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn min_commission_percent(mut self, percent: f64) -> Self {
        self.min_commission_percent = Some(percent);
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Lowercased, trimmed, empty filters removed, limit clamped.
    pub fn normalized(&self) -> Self {
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
                .filter(|v| !v.is_empty())
        };

        Self {
            niche: clean(&self.niche),
            network: clean(&self.network),
            text: clean(&self.text),
            min_commission_percent: self.min_commission_percent.filter(|p| p.is_finite()),
            sort: self.sort,
            limit: Some(self.page_size()),
            cursor: self.cursor.clone().filter(|c| !c.is_empty()),
        }
    }

    /// Canonical cache signature: the JSON form of the normalized query.
    pub fn signature(&self) -> String {
        serde_json::to_string(&self.normalized()).unwrap_or_default()
    }

    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn tokens(&self) -> Vec<String> {
        self.text
            .as_deref()
            .map(|t| t.split_whitespace().map(str::to_lowercase).collect())
            .unwrap_or_default()
    }

    /// Whether a program passes every filter. Ignores paging.
    pub fn matches(&self, program: &CanonicalProgram) -> bool {
        if let Some(niche) = &self.niche {
            let niche = niche.trim().to_lowercase();
            let in_niche = program
                .text(Field::Niche)
                .is_some_and(|n| n.to_lowercase() == niche)
                || program.tags().iter().any(|tag| *tag == niche);
            if !in_niche {
                return false;
            }
        }

        if let Some(network) = &self.network {
            if network_of(program) != network.trim().to_lowercase() {
                return false;
            }
        }

        if let Some(min) = self.min_commission_percent {
            match program.commission() {
                Some(c) if c.kind == CommissionKind::Percentage && c.amount >= min => {}
                _ => return false,
            }
        }

        let tokens = self.tokens();
        tokens.is_empty() || relevance(program, &tokens) > 0
    }

    /// Relevance of a program to this query's text.
    pub fn score(&self, program: &CanonicalProgram) -> u32 {
        relevance(program, &self.tokens())
    }

    /// Filter and order a candidate set.
    pub fn select<'a, I>(&self, programs: I) -> Vec<&'a CanonicalProgram>
    where
        I: IntoIterator<Item = &'a CanonicalProgram>,
    {
        let tokens = self.tokens();
        let mut scored: Vec<(u32, &CanonicalProgram)> = programs
            .into_iter()
            .filter(|p| self.matches(p))
            .map(|p| (relevance(p, &tokens), p))
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            let primary = match self.sort {
                SortOrder::Relevance => score_b.cmp(score_a),
                SortOrder::Commission => percentage(b).total_cmp(&percentage(a)),
                SortOrder::RecentlyModified => b.last_modified.cmp(&a.last_modified),
                SortOrder::IdentityKey => Ordering::Equal,
            };
            primary.then_with(|| a.key.cmp(&b.key))
        });

        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// Select and cut one page.
    pub fn paginate<'a, I>(&self, programs: I) -> Result<ProgramPage, ValidationError>
    where
        I: IntoIterator<Item = &'a CanonicalProgram>,
    {
        let offset = match &self.cursor {
            Some(cursor) => decode_cursor(cursor)?,
            None => 0,
        };
        let limit = self.page_size();

        let selected = self.select(programs);
        let total = selected.len();
        let items: Vec<CanonicalProgram> = selected
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        let next = offset + items.len();
        let next_cursor = (next < total).then(|| encode_cursor(next));

        Ok(ProgramPage {
            items,
            next_cursor,
            total,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramPage {
    pub items: Vec<CanonicalProgram>,
    pub next_cursor: Option<String>,
    /// Matches across all pages.
    pub total: usize,
}

pub fn encode_cursor(offset: usize) -> String {
    URL_SAFE_NO_PAD.encode(format!("{CURSOR_PREFIX}{offset}"))
}

pub fn decode_cursor(cursor: &str) -> Result<usize, ValidationError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ValidationError::InvalidCursor)?;
    let text = String::from_utf8(bytes).map_err(|_| ValidationError::InvalidCursor)?;
    text.strip_prefix(CURSOR_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or(ValidationError::InvalidCursor)
}

/// Network segment of the identity key.
pub fn network_of(program: &CanonicalProgram) -> &str {
    program
        .key
        .as_str()
        .split_once(':')
        .map(|(network, _)| network)
        .unwrap_or_default()
}

fn percentage(program: &CanonicalProgram) -> f64 {
    match program.commission() {
        Some(c) if c.kind == CommissionKind::Percentage => c.amount,
        _ => f64::NEG_INFINITY,
    }
}

fn relevance(program: &CanonicalProgram, tokens: &[String]) -> u32 {
    if tokens.is_empty() {
        return 0;
    }

    let name = program.text(Field::Name).unwrap_or_default().to_lowercase();
    let description = program
        .text(Field::Description)
        .unwrap_or_default()
        .to_lowercase();
    let domain = program.text(Field::Domain).unwrap_or_default();

    tokens
        .iter()
        .map(|token| {
            let mut score = 0;
            if name.contains(token.as_str()) {
                score += 3;
            }
            if program.tags().iter().any(|tag| tag.contains(token.as_str())) {
                score += 2;
            }
            if description.contains(token.as_str()) {
                score += 1;
            }
            if domain.contains(token.as_str()) {
                score += 1;
            }
            score
        })
        .sum()
}
