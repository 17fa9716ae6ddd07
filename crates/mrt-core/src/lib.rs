//! Core domain model and fingerprinting for the model release tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mrt-core";

/// Kind of external source an item was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Website,
    Github,
    Huggingface,
    Twitter,
    Arxiv,
    News,
    Reddit,
}

impl SourceType {
    pub const ALL: [SourceType; 7] = [
        SourceType::Website,
        SourceType::Github,
        SourceType::Huggingface,
        SourceType::Twitter,
        SourceType::Arxiv,
        SourceType::News,
        SourceType::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Website => "website",
            SourceType::Github => "github",
            SourceType::Huggingface => "huggingface",
            SourceType::Twitter => "twitter",
            SourceType::Arxiv => "arxiv",
            SourceType::News => "news",
            SourceType::Reddit => "reddit",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown source type: {s}"))
    }
}

/// Company priority tier, inherited by every event the company produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized unit produced from one raw source entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub source_type: SourceType,
    pub company: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Source-native identifier (tag, sha, model revision, fragment hash).
    pub raw_ref: String,
    #[serde(default)]
    pub model_size: Option<String>,
}

impl CandidateItem {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.company, self.source_type, &self.raw_ref)
    }
}

/// Deterministic duplicate-detection key: sha256 over company, source type and raw ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(company: &str, source_type: SourceType, raw_ref: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(company.as_bytes());
        hasher.update([0x1f]);
        hasher.update(source_type.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(raw_ref.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed fingerprint, e.g. one read back from storage.
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Substitute reference for sources that cannot provide a stable native id.
pub fn content_ref(title: &str, body: &str, url: &str) -> String {
    let joined = format!("{title}\u{1f}{body}\u{1f}{url}");
    sha256_hex(joined.as_bytes())
}

/// A candidate that passed classification and deduplication. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub fingerprint: Fingerprint,
    pub confidence: f64,
    pub priority: Priority,
    pub matched_keywords: Vec<String>,
    pub accepted_at: DateTime<Utc>,
    pub item: CandidateItem,
}

/// Persisted (company, fingerprint) -> first-seen timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationRecord {
    pub company: String,
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
}

/// Identity of one `(company, source)` unit of work inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId {
    pub company: String,
    pub source_type: SourceType,
    /// Position of the source in the company's configured source list.
    pub source_index: usize,
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.company, self.source_type, self.source_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairFailureKind {
    Fetch,
    /// The fetched payload does not have the shape its source type promises.
    Normalize,
    Store,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailure {
    pub pair: PairId,
    pub kind: PairFailureKind,
    pub cause: String,
}

/// New release events produced by one orchestrator run, in pair order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseEventBatch {
    pub run_id: Uuid,
    pub events: Vec<ReleaseEvent>,
}

impl ReleaseEventBatch {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReleaseEvent> {
        self.events.iter()
    }
}

/// Per-run counters surfaced to callers and monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pairs: usize,
    pub candidates: usize,
    pub new_events: usize,
    pub duplicates: usize,
    pub not_release: usize,
    pub malformed_items: usize,
    pub failed_pairs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_scoped() {
        let a = Fingerprint::compute("OpenAI", SourceType::Github, "v1.0.0");
        let b = Fingerprint::compute("OpenAI", SourceType::Github, "v1.0.0");
        let other_type = Fingerprint::compute("OpenAI", SourceType::Website, "v1.0.0");
        let other_company = Fingerprint::compute("Meta", SourceType::Github, "v1.0.0");
        assert_eq!(a, b);
        assert_ne!(a, other_type);
        assert_ne!(a, other_company);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_fields_do_not_run_together() {
        let a = Fingerprint::compute("ab", SourceType::News, "c");
        let b = Fingerprint::compute("a", SourceType::News, "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn content_ref_changes_with_any_field() {
        let base = content_ref("t", "b", "u");
        assert_eq!(base, content_ref("t", "b", "u"));
        assert_ne!(base, content_ref("t2", "b", "u"));
        assert_ne!(base, content_ref("t", "b2", "u"));
        assert_ne!(base, content_ref("t", "b", "u2"));
    }

    #[test]
    fn source_type_round_trips_through_strings() {
        for t in SourceType::ALL {
            assert_eq!(t.as_str().parse::<SourceType>().unwrap(), t);
        }
        assert_eq!("HuggingFace".parse::<SourceType>().unwrap(), SourceType::Huggingface);
        assert!("myspace".parse::<SourceType>().is_err());
        let json = serde_json::to_string(&SourceType::Huggingface).unwrap();
        assert_eq!(json, "\"huggingface\"");
    }

    #[test]
    fn pair_id_display_names_the_pair() {
        let pair = PairId {
            company: "OpenAI".into(),
            source_type: SourceType::Website,
            source_index: 2,
        };
        assert_eq!(pair.to_string(), "OpenAI/website#2");
    }
}
