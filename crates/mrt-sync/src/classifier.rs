//! Keyword release classifier with an optional semantic scorer.

use std::sync::Arc;

use mrt_core::CandidateItem;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::warn;

use crate::config::ClassifierConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifierError {
    #[error("keyword {term:?} cannot be compiled: {reason}")]
    InvalidTerm { term: String, reason: String },
    #[error("semantic scorer unavailable: {0}")]
    ScorerUnavailable(String),
}

/// External text-classification model. Scores are clamped to `[0, 1]`.
pub trait SemanticScorer: Send + Sync {
    fn score(&self, item: &CandidateItem) -> Result<f64, ClassifierError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_release: bool,
    pub confidence: f64,
    /// Signal terms first, then subject terms, each in configuration order.
    pub matched_keywords: Vec<String>,
}

#[derive(Debug, Clone)]
struct Term {
    keyword: String,
    pattern: Regex,
}

impl Term {
    fn compile(keyword: &str) -> Result<Self, ClassifierError> {
        let keyword = keyword.trim();
        let words = keyword
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s+");
        // Word boundaries only where the term itself starts/ends on a word character.
        let starts_word = keyword.chars().next().is_some_and(is_word_char);
        let ends_word = keyword.chars().last().is_some_and(is_word_char);
        let pattern = format!(
            "{}{}{}",
            if starts_word { r"\b" } else { "" },
            words,
            if ends_word { r"\b" } else { "" }
        );
        let pattern = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ClassifierError::InvalidTerm {
                term: keyword.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            keyword: keyword.to_string(),
            pattern,
        })
    }

    /// Match spans as `(field, start, end)`, field 0 being the title and 1 the body.
    fn spans(&self, item: &CandidateItem) -> Vec<(usize, usize, usize)> {
        [item.title.as_str(), item.body.as_str()]
            .into_iter()
            .enumerate()
            .flat_map(|(field, text)| {
                self.pattern
                    .find_iter(text)
                    .map(move |m| (field, m.start(), m.end()))
            })
            .collect()
    }
}

/// Keywords of `terms` found in the item. A term counts only if at least one
/// of its matches lies outside every longer match of another term in the same
/// set, so "large language model" does not also count "language model".
fn matched_keywords(terms: &[Term], item: &CandidateItem) -> Vec<String> {
    let spans = terms.iter().map(|t| t.spans(item)).collect::<Vec<_>>();
    let enclosed = |own: usize, (field, start, end): (usize, usize, usize)| {
        spans.iter().enumerate().any(|(other, found)| {
            other != own
                && found.iter().any(|&(f, s, e)| {
                    f == field && s <= start && end <= e && e - s > end - start
                })
        })
    };
    terms
        .iter()
        .enumerate()
        .filter(|(own, _)| spans[*own].iter().any(|&span| !enclosed(*own, span)))
        .map(|(_, t)| t.keyword.clone())
        .collect()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn compile_terms(keywords: &[String]) -> Result<Vec<Term>, ClassifierError> {
    let mut terms: Vec<Term> = Vec::new();
    for keyword in keywords.iter().filter(|k| !k.trim().is_empty()) {
        if terms.iter().any(|t| t.keyword.eq_ignore_ascii_case(keyword.trim())) {
            continue;
        }
        terms.push(Term::compile(keyword)?);
    }
    Ok(terms)
}

/// Immutable after construction; safe to share across pair tasks.
#[derive(Clone)]
pub struct ReleaseClassifier {
    signals: Vec<Term>,
    subjects: Vec<Term>,
    threshold: f64,
    divisor: f64,
    semantic_weight: f64,
    scorer: Option<Arc<dyn SemanticScorer>>,
}

impl std::fmt::Debug for ReleaseClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseClassifier")
            .field("signals", &self.signals.len())
            .field("subjects", &self.subjects.len())
            .field("threshold", &self.threshold)
            .field("divisor", &self.divisor)
            .field("semantic_weight", &self.semantic_weight)
            .field("scorer", &self.scorer.is_some())
            .finish()
    }
}

impl ReleaseClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        Ok(Self {
            signals: compile_terms(&config.signal_keywords)?,
            subjects: compile_terms(&config.subject_keywords)?,
            threshold: config.threshold.clamp(0.0, 1.0),
            divisor: config.divisor,
            semantic_weight: config.semantic_weight.clamp(0.0, 1.0),
            scorer: None,
        })
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn classify(&self, item: &CandidateItem) -> Classification {
        let signals = matched_keywords(&self.signals, item);
        let subjects = matched_keywords(&self.subjects, item);

        let has_signal = !signals.is_empty();
        let has_subject = !subjects.is_empty();
        let mut matched_keywords = signals;
        matched_keywords.extend(subjects);

        let lexical = (matched_keywords.len() as f64 / self.divisor).min(1.0);
        let confidence = self.combine(item, lexical);

        Classification {
            is_release: has_signal && has_subject && confidence >= self.threshold,
            confidence,
            matched_keywords,
        }
    }

    fn combine(&self, item: &CandidateItem, lexical: f64) -> f64 {
        let Some(scorer) = self.scorer.as_ref().filter(|_| self.semantic_weight > 0.0) else {
            return lexical;
        };
        match scorer.score(item) {
            Ok(semantic) => {
                let semantic = if semantic.is_finite() { semantic.clamp(0.0, 1.0) } else { 0.0 };
                let w = self.semantic_weight;
                ((1.0 - w) * lexical + w * semantic).clamp(0.0, 1.0)
            }
            Err(err) => {
                warn!(company = %item.company, title = %item.title, error = %err, "semantic scoring failed; using lexical score");
                lexical
            }
        }
    }
}
