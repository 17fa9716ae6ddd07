//! Source payload contracts, per-source normalizers, and fetcher collaborators.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use mrt_core::{content_ref, sha256_hex, CandidateItem, SourceType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

pub mod fetch;
pub mod html;

pub use fetch::{
    FetchError, Fetcher, FetcherRegistry, GithubFetcher, HuggingfaceFetcher, StaticFetcher,
    WebsiteFetcher,
};
pub use html::{extract_fragments, FragmentSelectors};

pub const CRATE_NAME: &str = "mrt-adapters";

const MAX_BODY_CHARS: usize = 2000;
const MAX_TITLE_CHARS: usize = 200;

/// Where and how to collect raw entries for one configured source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Website(WebsiteSource),
    Github(GithubSource),
    Huggingface(HuggingfaceSource),
    Feed(FeedSource),
}

impl SourceConfig {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceConfig::Website(_) => SourceType::Website,
            SourceConfig::Github(_) => SourceType::Github,
            SourceConfig::Huggingface(_) => SourceType::Huggingface,
            SourceConfig::Feed(feed) => feed.source_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteSource {
    pub url: String,
    pub selector: String,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub body_selector: Option<String>,
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default)]
    pub date_selector: Option<String>,
}

impl WebsiteSource {
    pub fn fragment_selectors(&self) -> FragmentSelectors {
        FragmentSelectors {
            item: self.selector.clone(),
            title: self.title_selector.clone(),
            body: self.body_selector.clone(),
            link: self.link_selector.clone(),
            date: self.date_selector.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubSource {
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuggingfaceSource {
    #[serde(default)]
    pub orgs: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Also list the hub-wide trending models, whatever their author.
    #[serde(default)]
    pub trending: bool,
}

/// Placeholder for twitter/arxiv/news/reddit sources; no built-in fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSource {
    pub source_type: SourceType,
    pub url: String,
}

/// One selector match from a scraped page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteFragment {
    pub position: usize,
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsitePayload {
    pub page_url: String,
    pub fragments: Vec<WebsiteFragment>,
}

/// Release, tag and commit metadata for one repository, as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubPayload {
    pub repo: String,
    #[serde(default)]
    pub releases: Vec<JsonValue>,
    #[serde(default)]
    pub tags: Vec<JsonValue>,
    #[serde(default)]
    pub commits: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HuggingfacePayload {
    #[serde(default)]
    pub models: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPayload {
    pub source_type: SourceType,
    #[serde(default)]
    pub entries: Vec<JsonValue>,
}

/// Already-fetched source payload, one closed variant per payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum RawPayload {
    Website(WebsitePayload),
    Github(Vec<GithubPayload>),
    Huggingface(HuggingfacePayload),
    Feed(FeedPayload),
}

impl RawPayload {
    pub fn source_type(&self) -> SourceType {
        match self {
            RawPayload::Website(_) => SourceType::Website,
            RawPayload::Github(_) => SourceType::Github,
            RawPayload::Huggingface(_) => SourceType::Huggingface,
            RawPayload::Feed(feed) => feed.source_type,
        }
    }

    /// Number of raw entries carried, before normalization.
    pub fn entry_count(&self) -> usize {
        match self {
            RawPayload::Website(p) => p.fragments.len(),
            RawPayload::Github(repos) => repos
                .iter()
                .map(|r| r.releases.len() + r.tags.len() + r.commits.len())
                .sum(),
            RawPayload::Huggingface(p) => p.models.len(),
            RawPayload::Feed(p) => p.entries.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("declared {declared} source delivered a {actual} payload")]
    SourceMismatch {
        declared: SourceType,
        actual: SourceType,
    },
    #[error("{source_type} {entry} #{index}: missing {field}")]
    MissingField {
        source_type: SourceType,
        entry: &'static str,
        index: usize,
        field: &'static str,
    },
    #[error("{source_type} {entry} #{index}: {reason}")]
    Malformed {
        source_type: SourceType,
        entry: &'static str,
        index: usize,
        reason: String,
    },
}

pub type CandidateStream<'a> =
    Box<dyn Iterator<Item = Result<CandidateItem, NormalizationError>> + Send + 'a>;

/// Turns a raw payload into candidate items.
///
/// The stream is lazy and holds no state between calls; every call re-normalizes
/// from the payload. Malformed entries surface as `Err` items and never end the stream.
pub trait Normalizer: Send + Sync {
    fn normalize<'a>(
        &self,
        declared: SourceType,
        company: &'a str,
        payload: &'a RawPayload,
    ) -> CandidateStream<'a>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadNormalizer;

impl Normalizer for PayloadNormalizer {
    fn normalize<'a>(
        &self,
        declared: SourceType,
        company: &'a str,
        payload: &'a RawPayload,
    ) -> CandidateStream<'a> {
        let actual = payload.source_type();
        if declared != actual {
            return Box::new(std::iter::once(Err(NormalizationError::SourceMismatch {
                declared,
                actual,
            })));
        }
        match payload {
            RawPayload::Website(p) => Box::new(normalize_website(company, p)),
            RawPayload::Github(repos) => Box::new(
                repos
                    .iter()
                    .flat_map(move |repo| normalize_github_repo(company, repo)),
            ),
            RawPayload::Huggingface(p) => Box::new(normalize_huggingface(company, p)),
            RawPayload::Feed(p) => Box::new(normalize_feed(company, p)),
        }
    }
}

pub fn normalize_website<'a>(
    company: &'a str,
    payload: &'a WebsitePayload,
) -> impl Iterator<Item = Result<CandidateItem, NormalizationError>> + Send + 'a {
    payload
        .fragments
        .iter()
        .enumerate()
        .map(move |(index, fragment)| website_candidate(company, &payload.page_url, index, fragment))
}

fn website_candidate(
    company: &str,
    page_url: &str,
    index: usize,
    fragment: &WebsiteFragment,
) -> Result<CandidateItem, NormalizationError> {
    let text = clean_text(&fragment.text);
    let title = fragment
        .title
        .as_deref()
        .map(clean_text)
        .filter(|t| !t.is_empty())
        .or_else(|| (!text.is_empty()).then(|| truncate_chars(&text, MAX_TITLE_CHARS)))
        .ok_or(NormalizationError::MissingField {
            source_type: SourceType::Website,
            entry: "fragment",
            index,
            field: "title",
        })?;
    let body = match fragment.body.as_deref().map(clean_text) {
        Some(body) if !body.is_empty() => body,
        _ => text
            .strip_prefix(title.as_str())
            .map(|rest| rest.trim().to_string())
            .unwrap_or_else(|| text.clone()),
    };
    let permalink = fragment
        .href
        .as_deref()
        .map(|href| resolve_link(page_url, href))
        .filter(|link| link.as_str() != page_url);
    // Listing positions shift whenever a post is added, so the link wins when there is one.
    let raw_ref = match &permalink {
        Some(link) => link.clone(),
        None => {
            let hashed_text = if text.is_empty() { &title } else { &text };
            sha256_hex(format!("{hashed_text}#{}", fragment.position).as_bytes())
        }
    };
    let url = permalink.unwrap_or_else(|| page_url.to_string());

    Ok(candidate(
        SourceType::Website,
        company,
        title,
        body,
        url,
        fragment.published.as_deref().and_then(parse_timestamp),
        raw_ref,
    ))
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
}

#[derive(Debug, Deserialize)]
struct GithubTag {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubCommit {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    commit: GithubCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GithubCommitDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    author: Option<GithubCommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct GithubCommitAuthor {
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

/// Releases and tags first; commits only count when the repository publishes neither.
pub fn normalize_github_repo<'a>(
    company: &'a str,
    repo: &'a GithubPayload,
) -> impl Iterator<Item = Result<CandidateItem, NormalizationError>> + Send + 'a {
    let use_commits = repo.releases.is_empty() && repo.tags.is_empty();
    let releases = repo
        .releases
        .iter()
        .enumerate()
        .filter_map(move |(index, value)| github_release(company, &repo.repo, index, value).transpose());
    let tags = repo
        .tags
        .iter()
        .enumerate()
        .map(move |(index, value)| github_tag(company, &repo.repo, index, value));
    let commits = repo
        .commits
        .iter()
        .take(if use_commits { usize::MAX } else { 0 })
        .enumerate()
        .map(move |(index, value)| github_commit(company, &repo.repo, index, value));
    releases.chain(tags).chain(commits)
}

fn decode<T: for<'de> Deserialize<'de>>(
    value: &JsonValue,
    source_type: SourceType,
    entry: &'static str,
    index: usize,
) -> Result<T, NormalizationError> {
    T::deserialize(value).map_err(|e| NormalizationError::Malformed {
        source_type,
        entry,
        index,
        reason: e.to_string(),
    })
}

fn github_release(
    company: &str,
    repo: &str,
    index: usize,
    value: &JsonValue,
) -> Result<Option<CandidateItem>, NormalizationError> {
    let release: GithubRelease = decode(value, SourceType::Github, "release", index)?;
    if release.draft {
        return Ok(None);
    }
    let tag = non_empty(release.tag_name).ok_or(NormalizationError::MissingField {
        source_type: SourceType::Github,
        entry: "release",
        index,
        field: "tag_name",
    })?;
    let title = non_empty(release.name).unwrap_or_else(|| format!("{repo} {tag}"));
    let url = non_empty(release.html_url)
        .unwrap_or_else(|| format!("https://github.com/{repo}/releases/tag/{tag}"));
    Ok(Some(candidate(
        SourceType::Github,
        company,
        clean_text(&title),
        clean_text(release.body.as_deref().unwrap_or_default()),
        url,
        release.published_at,
        format!("{repo}@{tag}"),
    )))
}

fn github_tag(
    company: &str,
    repo: &str,
    index: usize,
    value: &JsonValue,
) -> Result<CandidateItem, NormalizationError> {
    let tag: GithubTag = decode(value, SourceType::Github, "tag", index)?;
    let name = non_empty(tag.name).ok_or(NormalizationError::MissingField {
        source_type: SourceType::Github,
        entry: "tag",
        index,
        field: "name",
    })?;
    Ok(candidate(
        SourceType::Github,
        company,
        format!("{repo} {name}"),
        String::new(),
        format!("https://github.com/{repo}/releases/tag/{name}"),
        None,
        // Same ref as a release for the tag, so the pair collapses under dedup.
        format!("{repo}@{name}"),
    ))
}

fn github_commit(
    company: &str,
    repo: &str,
    index: usize,
    value: &JsonValue,
) -> Result<CandidateItem, NormalizationError> {
    let commit: GithubCommit = decode(value, SourceType::Github, "commit", index)?;
    let message = non_empty(commit.commit.message).ok_or(NormalizationError::MissingField {
        source_type: SourceType::Github,
        entry: "commit",
        index,
        field: "commit.message",
    })?;
    let (headline, rest) = message.split_once('\n').unwrap_or((message.as_str(), ""));
    let title = clean_text(headline);
    let body = clean_text(rest);
    let url = match (&commit.html_url, &commit.sha) {
        (Some(url), _) if !url.trim().is_empty() => url.clone(),
        (_, Some(sha)) => format!("https://github.com/{repo}/commit/{sha}"),
        _ => format!("https://github.com/{repo}/commits"),
    };
    let raw_ref = match non_empty(commit.sha) {
        Some(sha) => format!("{repo}@{sha}"),
        None => format!("{repo}@{}", content_ref(&title, &body, &url)),
    };
    Ok(candidate(
        SourceType::Github,
        company,
        title,
        body,
        url,
        commit.commit.author.and_then(|a| a.date),
        raw_ref,
    ))
}

#[derive(Debug, Deserialize)]
struct HuggingfaceModel {
    #[serde(default, alias = "modelId")]
    id: Option<String>,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default, rename = "lastModified")]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default, rename = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    pipeline_tag: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "cardData")]
    card_data: Option<HuggingfaceCardData>,
}

#[derive(Debug, Deserialize)]
struct HuggingfaceCardData {
    #[serde(default)]
    description: Option<String>,
}

pub fn normalize_huggingface<'a>(
    company: &'a str,
    payload: &'a HuggingfacePayload,
) -> impl Iterator<Item = Result<CandidateItem, NormalizationError>> + Send + 'a {
    payload
        .models
        .iter()
        .enumerate()
        .map(move |(index, value)| huggingface_candidate(company, index, value))
}

fn huggingface_candidate(
    company: &str,
    index: usize,
    value: &JsonValue,
) -> Result<CandidateItem, NormalizationError> {
    let model: HuggingfaceModel = decode(value, SourceType::Huggingface, "model", index)?;
    let id = non_empty(model.id).ok_or(NormalizationError::MissingField {
        source_type: SourceType::Huggingface,
        entry: "model",
        index,
        field: "id",
    })?;

    let mut parts = Vec::new();
    if let Some(desc) = non_empty(model.description)
        .or_else(|| model.card_data.and_then(|c| non_empty(c.description)))
    {
        parts.push(desc);
    }
    if let Some(pipeline) = non_empty(model.pipeline_tag) {
        parts.push(format!("pipeline: {pipeline}"));
    }
    if !model.tags.is_empty() {
        parts.push(format!("tags: {}", model.tags.join(", ")));
    }
    let body = clean_text(&parts.join(". "));
    let url = format!("https://huggingface.co/{id}");
    let revision = non_empty(model.sha).unwrap_or_else(|| content_ref(&id, &body, &url));

    Ok(candidate(
        SourceType::Huggingface,
        company,
        id.clone(),
        body,
        url,
        model.last_modified.or(model.created_at),
        format!("{id}@{revision}"),
    ))
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "description")]
    summary: Option<String>,
    #[serde(default, alias = "url")]
    link: Option<String>,
    #[serde(default)]
    published: Option<String>,
}

pub fn normalize_feed<'a>(
    company: &'a str,
    payload: &'a FeedPayload,
) -> impl Iterator<Item = Result<CandidateItem, NormalizationError>> + Send + 'a {
    payload
        .entries
        .iter()
        .enumerate()
        .map(move |(index, value)| feed_candidate(company, payload.source_type, index, value))
}

fn feed_candidate(
    company: &str,
    source_type: SourceType,
    index: usize,
    value: &JsonValue,
) -> Result<CandidateItem, NormalizationError> {
    let entry: FeedEntry = decode(value, source_type, "entry", index)?;
    let title = non_empty(entry.title.map(|t| clean_text(&t))).ok_or(
        NormalizationError::MissingField {
            source_type,
            entry: "entry",
            index,
            field: "title",
        },
    )?;
    let body = clean_text(entry.summary.as_deref().unwrap_or_default());
    let url = entry.link.unwrap_or_default();
    let raw_ref = non_empty(entry.id).unwrap_or_else(|| content_ref(&title, &body, &url));
    Ok(candidate(
        source_type,
        company,
        title,
        body,
        url,
        entry.published.as_deref().and_then(parse_timestamp),
        raw_ref,
    ))
}

fn candidate(
    source_type: SourceType,
    company: &str,
    title: String,
    body: String,
    url: String,
    published_at: Option<DateTime<Utc>>,
    raw_ref: String,
) -> CandidateItem {
    let body = truncate_chars(&body, MAX_BODY_CHARS);
    let model_size = extract_model_size(&format!("{title} {body}"));
    CandidateItem {
        source_type,
        company: company.to_string(),
        title,
        body,
        url,
        published_at,
        raw_ref,
        model_size,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Decode HTML entities, collapse whitespace runs and trim.
pub fn clean_text(input: &str) -> String {
    html_escape::decode_html_entities(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        input.to_string()
    } else {
        input.chars().take(max).collect()
    }
}

/// Best-effort parameter count ("7B", "70.3B") from free text.
pub fn extract_model_size(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*(?:b|bn|billion)\b").expect("model size regex")
    });
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("{}B", m.as_str()))
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Resolve a scraped `href` against the page it came from.
pub fn resolve_link(page_url: &str, href: &str) -> String {
    let href = href.trim();
    let resolved = match Url::parse(page_url) {
        Ok(base) => base.join(href),
        Err(_) => Url::parse(href),
    };
    resolved
        .map(String::from)
        .unwrap_or_else(|_| page_url.to_string())
}

/// Split a normalization stream into usable candidates and per-item failures.
pub fn partition_candidates(
    stream: CandidateStream<'_>,
) -> (Vec<CandidateItem>, Vec<NormalizationError>) {
    let mut items = Vec::new();
    let mut errors = Vec::new();
    for result in stream {
        match result {
            Ok(item) => items.push(item),
            Err(err) => errors.push(err),
        }
    }
    (items, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github_payload() -> RawPayload {
        RawPayload::Github(vec![GithubPayload {
            repo: "meta-llama/llama-models".into(),
            releases: vec![
                json!({
                    "tag_name": "v4.0",
                    "name": "Introducing Llama 4",
                    "body": "A new   multimodal\nlanguage model with 400 billion parameters",
                    "html_url": "https://github.com/meta-llama/llama-models/releases/tag/v4.0",
                    "published_at": "2026-04-05T12:00:00Z",
                    "draft": false
                }),
                json!({ "tag_name": "v4.1-rc", "name": "draft", "draft": true }),
                json!({ "name": "no tag" }),
            ],
            tags: vec![],
            commits: vec![json!({ "sha": "abc", "commit": { "message": "ignored" } })],
        }])
    }

    #[test]
    fn github_release_normalization_is_stable() {
        let payload = github_payload();
        let normalizer = PayloadNormalizer;
        let (first, first_errors) =
            partition_candidates(normalizer.normalize(SourceType::Github, "Meta", &payload));
        let (second, _) =
            partition_candidates(normalizer.normalize(SourceType::Github, "Meta", &payload));

        assert_eq!(first.len(), 1);
        assert_eq!(first_errors.len(), 1);
        assert_eq!(first[0].raw_ref, "meta-llama/llama-models@v4.0");
        assert_eq!(first[0].raw_ref, second[0].raw_ref);
        assert_eq!(first[0].fingerprint(), second[0].fingerprint());
        assert_eq!(first[0].body, "A new multimodal language model with 400 billion parameters");
        assert_eq!(first[0].model_size.as_deref(), Some("400B"));
        assert!(first[0].published_at.is_some());
    }

    #[test]
    fn github_missing_tag_is_per_item_error() {
        let payload = github_payload();
        let errors = PayloadNormalizer
            .normalize(SourceType::Github, "Meta", &payload)
            .filter_map(Result::err)
            .collect::<Vec<_>>();
        assert_eq!(
            errors,
            vec![NormalizationError::MissingField {
                source_type: SourceType::Github,
                entry: "release",
                index: 2,
                field: "tag_name",
            }]
        );
    }

    #[test]
    fn github_commits_used_only_without_releases_or_tags() {
        let payload = RawPayload::Github(vec![GithubPayload {
            repo: "deepseek-ai/DeepSeek-V3".into(),
            releases: vec![],
            tags: vec![],
            commits: vec![
                json!({
                    "sha": "deadbeef",
                    "html_url": "https://github.com/deepseek-ai/DeepSeek-V3/commit/deadbeef",
                    "commit": { "message": "Release DeepSeek-V3 weights\n\n671B MoE language model",
                                "author": { "date": "2026-01-02T03:04:05Z" } }
                }),
                json!({ "commit": { "message": "docs: typo" } }),
                json!({ "sha": "x", "commit": "not an object" }),
            ],
        }]);
        let results = PayloadNormalizer
            .normalize(SourceType::Github, "DeepSeek", &payload)
            .collect::<Vec<_>>();
        assert_eq!(results.len(), 3);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.title, "Release DeepSeek-V3 weights");
        assert_eq!(first.body, "671B MoE language model");
        assert_eq!(first.raw_ref, "deepseek-ai/DeepSeek-V3@deadbeef");
        let no_sha = results[1].as_ref().unwrap();
        assert!(no_sha.raw_ref.starts_with("deepseek-ai/DeepSeek-V3@"));
        assert_eq!(no_sha.raw_ref.len(), "deepseek-ai/DeepSeek-V3@".len() + 64);
        assert!(matches!(results[2], Err(NormalizationError::Malformed { .. })));
    }

    #[test]
    fn website_fragment_prefers_permalink_for_ref() {
        let payload = RawPayload::Website(WebsitePayload {
            page_url: "https://openai.com/news/".into(),
            fragments: vec![
                WebsiteFragment {
                    position: 0,
                    text: "Introducing GPT-5 a new large language model".into(),
                    title: Some("Introducing GPT-5".into()),
                    body: Some("a new large language model".into()),
                    href: Some("/index/introducing-gpt-5/".into()),
                    published: Some("2026-08-07".into()),
                },
                WebsiteFragment {
                    position: 1,
                    text: "   ".into(),
                    title: None,
                    body: None,
                    href: None,
                    published: None,
                },
            ],
        });
        let results = PayloadNormalizer
            .normalize(SourceType::Website, "OpenAI", &payload)
            .collect::<Vec<_>>();
        let item = results[0].as_ref().unwrap();
        assert_eq!(item.title, "Introducing GPT-5");
        assert_eq!(item.url, "https://openai.com/index/introducing-gpt-5/");
        assert_eq!(item.raw_ref, "https://openai.com/index/introducing-gpt-5/");
        assert!(item.published_at.is_some());
        assert!(matches!(
            results[1],
            Err(NormalizationError::MissingField { field: "title", .. })
        ));
    }

    #[test]
    fn website_body_falls_back_to_text_after_title() {
        let payload = WebsitePayload {
            page_url: "https://mistral.ai/news".into(),
            fragments: vec![WebsiteFragment {
                position: 3,
                text: "Mistral Large 3 Our new flagship model".into(),
                title: Some("Mistral Large 3".into()),
                body: None,
                href: None,
                published: None,
            }],
        };
        let item = normalize_website("Mistral", &payload).next().unwrap().unwrap();
        assert_eq!(item.body, "Our new flagship model");
        assert_eq!(item.url, "https://mistral.ai/news");
        assert_eq!(item.raw_ref, sha256_hex(b"Mistral Large 3 Our new flagship model#3"));
    }

    #[test]
    fn website_ref_survives_a_new_post_on_top() {
        let post = |position: usize, title: &str, href: &str| WebsiteFragment {
            position,
            text: format!("{title} a new large language model"),
            title: Some(title.into()),
            body: None,
            href: Some(href.into()),
            published: None,
        };
        let before = WebsitePayload {
            page_url: "https://openai.com/news/".into(),
            fragments: vec![post(0, "Introducing GPT-5", "/index/gpt-5/")],
        };
        let after = WebsitePayload {
            page_url: "https://openai.com/news/".into(),
            fragments: vec![
                post(0, "Introducing o5", "/index/o5/"),
                post(1, "Introducing GPT-5", "/index/gpt-5/"),
            ],
        };
        let first = normalize_website("OpenAI", &before).next().unwrap().unwrap();
        let shifted = normalize_website("OpenAI", &after).nth(1).unwrap().unwrap();
        assert_eq!(first.raw_ref, shifted.raw_ref);
        assert_eq!(first.fingerprint(), shifted.fingerprint());

        // An anchor pointing back at the listing itself is not a permalink.
        let self_link = WebsitePayload {
            page_url: "https://openai.com/news/".into(),
            fragments: vec![post(2, "Introducing GPT-5", "")],
        };
        let item = normalize_website("OpenAI", &self_link).next().unwrap().unwrap();
        assert_eq!(item.raw_ref, sha256_hex(b"Introducing GPT-5 a new large language model#2"));
    }

    #[test]
    fn huggingface_ref_is_model_id_plus_revision() {
        let payload = RawPayload::Huggingface(HuggingfacePayload {
            models: vec![
                json!({
                    "id": "meta-llama/Llama-4-Scout-17B-16E",
                    "sha": "f00d",
                    "lastModified": "2026-04-05T00:00:00.000Z",
                    "pipeline_tag": "image-text-to-text",
                    "tags": ["multimodal", "llama4"]
                }),
                json!({ "modelId": "meta-llama/no-sha", "tags": [] }),
                json!({ "sha": "orphan" }),
            ],
        });
        let results = PayloadNormalizer
            .normalize(SourceType::Huggingface, "Meta", &payload)
            .collect::<Vec<_>>();
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.raw_ref, "meta-llama/Llama-4-Scout-17B-16E@f00d");
        assert_eq!(first.url, "https://huggingface.co/meta-llama/Llama-4-Scout-17B-16E");
        assert!(first.body.contains("tags: multimodal, llama4"));
        assert_eq!(first.model_size.as_deref(), Some("17B"));
        let second = results[1].as_ref().unwrap();
        assert!(second.raw_ref.starts_with("meta-llama/no-sha@"));
        assert!(matches!(
            results[2],
            Err(NormalizationError::MissingField { field: "id", .. })
        ));
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let payload = RawPayload::Huggingface(HuggingfacePayload { models: vec![] });
        let results = PayloadNormalizer
            .normalize(SourceType::Github, "Meta", &payload)
            .collect::<Vec<_>>();
        assert_eq!(
            results,
            vec![Err(NormalizationError::SourceMismatch {
                declared: SourceType::Github,
                actual: SourceType::Huggingface,
            })]
        );
    }

    #[test]
    fn feed_entries_fall_back_to_content_ref() {
        let payload = RawPayload::Feed(FeedPayload {
            source_type: SourceType::Arxiv,
            entries: vec![
                json!({ "id": "2401.00001", "title": "A 7B model", "summary": "s", "link": "https://arxiv.org/abs/2401.00001" }),
                json!({ "title": "No id", "summary": "s" }),
            ],
        });
        let items = PayloadNormalizer
            .normalize(SourceType::Arxiv, "Lab", &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(items[0].raw_ref, "2401.00001");
        assert_eq!(items[1].raw_ref, content_ref("No id", "s", ""));
    }

    #[test]
    fn clean_text_decodes_entities_and_collapses_whitespace() {
        assert_eq!(clean_text("  Q&amp;A:\n\t new&nbsp;model  "), "Q&A: new model");
    }

    #[test]
    fn model_size_patterns() {
        assert_eq!(extract_model_size("Llama 3 70B Instruct").as_deref(), Some("70B"));
        assert_eq!(extract_model_size("a 70.3 billion parameter model").as_deref(), Some("70.3B"));
        assert_eq!(extract_model_size("8bit quantization"), None);
        assert_eq!(extract_model_size("GPT-5"), None);
    }

    #[test]
    fn links_resolve_against_page() {
        assert_eq!(resolve_link("https://a.com/news/", "https://b.com/x"), "https://b.com/x");
        assert_eq!(resolve_link("https://a.com/news/", "/blog/x"), "https://a.com/blog/x");
        assert_eq!(resolve_link("https://a.com/news/", "post"), "https://a.com/news/post");
        assert_eq!(resolve_link("https://a.com", "post"), "https://a.com/post");
        assert_eq!(resolve_link("https://a.com/news", "//cdn.a.com/x"), "https://cdn.a.com/x");
        assert_eq!(resolve_link("https://a.com/news/post", "../blog/x"), "https://a.com/blog/x");
        assert_eq!(resolve_link("https://a.com/news?src=a/b", "post"), "https://a.com/post");
        assert_eq!(resolve_link("not a url", "/x"), "not a url");
    }

    #[test]
    fn timestamps_accept_dates_and_rfc3339() {
        assert!(parse_timestamp("2026-02-24T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-02-24").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
