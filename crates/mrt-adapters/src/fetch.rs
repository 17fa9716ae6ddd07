//! Fetcher collaborators: the only place that talks to the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mrt_core::SourceType;
use mrt_storage::HttpClient;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::{
    extract_fragments, GithubPayload, GithubSource, HuggingfacePayload, HuggingfaceSource,
    RawPayload, SourceConfig, WebsitePayload, WebsiteSource,
};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{source_type} fetch for {company} failed: {cause}")]
pub struct FetchError {
    pub source_type: SourceType,
    pub company: String,
    pub cause: String,
}

impl FetchError {
    pub fn new(source_type: SourceType, company: &str, cause: impl ToString) -> Self {
        Self {
            source_type,
            company: company.to_string(),
            cause: cause.to_string(),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch(&self, company: &str, source: &SourceConfig) -> Result<RawPayload, FetchError>;
}

fn mismatch(expected: SourceType, company: &str, source: &SourceConfig) -> FetchError {
    FetchError::new(
        expected,
        company,
        format!("cannot fetch a {} source", source.source_type()),
    )
}

pub struct WebsiteFetcher {
    http: Arc<HttpClient>,
}

impl WebsiteFetcher {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    async fn fetch_page(&self, company: &str, source: &WebsiteSource) -> Result<RawPayload, FetchError> {
        let response = self
            .http
            .get("website", &source.url, &[])
            .await
            .map_err(|e| FetchError::new(SourceType::Website, company, e))?;
        let fragments = extract_fragments(&response.text(), &source.fragment_selectors())
            .map_err(|e| FetchError::new(SourceType::Website, company, e))?;
        Ok(RawPayload::Website(WebsitePayload {
            page_url: response.final_url,
            fragments,
        }))
    }
}

#[async_trait]
impl Fetcher for WebsiteFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Website
    }

    async fn fetch(&self, company: &str, source: &SourceConfig) -> Result<RawPayload, FetchError> {
        match source {
            SourceConfig::Website(site) => self.fetch_page(company, site).await,
            other => Err(mismatch(SourceType::Website, company, other)),
        }
    }
}

pub const GITHUB_API: &str = "https://api.github.com";

pub struct GithubFetcher {
    http: Arc<HttpClient>,
    api_base: String,
    token: Option<String>,
    per_page: usize,
}

impl GithubFetcher {
    pub fn new(http: Arc<HttpClient>, token: Option<String>) -> Self {
        Self {
            http,
            api_base: GITHUB_API.to_string(),
            token,
            per_page: 10,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Accept", "application/vnd.github+json".to_string())];
        if let Some(token) = &self.token {
            headers.push(("Authorization", format!("Bearer {token}")));
        }
        headers
    }

    async fn list(&self, repo: &str, resource: &str) -> Result<Vec<JsonValue>, String> {
        let url = format!(
            "{}/repos/{repo}/{resource}?per_page={}",
            self.api_base, self.per_page
        );
        let response = self
            .http
            .get("github", &url, &self.headers())
            .await
            .map_err(|e| e.to_string())?;
        serde_json::from_slice::<Vec<JsonValue>>(&response.body).map_err(|e| e.to_string())
    }

    /// Tags are only listed when there are no releases, commits only when neither exists.
    async fn fetch_repo(&self, repo: &str) -> Result<GithubPayload, String> {
        let releases = self.list(repo, "releases").await?;
        let tags = if releases.is_empty() {
            self.list(repo, "tags").await?
        } else {
            Vec::new()
        };
        let commits = if releases.is_empty() && tags.is_empty() {
            self.list(repo, "commits").await?
        } else {
            Vec::new()
        };
        Ok(GithubPayload {
            repo: repo.to_string(),
            releases,
            tags,
            commits,
        })
    }

    async fn fetch_repos(&self, company: &str, source: &GithubSource) -> Result<RawPayload, FetchError> {
        let mut payloads = Vec::new();
        let mut last_error = None;
        for repo in &source.repos {
            match self.fetch_repo(repo).await {
                Ok(payload) => payloads.push(payload),
                Err(cause) => {
                    warn!(company, repo = %repo, error = %cause, "github repo fetch failed");
                    last_error = Some(cause);
                }
            }
        }
        if payloads.is_empty() {
            if let Some(cause) = last_error {
                return Err(FetchError::new(SourceType::Github, company, cause));
            }
        }
        Ok(RawPayload::Github(payloads))
    }
}

#[async_trait]
impl Fetcher for GithubFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Github
    }

    async fn fetch(&self, company: &str, source: &SourceConfig) -> Result<RawPayload, FetchError> {
        match source {
            SourceConfig::Github(github) => self.fetch_repos(company, github).await,
            other => Err(mismatch(SourceType::Github, company, other)),
        }
    }
}

pub const HUGGINGFACE_API: &str = "https://huggingface.co/api";

pub struct HuggingfaceFetcher {
    http: Arc<HttpClient>,
    api_base: String,
    default_limit: usize,
}

impl HuggingfaceFetcher {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            api_base: HUGGINGFACE_API.to_string(),
            default_limit: 20,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// One listing URL per org, plus the hub-wide trending listing when asked for.
    pub fn listing_urls(&self, source: &HuggingfaceSource) -> Vec<(String, String)> {
        let limit = source.limit.unwrap_or(self.default_limit).max(1);
        let mut urls = source
            .orgs
            .iter()
            .map(|org| {
                let url = format!(
                    "{}/models?author={org}&sort=lastModified&direction=-1&limit={limit}&full=true&cardData=true",
                    self.api_base
                );
                (org.clone(), url)
            })
            .collect::<Vec<_>>();
        if source.trending {
            urls.push((
                "trending".to_string(),
                format!(
                    "{}/models?sort=trendingScore&direction=-1&limit={limit}&full=true&cardData=true",
                    self.api_base
                ),
            ));
        }
        urls
    }

    async fn list_models(&self, url: &str) -> Result<Vec<JsonValue>, String> {
        let response = self
            .http
            .get("huggingface", url, &[])
            .await
            .map_err(|e| e.to_string())?;
        serde_json::from_slice::<Vec<JsonValue>>(&response.body).map_err(|e| e.to_string())
    }

    async fn fetch_listings(&self, company: &str, source: &HuggingfaceSource) -> Result<RawPayload, FetchError> {
        let listings = self.listing_urls(source);
        let mut models = Vec::new();
        let mut failures = 0usize;
        let mut last_error = None;
        for (listing, url) in &listings {
            match self.list_models(url).await {
                Ok(mut listed) => models.append(&mut listed),
                Err(cause) => {
                    warn!(company, listing = %listing, error = %cause, "huggingface listing failed");
                    failures += 1;
                    last_error = Some(cause);
                }
            }
        }
        if failures > 0 && failures == listings.len() {
            if let Some(cause) = last_error {
                return Err(FetchError::new(SourceType::Huggingface, company, cause));
            }
        }
        // A trending model can also appear in an org listing.
        let mut seen = HashSet::new();
        models.retain(|model| match model.get("id").or_else(|| model.get("modelId")) {
            Some(JsonValue::String(id)) => seen.insert(id.clone()),
            _ => true,
        });
        Ok(RawPayload::Huggingface(HuggingfacePayload { models }))
    }
}

#[async_trait]
impl Fetcher for HuggingfaceFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Huggingface
    }

    async fn fetch(&self, company: &str, source: &SourceConfig) -> Result<RawPayload, FetchError> {
        match source {
            SourceConfig::Huggingface(hf) => self.fetch_listings(company, hf).await,
            other => Err(mismatch(SourceType::Huggingface, company, other)),
        }
    }
}

/// Canned payloads keyed by company, for offline runs and tests.
pub struct StaticFetcher {
    source_type: SourceType,
    responses: HashMap<String, Result<RawPayload, String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            responses: HashMap::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_payload(mut self, company: &str, payload: RawPayload) -> Self {
        self.responses.insert(company.to_string(), Ok(payload));
        self
    }

    pub fn with_failure(mut self, company: &str, cause: &str) -> Self {
        self.responses.insert(company.to_string(), Err(cause.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn fetch(&self, company: &str, _source: &SourceConfig) -> Result<RawPayload, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.responses.get(company) {
            Some(Ok(payload)) => Ok(payload.clone()),
            Some(Err(cause)) => Err(FetchError::new(self.source_type, company, cause)),
            None => Err(FetchError::new(self.source_type, company, "no canned payload")),
        }
    }
}

/// Fetchers by the source type they serve.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<SourceType, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Website, GitHub and Hugging Face fetchers sharing one HTTP client.
    pub fn with_http_defaults(http: Arc<HttpClient>, github_token: Option<String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebsiteFetcher::new(http.clone())));
        registry.register(Arc::new(GithubFetcher::new(http.clone(), github_token)));
        registry.register(Arc::new(HuggingfaceFetcher::new(http)));
        registry
    }

    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) {
        self.fetchers.insert(fetcher.source_type(), fetcher);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(&source_type).cloned()
    }

    pub fn source_types(&self) -> Vec<SourceType> {
        let mut types = self.fetchers.keys().copied().collect::<Vec<_>>();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FeedSource, HuggingfacePayload};

    fn hf_source() -> SourceConfig {
        SourceConfig::Huggingface(HuggingfaceSource {
            orgs: vec!["mistralai".into()],
            limit: None,
            trending: false,
        })
    }

    #[tokio::test]
    async fn static_fetcher_serves_and_fails_per_company() {
        let fetcher = StaticFetcher::new(SourceType::Huggingface)
            .with_payload(
                "Mistral",
                RawPayload::Huggingface(HuggingfacePayload { models: vec![] }),
            )
            .with_failure("Broken", "HTTP 503");

        assert!(fetcher.fetch("Mistral", &hf_source()).await.is_ok());
        let err = fetcher.fetch("Broken", &hf_source()).await.unwrap_err();
        assert_eq!(err.to_string(), "huggingface fetch for Broken failed: HTTP 503");
        assert!(fetcher.fetch("Unknown", &hf_source()).await.is_err());
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn http_fetchers_reject_foreign_source_configs() {
        let http = Arc::new(HttpClient::new(Default::default()).unwrap());
        let fetcher = GithubFetcher::new(http, None);
        let feed = SourceConfig::Feed(FeedSource {
            source_type: SourceType::Reddit,
            url: "https://reddit.com/r/LocalLLaMA".into(),
        });
        let err = fetcher.fetch("Meta", &feed).await.unwrap_err();
        assert_eq!(err.source_type, SourceType::Github);
        assert!(err.cause.contains("reddit"));
    }

    #[test]
    fn huggingface_listings_cover_orgs_and_trending() {
        let http = Arc::new(HttpClient::new(Default::default()).unwrap());
        let fetcher = HuggingfaceFetcher::new(http).with_api_base("https://hf.test/api/");
        let source = HuggingfaceSource {
            orgs: vec!["mistralai".into(), "deepseek-ai".into()],
            limit: Some(5),
            trending: true,
        };
        let urls = fetcher.listing_urls(&source);
        let labels = urls.iter().map(|(label, _)| label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["mistralai", "deepseek-ai", "trending"]);
        assert!(urls[0].1.starts_with("https://hf.test/api/models?author=mistralai&"));
        assert!(urls[0].1.contains("limit=5"));
        assert_eq!(
            urls[2].1,
            "https://hf.test/api/models?sort=trendingScore&direction=-1&limit=5&full=true&cardData=true"
        );

        let org_only = HuggingfaceSource { trending: false, ..source };
        assert_eq!(fetcher.listing_urls(&org_only).len(), 2);
    }

    #[test]
    fn registry_keys_by_source_type() {
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(StaticFetcher::new(SourceType::Github)));
        registry.register(Arc::new(StaticFetcher::new(SourceType::Website)));
        assert!(registry.get(SourceType::Github).is_some());
        assert!(registry.get(SourceType::Twitter).is_none());
        assert_eq!(
            registry.source_types(),
            vec![SourceType::Github, SourceType::Website]
        );
    }
}
