//! Pipeline orchestrator: fan out over (company, source) pairs, then
//! normalize, classify and record each candidate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mrt_adapters::{
    Fetcher, FetcherRegistry, NormalizationError, Normalizer, PayloadNormalizer, SourceConfig,
};
use mrt_core::{
    PairFailure, PairFailureKind, PairId, Priority, ReleaseEvent, ReleaseEventBatch, RunSummary,
    SourceType,
};
use mrt_storage::{DedupStore, RecordError};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{ClassifierError, ReleaseClassifier};
use crate::config::{CompanyConfig, TrackerConfig};
use crate::notify::{DispatchReport, Dispatcher, LogDispatcher};

/// Restricts a run to a subset of source types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    only: Option<HashSet<SourceType>>,
    excluded: HashSet<SourceType>,
}

impl SourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(types: impl IntoIterator<Item = SourceType>) -> Self {
        Self {
            only: Some(types.into_iter().collect()),
            excluded: HashSet::new(),
        }
    }

    pub fn excluding(types: impl IntoIterator<Item = SourceType>) -> Self {
        Self {
            only: None,
            excluded: types.into_iter().collect(),
        }
    }

    pub fn allows(&self, source_type: SourceType) -> bool {
        !self.excluded.contains(&source_type)
            && self.only.as_ref().map_or(true, |only| only.contains(&source_type))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairStats {
    pub candidates: usize,
    pub not_release: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub new_events: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReport {
    pub pair: PairId,
    pub stats: PairStats,
    #[serde(default)]
    pub failure: Option<PairFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub batch: ReleaseEventBatch,
    pub failures: Vec<PairFailure>,
    pub pairs: Vec<PairReport>,
    pub dispatch: DispatchReport,
}

struct PairJob {
    index: usize,
    pair: PairId,
    priority: Priority,
    source: SourceConfig,
}

struct PairResult {
    report: PairReport,
    events: Vec<ReleaseEvent>,
}

impl PairResult {
    fn new(pair: PairId) -> Self {
        Self {
            report: PairReport {
                pair,
                stats: PairStats::default(),
                failure: None,
            },
            events: Vec::new(),
        }
    }

    fn fail(mut self, kind: PairFailureKind, cause: impl Into<String>) -> Self {
        self.mark_failed(kind, cause);
        self
    }

    fn mark_failed(&mut self, kind: PairFailureKind, cause: impl Into<String>) {
        self.report.failure = Some(PairFailure {
            pair: self.report.pair.clone(),
            kind,
            cause: cause.into(),
        });
    }
}

/// Shared, read-only collaborators handed to every pair task.
#[derive(Clone)]
struct PairContext {
    normalizer: Arc<dyn Normalizer>,
    classifier: Arc<ReleaseClassifier>,
    store: Arc<dyn DedupStore>,
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<TrackerConfig>,
    context: PairContext,
    fetchers: FetcherRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    run_timeout: Duration,
    dispatch_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        config: Arc<TrackerConfig>,
        store: Arc<dyn DedupStore>,
        fetchers: FetcherRegistry,
    ) -> Result<Self, ClassifierError> {
        let classifier = ReleaseClassifier::new(&config.classifier)?;
        let run_timeout = Duration::from_secs(config.pipeline.run_timeout_secs);
        let dispatch_timeout = Duration::from_secs(config.pipeline.dispatch_timeout_secs);
        Ok(Self {
            config,
            context: PairContext {
                normalizer: Arc::new(PayloadNormalizer),
                classifier: Arc::new(classifier),
                store,
            },
            fetchers,
            dispatcher: Arc::new(LogDispatcher),
            run_timeout,
            dispatch_timeout,
        })
    }

    pub fn with_classifier(mut self, classifier: ReleaseClassifier) -> Self {
        self.context.classifier = Arc::new(classifier);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.context.normalizer = normalizer;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_dispatch_timeout(mut self, dispatch_timeout: Duration) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DedupStore> {
        self.context.store.clone()
    }

    /// One run over every enabled company in the loaded configuration.
    pub async fn run(&self, filter: &SourceFilter) -> RunOutcome {
        self.run_companies(&self.config.companies, filter).await
    }

    /// Always returns a best-effort batch; per-pair problems land in `failures`.
    ///
    /// The run timeout covers waiting for a worker slot and fetching. A pair whose
    /// payload arrived in time finishes its store writes even past the deadline.
    /// Dispatch then gets its own `dispatch_timeout`, so the worst case is roughly
    /// `run_timeout + store writes + dispatch_timeout`.
    pub async fn run_companies(&self, companies: &[CompanyConfig], filter: &SourceFilter) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = Instant::now() + self.run_timeout;

        let jobs = plan_pairs(companies, filter);
        let pair_ids = jobs.iter().map(|j| j.pair.clone()).collect::<Vec<_>>();
        let limit = Arc::new(Semaphore::new(self.config.pipeline.concurrency.max(1)));

        let mut tasks = JoinSet::new();
        for job in jobs {
            let span = info_span!(
                "pair",
                %run_id,
                company = %job.pair.company,
                source_type = %job.pair.source_type,
                source_index = job.pair.source_index
            );
            let context = self.context.clone();
            let fetcher = self.fetchers.get(job.pair.source_type);
            let limit = limit.clone();
            tasks.spawn(
                async move {
                    let index = job.index;
                    (index, process_pair(context, fetcher, job, limit, deadline).await)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<PairResult>> = pair_ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => warn!(%run_id, error = %err, "pair task did not complete"),
            }
        }

        let mut batch = ReleaseEventBatch::new(run_id);
        let mut failures = Vec::new();
        let mut pairs = Vec::with_capacity(slots.len());
        let mut summary = RunSummary {
            pairs: slots.len(),
            ..RunSummary::default()
        };
        for (slot, pair) in slots.into_iter().zip(pair_ids) {
            let result = slot.unwrap_or_else(|| {
                PairResult::new(pair).fail(PairFailureKind::Aborted, "pair task panicked or was cancelled")
            });
            let stats = result.report.stats;
            summary.candidates += stats.candidates;
            summary.not_release += stats.not_release;
            summary.duplicates += stats.duplicates;
            summary.malformed_items += stats.malformed;
            if let Some(failure) = &result.report.failure {
                warn!(
                    %run_id,
                    company = %failure.pair.company,
                    source_type = %failure.pair.source_type,
                    source_index = failure.pair.source_index,
                    kind = ?failure.kind,
                    error = %failure.cause,
                    "source pair failed"
                );
                failures.push(failure.clone());
            }
            batch.events.extend(result.events);
            pairs.push(result.report);
        }
        summary.new_events = batch.len();
        summary.failed_pairs = failures.len();

        let dispatch = match timeout(self.dispatch_timeout, self.dispatcher.notify(&batch)).await {
            Ok(report) => report,
            Err(_) => {
                warn!(%run_id, timeout = ?self.dispatch_timeout, "notification dispatch timed out");
                DispatchReport::single(
                    "dispatch",
                    0,
                    Some(format!("timed out after {:?}", self.dispatch_timeout)),
                )
            }
        };
        let finished_at = Utc::now();
        info!(
            %run_id,
            pairs = summary.pairs,
            candidates = summary.candidates,
            new_events = summary.new_events,
            duplicates = summary.duplicates,
            not_release = summary.not_release,
            malformed = summary.malformed_items,
            failed_pairs = summary.failed_pairs,
            "run finished"
        );

        RunOutcome {
            run_id,
            started_at,
            finished_at,
            summary,
            batch,
            failures,
            pairs,
            dispatch,
        }
    }
}

fn plan_pairs(companies: &[CompanyConfig], filter: &SourceFilter) -> Vec<PairJob> {
    let mut jobs = Vec::new();
    for company in companies.iter().filter(|c| c.enabled) {
        for (source_index, source) in company.sources.iter().enumerate() {
            let source_type = source.source_type();
            if !filter.allows(source_type) {
                continue;
            }
            jobs.push(PairJob {
                index: jobs.len(),
                pair: PairId {
                    company: company.name.clone(),
                    source_type,
                    source_index,
                },
                priority: company.priority,
                source: source.clone(),
            });
        }
    }
    jobs
}

/// Only the wait for a worker slot and the fetch are bounded by the run deadline;
/// once a payload is in hand the pair runs to completion so nothing is half-recorded.
async fn process_pair(
    context: PairContext,
    fetcher: Option<Arc<dyn Fetcher>>,
    job: PairJob,
    limit: Arc<Semaphore>,
    deadline: Instant,
) -> PairResult {
    let result = PairResult::new(job.pair.clone());
    let source_type = job.pair.source_type;
    let Some(fetcher) = fetcher else {
        return result.fail(
            PairFailureKind::Fetch,
            format!("no fetcher registered for {source_type}"),
        );
    };

    let _permit = match timeout_at(deadline, limit.acquire_owned()).await {
        Err(_) => return result.fail(PairFailureKind::TimedOut, "run deadline reached before the pair started"),
        Ok(Err(_)) => return result.fail(PairFailureKind::Aborted, "worker pool closed"),
        Ok(Ok(permit)) => permit,
    };

    let payload = match timeout_at(deadline, fetcher.fetch(&job.pair.company, &job.source)).await {
        Err(_) => return result.fail(PairFailureKind::TimedOut, "run deadline reached while fetching"),
        Ok(Err(err)) => return result.fail(PairFailureKind::Fetch, err.to_string()),
        Ok(Ok(payload)) => payload,
    };

    let mut result = result;
    let company = job.pair.company.as_str();
    for (position, normalized) in context
        .normalizer
        .normalize(source_type, company, &payload)
        .enumerate()
    {
        let item = match normalized {
            Ok(item) => item,
            Err(err @ NormalizationError::SourceMismatch { .. }) => {
                result.mark_failed(PairFailureKind::Normalize, err.to_string());
                break;
            }
            Err(err) => {
                result.report.stats.malformed += 1;
                warn!(position, error = %err, "skipping malformed item");
                continue;
            }
        };
        result.report.stats.candidates += 1;

        let classification = context.classifier.classify(&item);
        if !classification.is_release {
            result.report.stats.not_release += 1;
            continue;
        }

        let fingerprint = item.fingerprint();
        match context.store.has_seen(company, &fingerprint).await {
            Ok(true) => {
                result.report.stats.duplicates += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                result.mark_failed(PairFailureKind::Store, err.to_string());
                break;
            }
        }

        let accepted_at = Utc::now();
        match context.store.record(company, &fingerprint, accepted_at).await {
            Ok(()) => {
                result.report.stats.new_events += 1;
                result.events.push(ReleaseEvent {
                    fingerprint,
                    confidence: classification.confidence,
                    priority: job.priority,
                    matched_keywords: classification.matched_keywords,
                    accepted_at,
                    item,
                });
            }
            // Another pair of the same company won the race for this fingerprint.
            Err(RecordError::Duplicate(_)) => result.report.stats.duplicates += 1,
            Err(RecordError::Store(err)) => {
                result.mark_failed(PairFailureKind::Store, err.to_string());
                break;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrt_adapters::{GithubSource, HuggingfaceSource, RawPayload, StaticFetcher, WebsiteFragment, WebsitePayload, WebsiteSource};
    use mrt_storage::MemoryDedupStore;

    fn openai_fragment() -> RawPayload {
        RawPayload::Website(WebsitePayload {
            page_url: "https://openai.com/news/".into(),
            fragments: vec![WebsiteFragment {
                position: 0,
                text: "Introducing GPT-5 a new large language model".into(),
                title: Some("Introducing GPT-5".into()),
                body: Some("a new large language model".into()),
                href: Some("/index/introducing-gpt-5/".into()),
                published: None,
            }],
        })
    }

    fn website(url: &str) -> SourceConfig {
        SourceConfig::Website(WebsiteSource {
            url: url.into(),
            selector: "article".into(),
            title_selector: None,
            body_selector: None,
            link_selector: None,
            date_selector: None,
        })
    }

    fn config(companies: Vec<CompanyConfig>) -> Arc<TrackerConfig> {
        Arc::new(TrackerConfig {
            companies,
            classifier: Default::default(),
            schedule: Default::default(),
            pipeline: Default::default(),
            notifications: Default::default(),
        })
    }

    #[tokio::test]
    async fn openai_announcement_is_emitted_once() {
        let cfg = config(vec![CompanyConfig {
            name: "OpenAI".into(),
            enabled: true,
            priority: Priority::High,
            sources: vec![website("https://openai.com/news/")],
        }]);
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(
            StaticFetcher::new(SourceType::Website).with_payload("OpenAI", openai_fragment()),
        ));
        let pipeline = Pipeline::new(cfg, Arc::new(MemoryDedupStore::new()), registry).unwrap();

        let first = pipeline.run(&SourceFilter::all()).await;
        assert_eq!(first.batch.len(), 1);
        let event = &first.batch.events[0];
        assert_eq!(event.priority, Priority::High);
        assert_eq!(event.item.url, "https://openai.com/index/introducing-gpt-5/");
        assert!(event.matched_keywords.contains(&"introducing".to_string()));
        assert_eq!(first.summary.new_events, 1);
        assert_eq!(first.dispatch.channels[0].delivered, 1);

        let second = pipeline.run(&SourceFilter::all()).await;
        assert!(second.batch.is_empty());
        assert_eq!(second.summary.duplicates, 1);
        assert!(second.failures.is_empty());
    }

    #[tokio::test]
    async fn missing_fetcher_and_disabled_company() {
        let cfg = config(vec![
            CompanyConfig {
                name: "Meta".into(),
                enabled: true,
                priority: Priority::Medium,
                sources: vec![SourceConfig::Github(GithubSource { repos: vec!["meta-llama/llama-models".into()] })],
            },
            CompanyConfig {
                name: "Dormant".into(),
                enabled: false,
                priority: Priority::Low,
                sources: vec![website("https://dormant.example")],
            },
        ]);
        let pipeline = Pipeline::new(cfg, Arc::new(MemoryDedupStore::new()), FetcherRegistry::new()).unwrap();
        let outcome = pipeline.run(&SourceFilter::all()).await;
        assert_eq!(outcome.summary.pairs, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, PairFailureKind::Fetch);
        assert!(outcome.failures[0].cause.contains("github"));
    }

    #[tokio::test]
    async fn wrong_payload_shape_fails_the_pair() {
        let cfg = config(vec![CompanyConfig {
            name: "OpenAI".into(),
            enabled: true,
            priority: Priority::High,
            sources: vec![website("https://openai.com/news/")],
        }]);
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(StaticFetcher::new(SourceType::Website).with_payload(
            "OpenAI",
            RawPayload::Huggingface(mrt_adapters::HuggingfacePayload::default()),
        )));
        let pipeline = Pipeline::new(cfg, Arc::new(MemoryDedupStore::new()), registry).unwrap();

        let outcome = pipeline.run(&SourceFilter::all()).await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, PairFailureKind::Normalize);
        assert_eq!(outcome.failures[0].pair.company, "OpenAI");
        assert!(outcome.failures[0].cause.contains("huggingface"));
        assert_eq!(outcome.summary.malformed_items, 0);
        assert_eq!(outcome.summary.failed_pairs, 1);
    }

    #[tokio::test]
    async fn slow_dispatch_is_cut_off() {
        struct Stalled;

        #[async_trait::async_trait]
        impl Dispatcher for Stalled {
            async fn notify(&self, _batch: &ReleaseEventBatch) -> DispatchReport {
                tokio::time::sleep(Duration::from_secs(30)).await;
                DispatchReport::single("stalled", 0, None)
            }
        }

        let cfg = config(vec![CompanyConfig {
            name: "OpenAI".into(),
            enabled: true,
            priority: Priority::High,
            sources: vec![website("https://openai.com/news/")],
        }]);
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(
            StaticFetcher::new(SourceType::Website).with_payload("OpenAI", openai_fragment()),
        ));
        let pipeline = Pipeline::new(cfg, Arc::new(MemoryDedupStore::new()), registry)
            .unwrap()
            .with_dispatcher(Arc::new(Stalled))
            .with_dispatch_timeout(Duration::from_millis(100));

        let outcome = pipeline.run(&SourceFilter::all()).await;
        assert_eq!(outcome.batch.len(), 1);
        assert_eq!(outcome.dispatch.channels.len(), 1);
        assert_eq!(outcome.dispatch.channels[0].channel, "dispatch");
        assert!(outcome.dispatch.channels[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn source_filter_selects_pairs() {
        let companies = vec![CompanyConfig {
            name: "Meta".into(),
            enabled: true,
            priority: Priority::Medium,
            sources: vec![
                website("https://ai.meta.com/blog/"),
                SourceConfig::Huggingface(HuggingfaceSource {
                    orgs: vec!["meta-llama".into()],
                    limit: None,
                    trending: false,
                }),
            ],
        }];
        let hf_only = plan_pairs(&companies, &SourceFilter::only([SourceType::Huggingface]));
        assert_eq!(hf_only.len(), 1);
        assert_eq!(hf_only[0].pair.source_index, 1);
        assert_eq!(hf_only[0].index, 0);

        let without_hf = plan_pairs(&companies, &SourceFilter::excluding([SourceType::Huggingface]));
        assert_eq!(without_hf.len(), 1);
        assert_eq!(without_hf[0].pair.source_type, SourceType::Website);
        assert_eq!(plan_pairs(&companies, &SourceFilter::all()).len(), 2);
    }
}
