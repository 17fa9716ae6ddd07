//! Notification boundary: decides what to send for a batch, never retries delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mrt_core::{ReleaseEvent, ReleaseEventBatch};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NotificationConfig;

mod email;

pub use email::{render_email_html, EmailDispatcher};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{channel} webhook request failed: {source}")]
    Request {
        channel: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{channel} webhook returned http {status}")]
    Status { channel: &'static str, status: u16 },
    #[error("invalid email address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("building email: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub delivered: usize,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub channels: Vec<ChannelOutcome>,
}

impl DispatchReport {
    pub fn single(channel: &str, delivered: usize, error: Option<String>) -> Self {
        Self {
            channels: vec![ChannelOutcome {
                channel: channel.to_string(),
                delivered,
                error,
            }],
        }
    }

    pub fn failed_channels(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.channels.iter().filter(|c| c.error.is_some())
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn notify(&self, batch: &ReleaseEventBatch) -> DispatchReport;
}

/// One human-readable line per event.
pub fn render_event_line(event: &ReleaseEvent) -> String {
    let item = &event.item;
    let mut line = format!(
        "[{}] {}: {} ({}, {:.0}% confidence",
        event.priority.as_str().to_uppercase(),
        item.company,
        item.title,
        item.source_type,
        event.confidence * 100.0
    );
    if let Some(size) = &item.model_size {
        line.push_str(&format!(", {size}"));
    }
    line.push(')');
    if !item.url.is_empty() {
        line.push_str(&format!(" {}", item.url));
    }
    line
}

pub fn render_batch_text(batch: &ReleaseEventBatch) -> String {
    let mut lines = vec![format!("*{} new model release(s)*", batch.len())];
    lines.extend(batch.iter().map(render_event_line));
    lines.join("\n")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn notify(&self, batch: &ReleaseEventBatch) -> DispatchReport {
        if batch.is_empty() {
            info!(run_id = %batch.run_id, "no new model releases");
        }
        for event in batch.iter() {
            info!(
                run_id = %batch.run_id,
                company = %event.item.company,
                source_type = %event.item.source_type,
                fingerprint = %event.fingerprint,
                "{}",
                render_event_line(event)
            );
        }
        DispatchReport::single("log", batch.len(), None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    Slack,
    Discord,
}

impl WebhookKind {
    fn channel(self) -> &'static str {
        match self {
            WebhookKind::Slack => "slack",
            WebhookKind::Discord => "discord",
        }
    }
}

// Discord caps a message at ten embeds.
const DISCORD_MAX_EMBEDS: usize = 10;

pub struct WebhookDispatcher {
    kind: WebhookKind,
    url: String,
    client: Client,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(kind: WebhookKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Request bodies for one batch, each paired with the number of events it carries.
    /// Discord gets one message per ten events.
    pub fn payloads(&self, batch: &ReleaseEventBatch) -> Vec<(serde_json::Value, usize)> {
        match self.kind {
            WebhookKind::Slack => vec![(serde_json::json!({ "text": render_batch_text(batch) }), batch.len())],
            WebhookKind::Discord => {
                let parts = batch.events.chunks(DISCORD_MAX_EMBEDS).len();
                batch
                    .events
                    .chunks(DISCORD_MAX_EMBEDS)
                    .enumerate()
                    .map(|(part, events)| {
                        let embeds = events.iter().map(discord_embed).collect::<Vec<_>>();
                        let mut content = format!("{} new model release(s)", batch.len());
                        if parts > 1 {
                            content.push_str(&format!(" ({}/{parts})", part + 1));
                        }
                        (serde_json::json!({ "content": content, "embeds": embeds }), events.len())
                    })
                    .collect()
            }
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<(), DispatchError> {
        let channel = self.kind.channel();
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|source| DispatchError::Request { channel, source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                channel,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn discord_embed(event: &ReleaseEvent) -> serde_json::Value {
    let mut description = format!(
        "**Company:** {}\n**Source:** {}\n**Confidence:** {:.0}%\n**Priority:** {}",
        event.item.company,
        event.item.source_type,
        event.confidence * 100.0,
        event.priority
    );
    if let Some(size) = &event.item.model_size {
        description.push_str(&format!("\n**Model size:** {size}"));
    }
    serde_json::json!({
        "title": format!("New Model Release: {}", event.item.title),
        "url": event.item.url,
        "description": description,
    })
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    /// Posts stop at the first failure; `delivered` counts only events that went out.
    async fn notify(&self, batch: &ReleaseEventBatch) -> DispatchReport {
        let channel = self.kind.channel();
        if batch.is_empty() {
            return DispatchReport::single(channel, 0, None);
        }
        let mut delivered = 0usize;
        for (body, events) in self.payloads(batch) {
            if let Err(err) = self.post(&body).await {
                warn!(run_id = %batch.run_id, channel, delivered, error = %err, "notification delivery failed");
                return DispatchReport::single(channel, delivered, Some(err.to_string()));
            }
            delivered += events;
        }
        DispatchReport::single(channel, delivered, None)
    }
}

/// Fans a batch out to every channel and merges their reports.
#[derive(Clone, Default)]
pub struct MultiDispatcher {
    channels: Vec<Arc<dyn Dispatcher>>,
}

impl MultiDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.channels.push(dispatcher);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Builds every configured channel. Email credentials come from the environment.
    pub fn from_config(config: &NotificationConfig) -> Result<Self, DispatchError> {
        let mut multi = Self::new();
        if config.log {
            multi = multi.with(Arc::new(LogDispatcher));
        }
        if let Some(url) = &config.slack_webhook_url {
            multi = multi.with(Arc::new(WebhookDispatcher::new(WebhookKind::Slack, url.clone())));
        }
        if let Some(url) = &config.discord_webhook_url {
            multi = multi.with(Arc::new(WebhookDispatcher::new(WebhookKind::Discord, url.clone())));
        }
        if let Some(email) = &config.email {
            multi = multi.with(Arc::new(EmailDispatcher::from_env(email)?));
        }
        Ok(multi)
    }
}

#[async_trait]
impl Dispatcher for MultiDispatcher {
    async fn notify(&self, batch: &ReleaseEventBatch) -> DispatchReport {
        let mut report = DispatchReport::default();
        for channel in &self.channels {
            report.channels.extend(channel.notify(batch).await.channels);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mrt_core::{CandidateItem, Priority, SourceType};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn batch() -> ReleaseEventBatch {
        let item = CandidateItem {
            source_type: SourceType::Huggingface,
            company: "Meta".into(),
            title: "meta-llama/Llama-4-Scout-17B-16E".into(),
            body: "Introducing Llama 4, a multimodal model".into(),
            url: "https://huggingface.co/meta-llama/Llama-4-Scout-17B-16E".into(),
            published_at: None,
            raw_ref: "meta-llama/Llama-4-Scout-17B-16E@f00d".into(),
            model_size: Some("17B".into()),
        };
        let mut batch = ReleaseEventBatch::new(Uuid::new_v4());
        batch.events.push(ReleaseEvent {
            fingerprint: item.fingerprint(),
            confidence: 0.8,
            priority: Priority::High,
            matched_keywords: vec!["introducing".into(), "multimodal".into()],
            accepted_at: Utc::now(),
            item,
        });
        batch
    }

    #[test]
    fn event_line_carries_priority_size_and_url() {
        let b = batch();
        let line = render_event_line(&b.events[0]);
        assert_eq!(
            line,
            "[HIGH] Meta: meta-llama/Llama-4-Scout-17B-16E (huggingface, 80% confidence, 17B) https://huggingface.co/meta-llama/Llama-4-Scout-17B-16E"
        );
    }

    #[test]
    fn webhook_payload_shapes() {
        let b = batch();
        let slack = WebhookDispatcher::new(WebhookKind::Slack, "http://localhost/slack").payloads(&b);
        assert_eq!(slack.len(), 1);
        assert!(slack[0].0["text"].as_str().unwrap().starts_with("*1 new model release(s)*"));

        let discord = WebhookDispatcher::new(WebhookKind::Discord, "http://localhost/discord").payloads(&b);
        assert_eq!(discord.len(), 1);
        assert_eq!(discord[0].0["content"], "1 new model release(s)");
        let embeds = discord[0].0["embeds"].as_array().unwrap();
        assert_eq!(embeds.len(), 1);
        assert_eq!(
            embeds[0]["title"],
            "New Model Release: meta-llama/Llama-4-Scout-17B-16E"
        );
        assert!(embeds[0]["description"].as_str().unwrap().contains("**Model size:** 17B"));
    }

    fn batch_of(count: usize) -> ReleaseEventBatch {
        let template = batch().events.remove(0);
        let mut out = ReleaseEventBatch::new(Uuid::new_v4());
        for n in 0..count {
            let mut event = template.clone();
            event.item.title = format!("model-{n}");
            event.item.raw_ref = format!("model-{n}@f00d");
            event.fingerprint = event.item.fingerprint();
            out.events.push(event);
        }
        out
    }

    #[test]
    fn discord_splits_large_batches_into_ten_embed_messages() {
        let b = batch_of(12);
        let discord = WebhookDispatcher::new(WebhookKind::Discord, "http://localhost/discord").payloads(&b);
        let sizes = discord
            .iter()
            .map(|(body, events)| (body["embeds"].as_array().unwrap().len(), *events))
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![(10, 10), (2, 2)]);
        assert_eq!(discord[0].0["content"], "12 new model release(s) (1/2)");
        assert_eq!(discord[1].0["embeds"][1]["title"], "New Model Release: model-11");
    }

    #[tokio::test]
    async fn failed_webhook_reports_nothing_delivered() {
        let dispatcher = WebhookDispatcher::new(WebhookKind::Discord, "http://127.0.0.1:9/unreachable")
            .with_timeout(Duration::from_millis(500));
        let report = dispatcher.notify(&batch_of(12)).await;
        assert_eq!(report.channels[0].delivered, 0);
        assert!(report.channels[0].error.is_some());
    }

    #[tokio::test]
    async fn webhook_skips_empty_batches_without_network() {
        let dispatcher = WebhookDispatcher::new(WebhookKind::Slack, "http://127.0.0.1:9/unreachable");
        let report = dispatcher.notify(&ReleaseEventBatch::new(Uuid::new_v4())).await;
        assert_eq!(report, DispatchReport::single("slack", 0, None));
    }

    struct Recording {
        seen: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl Dispatcher for Recording {
        async fn notify(&self, batch: &ReleaseEventBatch) -> DispatchReport {
            self.seen.lock().unwrap().push(batch.len());
            let error = self.fail.then(|| "down".to_string());
            DispatchReport::single("recording", if self.fail { 0 } else { batch.len() }, error)
        }
    }

    #[tokio::test]
    async fn multi_dispatcher_collects_every_channel() {
        let ok = Arc::new(Recording { seen: Mutex::new(vec![]), fail: false });
        let down = Arc::new(Recording { seen: Mutex::new(vec![]), fail: true });
        let multi = MultiDispatcher::new()
            .with(Arc::new(LogDispatcher))
            .with(ok.clone())
            .with(down.clone());

        let report = multi.notify(&batch()).await;
        assert_eq!(report.channels.len(), 3);
        assert_eq!(report.failed_channels().count(), 1);
        assert_eq!(*ok.seen.lock().unwrap(), vec![1]);
        assert_eq!(*down.seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn from_config_builds_configured_channels() {
        let config = NotificationConfig {
            log: false,
            slack_webhook_url: Some("https://hooks.slack.test/x".into()),
            discord_webhook_url: None,
            email: Some(crate::config::EmailConfig {
                smtp_host: "smtp.example.com".into(),
                smtp_port: 587,
                tls: crate::config::SmtpTls::Starttls,
                from: "bot@example.com".into(),
                to: vec!["ml-team@example.com".into()],
                username_env: "MRT_TEST_UNSET_SMTP_USER".into(),
                password_env: "MRT_TEST_UNSET_SMTP_PASS".into(),
            }),
        };
        assert_eq!(MultiDispatcher::from_config(&config).unwrap().len(), 2);
        assert!(MultiDispatcher::from_config(&NotificationConfig {
            log: false,
            ..NotificationConfig::default()
        })
        .unwrap()
        .is_empty());
    }
}
