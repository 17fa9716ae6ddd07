//! SMTP digest of a run's new releases.

use std::time::Duration;

use async_trait::async_trait;
use html_escape::{encode_double_quoted_attribute, encode_text};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mrt_core::{ReleaseEvent, ReleaseEventBatch};
use tracing::{info, warn};

use super::{render_batch_text, DispatchError, DispatchReport, Dispatcher};
use crate::config::{EmailConfig, SmtpTls};

const CHANNEL: &str = "email";
const BODY_EXCERPT_CHARS: usize = 400;

pub struct EmailDispatcher {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailDispatcher {
    pub fn new(config: &EmailConfig, credentials: Option<Credentials>) -> Result<Self, DispatchError> {
        let builder = match config.tls {
            SmtpTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?,
            SmtpTls::Wrapper => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host),
        };
        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(30)));
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        let from = parse_mailbox(&config.from)?;
        let to = config
            .to
            .iter()
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| parse_mailbox(addr))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }

    /// Reads the SMTP login from the variables the config names. Without both
    /// the relay is used unauthenticated.
    pub fn from_env(config: &EmailConfig) -> Result<Self, DispatchError> {
        Self::with_lookup(config, |key| std::env::var(key).ok())
    }

    pub fn with_lookup(
        config: &EmailConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, DispatchError> {
        let credentials = match (lookup(&config.username_env), lookup(&config.password_env)) {
            (Some(user), Some(password)) if !user.trim().is_empty() => {
                Some(Credentials::new(user, password))
            }
            _ => None,
        };
        Self::new(config, credentials)
    }

    pub fn message(&self, batch: &ReleaseEventBatch) -> Result<Message, DispatchError> {
        let subject = match batch.events.as_slice() {
            [single] => format!("New Model Release: {}", single.item.title),
            events => format!("{} new model releases", events.len()),
        };
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let message = builder.multipart(MultiPart::alternative_plain_html(
            render_batch_text(batch),
            render_email_html(batch),
        ))?;
        Ok(message)
    }

    async fn send(&self, batch: &ReleaseEventBatch) -> Result<(), DispatchError> {
        let message = self.message(batch)?;
        self.mailer.send(message).await?;
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DispatchError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|source| DispatchError::Address {
            address: address.to_string(),
            source,
        })
}

#[async_trait]
impl Dispatcher for EmailDispatcher {
    async fn notify(&self, batch: &ReleaseEventBatch) -> DispatchReport {
        if batch.is_empty() {
            return DispatchReport::single(CHANNEL, 0, None);
        }
        match self.send(batch).await {
            Ok(()) => {
                info!(run_id = %batch.run_id, recipients = self.to.len(), events = batch.len(), "release digest emailed");
                DispatchReport::single(CHANNEL, batch.len(), None)
            }
            Err(err) => {
                warn!(run_id = %batch.run_id, channel = CHANNEL, error = %err, "notification delivery failed");
                DispatchReport::single(CHANNEL, 0, Some(err.to_string()))
            }
        }
    }
}

pub fn render_email_html(batch: &ReleaseEventBatch) -> String {
    let mut html = String::from(
        "<html><body style=\"font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px\">",
    );
    html.push_str(&format!("<h1>{} new model release(s)</h1>", batch.len()));
    for event in batch.iter() {
        html.push_str(&event_section(event));
    }
    html.push_str("</body></html>");
    html
}

fn event_section(event: &ReleaseEvent) -> String {
    let item = &event.item;
    let title = encode_text(&item.title);
    let heading = if item.url.is_empty() {
        title.into_owned()
    } else {
        format!(
            "<a href=\"{}\">{title}</a>",
            encode_double_quoted_attribute(&item.url)
        )
    };

    let mut rows = vec![
        ("Company", item.company.clone()),
        ("Source", item.source_type.to_string()),
        ("Priority", event.priority.to_string()),
        ("Confidence", format!("{:.0}%", event.confidence * 100.0)),
    ];
    if let Some(size) = &item.model_size {
        rows.push(("Model size", size.clone()));
    }
    if let Some(published) = item.published_at {
        rows.push(("Published", published.format("%Y-%m-%d %H:%M UTC").to_string()));
    }

    let mut section = format!("<h2>{heading}</h2><table>");
    for (label, value) in rows {
        section.push_str(&format!(
            "<tr><th align=\"left\">{label}</th><td>{}</td></tr>",
            encode_text(&value)
        ));
    }
    section.push_str("</table>");
    if !item.body.is_empty() {
        let excerpt = item.body.chars().take(BODY_EXCERPT_CHARS).collect::<String>();
        section.push_str(&format!("<p>{}</p>", encode_text(&excerpt)));
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mrt_core::{CandidateItem, Priority, SourceType};
    use uuid::Uuid;

    fn config(port: u16) -> EmailConfig {
        EmailConfig {
            smtp_host: "127.0.0.1".into(),
            smtp_port: port,
            tls: SmtpTls::None,
            from: "Release Tracker <bot@example.com>".into(),
            to: vec!["ml-team@example.com".into(), "cto@example.com".into()],
            username_env: "SMTP_USERNAME".into(),
            password_env: "SMTP_PASSWORD".into(),
        }
    }

    fn batch(titles: &[&str]) -> ReleaseEventBatch {
        let mut batch = ReleaseEventBatch::new(Uuid::new_v4());
        for title in titles {
            let item = CandidateItem {
                source_type: SourceType::Github,
                company: "Mistral".into(),
                title: title.to_string(),
                body: "Announcing a <b>24B</b> multimodal model & more".into(),
                url: "https://github.com/mistralai/releases?tag=v1&x=\"y\"".into(),
                published_at: None,
                raw_ref: format!("mistralai/models@{title}"),
                model_size: Some("24B".into()),
            };
            batch.events.push(ReleaseEvent {
                fingerprint: item.fingerprint(),
                confidence: 1.0,
                priority: Priority::Medium,
                matched_keywords: vec!["announcing".into(), "multimodal".into()],
                accepted_at: Utc::now(),
                item,
            });
        }
        batch
    }

    #[test]
    fn html_digest_escapes_scraped_text() {
        let html = render_email_html(&batch(&["Mistral Small 3.1"]));
        assert!(html.contains("<h1>1 new model release(s)</h1>"));
        assert!(html.contains("&lt;b&gt;24B&lt;/b&gt; multimodal model &amp; more"));
        assert!(html.contains("href=\"https://github.com/mistralai/releases?tag=v1&amp;x=&quot;y&quot;\""));
        assert!(html.contains("<th align=\"left\">Model size</th><td>24B</td>"));
    }

    #[test]
    fn subject_names_a_single_release_or_counts_many() {
        let dispatcher = EmailDispatcher::new(&config(2525), None).unwrap();
        let one = dispatcher.message(&batch(&["Mistral Small 3.1"])).unwrap();
        let text = String::from_utf8_lossy(&one.formatted()).into_owned();
        assert!(text.contains("Subject: New Model Release: Mistral Small 3.1"));
        assert!(text.contains("ml-team@example.com"));
        assert!(text.contains("cto@example.com"));

        let many = dispatcher.message(&batch(&["a", "b", "c"])).unwrap();
        let text = String::from_utf8_lossy(&many.formatted()).into_owned();
        assert!(text.contains("Subject: 3 new model releases"));
    }

    #[test]
    fn bad_addresses_are_rejected_up_front() {
        let mut bad = config(2525);
        bad.to = vec!["not an address".into()];
        assert!(matches!(
            EmailDispatcher::new(&bad, None),
            Err(DispatchError::Address { .. })
        ));
    }

    #[test]
    fn credentials_need_both_variables() {
        let only_user = |key: &str| (key == "SMTP_USERNAME").then(|| "bot".to_string());
        assert!(EmailDispatcher::with_lookup(&config(2525), only_user).is_ok());
    }

    #[tokio::test]
    async fn unreachable_relay_reports_a_failed_channel() {
        let dispatcher = EmailDispatcher::new(&config(9), None).unwrap();
        let report = dispatcher.notify(&batch(&["Mistral Small 3.1"])).await;
        assert_eq!(report.channels[0].channel, "email");
        assert_eq!(report.channels[0].delivered, 0);
        assert!(report.channels[0].error.is_some());

        let empty = dispatcher.notify(&ReleaseEventBatch::new(Uuid::new_v4())).await;
        assert_eq!(empty, DispatchReport::single("email", 0, None));
    }
}
