//! Per-run report files and the recent-runs digest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::notify::render_event_line;
use crate::pipeline::RunOutcome;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "release_brief.md";

pub fn release_brief_markdown(outcome: &RunOutcome) -> String {
    let summary = &outcome.summary;
    let mut lines = vec![
        "# Model Release Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", outcome.run_id),
        format!("- Started: {}", outcome.started_at.to_rfc3339()),
        format!("- Finished: {}", outcome.finished_at.to_rfc3339()),
        format!("- Source pairs: {}", summary.pairs),
        format!("- Candidates: {}", summary.candidates),
        format!("- New releases: {}", summary.new_events),
        format!("- Duplicates skipped: {}", summary.duplicates),
        format!("- Not releases: {}", summary.not_release),
        format!("- Malformed items: {}", summary.malformed_items),
        format!("- Failed pairs: {}", summary.failed_pairs),
        String::new(),
        "## New Releases".to_string(),
    ];
    if outcome.batch.is_empty() {
        lines.push("- none".to_string());
    }
    let mut by_company: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for event in outcome.batch.iter() {
        by_company
            .entry(event.item.company.as_str())
            .or_default()
            .push(render_event_line(event));
    }
    for (company, events) in by_company {
        lines.push(format!("### {company}"));
        lines.extend(events.into_iter().map(|e| format!("- {e}")));
    }

    if !outcome.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Sources".to_string());
        for failure in &outcome.failures {
            lines.push(format!("- {} ({:?}): {}", failure.pair, failure.kind, failure.cause));
        }
    }

    let failed_channels = outcome.dispatch.failed_channels().collect::<Vec<_>>();
    if !failed_channels.is_empty() {
        lines.push(String::new());
        lines.push("## Notification Failures".to_string());
        for channel in failed_channels {
            lines.push(format!(
                "- {}: {}",
                channel.channel,
                channel.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_dir>/<run_id>/{run_summary.json, release_brief.md}`.
pub async fn write_run_reports(reports_dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
    let run_dir = reports_dir.join(outcome.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(outcome).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(run_dir.join(BRIEF_FILE), release_brief_markdown(outcome))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(run_dir)
}

/// Markdown digest of the most recent `runs` reports, newest first.
pub fn report_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut outcomes = Vec::new();
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let summary_path = entry.path().join(SUMMARY_FILE);
        if !summary_path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let outcome: RunOutcome = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        outcomes.push((entry.path(), outcome));
    }
    outcomes.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# Model Release Tracker Report".to_string(), String::new()];
    if outcomes.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (dir, outcome) in outcomes.into_iter().take(runs.max(1)) {
        let summary = outcome.summary;
        lines.push(format!("## Run `{}`", outcome.run_id));
        lines.push(format!("- started: {}", outcome.started_at.to_rfc3339()));
        lines.push(format!(
            "- new releases: {} (duplicates {}, not releases {}, malformed {})",
            summary.new_events, summary.duplicates, summary.not_release, summary.malformed_items
        ));
        lines.push(format!("- failed pairs: {}/{}", summary.failed_pairs, summary.pairs));
        for event in outcome.batch.iter() {
            lines.push(format!("  - {}", render_event_line(event)));
        }
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
