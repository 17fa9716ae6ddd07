//! Interval scheduling: one repeated job per interval group.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mrt_core::SourceType;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::ScheduleConfig;
use crate::pipeline::{Pipeline, RunOutcome, SourceFilter};
use crate::report::write_run_reports;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleGroup {
    pub name: &'static str,
    pub interval: Duration,
    pub filter: SourceFilter,
}

/// The HuggingFace interval, when set, owns HuggingFace sources; the global
/// interval covers everything else. Groups with no configured sources are dropped.
pub fn schedule_groups(schedule: &ScheduleConfig, configured: &HashSet<SourceType>) -> Vec<ScheduleGroup> {
    let global = Duration::from_secs(schedule.global_interval_secs.max(1));
    let Some(hf_secs) = schedule.huggingface_interval_secs else {
        return vec![ScheduleGroup {
            name: "global",
            interval: global,
            filter: SourceFilter::all(),
        }];
    };

    let mut groups = Vec::new();
    if configured.iter().any(|t| *t != SourceType::Huggingface) {
        groups.push(ScheduleGroup {
            name: "global",
            interval: global,
            filter: SourceFilter::excluding([SourceType::Huggingface]),
        });
    }
    if configured.contains(&SourceType::Huggingface) {
        groups.push(ScheduleGroup {
            name: "huggingface",
            interval: Duration::from_secs(hf_secs.max(1)),
            filter: SourceFilter::only([SourceType::Huggingface]),
        });
    }
    groups
}

/// Runs the group's pairs unless a previous tick of the same group is still active.
pub struct GroupRunner {
    pipeline: Arc<Pipeline>,
    group: ScheduleGroup,
    reports_dir: Option<PathBuf>,
    active: Mutex<()>,
}

impl GroupRunner {
    pub fn new(pipeline: Arc<Pipeline>, group: ScheduleGroup, reports_dir: Option<PathBuf>) -> Self {
        Self {
            pipeline,
            group,
            reports_dir,
            active: Mutex::new(()),
        }
    }

    pub fn group(&self) -> &ScheduleGroup {
        &self.group
    }

    /// `None` when the tick was skipped.
    pub async fn tick(&self) -> Option<RunOutcome> {
        let Ok(_running) = self.active.try_lock() else {
            warn!(group = self.group.name, "previous run still active; skipping tick");
            return None;
        };
        let outcome = self.pipeline.run(&self.group.filter).await;
        if let Some(dir) = &self.reports_dir {
            if let Err(err) = write_run_reports(dir, &outcome).await {
                warn!(group = self.group.name, run_id = %outcome.run_id, error = %format!("{err:#}"), "writing run reports failed");
            }
        }
        Some(outcome)
    }
}

/// Builds (but does not start) a scheduler with one repeated job per group.
pub async fn build_scheduler(runners: Vec<Arc<GroupRunner>>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for runner in runners {
        let interval = runner.group.interval;
        let name = runner.group.name;
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.tick().await;
            })
        })
        .with_context(|| format!("creating scheduler job for group {name}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(group = name, interval_secs = interval.as_secs(), "scheduled source group");
    }
    Ok(sched)
}
