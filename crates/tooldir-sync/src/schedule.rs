use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{SyncConfig, SyncError, SyncRequest, SyncRunner};

/// Cron jobs for the posts and topics presets, or `None` when scheduling is disabled.
///
/// Jobs go through the runner's single-flight gate, so a tick that overlaps a
/// manual trigger is skipped rather than queued. Once the archive is drained each
/// tick restarts from the newest page.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    runner: &SyncRunner,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let presets = [
        ("posts", config.posts_cron.as_str(), SyncRequest::posts_preset()),
        ("topics", config.topics_cron.as_str(), SyncRequest::topics_preset()),
    ];
    for (label, cron, request) in presets {
        let runner = runner.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let runner = runner.clone();
            let request = request.clone();
            Box::pin(async move {
                match runner.trigger_preset(request).await {
                    Ok(report) => info!(
                        preset = label,
                        pages_run = report.pages_run,
                        upserted_posts = report.upserted_posts,
                        "scheduled sync finished"
                    ),
                    Err(failure) if matches!(failure.error, SyncError::AlreadyRunning) => {
                        warn!(preset = label, "scheduled sync skipped; a run is in flight")
                    }
                    Err(failure) => warn!(
                        preset = label,
                        kind = failure.error.kind(),
                        page = ?failure.error.page(),
                        error = %failure.error,
                        "scheduled sync failed"
                    ),
                }
            })
        })
        .with_context(|| format!("creating {label} scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
