use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::task::JoinSet;
use uuid::Uuid;

use threatkb_domain::job::STALE_JOB_ERROR;
use threatkb_storage::jobs::JobStore;

use crate::{Error, Result, pipeline::Pipeline};

/// Fails every job a previous process left pending or processing; nothing can resume them.
pub async fn recover_stale_jobs(jobs: &dyn JobStore) -> Result<u64> {
	let recovered = jobs.fail_stale(STALE_JOB_ERROR, OffsetDateTime::now_utc()).await?;

	if recovered > 0 {
		tracing::warn!(recovered, "Marked stale jobs as failed.");
	}

	Ok(recovered)
}

/// Claims and runs at most one job. Returns the id of the job it ran.
pub async fn process_next(pipeline: &Pipeline) -> Result<Option<Uuid>> {
	let Some(job) = pipeline.jobs.claim_next().await? else {
		return Ok(None);
	};

	tracing::info!(job_id = %job.id, job_type = %job.job_type, "Claimed job.");

	pipeline.run(&job).await.map_err(|err| {
		Error::Message(format!("Job {} could not be finalized: {err}", job.id))
	})?;

	Ok(Some(job.id))
}

/// Recovers stale jobs, then polls with `cfg.concurrency` independent loops.
pub async fn run_worker(pipeline: Arc<Pipeline>, cfg: &threatkb_config::Worker) -> Result<()> {
	recover_stale_jobs(pipeline.jobs.as_ref()).await?;

	let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
	let mut loops: JoinSet<()> = JoinSet::new();

	for slot in 0..cfg.concurrency {
		let pipeline = pipeline.clone();

		loops.spawn(async move {
			tracing::info!(slot, "Worker loop started.");

			loop {
				match process_next(&pipeline).await {
					Ok(Some(_)) => continue,
					Ok(None) => {},
					Err(err) => {
						tracing::error!(slot, error = %err, "Job processing failed.");
					},
				}

				tokio::time::sleep(poll_interval).await;
			}
		});
	}

	match loops.join_next().await {
		Some(Err(err)) => Err(Error::Message(format!("Worker loop stopped: {err}."))),
		_ => Ok(()),
	}
}
