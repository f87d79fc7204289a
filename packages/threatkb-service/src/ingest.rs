//! Ingestion triggers, job queries and collection maintenance.

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use threatkb_domain::{
	Job, JobState, JobType, KnowledgeBase, ProcessorMode, VersionTag,
	job::{ProcessorParameters, UpdateParameters},
};
use threatkb_storage::{jobs::JobFilter, objects};

use crate::{
	Error, KbService, Result,
	page::{Page, PageRequest, PageWindow},
};

pub const JOBS_CONTAINER: &str = "jobs";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
	pub version: String,
	pub ignore_embedded_relationships: bool,
	pub ignore_embedded_relationships_sro: bool,
	pub ignore_embedded_relationships_smo: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessorRequest {
	pub ignore_embedded_relationships: bool,
	#[serde(with = "threatkb_domain::time_serde::option")]
	pub modified_min: Option<OffsetDateTime>,
	#[serde(with = "threatkb_domain::time_serde::option")]
	pub created_min: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobListFilter {
	#[serde(rename = "type")]
	pub job_type: Option<JobType>,
	pub state: Option<JobState>,
	#[serde(flatten)]
	pub page: PageRequest,
}

impl KbService {
	/// Queues the ingestion of one version of `kb`. The work happens in the worker.
	pub async fn trigger_update(&self, kb: KnowledgeBase, req: &UpdateRequest) -> Result<Job> {
		let version = VersionTag::parse(&req.version)
			.ok_or_else(|| {
			Error::validation(format!(
				"version {:?} must be non-empty and use only letters, digits, '.', '_' or '-'.",
				req.version
			))
		})?;
		let parameters = UpdateParameters {
			knowledge_base: kb,
			version: version.as_str().to_string(),
			ignore_embedded_relationships: req.ignore_embedded_relationships,
			ignore_embedded_relationships_sro: req.ignore_embedded_relationships_sro,
			ignore_embedded_relationships_smo: req.ignore_embedded_relationships_smo,
		};

		self.queue(kb.job_type(), serde_json::to_value(&parameters)?).await
	}

	/// Queues a cross-knowledge-base relationship job.
	pub async fn trigger_processor(&self, mode: ProcessorMode, req: &ProcessorRequest) -> Result<Job> {
		let parameters = ProcessorParameters {
			mode,
			ignore_embedded_relationships: req.ignore_embedded_relationships,
			modified_min: req.modified_min,
			created_min: req.created_min,
		};

		self.queue(JobType::CtiProcessor, serde_json::to_value(&parameters)?).await
	}

	pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
		self.jobs
			.get(job_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Job {job_id} does not exist.")))
	}

	/// Jobs newest first.
	pub async fn list_jobs(&self, filter: &JobListFilter) -> Result<Page<Job>> {
		let window = PageWindow::resolve(filter.page, &self.cfg.query)?;
		let store_filter = JobFilter {
			job_type: filter.job_type,
			state: filter.state,
			limit: window.window().limit,
			offset: window.offset(),
		};
		let (jobs, total) = self.jobs.list(&store_filter).await?;

		Ok(Page::new(window, total, JOBS_CONTAINER, jobs))
	}

	/// Versions the distribution endpoint publishes for `kb`.
	pub async fn available_versions(&self, kb: KnowledgeBase) -> Result<Vec<String>> {
		Ok(self.distribution.available_versions(kb).await?)
	}

	/// Deletes every stored record of `kb`. Returns the deleted count.
	pub async fn truncate(&self, kb: KnowledgeBase) -> Result<u64> {
		Ok(objects::truncate(&self.db, kb.collection()).await?)
	}

	async fn queue(&self, job_type: JobType, parameters: serde_json::Value) -> Result<Job> {
		let job = Job::new(job_type, parameters, OffsetDateTime::now_utc());

		self.jobs.create(&job).await?;

		tracing::info!(job_id = %job.id, job_type = %job.job_type, "Queued ingestion job.");

		Ok(job)
	}
}
