//! The ordered-step ingestion pipeline run for one claimed job.

use std::{
	fmt,
	io::ErrorKind,
	path::{Path, PathBuf},
	sync::Arc,
};

use serde_json::Value;
use time::OffsetDateTime;

use threatkb_domain::{
	Job, JobType, VersionTag,
	job::{ProcessorParameters, UpdateParameters},
	stix::{EmbeddedRefOptions, prepare_objects},
};
use threatkb_providers::distribution::BundleSource;
use threatkb_storage::{jobs::JobStore, objects::ObjectStore};

use crate::{Error, Result, derive};

const TERMINAL_WRITE_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	Download,
	Write,
	DeriveRelationships,
	Cleanup,
}
impl Step {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Download => "download",
			Self::Write => "write",
			Self::DeriveRelationships => "derive-relationships",
			Self::Cleanup => "cleanup",
		}
	}
}
impl fmt::Display for Step {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Decoded job parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
	Update(UpdateParameters),
	Processor(ProcessorParameters),
}
impl Plan {
	pub fn from_job(job: &Job) -> Result<Self> {
		match job.job_type {
			JobType::CtiProcessor => Ok(Self::Processor(job.processor_parameters()?)),
			_ => {
				let parameters = job.update_parameters()?;

				if parameters.knowledge_base.job_type() != job.job_type {
					return Err(Error::Message(format!(
						"Job type {} does not ingest {}.",
						job.job_type, parameters.knowledge_base
					)));
				}

				Ok(Self::Update(parameters))
			},
		}
	}

	/// Processor jobs only derive; updates derive only for knowledge bases with a generator.
	pub fn steps(&self) -> Vec<Step> {
		match self {
			Self::Update(parameters) if parameters.knowledge_base.derives_technique_tactic() =>
				vec![Step::Download, Step::Write, Step::DeriveRelationships, Step::Cleanup],
			Self::Update(_) => vec![Step::Download, Step::Write, Step::Cleanup],
			Self::Processor(_) => vec![Step::DeriveRelationships, Step::Cleanup],
		}
	}
}

/// State carried from one step to the next within a run.
#[derive(Debug, Default)]
struct RunState {
	bundle_path: Option<PathBuf>,
	objects: Vec<Value>,
}

pub struct Pipeline {
	pub objects: Arc<dyn ObjectStore>,
	pub jobs: Arc<dyn JobStore>,
	pub distribution: Arc<dyn BundleSource>,
	pub temp_root: PathBuf,
}
impl Pipeline {
	/// Per-job scratch directory.
	pub fn job_dir(&self, job: &Job) -> PathBuf {
		self.temp_root.join(format!("{}--{}", job.job_type, job.id))
	}

	/// Runs a job already moved to processing and records its terminal state. Step errors are
	/// captured on the job; only job-store failures are returned.
	pub async fn run(&self, job: &Job) -> Result<()> {
		let dir = self.job_dir(job);

		let outcome = self.run_steps(job, &dir).await;

		match &outcome {
			Ok(()) => {
				tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job completed.");
			},
			Err(message) => {
				remove_dir(&dir).await;

				tracing::error!(
					job_id = %job.id,
					job_type = %job.job_type,
					error = %message,
					"Job failed."
				);
			},
		}

		self.record_outcome(job, &outcome).await
	}

	/// Writes the terminal state, retrying a failed write once. A job whose state cannot be
	/// written stays processing until the next startup recovery.
	async fn record_outcome(&self, job: &Job, outcome: &Result<(), String>) -> Result<()> {
		let mut attempt = 1;

		loop {
			let now = OffsetDateTime::now_utc();
			let written = match outcome {
				Ok(()) => self.jobs.complete(job.id, now).await,
				Err(message) => self.jobs.fail(job.id, message, now).await,
			};
			let err = match written {
				Ok(()) => return Ok(()),
				Err(err) => err,
			};
			let retryable = !matches!(err, threatkb_storage::Error::Conflict(_));

			if !retryable || attempt >= TERMINAL_WRITE_ATTEMPTS {
				tracing::error!(
					job_id = %job.id,
					job_type = %job.job_type,
					attempt,
					error = %err,
					"Failed to record job outcome; job is left processing."
				);

				return Err(err.into());
			}

			tracing::warn!(
				job_id = %job.id,
				job_type = %job.job_type,
				attempt,
				error = %err,
				"Failed to record job outcome; retrying."
			);

			attempt += 1;
		}
	}

	async fn run_steps(&self, job: &Job, dir: &Path) -> Result<(), String> {
		let plan = Plan::from_job(job)
			.map_err(|err| format!("{} job has invalid parameters: {err}", job.job_type))?;
		let mut state = RunState::default();

		for step in plan.steps() {
			tracing::info!(job_id = %job.id, job_type = %job.job_type, %step, "Running step.");

			self.run_step(step, &plan, dir, &mut state)
				.await
				.map_err(|err| format!("{step} step failed with: {err}"))?;
		}

		Ok(())
	}

	async fn run_step(&self, step: Step, plan: &Plan, dir: &Path, state: &mut RunState) -> Result<()> {
		match (step, plan) {
			(Step::Download, Plan::Update(parameters)) => {
				let version = stored_version(parameters)?;

				tokio::fs::create_dir_all(dir).await?;

				let path =
					self.distribution.fetch_bundle(parameters.knowledge_base, &version, dir).await?;

				state.bundle_path = Some(path);
			},
			(Step::Write, Plan::Update(parameters)) => {
				let path = state.bundle_path.as_deref().ok_or_else(|| {
					Error::Message("No bundle has been downloaded.".to_string())
				})?;
				let version = stored_version(parameters)?;

				state.objects = read_bundle(path).await?;

				let options = EmbeddedRefOptions {
					ignore_embedded_relationships: parameters.ignore_embedded_relationships,
					ignore_sro: parameters.ignore_embedded_relationships_sro,
					ignore_smo: parameters.ignore_embedded_relationships_smo,
				};
				let prepared = prepare_objects(&state.objects, options);

				self.objects
					.write_objects(
						parameters.knowledge_base.collection(),
						&version.ingestion_note(),
						&prepared,
					)
					.await?;
			},
			(Step::DeriveRelationships, Plan::Update(parameters)) => {
				let version = stored_version(parameters)?;

				derive::technique_tactic(
					self.objects.as_ref(),
					parameters.knowledge_base,
					&version,
					&state.objects,
				)
				.await?;
			},
			(Step::DeriveRelationships, Plan::Processor(parameters)) => {
				derive::cross_knowledge_base(self.objects.as_ref(), parameters).await?;
			},
			(Step::Cleanup, _) => {
				match tokio::fs::remove_dir_all(dir).await {
					Ok(()) => {},
					Err(err) if err.kind() == ErrorKind::NotFound => {},
					Err(err) => return Err(err.into()),
				}
			},
			(step, _) => {
				return Err(Error::Message(format!("Step {step} does not apply to this job.")));
			},
		}

		Ok(())
	}
}

fn stored_version(parameters: &UpdateParameters) -> Result<VersionTag> {
	VersionTag::parse(&parameters.version)
		.ok_or_else(|| Error::Message(format!("Job version {:?} is not a valid version.", parameters.version)))
}

/// The `objects` array of a downloaded STIX bundle.
pub async fn read_bundle(path: &Path) -> Result<Vec<Value>> {
	let raw = tokio::fs::read(path).await?;
	let bundle: Value = serde_json::from_slice(&raw)?;

	match bundle {
		Value::Object(mut map) => match map.remove("objects") {
			Some(Value::Array(objects)) => Ok(objects),
			_ => Err(Error::Message(format!("{} has no objects array.", path.display()))),
		},
		_ => Err(Error::Message(format!("{} is not a STIX bundle.", path.display()))),
	}
}

async fn remove_dir(dir: &Path) {
	if let Err(err) = tokio::fs::remove_dir_all(dir).await
		&& err.kind() != ErrorKind::NotFound
	{
		tracing::warn!(dir = %dir.display(), error = %err, "Failed to remove job directory.");
	}
}
