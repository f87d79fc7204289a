use std::sync::Mutex;

use time::OffsetDateTime;
use uuid::Uuid;

use threatkb_domain::{Job, JobState};
use threatkb_storage::{
	BoxFuture, Error, Result,
	jobs::{JobFilter, JobStore},
};

/// A `JobStore` held in process memory, applying the same transition rules as Postgres.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
	jobs: Mutex<Vec<Job>>,
}
impl MemoryJobStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_jobs(jobs: Vec<Job>) -> Self {
		Self { jobs: Mutex::new(jobs) }
	}

	/// A copy of every stored job, in insertion order.
	pub fn snapshot(&self) -> Vec<Job> {
		self.jobs.lock().unwrap_or_else(|err| err.into_inner()).clone()
	}

	fn update<T>(&self, job_id: Uuid, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
		let mut jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());
		let job = jobs
			.iter_mut()
			.find(|job| job.id == job_id)
			.ok_or_else(|| Error::NotFound(format!("Job {job_id} does not exist.")))?;

		f(job)
	}
}
impl JobStore for MemoryJobStore {
	fn create<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let mut jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());

			if jobs.iter().any(|existing| existing.id == job.id) {
				return Err(Error::Conflict(format!("Job {} already exists.", job.id)));
			}

			jobs.push(job.clone());

			Ok(())
		})
	}

	fn get<'a>(&'a self, job_id: Uuid) -> BoxFuture<'a, Result<Option<Job>>> {
		Box::pin(async move {
			let jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());

			Ok(jobs.iter().find(|job| job.id == job_id).cloned())
		})
	}

	fn list<'a>(&'a self, filter: &'a JobFilter) -> BoxFuture<'a, Result<(Vec<Job>, i64)>> {
		Box::pin(async move {
			let jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());
			let mut matching: Vec<Job> = jobs
				.iter()
				.filter(|job| filter.job_type.is_none_or(|job_type| job.job_type == job_type))
				.filter(|job| filter.state.is_none_or(|state| job.state == state))
				.cloned()
				.collect();

			matching.sort_by(|a, b| b.run_datetime.cmp(&a.run_datetime).then(b.id.cmp(&a.id)));

			let total = matching.len() as i64;
			let page = matching
				.into_iter()
				.skip(filter.offset.max(0) as usize)
				.take(filter.limit.max(0) as usize)
				.collect();

			Ok((page, total))
		})
	}

	fn claim_next<'a>(&'a self) -> BoxFuture<'a, Result<Option<Job>>> {
		Box::pin(async move {
			let mut jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());
			let Some(job) = jobs
				.iter_mut()
				.filter(|job| job.state == JobState::Pending)
				.min_by_key(|job| job.run_datetime)
			else {
				return Ok(None);
			};

			job.transition(JobState::Processing, OffsetDateTime::now_utc())
				.map_err(|err| Error::Conflict(err.to_string()))?;

			Ok(Some(job.clone()))
		})
	}

	fn complete<'a>(&'a self, job_id: Uuid, now: OffsetDateTime) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			self.update(job_id, |job| {
				job.transition(JobState::Completed, now)
					.map_err(|err| Error::Conflict(err.to_string()))
			})
		})
	}

	fn fail<'a>(
		&'a self,
		job_id: Uuid,
		message: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			self.update(job_id, |job| {
				job.fail(message, now).map_err(|err| Error::Conflict(err.to_string()))
			})
		})
	}

	fn fail_stale<'a>(
		&'a self,
		message: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<u64>> {
		Box::pin(async move {
			let mut jobs = self.jobs.lock().unwrap_or_else(|err| err.into_inner());
			let mut failed = 0;

			for job in jobs.iter_mut().filter(|job| !job.state.is_terminal()) {
				job.fail(message, now).map_err(|err| Error::Conflict(err.to_string()))?;

				failed += 1;
			}

			Ok(failed)
		})
	}
}
