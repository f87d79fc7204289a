use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use threatkb_domain::{Job, JobState, JobType};

use crate::{BoxFuture, Error, Result, db::Db, models::JobRow};

const JOB_COLUMNS: &str =
	"job_id, job_type, state, parameters, errors, run_datetime, completion_time";

/// Listing filter; results are newest `run_datetime` first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
	pub job_type: Option<JobType>,
	pub state: Option<JobState>,
	pub limit: i64,
	pub offset: i64,
}

/// Persisted job records. Every state change goes through one of these calls.
pub trait JobStore: Send + Sync {
	fn create<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>>;

	fn get<'a>(&'a self, job_id: Uuid) -> BoxFuture<'a, Result<Option<Job>>>;

	/// Returns the page and the exact total matching the filter.
	fn list<'a>(&'a self, filter: &'a JobFilter) -> BoxFuture<'a, Result<(Vec<Job>, i64)>>;

	/// Atomically moves the oldest pending job to processing and returns it.
	fn claim_next<'a>(&'a self) -> BoxFuture<'a, Result<Option<Job>>>;

	fn complete<'a>(&'a self, job_id: Uuid, now: OffsetDateTime) -> BoxFuture<'a, Result<()>>;

	fn fail<'a>(
		&'a self,
		job_id: Uuid,
		message: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<()>>;

	/// Fails every pending or processing job with `message`. Returns how many were failed.
	fn fail_stale<'a>(&'a self, message: &'a str, now: OffsetDateTime)
	-> BoxFuture<'a, Result<u64>>;
}
impl JobStore for Db {
	fn create<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			sqlx::query(
				"\
INSERT INTO ingestion_jobs (job_id, job_type, state, parameters, errors, run_datetime, completion_time)
VALUES ($1, $2, $3, $4, $5, $6, $7)",
			)
			.bind(job.id)
			.bind(job.job_type.as_str())
			.bind(job.state.as_str())
			.bind(&job.parameters)
			.bind(&job.errors)
			.bind(job.run_datetime)
			.bind(job.completion_time)
			.execute(&self.pool)
			.await?;

			Ok(())
		})
	}

	fn get<'a>(&'a self, job_id: Uuid) -> BoxFuture<'a, Result<Option<Job>>> {
		Box::pin(async move {
			let row: Option<JobRow> =
				sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE job_id = $1"))
					.bind(job_id)
					.fetch_optional(&self.pool)
					.await?;

			row.map(Job::try_from).transpose()
		})
	}

	fn list<'a>(&'a self, filter: &'a JobFilter) -> BoxFuture<'a, Result<(Vec<Job>, i64)>> {
		Box::pin(async move {
			let mut rows_builder = QueryBuilder::<Postgres>::new(format!(
				"SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE TRUE"
			));
			let mut count_builder =
				QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ingestion_jobs WHERE TRUE");

			for builder in [&mut rows_builder, &mut count_builder] {
				if let Some(job_type) = filter.job_type {
					builder.push(" AND job_type = ");
					builder.push_bind(job_type.as_str());
				}
				if let Some(state) = filter.state {
					builder.push(" AND state = ");
					builder.push_bind(state.as_str());
				}
			}

			rows_builder.push(" ORDER BY run_datetime DESC, job_id DESC LIMIT ");
			rows_builder.push_bind(filter.limit);
			rows_builder.push(" OFFSET ");
			rows_builder.push_bind(filter.offset);

			let rows: Vec<JobRow> = rows_builder.build_query_as().fetch_all(&self.pool).await?;
			let total: i64 = count_builder.build_query_scalar().fetch_one(&self.pool).await?;
			let jobs = rows.into_iter().map(Job::try_from).collect::<Result<Vec<_>>>()?;

			Ok((jobs, total))
		})
	}

	fn claim_next<'a>(&'a self) -> BoxFuture<'a, Result<Option<Job>>> {
		Box::pin(async move {
			let mut tx = self.pool.begin().await?;
			let row: Option<JobRow> = sqlx::query_as(&format!(
				"\
SELECT {JOB_COLUMNS}
FROM ingestion_jobs
WHERE state = 'pending'
ORDER BY run_datetime ASC
LIMIT 1
FOR UPDATE SKIP LOCKED"
			))
			.fetch_optional(&mut *tx)
			.await?;
			let Some(row) = row else {
				tx.commit().await?;

				return Ok(None);
			};
			let mut job = Job::try_from(row)?;

			job.transition(JobState::Processing, OffsetDateTime::now_utc())
				.map_err(|err| Error::Conflict(err.to_string()))?;

			sqlx::query("UPDATE ingestion_jobs SET state = 'processing' WHERE job_id = $1")
				.bind(job.id)
				.execute(&mut *tx)
				.await?;

			tx.commit().await?;

			Ok(Some(job))
		})
	}

	fn complete<'a>(&'a self, job_id: Uuid, now: OffsetDateTime) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let result = sqlx::query(
				"\
UPDATE ingestion_jobs
SET state = 'completed', completion_time = COALESCE(completion_time, $2)
WHERE job_id = $1 AND state = 'processing'",
			)
			.bind(job_id)
			.bind(now)
			.execute(&self.pool)
			.await?;

			if result.rows_affected() == 0 {
				return Err(Error::Conflict(format!("Job {job_id} is not processing.")));
			}

			Ok(())
		})
	}

	fn fail<'a>(
		&'a self,
		job_id: Uuid,
		message: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let result = sqlx::query(
				"\
UPDATE ingestion_jobs
SET
	state = 'failed',
	errors = array_append(errors, $2),
	completion_time = COALESCE(completion_time, $3)
WHERE job_id = $1 AND state IN ('pending', 'processing')",
			)
			.bind(job_id)
			.bind(message)
			.bind(now)
			.execute(&self.pool)
			.await?;

			if result.rows_affected() == 0 {
				return Err(Error::Conflict(format!("Job {job_id} is already terminal.")));
			}

			Ok(())
		})
	}

	fn fail_stale<'a>(
		&'a self,
		message: &'a str,
		now: OffsetDateTime,
	) -> BoxFuture<'a, Result<u64>> {
		Box::pin(async move {
			let result = sqlx::query(
				"\
UPDATE ingestion_jobs
SET
	state = 'failed',
	errors = array_append(errors, $1),
	completion_time = COALESCE(completion_time, $2)
WHERE state IN ('pending', 'processing')",
			)
			.bind(message)
			.bind(now)
			.execute(&self.pool)
			.await?;

			Ok(result.rows_affected())
		})
	}
}
