use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use threatkb_domain::{Job, JobState, JobType};

use crate::{Error, Result};

/// Column list selected for every `StixRecord`.
pub const RECORD_COLUMNS: &str = "\
storage_key, collection, semantic_id, stix_type, external_id, name, modified, created, revoked, \
deprecated, ingestion_note, ingestion_seq, is_latest, is_embedded, relationship_type, source_ref, \
target_ref, source_key, target_key, data, record_modified";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StixRecord {
	pub storage_key: Uuid,
	pub collection: String,
	pub semantic_id: String,
	pub stix_type: String,
	pub external_id: Option<String>,
	pub name: Option<String>,
	pub modified: Option<OffsetDateTime>,
	pub created: Option<OffsetDateTime>,
	pub revoked: bool,
	pub deprecated: bool,
	pub ingestion_note: String,
	pub ingestion_seq: i64,
	pub is_latest: bool,
	pub is_embedded: bool,
	pub relationship_type: Option<String>,
	pub source_ref: Option<String>,
	pub target_ref: Option<String>,
	pub source_key: Option<Uuid>,
	pub target_key: Option<Uuid>,
	pub data: Value,
	pub record_modified: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
	pub job_id: Uuid,
	pub job_type: String,
	pub state: String,
	pub parameters: Value,
	pub errors: Vec<String>,
	pub run_datetime: OffsetDateTime,
	pub completion_time: Option<OffsetDateTime>,
}
impl TryFrom<JobRow> for Job {
	type Error = Error;

	fn try_from(row: JobRow) -> Result<Self> {
		let job_type = row.job_type.parse::<JobType>().map_err(Error::InvalidArgument)?;
		let state = row.state.parse::<JobState>().map_err(Error::InvalidArgument)?;

		Ok(Self {
			id: row.job_id,
			job_type,
			state,
			parameters: row.parameters,
			errors: row.errors,
			run_datetime: row.run_datetime,
			completion_time: row.completion_time,
		})
	}
}

/// One `(modified, ingestion_note)` pair of an object's stored history.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HistoryEntry {
	pub modified: Option<OffsetDateTime>,
	pub ingestion_note: String,
}
