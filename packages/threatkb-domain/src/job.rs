use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::knowledge_base::{KnowledgeBase, ProcessorMode};

/// Error recorded on jobs that were still in flight when the worker started.
pub const STALE_JOB_ERROR: &str = "marked as failed on startup";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Job cannot move from {from} to {to}.")]
pub struct TransitionError {
	pub from: JobState,
	pub to: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
	Pending,
	Processing,
	Completed,
	Failed,
}
impl JobState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Processing => "processing",
			Self::Completed => "completed",
			Self::Failed => "failed",
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}

	/// `pending -> processing -> {completed, failed}`; pending jobs may also fail directly.
	pub fn can_transition_to(self, next: Self) -> bool {
		matches!(
			(self, next),
			(Self::Pending, Self::Processing)
				| (Self::Pending, Self::Failed)
				| (Self::Processing, Self::Completed)
				| (Self::Processing, Self::Failed)
		)
	}
}
impl fmt::Display for JobState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for JobState {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"pending" => Ok(Self::Pending),
			"processing" => Ok(Self::Processing),
			"completed" => Ok(Self::Completed),
			"failed" => Ok(Self::Failed),
			other => Err(format!("Unknown job state {other:?}.")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
	#[serde(rename = "attack-update")]
	AttackUpdate,
	#[serde(rename = "cwe-update")]
	CweUpdate,
	#[serde(rename = "capec-update")]
	CapecUpdate,
	#[serde(rename = "atlas-update")]
	AtlasUpdate,
	#[serde(rename = "location-update")]
	LocationUpdate,
	#[serde(rename = "disarm-update")]
	DisarmUpdate,
	#[serde(rename = "sector-update")]
	SectorUpdate,
	#[serde(rename = "cti-processor")]
	CtiProcessor,
}
impl JobType {
	pub const ALL: [Self; 8] = [
		Self::AttackUpdate,
		Self::CweUpdate,
		Self::CapecUpdate,
		Self::AtlasUpdate,
		Self::LocationUpdate,
		Self::DisarmUpdate,
		Self::SectorUpdate,
		Self::CtiProcessor,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::AttackUpdate => "attack-update",
			Self::CweUpdate => "cwe-update",
			Self::CapecUpdate => "capec-update",
			Self::AtlasUpdate => "atlas-update",
			Self::LocationUpdate => "location-update",
			Self::DisarmUpdate => "disarm-update",
			Self::SectorUpdate => "sector-update",
			Self::CtiProcessor => "cti-processor",
		}
	}
}
impl fmt::Display for JobType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for JobType {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|kind| kind.as_str() == raw)
			.ok_or_else(|| format!("Unknown job type {raw:?}."))
	}
}

/// Parameters of a knowledge-base version update job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParameters {
	pub knowledge_base: KnowledgeBase,
	/// Stored form of the requested version (`16_0`).
	pub version: String,
	#[serde(default)]
	pub ignore_embedded_relationships: bool,
	#[serde(default)]
	pub ignore_embedded_relationships_sro: bool,
	#[serde(default)]
	pub ignore_embedded_relationships_smo: bool,
}

/// Parameters of a cross-knowledge-base relationship job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorParameters {
	pub mode: ProcessorMode,
	#[serde(default)]
	pub ignore_embedded_relationships: bool,
	#[serde(default, with = "crate::time_serde::option")]
	pub modified_min: Option<OffsetDateTime>,
	#[serde(default, with = "crate::time_serde::option")]
	pub created_min: Option<OffsetDateTime>,
}

/// A persisted ingestion job as clients see it while polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
	pub id: Uuid,
	#[serde(rename = "type")]
	pub job_type: JobType,
	pub state: JobState,
	pub parameters: Value,
	pub errors: Vec<String>,
	#[serde(with = "crate::time_serde")]
	pub run_datetime: OffsetDateTime,
	#[serde(with = "crate::time_serde::option")]
	pub completion_time: Option<OffsetDateTime>,
}
impl Job {
	pub fn new(job_type: JobType, parameters: Value, now: OffsetDateTime) -> Self {
		Self {
			id: Uuid::new_v4(),
			job_type,
			state: JobState::Pending,
			parameters,
			errors: Vec::new(),
			run_datetime: now,
			completion_time: None,
		}
	}

	/// Moves to `next`. `completion_time` is stamped on the first entry into a terminal state
	/// and never overwritten.
	pub fn transition(&mut self, next: JobState, now: OffsetDateTime) -> Result<(), TransitionError> {
		if !self.state.can_transition_to(next) {
			return Err(TransitionError { from: self.state, to: next });
		}

		self.state = next;

		if next.is_terminal() && self.completion_time.is_none() {
			self.completion_time = Some(now);
		}

		Ok(())
	}

	pub fn fail(&mut self, message: impl Into<String>, now: OffsetDateTime) -> Result<(), TransitionError> {
		self.transition(JobState::Failed, now)?;
		self.errors.push(message.into());

		Ok(())
	}

	pub fn update_parameters(&self) -> serde_json::Result<UpdateParameters> {
		serde_json::from_value(self.parameters.clone())
	}

	pub fn processor_parameters(&self) -> serde_json::Result<ProcessorParameters> {
		serde_json::from_value(self.parameters.clone())
	}
}
