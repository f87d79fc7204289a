use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
};

use serde_json::{Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use threatkb_domain::{
	Job, JobState, JobType, KnowledgeBase, VersionTag,
	derive::TECHNIQUE_TACTIC_RELATIONSHIP,
	job::STALE_JOB_ERROR,
	stix::IngestObject,
};
use threatkb_providers::distribution::BundleSource;
use threatkb_storage::{
	jobs::{JobFilter, JobStore},
	objects::{ObjectStore, WriteReport},
};
use threatkb_testkit::MemoryJobStore;
use threatkb_worker::{
	pipeline::Pipeline,
	worker::{process_next, recover_stale_jobs},
};

#[derive(Debug, Clone)]
struct Write {
	collection: String,
	note: String,
	objects: Vec<IngestObject>,
}

#[derive(Default)]
struct FakeObjects {
	writes: Mutex<Vec<Write>>,
	latest: HashMap<String, Vec<Value>>,
	notes: HashMap<String, String>,
}
impl FakeObjects {
	fn writes(&self) -> Vec<Write> {
		self.writes.lock().expect("Writes lock poisoned.").clone()
	}
}
impl ObjectStore for FakeObjects {
	fn write_objects<'a>(
		&'a self,
		collection: &'a str,
		ingestion_note: &'a str,
		objects: &'a [IngestObject],
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<WriteReport>> {
		Box::pin(async move {
			let mut writes = self.writes.lock().expect("Writes lock poisoned.");

			writes.push(Write {
				collection: collection.to_string(),
				note: ingestion_note.to_string(),
				objects: objects.to_vec(),
			});

			let run = writes.len() as i64;

			Ok(WriteReport { written: objects.len() as u64, ingestion_seq: run, revision: run })
		})
	}

	fn latest_objects<'a>(
		&'a self,
		collection: &'a str,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<Vec<Value>>> {
		Box::pin(async move { Ok(self.latest.get(collection).cloned().unwrap_or_default()) })
	}

	fn latest_version_note<'a>(
		&'a self,
		collection: &'a str,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<Option<String>>> {
		Box::pin(async move { Ok(self.notes.get(collection).cloned()) })
	}
}

/// Serves one fixed bundle, or fails every download with a 404.
struct FakeDistribution {
	bundle: Option<Value>,
}
impl BundleSource for FakeDistribution {
	fn fetch_bundle<'a>(
		&'a self,
		kb: KnowledgeBase,
		version: &'a VersionTag,
		dest_dir: &'a Path,
	) -> threatkb_providers::BoxFuture<'a, threatkb_providers::Result<PathBuf>> {
		Box::pin(async move {
			let Some(bundle) = &self.bundle else {
				return Err(threatkb_providers::Error::Status {
					url: format!("http://downloads.invalid/{}", kb.bundle_filename(version)),
					status: 404,
				});
			};
			let path = dest_dir.join(kb.bundle_filename(version));

			tokio::fs::write(&path, bundle.to_string()).await?;

			Ok(path)
		})
	}

	fn available_versions<'a>(
		&'a self,
		_kb: KnowledgeBase,
	) -> threatkb_providers::BoxFuture<'a, threatkb_providers::Result<Vec<String>>> {
		Box::pin(async move { Ok(Vec::new()) })
	}
}

/// A memory job store whose first `refusals` terminal-state writes fail as if the pool timed out.
struct FlakyJobs {
	inner: MemoryJobStore,
	refusals: AtomicUsize,
}
impl FlakyJobs {
	fn new(refusals: usize) -> Self {
		Self { inner: MemoryJobStore::new(), refusals: AtomicUsize::new(refusals) }
	}

	fn refuse(&self) -> bool {
		self.refusals
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok()
	}
}
impl JobStore for FlakyJobs {
	fn create<'a>(
		&'a self,
		job: &'a Job,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<()>> {
		self.inner.create(job)
	}

	fn get<'a>(
		&'a self,
		job_id: Uuid,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<Option<Job>>> {
		self.inner.get(job_id)
	}

	fn list<'a>(
		&'a self,
		filter: &'a JobFilter,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<(Vec<Job>, i64)>> {
		self.inner.list(filter)
	}

	fn claim_next<'a>(
		&'a self,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<Option<Job>>> {
		self.inner.claim_next()
	}

	fn complete<'a>(
		&'a self,
		job_id: Uuid,
		now: OffsetDateTime,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<()>> {
		if self.refuse() {
			let refused: threatkb_storage::Result<()> = Err(sqlx::Error::PoolTimedOut.into());

			return Box::pin(async move { refused });
		}

		self.inner.complete(job_id, now)
	}

	fn fail<'a>(
		&'a self,
		job_id: Uuid,
		message: &'a str,
		now: OffsetDateTime,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<()>> {
		if self.refuse() {
			let refused: threatkb_storage::Result<()> = Err(sqlx::Error::PoolTimedOut.into());

			return Box::pin(async move { refused });
		}

		self.inner.fail(job_id, message, now)
	}

	fn fail_stale<'a>(
		&'a self,
		message: &'a str,
		now: OffsetDateTime,
	) -> threatkb_storage::BoxFuture<'a, threatkb_storage::Result<u64>> {
		self.inner.fail_stale(message, now)
	}
}

fn flaky_pipeline(jobs: Arc<FlakyJobs>, bundle: Option<Value>) -> Pipeline {
	Pipeline {
		objects: Arc::new(FakeObjects::default()),
		jobs,
		distribution: Arc::new(FakeDistribution { bundle }),
		temp_root: std::env::temp_dir().join(format!("threatkb-worker-{}", Uuid::new_v4().simple())),
	}
}

struct Harness {
	pipeline: Pipeline,
	jobs: Arc<MemoryJobStore>,
	objects: Arc<FakeObjects>,
}

fn harness(objects: FakeObjects, bundle: Option<Value>) -> Harness {
	let jobs = Arc::new(MemoryJobStore::new());
	let objects = Arc::new(objects);
	let pipeline = Pipeline {
		objects: objects.clone(),
		jobs: jobs.clone(),
		distribution: Arc::new(FakeDistribution { bundle }),
		temp_root: std::env::temp_dir().join(format!("threatkb-worker-{}", Uuid::new_v4().simple())),
	};

	Harness { pipeline, jobs, objects }
}

fn update_job(kb: KnowledgeBase, version: &str) -> Job {
	Job::new(
		kb.job_type(),
		json!({ "knowledge_base": kb.name(), "version": version }),
		OffsetDateTime::now_utc(),
	)
}

fn attack_bundle() -> Value {
	json!({
		"type": "bundle",
		"id": "bundle--5f1b7d5e-7b1a-4a4e-9d0e-3c8a0f2b6d11",
		"objects": [
			{
				"type": "x-mitre-tactic",
				"id": "x-mitre-tactic--4ca45d45-df4d-4613-8980-bac22d278fa5",
				"name": "Lateral Movement",
				"x_mitre_shortname": "lateral-movement",
				"modified": "2024-01-01T00:00:00.000Z"
			},
			{
				"type": "attack-pattern",
				"id": "attack-pattern--54a649ff-439a-41a4-9856-8d144a2551ba",
				"name": "Remote Services",
				"modified": "2024-01-01T00:00:00.000Z",
				"kill_chain_phases": [
					{ "kill_chain_name": "mitre-attack", "phase_name": "lateral-movement" }
				],
				"external_references": [{ "source_name": "mitre-attack", "external_id": "T1021" }]
			}
		]
	})
}

#[tokio::test]
async fn update_jobs_write_derive_and_complete() {
	let harness = harness(FakeObjects::default(), Some(attack_bundle()));
	let job = update_job(KnowledgeBase::AttackEnterprise, "16_0");

	harness.jobs.create(&job).await.expect("Failed to create job.");

	let ran = process_next(&harness.pipeline).await.expect("Failed to process job.");
	let stored = harness.jobs.snapshot().remove(0);
	let writes = harness.objects.writes();

	assert_eq!(ran, Some(job.id));
	assert_eq!(stored.state, JobState::Completed);
	assert!(stored.errors.is_empty());
	assert!(stored.completion_time.is_some());
	assert_eq!(writes.len(), 2);
	assert!(writes.iter().all(|write| write.collection == "mitre_attack_enterprise"));
	assert!(writes.iter().all(|write| write.note == "version=16_0"));
	assert_eq!(writes[0].objects.iter().filter(|object| !object.is_embedded).count(), 2);
	assert_eq!(
		writes[1].objects[0].fields.relationship_type.as_deref(),
		Some(TECHNIQUE_TACTIC_RELATIONSHIP)
	);
	assert!(!harness.pipeline.job_dir(&job).exists());
}

#[tokio::test]
async fn knowledge_bases_without_generators_skip_derivation() {
	let bundle = json!({
		"type": "bundle",
		"objects": [{
			"type": "weakness",
			"id": "weakness--1",
			"name": "Improper Input Validation",
			"external_references": [{ "source_name": "cwe", "external_id": "CWE-20" }]
		}]
	});
	let harness = harness(FakeObjects::default(), Some(bundle));

	harness
		.jobs
		.create(&update_job(KnowledgeBase::Cwe, "4_16"))
		.await
		.expect("Failed to create job.");
	process_next(&harness.pipeline).await.expect("Failed to process job.");

	assert_eq!(harness.objects.writes().len(), 1);
	assert_eq!(harness.jobs.snapshot()[0].state, JobState::Completed);
}

#[tokio::test]
async fn failed_downloads_fail_the_job_without_writing() {
	let harness = harness(FakeObjects::default(), None);
	let job = update_job(KnowledgeBase::Capec, "3_9");

	harness.jobs.create(&job).await.expect("Failed to create job.");
	process_next(&harness.pipeline).await.expect("Failed to process job.");

	let stored = harness.jobs.snapshot().remove(0);

	assert_eq!(stored.state, JobState::Failed);
	assert_eq!(stored.errors.len(), 1);
	assert!(stored.errors[0].starts_with("download step failed with:"), "{}", stored.errors[0]);
	assert!(stored.completion_time.is_some());
	assert!(harness.objects.writes().is_empty());
	assert!(!harness.pipeline.job_dir(&job).exists());
}

#[tokio::test]
async fn malformed_bundles_fail_at_the_write_step() {
	let harness = harness(FakeObjects::default(), Some(json!({ "type": "bundle" })));

	harness
		.jobs
		.create(&update_job(KnowledgeBase::Location, "1_0"))
		.await
		.expect("Failed to create job.");
	process_next(&harness.pipeline).await.expect("Failed to process job.");

	let stored = harness.jobs.snapshot().remove(0);

	assert_eq!(stored.state, JobState::Failed);
	assert!(stored.errors[0].starts_with("write step failed with:"), "{}", stored.errors[0]);
}

#[tokio::test]
async fn processor_jobs_link_source_objects_to_targets() {
	let objects = FakeObjects {
		latest: HashMap::from([
			(
				"mitre_capec".to_string(),
				vec![json!({
					"type": "attack-pattern",
					"id": "attack-pattern--capec-112",
					"modified": "2023-01-01T00:00:00.000Z",
					"external_references": [
						{ "source_name": "capec", "external_id": "CAPEC-112" },
						{ "source_name": "ATTACK", "external_id": "T1110" }
					]
				})],
			),
			(
				"mitre_attack_enterprise".to_string(),
				vec![json!({
					"type": "attack-pattern",
					"id": "attack-pattern--t1110",
					"external_references": [{ "source_name": "mitre-attack", "external_id": "T1110" }]
				})],
			),
		]),
		notes: HashMap::from([("mitre_capec".to_string(), "version=3_9".to_string())]),
		..Default::default()
	};
	let harness = harness(objects, None);
	let job = Job::new(
		JobType::CtiProcessor,
		json!({ "mode": "capec-attack" }),
		OffsetDateTime::now_utc(),
	);

	harness.jobs.create(&job).await.expect("Failed to create job.");
	process_next(&harness.pipeline).await.expect("Failed to process job.");

	let writes = harness.objects.writes();

	assert_eq!(harness.jobs.snapshot()[0].state, JobState::Completed);
	assert_eq!(writes.len(), 1);
	assert_eq!(writes[0].collection, "mitre_capec");
	assert_eq!(writes[0].note, "version=3_9");

	let derived = &writes[0].objects[0].fields;

	assert_eq!(derived.relationship_type.as_deref(), Some("technique"));
	assert_eq!(derived.source_ref.as_deref(), Some("attack-pattern--capec-112"));
	assert_eq!(derived.target_ref.as_deref(), Some("attack-pattern--t1110"));
}

#[tokio::test]
async fn processor_jobs_need_an_ingested_source() {
	let harness = harness(FakeObjects::default(), None);
	let job = Job::new(JobType::CtiProcessor, json!({ "mode": "cwe-capec" }), OffsetDateTime::now_utc());

	harness.jobs.create(&job).await.expect("Failed to create job.");
	process_next(&harness.pipeline).await.expect("Failed to process job.");

	let stored = harness.jobs.snapshot().remove(0);

	assert_eq!(stored.state, JobState::Failed);
	assert_eq!(
		stored.errors,
		vec!["derive-relationships step failed with: No version of cwe has been ingested."]
	);
}

#[tokio::test]
async fn startup_recovery_fails_unfinished_jobs() {
	let now = OffsetDateTime::now_utc();
	let mut processing = update_job(KnowledgeBase::Atlas, "4_5");
	let mut completed = update_job(KnowledgeBase::Disarm, "1_5");

	processing.transition(JobState::Processing, now).expect("Failed to start job.");
	completed.transition(JobState::Processing, now).expect("Failed to start job.");
	completed.transition(JobState::Completed, now).expect("Failed to complete job.");

	let jobs = MemoryJobStore::with_jobs(vec![
		update_job(KnowledgeBase::Cwe, "4_16"),
		processing,
		completed.clone(),
	]);
	let recovered = recover_stale_jobs(&jobs).await.expect("Failed to recover jobs.");
	let snapshot = jobs.snapshot();

	assert_eq!(recovered, 2);
	assert!(snapshot[..2].iter().all(|job| job.state == JobState::Failed));
	assert!(snapshot[..2].iter().all(|job| job.errors == vec![STALE_JOB_ERROR.to_string()]));
	assert_eq!(snapshot[2], completed);
}

#[tokio::test]
async fn idle_workers_claim_nothing() {
	let harness = harness(FakeObjects::default(), None);

	assert_eq!(process_next(&harness.pipeline).await.expect("Failed to poll."), None);
}

#[tokio::test]
async fn a_transient_completion_error_is_retried() {
	let bundle = json!({
		"type": "bundle",
		"objects": [{
			"type": "identity",
			"id": "identity--9a3b1f4e-6a57-4c0b-8d55-2b0e6c3f0a10",
			"name": "Maritime Transport",
			"identity_class": "class",
			"external_references": [{ "source_name": "sector2stix", "external_id": "maritime-transport" }]
		}]
	});
	let jobs = Arc::new(FlakyJobs::new(1));
	let pipeline = flaky_pipeline(jobs.clone(), Some(bundle));
	let job = update_job(KnowledgeBase::Sector, "1_0");

	jobs.create(&job).await.expect("Failed to create job.");
	process_next(&pipeline).await.expect("Failed to process job.");

	assert_eq!(jobs.inner.snapshot()[0].state, JobState::Completed);
}

#[tokio::test]
async fn a_transient_failure_record_error_is_retried() {
	let jobs = Arc::new(FlakyJobs::new(1));
	let pipeline = flaky_pipeline(jobs.clone(), None);

	jobs.create(&update_job(KnowledgeBase::Capec, "3_9")).await.expect("Failed to create job.");
	process_next(&pipeline).await.expect("Failed to process job.");

	let stored = jobs.inner.snapshot().remove(0);

	assert_eq!(stored.state, JobState::Failed);
	assert_eq!(stored.errors.len(), 1);
}

#[tokio::test]
async fn unrecordable_outcomes_name_the_job() {
	let jobs = Arc::new(FlakyJobs::new(2));
	let pipeline = flaky_pipeline(jobs.clone(), None);
	let job = update_job(KnowledgeBase::Capec, "3_9");

	jobs.create(&job).await.expect("Failed to create job.");

	let err = process_next(&pipeline).await.expect_err("Expected an unrecorded outcome.");

	assert!(err.to_string().contains(&job.id.to_string()), "{err}");
	assert_eq!(jobs.inner.snapshot()[0].state, JobState::Processing);
}
