use std::{collections::BTreeMap, sync::Arc};

use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

use threatkb_config::{Bundle, Config, Distribution, Postgres, Query, Service, Storage, Worker};
use threatkb_domain::{JobState, JobType, KnowledgeBase, ProcessorMode, VersionTag};
use threatkb_providers::distribution::HttpDistribution;
use threatkb_service::{
	BundleFilter, Direction, JobListFilter, KbService, ObjectFilter, ObjectLookup, PageRequest,
	ProcessorRequest, RelationshipFilter, SearchFilter, UpdateRequest,
};
use threatkb_storage::{db::Db, objects::ObjectStore};
use threatkb_testkit::{MemoryJobStore, TestDatabase};

fn config(dsn: &str, distribution_root: &str) -> Config {
	Config {
		service: Service { log_level: "info".to_string() },
		storage: Storage { postgres: Postgres { dsn: dsn.to_string(), pool_max_conns: 2 } },
		query: Query { default_page_size: 50, max_page_size: 200, max_page_number: 1_000 },
		bundle: Bundle::default(),
		distribution: Distribution {
			timeout_ms: 2_000,
			roots: BTreeMap::from([("cwe".to_string(), distribution_root.to_string())]),
		},
		worker: Worker {
			concurrency: 1,
			poll_interval_ms: 100,
			temp_root: std::env::temp_dir().display().to_string(),
		},
	}
}

/// A service whose pool never connects; only job and distribution paths may be exercised.
fn offline_service(distribution_root: &str) -> (KbService, Arc<MemoryJobStore>) {
	let cfg = config("postgres://threatkb@localhost/threatkb_unused", distribution_root);
	let pool = PgPoolOptions::new()
		.connect_lazy(&cfg.storage.postgres.dsn)
		.expect("Failed to build lazy pool.");
	let distribution =
		Arc::new(HttpDistribution::new(&cfg.distribution).expect("Failed to build distribution."));
	let jobs = Arc::new(MemoryJobStore::new());
	let service = KbService::new(cfg, Db { pool }, distribution, jobs.clone());

	(service, jobs)
}

#[tokio::test]
async fn update_trigger_queues_a_pending_job() {
	let (service, jobs) = offline_service("http://127.0.0.1:9/cwe/");
	let job = service
		.trigger_update(
			KnowledgeBase::Cwe,
			&UpdateRequest {
				version: "4.16".to_string(),
				ignore_embedded_relationships_smo: true,
				..Default::default()
			},
		)
		.await
		.expect("Failed to trigger update.");

	assert_eq!(job.job_type, JobType::CweUpdate);
	assert_eq!(job.state, JobState::Pending);
	assert!(job.completion_time.is_none());

	let parameters = job.update_parameters().expect("Failed to decode parameters.");

	assert_eq!(parameters.version, "4_16");
	assert!(parameters.ignore_embedded_relationships_smo);
	assert_eq!(jobs.snapshot(), vec![job.clone()]);
	assert_eq!(service.get_job(job.id).await.expect("Failed to read job."), job);
}

#[tokio::test]
async fn blank_versions_and_unknown_jobs_are_rejected() {
	let (service, _) = offline_service("http://127.0.0.1:9/cwe/");
	let blank = service.trigger_update(KnowledgeBase::Capec, &UpdateRequest::default()).await;
	let missing = service.get_job(uuid::Uuid::new_v4()).await;

	assert_eq!(blank.map_err(|err| err.code()).err(), Some(400));
	assert_eq!(missing.map_err(|err| err.code()).err(), Some(404));
}

#[tokio::test]
async fn versions_that_escape_the_distribution_path_are_rejected() {
	let (service, jobs) = offline_service("http://127.0.0.1:9/cwe/");

	for version in ["../../etc/passwd", "4.16/../../x", "4.16?token=1"] {
		let req = UpdateRequest { version: version.to_string(), ..Default::default() };
		let queued = service.trigger_update(KnowledgeBase::Cwe, &req).await;

		assert_eq!(queued.map_err(|err| err.code()).err(), Some(400), "{version}");
	}

	assert!(jobs.snapshot().is_empty());
}

#[tokio::test]
async fn job_listing_filters_and_pages() {
	let (service, _) = offline_service("http://127.0.0.1:9/cwe/");

	for version in ["4.14", "4.15", "4.16"] {
		service
			.trigger_update(
				KnowledgeBase::Cwe,
				&UpdateRequest { version: version.to_string(), ..Default::default() },
			)
			.await
			.expect("Failed to trigger update.");
	}

	service
		.trigger_processor(ProcessorMode::CweCapec, &ProcessorRequest::default())
		.await
		.expect("Failed to trigger processor.");

	let page = service
		.list_jobs(&JobListFilter {
			job_type: Some(JobType::CweUpdate),
			state: None,
			page: PageRequest { page: Some(1), page_size: Some(2) },
		})
		.await
		.expect("Failed to list jobs.");
	let body = serde_json::to_value(&page).expect("Failed to serialize page.");

	assert_eq!(body["total_results_count"], 3);
	assert_eq!(body["page_results_count"], 2);
	assert_eq!(body["jobs"][0]["type"], "cwe-update");
}

#[tokio::test]
async fn available_versions_come_from_the_distribution_root() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/cwe/version.txt"))
		.respond_with(ResponseTemplate::new(200).set_body_string("4.15\n4.16\n"))
		.mount(&server)
		.await;

	let (service, _) = offline_service(&format!("{}/cwe/", server.uri()));
	let versions =
		service.available_versions(KnowledgeBase::Cwe).await.expect("Failed to read versions.");

	assert_eq!(versions, vec!["4.15", "4.16"]);
}

#[tokio::test]
async fn distribution_failures_surface_as_upstream_errors() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/cwe/version.txt"))
		.respond_with(ResponseTemplate::new(503))
		.expect(1)
		.mount(&server)
		.await;

	let (service, _) = offline_service(&format!("{}/cwe/", server.uri()));
	let err = service
		.available_versions(KnowledgeBase::Cwe)
		.await
		.expect_err("Expected the fetch to fail.");

	assert_eq!(err.code(), 502);
}

fn attack_pattern(id: &str, external_id: &str, name: &str, extra: Value) -> Value {
	let mut object = json!({
		"type": "attack-pattern",
		"id": id,
		"name": name,
		"description": format!("{name} description"),
		"created": "2020-01-01T00:00:00.000Z",
		"modified": "2024-01-01T00:00:00.000Z",
		"external_references": [{ "source_name": "mitre-attack", "external_id": external_id }]
	});

	if let (Some(object), Value::Object(extra)) = (object.as_object_mut(), extra) {
		object.extend(extra);
	}

	object
}

fn relationship(id: &str, kind: &str, source: &str, target: &str) -> Value {
	json!({
		"type": "relationship",
		"id": id,
		"relationship_type": kind,
		"source_ref": source,
		"target_ref": target,
		"created": "2020-01-01T00:00:00.000Z",
		"modified": "2024-01-01T00:00:00.000Z"
	})
}

const SMB: &str = "attack-pattern--0a5231ec-41af-4a35-83d0-6bdf11f28c65";
const REMOTE: &str = "attack-pattern--54a649ff-439a-41a4-9856-8d144a2551ba";
const OLD: &str = "attack-pattern--11111111-1111-4111-8111-111111111111";
const GONE: &str = "attack-pattern--22222222-2222-4222-8222-222222222222";
const MITIGATION: &str = "course-of-action--33333333-3333-4333-8333-333333333333";
const IDENTITY: &str = "identity--44444444-4444-4444-8444-444444444444";

fn attack_bundle() -> Vec<Value> {
	vec![
		attack_pattern(
			SMB,
			"T1021.005",
			"VNC",
			json!({ "x_mitre_is_subtechnique": true, "created_by_ref": IDENTITY }),
		),
		attack_pattern(REMOTE, "T1021", "Remote Services", json!({})),
		attack_pattern(OLD, "T1000", "Deprecated Technique", json!({ "x_mitre_deprecated": true })),
		attack_pattern(GONE, "T1001", "Revoked Technique", json!({ "revoked": true })),
		json!({
			"type": "course-of-action",
			"id": MITIGATION,
			"name": "Limit Access",
			"created": "2020-01-01T00:00:00.000Z",
			"modified": "2024-01-01T00:00:00.000Z",
			"external_references": [{ "source_name": "mitre-attack", "external_id": "M1035" }]
		}),
		json!({
			"type": "identity",
			"id": IDENTITY,
			"name": "The MITRE Corporation",
			"created": "2017-06-01T00:00:00.000Z",
			"modified": "2017-06-01T00:00:00.000Z"
		}),
		relationship("relationship--aaaaaaaa-0000-4000-8000-000000000001", "subtechnique-of", SMB, REMOTE),
		relationship("relationship--aaaaaaaa-0000-4000-8000-000000000002", "mitigates", MITIGATION, SMB),
	]
}

async fn seeded_service(test_db: &TestDatabase) -> KbService {
	let cfg = config(test_db.dsn(), "http://127.0.0.1:9/cwe/");
	let db = Db::connect(&cfg.storage.postgres).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	let note = VersionTag::parse("16_0").map(|tag| tag.ingestion_note()).unwrap_or_default();
	let prepared = threatkb_domain::stix::prepare_objects(&attack_bundle(), Default::default());

	db.write_objects(KnowledgeBase::AttackEnterprise.collection(), &note, &prepared)
		.await
		.expect("Failed to write bundle.");

	let distribution =
		Arc::new(HttpDistribution::new(&cfg.distribution).expect("Failed to build distribution."));
	let jobs = Arc::new(db.clone());

	KbService::new(cfg, db, distribution, jobs)
}

fn ids(page: &threatkb_service::Page<Value>) -> Vec<String> {
	let mut ids: Vec<String> = page
		.results
		.iter()
		.filter_map(|object| object["id"].as_str().map(str::to_string))
		.collect();

	ids.sort();

	ids
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set THREATKB_PG_DSN to run."]
async fn default_filters_hide_revoked_and_deprecated() {
	let Some(base_dsn) = threatkb_testkit::env_dsn() else {
		eprintln!("Skipping default_filters_hide_revoked_and_deprecated; set THREATKB_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let service = seeded_service(&test_db).await;
	let filter = ObjectFilter { types: vec!["attack-pattern".to_string()], ..Default::default() };
	let defaults = service
		.list_objects(KnowledgeBase::AttackEnterprise, &filter)
		.await
		.expect("Failed to list objects.");
	let everything = service
		.list_objects(
			KnowledgeBase::AttackEnterprise,
			&ObjectFilter { include_revoked: true, include_deprecated: true, ..filter },
		)
		.await
		.expect("Failed to list objects.");

	assert_eq!(defaults.total_results_count, 2);
	assert_eq!(everything.total_results_count, 4);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set THREATKB_PG_DSN to run."]
async fn domain_and_semantic_ids_find_the_same_object() {
	let Some(base_dsn) = threatkb_testkit::env_dsn() else {
		eprintln!("Skipping domain_and_semantic_ids_find_the_same_object; set THREATKB_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let service = seeded_service(&test_db).await;
	let kb = KnowledgeBase::AttackEnterprise;
	let by_domain = service
		.get_object(kb, "T1021.005", &ObjectLookup::default(), PageRequest::default())
		.await
		.expect("Failed to get object.");
	let by_semantic = service
		.get_object(
			kb,
			SMB,
			&ObjectLookup { version: Some("16.0".to_string()), ..Default::default() },
			PageRequest::default(),
		)
		.await
		.expect("Failed to get object.");

	assert_eq!(by_domain.total_results_count, 1);
	assert_eq!(by_domain.results, by_semantic.results);

	let history = service.object_history(kb, "T1021.005").await.expect("Failed to read history.");

	assert_eq!(history.len(), 1);
	assert_eq!(history[0].versions, vec!["16.0"]);

	let versions = service.object_versions(kb).await.expect("Failed to read versions.");

	assert_eq!(versions.latest.as_deref(), Some("16.0"));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set THREATKB_PG_DSN to run."]
async fn undirected_relationships_cover_both_directions() {
	let Some(base_dsn) = threatkb_testkit::env_dsn() else {
		eprintln!("Skipping undirected_relationships_cover_both_directions; set THREATKB_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let service = seeded_service(&test_db).await;
	let kb = KnowledgeBase::AttackEnterprise;
	let lookup = ObjectLookup::default();
	let either = service
		.object_relationships(kb, "T1021.005", &lookup, &RelationshipFilter::default())
		.await
		.expect("Failed to list relationships.");
	let mut union = Vec::new();

	for direction in [Direction::SourceRef, Direction::TargetRef] {
		let filter =
			RelationshipFilter { relationship_direction: Some(direction), ..Default::default() };
		let page = service
			.object_relationships(kb, "T1021.005", &lookup, &filter)
			.await
			.expect("Failed to list relationships.");

		union.extend(ids(&page));
	}

	let either_ids = ids(&either);

	assert!(union.iter().all(|id| either_ids.contains(id)));
	assert_eq!(either.container, "relationships");

	let authored_only = service
		.object_relationships(
			kb,
			"T1021.005",
			&lookup,
			&RelationshipFilter { include_embedded_refs: false, ..Default::default() },
		)
		.await
		.expect("Failed to list relationships.");

	assert_eq!(authored_only.total_results_count, 2);
	assert!(either.total_results_count > authored_only.total_results_count);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set THREATKB_PG_DSN to run."]
async fn bundles_close_over_one_hop() {
	let Some(base_dsn) = threatkb_testkit::env_dsn() else {
		eprintln!("Skipping bundles_close_over_one_hop; set THREATKB_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let service = seeded_service(&test_db).await;
	let kb = KnowledgeBase::AttackEnterprise;
	let bundle = service
		.object_bundle(kb, "T1021.005", &ObjectLookup::default(), &BundleFilter::default())
		.await
		.expect("Failed to assemble bundle.");
	let bundle_ids = ids(&bundle);

	for expected in [SMB, REMOTE, MITIGATION, IDENTITY] {
		assert!(bundle_ids.contains(&expected.to_string()), "Missing {expected}.");
	}

	let mut deduped = bundle_ids.clone();

	deduped.dedup();

	assert_eq!(deduped, bundle_ids);
	assert!(!bundle.results.iter().any(|object| object["id"] == OLD));

	let missing = service
		.object_bundle(kb, "T9999", &ObjectLookup::default(), &BundleFilter::default())
		.await;

	assert_eq!(missing.map_err(|err| err.code()).err(), Some(404));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set THREATKB_PG_DSN to run."]
async fn search_tags_knowledge_bases_on_request() {
	let Some(base_dsn) = threatkb_testkit::env_dsn() else {
		eprintln!("Skipping search_tags_knowledge_bases_on_request; set THREATKB_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let service = seeded_service(&test_db).await;
	let page = service
		.search(&SearchFilter {
			text: Some("remote".to_string()),
			show_knowledgebase: true,
			..Default::default()
		})
		.await
		.expect("Failed to search.");

	assert_eq!(ids(&page), vec![REMOTE.to_string()]);
	assert_eq!(page.results[0]["knowledgebase_name"], "attack-enterprise");

	let elsewhere = service
		.search(&SearchFilter {
			text: Some("remote".to_string()),
			knowledge_bases: vec!["cwe".to_string()],
			..Default::default()
		})
		.await
		.expect("Failed to search.");

	assert_eq!(elsewhere.total_results_count, 0);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
