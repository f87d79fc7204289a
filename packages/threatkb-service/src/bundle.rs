//! One-hop bundles: the seeds, every edge touching them, the edges' endpoints and the shared
//! baseline objects.

use std::{
	cmp::Ordering,
	collections::{BTreeMap, BTreeSet},
	sync::{Mutex, PoisonError},
};

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use threatkb_domain::{KnowledgeBase, stix::RELATIONSHIP_TYPE};
use threatkb_storage::{
	models::StixRecord,
	objects,
	query::{self, Column, Distinct, Flag, ObjectQuery, Predicate, Sort},
};

use crate::{
	KbService, Result,
	objects::{OBJECTS_CONTAINER, ObjectLookup},
	page::{Page, PageRequest, PageWindow},
	relationships::RelationshipFilter,
};

/// Types shared by every knowledge base and attached to each bundle.
pub const BASELINE_TYPES: [&str; 3] = ["identity", "marking-definition", "extension-definition"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleFilter {
	/// Follow embedded-reference edges while expanding.
	pub include_embedded_refs: bool,
	/// Return embedded-reference edges themselves.
	pub include_embedded_sros: bool,
	pub types: Vec<String>,
	#[serde(flatten)]
	pub page: PageRequest,
}
impl Default for BundleFilter {
	fn default() -> Self {
		Self {
			include_embedded_refs: true,
			include_embedded_sros: false,
			types: Vec::new(),
			page: PageRequest::default(),
		}
	}
}

/// Baseline records cached against the global store revision.
#[derive(Default)]
pub struct BaselineCache {
	entry: Mutex<Option<(i64, Vec<StixRecord>)>>,
}
impl BaselineCache {
	pub fn get(&self, revision: i64) -> Option<Vec<StixRecord>> {
		let entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);

		entry.as_ref().filter(|(cached, _)| *cached == revision).map(|(_, records)| records.clone())
	}

	pub fn store(&self, revision: i64, records: Vec<StixRecord>) {
		*self.entry.lock().unwrap_or_else(PoisonError::into_inner) = Some((revision, records));
	}
}

impl KbService {
	pub async fn object_bundle(
		&self,
		kb: KnowledgeBase,
		id: &str,
		lookup: &ObjectLookup,
		filter: &BundleFilter,
	) -> Result<Page<Value>> {
		let window = PageWindow::resolve(filter.page, &self.cfg.query)?;
		let seeds = self.resolve_seeds(kb, id, lookup).await?;
		let expansion = RelationshipFilter {
			include_embedded_refs: filter.include_embedded_refs,
			..Default::default()
		};
		let edges = self.expand(&seeds, &expansion).await?;
		let mut keys: BTreeSet<Uuid> = seeds.iter().map(|seed| seed.storage_key).collect();

		for edge in &edges {
			keys.extend(edge.source_key);
			keys.extend(edge.target_key);
		}

		let query = ObjectQuery::new(Predicate::InKeys(Column::StorageKey, keys.into_iter().collect()));
		let mut nodes = query::fetch_all(&self.db.pool, &query).await?;

		nodes.extend(self.baseline().await?);

		let items = assemble(nodes, edges, &filter.types, filter.include_embedded_sros);
		let total = i64::try_from(items.len()).unwrap_or(i64::MAX);

		tracing::debug!(knowledge_base = %kb, id, total, "Assembled bundle.");

		Ok(Page::new(
			window,
			total,
			OBJECTS_CONTAINER,
			window.slice(items).into_iter().map(|record| record.data).collect(),
		))
	}

	async fn baseline(&self) -> Result<Vec<StixRecord>> {
		let revision = objects::global_revision(&self.db.pool).await?;

		if let Some(records) = self.baseline.get(revision) {
			return Ok(records);
		}

		let query = ObjectQuery::new(baseline_predicate(&self.cfg.bundle.baseline_deny_ids))
			.distinct(Distinct::FreshestPerSemanticId)
			.sorted(Sort::asc(Column::SemanticId));
		let records = query::fetch_all(&self.db.pool, &query).await?;

		tracing::debug!(revision, count = records.len(), "Refreshed bundle baseline cache.");

		self.baseline.store(revision, records.clone());

		Ok(records)
	}
}

/// Latest shared identities, markings and extensions, minus `deny_ids`.
pub(crate) fn baseline_predicate(deny_ids: &[String]) -> Predicate {
	let mut parts = vec![
		Predicate::InText(Column::StixType, BASELINE_TYPES.iter().map(|kind| kind.to_string()).collect()),
		Predicate::Flag(Flag::IsLatest),
	];

	if !deny_ids.is_empty() {
		parts.push(Predicate::InText(Column::SemanticId, deny_ids.to_vec()).negate());
	}

	Predicate::and(parts)
}

/// Orders the bundle as objects then relationships, each by semantic id, with one freshest
/// record per semantic id. `types` narrows the objects; embedded edges are dropped unless
/// `include_embedded_sros`.
pub fn assemble(
	nodes: Vec<StixRecord>,
	edges: Vec<StixRecord>,
	types: &[String],
	include_embedded_sros: bool,
) -> Vec<StixRecord> {
	let nodes = nodes
		.into_iter()
		.filter(|node| types.is_empty() || types.iter().any(|kind| kind.trim() == node.stix_type));
	let edges = edges.into_iter().filter(|edge| include_embedded_sros || !edge.is_embedded);
	let mut items = dedup_freshest(nodes.chain(edges));

	items.sort_by(|a, b| {
		let a_edge = a.stix_type == RELATIONSHIP_TYPE;
		let b_edge = b.stix_type == RELATIONSHIP_TYPE;

		a_edge.cmp(&b_edge).then_with(|| a.semantic_id.cmp(&b.semantic_id))
	});

	items
}

/// Keeps one record per semantic id: newest `modified`, then newest record modification, then
/// highest ingestion sequence, then highest storage key.
pub fn dedup_freshest(records: impl IntoIterator<Item = StixRecord>) -> Vec<StixRecord> {
	let mut freshest: BTreeMap<String, StixRecord> = BTreeMap::new();

	for record in records {
		match freshest.get(&record.semantic_id) {
			Some(current) if freshness(current, &record) != Ordering::Less => {},
			_ => {
				freshest.insert(record.semantic_id.clone(), record);
			},
		}
	}

	freshest.into_values().collect()
}

fn freshness(a: &StixRecord, b: &StixRecord) -> Ordering {
	a.modified
		.cmp(&b.modified)
		.then_with(|| a.record_modified.cmp(&b.record_modified))
		.then_with(|| a.ingestion_seq.cmp(&b.ingestion_seq))
		.then_with(|| a.storage_key.cmp(&b.storage_key))
}
