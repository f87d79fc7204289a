//! Edges touching a seed set, collapsed to one copy per relationship id.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use threatkb_domain::{KnowledgeBase, stix::RELATIONSHIP_TYPE};
use threatkb_storage::{
	models::StixRecord,
	query::{self, Column, Distinct, Flag, ObjectQuery, Predicate, Sort},
};

use crate::{
	KbService, Result,
	objects::ObjectLookup,
	page::{Page, PageRequest, PageWindow},
};

pub const RELATIONSHIPS_CONTAINER: &str = "relationships";

/// Which endpoint of an edge must be a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	SourceRef,
	TargetRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelationshipFilter {
	/// `None` matches edges in either direction.
	pub relationship_direction: Option<Direction>,
	/// Case-insensitive substring of `relationship_type`.
	pub relationship_type: Option<String>,
	pub source_ref: Vec<String>,
	pub target_ref: Vec<String>,
	pub source_ref_type: Vec<String>,
	pub target_ref_type: Vec<String>,
	pub include_embedded_refs: bool,
	#[serde(flatten)]
	pub page: PageRequest,
}
impl Default for RelationshipFilter {
	fn default() -> Self {
		Self {
			relationship_direction: None,
			relationship_type: None,
			source_ref: Vec::new(),
			target_ref: Vec::new(),
			source_ref_type: Vec::new(),
			target_ref_type: Vec::new(),
			include_embedded_refs: true,
			page: PageRequest::default(),
		}
	}
}
impl RelationshipFilter {
	/// Edge predicate for `seeds`. Scans every collection: derived edges may live in another
	/// knowledge base than their endpoints.
	pub fn predicate(&self, seeds: &[Uuid]) -> Predicate {
		let endpoint = match self.relationship_direction {
			Some(Direction::SourceRef) => Predicate::InKeys(Column::SourceKey, seeds.to_vec()),
			Some(Direction::TargetRef) => Predicate::InKeys(Column::TargetKey, seeds.to_vec()),
			None => Predicate::or([
				Predicate::InKeys(Column::SourceKey, seeds.to_vec()),
				Predicate::InKeys(Column::TargetKey, seeds.to_vec()),
			]),
		};
		let mut parts = vec![Predicate::text_eq(Column::StixType, RELATIONSHIP_TYPE), endpoint];

		if let Some(kind) =
			self.relationship_type.as_deref().map(str::trim).filter(|kind| !kind.is_empty())
		{
			parts.push(Predicate::Contains(Column::RelationshipType, kind.to_string()));
		}
		if !self.source_ref.is_empty() {
			parts.push(Predicate::InText(Column::SourceRef, trimmed(&self.source_ref)));
		}
		if !self.target_ref.is_empty() {
			parts.push(Predicate::InText(Column::TargetRef, trimmed(&self.target_ref)));
		}
		if !self.source_ref_type.is_empty() {
			parts.push(Predicate::RefTypeIn(Column::SourceRef, trimmed(&self.source_ref_type)));
		}
		if !self.target_ref_type.is_empty() {
			parts.push(Predicate::RefTypeIn(Column::TargetRef, trimmed(&self.target_ref_type)));
		}
		if !self.include_embedded_refs {
			parts.push(Predicate::Flag(Flag::IsEmbedded).negate());
		}

		Predicate::and(parts)
	}
}

impl KbService {
	pub async fn object_relationships(
		&self,
		kb: KnowledgeBase,
		id: &str,
		lookup: &ObjectLookup,
		filter: &RelationshipFilter,
	) -> Result<Page<Value>> {
		let window = PageWindow::resolve(filter.page, &self.cfg.query)?;
		let seeds = self.resolve_seeds(kb, id, lookup).await?;
		let query = edge_query(&seeds, filter).window(window.window());
		let (rows, total) = query::fetch_page(&self.db.pool, &query).await?;

		Ok(Page::new(
			window,
			total,
			RELATIONSHIPS_CONTAINER,
			rows.into_iter().map(|row| row.data).collect(),
		))
	}

	/// Every freshest edge touching `seeds`, unpaged.
	pub(crate) async fn expand(
		&self,
		seeds: &[StixRecord],
		filter: &RelationshipFilter,
	) -> Result<Vec<StixRecord>> {
		Ok(query::fetch_all(&self.db.pool, &edge_query(seeds, filter)).await?)
	}
}

fn edge_query(seeds: &[StixRecord], filter: &RelationshipFilter) -> ObjectQuery {
	let keys: Vec<Uuid> = seeds.iter().map(|seed| seed.storage_key).collect();

	ObjectQuery::new(filter.predicate(&keys))
		.distinct(Distinct::FreshestPerSemanticId)
		.sorted(Sort::asc(Column::SemanticId))
}

fn trimmed(values: &[String]) -> Vec<String> {
	values.iter().map(|value| value.trim().to_string()).filter(|value| !value.is_empty()).collect()
}
