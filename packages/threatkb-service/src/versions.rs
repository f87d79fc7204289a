//! Version resolution for knowledge-base collections.
//!
//! The newest version of a collection is cached per collection and keyed by the collection's
//! store revision, so a completed write is visible on the next call.

use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use time::OffsetDateTime;

use threatkb_domain::{KnowledgeBase, ParsedId, VersionTag, version};
use threatkb_storage::{
	db::Db,
	models::HistoryEntry,
	objects,
	query::{Column, Flag, Predicate},
};

use crate::{BoxFuture, Error, Result};

/// Read access the resolver needs from the store.
pub trait VersionSource: Send + Sync {
	/// The collection's revision counter; changes on every write.
	fn revision<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<i64>>;

	/// Distinct ingestion notes present in the collection.
	fn notes<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

	/// Every stored copy of `id` in the knowledge base's collection. Domain ids match any external
	/// reference under the knowledge base's reference source.
	fn history<'a>(
		&'a self,
		kb: KnowledgeBase,
		id: &'a ParsedId,
	) -> BoxFuture<'a, Result<Vec<HistoryEntry>>>;
}
impl VersionSource for Db {
	fn revision<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<i64>> {
		Box::pin(async move { Ok(objects::collection_revision(&self.pool, collection).await?) })
	}

	fn notes<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
		Box::pin(async move { Ok(objects::version_notes(&self.pool, collection).await?) })
	}

	fn history<'a>(
		&'a self,
		kb: KnowledgeBase,
		id: &'a ParsedId,
	) -> BoxFuture<'a, Result<Vec<HistoryEntry>>> {
		Box::pin(async move {
			Ok(objects::object_history(&self.pool, kb.collection(), id, kb.reference_source())
				.await?)
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Versions {
	pub latest: Option<String>,
	pub versions: Vec<String>,
}

/// The versions in which one snapshot (`modified`) of an object appeared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryGroup {
	#[serde(with = "threatkb_domain::time_serde::option")]
	pub modified: Option<OffsetDateTime>,
	pub versions: Vec<String>,
}

#[derive(Debug, Clone)]
struct CachedLatest {
	revision: i64,
	latest: Option<VersionTag>,
}

pub struct VersionResolver {
	source: Arc<dyn VersionSource>,
	cache: Mutex<HashMap<String, CachedLatest>>,
}
impl VersionResolver {
	pub fn new(source: Arc<dyn VersionSource>) -> Self {
		Self { source, cache: Mutex::new(HashMap::new()) }
	}

	/// The naturally newest version present in `collection`.
	pub async fn latest(&self, collection: &str) -> Result<Option<VersionTag>> {
		let revision = self.source.revision(collection).await?;

		if let Some(hit) = self.cached(collection, revision) {
			return Ok(hit);
		}

		let notes = self.source.notes(collection).await?;
		let latest = version::newest_tag(&notes);

		tracing::debug!(
			collection,
			revision,
			latest = latest.as_ref().map(VersionTag::as_str),
			"Refreshed latest version cache."
		);

		self.cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(collection.to_string(), CachedLatest { revision, latest: latest.clone() });

		Ok(latest)
	}

	/// Every ingested version of `collection`, newest first, plus the newest one.
	pub async fn versions(&self, collection: &str) -> Result<Versions> {
		let notes = self.source.notes(collection).await?;
		let latest = self.latest(collection).await?;

		Ok(Versions {
			latest: latest.as_ref().map(VersionTag::display),
			versions: version::sort_notes_descending(&notes),
		})
	}

	/// Groups the stored copies of one object by `modified`, newest snapshot first.
	pub async fn object_history(&self, kb: KnowledgeBase, id: &ParsedId) -> Result<Vec<HistoryGroup>> {
		let entries = self.source.history(kb, id).await?;

		Ok(group_history(entries))
	}

	fn cached(&self, collection: &str, revision: i64) -> Option<Option<VersionTag>> {
		let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

		cache
			.get(collection)
			.filter(|entry| entry.revision == revision)
			.map(|entry| entry.latest.clone())
	}
}

/// Predicate selecting the records visible under `requested`: the matching ingestion note when a
/// version is pinned, the `is_latest` flag otherwise.
pub fn resolve(requested: Option<&str>) -> Result<Predicate> {
	let Some(raw) = requested else {
		return Ok(Predicate::Flag(Flag::IsLatest));
	};
	let tag = VersionTag::parse(raw)
		.ok_or_else(|| Error::validation(format!("Version {raw:?} is not a valid version.")))?;

	Ok(Predicate::text_eq(Column::IngestionNote, tag.ingestion_note()))
}

fn group_history(entries: Vec<HistoryEntry>) -> Vec<HistoryGroup> {
	let mut grouped: BTreeMap<Option<OffsetDateTime>, Vec<String>> = BTreeMap::new();

	for entry in entries {
		grouped.entry(entry.modified).or_default().push(entry.ingestion_note);
	}

	grouped
		.into_iter()
		.rev()
		.map(|(modified, notes)| HistoryGroup {
			modified,
			versions: version::sort_notes_descending(&notes),
		})
		.collect()
}
