use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::{PgConnection, PgExecutor, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use threatkb_domain::{ParsedId, stix::IngestObject, version};

use crate::{
	BoxFuture, Result,
	db::Db,
	models::HistoryEntry,
	query::{self, Column, Predicate},
};

/// Namespace of record storage keys.
pub const STORAGE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x9c1f_6e04_3b7a_4d2e_8f51_a0c7_d9e2_4b36);

const INSERT_CHUNK: usize = 1_000;

/// Outcome of one write run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
	pub written: u64,
	pub ingestion_seq: i64,
	pub revision: i64,
}

/// Write and read access the ingestion pipeline needs from the object store.
pub trait ObjectStore: Send + Sync {
	fn write_objects<'a>(
		&'a self,
		collection: &'a str,
		ingestion_note: &'a str,
		objects: &'a [IngestObject],
	) -> BoxFuture<'a, Result<WriteReport>>;

	/// Bodies of every `is_latest` record in `collection`.
	fn latest_objects<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<Vec<Value>>>;

	/// The ingestion note of the naturally newest version present in `collection`.
	fn latest_version_note<'a>(&'a self, collection: &'a str)
	-> BoxFuture<'a, Result<Option<String>>>;
}
impl ObjectStore for Db {
	fn write_objects<'a>(
		&'a self,
		collection: &'a str,
		ingestion_note: &'a str,
		objects: &'a [IngestObject],
	) -> BoxFuture<'a, Result<WriteReport>> {
		Box::pin(write_objects(self, collection, ingestion_note, objects))
	}

	fn latest_objects<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<Vec<Value>>> {
		Box::pin(async move {
			let rows: Vec<(Value,)> = sqlx::query_as(
				"SELECT data FROM stix_objects WHERE collection = $1 AND is_latest ORDER BY semantic_id",
			)
			.bind(collection)
			.fetch_all(&self.pool)
			.await?;

			Ok(rows.into_iter().map(|(data,)| data).collect())
		})
	}

	fn latest_version_note<'a>(
		&'a self,
		collection: &'a str,
	) -> BoxFuture<'a, Result<Option<String>>> {
		Box::pin(async move {
			let notes = version_notes(&self.pool, collection).await?;

			Ok(version::newest_tag(&notes).map(|tag| tag.ingestion_note()))
		})
	}
}

/// Storage key of one record: stable for the same object body written under the same note.
pub fn storage_key(
	collection: &str,
	semantic_id: &str,
	modified: Option<OffsetDateTime>,
	ingestion_note: &str,
) -> Uuid {
	let modified = modified.map(|value| value.unix_timestamp_nanos().to_string()).unwrap_or_default();
	let name = format!("{collection}|{semantic_id}|{modified}|{ingestion_note}");

	Uuid::new_v5(&STORAGE_KEY_NAMESPACE, name.as_bytes())
}

/// Writes one ingestion run in a single transaction.
///
/// Under a per-collection advisory lock the run draws a fresh ingestion sequence, upserts every
/// record, recomputes `is_latest` for the touched semantic ids (newest `modified`, then highest
/// sequence), resolves relationship endpoints to storage keys and bumps the collection revision.
pub async fn write_objects(
	db: &Db,
	collection: &str,
	ingestion_note: &str,
	objects: &[IngestObject],
) -> Result<WriteReport> {
	let mut tx = db.pool.begin().await?;

	sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
		.bind(collection)
		.execute(&mut *tx)
		.await?;

	let ingestion_seq: i64 =
		sqlx::query_scalar("SELECT nextval('stix_ingestion_seq')").fetch_one(&mut *tx).await?;
	// One statement must not upsert the same key twice.
	let mut by_key = BTreeMap::new();

	for object in objects {
		let key = storage_key(
			collection,
			&object.fields.semantic_id,
			object.fields.modified,
			ingestion_note,
		);

		by_key.insert(key, object);
	}

	let rows: Vec<(Uuid, &IngestObject)> = by_key.into_iter().collect();
	let mut written = 0_u64;

	for chunk in rows.chunks(INSERT_CHUNK) {
		written += insert_chunk(&mut tx, collection, ingestion_note, ingestion_seq, chunk).await?;
	}

	let mut semantic_ids: Vec<String> =
		rows.iter().map(|(_, object)| object.fields.semantic_id.clone()).collect();

	semantic_ids.sort_unstable();
	semantic_ids.dedup();

	recompute_latest(&mut tx, collection, &semantic_ids).await?;
	resolve_endpoints(&mut tx, collection, ingestion_seq).await?;

	let revision = bump_revision(&mut *tx, collection).await?;

	tx.commit().await?;

	tracing::info!(
		collection,
		ingestion_note,
		ingestion_seq,
		revision,
		written,
		"Wrote ingestion run."
	);

	Ok(WriteReport { written, ingestion_seq, revision })
}

async fn insert_chunk(
	conn: &mut PgConnection,
	collection: &str,
	ingestion_note: &str,
	ingestion_seq: i64,
	chunk: &[(Uuid, &IngestObject)],
) -> Result<u64> {
	let mut builder = QueryBuilder::<Postgres>::new(
		"\
INSERT INTO stix_objects (
	storage_key,
	collection,
	semantic_id,
	stix_type,
	external_id,
	name,
	description,
	modified,
	created,
	revoked,
	deprecated,
	ingestion_note,
	ingestion_seq,
	is_embedded,
	relationship_type,
	source_ref,
	target_ref,
	data
) ",
	);

	builder.push_values(chunk, |mut b, (key, object)| {
		let fields = &object.fields;

		b.push_bind(*key)
			.push_bind(collection)
			.push_bind(fields.semantic_id.as_str())
			.push_bind(fields.stix_type.as_str())
			.push_bind(fields.external_id.as_deref())
			.push_bind(fields.name.as_deref())
			.push_bind(fields.description.as_deref())
			.push_bind(fields.modified)
			.push_bind(fields.created)
			.push_bind(fields.revoked)
			.push_bind(fields.deprecated)
			.push_bind(ingestion_note)
			.push_bind(ingestion_seq)
			.push_bind(object.is_embedded)
			.push_bind(fields.relationship_type.as_deref())
			.push_bind(fields.source_ref.as_deref())
			.push_bind(fields.target_ref.as_deref())
			.push_bind(&object.data);
	});
	builder.push(
		" \
ON CONFLICT (storage_key) DO UPDATE
SET
	stix_type = EXCLUDED.stix_type,
	external_id = EXCLUDED.external_id,
	name = EXCLUDED.name,
	description = EXCLUDED.description,
	created = EXCLUDED.created,
	revoked = EXCLUDED.revoked,
	deprecated = EXCLUDED.deprecated,
	ingestion_seq = EXCLUDED.ingestion_seq,
	is_embedded = EXCLUDED.is_embedded,
	relationship_type = EXCLUDED.relationship_type,
	source_ref = EXCLUDED.source_ref,
	target_ref = EXCLUDED.target_ref,
	data = EXCLUDED.data,
	record_modified = now()",
	);

	let result = builder.build().execute(&mut *conn).await?;

	Ok(result.rows_affected())
}

async fn recompute_latest(
	conn: &mut PgConnection,
	collection: &str,
	semantic_ids: &[String],
) -> Result<()> {
	// Clear first so the partial unique index never sees two latest rows.
	sqlx::query(
		"\
UPDATE stix_objects
SET is_latest = FALSE
WHERE collection = $1 AND semantic_id = ANY($2) AND is_latest",
	)
	.bind(collection)
	.bind(semantic_ids)
	.execute(&mut *conn)
	.await?;
	sqlx::query(
		"\
UPDATE stix_objects AS target
SET is_latest = TRUE
FROM (
	SELECT DISTINCT ON (semantic_id) storage_key
	FROM stix_objects
	WHERE collection = $1 AND semantic_id = ANY($2)
	ORDER BY semantic_id, modified DESC NULLS LAST, ingestion_seq DESC, storage_key DESC
) AS winner
WHERE target.storage_key = winner.storage_key",
	)
	.bind(collection)
	.bind(semantic_ids)
	.execute(&mut *conn)
	.await?;

	Ok(())
}

/// Endpoints prefer a record from the same collection and note, then the latest record anywhere.
async fn resolve_endpoints(conn: &mut PgConnection, collection: &str, ingestion_seq: i64) -> Result<()> {
	sqlx::query(
		"\
UPDATE stix_objects AS rel
SET
	source_key = (
		SELECT endpoint.storage_key
		FROM stix_objects AS endpoint
		WHERE endpoint.semantic_id = rel.source_ref
		ORDER BY
			(endpoint.collection = rel.collection AND endpoint.ingestion_note = rel.ingestion_note) DESC,
			endpoint.is_latest DESC,
			endpoint.ingestion_seq DESC
		LIMIT 1
	),
	target_key = (
		SELECT endpoint.storage_key
		FROM stix_objects AS endpoint
		WHERE endpoint.semantic_id = rel.target_ref
		ORDER BY
			(endpoint.collection = rel.collection AND endpoint.ingestion_note = rel.ingestion_note) DESC,
			endpoint.is_latest DESC,
			endpoint.ingestion_seq DESC
		LIMIT 1
	)
WHERE rel.collection = $1 AND rel.ingestion_seq = $2 AND rel.stix_type = 'relationship'",
	)
	.bind(collection)
	.bind(ingestion_seq)
	.execute(&mut *conn)
	.await?;

	Ok(())
}

async fn bump_revision<'e, E>(executor: E, collection: &str) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let revision = sqlx::query_scalar(
		"\
INSERT INTO store_revisions (collection, revision, updated_at)
VALUES ($1, 1, now())
ON CONFLICT (collection) DO UPDATE
SET revision = store_revisions.revision + 1, updated_at = now()
RETURNING revision",
	)
	.bind(collection)
	.fetch_one(executor)
	.await?;

	Ok(revision)
}

/// Revision counter of one collection; zero before its first write.
pub async fn collection_revision<'e, E>(executor: E, collection: &str) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let revision: Option<i64> =
		sqlx::query_scalar("SELECT revision FROM store_revisions WHERE collection = $1")
			.bind(collection)
			.fetch_optional(executor)
			.await?;

	Ok(revision.unwrap_or(0))
}

/// Sum of every collection revision; changes whenever any collection is written.
pub async fn global_revision<'e, E>(executor: E) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let revision: i64 =
		sqlx::query_scalar("SELECT COALESCE(SUM(revision), 0)::bigint FROM store_revisions")
			.fetch_one(executor)
			.await?;

	Ok(revision)
}

pub async fn version_notes<'e, E>(executor: E, collection: &str) -> Result<Vec<String>>
where
	E: PgExecutor<'e>,
{
	let notes = sqlx::query_scalar(
		"SELECT DISTINCT ingestion_note FROM stix_objects WHERE collection = $1 ORDER BY ingestion_note",
	)
	.bind(collection)
	.fetch_all(executor)
	.await?;

	Ok(notes)
}

/// Every `(modified, note)` pair stored for one object, oldest `modified` first. A domain id
/// matches any external reference published by `reference_source`, not only the first one.
pub async fn object_history<'e, E>(
	executor: E,
	collection: &str,
	id: &ParsedId,
	reference_source: &str,
) -> Result<Vec<HistoryEntry>>
where
	E: PgExecutor<'e>,
{
	let entries = history_builder(collection, id, reference_source)
		.build_query_as::<HistoryEntry>()
		.fetch_all(executor)
		.await?;

	Ok(entries)
}

fn history_builder(
	collection: &str,
	id: &ParsedId,
	reference_source: &str,
) -> QueryBuilder<'static, Postgres> {
	let matcher = match id {
		ParsedId::DomainId(value) => Predicate::ExternalReference {
			source_name: reference_source.to_string(),
			external_id: value.clone(),
		},
		ParsedId::SemanticId(value) => Predicate::text_eq(Column::SemanticId, value.clone()),
	};
	let predicate = Predicate::and([Predicate::text_eq(Column::Collection, collection), matcher]);
	let mut builder =
		QueryBuilder::new("SELECT DISTINCT modified, ingestion_note FROM stix_objects WHERE ");

	query::push_predicate(&mut builder, &predicate);
	builder.push(" ORDER BY modified ASC NULLS FIRST, ingestion_note ASC");

	builder
}

/// Deletes every record of `collection` and bumps its revision. Returns the deleted count.
pub async fn truncate(db: &Db, collection: &str) -> Result<u64> {
	let mut tx = db.pool.begin().await?;

	sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
		.bind(collection)
		.execute(&mut *tx)
		.await?;

	let deleted = sqlx::query("DELETE FROM stix_objects WHERE collection = $1")
		.bind(collection)
		.execute(&mut *tx)
		.await?
		.rows_affected();
	let revision = bump_revision(&mut *tx, collection).await?;

	tx.commit().await?;

	tracing::info!(collection, deleted, revision, "Truncated collection.");

	Ok(deleted)
}
