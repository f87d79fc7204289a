//! A structured predicate/sort/page description of an object query and its Postgres rendering.
//!
//! Callers never concatenate SQL: every value travels as a bind parameter and every column name
//! comes from the closed `Column` set.

use sqlx::{PgExecutor, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{Result, models::{RECORD_COLUMNS, StixRecord}};

const TEXT_DOCUMENT: &str = "COALESCE(name, '') || ' ' || COALESCE(description, '')";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
	StorageKey,
	Collection,
	SemanticId,
	StixType,
	ExternalId,
	Name,
	Description,
	Modified,
	Created,
	IngestionNote,
	RelationshipType,
	SourceRef,
	TargetRef,
	SourceKey,
	TargetKey,
}
impl Column {
	pub fn sql(self) -> &'static str {
		match self {
			Self::StorageKey => "storage_key",
			Self::Collection => "collection",
			Self::SemanticId => "semantic_id",
			Self::StixType => "stix_type",
			Self::ExternalId => "external_id",
			Self::Name => "name",
			Self::Description => "description",
			Self::Modified => "modified",
			Self::Created => "created",
			Self::IngestionNote => "ingestion_note",
			Self::RelationshipType => "relationship_type",
			Self::SourceRef => "source_ref",
			Self::TargetRef => "target_ref",
			Self::SourceKey => "source_key",
			Self::TargetKey => "target_key",
		}
	}
}

/// Boolean record columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
	IsLatest,
	Revoked,
	Deprecated,
	IsEmbedded,
}
impl Flag {
	fn sql(self) -> &'static str {
		match self {
			Self::IsLatest => "is_latest",
			Self::Revoked => "revoked",
			Self::Deprecated => "deprecated",
			Self::IsEmbedded => "is_embedded",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
	Text(String),
	Key(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
	True,
	And(Vec<Predicate>),
	Or(Vec<Predicate>),
	Not(Box<Predicate>),
	Flag(Flag),
	Eq(Column, Scalar),
	InText(Column, Vec<String>),
	InKeys(Column, Vec<Uuid>),
	/// Case-insensitive substring match on a text column.
	Contains(Column, String),
	/// A boolean property of the STIX body; absent counts as false.
	JsonFlag(&'static str),
	/// Case-insensitive equality on a top-level string property of the STIX body.
	JsonTextEq(&'static str, String),
	/// Every whitespace-separated token must match `name`/`description` either through the
	/// stemmed English analyzer or as a literal substring.
	Text(String),
	/// Some external reference has this `source_name` and, case-insensitively, this id.
	ExternalReference { source_name: String, external_id: String },
	/// Case-insensitive substring of any entry in the listed array properties of the STIX body.
	AliasContains { fields: &'static [&'static str], alias: String },
	/// The STIX type prefix of a reference column is one of `types`.
	RefTypeIn(Column, Vec<String>),
}
impl Predicate {
	pub fn and(parts: impl IntoIterator<Item = Predicate>) -> Self {
		let parts: Vec<_> = parts.into_iter().filter(|part| *part != Self::True).collect();

		match parts.len() {
			0 => Self::True,
			1 => parts.into_iter().next().unwrap_or(Self::True),
			_ => Self::And(parts),
		}
	}

	pub fn or(parts: impl IntoIterator<Item = Predicate>) -> Self {
		let parts: Vec<_> = parts.into_iter().collect();

		if parts.len() == 1 {
			return parts.into_iter().next().unwrap_or(Self::True);
		}

		Self::Or(parts)
	}

	pub fn negate(self) -> Self {
		Self::Not(Box::new(self))
	}

	pub fn text_eq(column: Column, value: impl Into<String>) -> Self {
		Self::Eq(column, Scalar::Text(value.into()))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
	Column(Column),
	/// `external_id` of the first external reference with this `source_name`.
	ExternalReference(&'static str),
}
impl From<Column> for SortKey {
	fn from(column: Column) -> Self {
		Self::Column(column)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
	pub key: SortKey,
	pub descending: bool,
}
impl Sort {
	pub fn asc(key: impl Into<SortKey>) -> Self {
		Self { key: key.into(), descending: false }
	}

	pub fn desc(key: impl Into<SortKey>) -> Self {
		Self { key: key.into(), descending: true }
	}
}

/// Collapses records sharing a `semantic_id` to the freshest copy: newest `modified`, then newest
/// record modification, then newest ingestion sequence, then highest storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distinct {
	FreshestPerSemanticId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
	pub limit: i64,
	pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectQuery {
	pub predicate: Predicate,
	pub sort: Vec<Sort>,
	pub distinct: Option<Distinct>,
	pub window: Option<Window>,
}
impl ObjectQuery {
	pub fn new(predicate: Predicate) -> Self {
		Self { predicate, sort: Vec::new(), distinct: None, window: None }
	}

	pub fn sorted(mut self, sort: Sort) -> Self {
		self.sort.push(sort);

		self
	}

	pub fn distinct(mut self, distinct: Distinct) -> Self {
		self.distinct = Some(distinct);

		self
	}

	pub fn window(mut self, window: Window) -> Self {
		self.window = Some(window);

		self
	}

	/// Renders the row query. A `storage_key` tiebreak keeps paging stable.
	pub fn select_builder(&self) -> QueryBuilder<'static, Postgres> {
		let mut builder = QueryBuilder::new("");

		match self.distinct {
			None => {
				builder.push(format!("SELECT {RECORD_COLUMNS} FROM stix_objects WHERE "));
				push_predicate(&mut builder, &self.predicate);
			},
			Some(Distinct::FreshestPerSemanticId) => {
				builder.push(format!(
					"SELECT {RECORD_COLUMNS} FROM (SELECT DISTINCT ON (semantic_id) \
					 {RECORD_COLUMNS} FROM stix_objects WHERE "
				));
				push_predicate(&mut builder, &self.predicate);
				builder.push(
					" ORDER BY semantic_id, modified DESC NULLS LAST, record_modified DESC, \
					 ingestion_seq DESC, storage_key DESC) AS freshest",
				);
			},
		}

		builder.push(" ORDER BY ");

		for sort in &self.sort {
			match sort.key {
				SortKey::Column(column) => {
					builder.push(column.sql());
				},
				SortKey::ExternalReference(source_name) => {
					builder.push(
						"(SELECT reference ->> 'external_id' FROM \
						 jsonb_array_elements(COALESCE(data -> 'external_references', '[]'::jsonb)) \
						 AS reference WHERE reference ->> 'source_name' = ",
					);
					builder.push_bind(source_name);
					builder.push(" LIMIT 1)");
				},
			}

			builder.push(if sort.descending { " DESC NULLS LAST, " } else { " ASC NULLS LAST, " });
		}

		builder.push("storage_key ASC");

		if let Some(window) = self.window {
			builder.push(" LIMIT ");
			builder.push_bind(window.limit);
			builder.push(" OFFSET ");
			builder.push_bind(window.offset);
		}

		builder
	}

	/// Renders the exact total for the predicate, counting semantic ids when deduplicating.
	pub fn count_builder(&self) -> QueryBuilder<'static, Postgres> {
		let mut builder = QueryBuilder::new(match self.distinct {
			None => "SELECT COUNT(*) FROM stix_objects WHERE ",
			Some(Distinct::FreshestPerSemanticId) =>
				"SELECT COUNT(DISTINCT semantic_id) FROM stix_objects WHERE ",
		});

		push_predicate(&mut builder, &self.predicate);

		builder
	}
}

/// Runs the row query and the exact count, returning `(rows, total)`.
pub async fn fetch_page<'e, E>(executor: E, query: &ObjectQuery) -> Result<(Vec<StixRecord>, i64)>
where
	E: PgExecutor<'e> + Copy,
{
	let rows = query.select_builder().build_query_as::<StixRecord>().fetch_all(executor).await?;
	let total: i64 = query.count_builder().build_query_scalar().fetch_one(executor).await?;

	Ok((rows, total))
}

pub async fn fetch_all<'e, E>(executor: E, query: &ObjectQuery) -> Result<Vec<StixRecord>>
where
	E: PgExecutor<'e>,
{
	let rows = query.select_builder().build_query_as::<StixRecord>().fetch_all(executor).await?;

	Ok(rows)
}

/// Escapes LIKE metacharacters and wraps the lowercased value in `%`.
pub fn like_pattern(value: &str) -> String {
	let mut escaped = String::with_capacity(value.len() + 2);

	escaped.push('%');

	for ch in value.to_lowercase().chars() {
		if matches!(ch, '%' | '_' | '\\') {
			escaped.push('\\');
		}

		escaped.push(ch);
	}

	escaped.push('%');

	escaped
}

pub(crate) fn push_predicate(builder: &mut QueryBuilder<'static, Postgres>, predicate: &Predicate) {
	match predicate {
		Predicate::True => {
			builder.push("TRUE");
		},
		Predicate::And(parts) => push_joined(builder, parts, " AND ", "TRUE"),
		Predicate::Or(parts) => push_joined(builder, parts, " OR ", "FALSE"),
		Predicate::Not(inner) => {
			builder.push("NOT (");
			push_predicate(builder, inner);
			builder.push(")");
		},
		Predicate::Flag(flag) => {
			builder.push(flag.sql());
		},
		Predicate::Eq(column, value) => {
			builder.push(column.sql());
			builder.push(" = ");
			push_scalar(builder, value);
		},
		Predicate::InText(column, values) => {
			builder.push(column.sql());
			builder.push(" = ANY(");
			builder.push_bind(values.clone());
			builder.push(")");
		},
		Predicate::InKeys(column, keys) => {
			builder.push(column.sql());
			builder.push(" = ANY(");
			builder.push_bind(keys.clone());
			builder.push(")");
		},
		Predicate::Contains(column, value) => {
			builder.push("LOWER(");
			builder.push(column.sql());
			builder.push(") LIKE ");
			builder.push_bind(like_pattern(value));
			builder.push(" ESCAPE '\\'");
		},
		Predicate::JsonFlag(key) => {
			builder.push("COALESCE((data ->> ");
			builder.push_bind(*key);
			builder.push(")::boolean, FALSE)");
		},
		Predicate::JsonTextEq(key, value) => {
			builder.push("UPPER(data ->> ");
			builder.push_bind(*key);
			builder.push(") = UPPER(");
			builder.push_bind(value.clone());
			builder.push(")");
		},
		Predicate::Text(text) => {
			let tokens: Vec<&str> = text.split_whitespace().collect();

			if tokens.is_empty() {
				builder.push("TRUE");

				return;
			}

			builder.push("(");

			for (idx, token) in tokens.into_iter().enumerate() {
				if idx > 0 {
					builder.push(" AND ");
				}

				builder.push(format!("(to_tsvector('english', {TEXT_DOCUMENT}) @@ plainto_tsquery('english', "));
				builder.push_bind(token.to_string());
				builder.push(format!(") OR LOWER({TEXT_DOCUMENT}) LIKE "));
				builder.push_bind(like_pattern(token));
				builder.push(" ESCAPE '\\')");
			}

			builder.push(")");
		},
		Predicate::ExternalReference { source_name, external_id } => {
			builder.push(
				"EXISTS (SELECT 1 FROM jsonb_array_elements(COALESCE(data -> 'external_references', \
				 '[]'::jsonb)) AS reference WHERE reference ->> 'source_name' = ",
			);
			builder.push_bind(source_name.clone());
			builder.push(" AND LOWER(reference ->> 'external_id') = ");
			builder.push_bind(external_id.to_lowercase());
			builder.push(")");
		},
		Predicate::AliasContains { fields, alias } => {
			if fields.is_empty() {
				builder.push("FALSE");

				return;
			}

			builder.push("EXISTS (SELECT 1 FROM jsonb_array_elements_text(");

			for (idx, field) in fields.iter().enumerate() {
				if idx > 0 {
					builder.push(" || ");
				}

				builder.push("COALESCE(data -> ");
				builder.push_bind(*field);
				builder.push(", '[]'::jsonb)");
			}

			builder.push(") AS alias WHERE LOWER(alias) LIKE ");
			builder.push_bind(like_pattern(alias));
			builder.push(" ESCAPE '\\')");
		},
		Predicate::RefTypeIn(column, types) => {
			builder.push("split_part(");
			builder.push(column.sql());
			builder.push(", '--', 1) = ANY(");
			builder.push_bind(types.clone());
			builder.push(")");
		},
	}
}

fn push_joined(
	builder: &mut QueryBuilder<'static, Postgres>,
	parts: &[Predicate],
	separator: &str,
	empty: &str,
) {
	if parts.is_empty() {
		builder.push(empty);

		return;
	}

	builder.push("(");

	for (idx, part) in parts.iter().enumerate() {
		if idx > 0 {
			builder.push(separator);
		}

		push_predicate(builder, part);
	}

	builder.push(")");
}

fn push_scalar(builder: &mut QueryBuilder<'static, Postgres>, value: &Scalar) {
	match value {
		Scalar::Text(text) => {
			builder.push_bind(text.clone());
		},
		Scalar::Key(key) => {
			builder.push_bind(*key);
		},
	}
}
