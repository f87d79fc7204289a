//! Filter/query composition for per-knowledge-base object listings.

use serde::Deserialize;
use serde_json::Value;

use threatkb_domain::{
	Form, FormClause, KnowledgeBase, ParsedId, ids,
	knowledge_base::SUBTECHNIQUE_FLAG,
};
use threatkb_storage::{
	models::StixRecord,
	query::{self, Column, Flag, ObjectQuery, Predicate, Sort, SortKey},
};

use crate::{
	Error, KbService, Result,
	page::{Page, PageRequest, PageWindow},
	versions::{self, HistoryGroup, Versions},
};

pub const OBJECTS_CONTAINER: &str = "objects";

/// Listing parameters. Every filter is optional and independent of the others.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectFilter {
	/// Domain ids or semantic ids; the form of each is detected individually.
	pub ids: Vec<String>,
	/// Domain ids only (`cwe_id`, `attack_id`, ...).
	pub domain_ids: Vec<String>,
	pub text: Option<String>,
	pub name: Option<String>,
	pub description: Option<String>,
	pub alias: Option<String>,
	pub types: Vec<String>,
	pub forms: Vec<String>,
	pub include_revoked: bool,
	pub include_deprecated: bool,
	pub version: Option<String>,
	pub sort: Option<String>,
	pub alpha2_code: Vec<String>,
	pub alpha3_code: Vec<String>,
	pub location_type: Vec<String>,
	#[serde(flatten)]
	pub page: PageRequest,
}

/// Version pin and visibility defaults of a single-object lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ObjectLookup {
	pub version: Option<String>,
	pub include_revoked: bool,
	pub include_deprecated: bool,
}
impl ObjectLookup {
	pub(crate) fn predicate(&self, kb: KnowledgeBase, id: &ParsedId) -> Result<Predicate> {
		Ok(Predicate::and([
			collection_predicate(kb),
			versions::resolve(self.version.as_deref())?,
			id_predicate(id),
			visibility_predicate(self.include_revoked, self.include_deprecated),
		]))
	}
}

impl ObjectFilter {
	/// Every predicate of the filter except version resolution.
	pub fn predicate(&self, kb: KnowledgeBase) -> Result<Predicate> {
		let mut parts = vec![
			collection_predicate(kb),
			types_predicate(kb.object_types(), &self.types),
			visibility_predicate(self.include_revoked, self.include_deprecated),
		];

		parts.push(self.ids_predicate());

		if let Some(text) = non_blank(&self.text) {
			parts.push(Predicate::Text(text.to_string()));
		}
		if let Some(name) = non_blank(&self.name) {
			parts.push(Predicate::Contains(Column::Name, name.to_string()));
		}
		if let Some(description) = non_blank(&self.description) {
			parts.push(Predicate::Contains(Column::Description, description.to_string()));
		}
		if let Some(alias) = non_blank(&self.alias) {
			if !kb.supports_alias() {
				return Err(Error::validation(format!("alias is not supported for {kb}.")));
			}

			parts.push(Predicate::AliasContains { fields: kb.alias_fields(), alias: alias.to_string() });
		}
		if !self.forms.is_empty() {
			parts.push(forms_predicate(kb, &self.forms)?);
		}

		parts.extend(self.location_predicates(kb)?);

		Ok(Predicate::and(parts))
	}

	fn ids_predicate(&self) -> Predicate {
		let (mut domain, semantic) = ids::partition_ids(&self.ids);

		domain.extend(
			self.domain_ids
				.iter()
				.map(|id| id.trim().to_lowercase())
				.filter(|id| !id.is_empty()),
		);

		let mut alternatives = Vec::new();

		if !domain.is_empty() {
			alternatives.push(Predicate::InText(Column::ExternalId, domain));
		}
		if !semantic.is_empty() {
			alternatives.push(Predicate::InText(Column::SemanticId, semantic));
		}
		if alternatives.is_empty() {
			return Predicate::True;
		}

		Predicate::or(alternatives)
	}

	fn location_predicates(&self, kb: KnowledgeBase) -> Result<Vec<Predicate>> {
		let requested =
			!(self.alpha2_code.is_empty() && self.alpha3_code.is_empty() && self.location_type.is_empty());

		if !requested {
			return Ok(Vec::new());
		}
		if kb != KnowledgeBase::Location {
			return Err(Error::validation(format!("Location filters are not supported for {kb}.")));
		}

		let mut parts = Vec::new();

		if !self.alpha2_code.is_empty() {
			parts.push(Predicate::or(
				self.alpha2_code
					.iter()
					.map(|code| Predicate::JsonTextEq("country", code.trim().to_string())),
			));
		}
		if !self.alpha3_code.is_empty() {
			parts.push(external_reference_any("alpha-3", &self.alpha3_code));
		}
		if !self.location_type.is_empty() {
			parts.push(external_reference_any("type", &self.location_type));
		}

		Ok(parts)
	}
}

impl KbService {
	pub async fn list_objects(&self, kb: KnowledgeBase, filter: &ObjectFilter) -> Result<Page<Value>> {
		let window = PageWindow::resolve(filter.page, &self.cfg.query)?;
		let predicate = Predicate::and([
			versions::resolve(filter.version.as_deref())?,
			filter.predicate(kb)?,
		]);
		let query = ObjectQuery::new(predicate)
			.sorted(parse_sort(filter.sort.as_deref(), kb.sort_fields(), Some(kb.domain_id_param())))
			.window(window.window());
		let (rows, total) = query::fetch_page(&self.db.pool, &query).await?;

		Ok(Page::new(window, total, OBJECTS_CONTAINER, rows.into_iter().map(|row| row.data).collect()))
	}

	/// Looks one id up under the lookup's version pin and visibility defaults.
	pub async fn get_object(
		&self,
		kb: KnowledgeBase,
		id: &str,
		lookup: &ObjectLookup,
		page: PageRequest,
	) -> Result<Page<Value>> {
		let window = PageWindow::resolve(page, &self.cfg.query)?;
		let id = parse_id(id)?;
		let query = ObjectQuery::new(lookup.predicate(kb, &id)?)
			.sorted(Sort::desc(Column::Modified))
			.window(window.window());
		let (rows, total) = query::fetch_page(&self.db.pool, &query).await?;

		Ok(Page::new(window, total, OBJECTS_CONTAINER, rows.into_iter().map(|row| row.data).collect()))
	}

	pub async fn object_versions(&self, kb: KnowledgeBase) -> Result<Versions> {
		self.versions.versions(kb.collection()).await
	}

	pub async fn object_history(&self, kb: KnowledgeBase, id: &str) -> Result<Vec<HistoryGroup>> {
		let id = parse_id(id)?;

		self.versions.object_history(kb, &id).await
	}

	/// Resolves seed records for graph lookups; an unmatched id is a not-found error.
	pub(crate) async fn resolve_seeds(
		&self,
		kb: KnowledgeBase,
		id: &str,
		lookup: &ObjectLookup,
	) -> Result<Vec<StixRecord>> {
		let parsed = parse_id(id)?;
		let query = ObjectQuery::new(lookup.predicate(kb, &parsed)?).sorted(Sort::asc(Column::SemanticId));
		let seeds = query::fetch_all(&self.db.pool, &query).await?;

		if seeds.is_empty() {
			return Err(Error::not_found(format!("No {kb} object matches {id}.")));
		}

		Ok(seeds)
	}
}

/// Parses `{field}_{ascending|descending}`. Keys naming an unknown field fall back to
/// `modified_descending`; the domain-id field sorts by the extracted external id.
pub fn parse_sort(raw: Option<&str>, fields: &[&str], domain_id_param: Option<&str>) -> Sort {
	let default = Sort::desc(Column::Modified);
	let Some(raw) = raw.map(str::trim) else {
		return default;
	};
	let (field, descending) = if let Some(field) = raw.strip_suffix("_descending") {
		(field, true)
	} else if let Some(field) = raw.strip_suffix("_ascending") {
		(field, false)
	} else {
		return default;
	};

	if !fields.contains(&field) {
		return default;
	}

	let key = match field {
		"modified" => Column::Modified.into(),
		"created" => Column::Created.into(),
		"name" => Column::Name.into(),
		"type" => Column::StixType.into(),
		"location_type" => SortKey::ExternalReference("type"),
		other if Some(other) == domain_id_param => Column::ExternalId.into(),
		_ => return default,
	};

	Sort { key, descending }
}

pub(crate) fn parse_id(raw: &str) -> Result<ParsedId> {
	ParsedId::parse(raw).ok_or_else(|| Error::validation("Object id must be non-empty."))
}

pub(crate) fn collection_predicate(kb: KnowledgeBase) -> Predicate {
	Predicate::text_eq(Column::Collection, kb.collection())
}

pub(crate) fn id_predicate(id: &ParsedId) -> Predicate {
	match id {
		ParsedId::DomainId(value) => Predicate::text_eq(Column::ExternalId, value.clone()),
		ParsedId::SemanticId(value) => Predicate::text_eq(Column::SemanticId, value.clone()),
	}
}

/// Hides revoked and deprecated-or-obsolete records unless asked for.
pub(crate) fn visibility_predicate(include_revoked: bool, include_deprecated: bool) -> Predicate {
	let mut parts = Vec::new();

	if !include_revoked {
		parts.push(Predicate::Flag(Flag::Revoked).negate());
	}
	if !include_deprecated {
		parts.push(Predicate::Flag(Flag::Deprecated).negate());
	}

	Predicate::and(parts)
}

/// Restricts to `allowed`, narrowed to `requested` when any are given.
pub(crate) fn types_predicate(allowed: &[&str], requested: &[String]) -> Predicate {
	let types: Vec<String> = if requested.is_empty() {
		allowed.iter().map(|kind| kind.to_string()).collect()
	} else {
		requested
			.iter()
			.map(|kind| kind.trim())
			.filter(|kind| allowed.contains(kind))
			.map(str::to_string)
			.collect()
	};

	Predicate::InText(Column::StixType, types)
}

fn forms_predicate(kb: KnowledgeBase, raw: &[String]) -> Result<Predicate> {
	let mut clauses = Vec::new();

	for value in raw {
		let form = value.parse::<Form>().map_err(Error::validation)?;

		if !kb.forms().contains(&form) {
			return Err(Error::validation(format!("Form {form} is not supported for {kb}.")));
		}

		clauses.extend(form.clauses().iter().map(clause_predicate));
	}

	Ok(Predicate::or(clauses))
}

fn clause_predicate(clause: &FormClause) -> Predicate {
	let kind = Predicate::text_eq(Column::StixType, clause.stix_type);

	match clause.subtechnique {
		None => kind,
		Some(true) => Predicate::and([kind, Predicate::JsonFlag(SUBTECHNIQUE_FLAG)]),
		Some(false) => Predicate::and([kind, Predicate::JsonFlag(SUBTECHNIQUE_FLAG).negate()]),
	}
}

fn external_reference_any(source_name: &str, values: &[String]) -> Predicate {
	Predicate::or(values.iter().map(|value| Predicate::ExternalReference {
		source_name: source_name.to_string(),
		external_id: value.trim().to_string(),
	}))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
	value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}
