use serde::Deserialize;
use serde_json::Value;

use threatkb_domain::{KnowledgeBase, knowledge_base};
use threatkb_storage::query::{self, Column, Flag, ObjectQuery, Predicate};

use crate::{
	Error, KbService, Result,
	objects::{OBJECTS_CONTAINER, parse_sort, types_predicate, visibility_predicate},
	page::{Page, PageRequest, PageWindow},
};

/// Sortable fields of cross-knowledge-base search.
pub const SEARCH_SORT_FIELDS: [&str; 4] = ["modified", "created", "name", "type"];

pub const KNOWLEDGE_BASE_NAME_KEY: &str = "knowledgebase_name";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
	pub text: Option<String>,
	pub types: Vec<String>,
	/// Knowledge-base names (`attack-enterprise`, `cwe`, ...); empty searches all of them.
	pub knowledge_bases: Vec<String>,
	pub show_knowledgebase: bool,
	pub include_revoked: bool,
	pub include_deprecated: bool,
	pub sort: Option<String>,
	#[serde(flatten)]
	pub page: PageRequest,
}
impl SearchFilter {
	pub fn predicate(&self) -> Result<Predicate> {
		let text = self
			.text
			.as_deref()
			.map(str::trim)
			.filter(|text| !text.is_empty())
			.ok_or_else(|| Error::validation("text is required."))?;
		let collections = self
			.knowledge_bases()?
			.into_iter()
			.map(|kb| kb.collection().to_string())
			.collect();
		let all_types = knowledge_base::all_object_types();

		Ok(Predicate::and([
			Predicate::InText(Column::Collection, collections),
			Predicate::Flag(Flag::IsLatest),
			types_predicate(&all_types, &self.types),
			visibility_predicate(self.include_revoked, self.include_deprecated),
			Predicate::Text(text.to_string()),
		]))
	}

	fn knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
		if self.knowledge_bases.is_empty() {
			return Ok(KnowledgeBase::ALL.to_vec());
		}

		self.knowledge_bases
			.iter()
			.map(|name| name.parse::<KnowledgeBase>().map_err(Error::validation))
			.collect()
	}
}

impl KbService {
	/// Full-text search over the latest records of every selected knowledge base.
	pub async fn search(&self, filter: &SearchFilter) -> Result<Page<Value>> {
		let window = PageWindow::resolve(filter.page, &self.cfg.query)?;
		let query = ObjectQuery::new(filter.predicate()?)
			.sorted(parse_sort(filter.sort.as_deref(), &SEARCH_SORT_FIELDS, None))
			.window(window.window());
		let (rows, total) = query::fetch_page(&self.db.pool, &query).await?;
		let objects = rows
			.into_iter()
			.map(|row| {
				let mut data = row.data;

				if filter.show_knowledgebase
					&& let (Some(kb), Some(object)) =
						(KnowledgeBase::from_collection(&row.collection), data.as_object_mut())
				{
					object.insert(KNOWLEDGE_BASE_NAME_KEY.to_string(), Value::from(kb.name()));
				}

				data
			})
			.collect();

		Ok(Page::new(window, total, OBJECTS_CONTAINER, objects))
	}
}

#[cfg(test)]
mod tests {
	use threatkb_storage::query::{Column, Predicate};

	use super::SearchFilter;

	#[test]
	fn text_is_required() {
		let filter = SearchFilter { text: Some("   ".to_string()), ..Default::default() };

		assert_eq!(filter.predicate().map_err(|err| err.code()).err(), Some(400));
	}

	#[test]
	fn knowledge_bases_expand_to_collections() {
		let filter = SearchFilter {
			text: Some("denial of service".to_string()),
			knowledge_bases: vec!["cwe".to_string(), "capec".to_string()],
			..Default::default()
		};
		let Predicate::And(parts) = filter.predicate().expect("Failed to build predicate.") else {
			panic!("Expected a conjunction.");
		};

		assert_eq!(
			parts[0],
			Predicate::InText(
				Column::Collection,
				vec!["mitre_cwe".to_string(), "mitre_capec".to_string()]
			)
		);
		assert!(parts.contains(&Predicate::Text("denial of service".to_string())));
	}

	#[test]
	fn unknown_knowledge_base_is_rejected() {
		let filter = SearchFilter {
			text: Some("phishing".to_string()),
			knowledge_bases: vec!["nvd-cve".to_string()],
			..Default::default()
		};

		assert_eq!(filter.predicate().map_err(|err| err.code()).err(), Some(400));
	}
}
