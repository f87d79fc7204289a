//! Field extraction from raw STIX objects and synthesis of embedded-reference relationships.

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::time_serde;

/// Namespace for every relationship id the engine synthesizes.
pub const RELATIONSHIP_NAMESPACE: Uuid = Uuid::from_u128(0x5e0b_2a3c_81d4_4f6e_9a27_c3e1_0d4b_7f19);
pub const RELATIONSHIP_TYPE: &str = "relationship";

const SMO_TYPES: &[&str] = &["marking-definition", "extension-definition", "language-content"];
const ENDPOINT_KEYS: &[&str] = &["source_ref", "target_ref"];

/// The columns a stored record projects out of its STIX body.
#[derive(Debug, Clone, PartialEq)]
pub struct StixFields {
	pub semantic_id: String,
	pub stix_type: String,
	/// Lowercased `external_id` of the first external reference.
	pub external_id: Option<String>,
	pub name: Option<String>,
	pub description: Option<String>,
	pub modified: Option<OffsetDateTime>,
	pub created: Option<OffsetDateTime>,
	pub revoked: bool,
	pub deprecated: bool,
	pub source_ref: Option<String>,
	pub target_ref: Option<String>,
	pub relationship_type: Option<String>,
}
impl StixFields {
	/// Returns `None` for values that are not objects with a string `id` and `type`.
	pub fn extract(object: &Value) -> Option<Self> {
		let map = object.as_object()?;
		let semantic_id = str_field(map, "id")?.to_string();
		let stix_type = str_field(map, "type")?.to_string();

		Some(Self {
			external_id: first_external_id(map),
			name: str_field(map, "name").map(str::to_string),
			description: str_field(map, "description").map(str::to_string),
			modified: str_field(map, "modified").and_then(|raw| time_serde::parse(raw).ok()),
			created: str_field(map, "created").and_then(|raw| time_serde::parse(raw).ok()),
			revoked: bool_field(map, "revoked"),
			deprecated: is_deprecated(map),
			source_ref: str_field(map, "source_ref").map(str::to_string),
			target_ref: str_field(map, "target_ref").map(str::to_string),
			relationship_type: str_field(map, "relationship_type").map(str::to_string),
			semantic_id,
			stix_type,
		})
	}

	pub fn is_relationship(&self) -> bool {
		self.stix_type == RELATIONSHIP_TYPE
	}
}

/// Controls which objects contribute embedded-reference relationships.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddedRefOptions {
	pub ignore_embedded_relationships: bool,
	/// Skip references held by relationship objects.
	pub ignore_sro: bool,
	/// Skip references held by marking, extension and language-content objects.
	pub ignore_smo: bool,
}

/// One object ready to be written, authored or synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestObject {
	pub data: Value,
	pub fields: StixFields,
	pub is_embedded: bool,
}

/// Extracts every valid object from a bundle's `objects` list and appends the embedded
/// relationships their reference properties imply.
pub fn prepare_objects(objects: &[Value], options: EmbeddedRefOptions) -> Vec<IngestObject> {
	let mut prepared = Vec::with_capacity(objects.len());
	let mut embedded = Vec::new();

	for object in objects {
		let Some(fields) = StixFields::extract(object) else {
			continue;
		};

		if !options.ignore_embedded_relationships && contributes_refs(&fields, options) {
			embedded.extend(embedded_relationships(object, &fields));
		}

		prepared.push(IngestObject { data: object.clone(), fields, is_embedded: false });
	}

	prepared.extend(embedded);

	prepared
}

fn contributes_refs(fields: &StixFields, options: EmbeddedRefOptions) -> bool {
	if options.ignore_sro && fields.is_relationship() {
		return false;
	}
	if options.ignore_smo && SMO_TYPES.contains(&fields.stix_type.as_str()) {
		return false;
	}

	true
}

/// Every `*_ref` / `*_refs` property except relationship endpoints becomes a relationship whose
/// type is the property name without its suffix, underscores turned into hyphens.
pub fn embedded_relationships(object: &Value, fields: &StixFields) -> Vec<IngestObject> {
	let Some(map) = object.as_object() else {
		return Vec::new();
	};
	let mut out = Vec::new();

	for (key, value) in map {
		if ENDPOINT_KEYS.contains(&key.as_str()) {
			continue;
		}

		let Some((stem, targets)) = reference_targets(key, value) else {
			continue;
		};
		let relationship_type = stem.replace('_', "-");

		for target in targets {
			let data = synthesize_relationship(
				&relationship_type,
				&fields.semantic_id,
				target,
				map.get("created"),
				map.get("modified"),
			);

			if let Some(fields) = StixFields::extract(&data) {
				out.push(IngestObject { data, fields, is_embedded: true });
			}
		}
	}

	out
}

fn reference_targets<'a>(key: &'a str, value: &'a Value) -> Option<(&'a str, Vec<&'a str>)> {
	if let Some(stem) = key.strip_suffix("_refs") {
		let targets = value.as_array()?.iter().filter_map(Value::as_str).collect();

		return Some((stem, targets));
	}

	key.strip_suffix("_ref").map(|stem| (stem, value.as_str().into_iter().collect()))
}

/// Deterministic id for a synthesized relationship, stable across runs.
pub fn relationship_id(relationship_type: &str, source: &str, target: &str) -> String {
	let name = format!("{relationship_type}+{source}+{target}");

	format!("{RELATIONSHIP_TYPE}--{}", Uuid::new_v5(&RELATIONSHIP_NAMESPACE, name.as_bytes()))
}

pub(crate) fn synthesize_relationship(
	relationship_type: &str,
	source: &str,
	target: &str,
	created: Option<&Value>,
	modified: Option<&Value>,
) -> Value {
	let mut data = json!({
		"type": RELATIONSHIP_TYPE,
		"spec_version": "2.1",
		"id": relationship_id(relationship_type, source, target),
		"relationship_type": relationship_type,
		"source_ref": source,
		"target_ref": target,
	});

	if let Some(map) = data.as_object_mut() {
		if let Some(created) = created {
			map.insert("created".to_string(), created.clone());
		}
		if let Some(modified) = modified {
			map.insert("modified".to_string(), modified.clone());
		}
	}

	data
}

/// External references of `object`, as `(source_name, external_id)` pairs.
pub fn external_references(object: &Value) -> Vec<(&str, &str)> {
	object
		.get("external_references")
		.and_then(Value::as_array)
		.map(|refs| {
			refs.iter()
				.filter_map(|reference| {
					Some((
						reference.get("source_name")?.as_str()?,
						reference.get("external_id")?.as_str()?,
					))
				})
				.collect()
		})
		.unwrap_or_default()
}

fn first_external_id(map: &Map<String, Value>) -> Option<String> {
	map.get("external_references")?
		.as_array()?
		.first()?
		.get("external_id")?
		.as_str()
		.map(str::to_lowercase)
}

fn is_deprecated(map: &Map<String, Value>) -> bool {
	if bool_field(map, "x_mitre_deprecated") {
		return true;
	}

	["x_cwe_status", "x_capec_status"].into_iter().filter_map(|key| str_field(map, key)).any(
		|status| status.eq_ignore_ascii_case("deprecated") || status.eq_ignore_ascii_case("obsolete"),
	)
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
	map.get(key).and_then(Value::as_str)
}

fn bool_field(map: &Map<String, Value>, key: &str) -> bool {
	map.get(key).and_then(Value::as_bool).unwrap_or(false)
}
