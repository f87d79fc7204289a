//! Generators for relationships the source bundles only imply.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::{
	knowledge_base::ProcessorMode,
	stix::{self, StixFields},
};

/// Relationship type linking a technique to each tactic its kill-chain phases name.
pub const TECHNIQUE_TACTIC_RELATIONSHIP: &str = "belongs-to";

/// Links every `attack-pattern` to the `x-mitre-tactic` objects whose `x_mitre_shortname`
/// matches one of its kill-chain phase names. Revoked objects are skipped.
pub fn technique_tactic_relationships(objects: &[Value]) -> Vec<Value> {
	let mut tactics: HashMap<&str, Vec<&str>> = HashMap::new();

	for object in objects {
		if object.get("type").and_then(Value::as_str) != Some("x-mitre-tactic") || is_revoked(object) {
			continue;
		}

		if let (Some(shortname), Some(id)) = (
			object.get("x_mitre_shortname").and_then(Value::as_str),
			object.get("id").and_then(Value::as_str),
		) {
			tactics.entry(shortname).or_default().push(id);
		}
	}

	let mut seen = BTreeSet::new();
	let mut out = Vec::new();

	for technique in objects {
		if technique.get("type").and_then(Value::as_str) != Some("attack-pattern") || is_revoked(technique) {
			continue;
		}

		let Some(technique_id) = technique.get("id").and_then(Value::as_str) else {
			continue;
		};

		for phase in kill_chain_phase_names(technique) {
			for tactic_id in tactics.get(phase).into_iter().flatten() {
				if !seen.insert((technique_id, *tactic_id)) {
					continue;
				}

				out.push(derived_relationship(
					TECHNIQUE_TACTIC_RELATIONSHIP,
					technique,
					technique_id,
					tactic_id,
				));
			}
		}
	}

	out
}

/// Lower bounds on source objects considered by a processor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceWindow {
	pub modified_min: Option<OffsetDateTime>,
	pub created_min: Option<OffsetDateTime>,
}
impl SourceWindow {
	pub fn admits(&self, fields: &StixFields) -> bool {
		let after = |bound: Option<OffsetDateTime>, value: Option<OffsetDateTime>| match bound {
			Some(bound) => value.is_some_and(|value| value >= bound),
			None => true,
		};

		after(self.modified_min, fields.modified) && after(self.created_min, fields.created)
	}
}

/// Links source-knowledge-base objects to target objects named by their external references.
/// A source reference `(source_name, external_id)` matches a target whose first external id
/// equals `external_id`, compared case-insensitively.
pub fn cross_knowledge_base_relationships(
	mode: ProcessorMode,
	sources: &[Value],
	targets: &[Value],
	window: SourceWindow,
) -> Vec<Value> {
	let mut by_external_id: HashMap<String, Vec<&str>> = HashMap::new();

	for target in targets {
		let Some(fields) = StixFields::extract(target) else {
			continue;
		};

		if fields.revoked || fields.is_relationship() {
			continue;
		}
		if let Some(external_id) = fields.external_id {
			by_external_id.entry(external_id).or_default().push(
				target.get("id").and_then(Value::as_str).unwrap_or_default(),
			);
		}
	}

	let mut seen = BTreeSet::new();
	let mut out = Vec::new();

	for source in sources {
		let Some(fields) = StixFields::extract(source) else {
			continue;
		};

		if fields.revoked || fields.is_relationship() || !window.admits(&fields) {
			continue;
		}

		for (source_name, external_id) in stix::external_references(source) {
			if !source_name.eq_ignore_ascii_case(mode.reference_source()) {
				continue;
			}

			let key = external_id.to_lowercase();

			for target_id in by_external_id.get(&key).into_iter().flatten() {
				if !seen.insert((fields.semantic_id.clone(), *target_id)) {
					continue;
				}

				out.push(derived_relationship(
					mode.relationship_type(),
					source,
					&fields.semantic_id,
					target_id,
				));
			}
		}
	}

	out
}

fn derived_relationship(relationship_type: &str, source: &Value, source_id: &str, target_id: &str) -> Value {
	let mut data = stix::synthesize_relationship(
		relationship_type,
		source_id,
		target_id,
		source.get("created"),
		source.get("modified"),
	);

	if let Some(map) = data.as_object_mut() {
		for key in ["created_by_ref", "object_marking_refs"] {
			if let Some(value) = source.get(key) {
				map.insert(key.to_string(), value.clone());
			}
		}

		map.insert("x_derived".to_string(), json!(true));
	}

	data
}

fn kill_chain_phase_names(object: &Value) -> impl Iterator<Item = &str> {
	object
		.get("kill_chain_phases")
		.and_then(Value::as_array)
		.into_iter()
		.flatten()
		.filter_map(|phase| phase.get("phase_name").and_then(Value::as_str))
}

fn is_revoked(object: &Value) -> bool {
	object.get("revoked").and_then(Value::as_bool).unwrap_or(false)
}
