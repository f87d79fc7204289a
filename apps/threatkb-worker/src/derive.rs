//! The derive-relationships step: writes generated edges next to the data they link.

use serde_json::Value;

use threatkb_domain::{
	KnowledgeBase, VersionTag,
	derive::{self, SourceWindow},
	job::ProcessorParameters,
	stix::{EmbeddedRefOptions, prepare_objects},
};
use threatkb_storage::objects::ObjectStore;

use crate::{Error, Result};

/// Links techniques to tactics within the bundle just written, under the same version.
pub async fn technique_tactic(
	store: &dyn ObjectStore,
	kb: KnowledgeBase,
	version: &VersionTag,
	objects: &[Value],
) -> Result<u64> {
	let relationships = derive::technique_tactic_relationships(objects);

	if relationships.is_empty() {
		return Ok(0);
	}

	let options = EmbeddedRefOptions { ignore_embedded_relationships: true, ..Default::default() };
	let prepared = prepare_objects(&relationships, options);
	let report = store.write_objects(kb.collection(), &version.ingestion_note(), &prepared).await?;

	tracing::info!(
		knowledge_base = %kb,
		written = report.written,
		"Derived technique-tactic relationships."
	);

	Ok(report.written)
}

/// Links the latest objects of the mode's source knowledge base to its targets. The edges are
/// stored in the source collection under its newest version.
pub async fn cross_knowledge_base(store: &dyn ObjectStore, parameters: &ProcessorParameters) -> Result<u64> {
	let source = parameters.mode.source();
	let note = store.latest_version_note(source.collection()).await?.ok_or_else(|| {
		Error::Message(format!("No version of {source} has been ingested."))
	})?;
	let sources = store.latest_objects(source.collection()).await?;
	let mut targets = Vec::new();

	for target in parameters.mode.targets() {
		targets.extend(store.latest_objects(target.collection()).await?);
	}

	let window =
		SourceWindow { modified_min: parameters.modified_min, created_min: parameters.created_min };
	let relationships =
		derive::cross_knowledge_base_relationships(parameters.mode, &sources, &targets, window);

	if relationships.is_empty() {
		tracing::info!(mode = %parameters.mode, "No cross-knowledge-base relationships to write.");

		return Ok(0);
	}

	let options = EmbeddedRefOptions {
		ignore_embedded_relationships: parameters.ignore_embedded_relationships,
		..Default::default()
	};
	let prepared = prepare_objects(&relationships, options);
	let report = store.write_objects(source.collection(), &note, &prepared).await?;

	tracing::info!(
		mode = %parameters.mode,
		written = report.written,
		ingestion_note = %note,
		"Derived cross-knowledge-base relationships."
	);

	Ok(report.written)
}
