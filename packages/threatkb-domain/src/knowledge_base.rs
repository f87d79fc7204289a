use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{job::JobType, version::VersionTag};

const ATTACK_TYPES: &[&str] = &[
	"attack-pattern",
	"campaign",
	"course-of-action",
	"identity",
	"intrusion-set",
	"malware",
	"marking-definition",
	"tool",
	"x-mitre-asset",
	"x-mitre-data-component",
	"x-mitre-data-source",
	"x-mitre-matrix",
	"x-mitre-tactic",
];
const CWE_TYPES: &[&str] = &["weakness", "grouping"];
const CAPEC_TYPES: &[&str] = &["attack-pattern", "course-of-action", "identity", "marking-definition"];
const ATLAS_TYPES: &[&str] =
	&["attack-pattern", "course-of-action", "x-mitre-collection", "x-mitre-matrix", "x-mitre-tactic"];
const LOCATION_TYPES: &[&str] = &["location"];
const DISARM_TYPES: &[&str] =
	&["attack-pattern", "identity", "marking-definition", "x-mitre-matrix", "x-mitre-tactic"];
const SECTOR_TYPES: &[&str] = &["identity"];

const ATTACK_ALIAS_FIELDS: &[&str] = &["aliases", "x_mitre_aliases"];
const SECTOR_ALIAS_FIELDS: &[&str] = &["x_opencti_aliases"];

/// Flag key marking an `attack-pattern` as a sub-technique.
pub const SUBTECHNIQUE_FLAG: &str = "x_mitre_is_subtechnique";

/// One disjunct of a form: a STIX type plus an optional sub-technique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormClause {
	pub stix_type: &'static str,
	/// `Some(true)` requires the flag, `Some(false)` requires it to be absent or not true.
	pub subtechnique: Option<bool>,
}
impl FormClause {
	const ASSET: Self = Self::plain("x-mitre-asset");
	const CAMPAIGN: Self = Self::plain("campaign");
	const COURSE_OF_ACTION: Self = Self::plain("course-of-action");
	const DATA_COMPONENT: Self = Self::plain("x-mitre-data-component");
	const DATA_SOURCE: Self = Self::plain("x-mitre-data-source");
	const INTRUSION_SET: Self = Self::plain("intrusion-set");
	const MALWARE: Self = Self::plain("malware");
	const MATRIX: Self = Self::plain("x-mitre-matrix");
	const SUBTECHNIQUE: Self = Self::flagged("attack-pattern", true);
	const TACTIC: Self = Self::plain("x-mitre-tactic");
	const TECHNIQUE: Self = Self::flagged("attack-pattern", false);
	const TOOL: Self = Self::plain("tool");

	const fn plain(stix_type: &'static str) -> Self {
		Self { stix_type, subtechnique: None }
	}

	const fn flagged(stix_type: &'static str, subtechnique: bool) -> Self {
		Self { stix_type, subtechnique: Some(subtechnique) }
	}
}

/// A human-facing object kind that maps onto one or more type/flag predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Form {
	Technique,
	SubTechnique,
	Mitigation,
	Group,
	Software,
	Campaign,
	DataSource,
	DataComponent,
	Asset,
	Tactic,
	Matrix,
}
impl Form {
	pub const ALL: [Self; 11] = [
		Self::Technique,
		Self::SubTechnique,
		Self::Mitigation,
		Self::Group,
		Self::Software,
		Self::Campaign,
		Self::DataSource,
		Self::DataComponent,
		Self::Asset,
		Self::Tactic,
		Self::Matrix,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Technique => "Technique",
			Self::SubTechnique => "Sub-technique",
			Self::Mitigation => "Mitigation",
			Self::Group => "Group",
			Self::Software => "Software",
			Self::Campaign => "Campaign",
			Self::DataSource => "Data Source",
			Self::DataComponent => "Data Component",
			Self::Asset => "Asset",
			Self::Tactic => "Tactic",
			Self::Matrix => "Matrix",
		}
	}

	pub fn clauses(self) -> &'static [FormClause] {
		match self {
			Self::Technique => &[FormClause::TECHNIQUE],
			Self::SubTechnique => &[FormClause::SUBTECHNIQUE],
			Self::Mitigation => &[FormClause::COURSE_OF_ACTION],
			Self::Group => &[FormClause::INTRUSION_SET],
			Self::Software => &[FormClause::MALWARE, FormClause::TOOL],
			Self::Campaign => &[FormClause::CAMPAIGN],
			Self::DataSource => &[FormClause::DATA_SOURCE],
			Self::DataComponent => &[FormClause::DATA_COMPONENT],
			Self::Asset => &[FormClause::ASSET],
			Self::Tactic => &[FormClause::TACTIC],
			Self::Matrix => &[FormClause::MATRIX],
		}
	}
}
impl fmt::Display for Form {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for Form {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let raw = raw.trim();

		Self::ALL
			.into_iter()
			.find(|form| form.as_str().eq_ignore_ascii_case(raw))
			.ok_or_else(|| format!("Unknown form {raw:?}."))
	}
}

/// An ingestible CTI source and everything the engine needs to know about its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnowledgeBase {
	AttackEnterprise,
	AttackMobile,
	AttackIcs,
	Cwe,
	Capec,
	Atlas,
	Location,
	Disarm,
	Sector,
}
impl KnowledgeBase {
	pub const ALL: [Self; 9] = [
		Self::AttackEnterprise,
		Self::AttackMobile,
		Self::AttackIcs,
		Self::Cwe,
		Self::Capec,
		Self::Atlas,
		Self::Location,
		Self::Disarm,
		Self::Sector,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::AttackEnterprise => "attack-enterprise",
			Self::AttackMobile => "attack-mobile",
			Self::AttackIcs => "attack-ics",
			Self::Cwe => "cwe",
			Self::Capec => "capec",
			Self::Atlas => "atlas",
			Self::Location => "location",
			Self::Disarm => "disarm",
			Self::Sector => "sector",
		}
	}

	pub fn collection(self) -> &'static str {
		match self {
			Self::AttackEnterprise => "mitre_attack_enterprise",
			Self::AttackMobile => "mitre_attack_mobile",
			Self::AttackIcs => "mitre_attack_ics",
			Self::Cwe => "mitre_cwe",
			Self::Capec => "mitre_capec",
			Self::Atlas => "mitre_atlas",
			Self::Location => "location",
			Self::Disarm => "disarm",
			Self::Sector => "sector",
		}
	}

	pub fn from_collection(collection: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|kb| kb.collection() == collection)
	}

	pub fn version_param(self) -> &'static str {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => "attack_version",
			Self::Cwe => "cwe_version",
			Self::Capec => "capec_version",
			Self::Atlas => "atlas_version",
			Self::Location => "location_version",
			Self::Disarm => "disarm_version",
			Self::Sector => "sector_version",
		}
	}

	pub fn domain_id_param(self) -> &'static str {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => "attack_id",
			Self::Cwe => "cwe_id",
			Self::Capec => "capec_id",
			Self::Atlas => "atlas_id",
			Self::Location => "location_id",
			Self::Disarm => "disarm_id",
			Self::Sector => "sector_id",
		}
	}

	pub fn object_types(self) -> &'static [&'static str] {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => ATTACK_TYPES,
			Self::Cwe => CWE_TYPES,
			Self::Capec => CAPEC_TYPES,
			Self::Atlas => ATLAS_TYPES,
			Self::Location => LOCATION_TYPES,
			Self::Disarm => DISARM_TYPES,
			Self::Sector => SECTOR_TYPES,
		}
	}

	pub fn forms(self) -> &'static [Form] {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => &Form::ALL,
			Self::Atlas => &[Form::Technique, Form::SubTechnique, Form::Mitigation, Form::Tactic],
			Self::Disarm => &[Form::Technique, Form::SubTechnique, Form::Tactic],
			Self::Cwe | Self::Capec | Self::Location | Self::Sector => &[],
		}
	}

	/// Sortable field names; `{field}_ascending` / `{field}_descending` are the accepted keys.
	pub fn sort_fields(self) -> &'static [&'static str] {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs =>
				&["modified", "created", "name", "attack_id"],
			Self::Cwe => &["modified", "created", "name", "cwe_id"],
			Self::Capec => &["modified", "created", "name", "capec_id"],
			Self::Atlas => &["modified", "created", "name", "atlas_id"],
			Self::Location => &["modified", "created", "name", "location_id", "location_type"],
			Self::Disarm => &["modified", "created", "name", "disarm_id"],
			Self::Sector => &["modified", "created", "name", "sector_id"],
		}
	}

	/// Array properties searched by the `alias` filter; empty when the filter is unsupported.
	pub fn alias_fields(self) -> &'static [&'static str] {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => ATTACK_ALIAS_FIELDS,
			Self::Sector => SECTOR_ALIAS_FIELDS,
			Self::Cwe | Self::Capec | Self::Atlas | Self::Location | Self::Disarm => &[],
		}
	}

	pub fn supports_alias(self) -> bool {
		!self.alias_fields().is_empty()
	}

	/// `source_name` of the external reference carrying the knowledge base's own domain ids.
	pub fn reference_source(self) -> &'static str {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => "mitre-attack",
			Self::Cwe => "cwe",
			Self::Capec => "capec",
			Self::Atlas => "mitre-atlas",
			Self::Location => "location2stix",
			Self::Disarm => "DISARM",
			Self::Sector => "sector2stix",
		}
	}

	/// File name of the bundle for `version` under the distribution root.
	pub fn bundle_filename(self, version: &VersionTag) -> String {
		let version = version.as_str();

		match self {
			Self::AttackEnterprise => format!("enterprise-attack-{version}.json"),
			Self::AttackMobile => format!("mobile-attack-{version}.json"),
			Self::AttackIcs => format!("ics-attack-{version}.json"),
			Self::Cwe => format!("cwe-bundle-v{version}.json"),
			Self::Capec => format!("stix-capec-v{version}.json"),
			Self::Atlas => format!("mitre-atlas-v{version}.json"),
			Self::Location => format!("location-bundle-v{version}.json"),
			Self::Disarm => format!("disarm-bundle-v{version}.json"),
			Self::Sector => format!("sector-bundle-v{version}.json"),
		}
	}

	pub fn job_type(self) -> JobType {
		match self {
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs => JobType::AttackUpdate,
			Self::Cwe => JobType::CweUpdate,
			Self::Capec => JobType::CapecUpdate,
			Self::Atlas => JobType::AtlasUpdate,
			Self::Location => JobType::LocationUpdate,
			Self::Disarm => JobType::DisarmUpdate,
			Self::Sector => JobType::SectorUpdate,
		}
	}

	/// Whether ingestion links techniques to their tactics after the write step.
	pub fn derives_technique_tactic(self) -> bool {
		matches!(
			self,
			Self::AttackEnterprise | Self::AttackMobile | Self::AttackIcs | Self::Atlas | Self::Disarm
		)
	}
}
impl fmt::Display for KnowledgeBase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}
impl FromStr for KnowledgeBase {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let raw = raw.trim();

		Self::ALL
			.into_iter()
			.find(|kb| kb.name().eq_ignore_ascii_case(raw))
			.ok_or_else(|| format!("Unknown knowledge base {raw:?}."))
	}
}

/// Every object type any knowledge base stores, sorted and deduplicated.
pub fn all_object_types() -> Vec<&'static str> {
	let mut types: Vec<&'static str> =
		KnowledgeBase::ALL.into_iter().flat_map(|kb| kb.object_types().iter().copied()).collect();

	types.sort_unstable();
	types.dedup();

	types
}

/// Cross-knowledge-base relationship generators run by processor jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorMode {
	CapecAttack,
	CweCapec,
}
impl ProcessorMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::CapecAttack => "capec-attack",
			Self::CweCapec => "cwe-capec",
		}
	}

	pub fn source(self) -> KnowledgeBase {
		match self {
			Self::CapecAttack => KnowledgeBase::Capec,
			Self::CweCapec => KnowledgeBase::Cwe,
		}
	}

	pub fn targets(self) -> &'static [KnowledgeBase] {
		match self {
			Self::CapecAttack => &[
				KnowledgeBase::AttackEnterprise,
				KnowledgeBase::AttackMobile,
				KnowledgeBase::AttackIcs,
			],
			Self::CweCapec => &[KnowledgeBase::Capec],
		}
	}

	/// `source_name` of the external references on source objects that point at targets.
	pub fn reference_source(self) -> &'static str {
		match self {
			Self::CapecAttack => "ATTACK",
			Self::CweCapec => "capec",
		}
	}

	pub fn relationship_type(self) -> &'static str {
		match self {
			Self::CapecAttack => "technique",
			Self::CweCapec => "exploited-using",
		}
	}
}
impl fmt::Display for ProcessorMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for ProcessorMode {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw.trim() {
			"capec-attack" => Ok(Self::CapecAttack),
			"cwe-capec" => Ok(Self::CweCapec),
			other => Err(format!("Unknown processor mode {other:?}.")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{Form, KnowledgeBase, ProcessorMode, all_object_types};
	use crate::job::JobType;
	use crate::version::VersionTag;

	#[test]
	fn names_round_trip_through_from_str() {
		for kb in KnowledgeBase::ALL {
			assert_eq!(kb.name().parse::<KnowledgeBase>(), Ok(kb));
			assert_eq!(KnowledgeBase::from_collection(kb.collection()), Some(kb));
		}

		assert!("attack".parse::<KnowledgeBase>().is_err());
	}

	#[test]
	fn bundle_filenames_use_stored_version() {
		let tag = VersionTag::parse("v16.0").expect("Expected version tag.");

		assert_eq!(KnowledgeBase::AttackEnterprise.bundle_filename(&tag), "enterprise-attack-16_0.json");
		assert_eq!(KnowledgeBase::Cwe.bundle_filename(&tag), "cwe-bundle-v16_0.json");
	}

	#[test]
	fn sector_is_a_full_catalog_entry() {
		let tag = VersionTag::parse("1.0").expect("Expected version tag.");
		let sector = KnowledgeBase::Sector;

		assert_eq!("sector".parse::<KnowledgeBase>(), Ok(sector));
		assert_eq!(sector.collection(), "sector");
		assert_eq!(sector.bundle_filename(&tag), "sector-bundle-v1_0.json");
		assert_eq!(sector.job_type(), JobType::SectorUpdate);
		assert_eq!(sector.domain_id_param(), "sector_id");
		assert_eq!(sector.version_param(), "sector_version");
		assert_eq!(sector.reference_source(), "sector2stix");
		assert_eq!(sector.alias_fields(), &["x_opencti_aliases"]);
		assert!(sector.supports_alias());
		assert!(!sector.derives_technique_tactic());
		assert!(sector.object_types().contains(&"identity"));
	}

	#[test]
	fn alias_support_follows_alias_fields() {
		assert_eq!(KnowledgeBase::AttackIcs.alias_fields(), &["aliases", "x_mitre_aliases"]);
		assert!(!KnowledgeBase::Capec.supports_alias());
		assert!(!KnowledgeBase::Location.supports_alias());
	}

	#[test]
	fn sort_fields_name_the_domain_id_parameter() {
		for kb in KnowledgeBase::ALL {
			assert!(kb.sort_fields().contains(&kb.domain_id_param()), "{kb}");
		}

		assert!(KnowledgeBase::Location.sort_fields().contains(&"location_type"));
		assert!(!KnowledgeBase::Cwe.sort_fields().contains(&"location_type"));
	}

	#[test]
	fn software_form_is_a_disjunction() {
		let clauses = Form::Software.clauses();

		assert_eq!(clauses.len(), 2);
		assert!(clauses.iter().all(|clause| clause.subtechnique.is_none()));
		assert_eq!("sub-technique".parse::<Form>(), Ok(Form::SubTechnique));
	}

	#[test]
	fn search_types_cover_every_catalog_entry() {
		let types = all_object_types();

		assert!(types.contains(&"weakness"));
		assert!(types.contains(&"location"));
		assert!(types.windows(2).all(|pair| pair[0] < pair[1]));
	}

	#[test]
	fn processor_modes_name_their_sources() {
		assert_eq!(ProcessorMode::CweCapec.source(), KnowledgeBase::Cwe);
		assert_eq!("capec-attack".parse::<ProcessorMode>(), Ok(ProcessorMode::CapecAttack));
	}
}
