/// Separator between the STIX type and the UUID of a semantic id.
pub const SEMANTIC_ID_SEPARATOR: &str = "--";

/// An identifier accepted wherever callers may pass an id. The form is decided once by the
/// presence of `--`; domain ids compare case-insensitively and are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParsedId {
	/// A framework identifier such as `CWE-242` or `T1021.005`.
	DomainId(String),
	/// A STIX id such as `attack-pattern--0a5231ec-41af-4a35-83d0-6bdf11f28c65`.
	SemanticId(String),
}
impl ParsedId {
	pub fn parse(raw: &str) -> Option<Self> {
		let raw = raw.trim();

		if raw.is_empty() {
			return None;
		}
		if raw.contains(SEMANTIC_ID_SEPARATOR) {
			Some(Self::SemanticId(raw.to_string()))
		} else {
			Some(Self::DomainId(raw.to_lowercase()))
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Self::DomainId(value) | Self::SemanticId(value) => value,
		}
	}
}

/// Splits a list of raw ids into (domain ids, semantic ids), dropping blanks.
pub fn partition_ids<I, S>(raw: I) -> (Vec<String>, Vec<String>)
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	let mut domain = Vec::new();
	let mut semantic = Vec::new();

	for id in raw.into_iter().filter_map(|id| ParsedId::parse(id.as_ref())) {
		match id {
			ParsedId::DomainId(value) => domain.push(value),
			ParsedId::SemanticId(value) => semantic.push(value),
		}
	}

	(domain, semantic)
}

/// The STIX type portion of a semantic id (`attack-pattern` for `attack-pattern--...`).
pub fn semantic_type(id: &str) -> Option<&str> {
	id.split_once(SEMANTIC_ID_SEPARATOR).map(|(kind, _)| kind)
}
