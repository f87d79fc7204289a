use std::{cmp::Ordering, fmt, sync::LazyLock};

use regex::Regex;

/// Prefix every ingestion note written by a versioned knowledge-base update carries.
pub const NOTE_PREFIX: &str = "version=";

static SEGMENT_RE: LazyLock<Result<Regex, regex::Error>> =
	LazyLock::new(|| Regex::new(r"[0-9]+|[^0-9_.\-]+"));

/// A version in its stored form: no leading `v`, separators folded to `_` (e.g. `16_0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag(String);
impl VersionTag {
	/// Normalizes caller input such as `v16.0`, `16-0` or `16_0`. Returns `None` for blank input
	/// and for anything outside `[A-Za-z0-9._-]`, since the tag becomes part of a download path.
	pub fn parse(raw: &str) -> Option<Self> {
		let trimmed = raw.trim();
		let stripped = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);

		if stripped.is_empty() || !stripped.chars().all(is_version_char) {
			return None;
		}

		Some(Self(stripped.replace(['.', '-'], "_")))
	}

	pub fn from_note(note: &str) -> Option<Self> {
		note.strip_prefix(NOTE_PREFIX).and_then(Self::parse)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn ingestion_note(&self) -> String {
		format!("{NOTE_PREFIX}{}", self.0)
	}

	/// Dotted form shown to callers, e.g. `16_0` -> `16.0`.
	pub fn display(&self) -> String {
		self.0.replace('_', ".")
	}
}
impl fmt::Display for VersionTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
impl Ord for VersionTag {
	fn cmp(&self, other: &Self) -> Ordering {
		natural_cmp(&self.0, &other.0)
	}
}
impl PartialOrd for VersionTag {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

fn is_version_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
	/// A digit run without leading zeros; `""` is zero.
	Number(&'a str),
	Text(&'a str),
}
impl Ord for Segment<'_> {
	fn cmp(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Self::Number(a), Self::Number(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
			(Self::Text(a), Self::Text(b)) => a.cmp(b),
			// Pre-release labels sort below numeric components.
			(Self::Text(_), Self::Number(_)) => Ordering::Less,
			(Self::Number(_), Self::Text(_)) => Ordering::Greater,
		}
	}
}
impl PartialOrd for Segment<'_> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

fn segments(raw: &str) -> Vec<Segment<'_>> {
	let raw = raw.trim().strip_prefix(['v', 'V']).unwrap_or(raw.trim());
	let Ok(re) = SEGMENT_RE.as_ref() else {
		return Vec::new();
	};

	re.find_iter(raw)
		.map(|m| {
			let run = m.as_str();

			if run.starts_with(|c: char| c.is_ascii_digit()) {
				Segment::Number(run.trim_start_matches('0'))
			} else {
				Segment::Text(run)
			}
		})
		.collect()
}

/// Compares version strings by digit runs numerically and other runs lexically, so `15_1`
/// orders after `4_16`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
	segments(a).cmp(&segments(b))
}

/// Decodes distinct ingestion notes into dotted versions, newest first. Notes that are not
/// version notes are skipped.
pub fn sort_notes_descending<I, S>(notes: I) -> Vec<String>
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	let mut tags: Vec<VersionTag> =
		notes.into_iter().filter_map(|note| VersionTag::from_note(note.as_ref())).collect();

	tags.sort_by(|a, b| b.cmp(a));
	tags.dedup();

	tags.iter().map(VersionTag::display).collect()
}

/// The naturally newest version among `notes`.
pub fn newest_tag<I, S>(notes: I) -> Option<VersionTag>
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	notes.into_iter().filter_map(|note| VersionTag::from_note(note.as_ref())).max()
}
