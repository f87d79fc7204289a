//! 1-based pagination and the paged response envelope.

use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap as _};

use threatkb_storage::query::Window;

use crate::{Error, Result};

/// Caller-supplied paging; omitted values fall back to the configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
	#[serde(default)]
	pub page: Option<u32>,
	#[serde(default)]
	pub page_size: Option<u32>,
}

/// A validated page: `number >= 1`, `1 <= size <= max_page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
	pub number: u32,
	pub size: u32,
}
impl PageWindow {
	pub fn resolve(request: PageRequest, cfg: &threatkb_config::Query) -> Result<Self> {
		let number = request.page.unwrap_or(1);

		if number == 0 {
			return Err(Error::validation("page must be 1 or greater."));
		}
		if number > cfg.max_page_number {
			return Err(Error::validation(format!(
				"page must not exceed {}.",
				cfg.max_page_number
			)));
		}

		let size = request.page_size.unwrap_or(cfg.default_page_size);

		if size == 0 {
			return Err(Error::validation("page_size must be 1 or greater."));
		}

		Ok(Self { number, size: size.min(cfg.max_page_size) })
	}

	pub fn offset(self) -> i64 {
		i64::from(self.number - 1) * i64::from(self.size)
	}

	pub fn window(self) -> Window {
		Window { limit: i64::from(self.size), offset: self.offset() }
	}

	/// Cuts this page out of an already materialized result list.
	pub fn slice<T>(self, items: Vec<T>) -> Vec<T> {
		let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);

		items.into_iter().skip(offset).take(self.size as usize).collect()
	}
}

/// One page of results, serialized as
/// `{page_size, page_number, page_results_count, total_results_count, <container>: [...]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
	pub page_size: u32,
	pub page_number: u32,
	pub total_results_count: i64,
	pub container: &'static str,
	pub results: Vec<T>,
}
impl<T> Page<T> {
	pub fn new(window: PageWindow, total_results_count: i64, container: &'static str, results: Vec<T>) -> Self {
		Self {
			page_size: window.size,
			page_number: window.number,
			total_results_count,
			container,
			results,
		}
	}

	pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
		Page {
			page_size: self.page_size,
			page_number: self.page_number,
			total_results_count: self.total_results_count,
			container: self.container,
			results: self.results.into_iter().map(f).collect(),
		}
	}
}
impl<T> Serialize for Page<T>
where
	T: Serialize,
{
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		let mut map = serializer.serialize_map(Some(5))?;

		map.serialize_entry("page_size", &self.page_size)?;
		map.serialize_entry("page_number", &self.page_number)?;
		map.serialize_entry("page_results_count", &self.results.len())?;
		map.serialize_entry("total_results_count", &self.total_results_count)?;
		map.serialize_entry(self.container, &self.results)?;
		map.end()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::{Page, PageRequest, PageWindow};

	fn cfg() -> threatkb_config::Query {
		threatkb_config::Query { default_page_size: 50, max_page_size: 200, max_page_number: 100 }
	}

	#[test]
	fn defaults_and_caps_page_size() {
		let window = PageWindow::resolve(PageRequest::default(), &cfg()).expect("Failed to resolve.");

		assert_eq!(window, PageWindow { number: 1, size: 50 });

		let window = PageWindow::resolve(PageRequest { page: Some(3), page_size: Some(1_000) }, &cfg())
			.expect("Failed to resolve.");

		assert_eq!(window, PageWindow { number: 3, size: 200 });
		assert_eq!(window.offset(), 400);
	}

	#[test]
	fn rejects_out_of_range_pages_instead_of_clamping() {
		let too_far = PageWindow::resolve(PageRequest { page: Some(101), page_size: None }, &cfg());
		let zero = PageWindow::resolve(PageRequest { page: Some(0), page_size: None }, &cfg());
		let empty = PageWindow::resolve(PageRequest { page: None, page_size: Some(0) }, &cfg());

		assert_eq!(too_far.map_err(|err| err.code()).err(), Some(400));
		assert_eq!(zero.map_err(|err| err.code()).err(), Some(400));
		assert_eq!(empty.map_err(|err| err.code()).err(), Some(400));
	}

	#[test]
	fn slices_materialized_results() {
		let window = PageWindow { number: 2, size: 2 };

		assert_eq!(window.slice(vec![1, 2, 3, 4, 5]), vec![3, 4]);
		assert!(PageWindow { number: 4, size: 2 }.slice(vec![1, 2, 3]).is_empty());
	}

	#[test]
	fn envelope_uses_the_container_key() {
		let page = Page::new(PageWindow { number: 1, size: 2 }, 7, "relationships", vec!["a", "b"]);

		assert_eq!(
			serde_json::to_value(&page).expect("Failed to serialize page."),
			json!({
				"page_size": 2,
				"page_number": 1,
				"page_results_count": 2,
				"total_results_count": 7,
				"relationships": ["a", "b"]
			})
		);
	}
}
