//! Client for the HTTP bundle distribution endpoint. Every request is a single attempt.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	time::Duration,
};

use reqwest::{Client, Response, Url};

use threatkb_domain::{KnowledgeBase, VersionTag};

use crate::{BoxFuture, Error, Result};

const VERSION_INDEX: &str = "version.txt";

/// Source of bundle files and of the versions a distribution root publishes.
pub trait BundleSource: Send + Sync {
	/// Downloads the bundle of `version` into `dest_dir` and returns the written file.
	fn fetch_bundle<'a>(
		&'a self,
		kb: KnowledgeBase,
		version: &'a VersionTag,
		dest_dir: &'a Path,
	) -> BoxFuture<'a, Result<PathBuf>>;

	/// Versions listed in the root's `version.txt`, in file order.
	fn available_versions<'a>(&'a self, kb: KnowledgeBase) -> BoxFuture<'a, Result<Vec<String>>>;
}

pub struct HttpDistribution {
	client: Client,
	roots: BTreeMap<String, Url>,
}
impl HttpDistribution {
	pub fn new(cfg: &threatkb_config::Distribution) -> Result<Self> {
		let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
		let mut roots = BTreeMap::new();

		for (name, raw) in &cfg.roots {
			let url = Url::parse(raw).map_err(|err| Error::InvalidUrl {
				message: format!("distribution.roots.{name} is not a valid URL: {err}."),
			})?;

			roots.insert(name.clone(), url);
		}

		Ok(Self { client, roots })
	}

	fn root(&self, kb: KnowledgeBase) -> Result<&Url> {
		self.roots.get(kb.name()).ok_or_else(|| Error::InvalidUrl {
			message: format!("No distribution root is configured for {kb}."),
		})
	}

	async fn get(&self, url: Url) -> Result<Response> {
		let response = self.client.get(url.clone()).send().await?;
		let status = response.status();

		if !status.is_success() {
			return Err(Error::Status { url: url.to_string(), status: status.as_u16() });
		}

		Ok(response)
	}
}
impl BundleSource for HttpDistribution {
	fn fetch_bundle<'a>(
		&'a self,
		kb: KnowledgeBase,
		version: &'a VersionTag,
		dest_dir: &'a Path,
	) -> BoxFuture<'a, Result<PathBuf>> {
		Box::pin(async move {
			let url = bundle_url(self.root(kb)?, kb, version)?;

			tracing::info!(knowledge_base = %kb, %url, "Downloading bundle.");

			let response = self.get(url).await?;
			let filename = response
				.url()
				.path_segments()
				.and_then(|mut segments| segments.next_back())
				.filter(|segment| !segment.is_empty())
				.map(str::to_string)
				.unwrap_or_else(|| kb.bundle_filename(version));
			let body = response.bytes().await?;
			let path = dest_dir.join(filename);

			tokio::fs::create_dir_all(dest_dir).await?;
			tokio::fs::write(&path, &body).await?;

			tracing::info!(knowledge_base = %kb, path = %path.display(), bytes = body.len(), "Downloaded bundle.");

			Ok(path)
		})
	}

	fn available_versions<'a>(&'a self, kb: KnowledgeBase) -> BoxFuture<'a, Result<Vec<String>>> {
		Box::pin(async move {
			let url = join(self.root(kb)?, VERSION_INDEX)?;
			let body = self.get(url).await?.text().await?;

			Ok(parse_version_index(&body))
		})
	}
}

/// URL of the bundle file of `version` under `root`.
pub fn bundle_url(root: &Url, kb: KnowledgeBase, version: &VersionTag) -> Result<Url> {
	join(root, &kb.bundle_filename(version))
}

/// Non-empty trimmed lines of a `version.txt` body.
pub fn parse_version_index(body: &str) -> Vec<String> {
	body.lines().map(str::trim).filter(|line| !line.is_empty()).map(str::to_string).collect()
}

fn join(root: &Url, file: &str) -> Result<Url> {
	root.join(file).map_err(|err| Error::InvalidUrl {
		message: format!("Cannot join {file:?} onto {root}: {err}."),
	})
}
