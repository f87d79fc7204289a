pub mod bundle;
pub mod ingest;
pub mod objects;
pub mod page;
pub mod relationships;
pub mod search;
pub mod versions;

mod error;

pub use bundle::BundleFilter;
pub use error::{Error, ErrorBody, Result};
pub use ingest::{JobListFilter, ProcessorRequest, UpdateRequest};
pub use objects::{ObjectFilter, ObjectLookup};
pub use page::{Page, PageRequest};
pub use relationships::{Direction, RelationshipFilter};
pub use search::SearchFilter;
pub use versions::{HistoryGroup, VersionResolver, VersionSource, Versions};

use std::{future::Future, pin::Pin, sync::Arc};

use threatkb_config::Config;
use threatkb_providers::distribution::{BundleSource, HttpDistribution};
use threatkb_storage::{db::Db, jobs::JobStore};

use crate::bundle::BaselineCache;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The query and ingestion-trigger surface over every knowledge base.
pub struct KbService {
	pub cfg: Config,
	pub db: Db,
	pub versions: VersionResolver,
	pub distribution: Arc<dyn BundleSource>,
	pub jobs: Arc<dyn JobStore>,
	baseline: BaselineCache,
}
impl KbService {
	pub fn new(
		cfg: Config,
		db: Db,
		distribution: Arc<dyn BundleSource>,
		jobs: Arc<dyn JobStore>,
	) -> Self {
		let versions = VersionResolver::new(Arc::new(db.clone()));

		Self { cfg, db, versions, distribution, jobs, baseline: BaselineCache::default() }
	}

	/// Wires the Postgres job store and the HTTP distribution client.
	pub fn with_defaults(cfg: Config, db: Db) -> Result<Self> {
		let distribution = Arc::new(HttpDistribution::new(&cfg.distribution)?);
		let jobs = Arc::new(db.clone());

		Ok(Self::new(cfg, db, distribution, jobs))
	}
}
