pub mod derive;
pub mod pipeline;
pub mod worker;

mod error;

pub use error::{Error, Result};

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use threatkb_cli::ConfigArgs;
use threatkb_providers::distribution::HttpDistribution;
use threatkb_storage::db::Db;

use crate::pipeline::Pipeline;

#[derive(Debug, Parser)]
#[command(
	version = threatkb_cli::VERSION,
	rename_all = "kebab",
	styles = threatkb_cli::styles(),
)]
pub struct Args {
	#[command(flatten)]
	pub config: ConfigArgs,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = threatkb_config::load(&args.config.config)?;

	init_tracing(&config);

	let db = Arc::new(Db::connect(&config.storage.postgres).await?);

	db.ensure_schema().await?;

	let distribution = Arc::new(HttpDistribution::new(&config.distribution)?);
	let pipeline = Pipeline {
		objects: db.clone(),
		jobs: db,
		distribution,
		temp_root: PathBuf::from(&config.worker.temp_root),
	};

	worker::run_worker(Arc::new(pipeline), &config.worker).await?;

	Ok(())
}

fn init_tracing(config: &threatkb_config::Config) {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}
