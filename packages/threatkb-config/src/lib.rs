mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Bundle, Config, Distribution, Postgres, Query, RESTRICTED_TLP_MARKINGS, Service, Storage, Worker,
};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.postgres.dsn must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.query.max_page_size == 0 {
		return Err(Error::Validation {
			message: "query.max_page_size must be greater than zero.".to_string(),
		});
	}
	if cfg.query.default_page_size == 0 {
		return Err(Error::Validation {
			message: "query.default_page_size must be greater than zero.".to_string(),
		});
	}
	if cfg.query.default_page_size > cfg.query.max_page_size {
		return Err(Error::Validation {
			message: "query.default_page_size must not exceed query.max_page_size.".to_string(),
		});
	}
	if cfg.query.max_page_number == 0 {
		return Err(Error::Validation {
			message: "query.max_page_number must be greater than zero.".to_string(),
		});
	}
	if cfg.distribution.timeout_ms == 0 {
		return Err(Error::Validation {
			message: "distribution.timeout_ms must be greater than zero.".to_string(),
		});
	}

	for (name, root) in &cfg.distribution.roots {
		if !(root.starts_with("http://") || root.starts_with("https://")) {
			return Err(Error::Validation {
				message: format!("distribution.roots.{name} must be an http(s) URL."),
			});
		}
	}

	if cfg.worker.concurrency == 0 {
		return Err(Error::Validation {
			message: "worker.concurrency must be greater than zero.".to_string(),
		});
	}
	if cfg.worker.poll_interval_ms == 0 {
		return Err(Error::Validation {
			message: "worker.poll_interval_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.worker.temp_root.trim().is_empty() {
		return Err(Error::Validation {
			message: "worker.temp_root must be non-empty.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	for root in cfg.distribution.roots.values_mut() {
		let trimmed = root.trim();

		*root = if trimmed.ends_with('/') { trimmed.to_string() } else { format!("{trimmed}/") };
	}

	cfg.bundle.baseline_deny_ids.retain(|id| !id.trim().is_empty());
}
