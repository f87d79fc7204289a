use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub query: Query,
	#[serde(default)]
	pub bundle: Bundle,
	pub distribution: Distribution,
	pub worker: Worker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Query {
	#[serde(default = "default_page_size")]
	pub default_page_size: u32,
	#[serde(default = "default_page_size")]
	pub max_page_size: u32,
	/// Page numbers above this are rejected instead of scanning a huge offset.
	#[serde(default = "default_max_page_number")]
	pub max_page_number: u32,
}

/// TLP 1.0 and 2.0 AMBER / AMBER+STRICT / RED marking definitions.
pub const RESTRICTED_TLP_MARKINGS: [&str; 5] = [
	"marking-definition--f88d31f6-486f-44da-b317-01333bde0b82",
	"marking-definition--5e57c739-391a-4eb3-b6be-7d15ca92d5ed",
	"marking-definition--55d920b0-5e8b-4f79-9ee9-91f868d9b421",
	"marking-definition--939a9414-2ddd-4d32-a0cd-375ea402b003",
	"marking-definition--e828b379-4e03-4974-9ac4-e53a884c97c1",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
	/// Semantic ids never returned as part of the shared baseline set.
	#[serde(default = "default_baseline_deny_ids")]
	pub baseline_deny_ids: Vec<String>,
}
impl Default for Bundle {
	fn default() -> Self {
		Self { baseline_deny_ids: default_baseline_deny_ids() }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Distribution {
	pub timeout_ms: u64,
	/// Knowledge-base name (e.g. "attack-enterprise") to the HTTP root holding its bundles.
	pub roots: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Worker {
	pub concurrency: u32,
	pub poll_interval_ms: u64,
	pub temp_root: String,
}

fn default_page_size() -> u32 {
	50
}

fn default_baseline_deny_ids() -> Vec<String> {
	RESTRICTED_TLP_MARKINGS.iter().map(|id| id.to_string()).collect()
}

fn default_max_page_number() -> u32 {
	10_000
}
