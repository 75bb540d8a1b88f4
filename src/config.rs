//! Startup configuration
//!
//! The bridge reads the host's osquery-style JSON configuration file and
//! consumes one section of it: `bro`. The only mandatory option is
//! `bro_endpoint` (`<host>:<port>` of the monitor-side broker); everything
//! else has defaults. The raw file content is kept so schedule updates can
//! be pushed back merged with the untouched static configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sink::RetryPolicy;

/// Default interval for installed recurring queries, in seconds.
const DEFAULT_SCHEDULE_INTERVAL: u64 = 10;

/// Errors raised while loading the startup configuration. All of them are
/// fatal: the bridge cannot run without a broker endpoint.
#[derive(Error, Debug)]
pub enum ConfigError {
	/// Config file could not be read
	#[error("cannot read config file: {0}")]
	Io(#[from] std::io::Error),

	/// Config file is not valid JSON
	#[error("cannot parse config file: {0}")]
	Parse(#[from] serde_json::Error),

	/// `bro.bro_endpoint` option is absent
	#[error(
		"specify 'bro_endpoint' in the format '<host>:<port>' under 'bro' \
		 in the osquery config file"
	)]
	MissingEndpoint,

	/// `bro.bro_endpoint` is not `<host>:<port>`
	#[error("malformed 'bro_endpoint' value '{0}', expected '<host>:<port>'")]
	MalformedEndpoint(String),
}

/// The `bro` section as it appears on disk.
#[derive(Debug, Deserialize, Default)]
struct BroSection {
	bro_endpoint: Option<String>,
	#[serde(default)]
	groups: Vec<String>,
	schedule_interval: Option<u64>,
	connect_retries: Option<u32>,
	connect_backoff_ms: Option<u64>,
	sink_retries: Option<u32>,
	sink_backoff_ms: Option<u64>,
}

/// Top-level config file; sections other than `bro` pass through untouched.
#[derive(Debug, Deserialize)]
struct ConfigFile {
	#[serde(default)]
	bro: BroSection,
}

/// Address of the monitor-side broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
	/// Hostname or IP of the broker
	pub host: String,
	/// TCP port of the broker
	pub port: u16,
}

impl std::fmt::Display for BrokerAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Validated startup configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
	/// Broker address from `bro.bro_endpoint`
	pub endpoint: BrokerAddr,
	/// Group memberships of this host, read once at startup
	pub groups: Vec<String>,
	/// Interval assigned to installed recurring queries
	pub schedule_interval: u64,
	/// Retry budget for the initial broker peering
	pub connect_retry: RetryPolicy,
	/// Retry budget for result/config sink deliveries
	pub sink_retry: RetryPolicy,
	raw: String,
}

impl BridgeConfig {
	/// Loads and validates the config file at `path`.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		Self::parse(fs::read_to_string(path)?)
	}

	/// Parses a config file body.
	pub fn parse(raw: String) -> Result<Self, ConfigError> {
		let file: ConfigFile = serde_json::from_str(&raw)?;
		let bro = file.bro;
		let endpoint = parse_endpoint(
			bro.bro_endpoint.as_deref().ok_or(ConfigError::MissingEndpoint)?,
		)?;
		let connect_retry = RetryPolicy::new(
			bro.connect_retries.unwrap_or(3),
			Duration::from_millis(bro.connect_backoff_ms.unwrap_or(500)),
		);
		let sink_retry = RetryPolicy::new(
			bro.sink_retries.unwrap_or(5),
			Duration::from_millis(bro.sink_backoff_ms.unwrap_or(100)),
		);
		Ok(Self {
			endpoint,
			groups: bro.groups,
			schedule_interval: bro
				.schedule_interval
				.unwrap_or(DEFAULT_SCHEDULE_INTERVAL),
			connect_retry,
			sink_retry,
			raw,
		})
	}

	/// The unmodified config file body, for write-back merging.
	pub fn raw(&self) -> &str {
		&self.raw
	}
}

/// Splits `<host>:<port>`, tolerating bracketed IPv6 hosts.
fn parse_endpoint(value: &str) -> Result<BrokerAddr, ConfigError> {
	let malformed = || ConfigError::MalformedEndpoint(value.to_owned());
	let (host, port) = value.rsplit_once(':').ok_or_else(malformed)?;
	let host = host.trim_matches(['[', ']']);
	if host.is_empty() {
		return Err(malformed());
	}
	let port = port.parse::<u16>().map_err(|_| malformed())?;
	Ok(BrokerAddr {
		host: host.to_owned(),
		port,
	})
}
