//! Environment-driven process configuration, loaded once at startup.
//!
//! A plain data struct with a `from_env` constructor, rather than
//! scattering `std::env::var` calls through the call sites that need them.

use std::{str::FromStr, time::Duration};

use crate::error::ConfigError;

fn require_var(name: &'static str) -> Result<String, ConfigError> {
	std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn optional_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
	match std::env::var(name) {
		Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
			name,
			reason: format!("could not parse {raw:?}"),
		}),
		Err(_) => Ok(default),
	}
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	/// `postgresql://` connection URL for the metadata store.
	pub database_url: String,

	/// Base URL of the chat service hosting the blob substrate channel.
	pub blob_base_url: String,

	/// Channel id durable bytes are attached to.
	pub blob_channel_id: String,

	/// Bearer token used to authenticate against the chat service.
	pub blob_token: String,

	/// How often the orphaned-blob sweep runs.
	pub orphan_sweep_interval: Duration,

	/// How often the recycle-bin purge sweep runs.
	pub recycle_bin_sweep_interval: Duration,

	/// Days a soft-deleted node survives before the recycle-bin sweep
	/// reaps it permanently.
	pub recycle_bin_retention_days: i64,

	/// Run the reconciler's sweeps in dry-run mode (log, don't delete).
	pub reconciler_dry_run: bool,
}

impl RuntimeConfig {
	/// Read and validate configuration from the process environment.
	/// `CONFIG_MISSING`-class errors surface here, at startup, never at
	/// request time.
	pub fn from_env() -> Result<Self, ConfigError> {
		Ok(Self {
			database_url: require_var("DDRIVE_DATABASE_URL")?,
			blob_base_url: require_var("DDRIVE_BLOB_BASE_URL")?,
			blob_channel_id: require_var("DDRIVE_BLOB_CHANNEL_ID")?,
			blob_token: require_var("DDRIVE_BLOB_TOKEN")?,
			orphan_sweep_interval: Duration::from_secs(optional_var("DDRIVE_ORPHAN_SWEEP_SECS", 3600)?),
			recycle_bin_sweep_interval: Duration::from_secs(optional_var("DDRIVE_RECYCLE_BIN_SWEEP_SECS", 3600)?),
			recycle_bin_retention_days: optional_var("DDRIVE_RECYCLE_BIN_RETENTION_DAYS", 30)?,
			reconciler_dry_run: optional_var("DDRIVE_RECONCILER_DRY_RUN", false)?,
		})
	}

	/// A config with every required field filled with harmless test values,
	/// for unit tests that only care about the optional fields.
	#[cfg(test)]
	pub fn test_defaults() -> Self {
		Self {
			database_url: "postgresql://localhost/test".into(),
			blob_base_url: "http://localhost".into(),
			blob_channel_id: "channel".into(),
			blob_token: "token".into(),
			orphan_sweep_interval: Duration::from_secs(3600),
			recycle_bin_sweep_interval: Duration::from_secs(3600),
			recycle_bin_retention_days: 30,
			reconciler_dry_run: false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_required_var_is_reported() {
		temp_env::with_vars_unset(
			["DDRIVE_DATABASE_URL", "DDRIVE_BLOB_BASE_URL", "DDRIVE_BLOB_CHANNEL_ID", "DDRIVE_BLOB_TOKEN"],
			|| {
				let err = RuntimeConfig::from_env().unwrap_err();
				assert!(matches!(err, ConfigError::MissingVar("DDRIVE_DATABASE_URL")));
			},
		);
	}

	#[test]
	fn optional_vars_fall_back_to_defaults() {
		temp_env::with_vars(
			[
				("DDRIVE_DATABASE_URL", Some("postgresql://localhost/d")),
				("DDRIVE_BLOB_BASE_URL", Some("http://localhost")),
				("DDRIVE_BLOB_CHANNEL_ID", Some("c")),
				("DDRIVE_BLOB_TOKEN", Some("t")),
				("DDRIVE_ORPHAN_SWEEP_SECS", None),
			],
			|| {
				let config = RuntimeConfig::from_env().unwrap();
				assert_eq!(config.orphan_sweep_interval, Duration::from_secs(3600));
				assert_eq!(config.recycle_bin_retention_days, 30);
			},
		);
	}

	#[test]
	fn invalid_numeric_var_is_reported() {
		temp_env::with_vars(
			[
				("DDRIVE_DATABASE_URL", Some("postgresql://localhost/d")),
				("DDRIVE_BLOB_BASE_URL", Some("http://localhost")),
				("DDRIVE_BLOB_CHANNEL_ID", Some("c")),
				("DDRIVE_BLOB_TOKEN", Some("t")),
				("DDRIVE_ORPHAN_SWEEP_SECS", Some("not-a-number")),
			],
			|| {
				let err = RuntimeConfig::from_env().unwrap_err();
				assert!(matches!(err, ConfigError::InvalidValue { name: "DDRIVE_ORPHAN_SWEEP_SECS", .. }));
			},
		);
	}
}
