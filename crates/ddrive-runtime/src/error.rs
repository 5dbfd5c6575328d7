use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing required environment variable {0}")]
	MissingVar(&'static str),

	#[error("environment variable {name} has an invalid value: {reason}")]
	InvalidValue { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Pg(#[from] miette::Report),

	#[error(transparent)]
	Store(#[from] ddrive_store::StoreError),

	#[error(transparent)]
	Backup(#[from] ddrive_backup::BackupError),
}
