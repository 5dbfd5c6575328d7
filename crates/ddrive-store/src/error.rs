use thiserror::Error;

/// SQLSTATE for a unique-constraint violation.
const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Errors surfaced by the metadata store.
///
/// Unique-constraint races surface as the typed [`StoreError::UniqueViolation`]
/// variant instead of a raw SQLSTATE a caller would have to match on.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("no row found")]
	NotFound,

	#[error("unique constraint {constraint:?} violated")]
	UniqueViolation { constraint: Option<String> },

	#[error("database connection error: {0}")]
	Pool(#[from] mobc::Error<crate::pool::PgError>),

	#[error("database error: {0}")]
	Db(#[from] tokio_postgres::Error),

	#[error("row decode error: {0}")]
	Decode(String),
}

impl StoreError {
	/// Classify a raw `tokio_postgres` error, turning SQLSTATE 23505 into
	/// [`StoreError::UniqueViolation`] so callers can `match` on it directly
	/// instead of inspecting error internals at every call site.
	pub fn from_db(err: tokio_postgres::Error) -> Self {
		if let Some(db_err) = err.as_db_error() {
			if db_err.code().code() == UNIQUE_VIOLATION_CODE {
				return StoreError::UniqueViolation {
					constraint: db_err.constraint().map(str::to_owned),
				};
			}
		}
		StoreError::Db(err)
	}
}
