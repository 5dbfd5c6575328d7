use ddrive_blob::BlobError;
use ddrive_crypto::CryptoError;
use ddrive_store::StoreError;
use thiserror::Error;

/// The error taxonomy collapsed onto one enum since every component
/// in this crate ultimately answers to the same access surface.
#[derive(Debug, Error)]
pub enum ChunkError {
	#[error("not found")]
	NotFound,

	#[error("target name already in use")]
	NameConflict,

	#[error("could not find a free name after retrying")]
	NamespaceRace,

	#[error("cannot move a directory into its own subtree")]
	Cycle,

	#[error("permission denied")]
	PermissionDenied,

	#[error("range not satisfiable")]
	RangeUnsatisfiable,

	#[error("chunk failed to decrypt")]
	CryptoAuthFail,

	#[error("backup task cancelled")]
	Cancelled,

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Blob(#[from] BlobError),

	#[error("local I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// A block handed to the crypto primitive exceeded its effective size.
	/// The engine always slices blocks to `EFFECTIVE_CHUNK_SIZE` before
	/// encrypting, so seeing this means a block-size invariant broke
	/// upstream, not a user-triggerable condition.
	#[error("internal chunking error: {0}")]
	Internal(String),
}

impl From<CryptoError> for ChunkError {
	fn from(err: CryptoError) -> Self {
		match err {
			CryptoError::AuthenticationFailed => ChunkError::CryptoAuthFail,
			CryptoError::PlaintextTooLarge(n) => {
				ChunkError::Internal(format!("block of {n} bytes exceeds effective chunk size"))
			}
		}
	}
}
