use ddrive_core::ChunkError;
use ddrive_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the backup task queue and runner.
#[derive(Debug, Error)]
pub enum BackupError {
	#[error("task {0} not found")]
	TaskNotFound(uuid::Uuid),

	#[error("invalid cron expression {expr:?}: {source}")]
	InvalidCron {
		expr: String,
		#[source]
		source: cron::error::Error,
	},

	#[error("sftp connection failed: {message}")]
	Connect { message: String, retryable: bool },

	#[error("sftp operation failed after exhausting reconnection attempts: {0}")]
	SftpExhausted(String),

	#[error("sftp: {message}")]
	Sftp { message: String, retryable: bool },

	#[error("archive writer error: {0}")]
	Archive(String),

	#[error("run was cancelled")]
	Cancelled,

	#[error("local staging error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Chunk(#[from] ChunkError),
}

impl BackupError {
	/// Wrap a `russh`/`russh-keys`/`russh-sftp` failure from the connect
	/// phase, classifying whether it looks like a dropped transport.
	pub(crate) fn connect<E: std::error::Error + 'static>(err: E) -> Self {
		BackupError::Connect {
			retryable: looks_like_dropped_connection(&err),
			message: err.to_string(),
		}
	}

	/// As [`Self::connect`], for a connect-phase failure with no underlying
	/// library error to classify (never reconnection-eligible).
	pub(crate) fn connect_message(message: impl Into<String>) -> Self {
		BackupError::Connect { message: message.into(), retryable: false }
	}

	/// Wrap a failure from an established SFTP session, classifying whether
	/// it looks like a dropped transport.
	pub(crate) fn sftp<E: std::error::Error + 'static>(err: E) -> Self {
		BackupError::Sftp {
			retryable: looks_like_dropped_connection(&err),
			message: err.to_string(),
		}
	}

	/// As [`Self::sftp`], for a protocol-level failure (e.g. a non-zero exec
	/// exit status) that has no underlying library error to classify.
	pub(crate) fn sftp_message(message: impl Into<String>) -> Self {
		BackupError::Sftp { message: message.into(), retryable: false }
	}

	/// Whether [`crate::sftp::with_reconnect`] should reconnect and retry
	/// after this error rather than give up immediately.
	pub fn is_reconnect_eligible(&self) -> bool {
		matches!(
			self,
			BackupError::Connect { retryable: true, .. } | BackupError::Sftp { retryable: true, .. }
		)
	}
}

/// Inspect `err` and its `source()` chain for signs of a dropped transport:
/// an explicit `russh::Error::Disconnect`, or an underlying `io::Error`
/// whose `ErrorKind` indicates the connection went away mid-operation.
/// `russh`/`russh-sftp` don't use Node.js-style string error codes, so this
/// walks the real error chain instead of matching borrowed code strings.
fn looks_like_dropped_connection<E: std::error::Error + 'static>(err: &E) -> bool {
	let root: &(dyn std::error::Error + 'static) = err;

	if let Some(russh_err) = root.downcast_ref::<russh::Error>() {
		if matches!(russh_err, russh::Error::Disconnect) {
			return true;
		}
	}

	let mut current = Some(root);
	while let Some(e) = current {
		if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
			if is_disconnect_io_kind(io_err.kind()) {
				return true;
			}
		}
		current = e.source();
	}
	false
}

fn is_disconnect_io_kind(kind: std::io::ErrorKind) -> bool {
	matches!(
		kind,
		std::io::ErrorKind::ConnectionReset
			| std::io::ErrorKind::ConnectionAborted
			| std::io::ErrorKind::BrokenPipe
			| std::io::ErrorKind::NotConnected
			| std::io::ErrorKind::UnexpectedEof
			| std::io::ErrorKind::TimedOut
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disconnect_io_error_is_reconnect_eligible() {
		let io_err = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
		let err = BackupError::connect(io_err);
		assert!(err.is_reconnect_eligible());
	}

	#[test]
	fn not_found_io_error_is_not_reconnect_eligible() {
		let io_err = std::io::Error::from(std::io::ErrorKind::NotFound);
		let err = BackupError::sftp(io_err);
		assert!(!err.is_reconnect_eligible());
	}

	#[test]
	fn plain_messages_are_not_reconnect_eligible() {
		assert!(!BackupError::connect_message("no usable credentials").is_reconnect_eligible());
		assert!(!BackupError::sftp_message("exec exited with status 1").is_reconnect_eligible());
	}
}
