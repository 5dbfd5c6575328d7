//! The in-memory shape of a running backup task, and the bounded run-history
//! ring the access surface reports from.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Connecting,
	Scanning,
	Downloading,
	Archiving,
	Uploading,
	Complete,
}

#[derive(Debug, Clone)]
pub struct Progress {
	pub phase: Phase,
	pub files_processed: u64,
	pub total_files: u64,
	pub total_bytes: u64,
	pub estimated_total_bytes: u64,
	pub reconnects: u32,
	pub start_time: DateTime<Utc>,
	pub current_dir: String,
}

impl Progress {
	pub fn new(start_time: DateTime<Utc>) -> Self {
		Self {
			phase: Phase::Connecting,
			files_processed: 0,
			total_files: 0,
			total_bytes: 0,
			estimated_total_bytes: 0,
			reconnects: 0,
			start_time,
			current_dir: String::new(),
		}
	}
}

/// A handle shared between the run loop and any observer (the cancellation
/// caller, the stale-state watchdog). Cheap to clone; all mutation goes
/// through the inner lock.
#[derive(Clone)]
pub struct RunHandle {
	cancelled: Arc<AtomicBool>,
	progress: Arc<tokio::sync::RwLock<Progress>>,
	pub tmp_dir: std::path::PathBuf,
}

impl RunHandle {
	pub fn new(tmp_dir: std::path::PathBuf, start_time: DateTime<Utc>) -> Self {
		Self {
			cancelled: Arc::new(AtomicBool::new(false)),
			progress: Arc::new(tokio::sync::RwLock::new(Progress::new(start_time))),
			tmp_dir,
		}
	}

	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// Returns `Err(BackupError::Cancelled)` if the run has been flagged for
	/// cancellation; callers check this at every file boundary and before
	/// every retry.
	pub fn check_cancelled(&self) -> Result<(), crate::error::BackupError> {
		if self.is_cancelled() {
			Err(crate::error::BackupError::Cancelled)
		} else {
			Ok(())
		}
	}

	pub async fn set_phase(&self, phase: Phase) {
		self.progress.write().await.phase = phase;
	}

	pub async fn set_scan_totals(&self, total_files: u64, estimated_total_bytes: u64) {
		let mut progress = self.progress.write().await;
		progress.total_files = total_files;
		progress.estimated_total_bytes = estimated_total_bytes;
	}

	pub async fn record_file(&self, bytes: u64, current_dir: &str) {
		let mut progress = self.progress.write().await;
		progress.files_processed += 1;
		progress.total_bytes += bytes;
		progress.current_dir = current_dir.to_string();
	}

	pub async fn record_reconnect(&self) {
		self.progress.write().await.reconnects += 1;
	}

	pub async fn snapshot(&self) -> Progress {
		self.progress.read().await.clone()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
	Success,
	Cancelled,
	Failed,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
	pub finished_at: DateTime<Utc>,
	pub outcome: RunOutcome,
	pub bytes_transferred: u64,
}

/// Bounded ring of the last `CAPACITY` run outcomes for one task, kept for
/// the access surface to report (not persisted — the store already keeps
/// `lastRun`/`lastRuntime`, this is the supplemented richer history).
pub struct RunHistory {
	capacity: usize,
	records: std::collections::VecDeque<RunRecord>,
}

impl RunHistory {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			records: std::collections::VecDeque::with_capacity(capacity),
		}
	}

	pub fn push(&mut self, record: RunRecord) {
		if self.records.len() == self.capacity {
			self.records.pop_front();
		}
		self.records.push_back(record);
	}

	pub fn recent(&self) -> Vec<RunRecord> {
		self.records.iter().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn cancel_flag_is_observed_by_check_cancelled() {
		let handle = RunHandle::new(std::path::PathBuf::from("/tmp"), Utc::now());
		assert!(handle.check_cancelled().is_ok());
		handle.cancel();
		assert!(handle.check_cancelled().is_err());
	}

	#[test]
	fn history_ring_drops_oldest_beyond_capacity() {
		let mut history = RunHistory::new(2);
		for i in 0..3 {
			history.push(RunRecord {
				finished_at: Utc::now(),
				outcome: RunOutcome::Success,
				bytes_transferred: i,
			});
		}
		let recent = history.recent();
		assert_eq!(recent.len(), 2);
		assert_eq!(recent[0].bytes_transferred, 1);
		assert_eq!(recent[1].bytes_transferred, 2);
	}
}
