#![deny(rust_2018_idioms)]

//! The cron-driven task queue and SFTP backup runner: the third pillar of
//! the storage core, alongside the chunk engine and namespace manager in
//! `ddrive-core`.

pub mod archive;
pub mod error;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod sftp;

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use ddrive_blob::BlobAdapter;
use ddrive_store::MetadataStore;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

pub use error::BackupError;
pub use progress::{Phase, Progress, RunOutcome, RunRecord};
pub use queue::TaskQueue;
pub use runner::BackupRunner;
pub use scheduler::Scheduler;

/// The process-wide backup subsystem: one [`TaskQueue`], one [`Scheduler`]
/// waking it on cron, one worker draining it, and the in-memory `running`
/// map. Constructed once and threaded through the
/// process by `ddrive-runtime::Runtime`.
pub struct BackupService {
	store: MetadataStore,
	queue: TaskQueue,
	scheduler: Scheduler,
	runner: Arc<BackupRunner>,
	running: Arc<RwLock<HashMap<Uuid, progress::RunHandle>>>,
	history: Arc<RwLock<HashMap<Uuid, progress::RunHistory>>>,
	worker: Arc<RwLock<Option<JoinHandle<()>>>>,
}

const RUN_HISTORY_CAPACITY: usize = 20;

impl BackupService {
	pub fn new(store: MetadataStore, blob: Arc<dyn BlobAdapter>) -> Self {
		let queue = TaskQueue::new();
		let scheduler = Scheduler::new(store.clone(), queue.clone());
		let runner = Arc::new(BackupRunner::new(store.clone(), blob));
		Self {
			store,
			queue,
			scheduler,
			runner,
			running: Arc::new(RwLock::new(HashMap::new())),
			history: Arc::new(RwLock::new(HashMap::new())),
			worker: Arc::new(RwLock::new(None)),
		}
	}

	/// Load enabled tasks, start their cron wakeups, the stale-state
	/// watchdog, and the single worker that drains the queue.
	pub async fn start(&self) -> Result<(), BackupError> {
		self.scheduler.reload().await?;
		self.scheduler.start_watchdog().await;

		let queue = self.queue.clone();
		let store = self.store.clone();
		let runner = self.runner.clone();
		let running = self.running.clone();
		let history = self.history.clone();

		let handle = tokio::spawn(async move {
			worker_loop(queue, store, runner, running, history).await;
		});
		*self.worker.write().await = Some(handle);
		info!("backup worker started");
		Ok(())
	}

	/// Cancel cron entries and the watchdog, wait for the in-flight task (if
	/// any) to observe its cancel flag and exit, then stop the worker.
	pub async fn stop(&self) {
		self.scheduler.shutdown().await;

		let in_flight: Vec<_> = self.running.read().await.values().cloned().collect();
		for handle in in_flight {
			handle.cancel();
		}
		// Give the worker a chance to observe cancellation and unwind
		// before the handle is aborted out from under it.
		for _ in 0..50 {
			if self.running.read().await.is_empty() {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(100)).await;
		}

		if let Some(handle) = self.worker.write().await.take() {
			handle.abort();
		}
		info!("backup worker stopped");
	}

	/// `queueTaskAndWait`: enqueue `task_id` and wait for it to finish.
	pub async fn queue_task_and_wait(&self, task_id: Uuid) -> Result<(), BackupError> {
		let task = self.store.get_task(task_id).await?;
		match self.queue.enqueue(task.id, task.priority).await {
			Some(handle) => handle.wait().await.map_err(|err| match Arc::try_unwrap(err) {
				Ok(err) => err,
				Err(shared) => BackupError::SftpExhausted(shared.to_string()),
			}),
			None => Ok(()),
		}
	}

	/// `stopTask`: flip the cancel flag on a running task, or dequeue it if
	/// it hasn't started yet.
	pub async fn stop_task(&self, task_id: Uuid) {
		if let Some(handle) = self.running.read().await.get(&task_id) {
			handle.cancel();
			return;
		}
		self.queue.dequeue_cancel(task_id).await;
	}

	pub async fn progress(&self, task_id: Uuid) -> Option<progress::Progress> {
		match self.running.read().await.get(&task_id) {
			Some(handle) => Some(handle.snapshot().await),
			None => None,
		}
	}

	pub async fn run_history(&self, task_id: Uuid) -> Vec<RunRecord> {
		match self.history.read().await.get(&task_id) {
			Some(history) => history.recent(),
			None => Vec::new(),
		}
	}
}

async fn worker_loop(
	queue: TaskQueue,
	store: MetadataStore,
	runner: Arc<BackupRunner>,
	running: Arc<RwLock<HashMap<Uuid, progress::RunHandle>>>,
	history: Arc<RwLock<HashMap<Uuid, progress::RunHistory>>>,
) {
	loop {
		let (task_id, completion) = queue.next().await;

		let task = match store.get_task(task_id).await {
			Ok(task) => task,
			Err(err) => {
				warn!(%err, %task_id, "dropping queued task: failed to load from store");
				let _ = completion.send(Err(Arc::new(err.into())));
				queue.finish().await;
				continue;
			}
		};

		// `into_path()` disowns the directory from `TempDir`'s drop-cleanup:
		// the run's own teardown removes it once the backup finishes, since
		// it needs to stay alive for the whole task, not just this scope.
		let tmp_dir = match tempfile::Builder::new()
			.prefix(&format!("ddrive-task-{task_id}-"))
			.tempdir()
		{
			Ok(dir) => dir.into_path(),
			Err(err) => {
				warn!(%err, %task_id, "failed to create task temp directory");
				let _ = completion.send(Err(Arc::new(BackupError::from(err))));
				queue.finish().await;
				continue;
			}
		};

		let handle = progress::RunHandle::new(tmp_dir, Utc::now());
		running.write().await.insert(task_id, handle.clone());

		let result = runner.run(&task, &handle).await;

		running.write().await.remove(&task_id);
		record_history(&history, task_id, &result).await;

		let sendable = result.map_err(Arc::new);
		let _ = completion.send(sendable.map(|_| ()));
		queue.finish().await;
	}
}

async fn record_history(
	history: &Arc<RwLock<HashMap<Uuid, progress::RunHistory>>>,
	task_id: Uuid,
	result: &Result<u64, BackupError>,
) {
	let (outcome, bytes_transferred) = match result {
		Ok(bytes) => (RunOutcome::Success, *bytes),
		Err(BackupError::Cancelled) => (RunOutcome::Cancelled, 0),
		Err(_) => (RunOutcome::Failed, 0),
	};
	let mut history = history.write().await;
	history
		.entry(task_id)
		.or_insert_with(|| progress::RunHistory::new(RUN_HISTORY_CAPACITY))
		.push(RunRecord {
			finished_at: Utc::now(),
			outcome,
			bytes_transferred,
		});
}
