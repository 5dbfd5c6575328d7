//! Cron wakeups and the stale-state watchdog,
//! one `JoinHandle` per
//! scheduled item, held in a lock-guarded map so a reload can cancel and
//! respawn them.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use cron::Schedule;
use ddrive_store::{LogEntry, LogLevel, MetadataStore};
use tokio::{sync::RwLock, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{error::BackupError, queue::TaskQueue};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
	store: MetadataStore,
	queue: TaskQueue,
	tasks: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
	watchdog: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl Scheduler {
	pub fn new(store: MetadataStore, queue: TaskQueue) -> Self {
		Self {
			store,
			queue,
			tasks: Arc::new(RwLock::new(HashMap::new())),
			watchdog: Arc::new(RwLock::new(None)),
		}
	}

	/// Cancel every scheduled wakeup and re-read enabled tasks from the
	/// store, spawning a fresh cron loop for each. Call after a task's
	/// `cron`/`enabled` fields change.
	pub async fn reload(&self) -> Result<(), BackupError> {
		{
			let mut tasks = self.tasks.write().await;
			for (id, handle) in tasks.drain() {
				debug!(task_id = %id, "cancelling cron wakeup");
				handle.abort();
			}
		}

		let enabled = self.store.list_enabled_tasks().await?;
		let mut tasks = self.tasks.write().await;
		for task in enabled {
			// Validate eagerly so a bad cron expression surfaces at reload
			// time rather than silently never firing.
			if let Err(err) = Schedule::from_str(&task.cron) {
				warn!(task_id = %task.id, cron = %task.cron, %err, "skipping task with invalid cron expression");
				continue;
			}
			let handle = self.spawn_cron_loop(task.id, task.cron.clone(), task.priority);
			tasks.insert(task.id, handle);
		}
		info!(count = tasks.len(), "scheduled backup tasks");
		Ok(())
	}

	fn spawn_cron_loop(&self, task_id: Uuid, cron_expr: String, priority: i32) -> JoinHandle<()> {
		let queue = self.queue.clone();

		tokio::spawn(async move {
			let schedule = match Schedule::from_str(&cron_expr) {
				Ok(s) => s,
				Err(err) => {
					error!(task_id = %task_id, %err, "cron expression became invalid after validation");
					return;
				}
			};

			loop {
				let Some(next) = schedule.upcoming(Utc).next() else {
					warn!(task_id = %task_id, "cron schedule has no future occurrences, stopping");
					return;
				};
				let now = Utc::now();
				let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
				sleep(wait).await;

				// Duplicate enqueue is a no-op.
				if queue.enqueue(task_id, priority).await.is_none() {
					debug!(task_id = %task_id, "cron fired but task already queued or running");
				}
			}
		})
	}

	/// A repair pass every 30 s: a task row that looks in-progress
	/// (`lastStarted > lastRun`) but isn't queued or running means the
	/// worker crashed mid-run; repair `lastRun` and log it.
	pub async fn start_watchdog(&self) {
		let store = self.store.clone();
		let queue = self.queue.clone();

		let handle = tokio::spawn(async move {
			loop {
				sleep(WATCHDOG_INTERVAL).await;
				if let Err(err) = run_watchdog_pass(&store, &queue).await {
					warn!(%err, "stale-state watchdog pass failed");
				}
			}
		});
		*self.watchdog.write().await = Some(handle);
	}

	pub async fn shutdown(&self) {
		info!("shutting down backup scheduler");
		if let Some(handle) = self.watchdog.write().await.take() {
			handle.abort();
		}
		let mut tasks = self.tasks.write().await;
		for (id, handle) in tasks.drain() {
			debug!(task_id = %id, "cancelling cron wakeup");
			handle.abort();
		}
	}
}

async fn run_watchdog_pass(store: &MetadataStore, queue: &TaskQueue) -> Result<(), BackupError> {
	let tasks = store.list_enabled_tasks().await?;
	for task in tasks {
		let looks_in_progress = match (task.last_started, task.last_run) {
			(Some(started), Some(run)) => started > run,
			(Some(_), None) => true,
			_ => false,
		};
		if !looks_in_progress {
			continue;
		}
		if queue.is_queued_or_running(task.id).await {
			continue;
		}

		let now = Utc::now();
		warn!(task_id = %task.id, "watchdog repairing stale in-progress task");
		store.mark_task_finished(task.id, now, None).await?;
		store
			.append_log(&LogEntry {
				id: Uuid::new_v4(),
				user_id: task.user_id,
				level: LogLevel::Warn,
				category: "TASK".into(),
				message: format!("watchdog repaired stale run for task {}", task.name),
				created_at: now,
			})
			.await?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn standard_five_field_cron_is_accepted() {
		// The `cron` crate's `Schedule` is seconds-first; a bare five-field
		// expression needs a leading seconds field to parse.
		assert!(Schedule::from_str("0 0 3 * * *").is_ok());
	}

	#[test]
	fn garbage_cron_expression_is_rejected() {
		assert!(Schedule::from_str("not a cron expression").is_err());
	}
}
