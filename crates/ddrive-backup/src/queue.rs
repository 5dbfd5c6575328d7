//! The process-wide task queue: one ordered queue of
//! `{taskId, enqueuedAt, priority}`, drained by a single worker.

use std::{
	collections::VecDeque,
	sync::Arc,
	time::Instant,
};

use tokio::sync::{oneshot, Mutex, Notify};
use uuid::Uuid;

use crate::error::BackupError;

struct Entry {
	task_id: Uuid,
	enqueued_at: Instant,
	priority: i32,
	completion: oneshot::Sender<Result<(), Arc<BackupError>>>,
}

/// A handle returned by [`TaskQueue::enqueue`] that resolves when the task
/// finishes running, or immediately if it's cancelled before it starts.
pub struct CompletionHandle {
	rx: oneshot::Receiver<Result<(), Arc<BackupError>>>,
}

impl CompletionHandle {
	pub async fn wait(self) -> Result<(), Arc<BackupError>> {
		match self.rx.await {
			Ok(result) => result,
			Err(_) => Err(Arc::new(BackupError::Cancelled)),
		}
	}
}

#[derive(Default)]
struct Inner {
	entries: VecDeque<Entry>,
	running: Option<Uuid>,
}

/// Priorities re-sort the queue ascending (lower value runs first); within
/// equal priority, insertion order (FIFO by `enqueuedAt`) is preserved.
/// Enqueueing a task id that's already queued or currently running is a
/// no-op — the caller's existing handle (if any) still resolves when that
/// run completes.
#[derive(Clone, Default)]
pub struct TaskQueue {
	inner: Arc<Mutex<Inner>>,
	notify: Arc<Notify>,
}

impl TaskQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// `queueTaskAndWait`: enqueue (or no-op if already queued/running) and
	/// return a handle that resolves when the run completes.
	pub async fn enqueue(&self, task_id: Uuid, priority: i32) -> Option<CompletionHandle> {
		let mut inner = self.inner.lock().await;
		if inner.running == Some(task_id) || inner.entries.iter().any(|e| e.task_id == task_id) {
			return None;
		}

		let (tx, rx) = oneshot::channel();
		inner.entries.push_back(Entry {
			task_id,
			enqueued_at: Instant::now(),
			priority,
			completion: tx,
		});
		inner
			.entries
			.make_contiguous()
			.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
		drop(inner);
		self.notify.notify_one();

		Some(CompletionHandle { rx })
	}

	pub async fn is_queued_or_running(&self, task_id: Uuid) -> bool {
		let inner = self.inner.lock().await;
		inner.running == Some(task_id) || inner.entries.iter().any(|e| e.task_id == task_id)
	}

	/// Remove a queued (not yet running) task and reject its completion
	/// handle. No-op if the task is already running or absent.
	pub async fn dequeue_cancel(&self, task_id: Uuid) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(pos) = inner.entries.iter().position(|e| e.task_id == task_id) else {
			return false;
		};
		let entry = inner.entries.remove(pos).expect("position just found");
		let _ = entry.completion.send(Err(Arc::new(BackupError::Cancelled)));
		true
	}

	/// Pop the next task to run, marking it as running, waiting for an
	/// enqueue notification if the queue is currently empty. The worker
	/// must call [`TaskQueue::finish`] when the run completes.
	pub(crate) async fn next(&self) -> (Uuid, oneshot::Sender<Result<(), Arc<BackupError>>>) {
		loop {
			{
				let mut inner = self.inner.lock().await;
				if let Some(entry) = inner.entries.pop_front() {
					inner.running = Some(entry.task_id);
					return (entry.task_id, entry.completion);
				}
			}
			self.notify.notified().await;
		}
	}

	pub(crate) async fn finish(&self) {
		self.inner.lock().await.running = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn duplicate_enqueue_is_a_no_op() {
		let queue = TaskQueue::new();
		let id = Uuid::new_v4();
		let first = queue.enqueue(id, 0).await;
		assert!(first.is_some());
		let second = queue.enqueue(id, 0).await;
		assert!(second.is_none());
	}

	#[tokio::test]
	async fn lower_priority_value_runs_first() {
		let queue = TaskQueue::new();
		let low = Uuid::new_v4();
		let high = Uuid::new_v4();
		queue.enqueue(high, 10).await;
		queue.enqueue(low, 0).await;

		let (first, completion) = queue.next().await;
		assert_eq!(first, low);
		let _ = completion.send(Ok(()));
		queue.finish().await;

		let (second, completion) = queue.next().await;
		assert_eq!(second, high);
		let _ = completion.send(Ok(()));
	}

	#[tokio::test]
	async fn equal_priority_is_fifo() {
		let queue = TaskQueue::new();
		let first_in = Uuid::new_v4();
		let second_in = Uuid::new_v4();
		queue.enqueue(first_in, 5).await;
		queue.enqueue(second_in, 5).await;

		let (popped, _) = queue.next().await;
		assert_eq!(popped, first_in);
	}

	#[tokio::test]
	async fn dequeue_cancel_rejects_the_handle() {
		let queue = TaskQueue::new();
		let id = Uuid::new_v4();
		let handle = queue.enqueue(id, 0).await.unwrap();
		assert!(queue.dequeue_cancel(id).await);
		assert!(handle.wait().await.is_err());
	}

	#[tokio::test]
	async fn dequeue_cancel_on_running_task_is_a_no_op() {
		let queue = TaskQueue::new();
		let id = Uuid::new_v4();
		queue.enqueue(id, 0).await;
		queue.next().await;
		assert!(!queue.dequeue_cancel(id).await);
	}
}
