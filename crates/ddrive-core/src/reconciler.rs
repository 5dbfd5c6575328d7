//! Periodic sweeps that reap remote attachments no chunk pointer references
//! any more, and purge recycle-bin entries past retention.
//!
//! This is the only place blobs are proactively deleted; every other code
//! path that fails to clean up a blob (a crashed upload, a permanent
//! delete) relies on these sweeps running eventually.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use ddrive_blob::{BlobAdapter, BlobError};
use ddrive_store::{MetadataStore, StoreError};
use tracing::{debug, info, warn};

use crate::error::ChunkError;

const PAGE_SIZE: u32 = 100;
const MESSAGE_CEILING: usize = 10_000;
const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const INTER_DELETE_PACING: Duration = Duration::from_millis(100);
const DEFAULT_RECYCLE_BIN_RETENTION_DAYS: i64 = 30;

pub struct Reconciler {
	store: MetadataStore,
	blob: Arc<dyn BlobAdapter>,
	/// When set, sweeps log what they would delete without deleting it
	/// run flag).
	pub dry_run: bool,
	recycle_bin_retention: ChronoDuration,
}

#[derive(Debug, Default)]
pub struct SweepReport {
	pub examined: usize,
	pub deleted: usize,
	pub failed: usize,
}

impl Reconciler {
	pub fn new(store: MetadataStore, blob: Arc<dyn BlobAdapter>, dry_run: bool) -> Self {
		Self {
			store,
			blob,
			dry_run,
			recycle_bin_retention: ChronoDuration::days(DEFAULT_RECYCLE_BIN_RETENTION_DAYS),
		}
	}

	/// Override the recycle-bin retention window (runtime configuration;
	/// defaults to 30 days).
	pub fn with_recycle_bin_retention_days(mut self, days: i64) -> Self {
		self.recycle_bin_retention = ChronoDuration::days(days);
		self
	}

	/// Page the substrate channel's message history, diff against every
	/// message id referenced by a chunk pointer, and delete the rest.
	pub async fn sweep_orphaned_blobs(&self) -> Result<SweepReport, ChunkError> {
		let referenced: HashSet<String> = self.store.scan_chunk_pointer_message_ids().await?.into_iter().collect();

		let mut report = SweepReport::default();
		let mut before: Option<String> = None;

		loop {
			if report.examined >= MESSAGE_CEILING {
				warn!(examined = report.examined, "orphaned-blob sweep hit the message ceiling, stopping");
				break;
			}

			let page = self.list_messages_with_retry(before.as_deref()).await?;
			if page.is_empty() {
				break;
			}

			for message in &page {
				report.examined += 1;
				if referenced.contains(&message.message_id) {
					continue;
				}

				if self.dry_run {
					debug!(message_id = %message.message_id, "dry run: would delete orphaned blob");
					continue;
				}

				match self.blob.delete(&message.message_id, &message.channel_id).await {
					Ok(()) => report.deleted += 1,
					Err(err) => {
						warn!(?err, message_id = %message.message_id, "failed to delete orphaned blob");
						report.failed += 1;
					}
				}
				tokio::time::sleep(INTER_DELETE_PACING).await;
			}

			before = page.last().map(|m| m.message_id.clone());
			if page.len() < PAGE_SIZE as usize {
				break;
			}
		}

		info!(
			examined = report.examined,
			deleted = report.deleted,
			failed = report.failed,
			dry_run = self.dry_run,
			"orphaned-blob sweep complete"
		);
		Ok(report)
	}

	async fn list_messages_with_retry(
		&self,
		before: Option<&str>,
	) -> Result<Vec<ddrive_blob::MessageSummary>, ChunkError> {
		let mut attempt = 0;
		loop {
			match self.blob.list_messages(before, PAGE_SIZE).await {
				Ok(page) => return Ok(page),
				Err(BlobError::RateLimit { retry_after }) if attempt < MAX_RATE_LIMIT_RETRIES => {
					warn!(attempt, ?retry_after, "rate limited while paging substrate, retrying");
					tokio::time::sleep(retry_after).await;
					attempt += 1;
				}
				Err(err) => return Err(err.into()),
			}
		}
	}

	/// Find nodes trashed more than 30 days ago, best-effort delete their
	/// blobs, then delete the chunk and node rows together in one
	/// transaction. Per-file failures log and the sweep continues.
	pub async fn sweep_recycle_bin(&self) -> Result<SweepReport, ChunkError> {
		let cutoff = Utc::now() - self.recycle_bin_retention;
		let expired = self.store.find_recycle_bin_older_than(cutoff).await?;

		let mut report = SweepReport::default();
		for node in expired {
			report.examined += 1;

			if self.dry_run {
				debug!(node = %node.id, "dry run: would purge recycle-bin entry");
				continue;
			}

			let pointers = match self.store.list_chunk_pointers(node.id).await {
				Ok(p) => p,
				Err(err) => {
					warn!(?err, node = %node.id, "failed to list chunk pointers for recycle-bin purge");
					report.failed += 1;
					continue;
				}
			};
			for pointer in &pointers {
				if let Err(err) = self.blob.delete(&pointer.message_id, &pointer.channel_id).await {
					warn!(?err, node = %node.id, "failed to delete blob during recycle-bin purge");
				}
			}

			let mut conn = match self.store.pool().get().await.map_err(StoreError::from) {
				Ok(conn) => conn,
				Err(err) => {
					warn!(?err, node = %node.id, "failed to open a connection for recycle-bin purge");
					report.failed += 1;
					continue;
				}
			};
			let txn = match conn.transaction().await.map_err(StoreError::from_db) {
				Ok(txn) => txn,
				Err(err) => {
					warn!(?err, node = %node.id, "failed to open a transaction for recycle-bin purge");
					report.failed += 1;
					continue;
				}
			};
			if let Err(err) = self.store.delete_chunk_pointers_by_file_txn(&txn, &[node.id]).await {
				warn!(?err, node = %node.id, "failed to delete chunk rows during recycle-bin purge");
				report.failed += 1;
				continue;
			}
			if let Err(err) = self.store.delete_nodes_txn(&txn, &[node.id]).await {
				warn!(?err, node = %node.id, "failed to delete node row during recycle-bin purge");
				report.failed += 1;
				continue;
			}
			if let Err(err) = txn.commit().await.map_err(StoreError::from_db) {
				warn!(?err, node = %node.id, "failed to commit recycle-bin purge transaction");
				report.failed += 1;
				continue;
			}
			report.deleted += 1;
		}

		info!(
			examined = report.examined,
			deleted = report.deleted,
			failed = report.failed,
			dry_run = self.dry_run,
			"recycle-bin retention sweep complete"
		);
		Ok(report)
	}
}
