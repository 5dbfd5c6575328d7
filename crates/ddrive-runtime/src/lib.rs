#![deny(rust_2018_idioms)]

pub mod config;
pub mod error;

use std::{sync::Arc, time::Duration};

use ddrive_backup::BackupService;
use ddrive_blob::{BlobAdapter, ChatAttachmentClient};
use ddrive_core::{ChunkError, DriveApi, Reconciler};
use ddrive_store::MetadataStore;
use tokio::{sync::RwLock, task::JoinHandle, time::sleep};
use tracing::{info, warn};

pub use config::RuntimeConfig;
pub use error::{ConfigError, RuntimeError};

/// Everything the `ddrive-runtimed` binary needs running: the metadata
/// store pool, the access surface library callers embed, the backup task
/// queue/scheduler, and the reconciler's periodic sweeps.
pub struct Runtime {
	pub api: DriveApi,
	reconciler: Arc<Reconciler>,
	backup: Arc<BackupService>,
	config: RuntimeConfig,
	sweep_handles: RwLock<Vec<JoinHandle<()>>>,
}

impl Runtime {
	pub async fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
		let pool = ddrive_store::create_pool(&config.database_url, "ddrive-runtimed").await?;
		let store = MetadataStore::new(pool);

		let blob: Arc<dyn BlobAdapter> = Arc::new(ChatAttachmentClient::new(
			config.blob_base_url.clone(),
			config.blob_channel_id.clone(),
			config.blob_token.clone(),
		));

		let api = DriveApi::new(store.clone(), blob.clone());
		let reconciler = Arc::new(
			Reconciler::new(store.clone(), blob.clone(), config.reconciler_dry_run)
				.with_recycle_bin_retention_days(config.recycle_bin_retention_days),
		);
		let backup = Arc::new(BackupService::new(store, blob));

		Ok(Self {
			api,
			reconciler,
			backup,
			config,
			sweep_handles: RwLock::new(Vec::new()),
		})
	}

	/// Start the cron scheduler, the backup worker, the stale-state
	/// watchdog, and the two reconciler sweep loops.
	pub async fn start(&self) -> Result<(), RuntimeError> {
		info!("starting ddrive runtime");
		self.backup.start().await?;

		let mut handles = self.sweep_handles.write().await;
		handles.push(spawn_sweep_loop(
			"orphaned-blob",
			self.config.orphan_sweep_interval,
			self.reconciler.clone(),
			|r| Box::pin(async move { r.sweep_orphaned_blobs().await.map(|_| ()) }),
		));
		handles.push(spawn_sweep_loop(
			"recycle-bin",
			self.config.recycle_bin_sweep_interval,
			self.reconciler.clone(),
			|r| Box::pin(async move { r.sweep_recycle_bin().await.map(|_| ()) }),
		));

		Ok(())
	}

	/// Cancel every pending cron entry, wait for any in-flight backup run to
	/// observe its cancel flag and exit, then stop the sweep loops.
	pub async fn stop(&self) {
		info!("stopping ddrive runtime");
		self.backup.stop().await;
		for handle in self.sweep_handles.write().await.drain(..) {
			handle.abort();
		}
	}

	pub fn backup(&self) -> &Arc<BackupService> {
		&self.backup
	}
}

fn spawn_sweep_loop<F>(name: &'static str, interval: Duration, reconciler: Arc<Reconciler>, run: F) -> JoinHandle<()>
where
	F: Fn(Arc<Reconciler>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ChunkError>> + Send>> + Send + 'static,
{
	tokio::spawn(async move {
		loop {
			sleep(interval).await;
			if let Err(err) = run(reconciler.clone()).await {
				warn!(sweep = name, %err, "reconciler sweep failed");
			}
		}
	})
}
