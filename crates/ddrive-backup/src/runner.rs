//! The per-run algorithm: connect, pre-scan,
//! transfer (plain mirror or single archive), apply retention.

use std::sync::Arc;

use chrono::Utc;
use ddrive_blob::BlobAdapter;
use ddrive_core::{ChunkEngine, StoreRequest, UploadSource};
use ddrive_store::{Compression, LogEntry, LogLevel, MetadataStore, Node, NodeType, Task};
use futures::StreamExt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
	archive::{new_archive_path, ArchiveWriter},
	error::BackupError,
	progress::{Phase, RunHandle},
	sftp::{walk_for_prescan, with_reconnect, RemoteEntry, SftpSession},
};

/// Files at or below this size are downloaded into memory before being
/// appended to the archive; larger files stream through a temp path.
const IN_MEMORY_THRESHOLD: u64 = 2 * 1024 * 1024;
const FILE_BATCH_SIZE: usize = 100;
const DIR_BATCH_SIZE: usize = 5;

pub struct BackupRunner {
	store: MetadataStore,
	engine: ChunkEngine,
}

impl BackupRunner {
	pub fn new(store: MetadataStore, blob: Arc<dyn BlobAdapter>) -> Self {
		let engine = ChunkEngine::new(store.clone(), blob);
		Self { store, engine }
	}

	#[instrument(skip(self, task, run), fields(task_id = %task.id, name = %task.name))]
	pub async fn run(&self, task: &Task, run: &RunHandle) -> Result<u64, BackupError> {
		let now = Utc::now();
		self.store.mark_task_started(task.id, now).await?;

		let result = self.run_inner(task, run).await;

		match &result {
			Ok(bytes) => {
				let finished = Utc::now();
				let runtime = finished - now;
				self.store.mark_task_finished(task.id, finished, Some(runtime)).await?;
				self.log(task, LogLevel::Info, format!("backup completed, {bytes} bytes transferred")).await;
			}
			Err(BackupError::Cancelled) => {
				// lastRun updates, lastRuntime does not — the run didn't complete.
				self.store.mark_task_finished(task.id, Utc::now(), None).await?;
				self.log(task, LogLevel::Warn, "backup cancelled".into()).await;
			}
			Err(err) => {
				self.log(task, LogLevel::Error, format!("backup failed: {err}")).await;
			}
		}

		let _ = tokio::fs::remove_dir_all(&run.tmp_dir).await;
		result
	}

	async fn log(&self, task: &Task, level: LogLevel, message: String) {
		let entry = LogEntry {
			id: Uuid::new_v4(),
			user_id: task.user_id,
			level,
			category: "TASK".into(),
			message,
			created_at: Utc::now(),
		};
		if let Err(err) = self.store.append_log(&entry).await {
			warn!(%err, "failed to append task log entry");
		}
	}

	async fn run_inner(&self, task: &Task, run: &RunHandle) -> Result<u64, BackupError> {
		run.check_cancelled()?;
		let destination_root = ensure_dir_path(&self.store, task.user_id, &task.destination_path).await?;

		run.set_phase(Phase::Connecting).await;
		let mut session = SftpSession::connect(&task.source).await?;

		run.check_cancelled()?;
		run.set_phase(Phase::Scanning).await;
		if !task.skip_prescan {
			let totals = match session.exec_prescan(&task.sftp_path).await {
				Some(totals) => totals,
				None => walk_for_prescan(&session, &task.sftp_path, &task.exclude_paths).await?,
			};
			run.set_scan_totals(totals.0, totals.1).await;
		}

		run.check_cancelled()?;
		let bytes_transferred = match task.compress {
			Compression::None => {
				self.transfer_plain(task, &destination_root, &mut session, run).await?
			}
			Compression::Zip | Compression::TarGz => {
				self.transfer_archive(task, &destination_root, &mut session, run).await?
			}
		};

		run.set_phase(Phase::Complete).await;
		self.apply_retention(task, &destination_root).await?;
		Ok(bytes_transferred)
	}

	/// `compress=NONE`: mirror the source tree as nodes,
	/// streaming each file through the chunk engine as it's downloaded.
	async fn transfer_plain(
		&self,
		task: &Task,
		destination_root: &Node,
		session: &mut SftpSession,
		run: &RunHandle,
	) -> Result<u64, BackupError> {
		run.set_phase(Phase::Downloading).await;
		let run_dir_name = run_directory_name(task);
		let run_node = create_directory(&self.store, task.user_id, destination_root, &run_dir_name).await?;

		let mut total_bytes = 0u64;
		let mut reconnects = 0u32;
		let mut last_recorded_reconnects = 0u32;
		// (remote_dir, dest_parent) pairs to visit; an explicit queue rather
		// than call-stack recursion.
		let mut pending = vec![(task.sftp_path.clone(), run_node.clone())];

		while !pending.is_empty() {
			run.check_cancelled()?;
			let batch: Vec<_> = pending.drain(..pending.len().min(DIR_BATCH_SIZE)).collect();
			for (remote_dir, dest_parent) in batch {
				let entries =
					with_reconnect(session, &mut reconnects, run, |s| s.list_dir(&remote_dir, &task.exclude_paths)).await;
				let entries = match entries {
					Ok(entries) => entries,
					Err(err) => {
						warn!(%err, dir = %remote_dir, "skipping unreadable directory");
						continue;
					}
				};
				for _ in last_recorded_reconnects..reconnects {
					run.record_reconnect().await;
				}
				last_recorded_reconnects = reconnects;

				for entry in entries {
					run.check_cancelled()?;
					if entry.is_dir {
						let name = basename(&entry.path);
						match create_directory(&self.store, task.user_id, &dest_parent, name).await {
							Ok(node) => pending.push((entry.path.clone(), node)),
							Err(err) => warn!(%err, path = %entry.path, "failed to mirror directory, skipping"),
						}
						continue;
					}

					match self
						.transfer_one_file(task, session, &mut reconnects, &entry, &dest_parent, run)
						.await
					{
						Ok(size) => total_bytes += size,
						Err(err) => warn!(%err, path = %entry.path, "skipping file after transfer error"),
					}
					run.record_file(entry.size, &remote_dir).await;
				}
			}
		}

		Ok(total_bytes)
	}

	async fn transfer_one_file(
		&self,
		task: &Task,
		session: &mut SftpSession,
		reconnects: &mut u32,
		entry: &RemoteEntry,
		dest_parent: &Node,
		run: &RunHandle,
	) -> Result<u64, BackupError> {
		let tmp_path = run.tmp_dir.join(Uuid::new_v4().to_string());
		let path = entry.path.clone();
		let size = with_reconnect(session, reconnects, run, |s| {
			let tmp_path = tmp_path.clone();
			let path = path.clone();
			async move { s.download_to_path(&path, &tmp_path).await }
		})
		.await?;

		self.engine
			.store(StoreRequest {
				owner: task.user_id,
				parent: Some(dest_parent.clone()),
				name: basename(&entry.path).to_string(),
				encrypt: task.encrypt,
				mime_type: None,
				source: UploadSource::Path(tmp_path.clone()),
				user_key: None,
			})
			.await?;

		let _ = tokio::fs::remove_file(&tmp_path).await;
		Ok(size)
	}

	/// `compress=ZIP|TAR_GZ`: stream a single archive to a
	/// temp file while walking the source, then upload it as one blob.
	async fn transfer_archive(
		&self,
		task: &Task,
		destination_root: &Node,
		session: &mut SftpSession,
		run: &RunHandle,
	) -> Result<u64, BackupError> {
		run.set_phase(Phase::Archiving).await;
		let archive_path = new_archive_path(&run.tmp_dir, task.compress);
		let mut writer = match task.compress {
			Compression::Zip => ArchiveWriter::create_zip(&archive_path)?,
			Compression::TarGz => ArchiveWriter::create_tar_gz(&archive_path)?,
			Compression::None => unreachable!("caller only routes compressed tasks here"),
		};

		let mut reconnects = 0u32;
		let mut last_recorded_reconnects = 0u32;
		let mut total_bytes = 0u64;
		let mut pending = vec![task.sftp_path.clone()];

		while !pending.is_empty() {
			run.check_cancelled()?;
			let dir_batch: Vec<_> = pending.drain(..pending.len().min(DIR_BATCH_SIZE)).collect();
			for remote_dir in dir_batch {
				let entries =
					with_reconnect(session, &mut reconnects, run, |s| s.list_dir(&remote_dir, &task.exclude_paths)).await;
				let entries = match entries {
					Ok(entries) => entries,
					Err(err) => {
						warn!(%err, dir = %remote_dir, "skipping unreadable directory");
						continue;
					}
				};
				for _ in last_recorded_reconnects..reconnects {
					run.record_reconnect().await;
				}
				last_recorded_reconnects = reconnects;

				let (dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.is_dir);
				pending.extend(dirs.into_iter().map(|d| d.path));

				for file_batch in files.chunks(FILE_BATCH_SIZE) {
					run.check_cancelled()?;
					let downloads = futures::stream::iter(file_batch.iter().cloned().map(|entry| {
						let session = &*session;
						async move {
							let rel = entry.path.trim_start_matches(&task.sftp_path as &str).trim_start_matches('/');
							if entry.size <= IN_MEMORY_THRESHOLD {
								session.download_to_memory(&entry.path).await.map(|data| (rel.to_string(), ArchivePayload::Memory(data)))
							} else {
								let tmp = run.tmp_dir.join(Uuid::new_v4().to_string());
								session
									.download_to_path(&entry.path, &tmp)
									.await
									.map(|size| (rel.to_string(), ArchivePayload::Path(tmp, size)))
							}
						}
					}))
					.buffer_unordered(8)
					.collect::<Vec<_>>()
					.await;

					for result in downloads {
						match result {
							Ok((rel, ArchivePayload::Memory(data))) => {
								total_bytes += data.len() as u64;
								if let Err(err) = writer.append_bytes(&rel, &data) {
									warn!(%err, path = %rel, "failed to append file to archive");
								}
							}
							Ok((rel, ArchivePayload::Path(tmp, size))) => {
								total_bytes += size;
								if let Err(err) = writer.append_path(&rel, &tmp) {
									warn!(%err, path = %rel, "failed to append file to archive");
								}
								let _ = tokio::fs::remove_file(&tmp).await;
							}
							Err(err) => warn!(%err, "skipping file after transfer error"),
						}
					}
				}
			}
		}

		writer.finish()?;

		run.set_phase(Phase::Uploading).await;
		// One archive file per run, directly under the destination
		// directory — unlike the plain mirror, there's no per-run
		// subdirectory to wrap it in, so retention counts archives
		// themselves.
		let extension = crate::archive::archive_extension(task.compress);
		let archive_name = format!("{}.{extension}", run_directory_name(task));
		self.engine
			.store(StoreRequest {
				owner: task.user_id,
				parent: Some(destination_root.clone()),
				name: archive_name,
				encrypt: task.encrypt,
				mime_type: None,
				source: UploadSource::Path(archive_path),
				user_key: None,
			})
			.await?;

		Ok(total_bytes)
	}

	/// Delete the oldest nodes in the destination directory beyond
	/// `maxFiles`; blob cleanup is left to the reconciler.
	async fn apply_retention(&self, task: &Task, destination_root: &Node) -> Result<(), BackupError> {
		let Some(max_files) = task.max_files else {
			return Ok(());
		};
		let mut children = self.store.list_children(task.user_id, Some(destination_root.id)).await?;
		if children.len() as u32 <= max_files {
			return Ok(());
		}
		children.sort_by_key(|n| n.created_at);
		let excess = children.len() - max_files as usize;
		for node in &children[..excess] {
			info!(node = %node.id, "pruning backup retention beyond max_files");
			self.engine.delete_permanent(node).await?;
		}
		Ok(())
	}
}

enum ArchivePayload {
	Memory(Vec<u8>),
	Path(std::path::PathBuf, u64),
}

fn basename(remote_path: &str) -> &str {
	remote_path.rsplit('/').next().unwrap_or(remote_path)
}

fn run_directory_name(task: &Task) -> String {
	if task.timestamp_names {
		format!("{}_{}", task.name, Utc::now().format("%Y%m%dT%H%M%SZ"))
	} else {
		task.name.clone()
	}
}

async fn create_directory(
	store: &MetadataStore,
	user_id: Uuid,
	parent: &Node,
	name: &str,
) -> Result<Node, BackupError> {
	let (resolved_name, path) = ddrive_core::namespace::unique_path(store, user_id, &parent.path, name).await?;
	let now = Utc::now();
	let node = Node {
		id: Uuid::new_v4(),
		user_id,
		parent_id: Some(parent.id),
		name: resolved_name,
		path,
		node_type: NodeType::Directory,
		size: 0,
		mime_type: None,
		encrypted: false,
		starred: false,
		created_at: now,
		updated_at: now,
		deleted_at: None,
		original_path: None,
		deleted_with_parent_id: None,
	};
	Ok(ddrive_core::namespace::create_node_with_unique_name(store, node).await?)
}

/// Recreate the destination folder by path if the original node was
/// deleted.
async fn ensure_dir_path(store: &MetadataStore, user_id: Uuid, path: &str) -> Result<Node, BackupError> {
	if let Some(existing) = store.find_by_path(user_id, path).await? {
		return Ok(existing);
	}

	let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	let mut parent_id = None;
	let mut parent_path = String::new();
	let mut node = None;

	for segment in segments {
		let candidate_path = format!("{parent_path}/{segment}");
		let found = match store.find_by_path(user_id, &candidate_path).await? {
			Some(n) => n,
			None => {
				let now = Utc::now();
				store
					.create_node(&Node {
						id: Uuid::new_v4(),
						user_id,
						parent_id,
						name: segment.to_string(),
						path: candidate_path.clone(),
						node_type: NodeType::Directory,
						size: 0,
						mime_type: None,
						encrypted: false,
						starred: false,
						created_at: now,
						updated_at: now,
						deleted_at: None,
						original_path: None,
						deleted_with_parent_id: None,
					})
					.await?
			}
		};
		parent_id = Some(found.id);
		parent_path = candidate_path;
		node = Some(found);
	}

	node.ok_or_else(|| BackupError::Store(ddrive_store::StoreError::NotFound))
}
