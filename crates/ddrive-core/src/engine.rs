//! Split-and-upload, fetch-decrypt-assemble, copy, delete and restore.
//!
//! This is the hardest subsystem to keep correct — it is the only one
//! that must keep the metadata store and the blob substrate honest against
//! each other without the substrate offering any transactions of its own.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use ddrive_blob::{BlobAdapter, BlobError};
use ddrive_crypto::{decrypt_chunk, encrypt_chunk, UserKey, CHUNK_SIZE, EFFECTIVE_CHUNK_SIZE};
use ddrive_store::{ChunkPointer, MetadataStore, Node, NodeType, StoreError};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{error::ChunkError, namespace, source::UploadSource};

/// How many times an individual chunk upload is retried on a transient blob
/// failure before the whole store operation rolls back.
const UPLOAD_RETRIES: u32 = 3;
const UPLOAD_BACKOFF_BASE: Duration = Duration::from_millis(500);

pub struct ChunkEngine {
	store: MetadataStore,
	blob: Arc<dyn BlobAdapter>,
}

pub struct StoreRequest {
	pub owner: Uuid,
	pub parent: Option<Node>,
	pub name: String,
	pub encrypt: bool,
	pub mime_type: Option<String>,
	pub source: UploadSource,
	pub user_key: Option<UserKey>,
}

pub struct RangeResult {
	pub data: Bytes,
	pub content_range: String,
	pub total_size: u64,
}

impl ChunkEngine {
	pub fn new(store: MetadataStore, blob: Arc<dyn BlobAdapter>) -> Self {
		Self { store, blob }
	}

	/// Split `req.source` into fixed-size blocks, encrypting each if
	/// `req.encrypt` is set, uploading each via the blob adapter, and
	/// committing one chunk pointer row per block as it lands.
	#[instrument(skip(self, req), fields(owner = %req.owner, name = %req.name))]
	pub async fn store(&self, req: StoreRequest) -> Result<Node, ChunkError> {
		let parent_id = req.parent.as_ref().map(|p| p.id);
		let parent_path = req.parent.as_ref().map(|p| p.path.clone()).unwrap_or_default();
		let (name, path) = namespace::unique_path(&self.store, req.owner, &parent_path, &req.name).await?;

		let known_size = req.source.known_size().await?;
		let now = Utc::now();
		let node = Node {
			id: Uuid::new_v4(),
			user_id: req.owner,
			parent_id,
			name,
			path,
			node_type: NodeType::File,
			size: known_size.unwrap_or(0),
			mime_type: req.mime_type,
			encrypted: req.encrypt,
			starred: false,
			created_at: now,
			updated_at: now,
			deleted_at: None,
			original_path: None,
			deleted_with_parent_id: None,
		};

		let node = namespace::create_node_with_unique_name(&self.store, node).await?;

		match self.upload_blocks(&node, req.source, req.encrypt, req.user_key.as_ref()).await {
			Ok(total_size) => {
				let mut finished = node.clone();
				finished.size = total_size;
				finished.updated_at = Utc::now();
				self.store.update_node(&finished).await?;
				self.race_check(&finished).await
			}
			Err(err) => {
				self.rollback_upload(&node).await;
				Err(err)
			}
		}
	}

	async fn upload_blocks(
		&self,
		node: &Node,
		source: UploadSource,
		encrypt: bool,
		user_key: Option<&UserKey>,
	) -> Result<u64, ChunkError> {
		let block_size = if encrypt { EFFECTIVE_CHUNK_SIZE } else { CHUNK_SIZE };
		let mut reader = source.into_reader().await?;
		let mut total_size = 0u64;
		let mut index = 0i32;

		while let Some(block) = reader.next_block(block_size).await? {
			let plaintext_size = block.len() as u64;
			let payload: Vec<u8> = if encrypt {
				let key = user_key.ok_or_else(|| {
					ChunkError::Internal("encrypt requested without a user key".into())
				})?;
				encrypt_chunk(&block, key)?
			} else {
				block.to_vec()
			};

			let blob_name = format!("{}_chunk_{}_{}", node.id, index, node.name);
			let location = self.upload_with_retry(&blob_name, Bytes::from(payload)).await?;

			let pointer = ChunkPointer {
				id: Uuid::new_v4(),
				file_id: node.id,
				chunk_index: index,
				message_id: location.message_id,
				channel_id: location.channel_id,
				attachment_url: location.url,
				size: plaintext_size,
			};
			self.store.insert_chunk_pointer(&pointer).await?;

			total_size += plaintext_size;
			index += 1;
			debug!(index, plaintext_size, total_size, "stored chunk");
		}

		Ok(total_size)
	}

	async fn upload_with_retry(&self, name: &str, bytes: Bytes) -> Result<ddrive_blob::BlobLocation, ChunkError> {
		let mut attempt = 0;
		loop {
			match self.blob.put(name, bytes.clone()).await {
				Ok(location) => return Ok(location),
				Err(BlobError::TooLarge { max }) => {
					return Err(ChunkError::Internal(format!(
						"chunk of {} bytes exceeds substrate maximum of {max}",
						bytes.len()
					)))
				}
				Err(err @ (BlobError::Net(_) | BlobError::RateLimit { .. })) if attempt < UPLOAD_RETRIES => {
					let delay = match &err {
						BlobError::RateLimit { retry_after } => *retry_after,
						_ => UPLOAD_BACKOFF_BASE * 2u32.pow(attempt),
					};
					warn!(attempt, ?delay, "retrying chunk upload after transient failure");
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				Err(err) => return Err(err.into()),
			}
		}
	}

	/// Best-effort cleanup when an upload fails partway through: delete
	/// every chunk blob already uploaded, the chunk rows, and the node row
	/// itself. Failures here are logged, not retried — the
	/// reconciler is the backstop.
	async fn rollback_upload(&self, node: &Node) {
		let pointers = match self.store.list_chunk_pointers(node.id).await {
			Ok(p) => p,
			Err(err) => {
				warn!(?err, node = %node.id, "rollback could not list chunk pointers");
				Vec::new()
			}
		};
		for pointer in &pointers {
			if let Err(err) = self.blob.delete(&pointer.message_id, &pointer.channel_id).await {
				warn!(?err, chunk = %pointer.id, "rollback could not delete blob");
			}
		}
		if let Err(err) = self.store.delete_chunk_pointers_by_file(&[node.id]).await {
			warn!(?err, node = %node.id, "rollback could not delete chunk rows");
		}
		if let Err(err) = self.store.delete_nodes(&[node.id]).await {
			warn!(?err, node = %node.id, "rollback could not delete node row");
		}
	}

	/// Post-create race check: another concurrent create may have
	/// claimed this path between our initial probe and commit. If so,
	/// rename this row to the next free numbered name.
	async fn race_check(&self, node: &Node) -> Result<Node, ChunkError> {
		let siblings_at_path = self.store.find_by_path(node.user_id, &node.path).await?;
		if siblings_at_path.as_ref().is_some_and(|n| n.id != node.id) {
			let parent_path = namespace::parent_path_of(&self.store, node).await?;
			let (name, path) = namespace::unique_path(&self.store, node.user_id, &parent_path, &node.name).await?;
			let mut renamed = node.clone();
			renamed.name = name;
			renamed.path = path;
			renamed.updated_at = Utc::now();
			self.store.update_node(&renamed).await?;
			return Ok(renamed);
		}
		Ok(node.clone())
	}

	/// Fetch and decrypt every chunk of `node`, concatenated in
	/// `chunkIndex` order.
	#[instrument(skip(self, user_key), fields(node = %node.id))]
	pub async fn fetch_whole(&self, node: &Node, user_key: Option<&UserKey>) -> Result<Bytes, ChunkError> {
		let pointers = self.store.list_chunk_pointers(node.id).await?;
		let mut out = BytesMut::with_capacity(node.size as usize);
		for pointer in &pointers {
			let raw = self.blob.get(&pointer.message_id, &pointer.channel_id).await?;
			let plaintext = self.decrypt_if_needed(node, &raw, user_key)?;
			out.extend_from_slice(&plaintext);
		}
		Ok(out.freeze())
	}

	/// Resolve and fetch a byte range `[start, end]` inclusive.
	#[instrument(skip(self, user_key), fields(node = %node.id, start, end))]
	pub async fn fetch_range(
		&self,
		node: &Node,
		start: u64,
		end: u64,
		user_key: Option<&UserKey>,
	) -> Result<RangeResult, ChunkError> {
		if start >= node.size || end >= node.size {
			return Err(ChunkError::RangeUnsatisfiable);
		}

		let pointers = self.store.list_chunk_pointers(node.id).await?;
		let mut prefix = 0u64;
		let mut start_idx = None;
		let mut end_idx = None;
		let mut start_offset = 0u64;
		for (i, pointer) in pointers.iter().enumerate() {
			let chunk_start = prefix;
			let chunk_end = prefix + pointer.size;
			if start_idx.is_none() && start >= chunk_start && start < chunk_end {
				start_idx = Some(i);
				start_offset = start - chunk_start;
			}
			if end >= chunk_start && end < chunk_end {
				end_idx = Some(i);
			}
			prefix = chunk_end;
		}

		let (start_idx, end_idx) = match (start_idx, end_idx) {
			(Some(s), Some(e)) => (s, e),
			_ => return Err(ChunkError::RangeUnsatisfiable),
		};

		let mut assembled = BytesMut::new();
		for pointer in &pointers[start_idx..=end_idx] {
			let raw = self.blob.get(&pointer.message_id, &pointer.channel_id).await?;
			let plaintext = self.decrypt_if_needed(node, &raw, user_key)?;
			assembled.extend_from_slice(&plaintext);
		}

		let want_len = (end - start + 1) as usize;
		let slice_start = start_offset as usize;
		let slice_end = (slice_start + want_len).min(assembled.len());
		let data = assembled.freeze().slice(slice_start..slice_end);
		let actual_end = start + (data.len() as u64) - 1;

		Ok(RangeResult {
			content_range: format!("bytes {start}-{actual_end}/{}", node.size),
			total_size: node.size,
			data,
		})
	}

	/// Decrypt one fetched chunk buffer, applying the three defensive cases
	/// when the node is marked encrypted; chunks on an
	/// unencrypted node are returned untouched.
	fn decrypt_if_needed(&self, node: &Node, raw: &[u8], user_key: Option<&UserKey>) -> Result<Vec<u8>, ChunkError> {
		if !node.encrypted {
			return Ok(raw.to_vec());
		}
		let key = user_key.ok_or(ChunkError::CryptoAuthFail)?;
		Ok(decrypt_chunk(raw, key)?)
	}

	/// Copy a single file node to a new parent/name, re-uploading every
	/// chunk to fresh blobs. Uses a two-phase pattern instead of wrapping
	/// blob I/O in a database transaction:
	/// the destination node is recorded with `size = 0` first, then blob
	/// work happens outside any transaction, then the final size commits.
	#[instrument(skip(self, source_key, dest_key), fields(source = %source.id))]
	pub async fn copy_file(
		&self,
		source: &Node,
		dest_parent: Option<&Node>,
		dest_name: &str,
		source_key: Option<&UserKey>,
		dest_key: Option<&UserKey>,
		dest_encrypt: bool,
	) -> Result<Node, ChunkError> {
		let dest_parent_id = dest_parent.map(|p| p.id);
		let dest_parent_path = dest_parent.map(|p| p.path.clone()).unwrap_or_default();
		let (name, path) = namespace::unique_path(&self.store, source.user_id, &dest_parent_path, dest_name).await?;

		let now = Utc::now();
		let dest_node = Node {
			id: Uuid::new_v4(),
			user_id: source.user_id,
			parent_id: dest_parent_id,
			name,
			path,
			node_type: NodeType::File,
			size: 0,
			mime_type: source.mime_type.clone(),
			encrypted: dest_encrypt,
			starred: false,
			created_at: now,
			updated_at: now,
			deleted_at: None,
			original_path: None,
			deleted_with_parent_id: None,
		};
		let dest_node = namespace::create_node_with_unique_name(&self.store, dest_node).await?;

		match self
			.copy_chunks(source, &dest_node, source_key, dest_key, dest_encrypt)
			.await
		{
			Ok(total_size) => {
				let mut finished = dest_node.clone();
				finished.size = total_size;
				finished.updated_at = Utc::now();
				self.store.update_node(&finished).await?;
				Ok(finished)
			}
			Err(err) => {
				self.rollback_upload(&dest_node).await;
				Err(err)
			}
		}
	}

	async fn copy_chunks(
		&self,
		source: &Node,
		dest: &Node,
		source_key: Option<&UserKey>,
		dest_key: Option<&UserKey>,
		dest_encrypt: bool,
	) -> Result<u64, ChunkError> {
		let pointers = self.store.list_chunk_pointers(source.id).await?;
		let mut dest_index = 0i32;
		let mut total_size = 0u64;

		for pointer in &pointers {
			let raw = self.blob.get(&pointer.message_id, &pointer.channel_id).await?;
			let plaintext = self.decrypt_if_needed(source, &raw, source_key)?;

			for (part, block) in plaintext.chunks(EFFECTIVE_CHUNK_SIZE).enumerate() {
				let payload: Vec<u8> = if dest_encrypt {
					let key = dest_key.ok_or_else(|| {
						ChunkError::Internal("encrypt requested without a destination key".into())
					})?;
					encrypt_chunk(block, key)?
				} else {
					block.to_vec()
				};

				let blob_name = if plaintext.len() > EFFECTIVE_CHUNK_SIZE {
					format!("{}_chunk_{}_part{}_{}", dest.id, dest_index, part, dest.name)
				} else {
					format!("{}_chunk_{}_{}", dest.id, dest_index, dest.name)
				};
				let location = self.upload_with_retry(&blob_name, Bytes::from(payload)).await?;

				let plaintext_size = block.len() as u64;
				self.store
					.insert_chunk_pointer(&ChunkPointer {
						id: Uuid::new_v4(),
						file_id: dest.id,
						chunk_index: dest_index,
						message_id: location.message_id,
						channel_id: location.channel_id,
						attachment_url: location.url,
						size: plaintext_size,
					})
					.await?;

				total_size += plaintext_size;
				dest_index += 1;
			}
		}

		Ok(total_size)
	}

	/// Permanently delete a file or directory subtree: chunk rows first,
	/// then node rows, both in one transaction. Remote blob cleanup is
	/// left to the reconciler.
	#[instrument(skip(self), fields(node = %node.id))]
	pub async fn delete_permanent(&self, node: &Node) -> Result<(), ChunkError> {
		let mut ids = vec![node.id];
		if node.is_directory() {
			let descendants = if node.is_trashed() {
				self.store.find_trashed_with_parent(node.id).await?
			} else {
				self.store.find_descendants(node.user_id, &node.path).await?
			};
			ids.extend(descendants.iter().map(|n| n.id));
		}

		let mut conn = self.store.pool().get().await.map_err(StoreError::from)?;
		let txn = conn.transaction().await.map_err(StoreError::from_db)?;
		self.store.delete_chunk_pointers_by_file_txn(&txn, &ids).await?;
		self.store.delete_nodes_txn(&txn, &ids).await?;
		txn.commit().await.map_err(StoreError::from_db)?;
		Ok(())
	}

	/// Move a subtree into the recycle bin. The entry's own update and
	/// every descendant's update commit in one transaction.
	#[instrument(skip(self), fields(node = %node.id))]
	pub async fn delete_soft(&self, node: &Node) -> Result<Node, ChunkError> {
		let trash_id: String = rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(8)
			.map(char::from)
			.collect();

		let now = Utc::now();
		let trash_root = format!("/.trash/{trash_id}{}", node.path);

		let mut entry = node.clone();
		entry.original_path = Some(node.path.clone());
		entry.deleted_at = Some(now);
		entry.deleted_with_parent_id = None;
		entry.path = trash_root.clone();
		entry.updated_at = now;

		let descendants = if node.is_directory() {
			self.store.find_descendants(node.user_id, &node.path).await?
		} else {
			Vec::new()
		};

		let mut conn = self.store.pool().get().await.map_err(StoreError::from)?;
		let txn = conn.transaction().await.map_err(StoreError::from_db)?;
		self.store.update_node_txn(&txn, &entry).await?;
		for mut descendant in descendants {
			let suffix = &descendant.path[node.path.len()..];
			descendant.original_path = Some(descendant.path.clone());
			descendant.deleted_at = Some(now);
			descendant.deleted_with_parent_id = Some(entry.id);
			descendant.path = format!("{trash_root}{suffix}");
			descendant.updated_at = now;
			self.store.update_node_txn(&txn, &descendant).await?;
		}
		txn.commit().await.map_err(StoreError::from_db)?;

		Ok(entry)
	}

	/// Restore a trashed entry and everything sharing its
	/// `deletedWithParentId`. Every affected row commits in one
	/// transaction.
	#[instrument(skip(self), fields(node = %entry.id))]
	pub async fn restore(&self, entry: &Node) -> Result<Node, ChunkError> {
		let original_path = entry
			.original_path
			.clone()
			.ok_or_else(|| ChunkError::Internal("restore target has no original_path".into()))?;

		let original_parent_path = original_path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
		let original_name = original_path.rsplit('/').next().unwrap_or(&original_path);

		let target_parent_exists = if original_parent_path.is_empty() {
			true
		} else {
			self.store
				.find_by_path(entry.user_id, original_parent_path)
				.await?
				.is_some()
		};

		let (final_parent_path, final_parent_id) = if target_parent_exists {
			if original_parent_path.is_empty() {
				(String::new(), None)
			} else {
				let parent = self
					.store
					.find_by_path(entry.user_id, original_parent_path)
					.await?
					.expect("checked above");
				let id = parent.id;
				(parent.path, Some(id))
			}
		} else {
			(String::new(), None)
		};

		let (final_name, final_path) =
			namespace::unique_path(&self.store, entry.user_id, &final_parent_path, original_name).await?;

		let old_trash_path = entry.path.clone();
		let mut restored = entry.clone();
		restored.name = final_name;
		restored.path = final_path.clone();
		restored.parent_id = final_parent_id;
		restored.deleted_at = None;
		restored.original_path = None;
		restored.deleted_with_parent_id = None;
		restored.updated_at = Utc::now();

		let descendants = self.store.find_trashed_with_parent(entry.id).await?;

		let mut conn = self.store.pool().get().await.map_err(StoreError::from)?;
		let txn = conn.transaction().await.map_err(StoreError::from_db)?;
		self.store.update_node_txn(&txn, &restored).await?;
		for mut descendant in descendants {
			let suffix = &descendant.path[old_trash_path.len()..];
			descendant.path = format!("{final_path}{suffix}");
			descendant.deleted_at = None;
			descendant.original_path = None;
			descendant.deleted_with_parent_id = None;
			descendant.updated_at = Utc::now();
			self.store.update_node_txn(&txn, &descendant).await?;
		}
		txn.commit().await.map_err(StoreError::from_db)?;

		Ok(restored)
	}
}

