//! Narrow, typed query surface over the connection pool.
//!
//! Most methods here open their own connection and run a single statement.
//! Callers that need several row changes to commit or roll back together —
//! a rename's own update plus its descendant cascade, a delete that must
//! drop chunk rows and the node row as one unit — open a transaction via
//! [`MetadataStore::pool`] and use the `_txn` variants below, which take an
//! already-open [`Transaction`] instead of acquiring their own connection.

use chrono::{DateTime, Utc};
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

use crate::{
	error::StoreError,
	models::{ChunkPointer, LogEntry, LogLevel, Node, NodeType, PublicLink, Share, Task},
	pool::PgPool,
};

#[derive(Clone)]
pub struct MetadataStore {
	pool: PgPool,
}

impl MetadataStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	// -- nodes ---------------------------------------------------------

	/// Insert a new node row. Callers are responsible for having already
	/// resolved a collision-free `path`.
	pub async fn create_node(&self, node: &Node) -> Result<Node, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_one(
				"INSERT INTO nodes (
					id, user_id, parent_id, name, path, node_type, size, mime_type,
					encrypted, starred, created_at, updated_at
				) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
				RETURNING *",
				&[
					&node.id,
					&node.user_id,
					&node.parent_id,
					&node.name,
					&node.path,
					&node_type_str(node.node_type),
					&(node.size as i64),
					&node.mime_type,
					&node.encrypted,
					&node.starred,
					&node.created_at,
					&node.updated_at,
				],
			)
			.await
			.map_err(StoreError::from_db)?;
		row_to_node(&row)
	}

	pub async fn update_node(&self, node: &Node) -> Result<(), StoreError> {
		let conn = self.pool.get().await?;
		conn.execute(
			"UPDATE nodes SET
				parent_id = $2, name = $3, path = $4, size = $5, mime_type = $6,
				encrypted = $7, starred = $8, updated_at = $9,
				deleted_at = $10, original_path = $11, deleted_with_parent_id = $12
			WHERE id = $1",
			&[
				&node.id,
				&node.parent_id,
				&node.name,
				&node.path,
				&(node.size as i64),
				&node.mime_type,
				&node.encrypted,
				&node.starred,
				&node.updated_at,
				&node.deleted_at,
				&node.original_path,
				&node.deleted_with_parent_id,
			],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}

	/// As [`Self::update_node`], but as part of an already-open transaction.
	pub async fn update_node_txn(&self, txn: &Transaction<'_>, node: &Node) -> Result<(), StoreError> {
		txn.execute(
			"UPDATE nodes SET
				parent_id = $2, name = $3, path = $4, size = $5, mime_type = $6,
				encrypted = $7, starred = $8, updated_at = $9,
				deleted_at = $10, original_path = $11, deleted_with_parent_id = $12
			WHERE id = $1",
			&[
				&node.id,
				&node.parent_id,
				&node.name,
				&node.path,
				&(node.size as i64),
				&node.mime_type,
				&node.encrypted,
				&node.starred,
				&node.updated_at,
				&node.deleted_at,
				&node.original_path,
				&node.deleted_with_parent_id,
			],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}

	/// Delete nodes by id, inside their own transaction. Chunk pointers must
	/// already have been removed by the caller — this does not
	/// cascade, to keep the blob-cleanup discipline explicit at the call
	/// site rather than implicit in a foreign key.
	pub async fn delete_nodes(&self, ids: &[Uuid]) -> Result<(), StoreError> {
		if ids.is_empty() {
			return Ok(());
		}
		let mut conn = self.pool.get().await?;
		let txn = conn.transaction().await.map_err(StoreError::from_db)?;
		txn.execute("DELETE FROM nodes WHERE id = ANY($1)", &[&ids])
			.await
			.map_err(StoreError::from_db)?;
		txn.commit().await.map_err(StoreError::from_db)?;
		Ok(())
	}

	/// As [`Self::delete_nodes`], but as part of an already-open transaction,
	/// so the caller can commit it alongside a chunk-pointer delete.
	pub async fn delete_nodes_txn(&self, txn: &Transaction<'_>, ids: &[Uuid]) -> Result<(), StoreError> {
		if ids.is_empty() {
			return Ok(());
		}
		txn.execute("DELETE FROM nodes WHERE id = ANY($1)", &[&ids])
			.await
			.map_err(StoreError::from_db)?;
		Ok(())
	}

	pub async fn find_by_path(&self, user_id: Uuid, path: &str) -> Result<Option<Node>, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt(
				"SELECT * FROM nodes WHERE user_id = $1 AND path = $2 AND deleted_at IS NULL",
				&[&user_id, &path],
			)
			.await
			.map_err(StoreError::from_db)?;
		row.as_ref().map(row_to_node).transpose()
	}

	pub async fn list_children(&self, user_id: Uuid, parent_id: Option<Uuid>) -> Result<Vec<Node>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				"SELECT * FROM nodes WHERE user_id = $1 AND parent_id IS NOT DISTINCT FROM $2
					AND deleted_at IS NULL ORDER BY node_type, name",
				&[&user_id, &parent_id],
			)
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_node).collect()
	}

	/// Every live node whose `path` begins with `path_prefix || "/"`, i.e.
	/// the descendants of the node at `path_prefix`.
	pub async fn find_descendants(&self, user_id: Uuid, path_prefix: &str) -> Result<Vec<Node>, StoreError> {
		let conn = self.pool.get().await?;
		let like_pattern = format!("{path_prefix}/%");
		let rows = conn
			.query(
				"SELECT * FROM nodes WHERE user_id = $1 AND path LIKE $2 AND deleted_at IS NULL",
				&[&user_id, &like_pattern],
			)
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_node).collect()
	}

	/// Every trashed node belonging to `user_id`.
	pub async fn list_trash(&self, user_id: Uuid) -> Result<Vec<Node>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				"SELECT * FROM nodes WHERE user_id = $1 AND deleted_at IS NOT NULL",
				&[&user_id],
			)
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_node).collect()
	}

	/// As [`Self::find_descendants`], but including trashed nodes under a
	/// given trash-path prefix. Used by restore to find everything
	/// sharing a `deletedWithParentId`.
	pub async fn find_trashed_with_parent(&self, entry_id: Uuid) -> Result<Vec<Node>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				"SELECT * FROM nodes WHERE deleted_with_parent_id = $1",
				&[&entry_id],
			)
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_node).collect()
	}

	pub async fn find_recycle_bin_older_than(
		&self,
		cutoff: DateTime<Utc>,
	) -> Result<Vec<Node>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query("SELECT * FROM nodes WHERE deleted_at < $1", &[&cutoff])
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_node).collect()
	}

	pub async fn get_node(&self, id: Uuid) -> Result<Node, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt("SELECT * FROM nodes WHERE id = $1", &[&id])
			.await
			.map_err(StoreError::from_db)?
			.ok_or(StoreError::NotFound)?;
		row_to_node(&row)
	}

	// -- chunk pointers --------------------------------------------------

	pub async fn insert_chunk_pointer(&self, chunk: &ChunkPointer) -> Result<(), StoreError> {
		let conn = self.pool.get().await?;
		conn.execute(
			"INSERT INTO chunk_pointers (id, file_id, chunk_index, message_id, channel_id, attachment_url, size)
			VALUES ($1, $2, $3, $4, $5, $6, $7)",
			&[
				&chunk.id,
				&chunk.file_id,
				&chunk.chunk_index,
				&chunk.message_id,
				&chunk.channel_id,
				&chunk.attachment_url,
				&(chunk.size as i64),
			],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}

	pub async fn list_chunk_pointers(&self, file_id: Uuid) -> Result<Vec<ChunkPointer>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				"SELECT * FROM chunk_pointers WHERE file_id = $1 ORDER BY chunk_index ASC",
				&[&file_id],
			)
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_chunk_pointer).collect()
	}

	pub async fn delete_chunk_pointers_by_file(&self, file_ids: &[Uuid]) -> Result<(), StoreError> {
		if file_ids.is_empty() {
			return Ok(());
		}
		let conn = self.pool.get().await?;
		conn.execute(
			"DELETE FROM chunk_pointers WHERE file_id = ANY($1)",
			&[&file_ids],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}

	/// As [`Self::delete_chunk_pointers_by_file`], but as part of an
	/// already-open transaction.
	pub async fn delete_chunk_pointers_by_file_txn(
		&self,
		txn: &Transaction<'_>,
		file_ids: &[Uuid],
	) -> Result<(), StoreError> {
		if file_ids.is_empty() {
			return Ok(());
		}
		txn.execute(
			"DELETE FROM chunk_pointers WHERE file_id = ANY($1)",
			&[&file_ids],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}

	/// The set of every `(message_id)` currently referenced by a chunk
	/// pointer, for the reconciler's orphaned-blob sweep.
	pub async fn scan_chunk_pointer_message_ids(&self) -> Result<Vec<String>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query("SELECT message_id FROM chunk_pointers", &[])
			.await
			.map_err(StoreError::from_db)?;
		Ok(rows.iter().map(|r| r.get("message_id")).collect())
	}

	// -- shares -----------------------------------------------------------

	pub async fn create_share(&self, share: &Share) -> Result<Share, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_one(
				"INSERT INTO shares (id, file_id, owner_id, shared_with_id, permission)
				VALUES ($1, $2, $3, $4, $5) RETURNING *",
				&[
					&share.id,
					&share.file_id,
					&share.owner_id,
					&share.shared_with_id,
					&permission_str(share.permission),
				],
			)
			.await
			.map_err(StoreError::from_db)?;
		row_to_share(&row)
	}

	pub async fn delete_share(&self, id: Uuid) -> Result<(), StoreError> {
		let conn = self.pool.get().await?;
		conn.execute("DELETE FROM shares WHERE id = $1", &[&id])
			.await
			.map_err(StoreError::from_db)?;
		Ok(())
	}

	pub async fn list_shared_with(&self, user_id: Uuid) -> Result<Vec<Share>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query("SELECT * FROM shares WHERE shared_with_id = $1", &[&user_id])
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_share).collect()
	}

	// -- public links -------------------------------------------------------

	pub async fn create_public_link(&self, link: &PublicLink) -> Result<PublicLink, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_one(
				"INSERT INTO public_links (id, slug, file_id, user_id, expires_at)
				VALUES ($1, $2, $3, $4, $5) RETURNING *",
				&[&link.id, &link.slug, &link.file_id, &link.user_id, &link.expires_at],
			)
			.await
			.map_err(StoreError::from_db)?;
		row_to_public_link(&row)
	}

	pub async fn find_public_link(&self, slug: &str) -> Result<Option<PublicLink>, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt("SELECT * FROM public_links WHERE slug = $1", &[&slug])
			.await
			.map_err(StoreError::from_db)?;
		row.as_ref().map(row_to_public_link).transpose()
	}

	// -- tasks ----------------------------------------------------------------

	pub async fn list_enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query("SELECT * FROM tasks WHERE enabled", &[])
			.await
			.map_err(StoreError::from_db)?;
		rows.iter().map(row_to_task).collect()
	}

	pub async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt("SELECT * FROM tasks WHERE id = $1", &[&id])
			.await
			.map_err(StoreError::from_db)?
			.ok_or(StoreError::NotFound)?;
		row_to_task(&row)
	}

	pub async fn mark_task_started(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
		let conn = self.pool.get().await?;
		conn.execute("UPDATE tasks SET last_started = $2 WHERE id = $1", &[&id, &at])
			.await
			.map_err(StoreError::from_db)?;
		Ok(())
	}

	pub async fn mark_task_finished(
		&self,
		id: Uuid,
		finished_at: DateTime<Utc>,
		runtime: Option<chrono::Duration>,
	) -> Result<(), StoreError> {
		let conn = self.pool.get().await?;
		conn.execute(
			"UPDATE tasks SET last_run = $2, last_runtime = $3 WHERE id = $1",
			&[&id, &finished_at, &runtime.map(|d| d.num_milliseconds())],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}

	// -- audit log --------------------------------------------------------

	pub async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
		let conn = self.pool.get().await?;
		conn.execute(
			"INSERT INTO logs (id, user_id, level, category, message, created_at)
			VALUES ($1, $2, $3, $4, $5, $6)",
			&[
				&entry.id,
				&entry.user_id,
				&log_level_str(entry.level),
				&entry.category,
				&entry.message,
				&entry.created_at,
			],
		)
		.await
		.map_err(StoreError::from_db)?;
		Ok(())
	}
}

/// Append a log entry using an already-open transaction, so node mutations
/// and their audit trail commit atomically.
pub async fn append_log_in_txn(txn: &Transaction<'_>, entry: &LogEntry) -> Result<(), StoreError> {
	txn.execute(
		"INSERT INTO logs (id, user_id, level, category, message, created_at)
		VALUES ($1, $2, $3, $4, $5, $6)",
		&[
			&entry.id,
			&entry.user_id,
			&log_level_str(entry.level),
			&entry.category,
			&entry.message,
			&entry.created_at,
		],
	)
	.await
	.map_err(StoreError::from_db)?;
	Ok(())
}

fn node_type_str(t: NodeType) -> &'static str {
	match t {
		NodeType::File => "FILE",
		NodeType::Directory => "DIRECTORY",
	}
}

fn permission_str(p: crate::models::Permission) -> &'static str {
	match p {
		crate::models::Permission::View => "VIEW",
		crate::models::Permission::Edit => "EDIT",
	}
}

fn log_level_str(level: LogLevel) -> &'static str {
	match level {
		LogLevel::Info => "INFO",
		LogLevel::Warn => "WARN",
		LogLevel::Error => "ERROR",
	}
}

fn row_to_node(row: &Row) -> Result<Node, StoreError> {
	let node_type: String = row.get("node_type");
	let size: i64 = row.get("size");
	Ok(Node {
		id: row.get("id"),
		user_id: row.get("user_id"),
		parent_id: row.get("parent_id"),
		name: row.get("name"),
		path: row.get("path"),
		node_type: match node_type.as_str() {
			"FILE" => NodeType::File,
			"DIRECTORY" => NodeType::Directory,
			other => return Err(StoreError::Decode(format!("unknown node_type {other}"))),
		},
		size: size as u64,
		mime_type: row.get("mime_type"),
		encrypted: row.get("encrypted"),
		starred: row.get("starred"),
		created_at: row.get("created_at"),
		updated_at: row.get("updated_at"),
		deleted_at: row.get("deleted_at"),
		original_path: row.get("original_path"),
		deleted_with_parent_id: row.get("deleted_with_parent_id"),
	})
}

fn row_to_chunk_pointer(row: &Row) -> Result<ChunkPointer, StoreError> {
	let size: i64 = row.get("size");
	Ok(ChunkPointer {
		id: row.get("id"),
		file_id: row.get("file_id"),
		chunk_index: row.get("chunk_index"),
		message_id: row.get("message_id"),
		channel_id: row.get("channel_id"),
		attachment_url: row.get("attachment_url"),
		size: size as u64,
	})
}

fn row_to_share(row: &Row) -> Result<Share, StoreError> {
	let permission: String = row.get("permission");
	Ok(Share {
		id: row.get("id"),
		file_id: row.get("file_id"),
		owner_id: row.get("owner_id"),
		shared_with_id: row.get("shared_with_id"),
		permission: match permission.as_str() {
			"VIEW" => crate::models::Permission::View,
			"EDIT" => crate::models::Permission::Edit,
			other => return Err(StoreError::Decode(format!("unknown permission {other}"))),
		},
	})
}

fn row_to_public_link(row: &Row) -> Result<PublicLink, StoreError> {
	Ok(PublicLink {
		id: row.get("id"),
		slug: row.get("slug"),
		file_id: row.get("file_id"),
		user_id: row.get("user_id"),
		expires_at: row.get("expires_at"),
	})
}

fn row_to_task(row: &Row) -> Result<Task, StoreError> {
	let compress: String = row.get("compress");
	let source_json: serde_json::Value = row.get("source");
	let source = serde_json::from_value(source_json)
		.map_err(|e| StoreError::Decode(format!("invalid source credentials: {e}")))?;
	let last_runtime_ms: Option<i64> = row.get("last_runtime");
	Ok(Task {
		id: row.get("id"),
		user_id: row.get("user_id"),
		name: row.get("name"),
		cron: row.get("cron"),
		enabled: row.get("enabled"),
		source,
		sftp_path: row.get("sftp_path"),
		destination_id: row.get("destination_id"),
		destination_path: row.get("destination_path"),
		exclude_paths: row.get("exclude_paths"),
		compress: match compress.as_str() {
			"NONE" => crate::models::Compression::None,
			"ZIP" => crate::models::Compression::Zip,
			"TAR_GZ" => crate::models::Compression::TarGz,
			other => return Err(StoreError::Decode(format!("unknown compression {other}"))),
		},
		timestamp_names: row.get("timestamp_names"),
		encrypt: row.get("encrypt"),
		max_files: row.get::<_, Option<i32>>("max_files").map(|n| n as u32),
		skip_prescan: row.get("skip_prescan"),
		priority: row.get("priority"),
		last_started: row.get("last_started"),
		last_run: row.get("last_run"),
		last_runtime: last_runtime_ms.map(chrono::Duration::milliseconds),
	})
}
