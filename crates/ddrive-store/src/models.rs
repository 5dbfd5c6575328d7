//! Entity types for the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
	pub id: Uuid,
	pub auth_subject: String,
	pub display_name: String,
	pub encryption_key: Option<Vec<u8>>,
	pub encrypt_by_default: bool,
	pub recycle_bin_enabled: bool,
	pub allow_shared_with_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
	File,
	Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
	pub id: Uuid,
	pub user_id: Uuid,
	pub parent_id: Option<Uuid>,
	pub name: String,
	pub path: String,
	pub node_type: NodeType,
	pub size: u64,
	pub mime_type: Option<String>,
	pub encrypted: bool,
	pub starred: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
	pub original_path: Option<String>,
	pub deleted_with_parent_id: Option<Uuid>,
}

impl Node {
	pub fn is_directory(&self) -> bool {
		matches!(self.node_type, NodeType::Directory)
	}

	pub fn is_trashed(&self) -> bool {
		self.deleted_at.is_some()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPointer {
	pub id: Uuid,
	pub file_id: Uuid,
	pub chunk_index: i32,
	pub message_id: String,
	pub channel_id: String,
	pub attachment_url: String,
	/// Plaintext length of this chunk, in bytes.
	pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
	View,
	Edit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
	pub id: Uuid,
	pub file_id: Uuid,
	pub owner_id: Uuid,
	pub shared_with_id: Uuid,
	pub permission: Permission,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicLink {
	pub id: Uuid,
	pub slug: String,
	pub file_id: Uuid,
	pub user_id: Uuid,
	pub expires_at: Option<DateTime<Utc>>,
}

impl PublicLink {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|expiry| expiry <= now)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
	None,
	Zip,
	TarGz,
}

/// Opaque, server-side-only source credentials for a backup task. Stored
/// encrypted at rest by the caller; the store itself treats this as an
/// opaque blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCredentials {
	pub host: String,
	pub port: u16,
	pub user: String,
	pub password: Option<Vec<u8>>,
	pub private_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	pub id: Uuid,
	pub user_id: Uuid,
	pub name: String,
	pub cron: String,
	pub enabled: bool,
	pub source: SourceCredentials,
	pub sftp_path: String,
	pub destination_id: Uuid,
	pub destination_path: String,
	pub exclude_paths: Vec<String>,
	pub compress: Compression,
	pub timestamp_names: bool,
	pub encrypt: bool,
	pub max_files: Option<u32>,
	pub skip_prescan: bool,
	pub priority: i32,
	pub last_started: Option<DateTime<Utc>>,
	pub last_run: Option<DateTime<Utc>>,
	pub last_runtime: Option<chrono::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
	Info,
	Warn,
	Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
	pub id: Uuid,
	pub user_id: Uuid,
	pub level: LogLevel,
	pub category: String,
	pub message: String,
	pub created_at: DateTime<Utc>,
}
