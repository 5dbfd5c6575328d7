//! The stateless façade a caller (HTTP layer, CLI, whatever else) drives
//! the storage engine through. Authentication is a precondition the
//! caller has already established; this layer never performs it, only
//! consumes the resulting `userId`.

use std::sync::Arc;

use chrono::Utc;
use ddrive_blob::BlobAdapter;
use ddrive_crypto::UserKey;
use ddrive_store::{MetadataStore, Node, Permission, PublicLink, Share};
use uuid::Uuid;

use crate::{
	engine::{ChunkEngine, RangeResult, StoreRequest},
	error::ChunkError,
	namespace,
	source::UploadSource,
};

pub struct DriveApi {
	store: MetadataStore,
	engine: ChunkEngine,
}

impl DriveApi {
	pub fn new(store: MetadataStore, blob: Arc<dyn BlobAdapter>) -> Self {
		let engine = ChunkEngine::new(store.clone(), blob);
		Self { store, engine }
	}

	pub async fn list_children(&self, user_id: Uuid, parent_id: Option<Uuid>) -> Result<Vec<Node>, ChunkError> {
		Ok(self.store.list_children(user_id, parent_id).await?)
	}

	pub async fn create_dir(
		&self,
		user_id: Uuid,
		parent: Option<Node>,
		name: &str,
	) -> Result<Node, ChunkError> {
		let parent_id = parent.as_ref().map(|p| p.id);
		let parent_path = parent.as_ref().map(|p| p.path.clone()).unwrap_or_default();
		let (resolved_name, path) = namespace::unique_path(&self.store, user_id, &parent_path, name).await?;

		let now = Utc::now();
		let node = Node {
			id: Uuid::new_v4(),
			user_id,
			parent_id,
			name: resolved_name,
			path,
			node_type: ddrive_store::NodeType::Directory,
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
		namespace::create_node_with_unique_name(&self.store, node).await
	}

	pub async fn upload_file(
		&self,
		owner: Uuid,
		parent: Option<Node>,
		name: &str,
		encrypt: bool,
		mime_type: Option<String>,
		source: UploadSource,
		user_key: Option<UserKey>,
	) -> Result<Node, ChunkError> {
		self.engine
			.store(StoreRequest {
				owner,
				parent,
				name: name.to_string(),
				encrypt,
				mime_type,
				source,
				user_key,
			})
			.await
	}

	pub async fn stream_file(&self, node: &Node, user_key: Option<&UserKey>) -> Result<bytes::Bytes, ChunkError> {
		self.engine.fetch_whole(node, user_key).await
	}

	pub async fn stream_file_range(
		&self,
		node: &Node,
		start: u64,
		end: u64,
		user_key: Option<&UserKey>,
	) -> Result<RangeResult, ChunkError> {
		self.engine.fetch_range(node, start, end, user_key).await
	}

	pub async fn rename(&self, node: &Node, new_name: &str) -> Result<Node, ChunkError> {
		namespace::rename(&self.store, node, new_name).await
	}

	pub async fn r#move(&self, node: &Node, new_parent: Option<&Node>) -> Result<Node, ChunkError> {
		namespace::move_node(&self.store, node, new_parent).await
	}

	pub async fn soft_delete(&self, node: &Node) -> Result<Node, ChunkError> {
		self.engine.delete_soft(node).await
	}

	pub async fn restore(&self, trashed: &Node) -> Result<Node, ChunkError> {
		self.engine.restore(trashed).await
	}

	pub async fn permanent_delete(&self, node: &Node) -> Result<(), ChunkError> {
		self.engine.delete_permanent(node).await
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn copy(
		&self,
		source: &Node,
		dest_parent: Option<&Node>,
		dest_name: &str,
		source_key: Option<&UserKey>,
		dest_key: Option<&UserKey>,
		dest_encrypt: bool,
	) -> Result<Node, ChunkError> {
		self.engine
			.copy_file(source, dest_parent, dest_name, source_key, dest_key, dest_encrypt)
			.await
	}

	pub async fn toggle_star(&self, node: &Node) -> Result<Node, ChunkError> {
		let mut updated = node.clone();
		updated.starred = !updated.starred;
		updated.updated_at = Utc::now();
		self.store.update_node(&updated).await?;
		Ok(updated)
	}

	pub async fn list_starred(&self, user_id: Uuid) -> Result<Vec<Node>, ChunkError> {
		Ok(self
			.store
			.find_descendants(user_id, "")
			.await?
			.into_iter()
			.filter(|n| n.starred && !n.is_trashed())
			.collect())
	}

	pub async fn list_trash(&self, user_id: Uuid) -> Result<Vec<Node>, ChunkError> {
		Ok(self.store.list_trash(user_id).await?)
	}

	/// Permanently delete every recycle-bin entry point (not its
	/// descendants individually — those cascade-delete with their entry
	/// point via [`crate::engine::ChunkEngine::delete_permanent`]).
	pub async fn empty_trash(&self, user_id: Uuid) -> Result<(), ChunkError> {
		let trashed = self.store.list_trash(user_id).await?;
		for node in trashed {
			if node.deleted_with_parent_id.is_none() {
				self.engine.delete_permanent(&node).await?;
			}
		}
		Ok(())
	}

	pub async fn create_public_link(
		&self,
		user_id: Uuid,
		file_id: Uuid,
		slug: String,
		expires_at: Option<chrono::DateTime<Utc>>,
	) -> Result<PublicLink, ChunkError> {
		Ok(self
			.store
			.create_public_link(&PublicLink {
				id: Uuid::new_v4(),
				slug,
				file_id,
				user_id,
				expires_at,
			})
			.await?)
	}

	pub async fn resolve_public_link(&self, slug: &str) -> Result<Node, ChunkError> {
		let link = self
			.store
			.find_public_link(slug)
			.await?
			.ok_or(ChunkError::NotFound)?;
		if link.is_expired(Utc::now()) {
			return Err(ChunkError::NotFound);
		}
		self.store.get_node(link.file_id).await.map_err(Into::into)
	}

	pub async fn share(
		&self,
		owner_id: Uuid,
		file_id: Uuid,
		shared_with_id: Uuid,
		permission: Permission,
	) -> Result<Share, ChunkError> {
		Ok(self
			.store
			.create_share(&Share {
				id: Uuid::new_v4(),
				file_id,
				owner_id,
				shared_with_id,
				permission,
			})
			.await?)
	}

	pub async fn revoke_share(&self, share_id: Uuid) -> Result<(), ChunkError> {
		Ok(self.store.delete_share(share_id).await?)
	}

	pub async fn list_shared_with_me(&self, user_id: Uuid) -> Result<Vec<Share>, ChunkError> {
		Ok(self.store.list_shared_with(user_id).await?)
	}
}
