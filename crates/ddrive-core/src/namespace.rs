//! Path uniquification, rename/move cascade, and cycle detection.
//!
//! `path` is always a pure function of `(parent.path, name)`; every mutation here derives it fresh rather than trusting a
//! caller-supplied value.

use chrono::Utc;
use ddrive_store::{MetadataStore, Node, StoreError};
use tokio_postgres::Transaction;
use uuid::Uuid;

use crate::error::ChunkError;

/// How many times [`create_node_with_unique_name`] retries after losing a
/// race with a concurrent create before giving up with
/// [`ChunkError::NamespaceRace`].
const MAX_RACE_RETRIES: u32 = 5;

/// Child path under `parent_path`. `parent_path` is `""` for root, so a
/// root-level child's path is `"/name"`.
pub fn child_path(parent_path: &str, name: &str) -> String {
	format!("{parent_path}/{name}")
}

/// The path of `node`'s parent: `""` if `node` is at root, otherwise the
/// looked-up parent's `path`.
pub async fn parent_path_of(store: &MetadataStore, node: &Node) -> Result<String, ChunkError> {
	match node.parent_id {
		None => Ok(String::new()),
		Some(parent_id) => Ok(store.get_node(parent_id).await?.path),
	}
}

fn split_stem_ext(name: &str) -> (&str, &str) {
	match name.rfind('.') {
		Some(0) => (name, ""),
		Some(idx) => (&name[..idx], &name[idx..]),
		None => (name, ""),
	}
}

fn numbered_candidate(name: &str, n: u32) -> String {
	if n == 0 {
		return name.to_string();
	}
	let (stem, ext) = split_stem_ext(name);
	format!("{stem} ({n}){ext}")
}

/// Probe `(userId, parentPath/candidate)` for a free name, starting at the
/// desired name and appending `" (1)"`, `" (2)"`, … before the extension
///. Bounded to a generous number of attempts; in practice a
/// directory will never accumulate this many same-named siblings.
pub async fn unique_path(
	store: &MetadataStore,
	user_id: Uuid,
	parent_path: &str,
	desired_name: &str,
) -> Result<(String, String), ChunkError> {
	for n in 0..10_000 {
		let candidate_name = numbered_candidate(desired_name, n);
		let candidate_path = child_path(parent_path, &candidate_name);
		if store.find_by_path(user_id, &candidate_path).await?.is_none() {
			return Ok((candidate_name, candidate_path));
		}
	}
	Err(ChunkError::NamespaceRace)
}

/// Insert `node` (whose `name`/`path` are the caller's first choice),
/// retrying with the next free numbered name whenever the insert loses a
/// race against a concurrent create that claimed the same path first.
pub async fn create_node_with_unique_name(
	store: &MetadataStore,
	mut node: Node,
) -> Result<Node, ChunkError> {
	let parent_path = match node.parent_id {
		None => String::new(),
		Some(parent_id) => store.get_node(parent_id).await?.path,
	};
	let desired_name = node.name.clone();

	for attempt in 0..=MAX_RACE_RETRIES {
		match store.create_node(&node).await {
			Ok(created) => return Ok(created),
			Err(StoreError::UniqueViolation { .. }) if attempt < MAX_RACE_RETRIES => {
				let (name, path) =
					unique_path(store, node.user_id, &parent_path, &desired_name).await?;
				node.name = name;
				node.path = path;
			}
			Err(other) => return Err(other.into()),
		}
	}

	Err(ChunkError::NamespaceRace)
}

/// Rewrite `path` for every live descendant of a node whose path is
/// changing from `old_path` to `new_path` (the new prefix is `newPath +
/// path[len(oldPath):]`). Takes an already-open transaction so the caller
/// can commit it together with the entry point's own update — a
/// transaction the store's connection pool does not provide on its own.
async fn cascade_descendants(
	store: &MetadataStore,
	txn: &Transaction<'_>,
	user_id: Uuid,
	old_path: &str,
	new_path: &str,
) -> Result<(), ChunkError> {
	let descendants = store.find_descendants(user_id, old_path).await?;
	for mut descendant in descendants {
		let suffix = &descendant.path[old_path.len()..];
		descendant.path = format!("{new_path}{suffix}");
		descendant.updated_at = Utc::now();
		store.update_node_txn(txn, &descendant).await?;
	}
	Ok(())
}

/// Rename `node` in place. Conflicts are rejected outright — rename/move
/// do not auto-number; the caller must choose a different name. The node's
/// own update and the descendant path cascade commit as one transaction.
pub async fn rename(store: &MetadataStore, node: &Node, new_name: &str) -> Result<Node, ChunkError> {
	let parent_path = parent_path_of(store, node).await?;
	let new_path = child_path(&parent_path, new_name);

	if new_path != node.path {
		if let Some(existing) = store.find_by_path(node.user_id, &new_path).await? {
			if existing.id != node.id {
				return Err(ChunkError::NameConflict);
			}
		}
	}

	let old_path = node.path.clone();
	let mut updated = node.clone();
	updated.name = new_name.to_string();
	updated.path = new_path.clone();
	updated.updated_at = Utc::now();

	let mut conn = store.pool().get().await.map_err(StoreError::from)?;
	let txn = conn.transaction().await.map_err(StoreError::from_db)?;
	store.update_node_txn(&txn, &updated).await?;
	if updated.is_directory() {
		cascade_descendants(store, &txn, node.user_id, &old_path, &new_path).await?;
	}
	txn.commit().await.map_err(StoreError::from_db)?;

	Ok(updated)
}

/// Move `node` to be a child of `new_parent` (`None` for root), keeping its
/// current name. Rejects conflicts with [`ChunkError::NameConflict`] and
/// moving a directory into its own subtree with [`ChunkError::Cycle`]. The
/// node's own update and the descendant path cascade commit as one
/// transaction.
pub async fn move_node(
	store: &MetadataStore,
	node: &Node,
	new_parent: Option<&Node>,
) -> Result<Node, ChunkError> {
	if let Some(parent) = new_parent {
		if parent.id == node.id || parent.path == node.path || parent.path.starts_with(&format!("{}/", node.path)) {
			return Err(ChunkError::Cycle);
		}
	}

	let new_parent_path = match new_parent {
		Some(parent) => parent.path.clone(),
		None => String::new(),
	};
	let new_path = child_path(&new_parent_path, &node.name);

	if new_path != node.path {
		if let Some(existing) = store.find_by_path(node.user_id, &new_path).await? {
			if existing.id != node.id {
				return Err(ChunkError::NameConflict);
			}
		}
	}

	let old_path = node.path.clone();
	let mut updated = node.clone();
	updated.parent_id = new_parent.map(|p| p.id);
	updated.path = new_path.clone();
	updated.updated_at = Utc::now();

	let mut conn = store.pool().get().await.map_err(StoreError::from)?;
	let txn = conn.transaction().await.map_err(StoreError::from_db)?;
	store.update_node_txn(&txn, &updated).await?;
	if updated.is_directory() {
		cascade_descendants(store, &txn, node.user_id, &old_path, &new_path).await?;
	}
	txn.commit().await.map_err(StoreError::from_db)?;

	Ok(updated)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numbers_before_extension() {
		assert_eq!(numbered_candidate("report.pdf", 0), "report.pdf");
		assert_eq!(numbered_candidate("report.pdf", 1), "report (1).pdf");
		assert_eq!(numbered_candidate("noext", 2), "noext (2)");
		assert_eq!(numbered_candidate(".hidden", 1), ".hidden (1)");
	}

	#[test]
	fn child_path_handles_root() {
		assert_eq!(child_path("", "a.txt"), "/a.txt");
		assert_eq!(child_path("/dir", "a.txt"), "/dir/a.txt");
	}
}
