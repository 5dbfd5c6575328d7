#![deny(rust_2018_idioms)]

//! Typed persistence for users, nodes (files/directories), chunk pointers,
//! shares, public links, tasks, and the audit log.
//!
//! The store enforces the `(userId, path)` uniqueness invariant via a
//! partial index on non-deleted nodes, and surfaces unique-constraint
//! failures as [`error::StoreError::UniqueViolation`] rather than letting
//! callers match on raw SQLSTATE codes.

pub mod error;
pub mod models;
pub mod pool;
mod queries;

pub use error::StoreError;
pub use models::{
	ChunkPointer, Compression, LogEntry, LogLevel, Node, NodeType, Permission, PublicLink, Share,
	SourceCredentials, Task, User,
};
pub use pool::{PgPool, create_pool};
pub use queries::MetadataStore;
