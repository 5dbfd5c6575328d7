#![deny(rust_2018_idioms)]

//! The chunk engine, namespace manager, reconciler, and access surface
//!: everything that turns a metadata store and a blob adapter
//! into a coherent personal-cloud drive.

pub mod access;
pub mod engine;
pub mod error;
pub mod namespace;
pub mod reconciler;
pub mod source;

pub use access::DriveApi;
pub use engine::{ChunkEngine, RangeResult, StoreRequest};
pub use error::ChunkError;
pub use reconciler::{Reconciler, SweepReport};
pub use source::UploadSource;
