//! Input sources for [`crate::engine::store`]: an on-disk path, a
//! bounded in-memory buffer, or an arbitrary streaming byte source.

use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub enum UploadSource {
	Path(PathBuf),
	Buffer(Bytes),
	Stream(Box<dyn AsyncRead + Unpin + Send>),
}

impl UploadSource {
	/// The known total size, if cheaply knowable without reading the whole
	/// source (files and buffers; `None` for an arbitrary stream).
	pub async fn known_size(&self) -> std::io::Result<Option<u64>> {
		match self {
			UploadSource::Path(path) => Ok(Some(tokio::fs::metadata(path).await?.len())),
			UploadSource::Buffer(bytes) => Ok(Some(bytes.len() as u64)),
			UploadSource::Stream(_) => Ok(None),
		}
	}

	/// Turn this source into a [`ChunkReader`] that yields fixed-size
	/// blocks in order.
	pub async fn into_reader(self) -> std::io::Result<ChunkReader> {
		match self {
			UploadSource::Path(path) => {
				let file = tokio::fs::File::open(path).await?;
				Ok(ChunkReader::Async(Box::new(file)))
			}
			UploadSource::Buffer(bytes) => Ok(ChunkReader::Buffer { bytes, offset: 0 }),
			UploadSource::Stream(stream) => Ok(ChunkReader::Async(stream)),
		}
	}
}

/// Reads fixed-size blocks from whatever source backs an upload. Block size
/// here is fixed per call — the storage engine's block size is a property
/// of encryption state, not of transient upload failures.
pub enum ChunkReader {
	Async(Box<dyn AsyncRead + Unpin + Send>),
	Buffer { bytes: Bytes, offset: usize },
}

impl ChunkReader {
	/// Read up to `block_size` bytes, or `None` at end of input.
	pub async fn next_block(&mut self, block_size: usize) -> std::io::Result<Option<Bytes>> {
		match self {
			ChunkReader::Async(reader) => {
				let mut buf = BytesMut::with_capacity(block_size);
				while buf.len() < block_size {
					let mut tmp = vec![0u8; block_size - buf.len()];
					let n = reader.read(&mut tmp).await?;
					if n == 0 {
						break;
					}
					buf.extend_from_slice(&tmp[..n]);
				}
				if buf.is_empty() {
					Ok(None)
				} else {
					Ok(Some(buf.freeze()))
				}
			}
			ChunkReader::Buffer { bytes, offset } => {
				if *offset >= bytes.len() {
					return Ok(None);
				}
				let end = (*offset + block_size).min(bytes.len());
				let block = bytes.slice(*offset..end);
				*offset = end;
				Ok(Some(block))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn buffer_source_yields_fixed_blocks() {
		let source = UploadSource::Buffer(Bytes::from_static(b"0123456789"));
		let mut reader = source.into_reader().await.unwrap();
		assert_eq!(reader.next_block(4).await.unwrap().unwrap().as_ref(), b"0123");
		assert_eq!(reader.next_block(4).await.unwrap().unwrap().as_ref(), b"4567");
		assert_eq!(reader.next_block(4).await.unwrap().unwrap().as_ref(), b"89");
		assert!(reader.next_block(4).await.unwrap().is_none());
	}
}
