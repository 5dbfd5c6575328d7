//! Archive writers for `compress=ZIP|TAR_GZ` transfers: a
//! single archive file streamed to a temp path as the source tree is
//! walked, then uploaded as one blob.

use std::{
	fs::File,
	io::Write,
	path::{Path, PathBuf},
};

use tar::Builder as TarBuilder;
use zip::{write::SimpleFileOptions, ZipWriter};

use crate::error::BackupError;

pub enum ArchiveWriter {
	Zip { writer: ZipWriter<File>, files_written: u64 },
	TarGz { builder: TarBuilder<flate2::write::GzEncoder<File>>, files_written: u64 },
}

impl ArchiveWriter {
	pub fn create_zip(path: &Path) -> Result<Self, BackupError> {
		let file = File::create(path)?;
		Ok(Self::Zip {
			writer: ZipWriter::new(file),
			files_written: 0,
		})
	}

	pub fn create_tar_gz(path: &Path) -> Result<Self, BackupError> {
		let file = File::create(path)?;
		let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
		Ok(Self::TarGz {
			builder: TarBuilder::new(gz),
			files_written: 0,
		})
	}

	/// Append one file's bytes under `rel_path` (POSIX-style, relative to the
	/// archive root).
	pub fn append_bytes(&mut self, rel_path: &str, data: &[u8]) -> Result<(), BackupError> {
		match self {
			ArchiveWriter::Zip { writer, files_written } => {
				writer
					.start_file(rel_path, SimpleFileOptions::default())
					.map_err(|e| BackupError::Archive(e.to_string()))?;
				writer.write_all(data)?;
				*files_written += 1;
			}
			ArchiveWriter::TarGz { builder, files_written } => {
				let mut header = tar::Header::new_gnu();
				header.set_size(data.len() as u64);
				header.set_mode(0o644);
				header.set_cksum();
				builder
					.append_data(&mut header, rel_path, data)
					.map_err(|e| BackupError::Archive(e.to_string()))?;
				*files_written += 1;
			}
		}
		Ok(())
	}

	/// Append a file by streaming it from disk, for files over the 2 MiB
	/// in-memory threshold.
	pub fn append_path(&mut self, rel_path: &str, local_path: &Path) -> Result<(), BackupError> {
		match self {
			ArchiveWriter::Zip { writer, files_written } => {
				writer
					.start_file(rel_path, SimpleFileOptions::default())
					.map_err(|e| BackupError::Archive(e.to_string()))?;
				let mut src = File::open(local_path)?;
				std::io::copy(&mut src, writer)?;
				*files_written += 1;
			}
			ArchiveWriter::TarGz { builder, files_written } => {
				let mut src = File::open(local_path)?;
				builder
					.append_file(rel_path, &mut src)
					.map_err(|e| BackupError::Archive(e.to_string()))?;
				*files_written += 1;
			}
		}
		Ok(())
	}

	pub fn files_written(&self) -> u64 {
		match self {
			ArchiveWriter::Zip { files_written, .. } => *files_written,
			ArchiveWriter::TarGz { files_written, .. } => *files_written,
		}
	}

	/// Finalize the archive and assert it's non-empty.
	pub fn finish(self) -> Result<(), BackupError> {
		let files_written = self.files_written();
		match self {
			ArchiveWriter::Zip { writer, .. } => {
				writer.finish().map_err(|e| BackupError::Archive(e.to_string()))?;
			}
			ArchiveWriter::TarGz { builder, .. } => {
				let gz = builder.into_inner().map_err(|e| BackupError::Archive(e.to_string()))?;
				gz.finish().map_err(|e| BackupError::Archive(e.to_string()))?;
			}
		}
		if files_written == 0 {
			return Err(BackupError::Archive("archive is empty after walking source tree".into()));
		}
		Ok(())
	}
}

pub fn archive_extension(compress: ddrive_store::Compression) -> &'static str {
	match compress {
		ddrive_store::Compression::Zip => "zip",
		ddrive_store::Compression::TarGz => "tar.gz",
		ddrive_store::Compression::None => "",
	}
}

pub fn new_archive_path(tmp_dir: &Path, compress: ddrive_store::Compression) -> PathBuf {
	tmp_dir.join(format!("archive.{}", archive_extension(compress)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_zip_archive_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let writer = ArchiveWriter::create_zip(&dir.path().join("empty.zip")).unwrap();
		assert!(writer.finish().is_err());
	}

	#[test]
	fn zip_archive_with_one_file_finishes() {
		let dir = tempfile::tempdir().unwrap();
		let mut writer = ArchiveWriter::create_zip(&dir.path().join("one.zip")).unwrap();
		writer.append_bytes("hello.txt", b"hello world").unwrap();
		assert_eq!(writer.files_written(), 1);
		assert!(writer.finish().is_ok());
	}

	#[test]
	fn tar_gz_archive_with_one_file_finishes() {
		let dir = tempfile::tempdir().unwrap();
		let mut writer = ArchiveWriter::create_tar_gz(&dir.path().join("one.tar.gz")).unwrap();
		writer.append_bytes("hello.txt", b"hello world").unwrap();
		assert!(writer.finish().is_ok());
	}
}
