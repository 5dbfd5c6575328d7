//! Archive writers are only unit-tested against their own `finish()`
//! contract in `src/archive.rs`; these round-trip the actual bytes through
//! the `zip`/`tar` reader side to confirm what gets written is what a
//! restore would read back.

use std::io::Read;

use ddrive_backup::archive::ArchiveWriter;

#[test]
fn zip_round_trips_multiple_files_with_nested_paths() {
	let dir = tempfile::tempdir().unwrap();
	let archive_path = dir.path().join("backup.zip");

	let mut writer = ArchiveWriter::create_zip(&archive_path).unwrap();
	writer.append_bytes("top.txt", b"top level").unwrap();
	writer.append_bytes("nested/dir/leaf.txt", b"nested leaf").unwrap();
	assert_eq!(writer.files_written(), 2);
	writer.finish().unwrap();

	let file = std::fs::File::open(&archive_path).unwrap();
	let mut zip = zip::ZipArchive::new(file).unwrap();
	assert_eq!(zip.len(), 2);

	let mut top = zip.by_name("top.txt").unwrap();
	let mut top_contents = String::new();
	top.read_to_string(&mut top_contents).unwrap();
	assert_eq!(top_contents, "top level");
	drop(top);

	let mut nested = zip.by_name("nested/dir/leaf.txt").unwrap();
	let mut nested_contents = String::new();
	nested.read_to_string(&mut nested_contents).unwrap();
	assert_eq!(nested_contents, "nested leaf");
}

#[test]
fn zip_round_trips_a_streamed_file_from_disk() {
	let dir = tempfile::tempdir().unwrap();
	let source_path = dir.path().join("source.bin");
	std::fs::write(&source_path, vec![0xABu8; 4096]).unwrap();

	let archive_path = dir.path().join("streamed.zip");
	let mut writer = ArchiveWriter::create_zip(&archive_path).unwrap();
	writer.append_path("source.bin", &source_path).unwrap();
	writer.finish().unwrap();

	let file = std::fs::File::open(&archive_path).unwrap();
	let mut zip = zip::ZipArchive::new(file).unwrap();
	let mut entry = zip.by_name("source.bin").unwrap();
	let mut contents = Vec::new();
	entry.read_to_end(&mut contents).unwrap();
	assert_eq!(contents, vec![0xABu8; 4096]);
}

#[test]
fn tar_gz_round_trips_multiple_files() {
	let dir = tempfile::tempdir().unwrap();
	let archive_path = dir.path().join("backup.tar.gz");

	let mut writer = ArchiveWriter::create_tar_gz(&archive_path).unwrap();
	writer.append_bytes("a.txt", b"file a").unwrap();
	writer.append_bytes("sub/b.txt", b"file b").unwrap();
	writer.finish().unwrap();

	let file = std::fs::File::open(&archive_path).unwrap();
	let gz = flate2::read::GzDecoder::new(file);
	let mut tar = tar::Archive::new(gz);

	let mut seen = Vec::new();
	for entry in tar.entries().unwrap() {
		let mut entry = entry.unwrap();
		let path = entry.path().unwrap().to_string_lossy().into_owned();
		let mut contents = String::new();
		entry.read_to_string(&mut contents).unwrap();
		seen.push((path, contents));
	}
	seen.sort();

	assert_eq!(
		seen,
		vec![
			("a.txt".to_string(), "file a".to_string()),
			("sub/b.txt".to_string(), "file b".to_string()),
		]
	);
}
