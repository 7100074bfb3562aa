use std::{fs::File, io::Read, path::Path};

use assert_cmd::Command;
use tempfile::NamedTempFile;

const BLOCK_SIZE: u64 = 512;

fn image(blocks: u64) -> NamedTempFile {
	let f = NamedTempFile::new().unwrap();
	f.as_file().set_len(blocks * BLOCK_SIZE).unwrap();
	f
}

fn magic_of(path: &Path) -> [u8; 4] {
	let mut buf = [0u8; 4];
	File::open(path).unwrap().read_exact(&mut buf).unwrap();
	buf
}

#[test]
fn formats_an_image() {
	let f = image(100);
	Command::cargo_bin("mksofs")
		.unwrap()
		.arg("-q")
		.args(["-i", "56"])
		.arg(f.path())
		.assert()
		.success();

	// magic 0x65FE, little endian
	assert_eq!(magic_of(f.path()), [0xFE, 0x65, 0x00, 0x00]);
}

#[test]
fn prints_a_summary() {
	let f = image(100);
	let out = Command::cargo_bin("mksofs")
		.unwrap()
		.args(["-n", "scratch"])
		.arg(f.path())
		.assert()
		.success();
	let stdout = String::from_utf8_lossy(&out.get_output().stdout).into_owned();
	assert!(stdout.contains("scratch"));
	assert!(stdout.contains("data clusters"));
}

#[test]
fn rejects_a_tiny_image() {
	let f = image(3);
	Command::cargo_bin("mksofs")
		.unwrap()
		.arg("-q")
		.arg(f.path())
		.assert()
		.failure();
}
