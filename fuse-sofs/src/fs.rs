use std::{
	fs::File,
	io::{Error as IoError, Result as IoResult},
	path::Path,
	time::SystemTime,
};

use fuser::{FileAttr, FileType};
use rsofs::{InodeAttr, InodeNum, InodeType, Sofs, CLUSTER_SIZE};

pub struct Fs {
	pub sofs: Sofs<File>,
}

impl Fs {
	pub fn open(path: &Path, rw: bool) -> anyhow::Result<Self> {
		let sofs = Sofs::open(path, rw)?;
		Ok(Self {
			sofs,
		})
	}
}

/// FUSE reserves inode 0 and roots the tree at 1; SOFS roots at inode 0.
/// Shift the whole namespace by one.
pub fn fuse_ino(inr: InodeNum) -> u64 {
	inr as u64 + 1
}

pub fn transino(ino: u64) -> IoResult<InodeNum> {
	if ino == 0 || ino > u32::MAX as u64 {
		return Err(IoError::from_raw_os_error(libc::EINVAL));
	}
	Ok((ino - 1) as u32)
}

pub fn kind_to_fuse(kind: InodeType) -> FileType {
	match kind {
		InodeType::RegularFile => FileType::RegularFile,
		InodeType::Directory => FileType::Directory,
		InodeType::Symlink => FileType::Symlink,
	}
}

pub fn attr_to_fuse(a: &InodeAttr) -> FileAttr {
	FileAttr {
		ino:     fuse_ino(a.inr),
		size:    a.size,
		blocks:  a.clusters as u64 * (CLUSTER_SIZE as u64 / 512),
		atime:   a.atime,
		mtime:   a.mtime,
		ctime:   a.mtime,
		crtime:  SystemTime::UNIX_EPOCH,
		kind:    kind_to_fuse(a.kind),
		perm:    a.perm,
		nlink:   a.refcount.into(),
		uid:     a.owner,
		gid:     a.group,
		rdev:    0,
		blksize: CLUSTER_SIZE as u32,
		flags:   0,
	}
}
