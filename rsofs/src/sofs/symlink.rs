use std::{
	ffi::{OsStr, OsString},
	os::unix::ffi::{OsStrExt, OsStringExt},
};

use super::{inode::kind_of, *};
use crate::{err, iobail};

impl<B: Backend> Sofs<B> {
	/// Read the contents of a symbolic link.
	#[doc(alias = "readlink")]
	pub fn symlink_read(&mut self, inr: InodeNum) -> IoResult<OsString> {
		log::trace!("symlink_read({inr});");
		let ino = self.read_inode(inr)?;
		if kind_of(&ino, inr)? != InodeType::Symlink {
			return Err(err!(EINVAL));
		}

		let len = ino.size as usize;
		if len == 0 || len > MAX_PATH {
			iobail!(ErrorKind::InvalidData, "inode in use: symlink {inr} has bad length {len}");
		}

		let mut buf = vec![0u8; CLUSTER_SIZE];
		self.read_file_cluster(inr, 0, &mut buf)?;
		if buf[len] != 0 {
			iobail!(
				ErrorKind::InvalidData,
				"inode in use: symlink {inr} target is not terminated"
			);
		}
		buf.truncate(len);
		Ok(OsString::from_vec(buf))
	}

	/// Set the target of a symbolic link. The target occupies the first
	/// data cluster as a NUL-terminated string.
	pub fn symlink_set(&mut self, inr: InodeNum, target: &OsStr) -> IoResult<()> {
		log::trace!("symlink_set({inr}, {target:?});");
		self.assert_rw()?;

		let ino = self.read_inode(inr)?;
		if kind_of(&ino, inr)? != InodeType::Symlink {
			return Err(err!(EINVAL));
		}

		let bytes = target.as_bytes();
		if bytes.is_empty() || bytes.contains(&b'\0') {
			return Err(err!(EINVAL));
		}
		if bytes.len() > MAX_PATH {
			return Err(err!(ENAMETOOLONG));
		}

		let mut buf = vec![0u8; CLUSTER_SIZE];
		buf[..bytes.len()].copy_from_slice(bytes);
		self.write_file_cluster(inr, 0, &buf)?;
		self.inode_update(inr, |ino| {
			ino.size = bytes.len() as u32;
			ino.touch_mtime();
		})
	}
}
