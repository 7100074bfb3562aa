use super::*;
use crate::{err, inode::systotime, iobail};

/// Type of an in-use inode, or the inode-in-use inconsistency.
pub(crate) fn kind_of(ino: &Inode, inr: InodeNum) -> IoResult<InodeType> {
	match ino.kind() {
		Some(kind) => Ok(kind),
		None => Err(IoError::new(
			ErrorKind::InvalidData,
			format!("inode in use: {inr} has malformed type bits"),
		)),
	}
}

impl<B: Backend> Sofs<B> {
	/// Fetch inode `inr`, requiring it to be in use with a legal type.
	pub(crate) fn read_inode(&mut self, inr: InodeNum) -> IoResult<Inode> {
		log::trace!("read_inode({inr});");
		let ino = self.inode_get(inr)?;
		if ino.is_free() {
			iobail!(ErrorKind::InvalidData, "inode in use: {inr} is free");
		}
		kind_of(&ino, inr)?;
		Ok(ino)
	}

	pub(crate) fn write_inode(&mut self, inr: InodeNum, ino: &Inode) -> IoResult<()> {
		log::trace!("write_inode({inr});");
		self.assert_rw()?;
		self.inode_put(inr, ino)
	}

	/// Read-modify-write of an in-use inode.
	pub(crate) fn inode_update(&mut self, inr: InodeNum, f: impl FnOnce(&mut Inode)) -> IoResult<()> {
		let mut ino = self.read_inode(inr)?;
		f(&mut ino);
		self.write_inode(inr, &ino)
	}

	/// Get metadata about an inode.
	#[doc(alias("stat", "getattr"))]
	pub fn inode_attr(&mut self, inr: InodeNum) -> IoResult<InodeAttr> {
		log::trace!("inode_attr({inr});");
		let ino = self.read_inode(inr)?;
		let kind = kind_of(&ino, inr)?;
		Ok(ino.as_attr(inr, kind))
	}

	/// Update the mutable attributes of an inode (permissions, owner,
	/// group, times) through `f`; the type is fixed for the inode's life.
	pub fn inode_modify(
		&mut self,
		inr: InodeNum,
		f: impl FnOnce(InodeAttr) -> InodeAttr,
	) -> IoResult<InodeAttr> {
		self.assert_rw()?;
		let mut ino = self.read_inode(inr)?;
		let kind = kind_of(&ino, inr)?;
		let attr = f(ino.as_attr(inr, kind));

		ino.mode = (ino.mode & !INODE_PERM_MASK) | (attr.perm & INODE_PERM_MASK);
		ino.owner = attr.owner;
		ino.group = attr.group;
		ino.var = InodeVar::InUse {
			atime: systotime(attr.atime),
			mtime: systotime(attr.mtime),
		};

		self.write_inode(inr, &ino)?;
		Ok(ino.as_attr(inr, kind))
	}

	/// Read data from a regular file.
	pub fn read(&mut self, inr: InodeNum, mut offset: u64, buffer: &mut [u8]) -> IoResult<usize> {
		log::trace!("read({inr}, {offset}, {});", buffer.len());
		let ino = self.read_inode(inr)?;
		if kind_of(&ino, inr)? == InodeType::Directory {
			return Err(err!(EISDIR));
		}

		let size = ino.size as u64;
		if offset >= size {
			return Ok(0);
		}

		let mut cbuf = vec![0u8; CLUSTER_SIZE];
		let len = (buffer.len() as u64).min(size - offset);
		let end = offset + len;
		let mut boff = 0usize;

		while offset < end {
			let (ci, coff) = cluster_of_byte(offset)?;
			let num = ((BSLPC - coff) as u64).min(end - offset) as usize;

			self.read_file_cluster(inr, ci, &mut cbuf)?;
			buffer[boff..(boff + num)].copy_from_slice(&cbuf[coff..(coff + num)]);

			offset += num as u64;
			boff += num;
		}

		Ok(boff)
	}

	/// Write data to a regular file, extending it as needed.
	pub fn write(&mut self, inr: InodeNum, mut offset: u64, buffer: &[u8]) -> IoResult<usize> {
		log::trace!("write({inr}, {offset}, {});", buffer.len());
		self.assert_rw()?;

		let ino = self.read_inode(inr)?;
		if kind_of(&ino, inr)? == InodeType::Directory {
			return Err(err!(EISDIR));
		}
		if offset >= MAX_FILE_SIZE {
			return Err(err!(EINVAL));
		}
		if buffer.is_empty() {
			return Ok(0);
		}

		let len = (buffer.len() as u64).min(MAX_FILE_SIZE - offset);
		let end = offset + len;

		// Extend the size up front: allocation inside the loop rewrites the
		// inode, so no stale copy may be written back afterwards.
		self.inode_update(inr, |ino| {
			ino.size = ino.size.max(end as u32);
			ino.touch_mtime();
		})?;

		let mut cbuf = vec![0u8; CLUSTER_SIZE];
		let mut boff = 0usize;

		while offset < end {
			let (ci, coff) = cluster_of_byte(offset)?;
			let num = ((BSLPC - coff) as u64).min(end - offset) as usize;

			if num == CLUSTER_SIZE {
				cbuf.copy_from_slice(&buffer[boff..(boff + num)]);
			} else {
				self.read_file_cluster(inr, ci, &mut cbuf)?;
				cbuf[coff..(coff + num)].copy_from_slice(&buffer[boff..(boff + num)]);
			}
			self.write_file_cluster(inr, ci, &cbuf)?;

			offset += num as u64;
			boff += num;
		}

		Ok(boff)
	}

	/// Change the size of a regular file, releasing and cleaning every
	/// cluster past the new end.
	pub fn truncate(&mut self, inr: InodeNum, new_size: u64) -> IoResult<()> {
		log::trace!("truncate({inr}, {new_size});");
		self.assert_rw()?;

		if new_size > MAX_FILE_SIZE {
			return Err(err!(EFBIG));
		}
		let ino = self.read_inode(inr)?;
		if kind_of(&ino, inr)? == InodeType::Directory {
			return Err(err!(EISDIR));
		}

		let old_size = ino.size as u64;
		if new_size < old_size {
			let kept = new_size.div_ceil(BSLPC as u64) as u32;
			self.handle_file_clusters(inr, kept, ClusterOp::FreeClean)?;

			// stale bytes in the tail of the boundary cluster would
			// resurface if the file grows again
			let tail = (new_size % BSLPC as u64) as usize;
			if tail != 0 {
				let ci = (new_size / BSLPC as u64) as u32;
				if self.handle_file_cluster(inr, ci, ClusterOp::Get)? != NULL_CLUSTER {
					let mut cbuf = vec![0u8; CLUSTER_SIZE];
					self.read_file_cluster(inr, ci, &mut cbuf)?;
					cbuf[tail..].fill(0);
					self.write_file_cluster(inr, ci, &cbuf)?;
				}
			}
		}

		self.inode_update(inr, |ino| {
			ino.size = new_size as u32;
			ino.touch_mtime();
		})?;

		Ok(())
	}
}
