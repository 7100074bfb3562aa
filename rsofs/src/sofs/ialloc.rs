use super::*;
use crate::{err, inode::now, iobail};

impl<B: Backend> Sofs<B> {
	/// Retrieve the head of the free-inode list and set it up as a fresh
	/// inode of the given type, owned by the current credentials.
	pub fn alloc_inode(&mut self, kind: InodeType) -> IoResult<InodeNum> {
		log::trace!("alloc_inode({kind:?});");
		self.assert_rw()?;

		if self.sb.ifree == 0 {
			return Err(err!(ENOSPC));
		}

		let head = self.sb.ihead;
		if head == NULL_INODE || head >= self.sb.itotal {
			iobail!(
				ErrorKind::InvalidData,
				"free-inode list: head {head} out of range"
			);
		}

		let head_ino = self.inode_get(head)?;
		if !head_ino.is_free() {
			iobail!(ErrorKind::InvalidData, "free-inode list: head {head} not free");
		}

		// a dirty head still drags the data clusters of its former life;
		// dissociate them before reuse
		let head_ino = if head_ino.is_free_dirty() {
			self.clean_inode(head)?;
			self.inode_get(head)?
		} else {
			head_ino
		};

		let Some((prev, next)) = head_ino.free_links() else {
			iobail!(ErrorKind::InvalidData, "free-inode list: head {head} malformed");
		};
		if prev != NULL_INODE {
			iobail!(
				ErrorKind::InvalidData,
				"free-inode list: head {head} has a predecessor"
			);
		}

		let cred = self.cred();
		let t = now();
		let ino = Inode {
			mode:     kind.mode_bit(),
			refcount: 0,
			owner:    cred.uid,
			group:    cred.gid,
			size:     0,
			clucount: 0,
			var:      InodeVar::InUse {
				atime: t,
				mtime: t,
			},
			d:        [NULL_CLUSTER; N_DIRECT],
			i1:       NULL_CLUSTER,
			i2:       NULL_CLUSTER,
		};
		self.inode_put(head, &ino)?;

		if self.sb.ifree == 1 {
			if next != NULL_INODE {
				iobail!(
					ErrorKind::InvalidData,
					"free-inode list: single element chains to {next}"
				);
			}
			self.update_sb(|sb| {
				sb.ihead = NULL_INODE;
				sb.itail = NULL_INODE;
				sb.ifree -= 1;
			})?;
		} else {
			if next == NULL_INODE || next >= self.sb.itotal {
				iobail!(
					ErrorKind::InvalidData,
					"free-inode list: successor {next} out of range"
				);
			}
			let mut nino = self.inode_get(next)?;
			let Some((_, nnext)) = nino.free_links() else {
				iobail!(
					ErrorKind::InvalidData,
					"free-inode list: successor {next} not free"
				);
			};
			nino.var = InodeVar::Free {
				prev: NULL_INODE,
				next: nnext,
			};
			self.inode_put(next, &nino)?;
			self.update_sb(|sb| {
				sb.ihead = next;
				sb.ifree -= 1;
			})?;
		}

		log::trace!("alloc_inode(): {head}");
		Ok(head)
	}

	/// Move an unreferenced inode to the tail of the free list. The data
	/// clusters and type bits are retained: the inode is free-dirty until
	/// cleaned.
	pub fn free_inode(&mut self, inr: InodeNum) -> IoResult<()> {
		log::trace!("free_inode({inr});");
		self.assert_rw()?;

		if inr == 0 {
			return Err(err!(EINVAL));
		}
		let mut ino = self.inode_get(inr)?;
		if ino.is_free() {
			iobail!(ErrorKind::InvalidData, "inode in use: {inr} is already free");
		}
		if ino.refcount != 0 {
			iobail!(
				ErrorKind::InvalidData,
				"inode in use: {inr} still has {} references",
				ino.refcount
			);
		}

		let old_tail = self.sb.itail;
		ino.mode |= INODE_FREE;
		ino.owner = 0;
		ino.group = 0;
		ino.var = InodeVar::Free {
			prev: old_tail,
			next: NULL_INODE,
		};
		self.inode_put(inr, &ino)?;

		if self.sb.ifree == 0 {
			self.update_sb(|sb| {
				sb.ihead = inr;
				sb.itail = inr;
				sb.ifree += 1;
			})?;
		} else {
			if old_tail == NULL_INODE || old_tail >= self.sb.itotal {
				iobail!(
					ErrorKind::InvalidData,
					"free-inode list: tail {old_tail} out of range"
				);
			}
			let mut tino = self.inode_get(old_tail)?;
			let Some((tprev, _)) = tino.free_links() else {
				iobail!(
					ErrorKind::InvalidData,
					"free-inode list: tail {old_tail} not free"
				);
			};
			tino.var = InodeVar::Free {
				prev: tprev,
				next: inr,
			};
			self.inode_put(old_tail, &tino)?;
			self.update_sb(|sb| {
				sb.itail = inr;
				sb.ifree += 1;
			})?;
		}

		Ok(())
	}

	/// Dissociate every cluster still attached to a free-dirty inode and
	/// leave it free-clean.
	pub fn clean_inode(&mut self, inr: InodeNum) -> IoResult<()> {
		log::trace!("clean_inode({inr});");
		self.assert_rw()?;

		if inr == 0 {
			return Err(err!(EINVAL));
		}
		let ino = self.inode_get(inr)?;
		if !ino.is_free() {
			iobail!(ErrorKind::InvalidData, "free-dirty inode: {inr} is in use");
		}
		if !ino.is_free_dirty() {
			iobail!(ErrorKind::InvalidData, "free-dirty inode: {inr} is already clean");
		}

		self.handle_file_clusters(inr, 0, ClusterOp::Clean)?;

		let mut ino = self.inode_get(inr)?;
		if ino.d.iter().any(|r| *r != NULL_CLUSTER)
			|| ino.i1 != NULL_CLUSTER
			|| ino.i2 != NULL_CLUSTER
		{
			iobail!(
				ErrorKind::InvalidData,
				"inode reference list: {inr} not empty after clean"
			);
		}

		ino.mode = INODE_FREE;
		ino.refcount = 0;
		ino.size = 0;
		ino.clucount = 0;
		self.inode_put(inr, &ino)?;

		Ok(())
	}
}
