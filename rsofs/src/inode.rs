use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{
	de::Decoder,
	enc::Encoder,
	error::{DecodeError, EncodeError},
	Decode, Encode,
};

use crate::data::*;

fn timetosys(s: u32) -> SystemTime {
	UNIX_EPOCH + Duration::from_secs(s as u64)
}

pub(crate) fn systotime(t: SystemTime) -> u32 {
	t.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs().min(u32::MAX as u64) as u32)
		.unwrap_or(0)
}

/// Current time as seconds since the epoch, saturated to 32 bits.
pub(crate) fn now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs().min(u32::MAX as u64) as u32)
		.unwrap_or(0)
}

impl Inode {
	/// A fresh member of the free-clean chain, as written by the formatter.
	pub fn free_clean(prev: u32, next: u32) -> Self {
		Self {
			mode:     INODE_FREE,
			refcount: 0,
			owner:    0,
			group:    0,
			size:     0,
			clucount: 0,
			var:      InodeVar::Free { prev, next },
			d:        [NULL_CLUSTER; N_DIRECT],
			i1:       NULL_CLUSTER,
			i2:       NULL_CLUSTER,
		}
	}

	pub fn is_free(&self) -> bool {
		self.mode & INODE_FREE != 0
	}

	/// A free inode whose type bits survive is dirty: it went through
	/// `free_inode` and has not been cleaned yet.
	pub fn is_free_dirty(&self) -> bool {
		self.is_free() && self.mode & INODE_TYPE_MASK != 0
	}

	/// Type of the inode, or `None` when the type bits are not exactly one
	/// of the three legal values.
	pub fn kind(&self) -> Option<InodeType> {
		match self.mode & INODE_TYPE_MASK {
			INODE_FILE => Some(InodeType::RegularFile),
			INODE_DIR => Some(InodeType::Directory),
			INODE_SYMLINK => Some(InodeType::Symlink),
			_ => None,
		}
	}

	pub fn is_dir(&self) -> bool {
		!self.is_free() && self.mode & INODE_TYPE_MASK == INODE_DIR
	}

	pub fn perm(&self) -> u16 {
		self.mode & INODE_PERM_MASK
	}

	/// Free-list links of a free inode.
	pub fn free_links(&self) -> Option<(u32, u32)> {
		match self.var {
			InodeVar::Free { prev, next } => Some((prev, next)),
			InodeVar::InUse { .. } => None,
		}
	}

	pub fn atime(&self) -> SystemTime {
		match self.var {
			InodeVar::InUse { atime, .. } => timetosys(atime),
			InodeVar::Free { .. } => UNIX_EPOCH,
		}
	}

	pub fn mtime(&self) -> SystemTime {
		match self.var {
			InodeVar::InUse { mtime, .. } => timetosys(mtime),
			InodeVar::Free { .. } => UNIX_EPOCH,
		}
	}

	pub fn touch_mtime(&mut self) {
		if let InodeVar::InUse { mtime, .. } = &mut self.var {
			*mtime = now();
		}
	}

	pub fn touch_atime(&mut self) {
		if let InodeVar::InUse { atime, .. } = &mut self.var {
			*atime = now();
		}
	}

	pub fn as_attr(&self, inr: InodeNum, kind: InodeType) -> InodeAttr {
		InodeAttr {
			inr,
			kind,
			perm: self.perm(),
			refcount: self.refcount,
			owner: self.owner,
			group: self.group,
			size: self.size as u64,
			clusters: self.clucount,
			atime: self.atime(),
			mtime: self.mtime(),
		}
	}
}

impl Decode for Inode {
	fn decode<D: Decoder>(dec: &mut D) -> Result<Self, DecodeError> {
		let mode = u16::decode(dec)?;
		let refcount = u16::decode(dec)?;
		let owner = u32::decode(dec)?;
		let group = u32::decode(dec)?;
		let size = u32::decode(dec)?;
		let clucount = u32::decode(dec)?;
		let w1 = u32::decode(dec)?;
		let w2 = u32::decode(dec)?;
		let var = if mode & INODE_FREE != 0 {
			InodeVar::Free {
				prev: w1,
				next: w2,
			}
		} else {
			InodeVar::InUse {
				atime: w1,
				mtime: w2,
			}
		};

		Ok(Self {
			mode,
			refcount,
			owner,
			group,
			size,
			clucount,
			var,
			d: <[u32; N_DIRECT]>::decode(dec)?,
			i1: u32::decode(dec)?,
			i2: u32::decode(dec)?,
		})
	}
}

impl Encode for Inode {
	fn encode<E: Encoder>(&self, enc: &mut E) -> Result<(), EncodeError> {
		self.mode.encode(enc)?;
		self.refcount.encode(enc)?;
		self.owner.encode(enc)?;
		self.group.encode(enc)?;
		self.size.encode(enc)?;
		self.clucount.encode(enc)?;
		let (w1, w2) = match self.var {
			InodeVar::InUse { atime, mtime } => (atime, mtime),
			InodeVar::Free { prev, next } => (prev, next),
		};
		w1.encode(enc)?;
		w2.encode(enc)?;
		self.d.encode(enc)?;
		self.i1.encode(enc)?;
		self.i2.encode(enc)?;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn cfg() -> impl bincode::config::Config + Copy {
		bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian()
	}

	#[test]
	fn inode_is_64_bytes() {
		let ino = Inode::free_clean(NULL_INODE, NULL_INODE);
		let bytes = bincode::encode_to_vec(&ino, cfg()).unwrap();
		assert_eq!(bytes.len(), INODE_SIZE);
	}

	#[test]
	fn variant_dispatches_on_free_bit() {
		let mut ino = Inode::free_clean(3, 7);
		let bytes = bincode::encode_to_vec(&ino, cfg()).unwrap();
		let (back, _): (Inode, usize) = bincode::decode_from_slice(&bytes, cfg()).unwrap();
		assert_eq!(back.var, InodeVar::Free { prev: 3, next: 7 });

		ino.mode = INODE_FILE | 0o644;
		ino.var = InodeVar::InUse {
			atime: 11,
			mtime: 22,
		};
		let bytes = bincode::encode_to_vec(&ino, cfg()).unwrap();
		let (back, _): (Inode, usize) = bincode::decode_from_slice(&bytes, cfg()).unwrap();
		assert_eq!(
			back.var,
			InodeVar::InUse {
				atime: 11,
				mtime: 22
			}
		);
	}

	#[test]
	fn kind_requires_exactly_one_type_bit() {
		let mut ino = Inode::free_clean(NULL_INODE, NULL_INODE);
		ino.mode = INODE_DIR | 0o755;
		assert_eq!(ino.kind(), Some(InodeType::Directory));
		ino.mode = INODE_DIR | INODE_FILE;
		assert_eq!(ino.kind(), None);
		ino.mode = 0;
		assert_eq!(ino.kind(), None);
	}

	#[test]
	fn dirty_free_detection() {
		let mut ino = Inode::free_clean(NULL_INODE, NULL_INODE);
		assert!(ino.is_free() && !ino.is_free_dirty());
		ino.mode = INODE_FREE | INODE_FILE | 0o600;
		assert!(ino.is_free_dirty());
	}
}
