use std::{io::Result as IoResult, time::SystemTime};

use bincode::{Decode, Encode};

use crate::err;

/// SOFS13 superblock magic number.
pub const SOFS_MAGIC: u32 = 0x65FE;

/// SOFS13 on-disk format version.
pub const SOFS_VERSION: u32 = 0x2013;

/// Size of a physical block in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Number of contiguous blocks in a cluster.
pub const BLOCKS_PER_CLUSTER: usize = 4;

/// Size of a cluster in bytes.
pub const CLUSTER_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_CLUSTER;

/// Size of an on-disk inode.
pub const INODE_SIZE: usize = 64;

/// Inodes per block of the inode table.
pub const IPB: usize = BLOCK_SIZE / INODE_SIZE;

/// 32-bit references per block.
pub const RPB: usize = BLOCK_SIZE / 4;

/// 32-bit references per cluster.
pub const RPC: usize = RPB * BLOCKS_PER_CLUSTER;

/// Direct cluster references in an inode.
pub const N_DIRECT: usize = 7;

/// Maximum length of a directory-entry name, excluding the terminator.
pub const MAX_NAME: usize = 59;

/// Size of an on-disk directory entry.
pub const DIRENT_SIZE: usize = MAX_NAME + 1 + 4;

/// Directory entries per cluster.
pub const DPC: usize = CLUSTER_SIZE / DIRENT_SIZE;

/// Byte stream length per cluster.
pub const BSLPC: usize = CLUSTER_SIZE;

/// Maximum length of a path handed to the resolver.
pub const MAX_PATH: usize = 255;

/// Maximum number of data clusters indexable by one inode.
pub const MAX_FILE_CLUSTERS: u32 = (N_DIRECT + RPC + RPC * RPC) as u32;

/// Maximum file size in bytes.
pub const MAX_FILE_SIZE: u64 = MAX_FILE_CLUSTERS as u64 * BSLPC as u64;

/// Null inode number.
pub const NULL_INODE: u32 = 0xFFFF_FFFF;

/// Null cluster number.
pub const NULL_CLUSTER: u32 = 0xFFFF_FFFF;

/// Entries in each of the two in-superblock free-cluster caches.
pub const DZONE_CACHE_SIZE: usize = 50;

/// Filler written to cluster-to-inode map slots past `dzone_total`.
pub const CIMAP_PAD: u32 = 0xFFFF_FFFE;

/// Maximum length of the volume name, excluding the terminator.
pub const MAX_VOLNAME: usize = 23;

/// Mount status: properly unmounted.
pub const MSTAT_PRU: u32 = 0xFEFE;

/// Mount status: not properly unmounted.
pub const MSTAT_NPRU: u32 = 0xEEFE;

/// Permission bits of the inode mode.
pub const INODE_PERM_MASK: u16 = 0o777;

/// Regular file type bit.
pub const INODE_FILE: u16 = 0x0200;

/// Directory type bit.
pub const INODE_DIR: u16 = 0x0400;

/// Symbolic link type bit.
pub const INODE_SYMLINK: u16 = 0x0800;

/// Free-inode bit.
pub const INODE_FREE: u16 = 0x1000;

/// Mask of the three type bits.
pub const INODE_TYPE_MASK: u16 = INODE_FILE | INODE_DIR | INODE_SYMLINK;

/// Reserved superblock bytes are written with this value at format time.
pub const SB_FILL: u8 = 0xEE;

/// Reserved bytes padding the superblock to `BLOCK_SIZE`.
pub const SB_RESERVED: usize = 8;

/// SOFS-native inode number type.
pub type InodeNum = u32;

/// SOFS-native logical cluster number type.
pub type ClusterNum = u32;

/// One of the two bounded free-cluster caches kept inside the superblock.
///
/// `idx` points one past the last consumed slot for the retrieval cache
/// (empty at `DZONE_CACHE_SIZE`) and one past the last inserted slot for the
/// insertion cache (empty at 0).
#[derive(Debug, Clone, Decode, Encode)]
pub struct DzoneCache {
	pub idx:   u32,
	pub cache: [u32; DZONE_CACHE_SIZE],
}

impl DzoneCache {
	pub fn empty_retrieval() -> Self {
		Self {
			idx:   DZONE_CACHE_SIZE as u32,
			cache: [NULL_CLUSTER; DZONE_CACHE_SIZE],
		}
	}

	pub fn empty_insertion() -> Self {
		Self {
			idx:   0,
			cache: [NULL_CLUSTER; DZONE_CACHE_SIZE],
		}
	}

	/// Whether `cref` currently sits in one of the occupied slots.
	pub fn contains(&self, cref: ClusterNum) -> bool {
		self.cache.iter().any(|c| *c == cref)
	}
}

/// Super block of a SOFS13 filesystem, stored at physical block 0.
#[derive(Debug, Clone, Decode, Encode)]
pub struct Superblock {
	pub magic:          u32,
	pub version:        u32,
	pub name:           [u8; MAX_VOLNAME + 1],
	pub ntotal:         u32,
	pub mstat:          u32,
	// inode table metadata
	pub itable_start:   u32,
	pub itable_size:    u32,
	pub itotal:         u32,
	pub ifree:          u32,
	pub ihead:          u32,
	pub itail:          u32,
	// cluster-to-inode map metadata
	pub ciutable_start: u32,
	pub ciutable_size:  u32,
	// data zone metadata
	pub dzone_retriev:  DzoneCache,
	pub dzone_insert:   DzoneCache,
	pub fctable_start:  u32,
	pub fctable_size:   u32,
	pub fctable_pos:    u32,
	pub dzone_start:    u32,
	pub dzone_total:    u32,
	pub dzone_free:     u32,
	pub reserved:       [u8; SB_RESERVED],
}

/// On-disk inode.
///
/// The seventh and eighth 32-bit words change meaning with the free bit:
/// access/modification times while the inode is in use, free-list links
/// while it is free. [`InodeVar`] keeps that dispatch explicit in memory;
/// the codec in `inode.rs` resolves it from the mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
	pub mode:     u16,
	pub refcount: u16,
	pub owner:    u32,
	pub group:    u32,
	pub size:     u32,
	pub clucount: u32,
	pub var:      InodeVar,
	pub d:        [u32; N_DIRECT],
	pub i1:       u32,
	pub i2:       u32,
}

/// The dual-meaning word pair of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeVar {
	InUse { atime: u32, mtime: u32 },
	Free { prev: u32, next: u32 },
}

/// Type of an in-use inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
	RegularFile,
	Directory,
	Symlink,
}

impl InodeType {
	pub fn mode_bit(self) -> u16 {
		match self {
			Self::RegularFile => INODE_FILE,
			Self::Directory => INODE_DIR,
			Self::Symlink => INODE_SYMLINK,
		}
	}
}

/// Metadata summary of an inode, as handed to the mount glue.
#[derive(Debug, Clone)]
pub struct InodeAttr {
	pub inr:      InodeNum,
	pub kind:     InodeType,
	pub perm:     u16,
	pub refcount: u16,
	pub owner:    u32,
	pub group:    u32,
	pub size:     u64,
	pub clusters: u32,
	pub atime:    SystemTime,
	pub mtime:    SystemTime,
}

/// On-disk directory entry.
#[derive(Debug, Clone, Decode, Encode)]
pub struct DirEntry {
	pub name: [u8; MAX_NAME + 1],
	pub inr:  u32,
}

/// The three states a directory entry can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryState {
	InUse,
	/// Removed but recoverable: the first and last name bytes are swapped
	/// and the inode reference is retained.
	DirtyEmpty,
	CleanEmpty,
}

impl Superblock {
	/// Inode number to (logical inode-table block, offset within block).
	pub fn itable_loc(&self, inr: InodeNum) -> IoResult<(u32, usize)> {
		if inr >= self.itotal {
			return Err(err!(EINVAL));
		}
		Ok((inr / IPB as u32, (inr % IPB as u32) as usize))
	}

	/// Cluster reference to (logical bitmap block, byte offset, bit offset).
	///
	/// Bits are MSB-first within each byte.
	pub fn bitmap_loc(&self, cref: ClusterNum) -> IoResult<(u32, usize, usize)> {
		if cref >= self.dzone_total {
			return Err(err!(EINVAL));
		}
		let bpb = (BLOCK_SIZE * 8) as u32;
		let blk = cref / bpb;
		let off = cref % bpb;
		Ok((blk, (off / 8) as usize, (off % 8) as usize))
	}

	/// Inverse of [`Self::bitmap_loc`].
	pub fn bitmap_ref(&self, blk: u32, byte: usize, bit: usize) -> IoResult<ClusterNum> {
		if byte >= BLOCK_SIZE || bit >= 8 {
			return Err(err!(EINVAL));
		}
		let cref = blk * (BLOCK_SIZE * 8) as u32 + (byte * 8 + bit) as u32;
		if cref >= self.dzone_total {
			return Err(err!(EINVAL));
		}
		Ok(cref)
	}

	/// Cluster reference to (logical map block, slot within block).
	pub fn cimap_loc(&self, cref: ClusterNum) -> IoResult<(u32, usize)> {
		if cref >= self.dzone_total {
			return Err(err!(EINVAL));
		}
		Ok((cref / RPB as u32, (cref % RPB as u32) as usize))
	}

	/// Byte position of a logical inode-table block.
	pub fn itable_pos(&self, blk: u32) -> u64 {
		(self.itable_start + blk) as u64 * BLOCK_SIZE as u64
	}

	/// Byte position of a logical cluster-to-inode map block.
	pub fn cimap_pos(&self, blk: u32) -> u64 {
		(self.ciutable_start + blk) as u64 * BLOCK_SIZE as u64
	}

	/// Byte position of a logical free-cluster bitmap block.
	pub fn bitmap_pos(&self, blk: u32) -> u64 {
		(self.fctable_start + blk) as u64 * BLOCK_SIZE as u64
	}

	/// Byte position of a data cluster.
	pub fn cluster_pos(&self, cref: ClusterNum) -> u64 {
		(self.dzone_start as u64 + cref as u64 * BLOCKS_PER_CLUSTER as u64) * BLOCK_SIZE as u64
	}

	/// Volume name as a string, up to the first NUL.
	pub fn volname(&self) -> String {
		let len = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
		String::from_utf8_lossy(&self.name[..len]).into_owned()
	}
}

/// Byte position in a file to (cluster list index, offset within cluster).
pub fn cluster_of_byte(pos: u64) -> IoResult<(u32, usize)> {
	if pos >= MAX_FILE_SIZE {
		return Err(err!(EINVAL));
	}
	Ok(((pos / BSLPC as u64) as u32, (pos % BSLPC as u64) as usize))
}

#[cfg(test)]
mod t {
	use super::*;

	fn sb() -> Superblock {
		Superblock {
			magic:          SOFS_MAGIC,
			version:        SOFS_VERSION,
			name:           [0; MAX_VOLNAME + 1],
			ntotal:         100,
			mstat:          MSTAT_PRU,
			itable_start:   1,
			itable_size:    7,
			itotal:         56,
			ifree:          55,
			ihead:          1,
			itail:          55,
			ciutable_start: 8,
			ciutable_size:  1,
			dzone_retriev:  DzoneCache::empty_retrieval(),
			dzone_insert:   DzoneCache::empty_insertion(),
			fctable_start:  9,
			fctable_size:   1,
			fctable_pos:    0,
			dzone_start:    10,
			dzone_total:    22,
			dzone_free:     21,
			reserved:       [SB_FILL; SB_RESERVED],
		}
	}

	#[test]
	fn superblock_is_one_block() {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();
		let bytes = bincode::encode_to_vec(&sb(), cfg).unwrap();
		assert_eq!(bytes.len(), BLOCK_SIZE);
	}

	#[test]
	fn derived_constants() {
		assert_eq!(INODE_SIZE * IPB, BLOCK_SIZE);
		assert_eq!(DIRENT_SIZE * DPC, CLUSTER_SIZE);
		assert_eq!(RPC, RPB * BLOCKS_PER_CLUSTER);
		assert_eq!(MAX_FILE_CLUSTERS, 262_663);
	}

	#[test]
	fn itable_loc_roundtrip() {
		let sb = sb();
		for inr in [0u32, 1, 7, 8, 55] {
			let (blk, off) = sb.itable_loc(inr).unwrap();
			assert_eq!(blk * IPB as u32 + off as u32, inr);
		}
		assert!(sb.itable_loc(56).is_err());
	}

	#[test]
	fn bitmap_loc_roundtrip() {
		let sb = sb();
		for cref in 0..sb.dzone_total {
			let (blk, byte, bit) = sb.bitmap_loc(cref).unwrap();
			assert_eq!(sb.bitmap_ref(blk, byte, bit).unwrap(), cref);
		}
		assert!(sb.bitmap_loc(sb.dzone_total).is_err());
		assert!(sb.bitmap_ref(0, 0, 8).is_err());
	}

	#[test]
	fn cluster_of_byte_roundtrip() {
		for pos in [0u64, 1, BSLPC as u64 - 1, BSLPC as u64, MAX_FILE_SIZE - 1] {
			let (ci, off) = cluster_of_byte(pos).unwrap();
			assert_eq!(ci as u64 * BSLPC as u64 + off as u64, pos);
		}
		let e = cluster_of_byte(MAX_FILE_SIZE).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
	}
}
