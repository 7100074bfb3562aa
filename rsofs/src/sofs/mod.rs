use std::{
	ffi::OsStr,
	fs::File,
	io::{Error as IoError, ErrorKind, Result as IoResult, Write},
	path::Path,
};

mod access;
mod calloc;
mod check;
mod dir;
mod fclust;
pub mod format;
mod ialloc;
mod inode;
mod symlink;

pub use access::{ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE};
pub use dir::{AddAttach, DirSearch, RemDetach};
pub use fclust::ClusterOp;

use bincode::{Decode, Encode};

use crate::{
	blockreader::{Backend, BlockReader},
	cache::Slot,
	codec::Codec,
	data::*,
};

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		::std::io::Error::from_raw_os_error(::libc::$name)
	};
}

/// (INTERNAL) Bails out with an [`std::io::Error`] built from a kind and a
/// formatted message. Structural inconsistencies use
/// [`std::io::ErrorKind::InvalidData`] with the structure named first.
#[macro_export]
macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(::std::io::Error::new($kind, format!($($tk)+)))
	};
}

/// Summary of filesystem statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Number of data clusters.
	pub clusters: u64,

	/// Number of free data clusters.
	pub cfree: u64,

	/// Number of inodes.
	pub files: u64,

	/// Number of free inodes.
	pub ffree: u64,

	/// Block size.
	pub bsize: u32,

	/// Cluster size.
	pub csize: u32,

	/// Volume name.
	pub name: String,
}

/// Credentials the permission checks run under.
#[derive(Debug, Clone, Copy)]
pub struct Cred {
	pub uid: u32,
	pub gid: u32,
}

impl Cred {
	fn from_process() -> Self {
		// SAFETY: getuid/getgid cannot fail.
		unsafe {
			Self {
				uid: libc::getuid(),
				gid: libc::getgid(),
			}
		}
	}
}

/// A mounted SOFS13 filesystem.
///
/// All state is owned here: the codec over the backing file, the in-memory
/// superblock, and one cache slot per indexed table. Operations are
/// single-threaded and non-reentrant; callers serialize externally.
pub struct Sofs<B: Backend> {
	file: Codec<BlockReader<B>>,
	sb:   Superblock,

	// object cache slots, one per table
	itable: Slot<Vec<Inode>>,
	cimap:  Slot<Vec<u32>>,
	fcbmap: Slot<Vec<u8>>,
	sind:   Slot<Vec<u32>>,
	dref:   Slot<Vec<u32>>,

	cred: Cred,
}

impl Sofs<File> {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let file = BlockReader::open(path, rw)?;
		Self::new(file)
	}
}

impl<B: Backend> Sofs<B> {
	pub fn new(file: BlockReader<B>) -> IoResult<Self> {
		let mut file = Codec::new(file);
		let superblock: Superblock = file.decode_at(0)?;

		if superblock.magic != SOFS_MAGIC {
			iobail!(
				ErrorKind::InvalidInput,
				"invalid superblock magic number: {:#x}",
				superblock.magic
			);
		}
		if superblock.version != SOFS_VERSION {
			iobail!(
				ErrorKind::InvalidInput,
				"unsupported version: {:#x}",
				superblock.version
			);
		}

		let mut s = Self {
			file,
			sb: superblock,
			itable: Slot::new(),
			cimap: Slot::new(),
			fcbmap: Slot::new(),
			sind: Slot::new(),
			dref: Slot::new(),
			cred: Cred::from_process(),
		};
		s.check_superblock()?;

		if s.sb.mstat == MSTAT_NPRU {
			log::warn!("volume was not properly unmounted");
		}
		if s.write_enabled() {
			s.update_sb(|sb| sb.mstat = MSTAT_NPRU)?;
		}
		Ok(s)
	}

	/// Flush the free-cluster caches back into the bitmap and mark the
	/// volume properly unmounted. After this the free state is encoded by
	/// the bitmap alone.
	pub fn close(&mut self) -> IoResult<()> {
		if self.write_enabled() {
			self.flush_caches()?;
			self.update_sb(|sb| sb.mstat = MSTAT_PRU)?;
			self.file.inner_mut().flush()?;
		}
		Ok(())
	}

	pub fn write_enabled(&self) -> bool {
		self.file.inner().write_enabled()
	}

	pub(crate) fn assert_rw(&self) -> IoResult<()> {
		if self.write_enabled() {
			Ok(())
		} else {
			Err(err!(EROFS))
		}
	}

	/// Replace the credentials the permission checks run under.
	pub fn set_cred(&mut self, uid: u32, gid: u32) {
		self.cred = Cred {
			uid,
			gid,
		};
	}

	pub(crate) fn cred(&self) -> Cred {
		self.cred
	}

	/// The in-memory superblock, as last persisted.
	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	/// Owner of a data cluster per the reverse map (`NULL_INODE` when
	/// unattached).
	pub fn cluster_owner(&mut self, cref: ClusterNum) -> IoResult<InodeNum> {
		self.cimap_get(cref)
	}

	/// Raw free-cluster bitmap bit of a data cluster.
	pub fn cluster_bitmap_bit(&mut self, cref: ClusterNum) -> IoResult<bool> {
		self.bitmap_get(cref)
	}

	/// Get filesystem metadata.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Info {
		let sb = &self.sb;
		Info {
			clusters: sb.dzone_total as u64,
			cfree:    sb.dzone_free as u64,
			files:    sb.itotal as u64,
			ffree:    sb.ifree as u64,
			bsize:    BLOCK_SIZE as u32,
			csize:    CLUSTER_SIZE as u32,
			name:     sb.volname(),
		}
	}

	fn check_superblock(&mut self) -> IoResult<()> {
		let sb = &self.sb;
		log::debug!("Superblock: {sb:#?}");

		log::info!("Summary:");
		log::info!("Volume: {:?}", sb.volname());
		log::info!("# Blocks: {}", sb.ntotal);
		log::info!("# Inodes: {} ({} free)", sb.itotal, sb.ifree);
		log::info!("# Clusters: {} ({} free)", sb.dzone_total, sb.dzone_free);

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					log::error!("superblock corrupted: {}", stringify!($e));
					iobail!(
						ErrorKind::InvalidData,
						"superblock: {}",
						stringify!($e)
					);
				}
			};
		}

		sbassert!(sb.itable_start == 1);
		sbassert!(sb.ciutable_start == sb.itable_start + sb.itable_size);
		sbassert!(sb.fctable_start == sb.ciutable_start + sb.ciutable_size);
		sbassert!(sb.dzone_start == sb.fctable_start + sb.fctable_size);
		sbassert!(sb.itotal == sb.itable_size * IPB as u32);
		sbassert!(sb.ifree < sb.itotal);
		sbassert!(sb.ntotal >= sb.dzone_start);
		sbassert!(
			sb.dzone_total
				<= (sb.ntotal - 1 - sb.itable_size - sb.ciutable_size - sb.fctable_size)
					/ BLOCKS_PER_CLUSTER as u32
		);
		sbassert!(sb.dzone_total >= 1);
		sbassert!(sb.dzone_free < sb.dzone_total);
		sbassert!(sb.fctable_pos < sb.dzone_total);
		sbassert!(sb.dzone_retriev.idx <= DZONE_CACHE_SIZE as u32);
		sbassert!(sb.dzone_insert.idx <= DZONE_CACHE_SIZE as u32);
		sbassert!((sb.ifree == 0) == (sb.ihead == NULL_INODE && sb.itail == NULL_INODE));
		sbassert!(sb.name.contains(&0));

		log::info!("OK");
		Ok(())
	}

	pub(crate) fn update_sb(&mut self, f: impl FnOnce(&mut Superblock)) -> IoResult<()> {
		f(&mut self.sb);
		self.file.encode_at(0, &self.sb)?;
		Ok(())
	}

	// ------------------------------------------------------------------
	// inode table slot

	fn load_itable(&mut self, blk: u32) -> IoResult<()> {
		self.itable.check()?;
		if self.itable.is_loaded(blk) {
			return Ok(());
		}
		if blk >= self.sb.itable_size {
			iobail!(ErrorKind::InvalidData, "inode table: block {blk} out of range");
		}
		let pos = self.sb.itable_pos(blk);
		match decode_array::<Inode, B>(&mut self.file, pos, IPB) {
			Ok(data) => {
				self.itable.fill(blk, data);
				Ok(())
			}
			Err(e) => {
				self.itable.poison(&e);
				Err(e)
			}
		}
	}

	fn store_itable(&mut self) -> IoResult<()> {
		self.itable.check()?;
		let Some(blk) = self.itable.loaded_id() else {
			iobail!(ErrorKind::InvalidData, "inode table: store without load");
		};
		let pos = self.sb.itable_pos(blk);
		let res = encode_array(&mut self.file, pos, self.itable.data()?);
		if let Err(e) = res {
			self.itable.poison(&e);
			return Err(e);
		}
		Ok(())
	}

	/// Fetch the raw inode `inr`, in use or free.
	pub(crate) fn inode_get(&mut self, inr: InodeNum) -> IoResult<Inode> {
		let (blk, off) = self.sb.itable_loc(inr)?;
		self.load_itable(blk)?;
		Ok(self.itable.data()?[off].clone())
	}

	/// Rewrite the raw inode `inr` and persist its table block.
	pub(crate) fn inode_put(&mut self, inr: InodeNum, ino: &Inode) -> IoResult<()> {
		self.assert_rw()?;
		let (blk, off) = self.sb.itable_loc(inr)?;
		self.load_itable(blk)?;
		self.itable.data_mut()?[off] = ino.clone();
		self.store_itable()
	}

	// ------------------------------------------------------------------
	// cluster-to-inode map slot

	fn load_cimap(&mut self, blk: u32) -> IoResult<()> {
		self.cimap.check()?;
		if self.cimap.is_loaded(blk) {
			return Ok(());
		}
		if blk >= self.sb.ciutable_size {
			iobail!(
				ErrorKind::InvalidData,
				"cluster-to-inode map: block {blk} out of range"
			);
		}
		let pos = self.sb.cimap_pos(blk);
		match decode_array::<u32, B>(&mut self.file, pos, RPB) {
			Ok(data) => {
				self.cimap.fill(blk, data);
				Ok(())
			}
			Err(e) => {
				self.cimap.poison(&e);
				Err(e)
			}
		}
	}

	fn store_cimap(&mut self) -> IoResult<()> {
		self.cimap.check()?;
		let Some(blk) = self.cimap.loaded_id() else {
			iobail!(
				ErrorKind::InvalidData,
				"cluster-to-inode map: store without load"
			);
		};
		let pos = self.sb.cimap_pos(blk);
		let res = encode_array(&mut self.file, pos, self.cimap.data()?);
		if let Err(e) = res {
			self.cimap.poison(&e);
			return Err(e);
		}
		Ok(())
	}

	/// Owner recorded for the data cluster `cref`.
	pub(crate) fn cimap_get(&mut self, cref: ClusterNum) -> IoResult<InodeNum> {
		let (blk, slot) = self.sb.cimap_loc(cref)?;
		self.load_cimap(blk)?;
		Ok(self.cimap.data()?[slot])
	}

	pub(crate) fn cimap_set(&mut self, cref: ClusterNum, inr: InodeNum) -> IoResult<()> {
		self.assert_rw()?;
		let (blk, slot) = self.sb.cimap_loc(cref)?;
		self.load_cimap(blk)?;
		self.cimap.data_mut()?[slot] = inr;
		self.store_cimap()
	}

	// ------------------------------------------------------------------
	// free-cluster bitmap slot

	fn load_fcbmap(&mut self, blk: u32) -> IoResult<()> {
		self.fcbmap.check()?;
		if self.fcbmap.is_loaded(blk) {
			return Ok(());
		}
		if blk >= self.sb.fctable_size {
			iobail!(
				ErrorKind::InvalidData,
				"free-cluster bitmap: block {blk} out of range"
			);
		}
		let pos = self.sb.bitmap_pos(blk);
		let mut data = vec![0u8; BLOCK_SIZE];
		match self.file.read_at(pos, &mut data) {
			Ok(()) => {
				self.fcbmap.fill(blk, data);
				Ok(())
			}
			Err(e) => {
				self.fcbmap.poison(&e);
				Err(e)
			}
		}
	}

	fn store_fcbmap(&mut self) -> IoResult<()> {
		self.fcbmap.check()?;
		let Some(blk) = self.fcbmap.loaded_id() else {
			iobail!(
				ErrorKind::InvalidData,
				"free-cluster bitmap: store without load"
			);
		};
		let pos = self.sb.bitmap_pos(blk);
		let mut err = None;
		match self.fcbmap.data() {
			Ok(data) => {
				if let Err(e) = self.file.write_at(pos, data) {
					err = Some(e);
				}
			}
			Err(e) => return Err(e),
		}
		if let Some(e) = err {
			self.fcbmap.poison(&e);
			return Err(e);
		}
		Ok(())
	}

	/// Bitmap bit for `cref`: true means free-and-cached-for-allocation.
	pub(crate) fn bitmap_get(&mut self, cref: ClusterNum) -> IoResult<bool> {
		let (blk, byte, bit) = self.sb.bitmap_loc(cref)?;
		self.load_fcbmap(blk)?;
		Ok(self.fcbmap.data()?[byte] & (0x80 >> bit) != 0)
	}

	pub(crate) fn bitmap_set(&mut self, cref: ClusterNum, free: bool) -> IoResult<()> {
		self.assert_rw()?;
		let (blk, byte, bit) = self.sb.bitmap_loc(cref)?;
		self.load_fcbmap(blk)?;
		let b = &mut self.fcbmap.data_mut()?[byte];
		if free {
			*b |= 0x80 >> bit;
		} else {
			*b &= !(0x80 >> bit);
		}
		self.store_fcbmap()
	}

	// ------------------------------------------------------------------
	// reference-cluster slots (single-indirect and direct references)

	fn load_refclust(&mut self, which: RefSlot, cnum: ClusterNum) -> IoResult<()> {
		let dzone_total = self.sb.dzone_total;
		let pos = self.sb.cluster_pos(cnum);
		let slot = match which {
			RefSlot::Single => &mut self.sind,
			RefSlot::Direct => &mut self.dref,
		};
		slot.check()?;
		if slot.is_loaded(cnum) {
			return Ok(());
		}
		if cnum >= dzone_total {
			iobail!(
				ErrorKind::InvalidData,
				"inode reference list: cluster {cnum} out of range"
			);
		}
		match decode_array::<u32, B>(&mut self.file, pos, RPC) {
			Ok(data) => {
				let slot = match which {
					RefSlot::Single => &mut self.sind,
					RefSlot::Direct => &mut self.dref,
				};
				slot.fill(cnum, data);
				Ok(())
			}
			Err(e) => {
				let slot = match which {
					RefSlot::Single => &mut self.sind,
					RefSlot::Direct => &mut self.dref,
				};
				slot.poison(&e);
				Err(e)
			}
		}
	}

	fn store_refclust(&mut self, which: RefSlot) -> IoResult<()> {
		let slot = match which {
			RefSlot::Single => &mut self.sind,
			RefSlot::Direct => &mut self.dref,
		};
		slot.check()?;
		let Some(cnum) = slot.loaded_id() else {
			iobail!(
				ErrorKind::InvalidData,
				"inode reference list: store without load"
			);
		};
		let pos = self.sb.cluster_pos(cnum);
		let data = match which {
			RefSlot::Single => self.sind.data()?,
			RefSlot::Direct => self.dref.data()?,
		};
		let res = encode_array(&mut self.file, pos, data);
		if let Err(e) = res {
			let slot = match which {
				RefSlot::Single => &mut self.sind,
				RefSlot::Direct => &mut self.dref,
			};
			slot.poison(&e);
			return Err(e);
		}
		Ok(())
	}

	pub(crate) fn refclust_get(
		&mut self,
		which: RefSlot,
		cnum: ClusterNum,
		idx: usize,
	) -> IoResult<u32> {
		self.load_refclust(which, cnum)?;
		let slot = match which {
			RefSlot::Single => &self.sind,
			RefSlot::Direct => &self.dref,
		};
		Ok(slot.data()?[idx])
	}

	pub(crate) fn refclust_set(
		&mut self,
		which: RefSlot,
		cnum: ClusterNum,
		idx: usize,
		val: u32,
	) -> IoResult<()> {
		self.assert_rw()?;
		self.load_refclust(which, cnum)?;
		let slot = match which {
			RefSlot::Single => &mut self.sind,
			RefSlot::Direct => &mut self.dref,
		};
		slot.data_mut()?[idx] = val;
		self.store_refclust(which)
	}

	/// Whether every reference in the cluster is `NULL_CLUSTER`.
	pub(crate) fn refclust_all_null(&mut self, which: RefSlot, cnum: ClusterNum) -> IoResult<bool> {
		self.load_refclust(which, cnum)?;
		let slot = match which {
			RefSlot::Single => &self.sind,
			RefSlot::Direct => &self.dref,
		};
		Ok(slot.data()?.iter().all(|r| *r == NULL_CLUSTER))
	}

	/// Initialize a freshly allocated reference cluster to all-null and
	/// persist it, without reading the stale contents first.
	pub(crate) fn refclust_init(&mut self, which: RefSlot, cnum: ClusterNum) -> IoResult<()> {
		self.assert_rw()?;
		if cnum >= self.sb.dzone_total {
			iobail!(
				ErrorKind::InvalidData,
				"inode reference list: cluster {cnum} out of range"
			);
		}
		let slot = match which {
			RefSlot::Single => &mut self.sind,
			RefSlot::Direct => &mut self.dref,
		};
		slot.check()?;
		slot.fill(cnum, vec![NULL_CLUSTER; RPC]);
		self.store_refclust(which)
	}

	/// Drop a reference-cluster slot that caches `cnum`; the cluster is
	/// changing role or owner and the cached view no longer holds.
	pub(crate) fn evict_cluster(&mut self, cnum: ClusterNum) {
		for slot in [&mut self.sind, &mut self.dref] {
			if slot.is_loaded(cnum) {
				*slot = Slot::new();
			}
		}
	}

	// ------------------------------------------------------------------
	// raw cluster I/O

	pub(crate) fn read_cluster(&mut self, cref: ClusterNum, buf: &mut [u8]) -> IoResult<()> {
		assert_eq!(buf.len(), CLUSTER_SIZE);
		if cref >= self.sb.dzone_total {
			iobail!(ErrorKind::InvalidData, "data zone: cluster {cref} out of range");
		}
		self.file.read_at(self.sb.cluster_pos(cref), buf)
	}

	pub(crate) fn write_cluster(&mut self, cref: ClusterNum, buf: &[u8]) -> IoResult<()> {
		self.assert_rw()?;
		assert_eq!(buf.len(), CLUSTER_SIZE);
		if cref >= self.sb.dzone_total {
			iobail!(ErrorKind::InvalidData, "data zone: cluster {cref} out of range");
		}
		self.evict_cluster(cref);
		self.file.write_at(self.sb.cluster_pos(cref), buf)
	}
}

/// Which of the two reference-cluster slots to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefSlot {
	/// The cluster-of-single-indirect-references slot (`i2` contents).
	Single,
	/// The cluster-of-direct-references slot (`i1` and sub-cluster contents).
	Direct,
}

fn decode_array<X: Decode, B: Backend>(
	file: &mut Codec<BlockReader<B>>,
	pos: u64,
	n: usize,
) -> IoResult<Vec<X>> {
	file.seek(pos)?;
	let mut v = Vec::with_capacity(n);
	for _ in 0..n {
		v.push(file.decode()?);
	}
	Ok(v)
}

fn encode_array<X: Encode, B: Backend>(
	file: &mut Codec<BlockReader<B>>,
	pos: u64,
	items: &[X],
) -> IoResult<()> {
	file.seek(pos)?;
	for x in items {
		file.encode(x)?;
	}
	Ok(())
}

pub(crate) fn check_name_is_legal(name: &OsStr) -> IoResult<()> {
	let b = name.as_encoded_bytes();

	if b.is_empty() || b.contains(&b'/') || b.contains(&b'\0') {
		return Err(err!(EINVAL));
	}
	if b.len() > MAX_NAME {
		return Err(err!(ENAMETOOLONG));
	}
	Ok(())
}
