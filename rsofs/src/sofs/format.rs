use std::{ffi::OsStr, io::Write, path::Path};

use super::{dir::encode_dir_cluster, Cred, Info, Sofs};
use crate::{
	blockreader::{Backend, BlockReader},
	codec::Codec,
	data::*,
	err,
	inode::now,
	iobail,
};
use std::io::{ErrorKind, Result as IoResult};

/// Options of the formatter core.
#[derive(Debug, Clone)]
pub struct FormatOpts {
	/// Volume name, silently capped at `MAX_VOLNAME` bytes.
	pub name: String,

	/// Requested number of inodes; rounded up to whole table blocks.
	/// Defaults to one inode per eight blocks.
	pub itotal: Option<u32>,

	/// Zero-fill every data cluster.
	pub zero: bool,
}

impl Default for FormatOpts {
	fn default() -> Self {
		Self {
			name:   "SOFS13".to_string(),
			itotal: None,
			zero:   false,
		}
	}
}

/// The computed on-disk layout of a volume.
#[derive(Debug, Clone, Copy)]
struct Layout {
	ntotal:        u32,
	itable_size:   u32,
	itotal:        u32,
	ciutable_size: u32,
	fctable_size:  u32,
	dzone_total:   u32,
}

fn solve_layout(ntotal: u32, req_inodes: Option<u32>) -> IoResult<Layout> {
	let req = req_inodes.unwrap_or(ntotal / 8).max(1);
	let itable_size = req.div_ceil(IPB as u32);
	let itotal = itable_size * IPB as u32;

	// one superblock, the inode table, at least one block of each map and
	// one whole cluster of data
	let floor = 1 + itable_size + 1 + 1 + BLOCKS_PER_CLUSTER as u32;
	if ntotal < floor {
		log::error!("{ntotal} blocks cannot hold {itotal} inodes and a data cluster");
		return Err(err!(ENOSPC));
	}

	let rem = ntotal - 1 - itable_size;
	let mut dzone_total = rem / BLOCKS_PER_CLUSTER as u32;
	loop {
		if dzone_total == 0 {
			return Err(err!(ENOSPC));
		}
		let cis = dzone_total.div_ceil(RPB as u32);
		let fct = dzone_total.div_ceil((BLOCK_SIZE * 8) as u32);
		if cis + fct + dzone_total * BLOCKS_PER_CLUSTER as u32 <= rem {
			return Ok(Layout {
				ntotal,
				itable_size,
				itotal,
				ciutable_size: cis,
				fctable_size: fct,
				dzone_total,
			});
		}
		dzone_total -= 1;
	}
}

fn build_superblock(lay: &Layout, name: &str) -> Superblock {
	let mut vol = [0u8; MAX_VOLNAME + 1];
	let bytes = name.as_bytes();
	let len = bytes.len().min(MAX_VOLNAME);
	vol[..len].copy_from_slice(&bytes[..len]);

	Superblock {
		magic:          SOFS_MAGIC,
		version:        SOFS_VERSION,
		name:           vol,
		ntotal:         lay.ntotal,
		mstat:          MSTAT_PRU,
		itable_start:   1,
		itable_size:    lay.itable_size,
		itotal:         lay.itotal,
		ifree:          lay.itotal - 1,
		ihead:          1,
		itail:          lay.itotal - 1,
		ciutable_start: 1 + lay.itable_size,
		ciutable_size:  lay.ciutable_size,
		dzone_retriev:  DzoneCache::empty_retrieval(),
		dzone_insert:   DzoneCache::empty_insertion(),
		fctable_start:  1 + lay.itable_size + lay.ciutable_size,
		fctable_size:   lay.fctable_size,
		fctable_pos:    0,
		dzone_start:    1 + lay.itable_size + lay.ciutable_size + lay.fctable_size,
		dzone_total:    lay.dzone_total,
		dzone_free:     lay.dzone_total - 1,
		reserved:       [SB_FILL; SB_RESERVED],
	}
}

fn root_inode(cred: Cred) -> Inode {
	let t = now();
	let mut d = [NULL_CLUSTER; N_DIRECT];
	d[0] = 0;
	Inode {
		mode: INODE_DIR | 0o777,
		refcount: 2,
		owner: cred.uid,
		group: cred.gid,
		size: CLUSTER_SIZE as u32,
		clucount: 1,
		var: InodeVar::InUse {
			atime: t,
			mtime: t,
		},
		d,
		i1: NULL_CLUSTER,
		i2: NULL_CLUSTER,
	}
}

fn write_image<B: Backend>(file: &mut Codec<BlockReader<B>>, sb: &Superblock) -> IoResult<()> {
	file.encode_at(0, sb)?;

	// inode table: the root directory, then the free-clean chain 1..itotal
	file.seek(sb.itable_pos(0))?;
	file.encode(&root_inode(Cred::from_process()))?;
	for inr in 1..sb.itotal {
		let prev = if inr == 1 { NULL_INODE } else { inr - 1 };
		let next = if inr == sb.itotal - 1 { NULL_INODE } else { inr + 1 };
		file.encode(&Inode::free_clean(prev, next))?;
	}

	// cluster-to-inode map: the root cluster, then unattached, then the
	// trailing filler up to the end of the table
	file.seek(sb.cimap_pos(0))?;
	file.encode(&0u32)?;
	for _ in 1..sb.dzone_total {
		file.encode(&NULL_INODE)?;
	}
	let slots = sb.ciutable_size as usize * RPB;
	for _ in (sb.dzone_total as usize)..slots {
		file.encode(&CIMAP_PAD)?;
	}

	// free-cluster bitmap, MSB-first: bit 0 is the root cluster
	let mut bits = vec![0u8; sb.fctable_size as usize * BLOCK_SIZE];
	for c in 1..sb.dzone_total {
		bits[(c / 8) as usize] |= 0x80 >> (c % 8);
	}
	file.write_at(sb.bitmap_pos(0), &bits)?;

	// the root directory cluster
	let mut entries = vec![DirEntry::clean_empty(); DPC];
	entries[0] = DirEntry::filled(OsStr::new("."), 0);
	entries[1] = DirEntry::filled(OsStr::new(".."), 0);
	file.write_at(sb.cluster_pos(0), &encode_dir_cluster(&entries)?)?;

	Ok(())
}

fn zero_data_zone<B: Backend>(file: &mut Codec<BlockReader<B>>, sb: &Superblock) -> IoResult<()> {
	let zeros = vec![0u8; CLUSTER_SIZE];
	for c in 1..sb.dzone_total {
		file.write_at(sb.cluster_pos(c), &zeros)?;
	}
	Ok(())
}

/// Format the backing file at `path` as a SOFS13 volume and verify the
/// result against the consistency checker before returning.
pub fn format(path: &Path, opts: &FormatOpts) -> IoResult<Info> {
	let len = std::fs::metadata(path)?.len();
	let ntotal = (len / BLOCK_SIZE as u64).min(u32::MAX as u64) as u32;
	log::info!("formatting {path:?}: {ntotal} blocks");

	let lay = solve_layout(ntotal, opts.itotal)?;
	let sb = build_superblock(&lay, &opts.name);

	let mut file = Codec::new(BlockReader::open(path, true)?);
	write_image(&mut file, &sb)?;
	if opts.zero {
		zero_data_zone(&mut file, &sb)?;
	}
	file.inner_mut().flush()?;
	drop(file);

	let mut fs = Sofs::open(path, false)?;
	fs.check_consistency()?;
	Ok(fs.info())
}

/// Format an arbitrary backend of `ntotal` blocks; the in-memory variant of
/// [`format`], used by tests.
pub fn format_backend<B: Backend>(backend: B, ntotal: u32, opts: &FormatOpts) -> IoResult<()> {
	if ntotal == 0 {
		iobail!(ErrorKind::InvalidInput, "empty backing store");
	}
	let lay = solve_layout(ntotal, opts.itotal)?;
	let sb = build_superblock(&lay, &opts.name);

	let mut file = Codec::new(BlockReader::new(backend, true));
	write_image(&mut file, &sb)?;
	if opts.zero {
		zero_data_zone(&mut file, &sb)?;
	}
	file.inner_mut().flush()
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn layout_for_100_blocks_56_inodes() {
		let lay = solve_layout(100, Some(56)).unwrap();
		assert_eq!(lay.itable_size, 7);
		assert_eq!(lay.itotal, 56);
		assert_eq!(lay.ciutable_size, 1);
		assert_eq!(lay.fctable_size, 1);
		assert_eq!(lay.dzone_total, 22);
	}

	#[test]
	fn layout_rejects_a_tiny_volume() {
		let e = solve_layout(7, None).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
	}

	#[test]
	fn formats_an_anonymous_file() {
		let file = tempfile::tempfile().unwrap();
		file.set_len(100 * BLOCK_SIZE as u64).unwrap();
		format_backend(file.try_clone().unwrap(), 100, &FormatOpts::default()).unwrap();

		let mut fs = Sofs::new(BlockReader::new(file, false)).unwrap();
		let info = fs.info();
		assert_eq!(info.files, 16);
		assert_eq!(info.name, "SOFS13");
		fs.check_consistency().unwrap();
	}
}
