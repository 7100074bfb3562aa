use std::{ffi::OsStr, fs::File, io::ErrorKind};

use rstest::rstest;
use rsofs::{
	format, AddAttach, ClusterOp, FormatOpts, InodeType, Sofs, ACCESS_EXEC, ACCESS_READ,
	ACCESS_WRITE, BLOCK_SIZE, CLUSTER_SIZE, DZONE_CACHE_SIZE, MAX_FILE_SIZE, NULL_CLUSTER,
	NULL_INODE, N_DIRECT, RPC,
};
use tempfile::NamedTempFile;

fn mkimg(blocks: u64, inodes: Option<u32>) -> NamedTempFile {
	let f = NamedTempFile::new().unwrap();
	f.as_file().set_len(blocks * BLOCK_SIZE as u64).unwrap();
	let opts = FormatOpts {
		name: "scratch".to_string(),
		itotal: inodes,
		zero: false,
	};
	format(f.path(), &opts).unwrap();
	f
}

fn mount(img: &NamedTempFile) -> Sofs<File> {
	let mut fs = Sofs::open(img.path(), true).unwrap();
	fs.set_cred(0, 0);
	fs
}

fn errno(e: &std::io::Error) -> i32 {
	e.raw_os_error().unwrap_or(0)
}

#[rstest]
#[case(100, Some(56))]
#[case(20, Some(8))]
#[case(1000, Some(40))]
#[case(250, None)]
fn format_passes_self_check(#[case] blocks: u64, #[case] inodes: Option<u32>) {
	let img = mkimg(blocks, inodes);
	let mut fs = mount(&img);
	fs.check_consistency().unwrap();
}

#[test]
fn empty_volume_shape() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	let info = fs.info();
	assert_eq!(info.files, 56);
	assert_eq!(info.ffree, 55);
	assert_eq!(info.clusters - info.cfree, 1);

	let sb = fs.superblock().clone();
	assert_eq!(sb.ihead, 1);
	assert_eq!(sb.itail, 55);
	assert_eq!(sb.dzone_free, sb.dzone_total - 1);

	let attr = fs.inode_attr(0).unwrap();
	assert_eq!(attr.kind, InodeType::Directory);
	assert_eq!(attr.perm, 0o777);
	assert_eq!(attr.refcount, 2);
	assert_eq!(attr.size, CLUSTER_SIZE as u64);
	assert_eq!(attr.clusters, 1);

	assert_eq!(fs.handle_file_cluster(0, 0, ClusterOp::Get).unwrap(), 0);
	for ci in 1..N_DIRECT as u32 {
		assert_eq!(
			fs.handle_file_cluster(0, ci, ClusterOp::Get).unwrap(),
			NULL_CLUSTER
		);
	}

	fs.check_consistency().unwrap();
}

#[test]
fn cluster_alloc_free_round_trip() {
	let img = mkimg(20, Some(8));
	let mut fs = mount(&img);
	let total = fs.superblock().dzone_total;

	let mut got = Vec::new();
	loop {
		match fs.alloc_data_cluster() {
			Ok(c) => got.push(c),
			Err(e) => {
				assert_eq!(errno(&e), libc::ENOSPC);
				break;
			}
		}
	}
	assert_eq!(got.len() as u32, total - 1);

	for c in got.iter().rev() {
		fs.free_data_cluster(*c).unwrap();
	}
	fs.check_consistency().unwrap();

	// a clean unmount drains both caches into the bitmap
	fs.close().unwrap();
	let sb = fs.superblock();
	assert_eq!(sb.dzone_free, total - 1);
	assert_eq!(sb.dzone_retriev.idx, DZONE_CACHE_SIZE as u32);
	assert_eq!(sb.dzone_insert.idx, 0);
	drop(fs);

	let mut fs = mount(&img);
	assert!(!fs.cluster_bitmap_bit(0).unwrap());
	assert_eq!(fs.cluster_owner(0).unwrap(), 0);
	for c in 1..total {
		assert!(fs.cluster_bitmap_bit(c).unwrap());
		assert_eq!(fs.cluster_owner(c).unwrap(), NULL_INODE);
	}
}

#[test]
fn indirect_growth() {
	let img = mkimg(1000, Some(40));
	let mut fs = mount(&img);

	let inr = fs.alloc_inode(InodeType::RegularFile).unwrap();
	assert_eq!(inr, 1);

	let buf = vec![0xA5u8; CLUSTER_SIZE];
	for ci in [0u32, N_DIRECT as u32, (N_DIRECT + RPC) as u32] {
		fs.write_file_cluster(inr, ci, &buf).unwrap();
		let c = fs.handle_file_cluster(inr, ci, ClusterOp::Get).unwrap();
		assert_ne!(c, NULL_CLUSTER);
		assert_eq!(fs.cluster_owner(c).unwrap(), inr);
	}

	// three data clusters plus i1, i2 and one sub-single-indirect cluster
	assert_eq!(fs.inode_attr(inr).unwrap().clusters, 6);
	let total = fs.superblock().dzone_total;
	let owned = (0..total)
		.filter(|c| fs.cluster_owner(*c).unwrap() == inr)
		.count();
	assert_eq!(owned, 6);

	let mut back = vec![0u8; CLUSTER_SIZE];
	fs.read_file_cluster(inr, N_DIRECT as u32, &mut back).unwrap();
	assert_eq!(back, buf);

	fs.check_consistency().unwrap();
}

#[test]
fn directory_hierarchy() {
	let img = mkimg(100, Some(72));
	let mut fs = mount(&img);

	let a = fs.create(0, OsStr::new("a"), InodeType::Directory, 0o755).unwrap();
	let b = fs
		.create(a, OsStr::new("b"), InodeType::RegularFile, 0o644)
		.unwrap();
	fs.symlink_create(a, OsStr::new("c"), OsStr::new("b")).unwrap();

	let mut names = Vec::new();
	fs.dir_iter(a, |name, _, _| {
		names.push(name.to_os_string());
		None::<()>
	})
	.unwrap();
	assert_eq!(names, [".", "..", "b", "c"]);

	// the symlink resolves to b
	let (dir, ent) = fs.resolve_path(OsStr::new("/a/c")).unwrap();
	assert_eq!(dir, a);
	assert_eq!(ent, b);

	let ffree = fs.info().ffree;
	fs.remove(a, OsStr::new("b")).unwrap();
	assert_eq!(fs.info().ffree, ffree + 1);
	// b is free-dirty now; it no longer reads as an in-use inode
	assert!(fs.inode_attr(b).is_err());
	assert_eq!(
		errno(&fs.dir_lookup(a, OsStr::new("b")).unwrap_err()),
		libc::ENOENT
	);

	fs.check_consistency().unwrap();
}

#[test]
fn rename_and_collisions() {
	let img = mkimg(100, Some(72));
	let mut fs = mount(&img);

	let a = fs.create(0, OsStr::new("a"), InodeType::Directory, 0o755).unwrap();
	let c = fs.symlink_create(a, OsStr::new("c"), OsStr::new("b")).unwrap();

	fs.rename_dir_entry(a, OsStr::new("c"), OsStr::new("d")).unwrap();
	assert_eq!(fs.dir_lookup(a, OsStr::new("d")).unwrap(), c);
	assert_eq!(
		errno(&fs.dir_lookup(a, OsStr::new("c")).unwrap_err()),
		libc::ENOENT
	);

	let e = fs
		.rename_dir_entry(a, OsStr::new("d"), OsStr::new("d"))
		.unwrap_err();
	assert_eq!(errno(&e), libc::EEXIST);

	let e = fs
		.rename_dir_entry(a, OsStr::new(".."), OsStr::new("x"))
		.unwrap_err();
	assert_eq!(errno(&e), libc::EINVAL);

	fs.check_consistency().unwrap();
}

#[test]
fn permission_checks() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	fs.set_cred(1000, 1000);
	let f = fs
		.create(0, OsStr::new("f"), InodeType::RegularFile, 0o400)
		.unwrap();
	let attr = fs.inode_attr(f).unwrap();
	assert_eq!(attr.owner, 1000);

	fs.access_granted(f, ACCESS_READ).unwrap();
	assert_eq!(errno(&fs.access_granted(f, ACCESS_WRITE).unwrap_err()), libc::EACCES);
	assert_eq!(errno(&fs.access_granted(f, ACCESS_EXEC).unwrap_err()), libc::EACCES);

	// root gets read and write outright, but execute still needs an x bit
	fs.set_cred(0, 0);
	fs.access_granted(f, ACCESS_READ | ACCESS_WRITE).unwrap();
	assert_eq!(errno(&fs.access_granted(f, ACCESS_EXEC).unwrap_err()), libc::EACCES);
}

#[test]
fn inode_exhaustion() {
	let img = mkimg(20, Some(8));
	let mut fs = mount(&img);

	for _ in 0..7 {
		fs.alloc_inode(InodeType::RegularFile).unwrap();
	}
	let e = fs.alloc_inode(InodeType::RegularFile).unwrap_err();
	assert_eq!(errno(&e), libc::ENOSPC);
}

#[test]
fn freed_inodes_recycle_through_the_tail() {
	let img = mkimg(20, Some(8));
	let mut fs = mount(&img);

	let first = fs.alloc_inode(InodeType::RegularFile).unwrap();
	assert_eq!(first, 1);
	fs.free_inode(first).unwrap();

	// 1 went to the tail; the next allocation takes the old head's successor
	assert_eq!(fs.alloc_inode(InodeType::RegularFile).unwrap(), 2);
	assert_eq!(fs.superblock().itail, first);
	fs.check_consistency().unwrap();
}

#[test]
fn symlink_chain_is_a_loop() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	fs.create(0, OsStr::new("f"), InodeType::RegularFile, 0o644).unwrap();
	fs.symlink_create(0, OsStr::new("l2"), OsStr::new("f")).unwrap();
	fs.symlink_create(0, OsStr::new("l1"), OsStr::new("l2")).unwrap();

	let e = fs.resolve_path(OsStr::new("/l1")).unwrap_err();
	assert_eq!(errno(&e), libc::ELOOP);

	// a single link along the path is fine
	let (_, ent) = fs.resolve_path(OsStr::new("/l2")).unwrap();
	assert_eq!(ent, fs.dir_lookup(0, OsStr::new("f")).unwrap());
}

#[test]
fn non_empty_directory_stays() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	let a = fs.create(0, OsStr::new("a"), InodeType::Directory, 0o755).unwrap();
	fs.create(a, OsStr::new("b"), InodeType::RegularFile, 0o644).unwrap();

	let e = fs.remove(0, OsStr::new("a")).unwrap_err();
	assert_eq!(errno(&e), libc::ENOTEMPTY);

	fs.remove(a, OsStr::new("b")).unwrap();
	fs.remove(0, OsStr::new("a")).unwrap();
	fs.check_consistency().unwrap();
}

#[test]
fn write_at_the_file_size_limit() {
	let img = mkimg(1000, Some(40));
	let mut fs = mount(&img);

	let inr = fs.alloc_inode(InodeType::RegularFile).unwrap();
	assert_eq!(fs.write(inr, MAX_FILE_SIZE - 1, &[0x7F]).unwrap(), 1);
	assert_eq!(fs.inode_attr(inr).unwrap().size, MAX_FILE_SIZE);

	let e = fs.write(inr, MAX_FILE_SIZE, &[0x7F]).unwrap_err();
	assert_eq!(errno(&e), libc::EINVAL);

	let mut byte = [0u8; 1];
	assert_eq!(fs.read(inr, MAX_FILE_SIZE - 1, &mut byte).unwrap(), 1);
	assert_eq!(byte[0], 0x7F);

	fs.check_consistency().unwrap();
}

#[test]
fn truncate_releases_the_chain() {
	let img = mkimg(1000, Some(40));
	let mut fs = mount(&img);
	let cfree = fs.info().cfree;

	let inr = fs.alloc_inode(InodeType::RegularFile).unwrap();
	let data = vec![0x3Cu8; 10 * CLUSTER_SIZE];
	assert_eq!(fs.write(inr, 0, &data).unwrap(), data.len());

	// seven direct clusters, i1 and three of its references
	assert_eq!(fs.inode_attr(inr).unwrap().clusters, 11);
	assert_eq!(fs.info().cfree, cfree - 11);

	fs.truncate(inr, 0).unwrap();
	let attr = fs.inode_attr(inr).unwrap();
	assert_eq!(attr.size, 0);
	assert_eq!(attr.clusters, 0);
	assert_eq!(fs.info().cfree, cfree);

	fs.check_consistency().unwrap();
}

#[test]
fn dirty_cluster_reuse_cleans_the_old_owner() {
	let img = mkimg(20, Some(8));
	let mut fs = mount(&img);

	let inr = fs.alloc_inode(InodeType::RegularFile).unwrap();
	let buf = vec![0x11u8; CLUSTER_SIZE];
	fs.write_file_cluster(inr, 0, &buf).unwrap();
	let c = fs.handle_file_cluster(inr, 0, ClusterOp::Get).unwrap();

	// release the data cluster but keep the (dirty) reference and mapping
	fs.handle_file_cluster(inr, 0, ClusterOp::Free).unwrap();
	assert_eq!(fs.cluster_owner(c).unwrap(), inr);
	assert_eq!(fs.handle_file_cluster(inr, 0, ClusterOp::Get).unwrap(), c);

	// drain the pool until the dirty cluster comes back around
	let mut reused = Vec::new();
	loop {
		let got = fs.alloc_data_cluster().unwrap();
		reused.push(got);
		if got == c {
			break;
		}
	}

	// the reverse map and the old owner's reference list were scrubbed
	assert_eq!(fs.cluster_owner(c).unwrap(), NULL_INODE);
	assert_eq!(
		fs.handle_file_cluster(inr, 0, ClusterOp::Get).unwrap(),
		NULL_CLUSTER
	);
	assert_eq!(fs.inode_attr(inr).unwrap().clusters, 0);

	for got in reused.iter().rev() {
		fs.free_data_cluster(*got).unwrap();
	}
	fs.check_consistency().unwrap();
}

#[test]
fn hard_links_share_the_inode() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	let f = fs.create(0, OsStr::new("f"), InodeType::RegularFile, 0o644).unwrap();
	fs.add_dir_entry(0, OsStr::new("g"), f, AddAttach::Add).unwrap();
	assert_eq!(fs.inode_attr(f).unwrap().refcount, 2);
	assert_eq!(fs.dir_lookup(0, OsStr::new("g")).unwrap(), f);

	fs.remove(0, OsStr::new("f")).unwrap();
	assert_eq!(fs.inode_attr(f).unwrap().refcount, 1);

	fs.remove(0, OsStr::new("g")).unwrap();
	assert!(fs.inode_attr(f).is_err());

	fs.check_consistency().unwrap();
}

#[test]
fn relative_paths_are_rejected() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	let e = fs.resolve_path(OsStr::new("a/b")).unwrap_err();
	assert_eq!(errno(&e), libc::EINVAL);

	assert_eq!(fs.resolve_path(OsStr::new("/")).unwrap(), (0, 0));
}

#[test]
fn long_names_are_rejected() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	let long = "x".repeat(60);
	let e = fs
		.create(0, OsStr::new(&long), InodeType::RegularFile, 0o644)
		.unwrap_err();
	assert_eq!(errno(&e), libc::ENAMETOOLONG);
}

#[test]
fn double_alloc_of_a_slot_is_refused() {
	let img = mkimg(100, Some(56));
	let mut fs = mount(&img);

	let inr = fs.alloc_inode(InodeType::RegularFile).unwrap();
	fs.handle_file_cluster(inr, 0, ClusterOp::Alloc).unwrap();
	let e = fs.handle_file_cluster(inr, 0, ClusterOp::Alloc).unwrap_err();
	assert_eq!(e.kind(), ErrorKind::InvalidData);

	let e = fs.handle_file_cluster(inr, 3, ClusterOp::Free).unwrap_err();
	assert_eq!(e.kind(), ErrorKind::InvalidData);
}
