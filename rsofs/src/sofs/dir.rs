use std::{
	ffi::OsStr,
	io::Cursor,
	os::unix::ffi::OsStrExt,
};

use super::{inode::kind_of, *};
use crate::{err, iobail};

/// Insertion mode of [`Sofs::add_dir_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddAttach {
	/// Bind a fresh inode (or hard-link an existing file/symlink).
	Add,
	/// Re-parent a detached subsidiary directory.
	Attach,
}

/// Removal mode of [`Sofs::rem_dir_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemDetach {
	/// Remove the entry, leaving it dirty-empty (recoverable), and free
	/// the inode once its references run out.
	Rem,
	/// Scrub the entry to clean-empty, keeping the inode alive.
	Detach,
}

/// Outcome of a directory scan for a name.
#[derive(Debug, Clone, Copy)]
pub enum DirSearch {
	Found {
		inr: InodeNum,
		idx: u32,
	},
	/// Not present; `insert_at` is the earliest clean-empty slot, or the
	/// append point past the last entry.
	Missing {
		insert_at: u32,
	},
}

impl DirEntry {
	pub(crate) fn clean_empty() -> Self {
		Self {
			name: [0u8; MAX_NAME + 1],
			inr:  NULL_INODE,
		}
	}

	/// Build an in-use entry from a pre-validated name.
	pub(crate) fn filled(name: &OsStr, inr: InodeNum) -> Self {
		let mut e = Self::clean_empty();
		e.set_name(name);
		e.inr = inr;
		e
	}

	pub fn state(&self) -> DirEntryState {
		if self.name[0] != 0 && self.inr != NULL_INODE {
			DirEntryState::InUse
		} else if self.inr == NULL_INODE && self.name.iter().all(|b| *b == 0) {
			DirEntryState::CleanEmpty
		} else {
			DirEntryState::DirtyEmpty
		}
	}

	pub fn name_os(&self) -> &OsStr {
		let len = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
		OsStr::from_bytes(&self.name[..len])
	}

	fn set_name(&mut self, name: &OsStr) {
		let bytes = name.as_bytes();
		self.name = [0u8; MAX_NAME + 1];
		self.name[..bytes.len()].copy_from_slice(bytes);
	}

	/// Swap the first and last name bytes: the dirty-empty state. The
	/// former first character survives at the far end and the inode
	/// reference is retained, so the entry stays recoverable.
	fn mark_deleted(&mut self) {
		self.name.swap(0, MAX_NAME);
		self.name[0] = 0;
	}
}

fn decode_dir_cluster(buf: &[u8]) -> IoResult<Vec<DirEntry>> {
	let mut file = Codec::new(Cursor::new(buf));
	let mut entries = Vec::with_capacity(DPC);
	for _ in 0..DPC {
		entries.push(file.decode()?);
	}
	Ok(entries)
}

pub(crate) fn encode_dir_cluster(entries: &[DirEntry]) -> IoResult<Vec<u8>> {
	assert_eq!(entries.len(), DPC);
	let mut file = Codec::new(Cursor::new(Vec::with_capacity(CLUSTER_SIZE)));
	for e in entries {
		file.encode(e)?;
	}
	Ok(file.into_inner().into_inner())
}

impl<B: Backend> Sofs<B> {
	/// Fetch inode `inr`, requiring an in-use directory.
	fn dir_inode(&mut self, inr: InodeNum) -> IoResult<Inode> {
		let ino = self.read_inode(inr)?;
		if kind_of(&ino, inr)? != InodeType::Directory {
			return Err(err!(ENOTDIR));
		}
		if ino.size as usize % CLUSTER_SIZE != 0 {
			iobail!(
				ErrorKind::InvalidData,
				"directory contents: {inr} has size {}",
				ino.size
			);
		}
		Ok(ino)
	}

	pub(crate) fn read_dir_cluster(&mut self, dinr: InodeNum, ci: u32) -> IoResult<Vec<DirEntry>> {
		let mut buf = vec![0u8; CLUSTER_SIZE];
		self.read_file_cluster(dinr, ci, &mut buf)?;
		decode_dir_cluster(&buf)
	}

	pub(crate) fn write_dir_cluster(
		&mut self,
		dinr: InodeNum,
		ci: u32,
		entries: &[DirEntry],
	) -> IoResult<()> {
		let buf = encode_dir_cluster(entries)?;
		self.write_file_cluster(dinr, ci, &buf)
	}

	/// Scan the directory `dinr` for `name`. Requires search permission.
	/// On a miss the result carries the insertion point: the earliest
	/// clean-empty slot, or one past the last entry.
	pub fn dir_search(&mut self, dinr: InodeNum, name: &OsStr) -> IoResult<DirSearch> {
		log::trace!("dir_search({dinr}, {name:?});");
		check_name_is_legal(name)?;
		let dino = self.dir_inode(dinr)?;
		self.access_granted(dinr, ACCESS_EXEC)?;

		let nent = dino.size as usize / DIRENT_SIZE;
		let mut first_clean = None;

		for ci in 0..(nent / DPC) as u32 {
			let entries = self.read_dir_cluster(dinr, ci)?;
			for (j, e) in entries.iter().enumerate() {
				let idx = ci * DPC as u32 + j as u32;
				match e.state() {
					DirEntryState::InUse if e.name_os() == name => {
						return Ok(DirSearch::Found {
							inr: e.inr,
							idx,
						});
					}
					DirEntryState::CleanEmpty if first_clean.is_none() => {
						first_clean = Some(idx);
					}
					_ => {}
				}
			}
		}

		Ok(DirSearch::Missing {
			insert_at: first_clean.unwrap_or(nent as u32),
		})
	}

	/// Find the inode bound to `name` in the directory `dinr`.
	pub fn dir_lookup(&mut self, dinr: InodeNum, name: &OsStr) -> IoResult<InodeNum> {
		log::trace!("dir_lookup({dinr}, {name:?});");
		match self.dir_search(dinr, name)? {
			DirSearch::Found { inr, .. } => Ok(inr),
			DirSearch::Missing { .. } => Err(err!(ENOENT)),
		}
	}

	/// Iterate through the in-use entries of directory `inr`, calling `f`
	/// for each until it returns `Some`.
	pub fn dir_iter<T>(
		&mut self,
		inr: InodeNum,
		mut f: impl FnMut(&OsStr, InodeNum, InodeType) -> Option<T>,
	) -> IoResult<Option<T>> {
		let dino = self.dir_inode(inr)?;
		let nclust = (dino.size as usize / CLUSTER_SIZE) as u32;

		for ci in 0..nclust {
			let entries = self.read_dir_cluster(inr, ci)?;
			for e in &entries {
				if e.state() != DirEntryState::InUse {
					continue;
				}
				let eino = self.inode_get(e.inr)?;
				let Some(kind) = eino.kind() else {
					log::warn!(
						"dir_iter({inr}): entry {:?} references malformed inode {}",
						e.name_os(),
						e.inr
					);
					continue;
				};
				if let Some(x) = f(e.name_os(), e.inr, kind) {
					return Ok(Some(x));
				}
			}
		}
		Ok(None)
	}

	/// Whether directory `inr` holds nothing besides `.` and `..`.
	pub(crate) fn dir_is_empty(&mut self, inr: InodeNum) -> IoResult<bool> {
		let x = self.dir_iter(inr, |name, _, _| {
			if name != "." && name != ".." {
				Some(())
			} else {
				None
			}
		})?;
		Ok(x.is_none())
	}

	/// Bind `einr` under `name` in directory `dinr`.
	///
	/// ADD of a fresh directory writes its `.`/`..` cluster; ADD of a file
	/// or symlink is also the hard-link path. ATTACH re-parents a detached
	/// subsidiary directory.
	pub fn add_dir_entry(
		&mut self,
		dinr: InodeNum,
		name: &OsStr,
		einr: InodeNum,
		op: AddAttach,
	) -> IoResult<()> {
		log::trace!("add_dir_entry({dinr}, {name:?}, {einr}, {op:?});");
		self.assert_rw()?;
		check_name_is_legal(name)?;
		if name == "." || name == ".." {
			return Err(err!(EINVAL));
		}

		let dino = self.dir_inode(dinr)?;
		self.access_granted(dinr, ACCESS_WRITE | ACCESS_EXEC)?;

		let eino = self.read_inode(einr)?;
		let ekind = kind_of(&eino, einr)?;
		let is_dir = ekind == InodeType::Directory;

		match op {
			AddAttach::Add if is_dir && eino.refcount != 0 => {
				// directories cannot be hard-linked
				return Err(err!(EINVAL));
			}
			AddAttach::Attach if !is_dir => {
				iobail!(
					ErrorKind::InvalidData,
					"inode in use: attach of non-directory {einr}"
				);
			}
			_ => {}
		}

		let insert_at = match self.dir_search(dinr, name)? {
			DirSearch::Found { .. } => return Err(err!(EEXIST)),
			DirSearch::Missing { insert_at } => insert_at,
		};

		let child_inc: u16 = if is_dir { 2 } else { 1 };
		let parent_inc: u16 = if is_dir { 1 } else { 0 };
		if eino.refcount.checked_add(child_inc).is_none() {
			return Err(err!(EMLINK));
		}
		if parent_inc > 0 && dino.refcount.checked_add(parent_inc).is_none() {
			return Err(err!(EMLINK));
		}

		if (insert_at as u64 + 1) * DIRENT_SIZE as u64 > MAX_FILE_SIZE {
			return Err(err!(EFBIG));
		}

		let nent = dino.size as usize / DIRENT_SIZE;
		let appending = insert_at as usize == nent;
		let ci = insert_at / DPC as u32;
		let within = insert_at as usize % DPC;

		let mut entries = if appending {
			vec![DirEntry::clean_empty(); DPC]
		} else {
			self.read_dir_cluster(dinr, ci)?
		};

		// child side first, then the parent inode, then the entry cluster
		match op {
			AddAttach::Add if is_dir => {
				let mut first = vec![DirEntry::clean_empty(); DPC];
				first[0] = DirEntry::filled(OsStr::new("."), einr);
				first[1] = DirEntry::filled(OsStr::new(".."), dinr);
				self.write_dir_cluster(einr, 0, &first)?;
				self.inode_update(einr, |ino| {
					ino.refcount += 2;
					ino.size = BSLPC as u32;
					ino.touch_mtime();
				})?;
			}
			AddAttach::Add => {
				self.inode_update(einr, |ino| ino.refcount += 1)?;
			}
			AddAttach::Attach => {
				let mut first = self.read_dir_cluster(einr, 0)?;
				first[1] = DirEntry::filled(OsStr::new(".."), dinr);
				self.write_dir_cluster(einr, 0, &first)?;
				self.inode_update(einr, |ino| {
					ino.refcount += 2;
					ino.touch_mtime();
				})?;
			}
		}

		self.inode_update(dinr, |ino| {
			ino.refcount += parent_inc;
			if appending {
				ino.size += BSLPC as u32;
			}
			ino.touch_mtime();
		})?;

		entries[within] = DirEntry::filled(name, einr);
		self.write_dir_cluster(dinr, ci, &entries)?;

		Ok(())
	}

	/// Unbind `name` from directory `dinr`.
	///
	/// REM leaves the entry dirty-empty and releases the child's clusters
	/// and inode once unreferenced; DETACH scrubs the entry clean and keeps
	/// the child alive (the re-parenting path).
	pub fn rem_dir_entry(&mut self, dinr: InodeNum, name: &OsStr, op: RemDetach) -> IoResult<()> {
		log::trace!("rem_dir_entry({dinr}, {name:?}, {op:?});");
		self.assert_rw()?;
		check_name_is_legal(name)?;
		if name == "." || name == ".." {
			return Err(err!(EINVAL));
		}

		self.dir_inode(dinr)?;
		self.access_granted(dinr, ACCESS_WRITE | ACCESS_EXEC)?;

		let (einr, idx) = match self.dir_search(dinr, name)? {
			DirSearch::Found { inr, idx } => (inr, idx),
			DirSearch::Missing { .. } => return Err(err!(ENOENT)),
		};

		let eino = self.read_inode(einr)?;
		let is_dir = kind_of(&eino, einr)? == InodeType::Directory;

		if is_dir && op == RemDetach::Rem && !self.dir_is_empty(einr)? {
			return Err(err!(ENOTEMPTY));
		}

		let mut child_dec: u16 = 1;
		if is_dir && op == RemDetach::Rem {
			// the child's own `.` no longer holds it up
			child_dec += 1;
		}
		let parent_dec: u16 = if is_dir { 1 } else { 0 };
		if eino.refcount < child_dec {
			iobail!(
				ErrorKind::InvalidData,
				"directory entry: {name:?} child {einr} undercounted"
			);
		}

		// child side first, then the parent inode, then the entry cluster
		if op == RemDetach::Detach && is_dir {
			let mut first = self.read_dir_cluster(einr, 0)?;
			first[1] = DirEntry::clean_empty();
			self.write_dir_cluster(einr, 0, &first)?;
		}
		self.inode_update(einr, |ino| ino.refcount -= child_dec)?;
		if parent_dec > 0 {
			self.inode_update(dinr, |ino| {
				ino.refcount -= parent_dec;
				ino.touch_mtime();
			})?;
		} else {
			self.inode_update(dinr, |ino| ino.touch_mtime())?;
		}

		let ci = idx / DPC as u32;
		let within = idx as usize % DPC;
		let mut entries = self.read_dir_cluster(dinr, ci)?;
		match op {
			RemDetach::Rem => entries[within].mark_deleted(),
			RemDetach::Detach => entries[within] = DirEntry::clean_empty(),
		}
		self.write_dir_cluster(dinr, ci, &entries)?;

		if op == RemDetach::Rem {
			let refcount = self.read_inode(einr)?.refcount;
			if refcount == 0 || (is_dir && refcount == 1) {
				if refcount == 1 {
					self.inode_update(einr, |ino| ino.refcount = 0)?;
				}
				self.handle_file_clusters(einr, 0, ClusterOp::FreeClean)?;
				self.free_inode(einr)?;
			}
		}

		Ok(())
	}

	/// Rename the entry `old_name` of directory `dinr` to `new_name`,
	/// in place.
	pub fn rename_dir_entry(
		&mut self,
		dinr: InodeNum,
		old_name: &OsStr,
		new_name: &OsStr,
	) -> IoResult<()> {
		log::trace!("rename_dir_entry({dinr}, {old_name:?}, {new_name:?});");
		self.assert_rw()?;
		check_name_is_legal(old_name)?;
		check_name_is_legal(new_name)?;
		if old_name == "." || old_name == ".." {
			return Err(err!(EINVAL));
		}

		self.dir_inode(dinr)?;
		self.access_granted(dinr, ACCESS_WRITE | ACCESS_EXEC)?;

		if let DirSearch::Found { .. } = self.dir_search(dinr, new_name)? {
			return Err(err!(EEXIST));
		}
		let idx = match self.dir_search(dinr, old_name)? {
			DirSearch::Found { idx, .. } => idx,
			DirSearch::Missing { .. } => return Err(err!(ENOENT)),
		};

		let ci = idx / DPC as u32;
		let within = idx as usize % DPC;
		let mut entries = self.read_dir_cluster(dinr, ci)?;
		entries[within].set_name(new_name);
		self.write_dir_cluster(dinr, ci, &entries)?;
		self.inode_update(dinr, |ino| ino.touch_mtime())?;

		Ok(())
	}

	/// Resolve an absolute path to `(parent directory inode, entry inode)`.
	/// At most one symbolic link is followed along the whole path.
	pub fn resolve_path(&mut self, path: &OsStr) -> IoResult<(InodeNum, InodeNum)> {
		log::trace!("resolve_path({path:?});");
		let bytes = path.as_bytes();
		if bytes.is_empty() {
			return Err(err!(EINVAL));
		}
		if bytes.len() > MAX_PATH {
			return Err(err!(ENAMETOOLONG));
		}
		if bytes[0] != b'/' {
			log::warn!("resolve_path: relative path not allowed: {path:?}");
			return Err(err!(EINVAL));
		}

		let mut budget = 1u32;
		self.walk_path(0, &bytes[1..], &mut budget)
	}

	/// Walk `rel` (no leading slash) from the directory `start`, resolving
	/// symbolic links against `budget`.
	fn walk_path(
		&mut self,
		start: InodeNum,
		rel: &[u8],
		budget: &mut u32,
	) -> IoResult<(InodeNum, InodeNum)> {
		if rel.is_empty() {
			return Ok((start, start));
		}

		let mut dinr = start;
		let mut cur = start;

		for comp in rel.split(|b| *b == b'/') {
			if comp.is_empty() {
				return Err(err!(EINVAL));
			}
			let name = OsStr::from_bytes(comp);
			let next = self.dir_lookup(cur, name)?;

			let nino = self.read_inode(next)?;
			if kind_of(&nino, next)? == InodeType::Symlink {
				if *budget == 0 {
					return Err(err!(ELOOP));
				}
				*budget -= 1;

				let target = self.symlink_read(next)?;
				let tb = target.as_bytes();
				if tb.len() > MAX_PATH {
					return Err(err!(ENAMETOOLONG));
				}
				let (tdir, tent) = if tb.first() == Some(&b'/') {
					self.walk_path(0, &tb[1..], budget)?
				} else {
					self.walk_path(cur, tb, budget)?
				};
				dinr = tdir;
				cur = tent;
			} else {
				dinr = cur;
				cur = next;
			}
		}

		Ok((dinr, cur))
	}

	/// Allocate a fresh inode of `kind` with permissions `perm` and bind it
	/// under `name` in directory `dinr`.
	pub fn create(
		&mut self,
		dinr: InodeNum,
		name: &OsStr,
		kind: InodeType,
		perm: u16,
	) -> IoResult<InodeNum> {
		log::trace!("create({dinr}, {name:?}, {kind:?}, {perm:#o});");
		self.assert_rw()?;
		check_name_is_legal(name)?;

		let inr = self.alloc_inode(kind)?;
		self.inode_update(inr, |ino| {
			ino.mode = (ino.mode & !INODE_PERM_MASK) | (perm & INODE_PERM_MASK);
		})?;

		if let Err(e) = self.add_dir_entry(dinr, name, inr, AddAttach::Add) {
			// the fresh inode is unreferenced; put it back
			let _ = self.free_inode(inr);
			return Err(e);
		}
		Ok(inr)
	}

	/// Remove the entry `name` from directory `dinr`, releasing the child
	/// once unreferenced.
	pub fn remove(&mut self, dinr: InodeNum, name: &OsStr) -> IoResult<()> {
		self.rem_dir_entry(dinr, name, RemDetach::Rem)
	}

	/// Create a symbolic link `name` in `dinr` pointing at `target`.
	pub fn symlink_create(
		&mut self,
		dinr: InodeNum,
		name: &OsStr,
		target: &OsStr,
	) -> IoResult<InodeNum> {
		log::trace!("symlink_create({dinr}, {name:?}, {target:?});");
		let tb = target.as_bytes();
		if tb.is_empty() || tb.contains(&b'\0') {
			return Err(err!(EINVAL));
		}
		if tb.len() > MAX_PATH {
			return Err(err!(ENAMETOOLONG));
		}

		let inr = self.create(dinr, name, InodeType::Symlink, 0o777)?;
		self.symlink_set(inr, target)?;
		Ok(inr)
	}
}
