use super::*;
use crate::iobail;

macro_rules! ckfail {
	($($tk:tt)+) => {{
		log::error!($($tk)+);
		iobail!(ErrorKind::InvalidData, $($tk)+)
	}};
}

impl<B: Backend> Sofs<B> {
	/// Whole-volume consistency check: the free-inode list, the cluster
	/// accounting across bitmap/caches/map, every reachable reference
	/// chain, and the directory shape. Run by the formatter before it
	/// returns, and by tests after scenario sequences.
	pub fn check_consistency(&mut self) -> IoResult<()> {
		log::trace!("check_consistency();");
		self.check_free_inode_list()?;
		self.check_cluster_accounting()?;
		self.check_inode_chains()?;
		self.check_directories()?;
		Ok(())
	}

	fn check_free_inode_list(&mut self) -> IoResult<()> {
		let itotal = self.sb.itotal;
		let ifree = self.sb.ifree;
		let ihead = self.sb.ihead;
		let itail = self.sb.itail;

		let mut bits = 0u32;
		for inr in 0..itotal {
			if self.inode_get(inr)?.is_free() {
				bits += 1;
			}
		}
		if bits != ifree {
			ckfail!("free-inode list: {bits} free bits but ifree={ifree}");
		}

		// forward walk from the head
		let mut n = 0u32;
		let mut prev = NULL_INODE;
		let mut cur = ihead;
		while cur != NULL_INODE {
			n += 1;
			if n > ifree {
				ckfail!("free-inode list: forward walk exceeds ifree={ifree}");
			}
			let ino = self.inode_get(cur)?;
			if !ino.is_free() {
				ckfail!("free-inode list: {cur} linked but not free");
			}
			let Some((p, nx)) = ino.free_links() else {
				ckfail!("free-inode list: {cur} has in-use words");
			};
			if p != prev {
				ckfail!("free-inode list: {cur} points back at {p}, expected {prev}");
			}
			prev = cur;
			cur = nx;
		}
		if n != ifree {
			ckfail!("free-inode list: forward walk found {n}, ifree={ifree}");
		}
		if ifree > 0 && prev != itail {
			ckfail!("free-inode list: forward walk ends at {prev}, itail={itail}");
		}

		// backward walk from the tail
		let mut n = 0u32;
		let mut next = NULL_INODE;
		let mut cur = itail;
		while cur != NULL_INODE {
			n += 1;
			if n > ifree {
				ckfail!("free-inode list: backward walk exceeds ifree={ifree}");
			}
			let ino = self.inode_get(cur)?;
			let Some((p, nx)) = ino.free_links() else {
				ckfail!("free-inode list: {cur} has in-use words");
			};
			if nx != next {
				ckfail!("free-inode list: {cur} points forward at {nx}, expected {next}");
			}
			next = cur;
			cur = p;
		}
		if n != ifree {
			ckfail!("free-inode list: backward walk found {n}, ifree={ifree}");
		}

		Ok(())
	}

	fn check_cluster_accounting(&mut self) -> IoResult<()> {
		const IN_BITMAP: u8 = 1;
		const IN_RETRIEV: u8 = 2;
		const IN_INSERT: u8 = 4;

		let total = self.sb.dzone_total;
		let mut flags = vec![0u8; total as usize];

		for c in 0..total {
			if self.bitmap_get(c)? {
				flags[c as usize] |= IN_BITMAP;
			}
		}
		let retriev = self.sb.dzone_retriev.clone();
		for k in (retriev.idx as usize)..DZONE_CACHE_SIZE {
			let c = retriev.cache[k];
			if c == NULL_CLUSTER || c >= total {
				ckfail!("free-cluster caches: retrieval slot {k} holds {c:#x}");
			}
			flags[c as usize] |= IN_RETRIEV;
		}
		let insert = self.sb.dzone_insert.clone();
		for k in 0..(insert.idx as usize) {
			let c = insert.cache[k];
			if c == NULL_CLUSTER || c >= total {
				ckfail!("free-cluster caches: insert slot {k} holds {c:#x}");
			}
			flags[c as usize] |= IN_INSERT;
		}

		let mut nfree = 0u32;
		for (c, f) in flags.iter().enumerate() {
			if f.count_ones() > 1 {
				ckfail!("free-cluster caches: {c} in more than one free set ({f:#x})");
			}
			if *f != 0 {
				nfree += 1;
			}
		}
		if nfree != self.sb.dzone_free {
			ckfail!(
				"free-cluster total: {nfree} free references but dzone_free={}",
				self.sb.dzone_free
			);
		}

		if flags[0] != 0 {
			ckfail!("data-zone metadata: root cluster is in a free set");
		}
		if self.cimap_get(0)? != 0 {
			ckfail!("cluster-to-inode mapping: root cluster not owned by inode 0");
		}
		for c in 0..total {
			let owner = self.cimap_get(c)?;
			if owner != NULL_INODE && owner >= self.sb.itotal {
				ckfail!("cluster-to-inode mapping: {c} owned by bad inode {owner:#x}");
			}
		}

		Ok(())
	}

	/// Collect every cluster reference reachable from `ino`, indirection
	/// clusters included.
	fn collect_chain(&mut self, ino: &Inode) -> IoResult<Vec<ClusterNum>> {
		let mut refs = Vec::new();
		for r in ino.d {
			if r != NULL_CLUSTER {
				refs.push(r);
			}
		}
		if ino.i1 != NULL_CLUSTER {
			refs.push(ino.i1);
			for k in 0..RPC {
				let r = self.refclust_get(RefSlot::Direct, ino.i1, k)?;
				if r != NULL_CLUSTER {
					refs.push(r);
				}
			}
		}
		if ino.i2 != NULL_CLUSTER {
			refs.push(ino.i2);
			for hi in 0..RPC {
				let sub = self.refclust_get(RefSlot::Single, ino.i2, hi)?;
				if sub == NULL_CLUSTER {
					continue;
				}
				refs.push(sub);
				for lo in 0..RPC {
					let r = self.refclust_get(RefSlot::Direct, sub, lo)?;
					if r != NULL_CLUSTER {
						refs.push(r);
					}
				}
			}
		}
		Ok(refs)
	}

	fn check_inode_chains(&mut self) -> IoResult<()> {
		let itotal = self.sb.itotal;
		let total = self.sb.dzone_total;

		for inr in 0..itotal {
			let ino = self.inode_get(inr)?;
			if ino.is_free() {
				continue;
			}
			let refs = self.collect_chain(&ino)?;
			for r in &refs {
				if *r >= total {
					ckfail!("inode reference list: {inr} references bad cluster {r:#x}");
				}
				let owner = self.cimap_get(*r)?;
				if owner != inr {
					ckfail!(
						"cluster inode mismatch: {r} reachable from {inr} but mapped to {owner:#x}"
					);
				}
			}
			if refs.len() as u32 != ino.clucount {
				ckfail!(
					"inode reference list: {inr} holds {} references but clucount={}",
					refs.len(),
					ino.clucount
				);
			}
		}
		Ok(())
	}

	fn check_directories(&mut self) -> IoResult<()> {
		let itotal = self.sb.itotal;
		for inr in 0..itotal {
			let ino = self.inode_get(inr)?;
			if !ino.is_dir() {
				continue;
			}
			if ino.size as usize % CLUSTER_SIZE != 0 {
				ckfail!("directory contents: {inr} has size {}", ino.size);
			}
			let entries = self.read_dir_cluster(inr, 0)?;
			if entries[0].state() != DirEntryState::InUse
				|| entries[0].name_os() != "."
				|| entries[0].inr != inr
			{
				ckfail!("directory contents: {inr} entry 0 is not `.` to itself");
			}
			if entries[1].state() != DirEntryState::InUse || entries[1].name_os() != ".." {
				ckfail!("directory contents: {inr} entry 1 is not `..`");
			}
			if inr == 0 && entries[1].inr != 0 {
				ckfail!("directory contents: root `..` is not the root");
			}
		}
		Ok(())
	}
}
