use super::{inode::kind_of, *};
use crate::{err, iobail};

/// Per-slot operation of the unified file-cluster handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
	/// Resolve the logical index; never mutates.
	Get,
	/// Allocate a data cluster into the slot, creating intermediates.
	Alloc,
	/// Release the data cluster, keeping the (now dirty) reference.
	Free,
	/// Release the data cluster, clear the reference and the map entry.
	FreeClean,
	/// Clear the reference and the map entry of an already-released cluster.
	Clean,
}

/// Position of a logical cluster index within the reference chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClusterPos {
	Direct(usize),
	Single(usize),
	Double(usize, usize),
}

fn decode_clust_ind(ci: u32) -> IoResult<ClusterPos> {
	let ci = ci as usize;
	if ci < N_DIRECT {
		Ok(ClusterPos::Direct(ci))
	} else if ci < N_DIRECT + RPC {
		Ok(ClusterPos::Single(ci - N_DIRECT))
	} else if ci < MAX_FILE_CLUSTERS as usize {
		let x = ci - N_DIRECT - RPC;
		Ok(ClusterPos::Double(x / RPC, x % RPC))
	} else {
		Err(err!(EINVAL))
	}
}

impl<B: Backend> Sofs<B> {
	fn chain_inode(&mut self, inr: InodeNum, allow_free: bool) -> IoResult<Inode> {
		let ino = self.inode_get(inr)?;
		if !allow_free {
			if ino.is_free() {
				iobail!(ErrorKind::InvalidData, "inode in use: {inr} is free");
			}
			kind_of(&ino, inr)?;
		}
		Ok(ino)
	}

	/// Resolve `ci` to its data cluster, plus the lowest logical index that
	/// shares the first absent ancestor (used by the bulk walker to skip
	/// whole subtrees).
	fn resolve_chain(&mut self, ino: &Inode, ci: u32) -> IoResult<(ClusterNum, u32)> {
		match decode_clust_ind(ci)? {
			ClusterPos::Direct(k) => Ok((ino.d[k], ci)),
			ClusterPos::Single(k) => {
				if ino.i1 == NULL_CLUSTER {
					return Ok((NULL_CLUSTER, N_DIRECT as u32));
				}
				Ok((self.refclust_get(RefSlot::Direct, ino.i1, k)?, ci))
			}
			ClusterPos::Double(hi, lo) => {
				if ino.i2 == NULL_CLUSTER {
					return Ok((NULL_CLUSTER, (N_DIRECT + RPC) as u32));
				}
				let sub = self.refclust_get(RefSlot::Single, ino.i2, hi)?;
				if sub == NULL_CLUSTER {
					return Ok((NULL_CLUSTER, (N_DIRECT + RPC + hi * RPC) as u32));
				}
				Ok((self.refclust_get(RefSlot::Direct, sub, lo)?, ci))
			}
		}
	}

	/// The unified per-slot operation over the file-cluster chains.
	///
	/// Returns the data cluster the slot resolves to (`NULL_CLUSTER` for an
	/// unallocated slot under `Get`).
	pub fn handle_file_cluster(
		&mut self,
		inr: InodeNum,
		ci: u32,
		op: ClusterOp,
	) -> IoResult<ClusterNum> {
		log::trace!("handle_file_cluster({inr}, {ci}, {op:?});");
		if op != ClusterOp::Get {
			self.assert_rw()?;
		}

		let allow_free = matches!(op, ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean);
		let ino = self.chain_inode(inr, allow_free)?;
		let (cur, _) = self.resolve_chain(&ino, ci)?;

		match op {
			ClusterOp::Get => Ok(cur),
			ClusterOp::Alloc => {
				if cur != NULL_CLUSTER {
					iobail!(
						ErrorKind::InvalidData,
						"cluster already in list: inode {inr}, index {ci}"
					);
				}
				self.chain_alloc(inr, ci)
			}
			ClusterOp::Free => {
				if cur == NULL_CLUSTER {
					iobail!(
						ErrorKind::InvalidData,
						"cluster not in list: inode {inr}, index {ci}"
					);
				}
				self.free_data_cluster(cur)?;
				Ok(cur)
			}
			ClusterOp::FreeClean | ClusterOp::Clean => {
				if cur == NULL_CLUSTER {
					iobail!(
						ErrorKind::InvalidData,
						"cluster not in list: inode {inr}, index {ci}"
					);
				}
				if op == ClusterOp::FreeClean {
					self.free_data_cluster(cur)?;
				}
				self.chain_clean(inr, ci, cur)
			}
		}
	}

	fn chain_alloc(&mut self, inr: InodeNum, ci: u32) -> IoResult<ClusterNum> {
		match decode_clust_ind(ci)? {
			ClusterPos::Direct(k) => {
				let c = self.alloc_data_cluster()?;
				self.cimap_set(c, inr)?;
				let mut ino = self.inode_get(inr)?;
				ino.d[k] = c;
				ino.clucount += 1;
				self.inode_put(inr, &ino)?;
				Ok(c)
			}
			ClusterPos::Single(k) => {
				let ino = self.inode_get(inr)?;
				let i1 = if ino.i1 == NULL_CLUSTER {
					let i1 = self.alloc_ref_cluster(inr, RefSlot::Direct)?;
					let mut ino = self.inode_get(inr)?;
					ino.i1 = i1;
					ino.clucount += 1;
					self.inode_put(inr, &ino)?;
					i1
				} else {
					ino.i1
				};

				let c = self.alloc_data_cluster()?;
				self.cimap_set(c, inr)?;
				self.refclust_set(RefSlot::Direct, i1, k, c)?;
				let mut ino = self.inode_get(inr)?;
				ino.clucount += 1;
				self.inode_put(inr, &ino)?;
				Ok(c)
			}
			ClusterPos::Double(hi, lo) => {
				let ino = self.inode_get(inr)?;
				let i2 = if ino.i2 == NULL_CLUSTER {
					let i2 = self.alloc_ref_cluster(inr, RefSlot::Single)?;
					let mut ino = self.inode_get(inr)?;
					ino.i2 = i2;
					ino.clucount += 1;
					self.inode_put(inr, &ino)?;
					i2
				} else {
					ino.i2
				};

				let sub = self.refclust_get(RefSlot::Single, i2, hi)?;
				let sub = if sub == NULL_CLUSTER {
					let sub = self.alloc_ref_cluster(inr, RefSlot::Direct)?;
					self.refclust_set(RefSlot::Single, i2, hi, sub)?;
					let mut ino = self.inode_get(inr)?;
					ino.clucount += 1;
					self.inode_put(inr, &ino)?;
					sub
				} else {
					sub
				};

				let c = self.alloc_data_cluster()?;
				self.cimap_set(c, inr)?;
				self.refclust_set(RefSlot::Direct, sub, lo, c)?;
				let mut ino = self.inode_get(inr)?;
				ino.clucount += 1;
				self.inode_put(inr, &ino)?;
				Ok(c)
			}
		}
	}

	/// Allocate and map a fresh all-null reference cluster.
	fn alloc_ref_cluster(&mut self, inr: InodeNum, which: RefSlot) -> IoResult<ClusterNum> {
		let c = self.alloc_data_cluster()?;
		self.refclust_init(which, c)?;
		self.cimap_set(c, inr)?;
		Ok(c)
	}

	/// Clear the reference at `ci` (which resolves to `cur`), unmap the
	/// cluster, and collapse intermediate reference clusters that became
	/// entirely null.
	fn chain_clean(&mut self, inr: InodeNum, ci: u32, cur: ClusterNum) -> IoResult<ClusterNum> {
		self.cimap_set(cur, NULL_INODE)?;
		let mut dec: u32 = 1;

		match decode_clust_ind(ci)? {
			ClusterPos::Direct(k) => {
				let mut ino = self.inode_get(inr)?;
				ino.d[k] = NULL_CLUSTER;
				sub_clucount(&mut ino, inr, dec)?;
				self.inode_put(inr, &ino)?;
			}
			ClusterPos::Single(k) => {
				let i1 = self.inode_get(inr)?.i1;
				self.refclust_set(RefSlot::Direct, i1, k, NULL_CLUSTER)?;
				let mut drop_i1 = false;
				if self.refclust_all_null(RefSlot::Direct, i1)? {
					self.free_data_cluster(i1)?;
					self.cimap_set(i1, NULL_INODE)?;
					drop_i1 = true;
					dec += 1;
				}
				let mut ino = self.inode_get(inr)?;
				if drop_i1 {
					ino.i1 = NULL_CLUSTER;
				}
				sub_clucount(&mut ino, inr, dec)?;
				self.inode_put(inr, &ino)?;
			}
			ClusterPos::Double(hi, lo) => {
				let i2 = self.inode_get(inr)?.i2;
				let sub = self.refclust_get(RefSlot::Single, i2, hi)?;
				self.refclust_set(RefSlot::Direct, sub, lo, NULL_CLUSTER)?;
				let mut drop_i2 = false;
				if self.refclust_all_null(RefSlot::Direct, sub)? {
					self.free_data_cluster(sub)?;
					self.cimap_set(sub, NULL_INODE)?;
					self.refclust_set(RefSlot::Single, i2, hi, NULL_CLUSTER)?;
					dec += 1;
					if self.refclust_all_null(RefSlot::Single, i2)? {
						self.free_data_cluster(i2)?;
						self.cimap_set(i2, NULL_INODE)?;
						drop_i2 = true;
						dec += 1;
					}
				}
				let mut ino = self.inode_get(inr)?;
				if drop_i2 {
					ino.i2 = NULL_CLUSTER;
				}
				sub_clucount(&mut ino, inr, dec)?;
				self.inode_put(inr, &ino)?;
			}
		}

		Ok(cur)
	}

	/// Apply `op` to every non-null slot with logical index >= `start`,
	/// highest first: double-indirect, then single-indirect, then direct.
	pub fn handle_file_clusters(&mut self, inr: InodeNum, start: u32, op: ClusterOp) -> IoResult<()> {
		log::trace!("handle_file_clusters({inr}, {start}, {op:?});");
		if !matches!(op, ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean) {
			return Err(err!(EINVAL));
		}
		self.assert_rw()?;

		let mut ci = MAX_FILE_CLUSTERS;
		while ci > start {
			ci -= 1;
			let ino = self.chain_inode(inr, true)?;
			let (cur, floor) = self.resolve_chain(&ino, ci)?;
			if cur != NULL_CLUSTER {
				self.handle_file_cluster(inr, ci, op)?;
			} else {
				// the whole subtree below the absent ancestor is empty
				ci = floor.max(start);
			}
		}
		Ok(())
	}

	/// Read the data cluster at logical index `ci`; an unallocated cluster
	/// reads as zeros.
	pub fn read_file_cluster(&mut self, inr: InodeNum, ci: u32, buf: &mut [u8]) -> IoResult<()> {
		log::trace!("read_file_cluster({inr}, {ci});");
		let c = self.handle_file_cluster(inr, ci, ClusterOp::Get)?;
		if c == NULL_CLUSTER {
			buf.fill(0u8);
			Ok(())
		} else {
			self.read_cluster(c, buf)
		}
	}

	/// Write the data cluster at logical index `ci`, allocating it first if
	/// absent.
	pub fn write_file_cluster(&mut self, inr: InodeNum, ci: u32, buf: &[u8]) -> IoResult<()> {
		log::trace!("write_file_cluster({inr}, {ci});");
		self.assert_rw()?;
		let c = match self.handle_file_cluster(inr, ci, ClusterOp::Get)? {
			NULL_CLUSTER => self.handle_file_cluster(inr, ci, ClusterOp::Alloc)?,
			c => c,
		};
		self.write_cluster(c, buf)
	}

	/// Dissociate a dirty cluster from its former owner: the allocator is
	/// about to reuse it. Only leaf data clusters ever reach the free pool
	/// while still mapped, so the search covers the leaf positions.
	pub(crate) fn clean_data_cluster(&mut self, cref: ClusterNum) -> IoResult<()> {
		log::trace!("clean_data_cluster({cref});");
		let owner = self.cimap_get(cref)?;
		if owner >= self.sb.itotal {
			iobail!(
				ErrorKind::InvalidData,
				"cluster-to-inode mapping: {cref} owned by bad inode {owner:#x}"
			);
		}
		let ino = self.inode_get(owner)?;

		for k in 0..N_DIRECT {
			if ino.d[k] == cref {
				let mut ino = self.inode_get(owner)?;
				ino.d[k] = NULL_CLUSTER;
				sub_clucount(&mut ino, owner, 1)?;
				self.inode_put(owner, &ino)?;
				self.cimap_set(cref, NULL_INODE)?;
				return Ok(());
			}
		}

		if ino.i1 != NULL_CLUSTER {
			for k in 0..RPC {
				if self.refclust_get(RefSlot::Direct, ino.i1, k)? == cref {
					self.refclust_set(RefSlot::Direct, ino.i1, k, NULL_CLUSTER)?;
					let mut ino = self.inode_get(owner)?;
					sub_clucount(&mut ino, owner, 1)?;
					self.inode_put(owner, &ino)?;
					self.cimap_set(cref, NULL_INODE)?;
					return Ok(());
				}
			}
		}

		if ino.i2 != NULL_CLUSTER {
			for hi in 0..RPC {
				let sub = self.refclust_get(RefSlot::Single, ino.i2, hi)?;
				if sub == NULL_CLUSTER {
					continue;
				}
				for lo in 0..RPC {
					if self.refclust_get(RefSlot::Direct, sub, lo)? == cref {
						self.refclust_set(RefSlot::Direct, sub, lo, NULL_CLUSTER)?;
						let mut ino = self.inode_get(owner)?;
						sub_clucount(&mut ino, owner, 1)?;
						self.inode_put(owner, &ino)?;
						self.cimap_set(cref, NULL_INODE)?;
						return Ok(());
					}
				}
			}
		}

		iobail!(
			ErrorKind::InvalidData,
			"cluster inode mismatch: {cref} not referenced by its owner {owner}"
		);
	}
}

fn sub_clucount(ino: &mut Inode, inr: InodeNum, dec: u32) -> IoResult<()> {
	if ino.clucount < dec {
		iobail!(
			ErrorKind::InvalidData,
			"inode reference list: {inr} cluster count underflow"
		);
	}
	ino.clucount -= dec;
	Ok(())
}
