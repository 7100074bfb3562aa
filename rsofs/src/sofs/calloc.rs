use super::*;
use crate::{err, iobail};

impl<B: Backend> Sofs<B> {
	/// Producer drain: move every occupied insert-cache slot back into the
	/// bitmap.
	fn deplete(&mut self) -> IoResult<()> {
		log::trace!("deplete();");
		let n = self.sb.dzone_insert.idx as usize;
		for k in 0..n {
			let cref = self.sb.dzone_insert.cache[k];
			if cref == NULL_CLUSTER || cref >= self.sb.dzone_total {
				iobail!(
					ErrorKind::InvalidData,
					"free-cluster caches: insert slot {k} holds {cref:#x}"
				);
			}
			self.bitmap_set(cref, true)?;
		}
		self.update_sb(|sb| {
			for slot in &mut sb.dzone_insert.cache[0..n] {
				*slot = NULL_CLUSTER;
			}
			sb.dzone_insert.idx = 0;
		})
	}

	/// Consumer refill: scan the bitmap circularly from `fctable_pos` and
	/// capture up to `min(dzone_free, DZONE_CACHE_SIZE)` references into the
	/// retrieval cache. When the bitmap runs dry but `dzone_free` promises
	/// more, the insert cache is depleted and the scan resumes; callers only
	/// see the final state.
	fn replenish(&mut self) -> IoResult<()> {
		log::trace!("replenish();");
		let want = self.sb.dzone_free.min(DZONE_CACHE_SIZE as u32) as usize;
		let total = self.sb.dzone_total;
		let mut captured = Vec::with_capacity(want);
		let mut pos = self.sb.fctable_pos;
		let mut depleted = false;

		loop {
			let mut scanned = 0u32;
			while captured.len() < want && scanned < total {
				if self.bitmap_get(pos)? {
					self.bitmap_set(pos, false)?;
					captured.push(pos);
				}
				pos = (pos + 1) % total;
				scanned += 1;
			}
			if captured.len() < want && !depleted && self.sb.dzone_insert.idx > 0 {
				self.deplete()?;
				depleted = true;
				continue;
			}
			break;
		}

		let n = captured.len();
		self.update_sb(|sb| {
			let base = DZONE_CACHE_SIZE - n;
			for (k, cref) in captured.iter().enumerate() {
				sb.dzone_retriev.cache[base + k] = *cref;
			}
			sb.dzone_retriev.idx = base as u32;
			sb.fctable_pos = pos;
		})
	}

	/// Hand out one free data cluster. A dirty cluster (still mapped to the
	/// inode that used to own it) is cleaned on the way out.
	pub fn alloc_data_cluster(&mut self) -> IoResult<ClusterNum> {
		log::trace!("alloc_data_cluster();");
		self.assert_rw()?;

		if self.sb.dzone_free == 0 {
			return Err(err!(ENOSPC));
		}
		if self.sb.dzone_retriev.idx == DZONE_CACHE_SIZE as u32 {
			self.replenish()?;
		}

		let idx = self.sb.dzone_retriev.idx as usize;
		if idx == DZONE_CACHE_SIZE {
			iobail!(
				ErrorKind::InvalidData,
				"free-cluster total: {} free but none retrievable",
				self.sb.dzone_free
			);
		}
		let cref = self.sb.dzone_retriev.cache[idx];
		if cref == 0 || cref == NULL_CLUSTER || cref >= self.sb.dzone_total {
			iobail!(
				ErrorKind::InvalidData,
				"free-cluster caches: retrieval slot {idx} holds {cref:#x}"
			);
		}

		if self.cimap_get(cref)? != NULL_INODE {
			self.clean_data_cluster(cref)?;
		}
		self.evict_cluster(cref);

		self.update_sb(|sb| {
			sb.dzone_retriev.cache[idx] = NULL_CLUSTER;
			sb.dzone_retriev.idx += 1;
			sb.dzone_free -= 1;
		})?;

		log::trace!("alloc_data_cluster(): {cref}");
		Ok(cref)
	}

	/// Return a data cluster to the free pool through the insert cache. The
	/// cluster-to-inode map entry is left alone: until a later clean the
	/// cluster stays recoverable.
	pub fn free_data_cluster(&mut self, cref: ClusterNum) -> IoResult<()> {
		log::trace!("free_data_cluster({cref});");
		self.assert_rw()?;

		if cref == 0 || cref >= self.sb.dzone_total {
			return Err(err!(EINVAL));
		}

		if self.sb.dzone_insert.contains(cref) || self.sb.dzone_retriev.contains(cref) {
			iobail!(
				ErrorKind::InvalidData,
				"cluster not allocated: {cref} is already cached free"
			);
		}
		if self.bitmap_get(cref)? {
			iobail!(ErrorKind::InvalidData, "cluster not allocated: {cref} is free");
		}

		if self.sb.dzone_insert.idx == DZONE_CACHE_SIZE as u32 {
			self.deplete()?;
		}

		self.evict_cluster(cref);
		self.update_sb(|sb| {
			let idx = sb.dzone_insert.idx as usize;
			sb.dzone_insert.cache[idx] = cref;
			sb.dzone_insert.idx += 1;
			sb.dzone_free += 1;
		})
	}

	/// Drain both caches back into the bitmap (clean-unmount state).
	pub(crate) fn flush_caches(&mut self) -> IoResult<()> {
		log::trace!("flush_caches();");
		self.deplete()?;

		let idx = self.sb.dzone_retriev.idx as usize;
		for k in idx..DZONE_CACHE_SIZE {
			let cref = self.sb.dzone_retriev.cache[k];
			if cref == NULL_CLUSTER || cref >= self.sb.dzone_total {
				iobail!(
					ErrorKind::InvalidData,
					"free-cluster caches: retrieval slot {k} holds {cref:#x}"
				);
			}
			self.bitmap_set(cref, true)?;
		}
		self.update_sb(|sb| {
			for slot in &mut sb.dzone_retriev.cache {
				*slot = NULL_CLUSTER;
			}
			sb.dzone_retriev.idx = DZONE_CACHE_SIZE as u32;
		})
	}
}
