use std::io::{Error, ErrorKind, Result as IoResult};

/// One singleton slot of the object cache layer.
///
/// A slot holds at most one loaded block or cluster of its table, identified
/// by a logical number. A failed load or store poisons the slot: every later
/// use returns the retained error until a fresh open rebuilds the cache.
#[derive(Debug)]
pub(crate) enum Slot<T> {
	Empty,
	Loaded { id: u32, data: T },
	Poisoned(i32),
}

impl<T> Slot<T> {
	pub fn new() -> Self {
		Self::Empty
	}

	/// The sticky-error gate. Every slot operation goes through here first.
	pub fn check(&self) -> IoResult<()> {
		match self {
			Self::Poisoned(errno) => Err(Error::from_raw_os_error(*errno)),
			_ => Ok(()),
		}
	}

	pub fn is_loaded(&self, id: u32) -> bool {
		matches!(self, Self::Loaded { id: cur, .. } if *cur == id)
	}

	pub fn loaded_id(&self) -> Option<u32> {
		match self {
			Self::Loaded { id, .. } => Some(*id),
			_ => None,
		}
	}

	pub fn fill(&mut self, id: u32, data: T) {
		*self = Self::Loaded {
			id,
			data,
		};
	}

	pub fn poison(&mut self, e: &Error) {
		*self = Self::Poisoned(e.raw_os_error().unwrap_or(libc::EIO));
	}

	pub fn data(&self) -> IoResult<&T> {
		match self {
			Self::Loaded { data, .. } => Ok(data),
			Self::Poisoned(errno) => Err(Error::from_raw_os_error(*errno)),
			Self::Empty => Err(Error::new(
				ErrorKind::InvalidData,
				"object cache: slot not loaded",
			)),
		}
	}

	pub fn data_mut(&mut self) -> IoResult<&mut T> {
		match self {
			Self::Loaded { data, .. } => Ok(data),
			Self::Poisoned(errno) => Err(Error::from_raw_os_error(*errno)),
			Self::Empty => Err(Error::new(
				ErrorKind::InvalidData,
				"object cache: slot not loaded",
			)),
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn store_without_load_fails_fast() {
		let slot: Slot<u32> = Slot::new();
		let e = slot.data().unwrap_err();
		assert_eq!(e.kind(), ErrorKind::InvalidData);
	}

	#[test]
	fn load_is_idempotent() {
		let mut slot = Slot::new();
		slot.fill(3, 0xabu8);
		assert!(slot.is_loaded(3));
		assert!(!slot.is_loaded(4));
		assert_eq!(*slot.data().unwrap(), 0xab);
	}

	#[test]
	fn poisoned_slot_is_sticky() {
		let mut slot = Slot::new();
		slot.fill(1, ());
		slot.poison(&Error::from_raw_os_error(libc::EIO));
		for _ in 0..2 {
			let e = slot.check().unwrap_err();
			assert_eq!(e.raw_os_error(), Some(libc::EIO));
		}
		let e = slot.data().unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EIO));
	}
}
