use std::{
	ffi::{c_int, OsStr},
	io::Result as IoResult,
	path::Path,
	time::{Duration, SystemTime},
};

use fuser::{Filesystem, KernelConfig, ReplyAttr, ReplyEntry, Request, TimeOrNow};
use rsofs::{AddAttach, InodeType, RemDetach, MAX_NAME};

use crate::fs::{attr_to_fuse, fuse_ino, kind_to_fuse, transino, Fs};

const TTL: Duration = Duration::from_secs(1);

fn run<T>(f: impl FnOnce() -> IoResult<T>) -> Result<T, c_int> {
	f().map_err(|e| {
		log::error!("Error: {e}");
		e.raw_os_error().unwrap_or(libc::EIO)
	})
}

impl Fs {
	fn cred_from(&mut self, req: &Request<'_>) {
		self.sofs.set_cred(req.uid(), req.gid());
	}

	fn reply_entry(&mut self, inr: u32, reply: ReplyEntry) {
		match run(|| self.sofs.inode_attr(inr)) {
			Ok(attr) => reply.entry(&TTL, &attr_to_fuse(&attr), 0),
			Err(e) => reply.error(e),
		}
	}
}

impl Filesystem for Fs {
	fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
		Ok(())
	}

	fn destroy(&mut self) {
		if let Err(e) = self.sofs.close() {
			log::error!("close: {e}");
		}
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
		let f = || {
			let inr = transino(ino)?;
			self.sofs.inode_attr(inr)
		};
		match run(f) {
			Ok(attr) => reply.attr(&TTL, &attr_to_fuse(&attr)),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn setattr(
		&mut self,
		req: &Request<'_>,
		ino: u64,
		mode: Option<u32>,
		uid: Option<u32>,
		gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		_ctime: Option<SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		self.cred_from(req);
		let f = || {
			let inr = transino(ino)?;
			if let Some(size) = size {
				self.sofs.truncate(inr, size)?;
			}
			let attr = self.sofs.inode_modify(inr, |mut attr| {
				if let Some(mode) = mode {
					attr.perm = mode as u16;
				}
				if let Some(uid) = uid {
					attr.owner = uid;
				}
				if let Some(gid) = gid {
					attr.group = gid;
				}
				let when = |t| match t {
					TimeOrNow::SpecificTime(t) => t,
					TimeOrNow::Now => SystemTime::now(),
				};
				if let Some(t) = atime {
					attr.atime = when(t);
				}
				if let Some(t) = mtime {
					attr.mtime = when(t);
				}
				attr
			})?;
			Ok(attr)
		};
		match run(f) {
			Ok(attr) => reply.attr(&TTL, &attr_to_fuse(&attr)),
			Err(e) => reply.error(e),
		}
	}

	fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		self.cred_from(req);
		let inr = match run(|| {
			let pinr = transino(parent)?;
			self.sofs.dir_lookup(pinr, name)
		}) {
			Ok(inr) => inr,
			Err(e) => return reply.error(e),
		};
		self.reply_entry(inr, reply);
	}

	fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
		reply.opened(0, 0);
	}

	fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
		reply.opened(0, 0);
	}

	fn readdir(
		&mut self,
		req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		mut reply: fuser::ReplyDirectory,
	) {
		self.cred_from(req);
		let f = || {
			let inr = transino(ino)?;
			let mut i = 0i64;
			self.sofs.dir_iter(inr, |name, einr, kind| {
				i += 1;
				if i <= offset {
					return None;
				}
				if reply.add(fuse_ino(einr), i, kind_to_fuse(kind), name) {
					return Some(());
				}
				None
			})?;
			Ok(())
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn read(
		&mut self,
		req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: fuser::ReplyData,
	) {
		self.cred_from(req);
		let f = || {
			let inr = transino(ino)?;
			let mut buffer = vec![0u8; size as usize];
			let n = self.sofs.read(inr, offset as u64, &mut buffer)?;
			buffer.truncate(n);
			Ok(buffer)
		};
		match run(f) {
			Ok(buf) => reply.data(&buf),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn write(
		&mut self,
		req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: fuser::ReplyWrite,
	) {
		self.cred_from(req);
		let f = || {
			let inr = transino(ino)?;
			self.sofs.write(inr, offset as u64, data)
		};
		match run(f) {
			Ok(n) => reply.written(n as u32),
			Err(e) => reply.error(e),
		}
	}

	fn create(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_flags: i32,
		reply: fuser::ReplyCreate,
	) {
		self.cred_from(req);
		let f = || {
			let pinr = transino(parent)?;
			let inr = self
				.sofs
				.create(pinr, name, InodeType::RegularFile, mode as u16)?;
			self.sofs.inode_attr(inr)
		};
		match run(f) {
			Ok(attr) => reply.created(&TTL, &attr_to_fuse(&attr), 0, 0, 0),
			Err(e) => reply.error(e),
		}
	}

	fn mknod(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_rdev: u32,
		reply: ReplyEntry,
	) {
		self.cred_from(req);
		if mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
			return reply.error(libc::ENOSYS);
		}
		let inr = match run(|| {
			let pinr = transino(parent)?;
			self.sofs
				.create(pinr, name, InodeType::RegularFile, mode as u16)
		}) {
			Ok(inr) => inr,
			Err(e) => return reply.error(e),
		};
		self.reply_entry(inr, reply);
	}

	fn mkdir(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		reply: ReplyEntry,
	) {
		self.cred_from(req);
		let inr = match run(|| {
			let pinr = transino(parent)?;
			self.sofs
				.create(pinr, name, InodeType::Directory, mode as u16)
		}) {
			Ok(inr) => inr,
			Err(e) => return reply.error(e),
		};
		self.reply_entry(inr, reply);
	}

	fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
		self.cred_from(req);
		let f = || {
			let pinr = transino(parent)?;
			self.sofs.remove(pinr, name)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
		self.cred_from(req);
		let f = || {
			let pinr = transino(parent)?;
			self.sofs.remove(pinr, name)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn symlink(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		link_name: &OsStr,
		target: &Path,
		reply: ReplyEntry,
	) {
		self.cred_from(req);
		let inr = match run(|| {
			let pinr = transino(parent)?;
			self.sofs.symlink_create(pinr, link_name, target.as_os_str())
		}) {
			Ok(inr) => inr,
			Err(e) => return reply.error(e),
		};
		self.reply_entry(inr, reply);
	}

	fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: fuser::ReplyData) {
		self.cred_from(req);
		let f = || {
			let inr = transino(ino)?;
			self.sofs.symlink_read(inr)
		};
		match run(f) {
			Ok(target) => reply.data(target.as_encoded_bytes()),
			Err(e) => reply.error(e),
		}
	}

	fn link(
		&mut self,
		req: &Request<'_>,
		ino: u64,
		newparent: u64,
		newname: &OsStr,
		reply: ReplyEntry,
	) {
		self.cred_from(req);
		let inr = match run(|| {
			let inr = transino(ino)?;
			let pinr = transino(newparent)?;
			self.sofs.add_dir_entry(pinr, newname, inr, AddAttach::Add)?;
			Ok(inr)
		}) {
			Ok(inr) => inr,
			Err(e) => return reply.error(e),
		};
		self.reply_entry(inr, reply);
	}

	#[allow(clippy::too_many_arguments)]
	fn rename(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		newparent: u64,
		newname: &OsStr,
		_flags: u32,
		reply: fuser::ReplyEmpty,
	) {
		self.cred_from(req);
		let f = || {
			let pinr = transino(parent)?;
			let npinr = transino(newparent)?;

			// rename replaces an existing destination
			if self.sofs.dir_lookup(npinr, newname).is_ok() {
				self.sofs.remove(npinr, newname)?;
			}

			if pinr == npinr {
				return self.sofs.rename_dir_entry(pinr, name, newname);
			}

			let inr = self.sofs.dir_lookup(pinr, name)?;
			let attr = self.sofs.inode_attr(inr)?;
			if attr.kind == InodeType::Directory {
				self.sofs.rem_dir_entry(pinr, name, RemDetach::Detach)?;
				self.sofs
					.add_dir_entry(npinr, newname, inr, AddAttach::Attach)?;
			} else {
				self.sofs.add_dir_entry(npinr, newname, inr, AddAttach::Add)?;
				self.sofs.rem_dir_entry(pinr, name, RemDetach::Detach)?;
			}
			Ok(())
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
		let info = self.sofs.info();
		reply.statfs(
			info.clusters,
			info.cfree,
			info.cfree,
			info.files,
			info.ffree,
			info.csize,
			MAX_NAME as u32,
			info.csize,
		)
	}

	fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
		self.cred_from(req);
		let f = || {
			let inr = transino(ino)?;
			if mask == 0 {
				// F_OK: existence only
				self.sofs.inode_attr(inr)?;
				return Ok(());
			}
			self.sofs.access_granted(inr, mask as u32)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}
}
