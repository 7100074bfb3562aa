mod blockreader;
mod cache;
mod codec;
mod data;
mod inode;
mod sofs;

pub use crate::{
	blockreader::{Backend, BlockReader},
	data::{
		cluster_of_byte, ClusterNum, DirEntry, DirEntryState, DzoneCache, Inode, InodeAttr,
		InodeNum, InodeType, InodeVar, Superblock, BLOCKS_PER_CLUSTER, BLOCK_SIZE, BSLPC,
		CLUSTER_SIZE, DIRENT_SIZE, DPC, DZONE_CACHE_SIZE, INODE_DIR, INODE_FILE, INODE_FREE,
		INODE_PERM_MASK, INODE_SYMLINK, INODE_TYPE_MASK, IPB, MAX_FILE_CLUSTERS, MAX_FILE_SIZE,
		MAX_NAME, MAX_PATH, MAX_VOLNAME, MSTAT_NPRU, MSTAT_PRU, NULL_CLUSTER, NULL_INODE,
		N_DIRECT, RPB, RPC, SOFS_MAGIC, SOFS_VERSION,
	},
	sofs::{
		format::{format, format_backend, FormatOpts},
		AddAttach, ClusterOp, Cred, DirSearch, Info, RemDetach, Sofs, ACCESS_EXEC, ACCESS_READ,
		ACCESS_WRITE,
	},
};
