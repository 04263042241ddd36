//! Identifier newtypes and argument records shared by the driver interface,
//! the volume layer and the wire.

use bitflags::bitflags;

/// Numeric id of a mounted volume, assigned by the kernel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VolumeId(pub u64);

/// Inode number within one volume.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u64);

/// Opaque per-node token handed out by the driver's `read_vnode`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeHandle(pub u64);

/// Opaque volume token returned by the driver's `mount`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DriverVolume(pub u64);

/// Opaque open-object token returned by a driver open/create operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DriverCookie(pub u64);

/// Wire handle for a cookie tracked in a volume's cookie table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CookieId(pub u32);

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of a node, derived from its stat mode bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Regular file (`S_IFREG`)
    File,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
}

impl NodeKind {
    /// Extracts the kind from stat mode bits. Unknown format bits answer
    /// `File`, matching what the kernel assumes for unclassified nodes.
    pub fn from_mode(mode: u32) -> NodeKind {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => NodeKind::Directory,
            libc::S_IFLNK => NodeKind::Symlink,
            libc::S_IFIFO => NodeKind::NamedPipe,
            libc::S_IFSOCK => NodeKind::Socket,
            libc::S_IFCHR => NodeKind::CharDevice,
            libc::S_IFBLK => NodeKind::BlockDevice,
            _ => NodeKind::File,
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn to_mode(self) -> u32 {
        match self {
            NodeKind::File => libc::S_IFREG,
            NodeKind::Directory => libc::S_IFDIR,
            NodeKind::Symlink => libc::S_IFLNK,
            NodeKind::NamedPipe => libc::S_IFIFO,
            NodeKind::Socket => libc::S_IFSOCK,
            NodeKind::CharDevice => libc::S_IFCHR,
            NodeKind::BlockDevice => libc::S_IFBLK,
        }
    }
}

/// Stat record for a node or attribute.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeStat {
    /// Volume id the node lives on.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Mode bits, including the `S_IFMT` format.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size in bytes.
    pub size: i64,
    /// Preferred I/O size.
    pub blksize: u32,
    /// Attribute type code; zero for ordinary nodes.
    pub type_code: u32,
    /// Access time, seconds.
    pub atime: i64,
    /// Modification time, seconds.
    pub mtime: i64,
    /// Change time, seconds.
    pub ctime: i64,
    /// Creation time, seconds.
    pub crtime: i64,
}

bitflags! {
    /// Which stat fields a `write_stat` should apply.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct StatMask: u32 {
        /// `mode`
        const MODE = 1 << 0;
        /// `uid`
        const UID = 1 << 1;
        /// `gid`
        const GID = 1 << 2;
        /// `size`
        const SIZE = 1 << 3;
        /// `atime`
        const ATIME = 1 << 4;
        /// `mtime`
        const MTIME = 1 << 5;
        /// `crtime`
        const CRTIME = 1 << 6;
    }
}

/// Volume-wide information, read and written by the fs-info operations.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FsInfo {
    /// Volume id.
    pub dev: u64,
    /// Root inode number.
    pub root: u64,
    /// Volume flags.
    pub flags: u32,
    /// Block size in bytes.
    pub block_size: i64,
    /// Preferred I/O size in bytes.
    pub io_size: i64,
    /// Total number of blocks.
    pub total_blocks: i64,
    /// Free blocks.
    pub free_blocks: i64,
    /// Total number of nodes.
    pub total_nodes: i64,
    /// Free nodes.
    pub free_nodes: i64,
    /// Name of the underlying device.
    pub device_name: String,
    /// Volume name.
    pub volume_name: String,
    /// Name of the file system implementation.
    pub fs_name: String,
}

/// One directory entry as produced by the read-dir family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Volume id of the entry.
    pub dev: u64,
    /// Inode number of the entry.
    pub ino: u64,
    /// Entry name.
    pub name: String,
}

/// Stat information for one attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AttrInfo {
    /// Attribute type code.
    pub type_code: u32,
    /// Attribute size in bytes.
    pub size: i64,
}

/// Stat information for one index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexInfo {
    /// Index type code.
    pub type_code: u32,
    /// Index size in bytes.
    pub size: i64,
    /// Last modification time, seconds.
    pub modification_time: i64,
    /// Creation time, seconds.
    pub creation_time: i64,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
}

/// Maps an `O_*` open mode to the `R_OK`/`W_OK` access bits it implies.
pub fn open_mode_to_access(open_mode: i32) -> i32 {
    match open_mode & libc::O_ACCMODE {
        libc::O_RDONLY => libc::R_OK,
        libc::O_WRONLY => libc::W_OK,
        _ => libc::R_OK | libc::W_OK,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_kind_mode_round_trip() {
        for kind in [
            NodeKind::File,
            NodeKind::Directory,
            NodeKind::Symlink,
            NodeKind::NamedPipe,
            NodeKind::Socket,
            NodeKind::CharDevice,
            NodeKind::BlockDevice,
        ] {
            assert_eq!(NodeKind::from_mode(kind.to_mode() | 0o644), kind);
        }
    }

    #[test]
    fn open_mode_access() {
        assert_eq!(open_mode_to_access(libc::O_RDONLY), libc::R_OK);
        assert_eq!(open_mode_to_access(libc::O_WRONLY | libc::O_CREAT), libc::W_OK);
        assert_eq!(open_mode_to_access(libc::O_RDWR), libc::R_OK | libc::W_OK);
    }
}
