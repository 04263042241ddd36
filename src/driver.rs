//! The driver interface: the operations a loaded file-system implementation
//! may provide, and the process-local registry the server loads them from.
//!
//! A driver is the moral equivalent of the original flat table of operation
//! pointers. Every method has a default implementation answering
//! [`FsError::UnsupportedOperation`], so a driver implements exactly the
//! slots it supports and declares the corresponding bits in its capability
//! set. The runtime never calls a method whose capability bit is clear.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capabilities::CapabilitySet;
use crate::capabilities::Dialect;
use crate::error::FsError;
use crate::error::FsResult;
use crate::types::AttrInfo;
use crate::types::DirEntry;
use crate::types::DriverCookie;
use crate::types::DriverVolume;
use crate::types::FsInfo;
use crate::types::IndexInfo;
use crate::types::NodeHandle;
use crate::types::NodeId;
use crate::types::NodeStat;
use crate::types::StatMask;
use crate::types::VolumeId;

/// A loaded file-system driver.
///
/// Methods correspond one-to-one to the operation enumeration. All take the
/// opaque [`DriverVolume`] token the driver returned from [`mount`]; node
/// and cookie tokens are equally opaque to the runtime.
///
/// [`mount`]: Driver::mount
#[allow(unused_variables)]
pub trait Driver: Send + Sync {
    /// The capability set this driver advertises. Seeded once at file
    /// system creation; the dialect tag must match [`Driver::dialect`].
    fn capabilities(&self) -> CapabilitySet;

    /// The operation-table dialect this driver was written against.
    fn dialect(&self) -> Dialect {
        Dialect::Current
    }

    /// Module initialization, run once after the driver is loaded.
    fn init(&self) -> FsResult<()> {
        Ok(())
    }

    /// Module teardown, run once before the server exits.
    fn uninit(&self) {}

    // volume operations

    /// Mounts the volume `id` backed by `device`.
    fn mount(
        &self,
        id: VolumeId,
        device: &str,
        flags: u32,
        parameters: &str,
    ) -> FsResult<(DriverVolume, NodeId)> {
        Err(FsError::UnsupportedOperation)
    }

    /// Unmounts a volume previously returned by [`Driver::mount`].
    fn unmount(&self, volume: DriverVolume) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Flushes all pending volume state.
    fn sync(&self, volume: DriverVolume) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads volume-wide information.
    fn read_fs_info(&self, volume: DriverVolume) -> FsResult<FsInfo> {
        Err(FsError::UnsupportedOperation)
    }

    /// Writes the masked fields of the volume information.
    fn write_fs_info(&self, volume: DriverVolume, info: &FsInfo, mask: u32) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    // vnode operations

    /// Resolves `name` within the directory `dir`.
    fn lookup(&self, volume: DriverVolume, dir: NodeHandle, name: &str) -> FsResult<NodeId> {
        Err(FsError::UnsupportedOperation)
    }

    /// Returns the name of `node` in its parent directory.
    fn get_vnode_name(&self, volume: DriverVolume, node: NodeHandle) -> FsResult<String> {
        Err(FsError::UnsupportedOperation)
    }

    /// Materializes the private node token for inode `id`.
    fn read_vnode(&self, volume: DriverVolume, id: NodeId, reenter: bool) -> FsResult<NodeHandle> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases a node token obtained from [`Driver::read_vnode`].
    fn write_vnode(&self, volume: DriverVolume, node: NodeHandle, reenter: bool) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Removes a node whose last reference went away.
    fn remove_vnode(&self, volume: DriverVolume, node: NodeHandle, reenter: bool) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    // VM file access

    /// Whether `node` may be memory mapped.
    fn can_page(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<bool> {
        Err(FsError::UnsupportedOperation)
    }

    /// Page-in read at `pos`.
    fn read_pages(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Page-out write at `pos`.
    fn write_pages(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    // common operations

    /// Device-specific control operation; `buffer` is read and rewritten in
    /// place.
    fn ioctl(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        command: u32,
        buffer: &mut [u8],
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Changes the open-mode flags of an open cookie.
    fn set_flags(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        flags: i32,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Registers interest in `event` on an open cookie. `sync` is the
    /// kernel's wait token, passed back verbatim in the notification.
    fn select(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        event: u8,
        sync: u64,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Withdraws interest registered by [`Driver::select`].
    fn deselect(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        event: u8,
        sync: u64,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Flushes one node to disk.
    fn fsync(&self, volume: DriverVolume, node: NodeHandle) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads the target of a symlink into `buffer`, returning the length.
    fn read_symlink(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Creates a symlink `name` in `dir` pointing at `target`.
    fn create_symlink(
        &self,
        volume: DriverVolume,
        dir: NodeHandle,
        name: &str,
        target: &str,
        mode: i32,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Creates a hard link `name` in `dir` to `node`.
    fn link(
        &self,
        volume: DriverVolume,
        dir: NodeHandle,
        name: &str,
        node: NodeHandle,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Removes the entry `name` from `dir`.
    fn unlink(&self, volume: DriverVolume, dir: NodeHandle, name: &str) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Renames `old_name` in `old_dir` to `new_name` in `new_dir`.
    fn rename(
        &self,
        volume: DriverVolume,
        old_dir: NodeHandle,
        old_name: &str,
        new_dir: NodeHandle,
        new_name: &str,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Checks access `mode` against `node`.
    fn access(&self, volume: DriverVolume, node: NodeHandle, mode: i32) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads the stat record of `node`.
    fn read_stat(&self, volume: DriverVolume, node: NodeHandle) -> FsResult<NodeStat> {
        Err(FsError::UnsupportedOperation)
    }

    /// Writes the masked stat fields of `node`.
    fn write_stat(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        stat: &NodeStat,
        mask: StatMask,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    // file operations

    /// Creates and opens the file `name` in `dir`.
    fn create(
        &self,
        volume: DriverVolume,
        dir: NodeHandle,
        name: &str,
        open_mode: i32,
        perms: u32,
    ) -> FsResult<(NodeId, DriverCookie)> {
        Err(FsError::UnsupportedOperation)
    }

    /// Opens `node`.
    fn open(&self, volume: DriverVolume, node: NodeHandle, open_mode: i32) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Closes an open cookie; the cookie stays allocated until
    /// [`Driver::free_cookie`].
    fn close(&self, volume: DriverVolume, node: NodeHandle, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases an open cookie.
    fn free_cookie(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads from an open file at `pos`, returning the bytes read.
    fn read(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Writes to an open file at `pos`, returning the bytes written.
    fn write(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    // directory operations

    /// Creates the directory `name` in `dir`.
    fn create_dir(
        &self,
        volume: DriverVolume,
        dir: NodeHandle,
        name: &str,
        perms: u32,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Removes the directory `name` from `dir`.
    fn remove_dir(&self, volume: DriverVolume, dir: NodeHandle, name: &str) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Opens `node` for directory iteration.
    fn open_dir(&self, volume: DriverVolume, node: NodeHandle) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Closes a directory cookie.
    fn close_dir(&self, volume: DriverVolume, node: NodeHandle, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases a directory cookie.
    fn free_dir_cookie(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads at most `count` entries from a directory cookie.
    fn read_dir(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        Err(FsError::UnsupportedOperation)
    }

    /// Resets a directory cookie to the first entry.
    fn rewind_dir(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    // attribute directory operations

    /// Opens the attribute directory of `node`.
    fn open_attr_dir(&self, volume: DriverVolume, node: NodeHandle) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Closes an attribute-directory cookie.
    fn close_attr_dir(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases an attribute-directory cookie.
    fn free_attr_dir_cookie(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads at most `count` entries from an attribute-directory cookie.
    fn read_attr_dir(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        Err(FsError::UnsupportedOperation)
    }

    /// Resets an attribute-directory cookie.
    fn rewind_attr_dir(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    // attribute operations, current dialect

    /// Creates and opens the attribute `name` on `node`.
    fn create_attr(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        name: &str,
        type_code: u32,
        open_mode: i32,
    ) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Opens the attribute `name` on `node`.
    fn open_attr(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        name: &str,
        open_mode: i32,
    ) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Closes an attribute cookie.
    fn close_attr(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases an attribute cookie.
    fn free_attr_cookie(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads attribute data through an open cookie.
    fn read_attr(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Writes attribute data through an open cookie.
    fn write_attr(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads the stat record of an open attribute.
    fn read_attr_stat(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<NodeStat> {
        Err(FsError::UnsupportedOperation)
    }

    /// Writes the masked stat fields of an open attribute.
    fn write_attr_stat(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        stat: &NodeStat,
        mask: StatMask,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Renames an attribute, possibly across nodes.
    fn rename_attr(
        &self,
        volume: DriverVolume,
        old_node: NodeHandle,
        old_name: &str,
        new_node: NodeHandle,
        new_name: &str,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Removes the attribute `name` from `node`.
    fn remove_attr(&self, volume: DriverVolume, node: NodeHandle, name: &str) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    // attribute operations, legacy dialect
    //
    // Legacy drivers address attributes by name on every call; the runtime
    // fabricates open/close on top of these.

    /// Name-keyed attribute read, legacy dialect.
    fn read_attr_named(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        name: &str,
        type_code: u32,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Name-keyed attribute write, legacy dialect.
    fn write_attr_named(
        &self,
        volume: DriverVolume,
        node: NodeHandle,
        name: &str,
        type_code: u32,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        Err(FsError::UnsupportedOperation)
    }

    /// Name-keyed attribute stat, legacy dialect.
    fn stat_attr(&self, volume: DriverVolume, node: NodeHandle, name: &str) -> FsResult<AttrInfo> {
        Err(FsError::UnsupportedOperation)
    }

    // index directory & index operations

    /// Opens the volume's index directory.
    fn open_index_dir(&self, volume: DriverVolume) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Closes an index-directory cookie.
    fn close_index_dir(&self, volume: DriverVolume, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases an index-directory cookie.
    fn free_index_dir_cookie(&self, volume: DriverVolume, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads at most `count` entries from the index directory.
    fn read_index_dir(
        &self,
        volume: DriverVolume,
        cookie: DriverCookie,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        Err(FsError::UnsupportedOperation)
    }

    /// Resets an index-directory cookie.
    fn rewind_index_dir(&self, volume: DriverVolume, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Creates the index `name`.
    fn create_index(
        &self,
        volume: DriverVolume,
        name: &str,
        type_code: u32,
        flags: u32,
    ) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Removes the index `name`.
    fn remove_index(&self, volume: DriverVolume, name: &str) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads the stat record of the index `name`.
    fn read_index_stat(&self, volume: DriverVolume, name: &str) -> FsResult<IndexInfo> {
        Err(FsError::UnsupportedOperation)
    }

    // query operations

    /// Opens a query. Live-query updates go to `port`/`token`.
    fn open_query(
        &self,
        volume: DriverVolume,
        query: &str,
        flags: u32,
        port: u32,
        token: u32,
    ) -> FsResult<DriverCookie> {
        Err(FsError::UnsupportedOperation)
    }

    /// Closes a query cookie.
    fn close_query(&self, volume: DriverVolume, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Releases a query cookie.
    fn free_query_cookie(&self, volume: DriverVolume, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }

    /// Reads at most `count` entries matching the query.
    fn read_query(
        &self,
        volume: DriverVolume,
        cookie: DriverCookie,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        Err(FsError::UnsupportedOperation)
    }

    /// Resets a query cookie.
    fn rewind_query(&self, volume: DriverVolume, cookie: DriverCookie) -> FsResult<()> {
        Err(FsError::UnsupportedOperation)
    }
}

/// Process-local driver registry.
///
/// Stands in for the add-on image loading of the original system: the
/// server binary registers the drivers it carries, and [`Server::init`]
/// looks the requested one up by name.
///
/// [`Server::init`]: crate::server::Server::init
#[derive(Default)]
pub struct Registry {
    drivers: Mutex<HashMap<String, Arc<dyn Driver>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static Registry {
        static GLOBAL: std::sync::OnceLock<Registry> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Registers `driver` under `name`, replacing any previous entry.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) {
        self.drivers.lock().insert(name.to_string(), driver);
    }

    /// Looks up a driver by name.
    pub fn load(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.lock().get(name).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.drivers.lock().keys().cloned().collect();
        f.debug_struct("Registry").field("drivers", &names).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullDriver;

    impl Driver for NullDriver {
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new(Dialect::Current)
        }
    }

    #[test]
    fn defaults_are_unsupported() {
        let driver = NullDriver;
        let volume = DriverVolume(0);
        assert_eq!(
            driver.lookup(volume, NodeHandle(1), "x"),
            Err(FsError::UnsupportedOperation)
        );
        assert_eq!(driver.sync(volume), Err(FsError::UnsupportedOperation));
        assert_eq!(
            driver.read(volume, NodeHandle(1), DriverCookie(1), 0, &mut []),
            Err(FsError::UnsupportedOperation)
        );
    }

    #[test]
    fn registry_lookup() {
        let registry = Registry::new();
        assert!(registry.load("nullfs").is_none());
        registry.register("nullfs", Arc::new(NullDriver));
        assert!(registry.load("nullfs").is_some());
    }
}
