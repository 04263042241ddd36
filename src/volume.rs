//! One mounted instance of a driver.
//!
//! Every method follows the same shape: check the capability bit, translate
//! the runtime-neutral arguments into the driver's calling convention,
//! invoke the driver with the volume's opaque cookie, translate the result
//! back. Cookies handed out by driver open/create operations live in a
//! per-volume arena and cross the wire as small integers, so a forged
//! handle is a lookup failure instead of a wild pointer.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::capabilities::Dialect;
use crate::capabilities::FsOperation;
use crate::error::FsError;
use crate::error::FsResult;
use crate::file_system::AttrCreatePolicy;
use crate::file_system::FileSystem;
use crate::types::open_mode_to_access;
use crate::types::AttrInfo;
use crate::types::CookieId;
use crate::types::DirEntry;
use crate::types::DriverCookie;
use crate::types::DriverVolume;
use crate::types::FsInfo;
use crate::types::IndexInfo;
use crate::types::NodeHandle;
use crate::types::NodeId;
use crate::types::NodeKind;
use crate::types::NodeStat;
use crate::types::StatMask;
use crate::types::VolumeId;

// Attribute cookie fabricated for legacy drivers, which have no attribute
// open/close of their own.
#[derive(Debug)]
struct EmulatedAttr {
    name: String,
    type_code: u32,
    open_mode: i32,
    exists: bool,
    create: bool,
}

#[derive(Debug)]
enum AttrCookie {
    Driver(DriverCookie),
    Emulated(EmulatedAttr),
}

#[derive(Debug)]
enum Cookie {
    File(DriverCookie),
    Dir(DriverCookie),
    AttrDir(DriverCookie),
    Attr(AttrCookie),
    IndexDir(DriverCookie),
    Query(DriverCookie),
}

struct CookieEntry {
    cookie: Cookie,
    node: Option<NodeHandle>,
}

#[derive(Default)]
struct CookieTable {
    entries: Vec<Option<CookieEntry>>,
    free: Vec<usize>,
    order: Vec<CookieId>,
}

impl CookieTable {
    fn insert(&mut self, cookie: Cookie, node: Option<NodeHandle>) -> CookieId {
        let entry = CookieEntry { cookie, node };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        let id = CookieId(index as u32 + 1);
        self.order.push(id);
        id
    }

    fn get(&self, id: CookieId) -> Option<&CookieEntry> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.entries.get(index)?.as_ref()
    }

    fn get_mut(&mut self, id: CookieId) -> Option<&mut CookieEntry> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.entries.get_mut(index)?.as_mut()
    }

    fn remove(&mut self, id: CookieId) -> Option<CookieEntry> {
        let index = (id.0 as usize).checked_sub(1)?;
        let entry = self.entries.get_mut(index)?.take()?;
        self.free.push(index);
        self.order.retain(|other| *other != id);
        Some(entry)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct MountState {
    driver_volume: Option<DriverVolume>,
    mounted: bool,
}

/// One mounted volume.
pub struct Volume {
    file_system: Arc<FileSystem>,
    id: VolumeId,
    capabilities: crate::capabilities::CapabilitySet,
    state: Mutex<MountState>,
    cookies: Mutex<CookieTable>,
}

impl Volume {
    pub(crate) fn new(file_system: Arc<FileSystem>, id: VolumeId) -> Arc<Volume> {
        let capabilities = *file_system.capabilities();
        Arc::new(Volume {
            file_system,
            id,
            capabilities,
            state: Mutex::new(MountState {
                driver_volume: None,
                mounted: false,
            }),
            cookies: Mutex::new(CookieTable::default()),
        })
    }

    /// The kernel-assigned volume id.
    pub fn id(&self) -> VolumeId {
        self.id
    }

    /// The owning file system.
    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.file_system
    }

    /// This volume's capability set.
    pub fn capabilities(&self) -> &crate::capabilities::CapabilitySet {
        &self.capabilities
    }

    /// Whether the volume is currently mounted.
    pub fn mounted(&self) -> bool {
        self.state.lock().mounted
    }

    /// Number of live cookies in the volume's table.
    pub fn cookie_count(&self) -> usize {
        self.cookies.lock().len()
    }

    fn check(&self, op: FsOperation) -> FsResult<()> {
        if self.capabilities.get(op) {
            Ok(())
        } else {
            Err(FsError::UnsupportedOperation)
        }
    }

    fn driver(&self) -> &Arc<dyn crate::driver::Driver> {
        self.file_system.driver()
    }

    fn driver_volume(&self) -> FsResult<DriverVolume> {
        self.state.lock().driver_volume.ok_or(FsError::BadRequest)
    }

    fn dialect(&self) -> Dialect {
        self.capabilities.dialect()
    }

    // Close and free answer success when the driver has no hook of its own.
    fn soft(result: FsResult<()>) -> FsResult<()> {
        match result {
            Err(FsError::UnsupportedOperation) => Ok(()),
            other => other,
        }
    }

    fn file_cookie(&self, id: CookieId) -> FsResult<DriverCookie> {
        match self.cookies.lock().get(id) {
            Some(CookieEntry {
                cookie: Cookie::File(cookie),
                ..
            }) => Ok(*cookie),
            _ => Err(FsError::BadRequest),
        }
    }

    fn dir_cookie(&self, id: CookieId) -> FsResult<DriverCookie> {
        match self.cookies.lock().get(id) {
            Some(CookieEntry {
                cookie: Cookie::Dir(cookie),
                ..
            }) => Ok(*cookie),
            _ => Err(FsError::BadRequest),
        }
    }

    fn attr_dir_cookie(&self, id: CookieId) -> FsResult<DriverCookie> {
        match self.cookies.lock().get(id) {
            Some(CookieEntry {
                cookie: Cookie::AttrDir(cookie),
                ..
            }) => Ok(*cookie),
            _ => Err(FsError::BadRequest),
        }
    }

    fn index_dir_cookie(&self, id: CookieId) -> FsResult<DriverCookie> {
        match self.cookies.lock().get(id) {
            Some(CookieEntry {
                cookie: Cookie::IndexDir(cookie),
                ..
            }) => Ok(*cookie),
            _ => Err(FsError::BadRequest),
        }
    }

    fn query_cookie(&self, id: CookieId) -> FsResult<DriverCookie> {
        match self.cookies.lock().get(id) {
            Some(CookieEntry {
                cookie: Cookie::Query(cookie),
                ..
            }) => Ok(*cookie),
            _ => Err(FsError::BadRequest),
        }
    }

    // ----- volume operations -----

    /// Mounts the volume. Valid only while not yet mounted.
    pub fn mount(&self, device: &str, flags: u32, parameters: &str) -> FsResult<NodeId> {
        self.check(FsOperation::Mount)?;
        if self.state.lock().mounted {
            return Err(FsError::BadRequest);
        }
        // The state lock cannot be held across the driver call: mount is
        // allowed to re-enter the server (publishing the root node, for
        // example), and the nested request needs the state.
        let (driver_volume, root) = self.driver().mount(self.id, device, flags, parameters)?;
        let mut state = self.state.lock();
        state.driver_volume = Some(driver_volume);
        state.mounted = true;
        Ok(root)
    }

    /// Unmounts the volume. Cookies the kernel never released are freed
    /// first, in reverse order of creation.
    pub fn unmount(&self) -> FsResult<()> {
        self.check(FsOperation::Unmount)?;
        let volume = self.driver_volume()?;
        self.release_leftover_cookies(volume);
        self.driver().unmount(volume)?;
        let mut state = self.state.lock();
        state.mounted = false;
        state.driver_volume = None;
        Ok(())
    }

    fn release_leftover_cookies(&self, volume: DriverVolume) {
        // Pull the survivors out under the lock, release them without it;
        // a driver free hook may re-enter the server.
        let leftovers: Vec<(CookieId, CookieEntry)> = {
            let mut table = self.cookies.lock();
            let order: Vec<CookieId> = table.order.clone();
            order
                .into_iter()
                .rev()
                .filter_map(|id| table.remove(id).map(|entry| (id, entry)))
                .collect()
        };
        for (id, entry) in leftovers {
            warn!(
                "volume {}: releasing cookie {} left behind at unmount",
                self.id, id.0
            );
            let node = entry.node.unwrap_or(NodeHandle(0));
            let driver = self.driver();
            let _ = match entry.cookie {
                Cookie::File(cookie) => Self::soft(driver.free_cookie(volume, node, cookie)),
                Cookie::Dir(cookie) => Self::soft(driver.free_dir_cookie(volume, node, cookie)),
                Cookie::AttrDir(cookie) => {
                    Self::soft(driver.free_attr_dir_cookie(volume, node, cookie))
                }
                Cookie::Attr(AttrCookie::Driver(cookie)) => {
                    Self::soft(driver.free_attr_cookie(volume, node, cookie))
                }
                Cookie::Attr(AttrCookie::Emulated(_)) => Ok(()),
                Cookie::IndexDir(cookie) => Self::soft(driver.free_index_dir_cookie(volume, cookie)),
                Cookie::Query(cookie) => Self::soft(driver.free_query_cookie(volume, cookie)),
            };
        }
    }

    /// Flushes pending volume state.
    pub fn sync(&self) -> FsResult<()> {
        self.check(FsOperation::Sync)?;
        self.driver().sync(self.driver_volume()?)
    }

    /// Reads volume-wide information.
    pub fn read_fs_info(&self) -> FsResult<FsInfo> {
        self.check(FsOperation::ReadFsInfo)?;
        self.driver().read_fs_info(self.driver_volume()?)
    }

    /// Writes masked volume information.
    pub fn write_fs_info(&self, info: &FsInfo, mask: u32) -> FsResult<()> {
        self.check(FsOperation::WriteFsInfo)?;
        self.driver().write_fs_info(self.driver_volume()?, info, mask)
    }

    // ----- vnode operations -----

    /// Resolves `name` in the directory `dir`.
    pub fn lookup(&self, dir: NodeHandle, name: &str) -> FsResult<NodeId> {
        self.check(FsOperation::Lookup)?;
        self.driver().lookup(self.driver_volume()?, dir, name)
    }

    /// Returns the name of `node`.
    pub fn get_vnode_name(&self, node: NodeHandle) -> FsResult<String> {
        self.check(FsOperation::GetVnodeName)?;
        self.driver().get_vnode_name(self.driver_volume()?, node)
    }

    /// The kind of `node`. While the volume is still mounting there is no
    /// driver cookie to stat with; the nodes published that early (root,
    /// index directory) are directories.
    pub fn node_kind(&self, node: NodeHandle) -> FsResult<NodeKind> {
        if !self.mounted() {
            return Ok(NodeKind::Directory);
        }
        let stat = self.driver().read_stat(self.driver_volume()?, node)?;
        Ok(NodeKind::from_mode(stat.mode))
    }

    /// Materializes the node for inode `id` and derives its kind, flags and
    /// per-node capability bitmap.
    pub fn read_vnode(
        &self,
        id: NodeId,
        reenter: bool,
    ) -> FsResult<(NodeHandle, NodeKind, u32, crate::capabilities::CapabilitySet)> {
        self.check(FsOperation::GetVnode)?;
        let volume = self.driver_volume()?;
        let node = self.driver().read_vnode(volume, id, reenter)?;
        // The driver hands back a raw token; stat it to learn the type.
        let stat = match self.driver().read_stat(volume, node) {
            Ok(stat) => stat,
            Err(err) => {
                let _ = self.driver().write_vnode(volume, node, reenter);
                return Err(err);
            }
        };
        Ok((node, NodeKind::from_mode(stat.mode), 0, self.capabilities))
    }

    /// Releases a node token.
    pub fn write_vnode(&self, node: NodeHandle, reenter: bool) -> FsResult<()> {
        self.check(FsOperation::PutVnode)?;
        self.driver().write_vnode(self.driver_volume()?, node, reenter)
    }

    /// Removes a node whose last reference went away.
    pub fn remove_vnode(&self, node: NodeHandle, reenter: bool) -> FsResult<()> {
        self.check(FsOperation::RemoveVnode)?;
        self.driver().remove_vnode(self.driver_volume()?, node, reenter)
    }

    // ----- VM file access -----

    /// Whether `node` can be memory mapped.
    pub fn can_page(&self, node: NodeHandle, cookie: CookieId) -> FsResult<bool> {
        self.check(FsOperation::CanPage)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver().can_page(self.driver_volume()?, node, cookie)
    }

    /// Page-in read.
    pub fn read_pages(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        self.check(FsOperation::ReadPages)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver()
            .read_pages(self.driver_volume()?, node, cookie, pos, buffer)
    }

    /// Page-out write.
    pub fn write_pages(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        self.check(FsOperation::WritePages)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver()
            .write_pages(self.driver_volume()?, node, cookie, pos, buffer)
    }

    // ----- common operations -----

    /// Control operation on an open file.
    pub fn ioctl(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        command: u32,
        buffer: &mut [u8],
    ) -> FsResult<()> {
        self.check(FsOperation::Ioctl)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver()
            .ioctl(self.driver_volume()?, node, cookie, command, buffer)
    }

    /// Changes open-mode flags.
    pub fn set_flags(&self, node: NodeHandle, cookie: CookieId, flags: i32) -> FsResult<()> {
        self.check(FsOperation::SetFlags)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver()
            .set_flags(self.driver_volume()?, node, cookie, flags)
    }

    /// Registers interest in `event`. When the driver has no select hook
    /// the runtime answers by notifying the waiter immediately.
    pub fn select(&self, node: NodeHandle, cookie: CookieId, event: u8, sync: u64) -> FsResult<()> {
        self.check(FsOperation::Select)?;
        let cookie = self.file_cookie(cookie)?;
        match self
            .driver()
            .select(self.driver_volume()?, node, cookie, event, sync)
        {
            Err(FsError::UnsupportedOperation) => {
                self.file_system.notify_select_event(sync, event);
                Ok(())
            }
            other => other,
        }
    }

    /// Withdraws select interest.
    pub fn deselect(&self, node: NodeHandle, cookie: CookieId, event: u8, sync: u64) -> FsResult<()> {
        self.check(FsOperation::Deselect)?;
        let cookie = self.file_cookie(cookie)?;
        Self::soft(
            self.driver()
                .deselect(self.driver_volume()?, node, cookie, event, sync),
        )
    }

    /// Flushes one node.
    pub fn fsync(&self, node: NodeHandle) -> FsResult<()> {
        self.check(FsOperation::Fsync)?;
        self.driver().fsync(self.driver_volume()?, node)
    }

    /// Reads a symlink target.
    pub fn read_symlink(&self, node: NodeHandle, buffer: &mut [u8]) -> FsResult<usize> {
        self.check(FsOperation::ReadSymlink)?;
        self.driver().read_symlink(self.driver_volume()?, node, buffer)
    }

    /// Creates a symlink.
    pub fn create_symlink(
        &self,
        dir: NodeHandle,
        name: &str,
        target: &str,
        mode: i32,
    ) -> FsResult<()> {
        self.check(FsOperation::CreateSymlink)?;
        self.driver()
            .create_symlink(self.driver_volume()?, dir, name, target, mode)
    }

    /// Creates a hard link.
    pub fn link(&self, dir: NodeHandle, name: &str, node: NodeHandle) -> FsResult<()> {
        self.check(FsOperation::Link)?;
        self.driver().link(self.driver_volume()?, dir, name, node)
    }

    /// Removes a directory entry.
    pub fn unlink(&self, dir: NodeHandle, name: &str) -> FsResult<()> {
        self.check(FsOperation::Unlink)?;
        self.driver().unlink(self.driver_volume()?, dir, name)
    }

    /// Renames an entry.
    pub fn rename(
        &self,
        old_dir: NodeHandle,
        old_name: &str,
        new_dir: NodeHandle,
        new_name: &str,
    ) -> FsResult<()> {
        self.check(FsOperation::Rename)?;
        self.driver()
            .rename(self.driver_volume()?, old_dir, old_name, new_dir, new_name)
    }

    /// Checks access rights. A driver without an access hook grants
    /// everything.
    pub fn access(&self, node: NodeHandle, mode: i32) -> FsResult<()> {
        self.check(FsOperation::Access)?;
        Self::soft(self.driver().access(self.driver_volume()?, node, mode))
    }

    /// Reads a node's stat record.
    pub fn read_stat(&self, node: NodeHandle) -> FsResult<NodeStat> {
        self.check(FsOperation::ReadStat)?;
        self.driver().read_stat(self.driver_volume()?, node)
    }

    /// Writes masked stat fields.
    pub fn write_stat(&self, node: NodeHandle, stat: &NodeStat, mask: StatMask) -> FsResult<()> {
        self.check(FsOperation::WriteStat)?;
        self.driver()
            .write_stat(self.driver_volume()?, node, stat, mask)
    }

    // ----- file operations -----

    /// Creates and opens a file; the cookie enters the volume's table.
    pub fn create(
        &self,
        dir: NodeHandle,
        name: &str,
        open_mode: i32,
        perms: u32,
    ) -> FsResult<(NodeId, CookieId)> {
        self.check(FsOperation::Create)?;
        let (node_id, cookie) = self
            .driver()
            .create(self.driver_volume()?, dir, name, open_mode, perms)?;
        let id = self.cookies.lock().insert(Cookie::File(cookie), None);
        Ok((node_id, id))
    }

    /// Opens a file.
    pub fn open(&self, node: NodeHandle, open_mode: i32) -> FsResult<CookieId> {
        self.check(FsOperation::Open)?;
        let cookie = self.driver().open(self.driver_volume()?, node, open_mode)?;
        Ok(self.cookies.lock().insert(Cookie::File(cookie), Some(node)))
    }

    /// Closes an open file. The cookie stays allocated until
    /// [`Volume::free_cookie`].
    pub fn close(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::Close)?;
        let cookie = self.file_cookie(cookie)?;
        Self::soft(self.driver().close(self.driver_volume()?, node, cookie))
    }

    /// Releases a file cookie and drops it from the table.
    pub fn free_cookie(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::FreeCookie)?;
        let raw = self.file_cookie(cookie)?;
        let result = Self::soft(self.driver().free_cookie(self.driver_volume()?, node, raw));
        self.cookies.lock().remove(cookie);
        result
    }

    /// Reads from an open file.
    pub fn read(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        self.check(FsOperation::Read)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver()
            .read(self.driver_volume()?, node, cookie, pos, buffer)
    }

    /// Writes to an open file.
    pub fn write(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        self.check(FsOperation::Write)?;
        let cookie = self.file_cookie(cookie)?;
        self.driver()
            .write(self.driver_volume()?, node, cookie, pos, buffer)
    }

    // ----- directory operations -----

    /// Creates a directory.
    pub fn create_dir(&self, dir: NodeHandle, name: &str, perms: u32) -> FsResult<()> {
        self.check(FsOperation::CreateDir)?;
        self.driver()
            .create_dir(self.driver_volume()?, dir, name, perms)
    }

    /// Removes a directory.
    pub fn remove_dir(&self, dir: NodeHandle, name: &str) -> FsResult<()> {
        self.check(FsOperation::RemoveDir)?;
        self.driver().remove_dir(self.driver_volume()?, dir, name)
    }

    /// Opens a directory for iteration.
    pub fn open_dir(&self, node: NodeHandle) -> FsResult<CookieId> {
        self.check(FsOperation::OpenDir)?;
        let cookie = self.driver().open_dir(self.driver_volume()?, node)?;
        Ok(self.cookies.lock().insert(Cookie::Dir(cookie), Some(node)))
    }

    /// Closes a directory cookie.
    pub fn close_dir(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::CloseDir)?;
        let cookie = self.dir_cookie(cookie)?;
        Self::soft(self.driver().close_dir(self.driver_volume()?, node, cookie))
    }

    /// Releases a directory cookie.
    pub fn free_dir_cookie(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::FreeDirCookie)?;
        let raw = self.dir_cookie(cookie)?;
        let result = Self::soft(
            self.driver()
                .free_dir_cookie(self.driver_volume()?, node, raw),
        );
        self.cookies.lock().remove(cookie);
        result
    }

    /// Reads directory entries.
    pub fn read_dir(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        self.check(FsOperation::ReadDir)?;
        let cookie = self.dir_cookie(cookie)?;
        self.driver()
            .read_dir(self.driver_volume()?, node, cookie, count)
    }

    /// Resets a directory cookie.
    pub fn rewind_dir(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::RewindDir)?;
        let cookie = self.dir_cookie(cookie)?;
        self.driver().rewind_dir(self.driver_volume()?, node, cookie)
    }

    // ----- attribute directory operations -----

    /// Opens the attribute directory of `node`.
    pub fn open_attr_dir(&self, node: NodeHandle) -> FsResult<CookieId> {
        self.check(FsOperation::OpenAttrDir)?;
        let cookie = self.driver().open_attr_dir(self.driver_volume()?, node)?;
        Ok(self
            .cookies
            .lock()
            .insert(Cookie::AttrDir(cookie), Some(node)))
    }

    /// Closes an attribute-directory cookie.
    pub fn close_attr_dir(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::CloseAttrDir)?;
        let cookie = self.attr_dir_cookie(cookie)?;
        Self::soft(
            self.driver()
                .close_attr_dir(self.driver_volume()?, node, cookie),
        )
    }

    /// Releases an attribute-directory cookie.
    pub fn free_attr_dir_cookie(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::FreeAttrDirCookie)?;
        let raw = self.attr_dir_cookie(cookie)?;
        let result = Self::soft(
            self.driver()
                .free_attr_dir_cookie(self.driver_volume()?, node, raw),
        );
        self.cookies.lock().remove(cookie);
        result
    }

    /// Reads attribute-directory entries.
    pub fn read_attr_dir(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        self.check(FsOperation::ReadAttrDir)?;
        let cookie = self.attr_dir_cookie(cookie)?;
        self.driver()
            .read_attr_dir(self.driver_volume()?, node, cookie, count)
    }

    /// Resets an attribute-directory cookie.
    pub fn rewind_attr_dir(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::RewindAttrDir)?;
        let cookie = self.attr_dir_cookie(cookie)?;
        self.driver()
            .rewind_attr_dir(self.driver_volume()?, node, cookie)
    }

    // ----- attribute operations -----

    /// Creates and opens an attribute.
    pub fn create_attr(
        &self,
        node: NodeHandle,
        name: &str,
        type_code: u32,
        open_mode: i32,
    ) -> FsResult<CookieId> {
        self.check(FsOperation::CreateAttr)?;
        if self.dialect() == Dialect::Legacy {
            return self.open_attr_emulated(node, name, type_code, open_mode, true);
        }
        let cookie = self
            .driver()
            .create_attr(self.driver_volume()?, node, name, type_code, open_mode)?;
        Ok(self
            .cookies
            .lock()
            .insert(Cookie::Attr(AttrCookie::Driver(cookie)), Some(node)))
    }

    /// Opens an attribute.
    pub fn open_attr(&self, node: NodeHandle, name: &str, open_mode: i32) -> FsResult<CookieId> {
        self.check(FsOperation::OpenAttr)?;
        if self.dialect() == Dialect::Legacy {
            return self.open_attr_emulated(node, name, 0, open_mode, false);
        }
        let cookie = self
            .driver()
            .open_attr(self.driver_volume()?, node, name, open_mode)?;
        Ok(self
            .cookies
            .lock()
            .insert(Cookie::Attr(AttrCookie::Driver(cookie)), Some(node)))
    }

    // The legacy driver API has no attribute open: fabricate a cookie from
    // the name-keyed hooks.
    fn open_attr_emulated(
        &self,
        node: NodeHandle,
        name: &str,
        type_code: u32,
        open_mode: i32,
        create: bool,
    ) -> FsResult<CookieId> {
        let volume = self.driver_volume()?;
        let driver = self.driver();

        let access = open_mode_to_access(open_mode) | if create { libc::W_OK } else { 0 };
        Self::soft(driver.access(volume, node, access))?;

        let existing = driver.stat_attr(volume, node, name);
        let exists = existing.is_ok();
        let mut type_code = type_code;
        if create {
            if exists && (open_mode & libc::O_EXCL) != 0 {
                return Err(FsError::Driver(-libc::EEXIST));
            }
        } else {
            match existing {
                Ok(info) => type_code = info.type_code,
                Err(_) => return Err(FsError::Driver(-libc::ENOENT)),
            }
        }

        let mut exists = exists;
        if create && !exists && self.file_system.attr_create_policy() == AttrCreatePolicy::OnOpen {
            driver.write_attr_named(volume, node, name, type_code, 0, &[])?;
            exists = true;
        }

        let cookie = Cookie::Attr(AttrCookie::Emulated(EmulatedAttr {
            name: name.to_string(),
            type_code,
            open_mode,
            exists,
            create,
        }));
        Ok(self.cookies.lock().insert(cookie, Some(node)))
    }

    /// Closes an attribute cookie.
    pub fn close_attr(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::CloseAttr)?;
        match self.cookies.lock().get(cookie) {
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Driver(raw)),
                ..
            }) => {
                let raw = *raw;
                Self::soft(self.driver().close_attr(self.driver_volume()?, node, raw))
            }
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Emulated(_)),
                ..
            }) => Ok(()),
            _ => Err(FsError::BadRequest),
        }
    }

    /// Releases an attribute cookie.
    pub fn free_attr_cookie(&self, node: NodeHandle, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::FreeAttrCookie)?;
        let entry = {
            let mut table = self.cookies.lock();
            match table.get(cookie) {
                Some(CookieEntry {
                    cookie: Cookie::Attr(_),
                    ..
                }) => table.remove(cookie),
                _ => None,
            }
        }
        .ok_or(FsError::BadRequest)?;
        match entry.cookie {
            Cookie::Attr(AttrCookie::Driver(raw)) => {
                Self::soft(self.driver().free_attr_cookie(self.driver_volume()?, node, raw))
            }
            _ => Ok(()),
        }
    }

    /// Reads attribute data.
    pub fn read_attr(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        pos: i64,
        buffer: &mut [u8],
    ) -> FsResult<usize> {
        self.check(FsOperation::ReadAttr)?;
        let volume = self.driver_volume()?;
        let table = self.cookies.lock();
        match table.get(cookie) {
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Driver(raw)),
                ..
            }) => {
                let raw = *raw;
                drop(table);
                self.driver().read_attr(volume, node, raw, pos, buffer)
            }
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Emulated(attr)),
                ..
            }) => {
                if open_mode_to_access(attr.open_mode) & libc::R_OK == 0 {
                    return Err(FsError::Driver(-libc::EBADF));
                }
                let (name, type_code) = (attr.name.clone(), attr.type_code);
                drop(table);
                self.driver()
                    .read_attr_named(volume, node, &name, type_code, pos, buffer)
            }
            _ => Err(FsError::BadRequest),
        }
    }

    /// Writes attribute data. On the legacy dialect this is also the moment
    /// a created-but-missing attribute comes into existence.
    pub fn write_attr(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        pos: i64,
        buffer: &[u8],
    ) -> FsResult<usize> {
        self.check(FsOperation::WriteAttr)?;
        let volume = self.driver_volume()?;
        let mut table = self.cookies.lock();
        match table.get_mut(cookie) {
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Driver(raw)),
                ..
            }) => {
                let raw = *raw;
                drop(table);
                self.driver().write_attr(volume, node, raw, pos, buffer)
            }
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Emulated(attr)),
                ..
            }) => {
                if open_mode_to_access(attr.open_mode) & libc::W_OK == 0 {
                    return Err(FsError::Driver(-libc::EBADF));
                }
                let (name, type_code) = (attr.name.clone(), attr.type_code);
                drop(table);
                let written = self
                    .driver()
                    .write_attr_named(volume, node, &name, type_code, pos, buffer)?;
                let mut table = self.cookies.lock();
                if let Some(CookieEntry {
                    cookie: Cookie::Attr(AttrCookie::Emulated(attr)),
                    ..
                }) = table.get_mut(cookie)
                {
                    attr.exists = true;
                }
                Ok(written)
            }
            _ => Err(FsError::BadRequest),
        }
    }

    /// Reads an attribute's stat record.
    pub fn read_attr_stat(&self, node: NodeHandle, cookie: CookieId) -> FsResult<NodeStat> {
        self.check(FsOperation::ReadAttrStat)?;
        let volume = self.driver_volume()?;
        let table = self.cookies.lock();
        match table.get(cookie) {
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Driver(raw)),
                ..
            }) => {
                let raw = *raw;
                drop(table);
                self.driver().read_attr_stat(volume, node, raw)
            }
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Emulated(attr)),
                ..
            }) => {
                let name = attr.name.clone();
                drop(table);
                let info: AttrInfo = self.driver().stat_attr(volume, node, &name)?;
                Ok(NodeStat {
                    size: info.size,
                    type_code: info.type_code,
                    ..NodeStat::default()
                })
            }
            _ => Err(FsError::BadRequest),
        }
    }

    /// Writes an attribute's stat record. Not available on legacy drivers.
    pub fn write_attr_stat(
        &self,
        node: NodeHandle,
        cookie: CookieId,
        stat: &NodeStat,
        mask: StatMask,
    ) -> FsResult<()> {
        self.check(FsOperation::WriteAttrStat)?;
        let volume = self.driver_volume()?;
        match self.cookies.lock().get(cookie) {
            Some(CookieEntry {
                cookie: Cookie::Attr(AttrCookie::Driver(raw)),
                ..
            }) => {
                let raw = *raw;
                self.driver().write_attr_stat(volume, node, raw, stat, mask)
            }
            _ => Err(FsError::BadRequest),
        }
    }

    /// Renames an attribute. Legacy drivers can only rename within one
    /// node.
    pub fn rename_attr(
        &self,
        old_node: NodeHandle,
        old_name: &str,
        new_node: NodeHandle,
        new_name: &str,
    ) -> FsResult<()> {
        self.check(FsOperation::RenameAttr)?;
        if self.dialect() == Dialect::Legacy && old_node != new_node {
            return Err(FsError::BadRequest);
        }
        self.driver()
            .rename_attr(self.driver_volume()?, old_node, old_name, new_node, new_name)
    }

    /// Removes an attribute.
    pub fn remove_attr(&self, node: NodeHandle, name: &str) -> FsResult<()> {
        self.check(FsOperation::RemoveAttr)?;
        self.driver().remove_attr(self.driver_volume()?, node, name)
    }

    // ----- index directory & index operations -----

    /// Opens the index directory.
    pub fn open_index_dir(&self) -> FsResult<CookieId> {
        self.check(FsOperation::OpenIndexDir)?;
        let cookie = self.driver().open_index_dir(self.driver_volume()?)?;
        Ok(self.cookies.lock().insert(Cookie::IndexDir(cookie), None))
    }

    /// Closes an index-directory cookie.
    pub fn close_index_dir(&self, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::CloseIndexDir)?;
        let cookie = self.index_dir_cookie(cookie)?;
        Self::soft(self.driver().close_index_dir(self.driver_volume()?, cookie))
    }

    /// Releases an index-directory cookie.
    pub fn free_index_dir_cookie(&self, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::FreeIndexDirCookie)?;
        let raw = self.index_dir_cookie(cookie)?;
        let result = Self::soft(self.driver().free_index_dir_cookie(self.driver_volume()?, raw));
        self.cookies.lock().remove(cookie);
        result
    }

    /// Reads index-directory entries.
    pub fn read_index_dir(&self, cookie: CookieId, count: u32) -> FsResult<Vec<DirEntry>> {
        self.check(FsOperation::ReadIndexDir)?;
        let cookie = self.index_dir_cookie(cookie)?;
        self.driver()
            .read_index_dir(self.driver_volume()?, cookie, count)
    }

    /// Resets an index-directory cookie.
    pub fn rewind_index_dir(&self, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::RewindIndexDir)?;
        let cookie = self.index_dir_cookie(cookie)?;
        self.driver().rewind_index_dir(self.driver_volume()?, cookie)
    }

    /// Creates an index.
    pub fn create_index(&self, name: &str, type_code: u32, flags: u32) -> FsResult<()> {
        self.check(FsOperation::CreateIndex)?;
        self.driver()
            .create_index(self.driver_volume()?, name, type_code, flags)
    }

    /// Removes an index.
    pub fn remove_index(&self, name: &str) -> FsResult<()> {
        self.check(FsOperation::RemoveIndex)?;
        self.driver().remove_index(self.driver_volume()?, name)
    }

    /// Reads an index's stat record.
    pub fn read_index_stat(&self, name: &str) -> FsResult<IndexInfo> {
        self.check(FsOperation::ReadIndexStat)?;
        self.driver().read_index_stat(self.driver_volume()?, name)
    }

    // ----- query operations -----

    /// Opens a query.
    pub fn open_query(&self, query: &str, flags: u32, port: u32, token: u32) -> FsResult<CookieId> {
        self.check(FsOperation::OpenQuery)?;
        let cookie = self
            .driver()
            .open_query(self.driver_volume()?, query, flags, port, token)?;
        Ok(self.cookies.lock().insert(Cookie::Query(cookie), None))
    }

    /// Closes a query cookie.
    pub fn close_query(&self, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::CloseQuery)?;
        let cookie = self.query_cookie(cookie)?;
        Self::soft(self.driver().close_query(self.driver_volume()?, cookie))
    }

    /// Releases a query cookie.
    pub fn free_query_cookie(&self, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::FreeQueryCookie)?;
        let raw = self.query_cookie(cookie)?;
        let result = Self::soft(self.driver().free_query_cookie(self.driver_volume()?, raw));
        self.cookies.lock().remove(cookie);
        result
    }

    /// Reads query matches.
    pub fn read_query(&self, cookie: CookieId, count: u32) -> FsResult<Vec<DirEntry>> {
        self.check(FsOperation::ReadQuery)?;
        let cookie = self.query_cookie(cookie)?;
        self.driver().read_query(self.driver_volume()?, cookie, count)
    }

    /// Resets a query cookie.
    pub fn rewind_query(&self, cookie: CookieId) -> FsResult<()> {
        self.check(FsOperation::RewindQuery)?;
        let cookie = self.query_cookie(cookie)?;
        self.driver().rewind_query(self.driver_volume()?, cookie)
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("mounted", &self.mounted())
            .field("cookies", &self.cookie_count())
            .finish()
    }
}
