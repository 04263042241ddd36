//! The loaded file system: driver ownership, capability seeding, and the
//! volume factory.

use std::sync::Arc;

use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::capabilities::CapabilitySet;
use crate::capabilities::Dialect;
use crate::capabilities::FsOperation;
use crate::driver::Driver;
use crate::error::FsError;
use crate::error::FsResult;
use crate::port::Port;
use crate::types::VolumeId;
use crate::volume::Volume;
use crate::wire::FrameBuilder;
use crate::wire::NOTIFY_SELECT_EVENT;

/// When an attribute opened with create-intent on a legacy driver actually
/// comes into existence.
///
/// The legacy driver API has no attribute create hook; the runtime
/// fabricates attribute cookies and has to pick a moment to materialize the
/// attribute. The original behavior creates it on the first write through
/// the cookie; the alternative materializes it (zero-length) already at
/// open time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AttrCreatePolicy {
    /// The attribute exists once the first write through the cookie lands.
    #[default]
    OnFirstWrite,
    /// The attribute is created (empty) when the cookie is opened with
    /// create-intent.
    OnOpen,
}

/// A loaded driver with its advertised capability set and live volumes.
pub struct FileSystem {
    name: String,
    driver: Arc<dyn Driver>,
    capabilities: CapabilitySet,
    attr_policy: Mutex<AttrCreatePolicy>,
    volumes: Mutex<Vec<Arc<Volume>>>,
    notification_port: Mutex<Option<Arc<Port>>>,
}

impl FileSystem {
    /// Wraps a loaded driver. Runs the driver's module initialization and
    /// seeds the capability set (declared bits plus dialect fixups).
    pub fn new(name: &str, driver: Arc<dyn Driver>) -> FsResult<Arc<FileSystem>> {
        driver.init()?;
        let mut capabilities = driver.capabilities();
        if capabilities.dialect() != driver.dialect() {
            warn!(
                "driver {} declares dialect {:?} but capabilities carry {:?}",
                name,
                driver.dialect(),
                capabilities.dialect()
            );
        }
        fixup_capabilities(&mut capabilities);
        Ok(Arc::new(FileSystem {
            name: name.to_string(),
            driver,
            capabilities,
            attr_policy: Mutex::new(AttrCreatePolicy::default()),
            volumes: Mutex::new(Vec::new()),
            notification_port: Mutex::new(None),
        }))
    }

    /// The driver name this file system serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loaded driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// The advertised capability set.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// The driver dialect.
    pub fn dialect(&self) -> Dialect {
        self.capabilities.dialect()
    }

    /// The attribute-create policy for legacy attribute emulation.
    pub fn attr_create_policy(&self) -> AttrCreatePolicy {
        *self.attr_policy.lock()
    }

    /// Reconfigures the attribute-create policy.
    pub fn set_attr_create_policy(&self, policy: AttrCreatePolicy) {
        *self.attr_policy.lock() = policy;
    }

    /// Creates a volume for the kernel-assigned id. The volume starts
    /// unmounted.
    pub fn create_volume(self: &Arc<Self>, id: VolumeId) -> Arc<Volume> {
        let volume = Volume::new(self.clone(), id);
        self.volumes.lock().push(volume.clone());
        debug!("created volume {} for {}", id, self.name);
        volume
    }

    /// Removes a volume from the live list.
    pub fn delete_volume(&self, volume: &Arc<Volume>) -> FsResult<()> {
        let mut volumes = self.volumes.lock();
        let index = volumes
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, volume))
            .ok_or(FsError::BadRequest)?;
        volumes.remove(index);
        debug!("deleted volume {} of {}", volume.id(), self.name);
        Ok(())
    }

    /// Looks up a live volume by id.
    pub fn volume_by_id(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes
            .lock()
            .iter()
            .find(|volume| volume.id() == id)
            .cloned()
    }

    /// Number of live volumes.
    pub fn volume_count(&self) -> usize {
        self.volumes.lock().len()
    }

    /// Attaches the server's notification port, used for select events the
    /// runtime raises on the driver's behalf.
    pub fn set_notification_port(&self, port: Arc<Port>) {
        *self.notification_port.lock() = Some(port);
    }

    /// Publishes a select event for the kernel's wait token `sync`.
    pub fn notify_select_event(&self, sync: u64, event: u8) {
        let port = self.notification_port.lock().clone();
        match port {
            Some(port) => {
                let mut frame = FrameBuilder::new();
                frame.put_u32(NOTIFY_SELECT_EVENT).put_u8(event).put_u64(sync);
                if let Err(err) = port.send(&frame.finish()) {
                    warn!("dropping select notification: {}", err);
                }
            }
            None => debug!("select notification without a notification port"),
        }
    }

    /// Runs the driver's module teardown. Called once at server shutdown,
    /// after all volumes are gone.
    pub fn uninit(&self) {
        self.driver.uninit();
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("volumes", &self.volume_count())
            .finish()
    }
}

// The declared bits cover what the driver truly implements; the runtime
// adds what it can answer itself.
fn fixup_capabilities(caps: &mut CapabilitySet) {
    if caps.dialect() != Dialect::Legacy {
        return;
    }

    // Attribute open/close is fabricated on top of the name-keyed hooks.
    let has_attrs = caps.get(FsOperation::ReadAttr) || caps.get(FsOperation::WriteAttr);
    caps.set(FsOperation::CreateAttr, has_attrs);
    caps.set(FsOperation::OpenAttr, has_attrs);
    caps.set(FsOperation::CloseAttr, false);
    caps.set(FsOperation::FreeAttrCookie, has_attrs);
    caps.set(FsOperation::WriteAttrStat, false);

    // Close and free answer success even when the driver has no hook, as
    // long as the matching open exists.
    if caps.get(FsOperation::Open) || caps.get(FsOperation::Create) {
        caps.set(FsOperation::Close, true);
        caps.set(FsOperation::FreeCookie, true);
    }
    if caps.get(FsOperation::OpenDir) {
        caps.set(FsOperation::CloseDir, true);
        caps.set(FsOperation::FreeDirCookie, true);
    }
    if caps.get(FsOperation::OpenAttrDir) {
        caps.set(FsOperation::CloseAttrDir, true);
        caps.set(FsOperation::FreeAttrDirCookie, true);
    }
    if caps.get(FsOperation::OpenIndexDir) {
        caps.set(FsOperation::CloseIndexDir, true);
        caps.set(FsOperation::FreeIndexDirCookie, true);
    }
    if caps.get(FsOperation::OpenQuery) {
        caps.set(FsOperation::CloseQuery, true);
        caps.set(FsOperation::FreeQueryCookie, true);
    }

    // A missing select hook is answered by an immediate notification.
    caps.set(FsOperation::Select, true);
    caps.set(FsOperation::Deselect, true);
}

#[cfg(test)]
mod test {
    use super::*;

    struct LegacyStub;

    impl Driver for LegacyStub {
        fn dialect(&self) -> Dialect {
            Dialect::Legacy
        }

        fn capabilities(&self) -> CapabilitySet {
            let mut caps = CapabilitySet::new(Dialect::Legacy);
            caps.set(FsOperation::Mount, true);
            caps.set(FsOperation::Open, true);
            caps.set(FsOperation::OpenDir, true);
            caps.set(FsOperation::ReadAttr, true);
            caps
        }
    }

    #[test]
    fn legacy_fixups() {
        let fs = FileSystem::new("stub", Arc::new(LegacyStub)).unwrap();
        let caps = fs.capabilities();
        // Fabricated attribute open/create, no close.
        assert!(caps.get(FsOperation::OpenAttr));
        assert!(caps.get(FsOperation::CreateAttr));
        assert!(caps.get(FsOperation::FreeAttrCookie));
        assert!(!caps.get(FsOperation::CloseAttr));
        assert!(!caps.get(FsOperation::WriteAttrStat));
        // Close defaults follow the opens.
        assert!(caps.get(FsOperation::Close));
        assert!(caps.get(FsOperation::CloseDir));
        assert!(!caps.get(FsOperation::CloseQuery));
        // Select is emulated.
        assert!(caps.get(FsOperation::Select));
        // Unrelated bits stay clear.
        assert!(!caps.get(FsOperation::Rename));
    }

    #[test]
    fn volume_lifecycle() {
        let fs = FileSystem::new("stub", Arc::new(LegacyStub)).unwrap();
        let volume = fs.create_volume(VolumeId(7));
        assert_eq!(fs.volume_count(), 1);
        assert!(fs.volume_by_id(VolumeId(7)).is_some());
        assert!(fs.volume_by_id(VolumeId(8)).is_none());
        fs.delete_volume(&volume).unwrap();
        assert_eq!(fs.volume_count(), 0);
        assert_eq!(fs.delete_volume(&volume), Err(FsError::BadRequest));
    }
}
