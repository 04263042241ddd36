//! Registration with the dispatcher.
//!
//! The dispatcher is a separate process keeping a map from driver name to
//! the server team that serves it. The server core only speaks two
//! messages with it: `Register` carrying the file-system record, answered
//! by an ack or a denial. The record and the map live here so both sides
//! of the conversation agree on the bytes.

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use log::warn;
use parking_lot::Mutex;

use crate::capabilities::CapabilitySet;
use crate::capabilities::Dialect;
use crate::error::FsError;
use crate::error::FsResult;
use crate::port::Port;
use crate::port::PortInfo;
use crate::wire::ArgumentIterator;
use crate::wire::FrameBuilder;
use crate::wire::WirePortInfo;

/// Message tag of a registration request.
pub const REGISTER_FS: u32 = 0x7566_7201;
/// Message tag of a successful registration reply.
pub const REGISTER_FS_ACK: u32 = 0x7566_7202;
/// Message tag of a denied registration reply.
pub const REGISTER_FS_DENIED: u32 = 0x7566_7203;

/// Longest accepted driver name on the wire, in bytes.
pub const MAX_FS_NAME: usize = 256;

/// Everything the dispatcher needs to route mounts to a server: driver
/// name, advertised capabilities, the server's ports (notification port
/// first, then one per worker), and the server team.
#[derive(Clone, Debug)]
pub struct FsRegistration {
    /// Driver name the server answers for.
    pub name: String,
    /// Advertised capability set, including the dialect tag.
    pub capabilities: CapabilitySet,
    /// Port identifications, notification port first.
    pub port_infos: Vec<PortInfo>,
    /// Team (process) id of the server.
    pub team: u32,
}

impl FsRegistration {
    /// Serializes the record.
    pub fn archive(&self) -> Vec<u8> {
        let mut frame = FrameBuilder::new();
        frame.put_u32(REGISTER_FS);
        frame.put_u32(self.team);
        frame.put_u32(u32::from(self.capabilities.dialect()));
        frame.put_str(&self.name);
        frame.put_bytes(self.capabilities.bytes());
        frame.put_u32(self.port_infos.len() as u32);
        for info in &self.port_infos {
            frame.put(&WirePortInfo {
                owner: zerocopy::byteorder::little_endian::U32::new(info.owner),
                client: zerocopy::byteorder::little_endian::U32::new(info.client),
                capacity: zerocopy::byteorder::little_endian::U32::new(info.capacity),
            });
        }
        frame.finish()
    }

    /// Deserializes and validates a record archived by
    /// [`FsRegistration::archive`].
    pub fn unarchive(frame: &[u8]) -> FsResult<FsRegistration> {
        let mut args = ArgumentIterator::new(frame);
        if args.fetch_u32() != Some(REGISTER_FS) {
            return Err(FsError::BadRequest);
        }
        let team = args.fetch_u32().ok_or(FsError::BadRequest)?;
        let dialect =
            Dialect::try_from(args.fetch_u32().ok_or(FsError::BadRequest)?)
                .map_err(|_| FsError::BadRequest)?;
        let name = args.fetch_str().ok_or(FsError::BadRequest)?;
        if name.is_empty() || name.len() > MAX_FS_NAME {
            return Err(FsError::BadRequest);
        }
        let capability_bytes = args.fetch_bytes().ok_or(FsError::BadRequest)?;
        let capabilities =
            CapabilitySet::from_bytes(dialect, capability_bytes).ok_or(FsError::BadRequest)?;
        let count = args.fetch_u32().ok_or(FsError::BadRequest)? as usize;
        if count == 0 {
            return Err(FsError::BadRequest);
        }
        let mut port_infos = Vec::with_capacity(count);
        for _ in 0..count {
            let info = args.fetch::<WirePortInfo>().ok_or(FsError::BadRequest)?;
            port_infos.push(PortInfo {
                owner: info.owner.get(),
                client: info.client.get(),
                capacity: info.capacity.get(),
            });
        }
        Ok(FsRegistration {
            name: name.to_string(),
            capabilities,
            port_infos,
            team,
        })
    }
}

/// The dispatcher's name-to-server map.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, FsRegistration>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Accepts a registration unless the name is already served.
    pub fn register(&self, registration: FsRegistration) -> FsResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&registration.name) {
            warn!(
                "denying registration of {}: already served by team {}",
                registration.name, entries[&registration.name].team
            );
            return Err(FsError::BadRequest);
        }
        info!(
            "registered {} served by team {}",
            registration.name, registration.team
        );
        entries.insert(registration.name.clone(), registration);
        Ok(())
    }

    /// Looks up the server for a driver name.
    pub fn lookup(&self, name: &str) -> Option<FsRegistration> {
        self.entries.lock().get(name).cloned()
    }

    /// Death-watch: drops every registration of a vanished team.
    pub fn unregister_team(&self, team: u32) {
        self.entries.lock().retain(|name, entry| {
            if entry.team == team {
                info!("dropping {} after team {} exited", name, team);
                false
            } else {
                true
            }
        });
    }

    /// Serves one registration message arriving on `port`, answering with
    /// an ack or a denial. Dispatcher side of the conversation.
    pub fn handle_register(&self, port: &Port, frame: &[u8]) -> FsResult<()> {
        let reply = match FsRegistration::unarchive(frame) {
            Ok(registration) => match self.register(registration) {
                Ok(()) => REGISTER_FS_ACK,
                Err(_) => REGISTER_FS_DENIED,
            },
            Err(_) => REGISTER_FS_DENIED,
        };
        let mut builder = FrameBuilder::new();
        builder.put_u32(reply);
        port.send(&builder.finish())
    }
}

/// Sends a registration to the dispatcher over `port` and waits for the
/// ack. Server side of the conversation.
pub fn register_with_dispatcher(
    port: &Port,
    registration: &FsRegistration,
    timeout: Option<Duration>,
) -> FsResult<()> {
    port.send(&registration.archive())?;
    let reply = port.receive(timeout)?;
    let mut args = ArgumentIterator::new(&reply);
    match args.fetch_u32() {
        Some(REGISTER_FS_ACK) => Ok(()),
        Some(REGISTER_FS_DENIED) => {
            warn!("dispatcher denied registration of {}", registration.name);
            Err(FsError::BadRequest)
        }
        _ => Err(FsError::BadRequest),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capabilities::FsOperation;

    fn sample_registration(name: &str, team: u32) -> FsRegistration {
        let mut capabilities = CapabilitySet::new(Dialect::Legacy);
        capabilities.set(FsOperation::Mount, true);
        capabilities.set(FsOperation::ReadDir, true);
        FsRegistration {
            name: name.to_string(),
            capabilities,
            port_infos: vec![
                PortInfo {
                    owner: 10,
                    client: 11,
                    capacity: 4096,
                },
                PortInfo {
                    owner: 12,
                    client: 13,
                    capacity: 4096,
                },
            ],
            team,
        }
    }

    #[test]
    fn archive_round_trip() {
        let registration = sample_registration("myfs", 42);
        let restored = FsRegistration::unarchive(&registration.archive()).unwrap();
        assert_eq!(restored.name, "myfs");
        assert_eq!(restored.team, 42);
        assert_eq!(restored.capabilities, registration.capabilities);
        assert_eq!(restored.port_infos, registration.port_infos);
    }

    #[test]
    fn unarchive_rejects_garbage() {
        assert!(FsRegistration::unarchive(&[]).is_err());
        assert!(FsRegistration::unarchive(&[1, 2, 3]).is_err());
        let mut truncated = sample_registration("myfs", 1).archive();
        truncated.truncate(truncated.len() - 4);
        assert!(FsRegistration::unarchive(&truncated).is_err());
    }

    #[test]
    fn registry_accepts_then_denies_duplicates() {
        let registry = Registry::new();
        registry.register(sample_registration("myfs", 1)).unwrap();
        assert!(registry.register(sample_registration("myfs", 2)).is_err());
        assert_eq!(registry.lookup("myfs").unwrap().team, 1);

        registry.register(sample_registration("otherfs", 1)).unwrap();
        registry.unregister_team(1);
        assert!(registry.lookup("myfs").is_none());
        assert!(registry.lookup("otherfs").is_none());
    }

    #[test]
    fn register_conversation_over_ports() {
        let dispatcher_port = Port::new(4096);
        let server_port = Port::from_info(dispatcher_port.info()).unwrap();
        let registry = Registry::new();

        let handle = std::thread::spawn(move || {
            let frame = dispatcher_port.receive(None).unwrap();
            registry.handle_register(&dispatcher_port, &frame).unwrap();
            let frame = dispatcher_port.receive(None).unwrap();
            registry.handle_register(&dispatcher_port, &frame).unwrap();
            dispatcher_port
        });

        register_with_dispatcher(
            &server_port,
            &sample_registration("myfs", 7),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        // A second registration under the same name is denied.
        assert!(register_with_dispatcher(
            &server_port,
            &sample_registration("myfs", 8),
            Some(Duration::from_secs(5)),
        )
        .is_err());
        drop(handle.join().unwrap());
    }
}
