//! Userland file-system server runtime.
//!
//! This crate hosts a file-system driver in user space while continuing to
//! serve the kernel's VFS. A driver is a table of operations behind the
//! [`Driver`] trait; the runtime advertises which operations the driver
//! implements as a queryable [`CapabilitySet`], bridges kernel and server
//! with a bounded-buffer port transport served by a fixed worker pool, and
//! provides a shared [`cache::BlockCache`] sized for file-system workloads
//! (LRU reclaim, coalesced I/O, journal-friendly clone/commit).
//!
//! The kernel side of the bridge and the on-disk drivers themselves are
//! external collaborators: the former replays requests over the wire
//! format in [`wire`], the latter are loaded from the [`driver::Registry`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::capabilities::CapabilitySet;
pub use crate::capabilities::Dialect;
pub use crate::capabilities::FsOperation;
pub use crate::capabilities::CAPABILITY_BYTES;
pub use crate::capabilities::OPERATION_COUNT;
pub use crate::driver::Driver;
pub use crate::error::FsError;
pub use crate::error::FsResult;
pub use crate::file_system::AttrCreatePolicy;
pub use crate::file_system::FileSystem;
pub use crate::port::default_capacity;
pub use crate::port::Port;
pub use crate::port::PortCloser;
pub use crate::port::PortInfo;
pub use crate::request_thread::context_depth;
pub use crate::request_thread::current_volume;
pub use crate::request_thread::RequestContext;
pub use crate::request_thread::RequestThread;
pub use crate::server::Server;
pub use crate::server::REQUEST_THREAD_COUNT;
pub use crate::types::AttrInfo;
pub use crate::types::CookieId;
pub use crate::types::DirEntry;
pub use crate::types::DriverCookie;
pub use crate::types::DriverVolume;
pub use crate::types::FsInfo;
pub use crate::types::IndexInfo;
pub use crate::types::NodeHandle;
pub use crate::types::NodeId;
pub use crate::types::NodeKind;
pub use crate::types::open_mode_to_access;
pub use crate::types::NodeStat;
pub use crate::types::StatMask;
pub use crate::types::VolumeId;
pub use crate::volume::Volume;

pub mod cache;
mod capabilities;
pub mod dispatcher;
pub mod driver;
mod error;
mod file_system;
pub mod handler;
mod port;
mod request_thread;
mod server;
pub mod settings;
mod types;
mod volume;
pub mod wire;
