//! Operation enumeration and capability bitmaps.
//!
//! Every VFS entry point the runtime understands has a dense, stable
//! operation code. A driver advertises the operations it implements through
//! a [`CapabilitySet`], a packed bit vector with one bit per code. The
//! numeric values are part of the wire contract between kernel and server:
//! new operations are appended, never inserted.

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// Which revision of the driver operation table a driver implements.
///
/// The dialect selects argument translation and emulation strategies in the
/// volume layer; legacy drivers, for example, have no open/close pair for
/// attributes and get those fabricated by the runtime.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Dialect {
    /// The flat per-device operation table of the original driver API.
    Legacy = 0,
    /// The current driver API.
    Current = 1,
}

/// Operation codes for every VFS entry point, in wire order.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum FsOperation {
    // volume operations
    Mount = 0,
    Unmount = 1,
    Sync = 2,
    ReadFsInfo = 3,
    WriteFsInfo = 4,

    // vnode operations
    Lookup = 5,
    GetVnodeName = 6,
    GetVnode = 7,
    PutVnode = 8,
    RemoveVnode = 9,

    // VM file access
    CanPage = 10,
    ReadPages = 11,
    WritePages = 12,

    // common operations
    Ioctl = 13,
    SetFlags = 14,
    Select = 15,
    Deselect = 16,
    Fsync = 17,
    ReadSymlink = 18,
    CreateSymlink = 19,
    Link = 20,
    Unlink = 21,
    Rename = 22,
    Access = 23,
    ReadStat = 24,
    WriteStat = 25,

    // file operations
    Create = 26,
    Open = 27,
    Close = 28,
    FreeCookie = 29,
    Read = 30,
    Write = 31,

    // directory operations
    CreateDir = 32,
    RemoveDir = 33,
    OpenDir = 34,
    CloseDir = 35,
    FreeDirCookie = 36,
    ReadDir = 37,
    RewindDir = 38,

    // attribute directory operations
    OpenAttrDir = 39,
    CloseAttrDir = 40,
    FreeAttrDirCookie = 41,
    ReadAttrDir = 42,
    RewindAttrDir = 43,

    // attribute operations
    CreateAttr = 44,
    OpenAttr = 45,
    CloseAttr = 46,
    FreeAttrCookie = 47,
    ReadAttr = 48,
    WriteAttr = 49,
    ReadAttrStat = 50,
    WriteAttrStat = 51,
    RenameAttr = 52,
    RemoveAttr = 53,

    // index directory & index operations
    OpenIndexDir = 54,
    CloseIndexDir = 55,
    FreeIndexDirCookie = 56,
    ReadIndexDir = 57,
    RewindIndexDir = 58,
    CreateIndex = 59,
    RemoveIndex = 60,
    ReadIndexStat = 61,

    // query operations
    OpenQuery = 62,
    CloseQuery = 63,
    FreeQueryCookie = 64,
    ReadQuery = 65,
    RewindQuery = 66,
}

/// Number of operation codes.
pub const OPERATION_COUNT: usize = 67;

/// Size of the packed capability bitmap in bytes.
pub const CAPABILITY_BYTES: usize = OPERATION_COUNT.div_ceil(8);

impl FsOperation {
    /// Iterates over every operation code in wire order.
    pub fn all() -> impl Iterator<Item = FsOperation> {
        (0..OPERATION_COUNT as u32).map(|code| FsOperation::try_from(code).unwrap())
    }
}

/// A packed bit vector advertising which operations a driver implements,
/// together with the driver's dialect tag.
///
/// A set is seeded once when the file system loads its driver and is copied
/// by value into every volume so per-instance masking stays possible.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct CapabilitySet {
    dialect: Dialect,
    bits: [u8; CAPABILITY_BYTES],
}

impl CapabilitySet {
    /// Creates an empty set for the given dialect.
    pub fn new(dialect: Dialect) -> Self {
        CapabilitySet {
            dialect,
            bits: [0; CAPABILITY_BYTES],
        }
    }

    /// The driver dialect this set was built for.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Clears every capability bit.
    pub fn clear_all(&mut self) {
        self.bits = [0; CAPABILITY_BYTES];
    }

    /// Sets or clears the bit for `op`.
    pub fn set(&mut self, op: FsOperation, present: bool) {
        let code = u32::from(op) as usize;
        let flag = 1u8 << (code % 8);
        if present {
            self.bits[code / 8] |= flag;
        } else {
            self.bits[code / 8] &= !flag;
        }
    }

    /// Clears the bit for `op`.
    pub fn clear(&mut self, op: FsOperation) {
        self.set(op, false);
    }

    /// Returns whether the bit for `op` is set.
    pub fn get(&self, op: FsOperation) -> bool {
        let code = u32::from(op) as usize;
        self.bits[code / 8] & (1 << (code % 8)) != 0
    }

    /// The raw little-endian bitmap, as carried in registration messages.
    pub fn bytes(&self) -> &[u8; CAPABILITY_BYTES] {
        &self.bits
    }

    /// Rebuilds a set from its wire representation.
    pub fn from_bytes(dialect: Dialect, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CAPABILITY_BYTES {
            return None;
        }
        let mut bits = [0; CAPABILITY_BYTES];
        bits.copy_from_slice(bytes);
        Some(CapabilitySet { dialect, bits })
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CapabilitySet[{:?},", self.dialect)?;
        for byte in self.bits.iter() {
            write!(f, " {:02x}", byte)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut caps = CapabilitySet::new(Dialect::Current);
        assert!(!caps.get(FsOperation::Mount));
        caps.set(FsOperation::Mount, true);
        caps.set(FsOperation::RewindQuery, true);
        assert!(caps.get(FsOperation::Mount));
        assert!(caps.get(FsOperation::RewindQuery));
        assert!(!caps.get(FsOperation::Rename));
        caps.clear(FsOperation::Mount);
        assert!(!caps.get(FsOperation::Mount));
        caps.clear_all();
        assert!(FsOperation::all().all(|op| !caps.get(op)));
    }

    #[test]
    fn codes_are_dense_and_stable() {
        // The wire contract: codes are 0..OPERATION_COUNT with no holes, and
        // the boundary values stay pinned.
        for (index, op) in FsOperation::all().enumerate() {
            assert_eq!(index as u32, u32::from(op));
        }
        assert_eq!(u32::from(FsOperation::Mount), 0);
        assert_eq!(u32::from(FsOperation::Read), 30);
        assert_eq!(u32::from(FsOperation::RewindQuery), 66);
        assert!(FsOperation::try_from(OPERATION_COUNT as u32).is_err());
    }

    #[test]
    fn wire_round_trip() {
        let mut caps = CapabilitySet::new(Dialect::Legacy);
        caps.set(FsOperation::Lookup, true);
        caps.set(FsOperation::ReadDir, true);
        let restored = CapabilitySet::from_bytes(Dialect::Legacy, caps.bytes()).unwrap();
        assert_eq!(caps, restored);
        assert!(CapabilitySet::from_bytes(Dialect::Legacy, &[0u8; 3]).is_none());
    }
}
