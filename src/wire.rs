//! Wire layout of request and reply frames.
//!
//! A request frame is a fixed little-endian header — operation code, flags,
//! volume id — followed by the operation's arguments in declared order.
//! Variable-length fields (names, data payloads, dirent arrays) are
//! length-prefixed. The reply frame is `{status, op_code}` followed by the
//! out-parameters. The layout is bit-exact: both endpoints may run with
//! different toolchains.

use bitflags::bitflags;
use zerocopy::byteorder::little_endian::{I64, U16, U32, U64};
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::error::FsError;
use crate::error::FsResult;
use crate::types::FsInfo;
use crate::types::IndexInfo;
use crate::types::NodeStat;

/// Fixed leading part of every request frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RequestHeader {
    /// Operation code.
    pub op: U32,
    /// Request flags; see [`RequestFlags`].
    pub flags: U32,
    /// Target volume id; zero for volume-less operations.
    pub volume: U64,
}

/// Size of [`RequestHeader`] on the wire.
pub const REQUEST_HEADER_SIZE: usize = std::mem::size_of::<RequestHeader>();

/// Fixed leading part of every reply frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ReplyHeader {
    /// Status code; zero means success.
    pub status: zerocopy::byteorder::little_endian::I32,
    /// Operation code the reply answers.
    pub op: U32,
}

/// Size of [`ReplyHeader`] on the wire.
pub const REPLY_HEADER_SIZE: usize = std::mem::size_of::<ReplyHeader>();

bitflags! {
    /// Flag bits of the request header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RequestFlags: u32 {
        /// The request re-enters the server from a driver callback.
        const REENTER = 1 << 0;
    }
}

/// Stat record as carried on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WireStat {
    pub(crate) dev: U64,
    pub(crate) ino: U64,
    pub(crate) mode: U32,
    pub(crate) nlink: U32,
    pub(crate) uid: U32,
    pub(crate) gid: U32,
    pub(crate) size: I64,
    pub(crate) blksize: U32,
    pub(crate) type_code: U32,
    pub(crate) atime: I64,
    pub(crate) mtime: I64,
    pub(crate) ctime: I64,
    pub(crate) crtime: I64,
}

impl From<&NodeStat> for WireStat {
    fn from(stat: &NodeStat) -> WireStat {
        WireStat {
            dev: U64::new(stat.dev),
            ino: U64::new(stat.ino),
            mode: U32::new(stat.mode),
            nlink: U32::new(stat.nlink),
            uid: U32::new(stat.uid),
            gid: U32::new(stat.gid),
            size: I64::new(stat.size),
            blksize: U32::new(stat.blksize),
            type_code: U32::new(stat.type_code),
            atime: I64::new(stat.atime),
            mtime: I64::new(stat.mtime),
            ctime: I64::new(stat.ctime),
            crtime: I64::new(stat.crtime),
        }
    }
}

impl From<&WireStat> for NodeStat {
    fn from(stat: &WireStat) -> NodeStat {
        NodeStat {
            dev: stat.dev.get(),
            ino: stat.ino.get(),
            mode: stat.mode.get(),
            nlink: stat.nlink.get(),
            uid: stat.uid.get(),
            gid: stat.gid.get(),
            size: stat.size.get(),
            blksize: stat.blksize.get(),
            type_code: stat.type_code.get(),
            atime: stat.atime.get(),
            mtime: stat.mtime.get(),
            ctime: stat.ctime.get(),
            crtime: stat.crtime.get(),
        }
    }
}

/// Fixed part of the fs-info record; the three names follow length-prefixed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WireFsInfo {
    pub(crate) dev: U64,
    pub(crate) root: U64,
    pub(crate) flags: U32,
    pub(crate) pad: U32,
    pub(crate) block_size: I64,
    pub(crate) io_size: I64,
    pub(crate) total_blocks: I64,
    pub(crate) free_blocks: I64,
    pub(crate) total_nodes: I64,
    pub(crate) free_nodes: I64,
}

impl From<&FsInfo> for WireFsInfo {
    fn from(info: &FsInfo) -> WireFsInfo {
        WireFsInfo {
            dev: U64::new(info.dev),
            root: U64::new(info.root),
            flags: U32::new(info.flags),
            pad: U32::new(0),
            block_size: I64::new(info.block_size),
            io_size: I64::new(info.io_size),
            total_blocks: I64::new(info.total_blocks),
            free_blocks: I64::new(info.free_blocks),
            total_nodes: I64::new(info.total_nodes),
            free_nodes: I64::new(info.free_nodes),
        }
    }
}

/// Index stat record on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WireIndexInfo {
    pub(crate) type_code: U32,
    pub(crate) pad: U32,
    pub(crate) size: I64,
    pub(crate) modification_time: I64,
    pub(crate) creation_time: I64,
    pub(crate) uid: U32,
    pub(crate) gid: U32,
}

impl From<&IndexInfo> for WireIndexInfo {
    fn from(info: &IndexInfo) -> WireIndexInfo {
        WireIndexInfo {
            type_code: U32::new(info.type_code),
            pad: U32::new(0),
            size: I64::new(info.size),
            modification_time: I64::new(info.modification_time),
            creation_time: I64::new(info.creation_time),
            uid: U32::new(info.uid),
            gid: U32::new(info.gid),
        }
    }
}

impl From<&WireIndexInfo> for IndexInfo {
    fn from(info: &WireIndexInfo) -> IndexInfo {
        IndexInfo {
            type_code: info.type_code.get(),
            size: info.size.get(),
            modification_time: info.modification_time.get(),
            creation_time: info.creation_time.get(),
            uid: info.uid.get(),
            gid: info.gid.get(),
        }
    }
}

/// Port identification as carried in registration messages.
#[repr(C)]
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WirePortInfo {
    pub(crate) owner: U32,
    pub(crate) client: U32,
    pub(crate) capacity: U32,
}

/// Tag of a select-event notification frame on the notification port.
pub const NOTIFY_SELECT_EVENT: u32 = 1;

/// An iterator that fetches typed arguments from a frame.
///
/// All multi-byte integers on the wire are little-endian with byte
/// alignment, so fetches never fail on alignment.
pub struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Creates an iterator over the given frame bytes.
    pub fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Remaining byte count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether all data has been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fetches a typed argument. `None` if there is not enough data left.
    pub fn fetch<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        let (value, rest) = zerocopy::Ref::<_, T>::from_prefix(self.data).ok()?;
        self.data = rest;
        Some(zerocopy::Ref::into_ref(value))
    }

    /// Fetches a `u8`.
    pub fn fetch_u8(&mut self) -> Option<u8> {
        self.fetch::<u8>().copied()
    }

    /// Fetches a little-endian `u16`.
    pub fn fetch_u16(&mut self) -> Option<u16> {
        self.fetch::<U16>().map(|v| v.get())
    }

    /// Fetches a little-endian `u32`.
    pub fn fetch_u32(&mut self) -> Option<u32> {
        self.fetch::<U32>().map(|v| v.get())
    }

    /// Fetches a little-endian `i32`.
    pub fn fetch_i32(&mut self) -> Option<i32> {
        self.fetch::<zerocopy::byteorder::little_endian::I32>().map(|v| v.get())
    }

    /// Fetches a little-endian `u64`.
    pub fn fetch_u64(&mut self) -> Option<u64> {
        self.fetch::<U64>().map(|v| v.get())
    }

    /// Fetches a little-endian `i64`.
    pub fn fetch_i64(&mut self) -> Option<i64> {
        self.fetch::<I64>().map(|v| v.get())
    }

    /// Fetches a length-prefixed byte field.
    pub fn fetch_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.fetch_u32()? as usize;
        if len > self.data.len() {
            return None;
        }
        let (out, rest) = self.data.split_at(len);
        self.data = rest;
        Some(out)
    }

    /// Fetches a length-prefixed UTF-8 string.
    pub fn fetch_str(&mut self) -> Option<&'a str> {
        std::str::from_utf8(self.fetch_bytes()?).ok()
    }

    /// Fetches all remaining bytes.
    pub fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }
}

impl std::fmt::Debug for ArgumentIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArgumentIterator[{} bytes left]", self.data.len())
    }
}

/// Builds a frame in an owned buffer: a request, a registration record, or
/// a notification.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    /// Starts an empty frame.
    pub fn new() -> FrameBuilder {
        FrameBuilder::default()
    }

    /// Starts a request frame with the standard header.
    pub fn request(op: u32, flags: RequestFlags, volume: u64) -> FrameBuilder {
        let mut builder = FrameBuilder::new();
        builder.put(&RequestHeader {
            op: U32::new(op),
            flags: U32::new(flags.bits()),
            volume: U64::new(volume),
        });
        builder
    }

    /// Appends any wire-encodable value.
    pub fn put<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Appends a `u8`.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Appends a little-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.put(&U32::new(value))
    }

    /// Appends a little-endian `i32`.
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.put(&zerocopy::byteorder::little_endian::I32::new(value))
    }

    /// Appends a little-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.put(&U64::new(value))
    }

    /// Appends a little-endian `i64`.
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.put(&I64::new(value))
    }

    /// Appends a length-prefixed byte field.
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Appends a length-prefixed string.
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// The finished frame.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Builds a reply frame in place, inside a port's send buffer.
///
/// The status is patched in last, once the handler knows whether the
/// operation succeeded.
#[derive(Debug)]
pub struct ReplyWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ReplyWriter<'a> {
    /// Starts a reply for `op` at the beginning of `buf`.
    pub fn new(buf: &'a mut [u8], op: u32) -> FsResult<ReplyWriter<'a>> {
        if buf.len() < REPLY_HEADER_SIZE {
            return Err(FsError::BadRequest);
        }
        let header = ReplyHeader {
            status: zerocopy::byteorder::little_endian::I32::new(0),
            op: U32::new(op),
        };
        buf[..REPLY_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Ok(ReplyWriter {
            buf,
            pos: REPLY_HEADER_SIZE,
        })
    }

    fn put_raw(&mut self, bytes: &[u8]) -> FsResult<()> {
        if self.pos + bytes.len() > self.buf.len() {
            return Err(FsError::BadRequest);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Appends any wire-encodable value.
    pub fn put<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) -> FsResult<()> {
        self.put_raw(value.as_bytes())
    }

    /// Appends a `u8`.
    pub fn put_u8(&mut self, value: u8) -> FsResult<()> {
        self.put_raw(&[value])
    }

    /// Appends a little-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> FsResult<()> {
        self.put(&U32::new(value))
    }

    /// Appends a little-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> FsResult<()> {
        self.put(&U64::new(value))
    }

    /// Appends a little-endian `i64`.
    pub fn put_i64(&mut self, value: i64) -> FsResult<()> {
        self.put(&I64::new(value))
    }

    /// Appends a length-prefixed byte field.
    pub fn put_bytes(&mut self, value: &[u8]) -> FsResult<()> {
        self.put_u32(value.len() as u32)?;
        self.put_raw(value)
    }

    /// Appends a length-prefixed string.
    pub fn put_str(&mut self, value: &str) -> FsResult<()> {
        self.put_bytes(value.as_bytes())
    }

    /// Bytes available for further out-parameters.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Drops any out-parameters written so far, keeping the header.
    pub fn truncate_to_header(&mut self) {
        self.pos = REPLY_HEADER_SIZE;
    }

    /// Patches the status and returns the final frame length.
    pub fn finish(self, status: i32) -> usize {
        self.buf[..4].copy_from_slice(zerocopy::byteorder::little_endian::I32::new(status).as_bytes());
        self.pos
    }
}

/// Splits a reply frame into its status and an iterator over the
/// out-parameters. Client side of the wire.
pub fn parse_reply(frame: &[u8]) -> FsResult<(u32, i32, ArgumentIterator<'_>)> {
    let mut args = ArgumentIterator::new(frame);
    let header = args.fetch::<ReplyHeader>().ok_or(FsError::BadRequest)?;
    Ok((header.op.get(), header.status.get(), args))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_sizes_match_the_contract() {
        assert_eq!(REQUEST_HEADER_SIZE, 16);
        assert_eq!(REPLY_HEADER_SIZE, 8);
    }

    #[test]
    fn request_header_layout() {
        let frame = FrameBuilder::request(22, RequestFlags::REENTER, 0x0102_0304)
            .finish();
        assert_eq!(&frame[0..4], &[22, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[1, 0, 0, 0]);
        assert_eq!(&frame[8..16], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn mixed_arguments_round_trip() {
        let mut builder = FrameBuilder::new();
        builder
            .put_u64(77)
            .put_str("hello")
            .put_u8(3)
            .put_bytes(&[1, 2, 3, 4]);
        let frame = builder.finish();

        let mut args = ArgumentIterator::new(&frame);
        assert_eq!(args.fetch_u64(), Some(77));
        assert_eq!(args.fetch_str(), Some("hello"));
        assert_eq!(args.fetch_u8(), Some(3));
        assert_eq!(args.fetch_bytes(), Some(&[1, 2, 3, 4][..]));
        assert!(args.is_empty());
    }

    #[test]
    fn truncated_frames_fetch_none() {
        let mut builder = FrameBuilder::new();
        builder.put_u32(9).put_u8(1);
        let frame = builder.finish();
        let mut args = ArgumentIterator::new(&frame);
        // The length prefix promises more data than the frame holds.
        assert_eq!(args.fetch_bytes(), None);
        let mut args = ArgumentIterator::new(&frame);
        assert_eq!(args.fetch_u64(), None);
        assert_eq!(args.len(), 5);
    }

    #[test]
    fn stat_round_trip() {
        let stat = NodeStat {
            dev: 3,
            ino: 42,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 100,
            size: 4096,
            blksize: 512,
            type_code: 0,
            atime: 10,
            mtime: 20,
            ctime: 30,
            crtime: 40,
        };
        let wire = WireStat::from(&stat);
        assert_eq!(NodeStat::from(&wire), stat);
    }

    #[test]
    fn reply_writer_builds_and_patches_status() {
        let mut buf = [0u8; 64];
        let mut writer = ReplyWriter::new(&mut buf, 30).unwrap();
        writer.put_u64(123).unwrap();
        writer.put_str("ok").unwrap();
        let len = writer.finish(-libc::ENOENT);

        let (op, status, mut args) = parse_reply(&buf[..len]).unwrap();
        assert_eq!(op, 30);
        assert_eq!(status, -libc::ENOENT);
        assert_eq!(args.fetch_u64(), Some(123));
        assert_eq!(args.fetch_str(), Some("ok"));
    }

    #[test]
    fn reply_writer_rejects_overflow() {
        let mut buf = [0u8; 12];
        let mut writer = ReplyWriter::new(&mut buf, 1).unwrap();
        assert!(writer.put_u32(5).is_ok());
        assert_eq!(writer.put_u64(6), Err(FsError::BadRequest));
    }
}
