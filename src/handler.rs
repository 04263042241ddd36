//! Decoding one request frame, invoking the target volume, and writing the
//! reply.
//!
//! The handler unmarshals arguments in place on the received frame, builds
//! the reply inside the port's send buffer (reserved for the duration), and
//! pushes a [`RequestContext`] so nested driver callbacks can recover the
//! volume being served.

use std::sync::Arc;

use log::debug;

use crate::capabilities::FsOperation;
use crate::error::FsError;
use crate::error::FsResult;
use crate::file_system::FileSystem;
use crate::port::Port;
use crate::request_thread::RequestContext;
use crate::types::CookieId;
use crate::types::FsInfo;
use crate::types::NodeHandle;
use crate::types::NodeId;
use crate::types::NodeStat;
use crate::types::StatMask;
use crate::types::VolumeId;
use crate::volume::Volume;
use crate::wire::ArgumentIterator;
use crate::wire::ReplyWriter;
use crate::wire::RequestFlags;
use crate::wire::RequestHeader;
use crate::wire::WireFsInfo;
use crate::wire::WireIndexInfo;
use crate::wire::WireStat;
use crate::wire::REPLY_HEADER_SIZE;

// Margin kept free in the reply for the header and length prefixes.
const REPLY_MARGIN: usize = REPLY_HEADER_SIZE + 24;

/// Serves decoded requests against one file system.
pub struct RequestHandler {
    file_system: Arc<FileSystem>,
}

fn need<T>(value: Option<T>) -> FsResult<T> {
    value.ok_or(FsError::BadRequest)
}

impl RequestHandler {
    /// Creates a handler for `file_system`.
    pub fn new(file_system: Arc<FileSystem>) -> RequestHandler {
        RequestHandler { file_system }
    }

    /// Handles one frame and sends the reply on `port`. Operation failures
    /// become reply statuses; only transport trouble is an `Err`.
    pub fn handle(&self, port: &mut Port, frame: &[u8]) -> FsResult<()> {
        let mut args = ArgumentIterator::new(frame);
        let header = match args.fetch::<RequestHeader>() {
            Some(header) => *header,
            None => {
                debug!("dropping runt frame of {} bytes", frame.len());
                return Ok(());
            }
        };
        let op_code = header.op.get();

        let capacity = port.capacity();
        port.reserve(capacity);
        let result = self.dispatch(port, op_code, &header, args);
        port.unreserve(0);

        match result {
            Ok(len) => port.send_buffer(len),
            Err(FsError::TransportClosed) => Err(FsError::TransportClosed),
            Err(err) => {
                let writer = ReplyWriter::new(port.buffer_mut(), op_code)?;
                let len = writer.finish(err.to_status());
                port.send_buffer(len)
            }
        }
    }

    fn target_volume(&self, header: &RequestHeader) -> FsResult<Arc<Volume>> {
        self.file_system
            .volume_by_id(VolumeId(header.volume.get()))
            .ok_or(FsError::BadRequest)
    }

    fn reenter(header: &RequestHeader) -> bool {
        RequestFlags::from_bits_truncate(header.flags.get()).contains(RequestFlags::REENTER)
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &self,
        port: &mut Port,
        op_code: u32,
        header: &RequestHeader,
        mut args: ArgumentIterator<'_>,
    ) -> FsResult<usize> {
        let op = FsOperation::try_from(op_code).map_err(|_| FsError::BadRequest)?;
        let capacity = port.capacity();
        let payload_limit = capacity.saturating_sub(REPLY_MARGIN);

        if op == FsOperation::Mount {
            // The one volume-less operation: it creates the volume.
            let id = VolumeId(need(args.fetch_u64())?);
            let device = need(args.fetch_str())?;
            let flags = need(args.fetch_u32())?;
            let parameters = need(args.fetch_str())?;
            let volume = self.file_system.create_volume(id);
            let _context = RequestContext::new(volume.clone());
            let root = match volume.mount(device, flags, parameters) {
                Ok(root) => root,
                Err(err) => {
                    let _ = self.file_system.delete_volume(&volume);
                    return Err(err);
                }
            };
            let mut writer = ReplyWriter::new(port.buffer_mut(), op_code)?;
            writer.put_u64(root.0)?;
            return Ok(writer.finish(0));
        }

        let volume = self.target_volume(header)?;
        let _context = RequestContext::new(volume.clone());

        let mut writer = ReplyWriter::new(port.buffer_mut(), op_code)?;

        match op {
            FsOperation::Mount => unreachable!(),
            FsOperation::Unmount => {
                volume.unmount()?;
                self.file_system.delete_volume(&volume)?;
            }
            FsOperation::Sync => volume.sync()?,
            FsOperation::ReadFsInfo => {
                let info = volume.read_fs_info()?;
                writer.put(&WireFsInfo::from(&info))?;
                writer.put_str(&info.device_name)?;
                writer.put_str(&info.volume_name)?;
                writer.put_str(&info.fs_name)?;
            }
            FsOperation::WriteFsInfo => {
                let wire = *need(args.fetch::<WireFsInfo>())?;
                let device_name = need(args.fetch_str())?.to_string();
                let volume_name = need(args.fetch_str())?.to_string();
                let fs_name = need(args.fetch_str())?.to_string();
                let mask = need(args.fetch_u32())?;
                let info = FsInfo {
                    dev: wire.dev.get(),
                    root: wire.root.get(),
                    flags: wire.flags.get(),
                    block_size: wire.block_size.get(),
                    io_size: wire.io_size.get(),
                    total_blocks: wire.total_blocks.get(),
                    free_blocks: wire.free_blocks.get(),
                    total_nodes: wire.total_nodes.get(),
                    free_nodes: wire.free_nodes.get(),
                    device_name,
                    volume_name,
                    fs_name,
                };
                volume.write_fs_info(&info, mask)?;
            }
            FsOperation::Lookup => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let id = volume.lookup(dir, name)?;
                writer.put_u64(id.0)?;
            }
            FsOperation::GetVnodeName => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let _buffer_size = need(args.fetch_u32())?;
                let name = volume.get_vnode_name(node)?;
                writer.put_str(&name)?;
            }
            FsOperation::GetVnode => {
                let id = NodeId(need(args.fetch_u64())?);
                let (node, kind, flags, caps) = volume.read_vnode(id, Self::reenter(header))?;
                writer.put_u64(node.0)?;
                writer.put_u32(kind.to_mode())?;
                writer.put_u32(flags)?;
                writer.put_u32(u32::from(caps.dialect()))?;
                writer.put_bytes(caps.bytes())?;
            }
            FsOperation::PutVnode => {
                let node = NodeHandle(need(args.fetch_u64())?);
                volume.write_vnode(node, Self::reenter(header))?;
            }
            FsOperation::RemoveVnode => {
                let node = NodeHandle(need(args.fetch_u64())?);
                volume.remove_vnode(node, Self::reenter(header))?;
            }
            FsOperation::CanPage => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let can = volume.can_page(node, cookie)?;
                writer.put_u8(can as u8)?;
            }
            FsOperation::ReadPages => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let pos = need(args.fetch_i64())?;
                let size = need(args.fetch_u32())? as usize;
                let mut data = vec![0u8; size.min(payload_limit)];
                let read = volume.read_pages(node, cookie, pos, &mut data)?;
                writer.put_bytes(&data[..read])?;
            }
            FsOperation::WritePages => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let pos = need(args.fetch_i64())?;
                let data = need(args.fetch_bytes())?;
                let written = volume.write_pages(node, cookie, pos, data)?;
                writer.put_u64(written as u64)?;
            }
            FsOperation::Ioctl => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let command = need(args.fetch_u32())?;
                let mut buffer = need(args.fetch_bytes())?.to_vec();
                volume.ioctl(node, cookie, command, &mut buffer)?;
                writer.put_bytes(&buffer)?;
            }
            FsOperation::SetFlags => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let flags = need(args.fetch_i32())?;
                volume.set_flags(node, cookie, flags)?;
            }
            FsOperation::Select => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let event = need(args.fetch_u8())?;
                let sync = need(args.fetch_u64())?;
                volume.select(node, cookie, event, sync)?;
            }
            FsOperation::Deselect => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let event = need(args.fetch_u8())?;
                let sync = need(args.fetch_u64())?;
                volume.deselect(node, cookie, event, sync)?;
            }
            FsOperation::Fsync => {
                let node = NodeHandle(need(args.fetch_u64())?);
                volume.fsync(node)?;
            }
            FsOperation::ReadSymlink => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let size = need(args.fetch_u32())? as usize;
                let mut data = vec![0u8; size.min(payload_limit)];
                let read = volume.read_symlink(node, &mut data)?;
                writer.put_bytes(&data[..read])?;
            }
            FsOperation::CreateSymlink => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let target = need(args.fetch_str())?;
                let mode = need(args.fetch_i32())?;
                volume.create_symlink(dir, name, target, mode)?;
            }
            FsOperation::Link => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let node = NodeHandle(need(args.fetch_u64())?);
                volume.link(dir, name, node)?;
            }
            FsOperation::Unlink => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                volume.unlink(dir, name)?;
            }
            FsOperation::Rename => {
                let old_dir = NodeHandle(need(args.fetch_u64())?);
                let old_name = need(args.fetch_str())?.to_string();
                let new_dir = NodeHandle(need(args.fetch_u64())?);
                let new_name = need(args.fetch_str())?;
                volume.rename(old_dir, &old_name, new_dir, new_name)?;
            }
            FsOperation::Access => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let mode = need(args.fetch_i32())?;
                volume.access(node, mode)?;
            }
            FsOperation::ReadStat => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let stat = volume.read_stat(node)?;
                writer.put(&WireStat::from(&stat))?;
            }
            FsOperation::WriteStat => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let stat = NodeStat::from(need(args.fetch::<WireStat>())?);
                let mask = StatMask::from_bits_truncate(need(args.fetch_u32())?);
                volume.write_stat(node, &stat, mask)?;
            }
            FsOperation::Create => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let open_mode = need(args.fetch_i32())?;
                let perms = need(args.fetch_u32())?;
                let (id, cookie) = volume.create(dir, name, open_mode, perms)?;
                writer.put_u64(id.0)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::Open => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let open_mode = need(args.fetch_i32())?;
                let cookie = volume.open(node, open_mode)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::Close => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.close(node, cookie)?;
            }
            FsOperation::FreeCookie => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.free_cookie(node, cookie)?;
            }
            FsOperation::Read => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let pos = need(args.fetch_i64())?;
                let size = need(args.fetch_u32())? as usize;
                let mut data = vec![0u8; size.min(payload_limit)];
                let read = volume.read(node, cookie, pos, &mut data)?;
                writer.put_bytes(&data[..read])?;
            }
            FsOperation::Write => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let pos = need(args.fetch_i64())?;
                let data = need(args.fetch_bytes())?;
                let written = volume.write(node, cookie, pos, data)?;
                writer.put_u64(written as u64)?;
            }
            FsOperation::CreateDir => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let perms = need(args.fetch_u32())?;
                volume.create_dir(dir, name, perms)?;
            }
            FsOperation::RemoveDir => {
                let dir = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                volume.remove_dir(dir, name)?;
            }
            FsOperation::OpenDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = volume.open_dir(node)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::CloseDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.close_dir(node, cookie)?;
            }
            FsOperation::FreeDirCookie => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.free_dir_cookie(node, cookie)?;
            }
            FsOperation::ReadDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let buffer_size = need(args.fetch_u32())? as usize;
                let count = need(args.fetch_u32())?;
                let entries = volume.read_dir(node, cookie, count)?;
                Self::put_entries(&mut writer, &entries, buffer_size.min(payload_limit))?;
            }
            FsOperation::RewindDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.rewind_dir(node, cookie)?;
            }
            FsOperation::OpenAttrDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = volume.open_attr_dir(node)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::CloseAttrDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.close_attr_dir(node, cookie)?;
            }
            FsOperation::FreeAttrDirCookie => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.free_attr_dir_cookie(node, cookie)?;
            }
            FsOperation::ReadAttrDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let buffer_size = need(args.fetch_u32())? as usize;
                let count = need(args.fetch_u32())?;
                let entries = volume.read_attr_dir(node, cookie, count)?;
                Self::put_entries(&mut writer, &entries, buffer_size.min(payload_limit))?;
            }
            FsOperation::RewindAttrDir => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.rewind_attr_dir(node, cookie)?;
            }
            FsOperation::CreateAttr => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let type_code = need(args.fetch_u32())?;
                let open_mode = need(args.fetch_i32())?;
                let cookie = volume.create_attr(node, name, type_code, open_mode)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::OpenAttr => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                let open_mode = need(args.fetch_i32())?;
                let cookie = volume.open_attr(node, name, open_mode)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::CloseAttr => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.close_attr(node, cookie)?;
            }
            FsOperation::FreeAttrCookie => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.free_attr_cookie(node, cookie)?;
            }
            FsOperation::ReadAttr => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let pos = need(args.fetch_i64())?;
                let size = need(args.fetch_u32())? as usize;
                let mut data = vec![0u8; size.min(payload_limit)];
                let read = volume.read_attr(node, cookie, pos, &mut data)?;
                writer.put_bytes(&data[..read])?;
            }
            FsOperation::WriteAttr => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let pos = need(args.fetch_i64())?;
                let data = need(args.fetch_bytes())?;
                let written = volume.write_attr(node, cookie, pos, data)?;
                writer.put_u64(written as u64)?;
            }
            FsOperation::ReadAttrStat => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let stat = volume.read_attr_stat(node, cookie)?;
                writer.put(&WireStat::from(&stat))?;
            }
            FsOperation::WriteAttrStat => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let cookie = CookieId(need(args.fetch_u32())?);
                let stat = NodeStat::from(need(args.fetch::<WireStat>())?);
                let mask = StatMask::from_bits_truncate(need(args.fetch_u32())?);
                volume.write_attr_stat(node, cookie, &stat, mask)?;
            }
            FsOperation::RenameAttr => {
                let old_node = NodeHandle(need(args.fetch_u64())?);
                let old_name = need(args.fetch_str())?.to_string();
                let new_node = NodeHandle(need(args.fetch_u64())?);
                let new_name = need(args.fetch_str())?;
                volume.rename_attr(old_node, &old_name, new_node, new_name)?;
            }
            FsOperation::RemoveAttr => {
                let node = NodeHandle(need(args.fetch_u64())?);
                let name = need(args.fetch_str())?;
                volume.remove_attr(node, name)?;
            }
            FsOperation::OpenIndexDir => {
                let cookie = volume.open_index_dir()?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::CloseIndexDir => {
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.close_index_dir(cookie)?;
            }
            FsOperation::FreeIndexDirCookie => {
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.free_index_dir_cookie(cookie)?;
            }
            FsOperation::ReadIndexDir => {
                let cookie = CookieId(need(args.fetch_u32())?);
                let buffer_size = need(args.fetch_u32())? as usize;
                let count = need(args.fetch_u32())?;
                let entries = volume.read_index_dir(cookie, count)?;
                Self::put_entries(&mut writer, &entries, buffer_size.min(payload_limit))?;
            }
            FsOperation::RewindIndexDir => {
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.rewind_index_dir(cookie)?;
            }
            FsOperation::CreateIndex => {
                let name = need(args.fetch_str())?;
                let type_code = need(args.fetch_u32())?;
                let flags = need(args.fetch_u32())?;
                volume.create_index(name, type_code, flags)?;
            }
            FsOperation::RemoveIndex => {
                let name = need(args.fetch_str())?;
                volume.remove_index(name)?;
            }
            FsOperation::ReadIndexStat => {
                let name = need(args.fetch_str())?;
                let info = volume.read_index_stat(name)?;
                writer.put(&WireIndexInfo::from(&info))?;
            }
            FsOperation::OpenQuery => {
                let query = need(args.fetch_str())?;
                let flags = need(args.fetch_u32())?;
                let reply_port = need(args.fetch_u32())?;
                let token = need(args.fetch_u32())?;
                let cookie = volume.open_query(query, flags, reply_port, token)?;
                writer.put_u32(cookie.0)?;
            }
            FsOperation::CloseQuery => {
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.close_query(cookie)?;
            }
            FsOperation::FreeQueryCookie => {
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.free_query_cookie(cookie)?;
            }
            FsOperation::ReadQuery => {
                let cookie = CookieId(need(args.fetch_u32())?);
                let buffer_size = need(args.fetch_u32())? as usize;
                let count = need(args.fetch_u32())?;
                let entries = volume.read_query(cookie, count)?;
                Self::put_entries(&mut writer, &entries, buffer_size.min(payload_limit))?;
            }
            FsOperation::RewindQuery => {
                let cookie = CookieId(need(args.fetch_u32())?);
                volume.rewind_query(cookie)?;
            }
        }

        Ok(writer.finish(0))
    }

    // Serializes as many entries as fit into `buffer_size` bytes, preceded
    // by the delivered count.
    fn put_entries(
        writer: &mut ReplyWriter<'_>,
        entries: &[crate::types::DirEntry],
        buffer_size: usize,
    ) -> FsResult<()> {
        let mut deliverable = 0;
        let mut used = 0;
        for entry in entries {
            let needed = 8 + 8 + 4 + entry.name.len();
            if used + needed > buffer_size {
                break;
            }
            used += needed;
            deliverable += 1;
        }
        writer.put_u32(deliverable as u32)?;
        for entry in &entries[..deliverable] {
            writer.put_u64(entry.dev)?;
            writer.put_u64(entry.ino)?;
            writer.put_str(&entry.name)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("file_system", &self.file_system.name())
            .finish()
    }
}
