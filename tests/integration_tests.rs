//! End-to-end scenarios: a full server with worker threads, driven from
//! the kernel side of the port transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fshost::driver::Registry;
use fshost::wire::parse_reply;
use fshost::wire::ArgumentIterator;
use fshost::wire::FrameBuilder;
use fshost::wire::RequestFlags;
use fshost::CapabilitySet;
use fshost::Dialect;
use fshost::DirEntry;
use fshost::Driver;
use fshost::DriverCookie;
use fshost::DriverVolume;
use fshost::FsError;
use fshost::FsOperation;
use fshost::FsResult;
use fshost::NodeHandle;
use fshost::NodeId;
use fshost::NodeStat;
use fshost::Port;
use fshost::Server;
use fshost::VolumeId;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

// A stub driver whose root directory lists ".", ".." and "hello". The
// rename slot is deliberately absent.
#[derive(Default)]
struct FakeState {
    next_cookie: u64,
    dir_positions: HashMap<u64, usize>,
}

#[derive(Default)]
struct FakeFs {
    state: Mutex<FakeState>,
}

const DIR_ENTRIES: [&str; 3] = [".", "..", "hello"];

impl Driver for FakeFs {
    fn capabilities(&self) -> CapabilitySet {
        let mut caps = CapabilitySet::new(Dialect::Current);
        for op in [
            FsOperation::Mount,
            FsOperation::Unmount,
            FsOperation::GetVnode,
            FsOperation::PutVnode,
            FsOperation::ReadStat,
            FsOperation::OpenDir,
            FsOperation::CloseDir,
            FsOperation::FreeDirCookie,
            FsOperation::ReadDir,
            FsOperation::RewindDir,
        ] {
            caps.set(op, true);
        }
        caps
    }

    fn mount(
        &self,
        _id: VolumeId,
        _device: &str,
        _flags: u32,
        _parameters: &str,
    ) -> FsResult<(DriverVolume, NodeId)> {
        Ok((DriverVolume(1), NodeId(1)))
    }

    fn unmount(&self, _volume: DriverVolume) -> FsResult<()> {
        Ok(())
    }

    fn read_vnode(&self, _v: DriverVolume, id: NodeId, _reenter: bool) -> FsResult<NodeHandle> {
        Ok(NodeHandle(id.0))
    }

    fn write_vnode(&self, _v: DriverVolume, _node: NodeHandle, _reenter: bool) -> FsResult<()> {
        Ok(())
    }

    fn read_stat(&self, _v: DriverVolume, node: NodeHandle) -> FsResult<NodeStat> {
        Ok(NodeStat {
            ino: node.0,
            mode: libc::S_IFDIR | 0o755,
            nlink: 1,
            ..NodeStat::default()
        })
    }

    fn open_dir(&self, _v: DriverVolume, _node: NodeHandle) -> FsResult<DriverCookie> {
        let mut state = self.state.lock();
        state.next_cookie += 1;
        let cookie = state.next_cookie;
        state.dir_positions.insert(cookie, 0);
        Ok(DriverCookie(cookie))
    }

    fn close_dir(&self, _v: DriverVolume, _node: NodeHandle, _cookie: DriverCookie) -> FsResult<()> {
        Ok(())
    }

    fn free_dir_cookie(
        &self,
        _v: DriverVolume,
        _node: NodeHandle,
        cookie: DriverCookie,
    ) -> FsResult<()> {
        self.state.lock().dir_positions.remove(&cookie.0);
        Ok(())
    }

    fn read_dir(
        &self,
        _v: DriverVolume,
        node: NodeHandle,
        cookie: DriverCookie,
        count: u32,
    ) -> FsResult<Vec<DirEntry>> {
        let mut state = self.state.lock();
        let position = state
            .dir_positions
            .get_mut(&cookie.0)
            .ok_or(FsError::BadRequest)?;
        let mut entries = Vec::new();
        while entries.len() < count as usize && *position < DIR_ENTRIES.len() {
            entries.push(DirEntry {
                dev: 0,
                ino: node.0,
                name: DIR_ENTRIES[*position].to_string(),
            });
            *position += 1;
        }
        Ok(entries)
    }

    fn rewind_dir(&self, _v: DriverVolume, _node: NodeHandle, cookie: DriverCookie) -> FsResult<()> {
        let mut state = self.state.lock();
        *state
            .dir_positions
            .get_mut(&cookie.0)
            .ok_or(FsError::BadRequest)? = 0;
        Ok(())
    }
}

struct KernelSide {
    port: Port,
}

impl KernelSide {
    fn attach(server: &Server, worker: usize) -> KernelSide {
        // Port 0 is the notification port; workers follow.
        let infos = server.port_infos();
        KernelSide {
            port: Port::from_info(&infos[1 + worker]).unwrap(),
        }
    }

    fn call(&self, frame: Vec<u8>) -> (i32, Vec<u8>) {
        self.port.send(&frame).unwrap();
        let reply = self.port.receive(Some(RECEIVE_TIMEOUT)).unwrap();
        let (_op, status, mut args) = parse_reply(&reply).unwrap();
        (status, args.fetch_all().to_vec())
    }

    fn mount(&self, volume: u64, device: &str) -> (i32, Option<u64>) {
        let mut frame =
            FrameBuilder::request(u32::from(FsOperation::Mount), RequestFlags::empty(), 0);
        frame.put_u64(volume).put_str(device).put_u32(0).put_str("");
        let (status, out) = self.call(frame.finish());
        let root = if status == 0 {
            ArgumentIterator::new(&out).fetch_u64()
        } else {
            None
        };
        (status, root)
    }

    fn get_vnode(&self, volume: u64, id: u64) -> u64 {
        let mut frame =
            FrameBuilder::request(u32::from(FsOperation::GetVnode), RequestFlags::empty(), volume);
        frame.put_u64(id);
        let (status, out) = self.call(frame.finish());
        assert_eq!(status, 0);
        let mut args = ArgumentIterator::new(&out);
        let node = args.fetch_u64().unwrap();
        let mode = args.fetch_u32().unwrap();
        assert_eq!(mode & libc::S_IFMT, libc::S_IFDIR);
        node
    }

    fn open_dir(&self, volume: u64, node: u64) -> u32 {
        let mut frame =
            FrameBuilder::request(u32::from(FsOperation::OpenDir), RequestFlags::empty(), volume);
        frame.put_u64(node);
        let (status, out) = self.call(frame.finish());
        assert_eq!(status, 0);
        ArgumentIterator::new(&out).fetch_u32().unwrap()
    }

    fn read_dir(&self, volume: u64, node: u64, cookie: u32) -> Vec<String> {
        let mut frame =
            FrameBuilder::request(u32::from(FsOperation::ReadDir), RequestFlags::empty(), volume);
        frame.put_u64(node).put_u32(cookie).put_u32(1024).put_u32(1);
        let (status, out) = self.call(frame.finish());
        assert_eq!(status, 0);
        let mut args = ArgumentIterator::new(&out);
        let count = args.fetch_u32().unwrap();
        let mut names = Vec::new();
        for _ in 0..count {
            let _dev = args.fetch_u64().unwrap();
            let _ino = args.fetch_u64().unwrap();
            names.push(args.fetch_str().unwrap().to_string());
        }
        names
    }

    fn simple_dir_op(&self, op: FsOperation, volume: u64, node: u64, cookie: u32) -> i32 {
        let mut frame = FrameBuilder::request(u32::from(op), RequestFlags::empty(), volume);
        frame.put_u64(node).put_u32(cookie);
        self.call(frame.finish()).0
    }

    fn unmount(&self, volume: u64) -> i32 {
        let frame =
            FrameBuilder::request(u32::from(FsOperation::Unmount), RequestFlags::empty(), volume);
        self.call(frame.finish()).0
    }
}

#[test]
fn mount_list_unmount_round_trip() {
    Registry::global().register("fakefs-s1", Arc::new(FakeFs::default()));
    let mut server = Server::init("fakefs-s1").unwrap();
    server.start();
    let kernel = KernelSide::attach(&server, 0);

    let (status, root) = kernel.mount(1, "/dev/fake");
    assert_eq!(status, 0);
    assert_eq!(root, Some(1));

    let node = kernel.get_vnode(1, 1);
    let cookie = kernel.open_dir(1, node);

    assert_eq!(kernel.read_dir(1, node, cookie), vec!["."]);
    assert_eq!(kernel.read_dir(1, node, cookie), vec![".."]);
    assert_eq!(kernel.read_dir(1, node, cookie), vec!["hello"]);
    assert_eq!(kernel.read_dir(1, node, cookie), Vec::<String>::new());

    assert_eq!(kernel.simple_dir_op(FsOperation::CloseDir, 1, node, cookie), 0);
    assert_eq!(
        kernel.simple_dir_op(FsOperation::FreeDirCookie, 1, node, cookie),
        0
    );

    let volume = server.file_system().volume_by_id(VolumeId(1)).unwrap();
    assert_eq!(volume.cookie_count(), 0);
    drop(volume);

    assert_eq!(kernel.unmount(1), 0);
    assert!(server.file_system().volume_by_id(VolumeId(1)).is_none());

    server.shutdown();
}

#[test]
fn unsupported_rename_is_gated() {
    Registry::global().register("fakefs-s2", Arc::new(FakeFs::default()));
    let mut server = Server::init("fakefs-s2").unwrap();
    server.start();
    let kernel = KernelSide::attach(&server, 1);

    let (status, _) = kernel.mount(2, "/dev/fake");
    assert_eq!(status, 0);

    let mut frame =
        FrameBuilder::request(u32::from(FsOperation::Rename), RequestFlags::empty(), 2);
    frame.put_u64(1).put_str("/a").put_u64(1).put_str("/b");
    let (status, _) = kernel.call(frame.finish());
    assert_eq!(status, FsError::UnsupportedOperation.to_status());

    assert_eq!(kernel.unmount(2), 0);
    server.shutdown();
}

#[test]
fn requests_on_one_port_are_served_in_order() {
    Registry::global().register("fakefs-s3", Arc::new(FakeFs::default()));
    let mut server = Server::init("fakefs-s3").unwrap();
    server.start();
    let kernel = KernelSide::attach(&server, 2);

    let (status, _) = kernel.mount(3, "/dev/fake");
    assert_eq!(status, 0);
    let node = kernel.get_vnode(3, 1);
    let cookie = kernel.open_dir(3, node);

    // Three pipelined read_dir requests come back in send order.
    for _ in 0..3 {
        let mut frame =
            FrameBuilder::request(u32::from(FsOperation::ReadDir), RequestFlags::empty(), 3);
        frame.put_u64(node).put_u32(cookie).put_u32(1024).put_u32(1);
        kernel.port.send(&frame.finish()).unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let reply = kernel.port.receive(Some(RECEIVE_TIMEOUT)).unwrap();
        let (_op, status, mut args) = parse_reply(&reply).unwrap();
        assert_eq!(status, 0);
        assert_eq!(args.fetch_u32(), Some(1));
        let _dev = args.fetch_u64().unwrap();
        let _ino = args.fetch_u64().unwrap();
        seen.push(args.fetch_str().unwrap().to_string());
    }
    assert_eq!(seen, vec![".", "..", "hello"]);

    assert_eq!(kernel.unmount(3), 0);
    server.shutdown();
}

#[test]
fn shutdown_wakes_the_kernel_side() {
    Registry::global().register("fakefs-s4", Arc::new(FakeFs::default()));
    let mut server = Server::init("fakefs-s4").unwrap();
    server.start();
    let kernel = KernelSide::attach(&server, 3);

    server.shutdown();
    assert_eq!(
        kernel.port.receive(Some(RECEIVE_TIMEOUT)),
        Err(FsError::TransportClosed)
    );
}

#[test]
fn malformed_and_unknown_frames_answer_bad_request() {
    Registry::global().register("fakefs-s5", Arc::new(FakeFs::default()));
    let mut server = Server::init("fakefs-s5").unwrap();
    server.start();
    let kernel = KernelSide::attach(&server, 4);

    // Unknown operation code.
    let frame = FrameBuilder::request(0xdead, RequestFlags::empty(), 0).finish();
    let (status, _) = kernel.call(frame);
    assert_eq!(status, FsError::BadRequest.to_status());

    // Known op against a volume that does not exist.
    let frame =
        FrameBuilder::request(u32::from(FsOperation::Sync), RequestFlags::empty(), 99).finish();
    let (status, _) = kernel.call(frame);
    assert_eq!(status, FsError::BadRequest.to_status());

    server.shutdown();
}
