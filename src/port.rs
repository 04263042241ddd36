//! Port transport: paired bounded-buffer message channels.
//!
//! A port pair is the unit of communication between the kernel and one
//! worker. The owner side receives requests and sends replies; the client
//! side does the reverse. Messages are opaque byte frames up to the port's
//! capacity (one page by default); no framing beyond a leading operation
//! code is imposed here.
//!
//! `close()` is the only shutdown signal: it wakes any blocked receiver on
//! either end with [`FsError::TransportClosed`] and is idempotent.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::FsError;
use crate::error::FsResult;

/// How many frames a queue buffers before `send` blocks.
const QUEUE_DEPTH: usize = 8;

/// Identification of a port pair, exchanged during registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortInfo {
    /// Handle of the owner-side queue (requests).
    pub owner: u32,
    /// Handle of the client-side queue (replies).
    pub client: u32,
    /// Maximum frame size in bytes.
    pub capacity: u32,
}

/// Default port capacity: one page.
pub fn default_capacity() -> usize {
    page_size::get()
}

struct QueueState {
    messages: VecDeque<Vec<u8>>,
    closed: bool,
}

struct Queue {
    capacity: usize,
    state: Mutex<QueueState>,
    readers: Condvar,
    writers: Condvar,
}

impl Queue {
    fn new(capacity: usize) -> Queue {
        Queue {
            capacity,
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
        }
    }

    fn send(&self, message: &[u8]) -> FsResult<()> {
        if message.len() > self.capacity {
            return Err(FsError::BadRequest);
        }
        let mut state = self.state.lock();
        while state.messages.len() >= QUEUE_DEPTH {
            if state.closed {
                return Err(FsError::TransportClosed);
            }
            self.writers.wait(&mut state);
        }
        if state.closed {
            return Err(FsError::TransportClosed);
        }
        state.messages.push_back(message.to_vec());
        self.readers.notify_one();
        Ok(())
    }

    fn receive(&self, timeout: Option<Duration>) -> FsResult<Vec<u8>> {
        let mut state = self.state.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                self.writers.notify_one();
                return Ok(message);
            }
            if state.closed {
                return Err(FsError::TransportClosed);
            }
            match timeout {
                None => self.readers.wait(&mut state),
                Some(duration) => {
                    if self.readers.wait_for(&mut state, duration).timed_out()
                        && state.messages.is_empty()
                    {
                        if state.closed {
                            return Err(FsError::TransportClosed);
                        }
                        return Err(FsError::TimedOut);
                    }
                }
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.readers.notify_all();
        self.writers.notify_all();
    }
}

fn queue_table() -> &'static Mutex<HashMap<u32, Arc<Queue>>> {
    static TABLE: OnceLock<Mutex<HashMap<u32, Arc<Queue>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn create_queue(capacity: usize) -> (u32, Arc<Queue>) {
    static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    let queue = Arc::new(Queue::new(capacity));
    queue_table().lock().insert(handle, queue.clone());
    (handle, queue)
}

fn find_queue(handle: u32) -> Option<Arc<Queue>> {
    queue_table().lock().get(&handle).cloned()
}

/// One endpoint of a port pair.
///
/// A port belongs to exactly one thread; the buffer and reservation calls
/// are deliberately not synchronized. [`Port::close`] and the cloneable
/// [`PortCloser`] are safe from any thread.
pub struct Port {
    info: PortInfo,
    owner: bool,
    receive_queue: Arc<Queue>,
    send_queue: Arc<Queue>,
    buffer: Vec<u8>,
    reserved: usize,
}

impl Port {
    /// Creates the owner side of a new port pair with the given frame
    /// capacity.
    pub fn new(capacity: usize) -> Port {
        let (owner_handle, owner_queue) = create_queue(capacity);
        let (client_handle, client_queue) = create_queue(capacity);
        Port {
            info: PortInfo {
                owner: owner_handle,
                client: client_handle,
                capacity: capacity as u32,
            },
            owner: true,
            receive_queue: owner_queue,
            send_queue: client_queue,
            buffer: vec![0; capacity],
            reserved: 0,
        }
    }

    /// Attaches the client side of an existing pair.
    pub fn from_info(info: &PortInfo) -> FsResult<Port> {
        let owner_queue = find_queue(info.owner).ok_or(FsError::BadRequest)?;
        let client_queue = find_queue(info.client).ok_or(FsError::BadRequest)?;
        Ok(Port {
            info: *info,
            owner: false,
            receive_queue: client_queue,
            send_queue: owner_queue,
            buffer: vec![0; info.capacity as usize],
            reserved: 0,
        })
    }

    /// The pair's identification record.
    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    /// Maximum frame size in bytes.
    pub fn capacity(&self) -> usize {
        self.info.capacity as usize
    }

    /// Scratch buffer for building outgoing frames in place.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Extends the reserved span of the send buffer up to `end_offset`.
    /// Must precede the first send that writes into the span.
    pub fn reserve(&mut self, end_offset: usize) {
        debug_assert!(end_offset <= self.capacity());
        if end_offset > self.reserved {
            self.reserved = end_offset;
        }
    }

    /// Shrinks the reserved span back to `end_offset`.
    pub fn unreserve(&mut self, end_offset: usize) {
        if end_offset < self.reserved {
            self.reserved = end_offset;
        }
    }

    /// Current end of the reserved span.
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    /// Sends one frame to the peer. Blocks while the peer's receive queue
    /// is full.
    pub fn send(&self, message: &[u8]) -> FsResult<()> {
        self.send_queue.send(message)
    }

    /// Sends the first `len` bytes of the port buffer.
    pub fn send_buffer(&mut self, len: usize) -> FsResult<()> {
        if len > self.capacity() {
            return Err(FsError::BadRequest);
        }
        self.send_queue.send(&self.buffer[..len])
    }

    /// Receives one frame. `None` means block forever; otherwise the call
    /// gives up with [`FsError::TimedOut`] after `timeout`.
    pub fn receive(&self, timeout: Option<Duration>) -> FsResult<Vec<u8>> {
        self.receive_queue.receive(timeout)
    }

    /// Closes both directions, waking blocked receivers on either end.
    pub fn close(&self) {
        self.receive_queue.close();
        self.send_queue.close();
    }

    /// A handle that can close this pair from another thread.
    pub fn closer(&self) -> PortCloser {
        PortCloser {
            queues: [self.receive_queue.clone(), self.send_queue.clone()],
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.owner {
            self.close();
            let mut table = queue_table().lock();
            table.remove(&self.info.owner);
            table.remove(&self.info.client);
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("info", &self.info)
            .field("owner", &self.owner)
            .field("reserved", &self.reserved)
            .finish()
    }
}

/// Thread-safe handle for closing a port pair.
#[derive(Clone)]
pub struct PortCloser {
    queues: [Arc<Queue>; 2],
}

impl PortCloser {
    /// Closes the pair. Idempotent.
    pub fn close(&self) {
        for queue in &self.queues {
            queue.close();
        }
    }
}

impl std::fmt::Debug for PortCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PortCloser")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn echo_round_trip_preserves_order_and_bytes() {
        let server = Port::new(4096);
        let client = Port::from_info(server.info()).unwrap();

        let worker = thread::spawn(move || {
            // Echo until the pair is closed underneath us.
            while let Ok(frame) = server.receive(None) {
                if server.send(&frame).is_err() {
                    break;
                }
            }
            server
        });

        let frames: Vec<Vec<u8>> = [100usize, 4000, 50]
            .iter()
            .enumerate()
            .map(|(i, &len)| vec![i as u8 + 1; len])
            .collect();
        for frame in &frames {
            client.send(frame).unwrap();
        }
        for frame in &frames {
            let reply = client.receive(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(&reply, frame);
        }

        let server = {
            client.close();
            worker.join().unwrap()
        };
        drop(server);
        assert_eq!(
            client.receive(Some(Duration::from_millis(100))),
            Err(FsError::TransportClosed)
        );
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let server = Port::new(512);
        let client = Port::from_info(server.info()).unwrap();
        let closer = server.closer();

        let blocked = thread::spawn(move || server.receive(None));
        thread::sleep(Duration::from_millis(50));
        closer.close();
        assert_eq!(blocked.join().unwrap(), Err(FsError::TransportClosed));
        // idempotent
        closer.close();
        assert_eq!(client.receive(None), Err(FsError::TransportClosed));
    }

    #[test]
    fn receive_times_out() {
        let server = Port::new(512);
        assert_eq!(
            server.receive(Some(Duration::from_millis(20))),
            Err(FsError::TimedOut)
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let server = Port::new(64);
        let client = Port::from_info(server.info()).unwrap();
        assert_eq!(client.send(&[0u8; 65]), Err(FsError::BadRequest));
        client.send(&[0u8; 64]).unwrap();
        assert_eq!(server.receive(None).unwrap().len(), 64);
    }

    #[test]
    fn reserve_and_unreserve() {
        let mut port = Port::new(256);
        assert_eq!(port.reserved_size(), 0);
        port.reserve(128);
        port.reserve(64); // never shrinks
        assert_eq!(port.reserved_size(), 128);
        port.unreserve(32);
        assert_eq!(port.reserved_size(), 32);
        port.unreserve(64); // never grows
        assert_eq!(port.reserved_size(), 32);
    }

    #[test]
    fn no_ordering_across_ports() {
        // Two independent pairs deliver independently; draining the second
        // before the first is fine.
        let a = Port::new(512);
        let b = Port::new(512);
        let ca = Port::from_info(a.info()).unwrap();
        let cb = Port::from_info(b.info()).unwrap();
        ca.send(b"first").unwrap();
        cb.send(b"second").unwrap();
        assert_eq!(b.receive(None).unwrap(), b"second");
        assert_eq!(a.receive(None).unwrap(), b"first");
    }
}
