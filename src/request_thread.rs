//! Request worker threads and the thread-local request context.
//!
//! Each worker owns one port and serves the requests arriving on it
//! strictly in order. The worker publishes its current request context in
//! thread-local storage as a stack: when a driver re-enters the server
//! from within an operation, the nested handling sees its parent's volume
//! and both unwind in order.

use std::cell::RefCell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::FsError;
use crate::error::FsResult;
use crate::file_system::FileSystem;
use crate::handler::RequestHandler;
use crate::port::Port;
use crate::port::PortCloser;
use crate::port::PortInfo;
use crate::volume::Volume;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Arc<Volume>>> = const { RefCell::new(Vec::new()) };
}

/// Scope marker for one request being served on the current thread.
///
/// Creating a context pushes the volume onto the thread's context stack;
/// dropping it pops. Nested requests stack.
#[derive(Debug)]
pub struct RequestContext {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl RequestContext {
    /// Enters a request against `volume` on the current thread.
    pub fn new(volume: Arc<Volume>) -> RequestContext {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(volume));
        RequestContext {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The volume of the innermost request on the current thread, if any.
pub fn current_volume() -> Option<Arc<Volume>> {
    CONTEXT_STACK.with(|stack| stack.borrow().last().cloned())
}

/// How deeply requests are nested on the current thread.
pub fn context_depth() -> usize {
    CONTEXT_STACK.with(|stack| stack.borrow().len())
}

struct StartGate {
    released: Mutex<bool>,
    condvar: Condvar,
}

impl StartGate {
    fn new() -> Arc<StartGate> {
        Arc::new(StartGate {
            released: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.condvar.wait(&mut released);
        }
    }

    fn release(&self) {
        *self.released.lock() = true;
        self.condvar.notify_all();
    }
}

/// One worker: a port, a thread, and the machinery to stop both.
///
/// The thread is spawned suspended; it starts serving once [`run`] releases
/// it, which lets the server register all ports with the dispatcher before
/// the first request can arrive.
///
/// [`run`]: RequestThread::run
pub struct RequestThread {
    info: PortInfo,
    closer: PortCloser,
    gate: Arc<StartGate>,
    terminating: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RequestThread {
    /// Creates the worker's port and spawns its (suspended) thread.
    pub fn new(file_system: Arc<FileSystem>, capacity: usize) -> FsResult<RequestThread> {
        let port = Port::new(capacity);
        let info = *port.info();
        let closer = port.closer();
        let gate = StartGate::new();
        let terminating = Arc::new(AtomicBool::new(false));

        let thread_gate = gate.clone();
        let thread_terminating = terminating.clone();
        let handle = std::thread::Builder::new()
            .name("request thread".to_string())
            .spawn(move || thread_loop(port, file_system, thread_gate, thread_terminating))
            .map_err(|_| FsError::OutOfMemory)?;

        Ok(RequestThread {
            info,
            closer,
            gate,
            terminating,
            handle: Some(handle),
        })
    }

    /// The worker port's identification.
    pub fn port_info(&self) -> &PortInfo {
        &self.info
    }

    /// Releases the suspended thread into its serve loop.
    pub fn run(&self) {
        self.gate.release();
    }

    /// Flags termination and closes the port, waking a blocked receive.
    /// Idempotent.
    pub fn prepare_termination(&self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closer.close();
        self.gate.release();
    }

    /// Joins the worker thread.
    pub fn terminate(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RequestThread {
    fn drop(&mut self) {
        self.prepare_termination();
        self.terminate();
    }
}

impl std::fmt::Debug for RequestThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestThread")
            .field("info", &self.info)
            .field("terminating", &self.terminating.load(Ordering::Relaxed))
            .finish()
    }
}

fn thread_loop(
    mut port: Port,
    file_system: Arc<FileSystem>,
    gate: Arc<StartGate>,
    terminating: Arc<AtomicBool>,
) {
    gate.wait();
    if terminating.load(Ordering::SeqCst) {
        return;
    }

    let handler = RequestHandler::new(file_system);
    loop {
        match port.receive(None) {
            Ok(frame) => {
                if let Err(err) = handler.handle(&mut port, &frame) {
                    match err {
                        FsError::TransportClosed => {
                            debug!("request thread: peer went away");
                            break;
                        }
                        other => {
                            error!("request thread: reply failed: {}", other);
                            break;
                        }
                    }
                }
            }
            Err(FsError::TransportClosed) => {
                debug!("request thread: port closed, exiting");
                break;
            }
            Err(err) => {
                error!("request thread: receive failed: {}", err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capabilities::CapabilitySet;
    use crate::capabilities::Dialect;
    use crate::driver::Driver;
    use crate::types::VolumeId;

    struct NullDriver;

    impl Driver for NullDriver {
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new(Dialect::Current)
        }
    }

    #[test]
    fn contexts_nest_and_unwind() {
        let fs = FileSystem::new("null", Arc::new(NullDriver)).unwrap();
        let outer_volume = fs.create_volume(VolumeId(1));
        let inner_volume = fs.create_volume(VolumeId(2));

        assert!(current_volume().is_none());
        {
            let _outer = RequestContext::new(outer_volume.clone());
            assert_eq!(context_depth(), 1);
            assert_eq!(current_volume().unwrap().id(), VolumeId(1));
            {
                let _inner = RequestContext::new(inner_volume.clone());
                assert_eq!(context_depth(), 2);
                assert_eq!(current_volume().unwrap().id(), VolumeId(2));
            }
            assert_eq!(current_volume().unwrap().id(), VolumeId(1));
        }
        assert_eq!(context_depth(), 0);
    }

    #[test]
    fn context_is_thread_local() {
        let fs = FileSystem::new("null", Arc::new(NullDriver)).unwrap();
        let volume = fs.create_volume(VolumeId(1));
        let _context = RequestContext::new(volume);
        std::thread::spawn(|| {
            assert!(current_volume().is_none());
        })
        .join()
        .unwrap();
        assert_eq!(context_depth(), 1);
    }
}
