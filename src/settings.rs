//! Process-wide server settings.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::warn;

/// Settings shared by everything in the server process.
#[derive(Debug, Default)]
pub struct ServerSettings {
    enter_debugger: AtomicBool,
}

impl ServerSettings {
    /// Whether the server should stop for a debugger once the driver is
    /// loaded and ready.
    pub fn shall_enter_debugger(&self) -> bool {
        self.enter_debugger.load(Ordering::Relaxed)
    }

    /// Sets the debugger stop flag.
    pub fn set_enter_debugger(&self, enter: bool) {
        self.enter_debugger.store(enter, Ordering::Relaxed);
    }
}

static SETTINGS: ServerSettings = ServerSettings {
    enter_debugger: AtomicBool::new(false),
};

/// The process-wide settings.
pub fn settings() -> &'static ServerSettings {
    &SETTINGS
}

/// Stops the process for a debugger to attach.
pub fn debugger(message: &str) {
    warn!("debugger stop: {}", message);
    unsafe {
        libc::raise(libc::SIGSTOP);
    }
}
