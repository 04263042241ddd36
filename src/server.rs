//! Server lifecycle: load one driver, bring up the cache, ports and
//! workers, register with the dispatcher, and tear everything down in
//! reverse.

use std::time::Duration;

use log::error;
use log::info;
use log::warn;
use std::sync::Arc;

use crate::cache;
use crate::dispatcher::register_with_dispatcher;
use crate::dispatcher::FsRegistration;
use crate::driver::Registry;
use crate::error::FsError;
use crate::error::FsResult;
use crate::file_system::FileSystem;
use crate::port::default_capacity;
use crate::port::Port;
use crate::port::PortInfo;
use crate::request_thread::RequestThread;
use crate::settings::debugger;
use crate::settings::settings;

/// Number of request worker threads per server.
pub const REQUEST_THREAD_COUNT: usize = 10;

/// Size of the shared block cache in blocks.
const MAX_BLOCK_CACHE_BLOCKS: usize = 16384;

/// One server process: a loaded driver and the machinery serving it.
pub struct Server {
    file_system: Arc<FileSystem>,
    threads: Vec<RequestThread>,
    notification_port: Arc<Port>,
    cache_installed: bool,
    torn_down: bool,
}

impl Server {
    /// Loads `driver_name` from the driver registry and brings the server
    /// up to the point where workers only wait for [`Server::start`].
    pub fn init(driver_name: &str) -> FsResult<Server> {
        // Load the driver and run its module init.
        let driver = Registry::global().load(driver_name).ok_or_else(|| {
            error!("no driver registered under {:?}", driver_name);
            FsError::BadRequest
        })?;
        let file_system = FileSystem::new(driver_name, driver)?;

        // The block cache is shared by every volume of this process.
        let cache_installed = match cache::init_global(MAX_BLOCK_CACHE_BLOCKS) {
            Ok(()) => true,
            Err(_) => {
                info!("block cache already installed, reusing it");
                false
            }
        };

        let notification_port = Arc::new(Port::new(default_capacity()));
        file_system.set_notification_port(notification_port.clone());

        // Workers spawn suspended; they start serving only after
        // registration so the dispatcher sees every port first.
        let mut threads = Vec::with_capacity(REQUEST_THREAD_COUNT);
        for _ in 0..REQUEST_THREAD_COUNT {
            threads.push(RequestThread::new(file_system.clone(), default_capacity())?);
        }

        if settings().shall_enter_debugger() {
            debugger("File system ready to use.");
        }

        Ok(Server {
            file_system,
            threads,
            notification_port,
            cache_installed,
            torn_down: false,
        })
    }

    /// The served file system.
    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.file_system
    }

    /// Port identifications: the notification port first, then one per
    /// worker.
    pub fn port_infos(&self) -> Vec<PortInfo> {
        let mut infos = vec![*self.notification_port.info()];
        infos.extend(self.threads.iter().map(|thread| *thread.port_info()));
        infos
    }

    /// The registration record describing this server.
    pub fn registration(&self) -> FsRegistration {
        FsRegistration {
            name: self.file_system.name().to_string(),
            capabilities: *self.file_system.capabilities(),
            port_infos: self.port_infos(),
            team: std::process::id(),
        }
    }

    /// Registers this server with the dispatcher reachable through `port`.
    pub fn register_with(&self, port: &Port, timeout: Option<Duration>) -> FsResult<()> {
        register_with_dispatcher(port, &self.registration(), timeout)
    }

    /// Releases the workers into their serve loops.
    pub fn start(&self) {
        for thread in &self.threads {
            thread.run();
        }
        info!(
            "serving {} on {} worker ports",
            self.file_system.name(),
            self.threads.len()
        );
    }

    /// Blocks until every worker has exited.
    pub fn run(&mut self) {
        for thread in &mut self.threads {
            thread.terminate();
        }
    }

    /// Tears the server down: close worker ports (waking blocked
    /// receives), join the workers, close the notification port, shut the
    /// cache down, unload the driver.
    pub fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        for thread in &self.threads {
            thread.prepare_termination();
        }
        for thread in &mut self.threads {
            thread.terminate();
        }
        self.notification_port.close();

        if self.file_system.volume_count() > 0 {
            warn!(
                "shutting down with {} volume(s) still mounted",
                self.file_system.volume_count()
            );
        }

        if self.cache_installed {
            cache::shutdown_global();
        }
        self.file_system.uninit();
        info!("server for {} shut down", self.file_system.name());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("file_system", &self.file_system.name())
            .field("threads", &self.threads.len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}
