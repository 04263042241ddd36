//! The file-system server executable.
//!
//! Runs the userland server for a given file system. Typically this is
//! done by the dispatcher when a volume is requested to be mounted, but
//! running the server manually can be useful for debugging.

use std::process::ExitCode;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use log::debug;
use log::info;

use fshost::settings::settings;
use fshost::Port;
use fshost::PortInfo;
use fshost::Server;

#[derive(Debug, Parser)]
#[command(
    name = "fshost-server",
    about = "Serves a userland file-system driver to the kernel",
    after_help = "The <file-system> argument names the driver to load. <port> should not be \
                  given when starting the server manually; it is used by the dispatcher only."
)]
struct Args {
    /// Enter the debugger once the file system is loaded and ready.
    #[arg(long)]
    debug: bool,

    /// Name of the file-system driver to serve.
    file_system: String,

    /// Registration port handle, passed by the dispatcher.
    port: Option<u32>,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    settings().set_enter_debugger(args.debug);

    let mut server = match Server::init(&args.file_system) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Failed to load file system {}: {}", args.file_system, err);
            return ExitCode::from(1);
        }
    };

    // When the dispatcher spawned us, it told us where to register. The
    // client handle and capacity of a registration port follow its owner
    // handle by convention.
    if let Some(handle) = args.port {
        let info = PortInfo {
            owner: handle,
            client: handle + 1,
            capacity: fshost::default_capacity() as u32,
        };
        match Port::from_info(&info) {
            Ok(port) => {
                if let Err(err) = server.register_with(&port, Some(Duration::from_secs(10))) {
                    eprintln!("Dispatcher registration failed: {}", err);
                    return ExitCode::from(1);
                }
                info!("registered with the dispatcher");
            }
            Err(err) => {
                debug!("cannot attach dispatcher port {}: {}", handle, err);
            }
        }
    }

    server.start();
    server.run();
    ExitCode::SUCCESS
}
