// -----------------------------------------------------------------------------
// Rust SECoP playground
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA 02111-1307 USA
//
// Module authors:
// Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! The main entry point for the server executable.

mod demos;

use clap::Parser;
use log::*;
use mlzutil::fs as fsutil;
use secop_core::registry::Registry;

#[derive(Parser)]
#[command(name = "secop-rs", version, about = "A generic SECoP server.")]
struct Args {
    /// Debug logging output?
    #[arg(short, long)]
    verbose: bool,
    /// Logging path
    #[arg(long, default_value = "log")]
    log: String,
    /// PID path
    #[arg(long, default_value = "pid")]
    pid: String,
    /// Daemonize?
    #[arg(short, long)]
    daemon: bool,
    /// User name for daemon
    #[arg(long)]
    user: Option<String>,
    /// Group name for daemon
    #[arg(long)]
    group: Option<String>,
}

fn main() {
    let args = Args::parse();

    let log_path = fsutil::abspath(&args.log);
    let pid_path = fsutil::abspath(&args.pid);
    if args.daemon {
        let mut daemon = daemonize::Daemonize::new();
        if let Some(user) = &args.user {
            daemon = daemon.user(user.as_str());
        }
        if let Some(group) = &args.group {
            daemon = daemon.group(group.as_str());
        }
        if let Err(err) = daemon.start() {
            eprintln!("could not daemonize process: {}", err);
        }
    }

    // handle SIGINT and SIGTERM
    let signals = signal_hook::iterator::Signals::new(&[
            signal_hook::consts::SIGINT,
            signal_hook::consts::SIGTERM,
    ]).expect("signal register failed");

    let name = "secop-rs";
    if let Err(err) = mlzlog::init(Some(log_path), name, false, args.verbose, !args.daemon) {
        eprintln!("could not initialize logging: {}", err);
    }
    if let Err(err) = fsutil::write_pidfile(&pid_path, name) {
        error!("could not write PID file: {}", err);
    }

    // set a panic hook to log panics into the logfile
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
                let payload = if let Some(s) = panic_info.payload().downcast_ref::<String>() {
                    s.as_str()
                } else if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
                    s
                } else {
                    "???"
                };
                if let Some(location) = panic_info.location() {
                    error!("panic: {:?} ({})", payload, location);
                } else {
                    error!("panic: {:?}", payload)
                }
                default_hook(panic_info);
    }));

    Registry::init();
    match demos::build_nodes() {
        Err(err) => error!("could not build demo nodes: {}", err),
        Ok(nodes) => {
            for node in nodes {
                let node_id = node.id().to_owned();
                std::thread::spawn(move || {
                        if let Err(err) = secop_core::worker::serve_node(node) {
                            error!("node {} stopped: {}", node_id, err);
                        }
                });
            }
            info!("server running, waiting for signals...");
            signals.forever().next();
        }
    }

    info!("quitting...");
    fsutil::remove_pidfile(pid_path, name);
}
