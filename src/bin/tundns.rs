/*   Copyright 2024 Perry Lorier
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 *
 *  SPDX-License-Identifier: Apache-2.0
 *
 *  Thin wrapper to run the tunnel on a tun descriptor inherited from the host.
 */
use std::os::fd::{FromRawFd as _, RawFd};
use std::sync::Arc;

extern crate tundns;

use tundns::filter::blockade::StaticBlockade;
use tundns::filter::requestlog::{MemoryRequestLog, DEFAULT_CAPACITY};
use tundns::tunnel::{forwarder::Forwarder, TunnelEventLoop};

enum Error {
    Config(tundns::config::Error),
    BadDescriptor(String),
    Thread(std::io::Error),
    Panicked,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Error::*;
        match self {
            Config(e) => write!(f, "Failed to load config: {}", e),
            BadDescriptor(fd) => write!(f, "Invalid tun descriptor: {}", fd),
            Thread(e) => write!(f, "Failed to start tunnel thread: {}", e),
            Panicked => write!(f, "Tunnel thread panicked"),
        }
    }
}

fn go() -> Result<(), Error> {
    let args: Vec<_> = std::env::args_os().collect();
    if args.len() != 3 {
        println!("Usage: {} <configfile> <tun-fd>", args[0].to_string_lossy());
        return Ok(());
    }
    let config_file = std::path::Path::new(&args[1]);
    let fd_arg = args[2].to_string_lossy();
    let fd: RawFd = match fd_arg.parse() {
        Ok(fd) if fd >= 0 => fd,
        _ => return Err(Error::BadDescriptor(fd_arg.into_owned())),
    };

    let conf = tundns::config::load_config_from_path(config_file).map_err(Error::Config)?;
    log::debug!("Configuration: {:?}", conf);

    let blockade = Arc::new(StaticBlockade::new(&conf.allow, &conf.deny));
    let requests = Arc::new(MemoryRequestLog::new(DEFAULT_CAPACITY));
    /* SAFETY: the host hands us ownership of this descriptor on the command line. */
    let device = unsafe { std::fs::File::from_raw_fd(fd) };

    let mut tunnel = TunnelEventLoop::new(
        device,
        &conf.settings(),
        blockade,
        requests.clone(),
        Forwarder::new(&conf.forwarder),
    );
    let thread = std::thread::Builder::new()
        .name("dns-tunnel".into())
        .spawn(move || tunnel.run_with_retry())
        .map_err(Error::Thread)?;
    thread.join().map_err(|_| Error::Panicked)?;
    log::info!("Tunnel stopped, {} queries blocked", requests.blocked_count());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("tundns {}", env!("CARGO_PKG_VERSION"));
    match go() {
        Ok(()) => (),
        Err(x) => {
            println!("Error: {}", x);
            std::process::exit(1);
        }
    }
}
