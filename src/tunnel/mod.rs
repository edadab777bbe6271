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
 *  The event loop that drives the tunnel.
 *
 *  A single thread polls the tun device, a signal socket used to stop or wake it, and every
 *  socket with a query in flight upstream.  Each iteration first drains upstream replies, then
 *  writes at most one synthetic answer, then reads at most one packet from the device.  Any
 *  failure tears the loop down and it is restarted after a backoff.
 */
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::filter::blockade::Blockade;
use crate::filter::requestlog::RequestLog;
use crate::filter::{self, Loopback, PacketFilter, PACKETS_DROPPED};
use crate::net::packet;

pub mod forwarder;
#[cfg(test)]
mod test;

use forwarder::Forwarder;

/// Largest packet read from the device.
pub const MAX_PACKET: usize = 32767;
/// Largest upstream reply accepted.
pub const MAX_DATAGRAM: usize = 4096;
const COOLDOWN_BASE: Duration = Duration::from_millis(300);
const COOLDOWN_MAX: Duration = Duration::from_millis(3000);
const EPERM_POWERSAVE_THRESHOLD: u32 = 3;
const HOUSEKEEPING_INTERVAL: u64 = 1024;

lazy_static::lazy_static! {
    static ref TUNNEL_RESTARTS: prometheus::IntCounter =
        prometheus::register_int_counter!("tundns_tunnel_restarts",
            "Number of times the tunnel loop failed and was restarted")
        .unwrap();
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Poll(Errno),
    Forward(forwarder::Error),
    Filter(filter::Error),
}

impl Error {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            Error::Poll(errno) => Some(*errno as i32),
            Error::Forward(e) => e.raw_os_error(),
            Error::Filter(_) => None,
        }
    }

    fn is_eperm(&self) -> bool {
        self.raw_os_error() == Some(Errno::EPERM as i32)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "Tunnel device error: {}", e),
            Error::Poll(e) => write!(f, "Poll failed: {}", e),
            Error::Forward(e) => write!(f, "{}", e),
            Error::Filter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<filter::Error> for Error {
    fn from(e: filter::Error) -> Self {
        Error::Filter(e)
    }
}

/// The tun device, or anything that delivers whole IP packets one at a time.
pub trait TunDevice: AsFd {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

fn check_written(written: usize, packet: &[u8]) -> io::Result<()> {
    if written != packet.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write to device: {} of {}", written, packet.len()),
        ));
    }
    Ok(())
}

impl TunDevice for std::fs::File {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        let written = self.write(packet)?;
        check_written(written, packet)
    }
}

impl TunDevice for UnixDatagram {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        let written = self.send(packet)?;
        check_written(written, packet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The loop failed and will be restarted after `delay`.
    Restarting { delay: Duration },
    /// The OS keeps refusing to forward, most likely because the device is dozing.
    PowerSaving,
    /// Too many queries went unanswered.
    Stuck,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TunnelEvent);
}

impl<F> EventSink for F
where
    F: Fn(TunnelEvent) + Send + Sync,
{
    fn emit(&self, event: TunnelEvent) {
        self(event)
    }
}

#[derive(Default)]
struct State {
    stop_requested: bool,
    /* Write end of the signal socket while a loop is running.  Dropping it stops the loop. */
    signal: Option<UnixStream>,
    pending: Option<Settings>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Controls a running tunnel from other threads.
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<Shared>,
}

impl TunnelHandle {
    /// Stop the tunnel.  Safe to call more than once, and before the loop has started.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if !state.stop_requested {
            debug!("Stopping tunnel");
        }
        state.stop_requested = true;
        state.signal = None;
        self.shared.wake.notify_all();
    }

    /// Hand new settings to the loop, which picks them up on its next iteration.
    pub fn reconfigure(&self, settings: Settings) {
        let mut state = self.shared.lock();
        state.pending = Some(settings);
        if let Some(signal) = &state.signal {
            /* A full socket already has a wakeup queued. */
            if let Err(e) = (&*signal).write(&[1]) {
                trace!("Tunnel wakeup not sent: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stop_requested
    }
}

pub struct TunnelEventLoop<D: TunDevice> {
    device: D,
    filter: PacketFilter,
    forwarder: Forwarder,
    loopback: Loopback,
    shared: Arc<Shared>,
    events: Arc<dyn EventSink>,
    powersave: bool,
    eperm_count: u32,
    iterations: u64,
    progressed: bool,
}

impl<D: TunDevice> TunnelEventLoop<D> {
    pub fn new(
        device: D,
        settings: &Settings,
        blockade: Arc<dyn Blockade>,
        log: Arc<dyn RequestLog>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            device,
            filter: PacketFilter::new(settings, blockade, log),
            forwarder,
            loopback: Loopback::default(),
            shared: Arc::new(Shared::default()),
            events: Arc::new(|event: TunnelEvent| debug!("Tunnel event: {:?}", event)),
            powersave: settings.powersave,
            eperm_count: 0,
            iterations: 0,
            progressed: false,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn filter(&self) -> &PacketFilter {
        &self.filter
    }

    /// Forget about unanswered queries.  Open sockets are left alone.
    pub fn restart(&mut self) {
        self.filter.restart();
    }

    /// Run the loop until stopped (`Ok`) or until something fails (`Err`).
    pub fn run(&mut self) -> Result<(), Error> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        {
            let mut state = self.shared.lock();
            if state.stop_requested {
                return Ok(());
            }
            state.signal = Some(writer);
        }

        info!("Tunnel running");
        self.filter.restart();
        let ret = self.run_loop(&reader);

        debug!("Cleaning up tunnel resources");
        self.shared.lock().signal = None;
        self.forwarder.close_all();
        self.loopback.clear();
        ret
    }

    /// Run the loop, restarting it with an increasing delay whenever it fails, until stopped.
    pub fn run_with_retry(&mut self) {
        let mut cooldown: u32 = 1;
        loop {
            self.progressed = false;
            let ret = self.run();
            if self.progressed {
                cooldown = 1;
            }
            let e = match ret {
                Ok(()) => break,
                Err(e) => e,
            };
            if self.handle().is_stopped() {
                break;
            }
            self.note_failure(&e);

            let delay = std::cmp::min(COOLDOWN_BASE.saturating_mul(cooldown), COOLDOWN_MAX);
            cooldown = cooldown.saturating_mul(2);
            warn!("Tunnel error, will restart after {:?}: {}", delay, e);
            TUNNEL_RESTARTS.inc();
            self.events.emit(TunnelEvent::Restarting { delay });
            if self.wait_for_stop(delay) {
                break;
            }
        }
        info!("Tunnel shut down");
    }

    fn note_failure(&mut self, e: &Error) {
        if e.is_eperm() {
            self.eperm_count += 1;
            if self.eperm_count >= EPERM_POWERSAVE_THRESHOLD && self.powersave {
                info!("Tunnel refused by the OS, assuming power saving");
                self.events.emit(TunnelEvent::PowerSaving);
                self.eperm_count = 0;
            }
        } else {
            self.eperm_count = 0;
            error!("Tunnel failed: {}", e);
        }
    }

    /* Sleep for `delay`, returning early with true if the tunnel is stopped meanwhile. */
    fn wait_for_stop(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.lock();
        while !state.stop_requested {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.wake.wait_timeout(state, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn run_loop(&mut self, signal: &UnixStream) -> Result<(), Error> {
        let mut buf = packet::PacketBuffer::new(MAX_PACKET);
        let mut datagram = vec![0u8; MAX_DATAGRAM];
        loop {
            let (signal_events, device_events, ready) = self.poll(signal)?;

            if signal_events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)
                || (signal_events.contains(PollFlags::POLLIN) && !wakeup(signal))
            {
                debug!("Tunnel loop interrupted");
                return Ok(());
            }
            self.apply_pending_settings();

            for index in ready.into_iter().rev() {
                self.from_forwarder(index, &mut datagram, &mut buf);
            }

            if device_events.contains(PollFlags::POLLOUT) {
                if let Some(pkt) = self.loopback.pop() {
                    self.device.write_packet(&pkt)?;
                }
            }

            if device_events.contains(PollFlags::POLLIN) {
                self.from_device(&mut buf)?;
            } else if device_events
                .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
            {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("tun device reported {:?}", device_events),
                )));
            }

            self.housekeeping();
            self.progressed = true;
        }
    }

    /* Returns the signal and device events, and the indexes of forwarder rules that are ready. */
    fn poll(&self, signal: &UnixStream) -> Result<(PollFlags, PollFlags, Vec<usize>), Error> {
        let mut device_flags = PollFlags::POLLIN;
        if !self.loopback.is_empty() {
            device_flags |= PollFlags::POLLOUT;
        }

        let mut fds = Vec::with_capacity(2 + self.forwarder.size());
        fds.push(PollFd::new(signal, PollFlags::POLLIN));
        fds.push(PollFd::new(&self.device, device_flags));
        for rule in self.forwarder.iter() {
            fds.push(PollFd::new(rule, PollFlags::POLLIN));
        }

        loop {
            match poll(&mut fds, -1) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Poll(e)),
            }
        }

        let revents: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
            .collect();
        let ready = revents[2..]
            .iter()
            .enumerate()
            .filter(|(_, ev)| !ev.is_empty())
            .map(|(index, _)| index)
            .collect();
        Ok((revents[0], revents[1], ready))
    }

    fn apply_pending_settings(&mut self) {
        let pending = self.shared.lock().pending.take();
        if let Some(settings) = pending {
            self.powersave = settings.powersave;
            self.filter.set_settings(&settings);
            info!(
                "Applied new tunnel settings: servers {:?}, {} answers",
                self.filter.servers(),
                self.filter.answer_mode()
            );
        }
    }

    fn from_forwarder(&mut self, index: usize, datagram: &mut [u8], buf: &mut packet::PacketBuffer) {
        let rule = match self.forwarder.take(index) {
            Some(rule) => rule,
            None => return,
        };
        let len = match rule.receive(datagram) {
            Ok(len) => len,
            Err(e) => {
                warn!("Failed receiving from {}: {}", rule.upstream(), e);
                PACKETS_DROPPED.with_label_values(&["upstream_error"]).inc();
                return;
            }
        };

        let reply = packet::Ipv4Udp::parse_framing(rule.origin())
            .and_then(|origin| origin.reply(&datagram[..len]))
            .and_then(|pkt| buf.fill(&pkt));
        match reply {
            Ok(()) => match self.filter.handle_to_device(buf) {
                Ok(true) => {
                    if let Err(e) = self.device.write_packet(buf.packet()) {
                        warn!("Failed writing reply from {}: {}", rule.upstream(), e);
                    }
                }
                Ok(false) => (),
                Err(e) => warn!("Failed handling reply from {}: {}", rule.upstream(), e),
            },
            Err(e) => {
                warn!("Failed wrapping reply from {}: {}", rule.upstream(), e);
                PACKETS_DROPPED.with_label_values(&["oversize"]).inc();
            }
        }
        self.forwarder.add_available_connection(rule);
    }

    fn from_device(&mut self, buf: &mut packet::PacketBuffer) -> Result<(), Error> {
        let len = match self.device.read_packet(buf.storage_mut()) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };
        if len == 0 || buf.set_len(len).is_err() {
            return Ok(());
        }

        match self.filter.handle_from_device(buf, &mut self.loopback) {
            Ok(true) => Ok(()),
            Ok(false) => self.forward(buf),
            Err(e) => {
                self.events.emit(TunnelEvent::Stuck);
                Err(e.into())
            }
        }
    }

    /* Send a device packet upstream, provided it is now addressed to one of our servers. */
    fn forward(&mut self, buf: &packet::PacketBuffer) -> Result<(), Error> {
        let view = match packet::Ipv4Udp::parse(buf.packet()) {
            Ok(view) => view,
            Err(e) => {
                trace!("Not forwarding packet: {}", e);
                PACKETS_DROPPED.with_label_values(&["not_dns"]).inc();
                return Ok(());
            }
        };
        if view.is_broadcast() {
            trace!("Not forwarding broadcast to {}", view.dst);
            PACKETS_DROPPED.with_label_values(&["broadcast"]).inc();
            return Ok(());
        }
        if !self.filter.servers().contains(&view.dst) {
            trace!("Not forwarding packet to {}", view.dst);
            PACKETS_DROPPED.with_label_values(&["stray"]).inc();
            return Ok(());
        }

        match self.forwarder.forward(view.payload, view.dst, buf.packet()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(Errno::EPERM as i32) => Err(Error::Forward(e)),
            Err(e) if e.raw_os_error() == Some(Errno::ENETUNREACH as i32) => {
                debug!("Network unreachable, dropping query to {}", view.dst);
                PACKETS_DROPPED.with_label_values(&["unreachable"]).inc();
                Ok(())
            }
            Err(e) => {
                warn!("Failed forwarding query to {}: {}", view.dst, e);
                PACKETS_DROPPED.with_label_values(&["forward_error"]).inc();
                Ok(())
            }
        }
    }

    fn housekeeping(&mut self) {
        self.iterations = self.iterations.wrapping_add(1);
        if self.iterations % HOUSEKEEPING_INTERVAL == 0 {
            self.forwarder.reclaim_expired(Instant::now());
        }
    }
}

/* Consume queued wakeups.  Returns false once the other end has gone away. */
fn wakeup(mut signal: &UnixStream) -> bool {
    let mut scratch = [0u8; 64];
    loop {
        match signal.read(&mut scratch) {
            Ok(0) => return false,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}
