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
 *  Relays permitted queries to the real upstream servers.
 *
 *  Every query in flight owns one connected UDP socket until its reply arrives or it times out.
 *  Sockets are recycled through an idle pool rather than closed, and the number in flight is
 *  bounded so a resolver that never answers can't exhaust our descriptors.
 */
use log::{debug, trace};
use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use crate::config::ForwarderConfig;

lazy_static::lazy_static! {
    static ref FORWARDER_INFLIGHT: prometheus::IntGauge =
        prometheus::register_int_gauge!("tundns_forwarder_inflight",
            "Number of forwarded DNS queries waiting for a reply")
        .unwrap();

    static ref FORWARDER_RECLAIMED: prometheus::IntCounter =
        prometheus::register_int_counter!("tundns_forwarder_reclaimed",
            "Number of forwarded DNS queries abandoned after timing out")
        .unwrap();
}

/// Creates the sockets used to talk to upstream.  Hosts use this to exempt them from the tunnel.
pub type SocketFactory = Box<dyn Fn() -> io::Result<UdpSocket> + Send>;

pub fn default_socket_factory() -> SocketFactory {
    Box::new(|| UdpSocket::bind("0.0.0.0:0"))
}

#[derive(Debug)]
pub enum Error {
    Exhausted(usize),
    Io(io::Error),
}

impl Error {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Exhausted(_) => None,
            Error::Io(e) => e.raw_os_error(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Exhausted(n) => write!(f, "All {} forwarding sockets are in use", n),
            Error::Io(e) => write!(f, "Failed to forward query: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// One query in flight.
#[derive(Debug)]
pub struct ForwardRule {
    socket: UdpSocket,
    origin: Vec<u8>,
    upstream: SocketAddrV4,
    started: Instant,
}

impl ForwardRule {
    /// Receive the upstream reply.  The socket is non-blocking, so only call this once it has
    /// polled readable.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    /// The query as it was sent, used to address the reply back to the device.
    pub fn origin(&self) -> &[u8] {
        &self.origin
    }

    pub fn upstream(&self) -> SocketAddrV4 {
        self.upstream
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started) >= timeout
    }
}

impl AsFd for ForwardRule {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

pub struct Forwarder {
    active: Vec<ForwardRule>,
    idle: Vec<UdpSocket>,
    capacity: usize,
    timeout: Duration,
    factory: SocketFactory,
}

impl Forwarder {
    pub fn new(config: &ForwarderConfig) -> Self {
        Self::with_factory(config, default_socket_factory())
    }

    pub fn with_factory(config: &ForwarderConfig, factory: SocketFactory) -> Self {
        Self {
            active: Vec::new(),
            idle: Vec::new(),
            capacity: config.max_sockets,
            timeout: config.timeout,
            factory,
        }
    }

    /// Number of queries in flight.
    pub fn size(&self) -> usize {
        self.active.len()
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ForwardRule> {
        self.active.iter()
    }

    /// Remove the `index`th in-flight rule, typically because its socket polled readable.
    pub fn take(&mut self, index: usize) -> Option<ForwardRule> {
        if index >= self.active.len() {
            return None;
        }
        let rule = self.active.remove(index);
        FORWARDER_INFLIGHT.set(self.active.len() as i64);
        Some(rule)
    }

    /// Return a rule's socket to the idle pool once its reply has been consumed or abandoned.
    pub fn add_available_connection(&mut self, rule: ForwardRule) {
        if self.idle.len() < self.capacity {
            self.idle.push(rule.socket);
        }
    }

    /// Abandon queries that have waited longer than the timeout.  Returns how many were
    /// reclaimed.
    pub fn reclaim_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let (expired, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|rule| rule.expired(now, timeout));
        self.active = active;
        let count = expired.len();
        for rule in expired {
            trace!("Abandoning query to {} after {:?}", rule.upstream, timeout);
            self.add_available_connection(rule);
        }
        if count > 0 {
            debug!("Reclaimed {} unanswered forwarded queries", count);
            FORWARDER_RECLAIMED.inc_by(count as u64);
            FORWARDER_INFLIGHT.set(self.active.len() as i64);
        }
        count
    }

    /// Send `payload` to `upstream`, remembering `origin` so the reply can be routed back.
    ///
    /// A socket that fails here is closed rather than returned to the pool.
    pub fn forward(
        &mut self,
        payload: &[u8],
        upstream: SocketAddrV4,
        origin: &[u8],
    ) -> Result<(), Error> {
        if self.active.len() >= self.capacity {
            self.reclaim_expired(Instant::now());
            if self.active.len() >= self.capacity {
                return Err(Error::Exhausted(self.capacity));
            }
        }

        let socket = match self.idle.pop() {
            Some(socket) => socket,
            None => {
                let socket = (self.factory)()?;
                socket.set_nonblocking(true)?;
                socket
            }
        };
        socket.connect(upstream)?;
        drain(&socket);
        socket.send(payload)?;

        self.active.push(ForwardRule {
            socket,
            origin: origin.to_vec(),
            upstream,
            started: Instant::now(),
        });
        FORWARDER_INFLIGHT.set(self.active.len() as i64);
        Ok(())
    }

    /// Close every socket, in flight or idle.
    pub fn close_all(&mut self) {
        self.active.clear();
        self.idle.clear();
        FORWARDER_INFLIGHT.set(0);
    }
}

/* Discard replies that straggled in after a previous query on this socket was abandoned. */
fn drain(socket: &UdpSocket) {
    let mut scratch = [0u8; 512];
    while socket.recv(&mut scratch).is_ok() {}
}

#[cfg(test)]
fn test_config(max_sockets: usize, timeout: Duration) -> ForwarderConfig {
    ForwarderConfig {
        max_sockets,
        timeout,
    }
}

#[cfg(test)]
fn test_upstream() -> (UdpSocket, SocketAddrV4) {
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    upstream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let addr = match upstream.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    };
    (upstream, addr)
}

#[cfg(test)]
fn wait_readable(rule: &ForwardRule) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 1];
    while rule.socket.peek(&mut buf).is_err() {
        assert!(Instant::now() < deadline, "no reply from upstream");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_forward_and_receive() {
    let (upstream, addr) = test_upstream();
    let mut fwd = Forwarder::new(&test_config(4, Duration::from_secs(10)));
    fwd.forward(b"query", addr, b"origin").unwrap();
    assert_eq!(fwd.size(), 1);

    let mut buf = [0u8; 64];
    let (len, from) = upstream.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"query");
    upstream.send_to(b"reply", from).unwrap();

    let rule = fwd.take(0).unwrap();
    assert_eq!(rule.origin(), b"origin");
    assert_eq!(rule.upstream(), addr);
    wait_readable(&rule);
    let len = rule.receive(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"reply");

    fwd.add_available_connection(rule);
    assert_eq!(fwd.size(), 0);
    assert_eq!(fwd.idle(), 1);
}

#[test]
fn test_idle_socket_reused() {
    let (upstream, addr) = test_upstream();
    let mut fwd = Forwarder::new(&test_config(4, Duration::from_secs(10)));
    fwd.forward(b"one", addr, b"origin").unwrap();
    let rule = fwd.take(0).unwrap();
    fwd.add_available_connection(rule);

    fwd.forward(b"two", addr, b"origin").unwrap();
    assert_eq!(fwd.idle(), 0);
    assert_eq!(fwd.size(), 1);

    let mut buf = [0u8; 64];
    let (len, first) = upstream.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"one");
    let (len, second) = upstream.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"two");
    assert_eq!(first, second);
}

#[test]
fn test_exhausted() {
    let (_upstream, addr) = test_upstream();
    let mut fwd = Forwarder::new(&test_config(1, Duration::from_secs(3600)));
    fwd.forward(b"one", addr, b"origin").unwrap();
    match fwd.forward(b"two", addr, b"origin") {
        Err(Error::Exhausted(1)) => (),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(fwd.size(), 1);
}

#[test]
fn test_full_pool_reclaims_expired() {
    let (_upstream, addr) = test_upstream();
    let mut fwd = Forwarder::new(&test_config(1, Duration::ZERO));
    fwd.forward(b"one", addr, b"origin").unwrap();
    fwd.forward(b"two", addr, b"origin").unwrap();
    assert_eq!(fwd.size(), 1);
}

#[test]
fn test_reclaim_expired() {
    let (_upstream, addr) = test_upstream();
    let mut fwd = Forwarder::new(&test_config(8, Duration::from_secs(10)));
    fwd.forward(b"one", addr, b"origin").unwrap();
    fwd.forward(b"two", addr, b"origin").unwrap();
    assert_eq!(fwd.reclaim_expired(Instant::now()), 0);
    assert_eq!(
        fwd.reclaim_expired(Instant::now() + Duration::from_secs(11)),
        2
    );
    assert_eq!(fwd.size(), 0);
    assert_eq!(fwd.idle(), 2);
}

#[test]
fn test_factory_failure() {
    let (_upstream, addr) = test_upstream();
    let factory: SocketFactory = Box::new(|| {
        Err(io::Error::from_raw_os_error(nix::errno::Errno::EPERM as i32))
    });
    let mut fwd = Forwarder::with_factory(&test_config(4, Duration::from_secs(10)), factory);
    let err = fwd.forward(b"one", addr, b"origin").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(nix::errno::Errno::EPERM as i32));
    assert_eq!(fwd.size(), 0);
}

#[test]
fn test_close_all() {
    let (_upstream, addr) = test_upstream();
    let mut fwd = Forwarder::new(&test_config(4, Duration::from_secs(10)));
    fwd.forward(b"one", addr, b"origin").unwrap();
    let rule = fwd.take(0).unwrap();
    fwd.add_available_connection(rule);
    fwd.forward(b"two", addr, b"origin").unwrap();
    fwd.forward(b"three", addr, b"origin").unwrap();
    fwd.close_all();
    assert_eq!(fwd.size(), 0);
    assert_eq!(fwd.idle(), 0);
    assert!(fwd.take(0).is_none());
}
