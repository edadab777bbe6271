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
 *  Classifies and rewrites DNS packets crossing the tunnel.
 *
 *  The device's resolver is configured to talk to proxy addresses in 203.0.113.0/24, where the
 *  last octet selects which upstream server (1-based) the query is destined for.  Queries for
 *  permitted names are NATed to the real server in place; queries for blocked names are answered
 *  locally through the loopback queue.  Replies from upstream are NATed back so they appear to
 *  come from the proxy address the device asked.
 */
use crate::config::Settings;
use crate::dns;
use crate::dns::answer::{AnswerMode, DnsAnswerPolicy, SINKHOLE_ADDR};
use crate::dns::dnspkt;
use crate::net::packet;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

pub mod blockade;
pub mod requestlog;
#[cfg(test)]
mod test;

use blockade::Blockade;
use requestlog::{LogDiff, LogEntry, RequestLog};

pub const PROXY_NET: [u8; 3] = [203, 0, 113];
pub const PROXY_PORT: u16 = 53;
/// Forwarded queries without any reply before the session is considered stuck.
pub const MAX_ONE_WAY_DNS_REQUESTS: u32 = 10;

lazy_static::lazy_static! {
    static ref QUERIES: prometheus::IntCounterVec =
        prometheus::register_int_counter_vec!("tundns_queries",
            "DNS queries seen on the tunnel, by outcome",
            &["result"])
        .unwrap();

    pub(crate) static ref PACKETS_DROPPED: prometheus::IntCounterVec =
        prometheus::register_int_counter_vec!("tundns_packets_dropped",
            "Packets dropped by the tunnel, by reason",
            &["reason"])
        .unwrap();

    static ref ONE_WAY_REQUESTS: prometheus::IntGauge =
        prometheus::register_int_gauge!("tundns_one_way_requests",
            "Forwarded DNS queries since the last reply")
        .unwrap();
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    StuckSession(u32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::StuckSession(n) => {
                write!(f, "Too many DNS requests without response ({})", n)
            }
        }
    }
}

impl std::error::Error for Error {}

/// The proxy address standing in for the `index`th (1-based) upstream server.
pub fn proxy_address(index: u8) -> Ipv4Addr {
    Ipv4Addr::new(PROXY_NET[0], PROXY_NET[1], PROXY_NET[2], index)
}

pub fn is_proxy_address(ip: &Ipv4Addr) -> bool {
    ip.octets()[..3] == PROXY_NET
}

/// Synthetic packets waiting to be written to the device.
#[derive(Debug, Default)]
pub struct Loopback {
    queue: VecDeque<Vec<u8>>,
}

impl Loopback {
    pub fn push(&mut self, packet: Vec<u8>) {
        self.queue.push_back(packet);
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

pub struct PacketFilter {
    servers: Vec<SocketAddrV4>,
    blockade: Arc<dyn Blockade>,
    log: Arc<dyn RequestLog>,
    policy: DnsAnswerPolicy,
    cname_blocking: bool,
    one_way: u32,
    last_blocked: Option<String>,
}

impl PacketFilter {
    pub fn new(settings: &Settings, blockade: Arc<dyn Blockade>, log: Arc<dyn RequestLog>) -> Self {
        Self {
            servers: settings.dns_servers.clone(),
            blockade,
            log,
            policy: DnsAnswerPolicy::new(settings.answer),
            cname_blocking: settings.cname_blocking,
            one_way: 0,
            last_blocked: None,
        }
    }

    pub fn servers(&self) -> &[SocketAddrV4] {
        &self.servers
    }

    pub fn answer_mode(&self) -> AnswerMode {
        self.policy.mode()
    }

    pub fn one_way_requests(&self) -> u32 {
        self.one_way
    }

    /// Forget about unanswered queries, eg after the upstream servers changed.
    pub fn restart(&mut self) {
        self.one_way = 0;
        ONE_WAY_REQUESTS.set(0);
    }

    pub fn set_settings(&mut self, settings: &Settings) {
        self.servers = settings.dns_servers.clone();
        self.policy.set_mode(settings.answer);
        self.cname_blocking = settings.cname_blocking;
        self.restart();
    }

    fn is_blocked(&self, host: &str) -> bool {
        !self.blockade.allowed(host) && self.blockade.denied(host)
    }

    fn server_for_proxy(&self, proxy: &Ipv4Addr) -> Option<SocketAddrV4> {
        match proxy.octets()[3] {
            0 => None,
            index => self.servers.get(index as usize - 1).copied(),
        }
    }

    /// Handle a packet read from the device.
    ///
    /// Returns `Ok(true)` if the packet has been fully dealt with (a blocked query, answered via
    /// `loopback`).  Returns `Ok(false)` otherwise: either the packet is not a DNS query for the
    /// proxy, or it was permitted and `buf` now holds the query rewritten for its upstream
    /// server, which the caller should forward.
    pub fn handle_from_device(
        &mut self,
        buf: &mut packet::PacketBuffer,
        loopback: &mut Loopback,
    ) -> Result<bool, Error> {
        match packet::ip_version(buf.packet()) {
            Some(packet::IP_VERSION_4) => (),
            Some(packet::IP_VERSION_6) => {
                warn!("ipv6 ad blocking not supported");
                PACKETS_DROPPED.with_label_values(&["ipv6"]).inc();
                return Ok(false);
            }
            _ => return Ok(false),
        }

        let (src, dst, msg) = {
            let view = match packet::Ipv4Udp::parse(buf.packet()) {
                Ok(view) => view,
                Err(e) => {
                    trace!("Ignoring packet from device: {}", e);
                    return Ok(false);
                }
            };
            if !is_proxy_address(view.dst.ip()) {
                return Ok(false);
            }
            match dns::parse_message(view.payload) {
                Ok(msg) => (view.src, view.dst, msg),
                Err(e) => {
                    trace!("Ignoring non-DNS packet to {}: {}", view.dst, e);
                    return Ok(false);
                }
            }
        };

        let host = msg.question.qdomain.host();
        if !self.is_blocked(&host) {
            let server = match self.server_for_proxy(dst.ip()) {
                Some(server) => server,
                None => {
                    warn!(
                        "No DNS server configured for proxy address {}, dropping query for {}",
                        dst.ip(),
                        host
                    );
                    PACKETS_DROPPED.with_label_values(&["unknown_proxy"]).inc();
                    return Ok(false);
                }
            };
            if let Err(e) = packet::rewrite_addresses(buf.packet_mut(), None, Some(server)) {
                warn!("Failed to rewrite query for {}: {}", host, e);
                return Ok(false);
            }
            self.log.add(LogEntry::new(msg.qid, host, false));
            QUERIES.with_label_values(&["forwarded"]).inc();
            self.one_way += 1;
            ONE_WAY_REQUESTS.set(self.one_way as i64);
            if self.one_way > MAX_ONE_WAY_DNS_REQUESTS {
                return Err(Error::StuckSession(self.one_way));
            }
            Ok(false)
        } else {
            if self.last_blocked.as_deref() != Some(host.as_str()) {
                debug!("blocked: {}", host);
                self.last_blocked = Some(host.clone());
            }
            let mut reply = msg;
            self.policy.apply(&mut reply);
            match packet::build_ipv4_udp(dst, src, &reply.serialise()) {
                Ok(pkt) => loopback.push(pkt),
                Err(e) => {
                    warn!("Failed to build blocked answer for {}: {}", host, e);
                    PACKETS_DROPPED.with_label_values(&["oversize"]).inc();
                }
            }
            self.log.add(LogEntry::new(reply.qid, host, true));
            QUERIES.with_label_values(&["blocked"]).inc();
            Ok(true)
        }
    }

    /// Handle a reply from an upstream server, wrapped in an IPv4/UDP envelope addressed to the
    /// device.
    ///
    /// Returns `Ok(true)` if `buf` now holds a reply ready to be written to the device, or
    /// `Ok(false)` if it should be dropped.
    pub fn handle_to_device(&mut self, buf: &mut packet::PacketBuffer) -> Result<bool, Error> {
        let (index, src, dst, mut msg) = {
            let view = match packet::Ipv4Udp::parse(buf.packet()) {
                Ok(view) => view,
                Err(e) => {
                    debug!("Ignoring packet to device: {}", e);
                    return Ok(false);
                }
            };
            /* Servers may share an address and differ only by port. */
            let index = match self.servers.iter().position(|s| *s == view.src) {
                Some(index) => index,
                None => {
                    warn!(
                        "cannot rewrite DNS response, unknown dns server: {}. dropping",
                        view.src
                    );
                    PACKETS_DROPPED.with_label_values(&["unknown_server"]).inc();
                    return Ok(false);
                }
            };
            self.restart();
            match dns::parse_message(view.payload) {
                Ok(msg) => (index, view.src, view.dst, msg),
                Err(e) => {
                    warn!("failed reading DNS answer from {}: {}", view.src, e);
                    PACKETS_DROPPED.with_label_values(&["malformed_reply"]).inc();
                    return Ok(false);
                }
            }
        };
        trace!("{} answered {:#06x} with {}", src, msg.qid, msg.rcode);

        let mut diff = LogDiff {
            rcode: Some(msg.rcode.0),
            ..Default::default()
        };
        let mut rewritten = None;
        if msg
            .answer
            .iter()
            .any(|rr| rr.rdata == dnspkt::RData::A(SINKHOLE_ADDR))
        {
            /* Upstream blocked this one itself. */
            diff.ip = Some(SINKHOLE_ADDR);
        } else if msg.rcode == dnspkt::NOERROR {
            if let Some((owner, ip)) = msg.first_a().map(|(owner, ip)| (owner.clone(), ip)) {
                diff.ip = Some(ip);
                if self.cname_blocking && !msg.question.qdomain.eq_ignore_case(&owner) {
                    let name = msg.question.qdomain.host();
                    let cnamed = owner.host();
                    if !self.blockade.allowed(&name) && self.is_blocked(&cnamed) {
                        debug!("blocked: {} (cname of {})", cnamed, name);
                        self.policy.apply(&mut msg);
                        rewritten = Some(msg.serialise());
                        diff.cnamed_domain = Some(cnamed);
                        QUERIES.with_label_values(&["cname_blocked"]).inc();
                    }
                }
            }
        }

        let qid = msg.qid;
        self.log.update(&|e: &LogEntry| e.id == qid, diff);

        let proxy = SocketAddrV4::new(proxy_address(index as u8 + 1), PROXY_PORT);
        match rewritten {
            Some(payload) => {
                let pkt = match packet::build_ipv4_udp(proxy, dst, &payload) {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        warn!("Failed to build blocked answer: {}", e);
                        return Ok(false);
                    }
                };
                if let Err(e) = buf.fill(&pkt) {
                    warn!("Blocked answer does not fit buffer: {}", e);
                    return Ok(false);
                }
            }
            None => {
                if let Err(e) = packet::rewrite_addresses(buf.packet_mut(), Some(proxy), None) {
                    warn!("Failed to rewrite reply from {}: {}", src, e);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
