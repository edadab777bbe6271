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
 *  Parsing, rewriting and creating raw IPv4/UDP packets as read from (and written to) a tun
 *  device.
 */
use crate::pktparser::Buffer;
use std::net;

pub const IPPROTO_UDP: u8 = 17;
pub const IP_VERSION_4: u8 = 4;
pub const IP_VERSION_6: u8 = 6;
pub const DEFAULT_TTL: u8 = 64;

const IPV4_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;
const MAX_PACKET: usize = u16::MAX as usize;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Truncated,
    NotIpv4(u8),
    BadHeaderLength(usize),
    BadTotalLength(usize),
    NotUdp(u8),
    Fragmented,
    BadUdpLength(usize),
    EmptyPayload,
    TooLarge(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Error::*;
        match self {
            Truncated => write!(f, "Truncated packet"),
            NotIpv4(v) => write!(f, "Not an IPv4 packet (version {})", v),
            BadHeaderLength(l) => write!(f, "Invalid IPv4 header length {}", l),
            BadTotalLength(l) => write!(f, "Invalid IPv4 total length {}", l),
            NotUdp(p) => write!(f, "Not a UDP packet (protocol {})", p),
            Fragmented => write!(f, "Fragmented packets are not supported"),
            BadUdpLength(l) => write!(f, "Invalid UDP length {}", l),
            EmptyPayload => write!(f, "UDP packet has no payload"),
            TooLarge(l) => write!(f, "Packet too large ({} bytes)", l),
        }
    }
}

impl std::error::Error for Error {}

fn partial_netsum(current: u32, buffer: &[u8]) -> u32 {
    let mut i = 0;
    let mut sum = current;
    let mut count = buffer.len();
    while count > 1 {
        let v = ((buffer[i] as u32) << 8) | (buffer[i + 1] as u32);
        sum += v;
        i += 2;
        count -= 2;
    }
    if count > 0 {
        let v = (buffer[i] as u32) << 8;
        sum += v;
    }
    sum
}

fn finish_netsum(sum: u32) -> u16 {
    let mut sum = sum;
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}

fn pseudo_header_netsum(src: &net::Ipv4Addr, dst: &net::Ipv4Addr, udp_len: usize) -> u32 {
    let sum = partial_netsum(0, &src.octets());
    let sum = partial_netsum(sum, &dst.octets());
    partial_netsum(sum, &[0, IPPROTO_UDP, (udp_len >> 8) as u8, udp_len as u8])
}

/* A UDP checksum of 0 means "no checksum", so a computed 0 is sent as all ones. */
fn finish_udp_netsum(sum: u32) -> u16 {
    match finish_netsum(sum) {
        0 => 0xFFFF,
        n => n,
    }
}

#[derive(Clone, Debug)]
pub enum Tail<'a> {
    Payload(&'a [u8]),
    Fragment(Box<Fragment<'a>>),
}

impl<'a> Tail<'a> {
    fn len(&self) -> usize {
        match self {
            Tail::Payload(x) => x.len(),
            Tail::Fragment(x) => x.len(),
        }
    }

    fn partial_netsum(&self, current: u32) -> u32 {
        match self {
            Tail::Payload(x) => partial_netsum(current, x),
            Tail::Fragment(x) => x.partial_netsum(current),
        }
    }
}

/// A packet under construction: a header, followed by whatever it encapsulates.
#[derive(Clone, Debug)]
pub struct Fragment<'a> {
    buffer: Vec<u8>,
    tail: Tail<'a>,
}

impl<'a> Fragment<'a> {
    fn len(&self) -> usize {
        self.buffer.len() + self.tail.len()
    }
    fn partial_netsum(&self, current: u32) -> u32 {
        self.tail
            .partial_netsum(partial_netsum(current, &self.buffer))
    }
    pub fn flatten(&self) -> Vec<u8> {
        let mut x = self;
        let mut ret = Vec::with_capacity(self.len());
        loop {
            ret.extend_from_slice(&x.buffer);
            match &x.tail {
                Tail::Payload(x) => {
                    ret.extend_from_slice(x);
                    break;
                }
                Tail::Fragment(f) => {
                    x = f.as_ref();
                }
            }
        }
        ret
    }

    fn from_tail(tail: Tail) -> Fragment {
        Fragment {
            buffer: vec![],
            tail,
        }
    }
    fn push_u8(&mut self, b: u8) {
        self.buffer.push(b);
    }
    fn push_bytes(&mut self, b: &[u8]) {
        self.buffer.extend_from_slice(b);
    }
    fn push_be16(&mut self, b: u16) {
        self.push_bytes(&b.to_be_bytes());
    }

    fn new_ipv4<'l>(
        src: &net::Ipv4Addr,
        dst: &net::Ipv4Addr,
        ttl: u8,
        protocol: u8,
        payload: Tail<'l>,
    ) -> Fragment<'l> {
        let mut f = Fragment::from_tail(payload);
        f.push_u8(0x45); /* version 4, length 5*4 bytes */
        f.push_u8(0x00); /* ToS */
        f.push_be16((IPV4_MIN_HEADER + f.tail.len()) as u16); /* Total Length */
        f.push_be16(0x0000); /* Identification */
        f.push_be16(0x4000); /* Flags (Don't Fragment) + Frag Offset */
        f.push_u8(ttl);
        f.push_u8(protocol);
        f.push_be16(0x0000); /* Checksum - filled in below*/
        f.push_bytes(&src.octets());
        f.push_bytes(&dst.octets());
        let netsum = finish_netsum(partial_netsum(0, &f.buffer));
        f.buffer[10..12].copy_from_slice(&netsum.to_be_bytes());
        f
    }

    pub fn new_udp<'l>(
        src: net::SocketAddrV4,
        dst: net::SocketAddrV4,
        ttl: u8,
        payload: Tail<'l>,
    ) -> Fragment<'l> {
        let mut f = Self::from_tail(payload);
        f.push_be16(src.port());
        f.push_be16(dst.port());
        f.push_be16((UDP_HEADER + f.tail.len()) as u16); /* Length */
        f.push_be16(0x0000); /* Checksum - filled in below */
        let netsum =
            finish_udp_netsum(f.partial_netsum(pseudo_header_netsum(src.ip(), dst.ip(), f.len())));
        f.buffer[6..8].copy_from_slice(&netsum.to_be_bytes());
        Self::new_ipv4(
            src.ip(),
            dst.ip(),
            ttl,
            IPPROTO_UDP,
            Tail::Fragment(Box::new(f)),
        )
    }
}

/// Serialise a complete IPv4/UDP packet carrying `payload`.
pub fn build_ipv4_udp(
    src: net::SocketAddrV4,
    dst: net::SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let total = IPV4_MIN_HEADER + UDP_HEADER + payload.len();
    if total > MAX_PACKET {
        return Err(Error::TooLarge(total));
    }
    Ok(Fragment::new_udp(src, dst, DEFAULT_TTL, Tail::Payload(payload)).flatten())
}

/// The IP version nibble of a raw packet.
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// A parsed view of an IPv4 packet carrying a UDP datagram.
#[derive(Clone, Debug)]
pub struct Ipv4Udp<'a> {
    pub header_len: usize,
    pub total_len: usize,
    pub udp_len: usize,
    pub src: net::SocketAddrV4,
    pub dst: net::SocketAddrV4,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Udp<'a> {
    /// Parse the IPv4 and UDP framing.  The payload may be empty.
    pub fn parse_framing(packet: &'a [u8]) -> Result<Self, Error> {
        let mut buf = Buffer::new(packet);
        let vihl = buf.get_u8().ok_or(Error::Truncated)?;
        if vihl >> 4 != IP_VERSION_4 {
            return Err(Error::NotIpv4(vihl >> 4));
        }
        let header_len = ((vihl & 0x0F) as usize) * 4;
        if header_len < IPV4_MIN_HEADER || header_len > packet.len() {
            return Err(Error::BadHeaderLength(header_len));
        }
        let _tos = buf.get_u8().ok_or(Error::Truncated)?;
        let total_len = buf.get_be16().ok_or(Error::Truncated)? as usize;
        if total_len < header_len + UDP_HEADER || total_len > packet.len() {
            return Err(Error::BadTotalLength(total_len));
        }
        let _ident = buf.get_be16().ok_or(Error::Truncated)?;
        let frag = buf.get_be16().ok_or(Error::Truncated)?;
        /* More Fragments set, or a non-zero offset. */
        if frag & 0x3FFF != 0 {
            return Err(Error::Fragmented);
        }
        let _ttl = buf.get_u8().ok_or(Error::Truncated)?;
        let protocol = buf.get_u8().ok_or(Error::Truncated)?;
        if protocol != IPPROTO_UDP {
            return Err(Error::NotUdp(protocol));
        }
        let _checksum = buf.get_be16().ok_or(Error::Truncated)?;
        let src_ip = buf.get_ipv4().ok_or(Error::Truncated)?;
        let dst_ip = buf.get_ipv4().ok_or(Error::Truncated)?;

        let mut udp = Buffer::new(&packet[..total_len])
            .set_offset(header_len)
            .ok_or(Error::Truncated)?;
        let src_port = udp.get_be16().ok_or(Error::Truncated)?;
        let dst_port = udp.get_be16().ok_or(Error::Truncated)?;
        let udp_len = udp.get_be16().ok_or(Error::Truncated)? as usize;
        if udp_len < UDP_HEADER || header_len + udp_len > total_len {
            return Err(Error::BadUdpLength(udp_len));
        }
        let _udp_checksum = udp.get_be16().ok_or(Error::Truncated)?;
        let payload = udp
            .get_bytes(udp_len - UDP_HEADER)
            .ok_or(Error::Truncated)?;

        Ok(Ipv4Udp {
            header_len,
            total_len,
            udp_len,
            src: net::SocketAddrV4::new(src_ip, src_port),
            dst: net::SocketAddrV4::new(dst_ip, dst_port),
            payload,
        })
    }

    /// Parse the IPv4 and UDP framing, insisting on a non-empty payload.
    pub fn parse(packet: &'a [u8]) -> Result<Self, Error> {
        let ret = Self::parse_framing(packet)?;
        if ret.payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        Ok(ret)
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst.ip().octets()[3] == 0xFF
    }

    /// Build the packet travelling back the other way, carrying `payload`.
    pub fn reply(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        build_ipv4_udp(self.dst, self.src, payload)
    }
}

/// Rewrite the source and/or destination of an IPv4/UDP packet in place, fixing up both
/// checksums.  The packet length never changes.
pub fn rewrite_addresses(
    packet: &mut [u8],
    src: Option<net::SocketAddrV4>,
    dst: Option<net::SocketAddrV4>,
) -> Result<(), Error> {
    let (ihl, udp_len, old_src, old_dst) = {
        let view = Ipv4Udp::parse_framing(packet)?;
        (view.header_len, view.udp_len, view.src, view.dst)
    };
    let src = src.unwrap_or(old_src);
    let dst = dst.unwrap_or(old_dst);

    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());
    packet[10..12].copy_from_slice(&[0, 0]);
    let netsum = finish_netsum(partial_netsum(0, &packet[..ihl]));
    packet[10..12].copy_from_slice(&netsum.to_be_bytes());

    let udp = &mut packet[ihl..ihl + udp_len];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[6..8].copy_from_slice(&[0, 0]);
    let netsum = finish_udp_netsum(partial_netsum(
        pseudo_header_netsum(src.ip(), dst.ip(), udp_len),
        udp,
    ));
    udp[6..8].copy_from_slice(&netsum.to_be_bytes());
    Ok(())
}

/// A caller owned packet buffer with a cursor marking how many bytes are valid.
pub struct PacketBuffer {
    data: Vec<u8>,
    len: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn packet(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// The whole backing store, for reading a fresh packet into.  Follow with `set_len`.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), Error> {
        if len > self.data.len() {
            return Err(Error::TooLarge(len));
        }
        self.len = len;
        Ok(())
    }

    pub fn fill(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.data.len() {
            return Err(Error::TooLarge(bytes.len()));
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }
}

#[cfg(test)]
fn checksums_valid(packet: &[u8]) -> bool {
    let view = Ipv4Udp::parse_framing(packet).unwrap();
    let ip_ok = finish_netsum(partial_netsum(0, &packet[..view.header_len])) == 0;
    let udp = &packet[view.header_len..view.header_len + view.udp_len];
    let udp_ok = finish_netsum(partial_netsum(
        pseudo_header_netsum(view.src.ip(), view.dst.ip(), view.udp_len),
        udp,
    )) == 0;
    ip_ok && udp_ok
}

#[test]
fn test_checksum() {
    let data = vec![8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];

    assert_eq!(finish_netsum(partial_netsum(0, &data)), 0xE5CA);
}

#[test]
fn test_build_and_parse() {
    let src = "192.0.2.1:4321".parse().unwrap();
    let dst = "203.0.113.1:53".parse().unwrap();
    let pkt = build_ipv4_udp(src, dst, &[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(pkt.len(), 20 + 8 + 5);
    assert_eq!(ip_version(&pkt), Some(IP_VERSION_4));
    assert!(checksums_valid(&pkt));

    let view = Ipv4Udp::parse(&pkt).unwrap();
    assert_eq!(view.src, src);
    assert_eq!(view.dst, dst);
    assert_eq!(view.payload, &[1, 2, 3, 4, 5]);
    assert!(!view.is_broadcast());
}

#[test]
fn test_reply_swaps_endpoints() {
    let pkt = build_ipv4_udp(
        "192.0.2.1:4321".parse().unwrap(),
        "203.0.113.2:53".parse().unwrap(),
        &[9; 12],
    )
    .unwrap();
    let reply = Ipv4Udp::parse(&pkt).unwrap().reply(&[7; 3]).unwrap();
    let view = Ipv4Udp::parse(&reply).unwrap();
    assert_eq!(view.src, "203.0.113.2:53".parse().unwrap());
    assert_eq!(view.dst, "192.0.2.1:4321".parse().unwrap());
    assert_eq!(view.payload, &[7, 7, 7]);
    assert!(checksums_valid(&reply));
}

#[test]
fn test_rewrite_in_place() {
    let mut pkt = build_ipv4_udp(
        "192.0.2.1:4321".parse().unwrap(),
        "203.0.113.1:53".parse().unwrap(),
        &[1, 2, 3],
    )
    .unwrap();
    let len = pkt.len();
    rewrite_addresses(&mut pkt, None, Some("198.51.100.7:5353".parse().unwrap())).unwrap();
    assert_eq!(pkt.len(), len);
    assert!(checksums_valid(&pkt));
    let view = Ipv4Udp::parse(&pkt).unwrap();
    assert_eq!(view.src, "192.0.2.1:4321".parse().unwrap());
    assert_eq!(view.dst, "198.51.100.7:5353".parse().unwrap());
    assert_eq!(view.payload, &[1, 2, 3]);
}

#[test]
fn test_rewrite_preserves_ip_options() {
    let mut pkt = build_ipv4_udp(
        "192.0.2.1:4321".parse().unwrap(),
        "203.0.113.1:53".parse().unwrap(),
        &[1, 2, 3, 4],
    )
    .unwrap();
    /* Splice in a 4 byte NOP option block, fixing up the lengths. */
    pkt.splice(20..20, [1u8, 1, 1, 0]);
    pkt[0] = 0x46;
    let total = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());

    rewrite_addresses(&mut pkt, Some("198.51.100.1:53".parse().unwrap()), None).unwrap();
    assert!(checksums_valid(&pkt));
    let view = Ipv4Udp::parse(&pkt).unwrap();
    assert_eq!(view.header_len, 24);
    assert_eq!(view.src, "198.51.100.1:53".parse().unwrap());
    assert_eq!(view.payload, &[1, 2, 3, 4]);
}

#[test]
fn test_parse_rejects() {
    let pkt = build_ipv4_udp(
        "192.0.2.1:1".parse().unwrap(),
        "192.0.2.2:2".parse().unwrap(),
        &[1, 2, 3, 4],
    )
    .unwrap();

    assert_eq!(Ipv4Udp::parse(&pkt[..10]).unwrap_err(), Error::BadHeaderLength(20));
    assert_eq!(Ipv4Udp::parse(&pkt[..30]).unwrap_err(), Error::BadTotalLength(32));

    let mut v6 = pkt.clone();
    v6[0] = 0x60;
    assert_eq!(Ipv4Udp::parse(&v6).unwrap_err(), Error::NotIpv4(6));

    let mut tcp = pkt.clone();
    tcp[9] = 6;
    assert_eq!(Ipv4Udp::parse(&tcp).unwrap_err(), Error::NotUdp(6));

    let mut frag = pkt.clone();
    frag[6] = 0x20; /* More Fragments */
    assert_eq!(Ipv4Udp::parse(&frag).unwrap_err(), Error::Fragmented);

    let empty = build_ipv4_udp(
        "192.0.2.1:1".parse().unwrap(),
        "192.0.2.2:2".parse().unwrap(),
        &[],
    )
    .unwrap();
    assert!(Ipv4Udp::parse_framing(&empty).is_ok());
    assert_eq!(Ipv4Udp::parse(&empty).unwrap_err(), Error::EmptyPayload);
}

#[test]
fn test_trailing_bytes_ignored() {
    let mut pkt = build_ipv4_udp(
        "192.0.2.1:1".parse().unwrap(),
        "192.0.2.255:2".parse().unwrap(),
        &[1, 2],
    )
    .unwrap();
    pkt.extend_from_slice(&[0xAA; 6]);
    let view = Ipv4Udp::parse(&pkt).unwrap();
    assert_eq!(view.total_len, 30);
    assert_eq!(view.payload, &[1, 2]);
    assert!(view.is_broadcast());
}

#[test]
fn test_packet_buffer() {
    let mut buf = PacketBuffer::new(8);
    assert!(buf.is_empty());
    buf.fill(&[1, 2, 3]).unwrap();
    assert_eq!(buf.packet(), &[1, 2, 3]);
    buf.packet_mut()[0] = 9;
    assert_eq!(buf.packet(), &[9, 2, 3]);
    assert_eq!(buf.fill(&[0; 9]), Err(Error::TooLarge(9)));
    assert_eq!(buf.set_len(9), Err(Error::TooLarge(9)));
    buf.set_len(8).unwrap();
    assert_eq!(buf.len(), 8);
    assert_eq!(buf.capacity(), 8);
}
