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
 *  Tests for the packet filter.
 */
use super::*;
use crate::filter::blockade::StaticBlockade;
use crate::filter::requestlog::MemoryRequestLog;

const DEVICE: &str = "10.111.222.1:40000";

fn servers() -> Vec<SocketAddrV4> {
    vec![
        "192.0.2.53:53".parse().unwrap(),
        "198.51.100.53:5353".parse().unwrap(),
    ]
}

fn device() -> SocketAddrV4 {
    DEVICE.parse().unwrap()
}

fn proxy(index: u8) -> SocketAddrV4 {
    SocketAddrV4::new(proxy_address(index), PROXY_PORT)
}

fn make_filter(answer: AnswerMode, cname_blocking: bool) -> (PacketFilter, Arc<MemoryRequestLog>) {
    let blockade = Arc::new(StaticBlockade::new(
        ["good.example.com", "first-party.example.org"],
        [
            "ads.example.com",
            "good.example.com",
            "tracker.example.net",
        ],
    ));
    let log = Arc::new(MemoryRequestLog::default());
    let settings = Settings {
        dns_servers: servers(),
        answer,
        cname_blocking,
        powersave: false,
    };
    (PacketFilter::new(&settings, blockade, log.clone()), log)
}

fn query_msg(qid: u16, name: &str, qtype: dnspkt::Type) -> dnspkt::DNSPkt {
    dnspkt::DNSPkt {
        qid,
        rd: true,
        tc: false,
        aa: false,
        qr: false,
        opcode: dnspkt::OPCODE_QUERY,
        cd: false,
        ad: false,
        ra: false,
        rcode: dnspkt::NOERROR,
        bufsize: 512,
        edns_ver: None,
        edns_do: false,
        question: dnspkt::Question {
            qdomain: name.parse().unwrap(),
            qclass: dnspkt::CLASS_IN,
            qtype,
        },
        answer: vec![],
        nameserver: vec![],
        additional: vec![],
        edns: None,
    }
}

fn a_record(name: &str, ip: &str) -> dnspkt::RR {
    dnspkt::RR {
        domain: name.parse().unwrap(),
        class: dnspkt::CLASS_IN,
        rrtype: dnspkt::RR_A,
        ttl: 300,
        rdata: dnspkt::RData::A(ip.parse().unwrap()),
    }
}

fn cname_record(name: &str, target: &str) -> dnspkt::RR {
    dnspkt::RR {
        domain: name.parse().unwrap(),
        class: dnspkt::CLASS_IN,
        rrtype: dnspkt::RR_CNAME,
        ttl: 300,
        rdata: dnspkt::RData::CName(target.parse().unwrap()),
    }
}

fn reply_msg(qid: u16, name: &str, answer: Vec<dnspkt::RR>) -> dnspkt::DNSPkt {
    let mut msg = query_msg(qid, name, dnspkt::RR_A);
    msg.qr = true;
    msg.ra = true;
    msg.answer = answer;
    msg
}

fn buffer(pkt: &[u8]) -> packet::PacketBuffer {
    let mut buf = packet::PacketBuffer::new(1500);
    buf.fill(pkt).unwrap();
    buf
}

fn query_packet(qid: u16, name: &str, proxy_index: u8) -> packet::PacketBuffer {
    let msg = query_msg(qid, name, dnspkt::RR_A);
    buffer(&packet::build_ipv4_udp(device(), proxy(proxy_index), &msg.serialise()).unwrap())
}

fn reply_packet(from: SocketAddrV4, msg: &dnspkt::DNSPkt) -> packet::PacketBuffer {
    buffer(&packet::build_ipv4_udp(from, device(), &msg.serialise()).unwrap())
}

fn decode(pkt: &[u8]) -> (SocketAddrV4, SocketAddrV4, dnspkt::DNSPkt) {
    let view = packet::Ipv4Udp::parse(pkt).unwrap();
    (view.src, view.dst, dns::parse_message(view.payload).unwrap())
}

#[test]
fn permitted_query_is_rewritten_to_first_server() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x1111, "safe.example.com", 1);
    let len = buf.len();

    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));

    assert!(loopback.is_empty());
    assert_eq!(buf.len(), len);
    let (src, dst, msg) = decode(buf.packet());
    assert_eq!(src, device());
    assert_eq!(dst, servers()[0]);
    assert_eq!(msg.question.qdomain.host(), "safe.example.com");
    assert_eq!(filter.one_way_requests(), 1);

    let entry = &log.recent()[0];
    assert_eq!(entry.id, 0x1111);
    assert_eq!(entry.domain, "safe.example.com");
    assert!(!entry.blocked);
    assert_eq!(entry.rcode, None);
}

#[test]
fn proxy_index_selects_server() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(2, "other.example.com", 2);
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
    let (_, dst, _) = decode(buf.packet());
    assert_eq!(dst, servers()[1]);
}

#[test]
fn unknown_proxy_index_is_not_forwarded() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    for index in [0, 3] {
        let mut buf = query_packet(3, "safe.example.com", index);
        let before = buf.packet().to_vec();
        assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
        assert_eq!(buf.packet(), &before[..]);
    }
    assert!(log.is_empty());
    assert_eq!(filter.one_way_requests(), 0);
}

#[test]
fn allowed_wins_over_denied() {
    let (mut filter, log) = make_filter(AnswerMode::Sinkhole, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(4, "Good.Example.COM", 1);
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
    assert!(loopback.is_empty());
    let (_, dst, _) = decode(buf.packet());
    assert_eq!(dst, servers()[0]);
    assert_eq!(log.recent()[0].domain, "good.example.com");
}

#[test]
fn blocked_query_sinkhole() {
    let (mut filter, log) = make_filter(AnswerMode::Sinkhole, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x2222, "ads.example.com", 1);

    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(true));

    assert_eq!(loopback.len(), 1);
    let (src, dst, msg) = decode(&loopback.pop().unwrap());
    assert_eq!(src, proxy(1));
    assert_eq!(dst, device());
    assert_eq!(msg.qid, 0x2222);
    assert!(msg.qr);
    assert_eq!(msg.rcode, dnspkt::NOERROR);
    assert_eq!(msg.answer.len(), 1);
    assert_eq!(msg.answer[0].ttl, 5);
    assert_eq!(msg.answer[0].rdata, dnspkt::RData::A(SINKHOLE_ADDR));
    assert_eq!(filter.one_way_requests(), 0);

    let entry = &log.recent()[0];
    assert!(entry.blocked);
    assert_eq!(entry.domain, "ads.example.com");
}

#[test]
fn blocked_query_classic() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x3333, "ads.example.com", 2);

    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(true));

    let (src, _, msg) = decode(&loopback.pop().unwrap());
    assert_eq!(src, proxy(2));
    assert!(msg.qr);
    assert!(msg.answer.is_empty());
    assert_eq!(msg.nameserver.len(), 1);
    assert_eq!(msg.nameserver[0].rrtype, dnspkt::RR_SOA);
    assert_eq!(msg.nameserver[0].ttl, 5);
    assert!(log.recent()[0].blocked);
}

#[test]
fn one_way_counter_boundary() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    for i in 1..=MAX_ONE_WAY_DNS_REQUESTS {
        let mut buf = query_packet(i as u16, &format!("host{}.example.com", i), 1);
        assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
    }
    assert_eq!(filter.one_way_requests(), 10);
    let mut buf = query_packet(11, "host11.example.com", 1);
    assert_eq!(
        filter.handle_from_device(&mut buf, &mut loopback),
        Err(Error::StuckSession(11))
    );
}

#[test]
fn reply_resets_one_way_counter() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    for i in 1..=MAX_ONE_WAY_DNS_REQUESTS {
        let mut buf = query_packet(i as u16, &format!("host{}.example.com", i), 1);
        filter.handle_from_device(&mut buf, &mut loopback).unwrap();
    }
    let reply = reply_msg(1, "host1.example.com", vec![a_record("host1.example.com", "192.0.2.1")]);
    let mut buf = reply_packet(servers()[0], &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
    assert_eq!(filter.one_way_requests(), 0);

    let mut buf = query_packet(12, "host12.example.com", 1);
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
}

#[test]
fn restart_resets_one_way_counter() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    for i in 1..=5u16 {
        let mut buf = query_packet(i, &format!("host{}.example.com", i), 1);
        filter.handle_from_device(&mut buf, &mut loopback).unwrap();
    }
    filter.restart();
    assert_eq!(filter.one_way_requests(), 0);
    filter.restart();
    assert_eq!(filter.one_way_requests(), 0);
}

#[test]
fn proxy_index_round_trip() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    for index in 1..=servers().len() as u8 {
        let qid = 0x100 + index as u16;
        let name = format!("rt{}.example.com", index);
        let mut buf = query_packet(qid, &name, index);
        assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
        let (_, upstream, _) = decode(buf.packet());

        let reply = reply_msg(qid, &name, vec![a_record(&name, "192.0.2.77")]);
        let mut buf = reply_packet(upstream, &reply);
        assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
        let (src, dst, msg) = decode(buf.packet());
        assert_eq!(src.ip().octets()[3], index);
        assert_eq!(src, proxy(index));
        assert_eq!(dst, device());
        assert_eq!(msg, reply);

        let entry = &log.recent()[0];
        assert_eq!(entry.id, qid);
        assert_eq!(entry.rcode, Some(0));
        assert_eq!(entry.ip, Some("192.0.2.77".parse().unwrap()));
    }
}

#[test]
fn cname_cloaking_is_blocked() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, true);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x4444, "a.example.com", 1);
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));

    let reply = reply_msg(
        0x4444,
        "a.example.com",
        vec![
            cname_record("a.example.com", "tracker.example.net"),
            a_record("tracker.example.net", "192.0.2.99"),
        ],
    );
    let mut buf = reply_packet(servers()[0], &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(true));

    let (src, dst, msg) = decode(buf.packet());
    assert_eq!(src, proxy(1));
    assert_eq!(dst, device());
    assert_eq!(msg.qid, 0x4444);
    assert!(msg.answer.is_empty());
    assert_eq!(msg.nameserver[0].rrtype, dnspkt::RR_SOA);

    let entry = &log.recent()[0];
    assert_eq!(entry.cnamed_domain.as_deref(), Some("tracker.example.net"));
    assert!(entry.blocked);
}

#[test]
fn cname_cloaking_disabled() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x4445, "a.example.com", 1);
    filter.handle_from_device(&mut buf, &mut loopback).unwrap();

    let reply = reply_msg(
        0x4445,
        "a.example.com",
        vec![
            cname_record("a.example.com", "tracker.example.net"),
            a_record("tracker.example.net", "192.0.2.99"),
        ],
    );
    let mut buf = reply_packet(servers()[0], &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
    let (_, _, msg) = decode(buf.packet());
    assert_eq!(msg, reply);
    let entry = &log.recent()[0];
    assert_eq!(entry.cnamed_domain, None);
    assert_eq!(entry.ip, Some("192.0.2.99".parse().unwrap()));
    assert!(!entry.blocked);
}

#[test]
fn cname_cloaking_respects_allowed_question() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, true);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x4446, "first-party.example.org", 1);
    filter.handle_from_device(&mut buf, &mut loopback).unwrap();

    let reply = reply_msg(
        0x4446,
        "first-party.example.org",
        vec![
            cname_record("first-party.example.org", "tracker.example.net"),
            a_record("tracker.example.net", "192.0.2.99"),
        ],
    );
    let mut buf = reply_packet(servers()[0], &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
    let (_, _, msg) = decode(buf.packet());
    assert_eq!(msg, reply);
    assert_eq!(log.recent()[0].cnamed_domain, None);
}

#[test]
fn upstream_blocked_reply() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, true);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x5555, "b.example.com", 1);
    filter.handle_from_device(&mut buf, &mut loopback).unwrap();

    let reply = reply_msg(
        0x5555,
        "b.example.com",
        vec![
            cname_record("b.example.com", "tracker.example.net"),
            a_record("tracker.example.net", "0.0.0.0"),
        ],
    );
    let mut buf = reply_packet(servers()[0], &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
    let (_, _, msg) = decode(buf.packet());
    assert_eq!(msg, reply);
    let entry = &log.recent()[0];
    assert_eq!(entry.ip, Some(SINKHOLE_ADDR));
    assert_eq!(entry.cnamed_domain, None);
}

#[test]
fn nxdomain_reply_is_passed_through() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, true);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(0x5556, "missing.example.com", 1);
    filter.handle_from_device(&mut buf, &mut loopback).unwrap();

    let mut reply = reply_msg(0x5556, "missing.example.com", vec![]);
    reply.rcode = dnspkt::NXDOMAIN;
    let mut buf = reply_packet(servers()[0], &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
    let entry = &log.recent()[0];
    assert_eq!(entry.rcode, Some(3));
    assert_eq!(entry.ip, None);
}

#[test]
fn ipv6_is_rejected() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    let mut pkt = vec![0u8; 60];
    pkt[0] = 0x60;
    pkt[6] = 17; /* Next header: UDP */
    let mut buf = buffer(&pkt);
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
    assert_eq!(buf.packet(), &pkt[..]);
    assert!(loopback.is_empty());
    assert!(log.is_empty());
    assert_eq!(filter.one_way_requests(), 0);
}

#[test]
fn non_dns_traffic_is_ignored() {
    let (mut filter, log) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();

    /* Not addressed to the proxy. */
    let msg = query_msg(1, "ads.example.com", dnspkt::RR_A);
    let mut buf = buffer(
        &packet::build_ipv4_udp(device(), "192.0.2.1:53".parse().unwrap(), &msg.serialise())
            .unwrap(),
    );
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));

    /* Not DNS. */
    let mut buf = buffer(&packet::build_ipv4_udp(device(), proxy(1), b"hello").unwrap());
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));

    /* No payload. */
    let mut buf = buffer(&packet::build_ipv4_udp(device(), proxy(1), &[]).unwrap());
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));

    /* Truncated junk. */
    let mut buf = buffer(&[0x45, 0x00, 0x00]);
    assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));

    assert!(loopback.is_empty());
    assert!(log.is_empty());
}

#[test]
fn servers_sharing_an_address_round_trip() {
    let blockade = Arc::new(StaticBlockade::default());
    let log = Arc::new(MemoryRequestLog::default());
    let settings = Settings::new(vec![
        "127.0.0.1:5353".parse().unwrap(),
        "127.0.0.1:5354".parse().unwrap(),
    ]);
    let mut filter = PacketFilter::new(&settings, blockade, log);
    let mut loopback = Loopback::default();
    for index in [2u8, 1] {
        let qid = 0x200 + index as u16;
        let mut buf = query_packet(qid, "shared.example.com", index);
        assert_eq!(filter.handle_from_device(&mut buf, &mut loopback), Ok(false));
        let (_, upstream, _) = decode(buf.packet());
        assert_eq!(upstream, settings.dns_servers[index as usize - 1]);

        let reply = reply_msg(qid, "shared.example.com", vec![]);
        let mut buf = reply_packet(upstream, &reply);
        assert_eq!(filter.handle_to_device(&mut buf), Ok(true));
        let (src, _, msg) = decode(buf.packet());
        assert_eq!(src, proxy(index));
        assert_eq!(msg.qid, qid);
    }
}

#[test]
fn reply_from_unknown_port_is_dropped() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let reply = reply_msg(1, "safe.example.com", vec![a_record("safe.example.com", "192.0.2.1")]);
    let mut buf = reply_packet("192.0.2.53:5353".parse().unwrap(), &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(false));
}

#[test]
fn reply_from_unknown_server_is_dropped() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let reply = reply_msg(1, "safe.example.com", vec![a_record("safe.example.com", "192.0.2.1")]);
    let mut buf = reply_packet("203.0.113.99:53".parse().unwrap(), &reply);
    assert_eq!(filter.handle_to_device(&mut buf), Ok(false));
}

#[test]
fn malformed_reply_is_dropped() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let mut buf = buffer(&packet::build_ipv4_udp(servers()[0], device(), b"\x00\x01junk").unwrap());
    assert_eq!(filter.handle_to_device(&mut buf), Ok(false));
}

#[test]
fn settings_are_applied() {
    let (mut filter, _) = make_filter(AnswerMode::Classic, false);
    let mut loopback = Loopback::default();
    let mut buf = query_packet(1, "safe.example.com", 1);
    filter.handle_from_device(&mut buf, &mut loopback).unwrap();

    let mut settings = Settings::new(vec!["192.0.2.200:53".parse().unwrap()]);
    settings.answer = AnswerMode::Sinkhole;
    filter.set_settings(&settings);
    assert_eq!(filter.one_way_requests(), 0);
    assert_eq!(filter.answer_mode(), AnswerMode::Sinkhole);
    assert_eq!(filter.servers(), &settings.dns_servers[..]);

    let mut buf = query_packet(2, "safe2.example.com", 1);
    filter.handle_from_device(&mut buf, &mut loopback).unwrap();
    let (_, dst, _) = decode(buf.packet());
    assert_eq!(dst, "192.0.2.200:53".parse().unwrap());
}
