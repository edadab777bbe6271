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
 *  Runs the event loop against a fake tun device and a local resolver.
 */
use super::*;
use crate::config::ForwarderConfig;
use crate::dns;
use crate::dns::answer::AnswerMode;
use crate::dns::dnspkt;
use crate::filter::blockade::StaticBlockade;
use crate::filter::requestlog::MemoryRequestLog;
use crate::filter::{proxy_address, PROXY_PORT};
use std::net::{SocketAddrV4, UdpSocket};
use std::thread::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    device: UnixDatagram,
    upstream: UdpSocket,
    handle: TunnelHandle,
    log: Arc<MemoryRequestLog>,
    events: Arc<Mutex<Vec<TunnelEvent>>>,
    thread: Option<JoinHandle<()>>,
}

impl Harness {
    fn start(answer: AnswerMode) -> Self {
        Self::start_with(answer, false, Forwarder::new(&ForwarderConfig::default()))
    }

    fn start_with(answer: AnswerMode, powersave: bool, forwarder: Forwarder) -> Self {
        let (device, tun) = UnixDatagram::pair().unwrap();
        device.set_read_timeout(Some(TIMEOUT)).unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        upstream.set_read_timeout(Some(TIMEOUT)).unwrap();

        let mut settings = Settings::new(vec![socket_v4(&upstream)]);
        settings.answer = answer;
        settings.powersave = powersave;
        let blockade = Arc::new(StaticBlockade::new(
            ["allowed.example.com"],
            ["ads.example.com", "allowed.example.com"],
        ));
        let log = Arc::new(MemoryRequestLog::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let mut tunnel = TunnelEventLoop::new(
            tun,
            &settings,
            blockade,
            log.clone(),
            forwarder,
        )
        .with_events(Arc::new(move |event: TunnelEvent| {
            sink.lock().unwrap().push(event)
        }));
        let handle = tunnel.handle();
        let thread = std::thread::Builder::new()
            .name("dns-tunnel-test".into())
            .spawn(move || tunnel.run_with_retry())
            .unwrap();

        Harness {
            device,
            upstream,
            handle,
            log,
            events,
            thread: Some(thread),
        }
    }

    fn settings(&self) -> Settings {
        Settings::new(vec![socket_v4(&self.upstream)])
    }

    fn send_query(&self, qid: u16, name: &str) {
        let pkt = packet::build_ipv4_udp(client(), proxy(), &query(qid, name).serialise()).unwrap();
        self.device.send(&pkt).unwrap();
    }

    fn recv_reply(&self) -> (SocketAddrV4, SocketAddrV4, dnspkt::DNSPkt) {
        recv_reply(&self.device)
    }

    fn restarts(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TunnelEvent::Restarting { .. }))
            .count()
    }

    fn wait_for_event(&self, wanted: &TunnelEvent) {
        let deadline = Instant::now() + TIMEOUT;
        while !self.events.lock().unwrap().contains(wanted) {
            assert!(Instant::now() < deadline, "never saw {:?}", wanted);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn stop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

fn recv_reply(device: &UnixDatagram) -> (SocketAddrV4, SocketAddrV4, dnspkt::DNSPkt) {
    let mut buf = [0u8; 2048];
    let len = device.recv(&mut buf).unwrap();
    let view = packet::Ipv4Udp::parse(&buf[..len]).unwrap();
    (view.src, view.dst, dns::parse_message(view.payload).unwrap())
}

fn failing_factory(errno: Errno) -> forwarder::SocketFactory {
    Box::new(move || Err(io::Error::from_raw_os_error(errno as i32)))
}

/* A loop that is driven by hand rather than by `run`. */
fn manual_loop(
    servers: Vec<SocketAddrV4>,
    forwarder: Forwarder,
) -> (TunnelEventLoop<UnixDatagram>, UnixDatagram) {
    let (device, tun) = UnixDatagram::pair().unwrap();
    device.set_read_timeout(Some(TIMEOUT)).unwrap();
    let tunnel = TunnelEventLoop::new(
        tun,
        &Settings::new(servers),
        Arc::new(StaticBlockade::default()),
        Arc::new(MemoryRequestLog::default()),
        forwarder,
    );
    (tunnel, device)
}

fn device_packet(qid: u16, name: &str, dst: SocketAddrV4) -> packet::PacketBuffer {
    let pkt = packet::build_ipv4_udp(client(), dst, &query(qid, name).serialise()).unwrap();
    let mut buf = packet::PacketBuffer::new(MAX_PACKET);
    buf.fill(&pkt).unwrap();
    buf
}

fn socket_v4(socket: &UdpSocket) -> SocketAddrV4 {
    match socket.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    }
}

fn client() -> SocketAddrV4 {
    "10.111.222.1:40000".parse().unwrap()
}

fn proxy() -> SocketAddrV4 {
    SocketAddrV4::new(proxy_address(1), PROXY_PORT)
}

fn query(qid: u16, name: &str) -> dnspkt::DNSPkt {
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
            qtype: dnspkt::RR_A,
        },
        answer: vec![],
        nameserver: vec![],
        additional: vec![],
        edns: None,
    }
}

/* Act as the upstream resolver for one query, answering with `ip`. */
fn answer_one(upstream: &UdpSocket, ip: &str) -> dnspkt::DNSPkt {
    let mut buf = [0u8; 2048];
    let (len, from) = upstream.recv_from(&mut buf).unwrap();
    let mut msg = dns::parse_message(&buf[..len]).unwrap();
    let received = msg.clone();
    msg.qr = true;
    msg.ra = true;
    msg.answer = vec![dnspkt::RR {
        domain: msg.question.qdomain.clone(),
        class: dnspkt::CLASS_IN,
        rrtype: dnspkt::RR_A,
        ttl: 60,
        rdata: dnspkt::RData::A(ip.parse().unwrap()),
    }];
    upstream.send_to(&msg.serialise(), from).unwrap();
    received
}

#[test]
fn permitted_query_round_trip() {
    let mut h = Harness::start(AnswerMode::Classic);
    h.send_query(0x1234, "www.example.com");

    let seen = answer_one(&h.upstream, "192.0.2.80");
    assert_eq!(seen.qid, 0x1234);
    assert_eq!(seen.question.qdomain.host(), "www.example.com");

    let (src, dst, reply) = h.recv_reply();
    assert_eq!(src, proxy());
    assert_eq!(dst, client());
    assert_eq!(reply.qid, 0x1234);
    assert_eq!(
        reply.first_a().map(|(_, ip)| ip),
        Some("192.0.2.80".parse().unwrap())
    );

    let entry = &h.log.recent()[0];
    assert_eq!(entry.domain, "www.example.com");
    assert!(!entry.blocked);
    assert_eq!(entry.rcode, Some(dnspkt::NOERROR.0));
    h.stop();
}

#[test]
fn allowed_query_is_forwarded() {
    let mut h = Harness::start(AnswerMode::Classic);
    h.send_query(7, "allowed.example.com");
    answer_one(&h.upstream, "192.0.2.81");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 7);
    assert_eq!(reply.answer.len(), 1);
    h.stop();
}

#[test]
fn blocked_query_answered_locally() {
    let mut h = Harness::start(AnswerMode::Classic);
    h.send_query(0x4321, "ads.example.com");

    let (src, dst, reply) = h.recv_reply();
    assert_eq!(src, proxy());
    assert_eq!(dst, client());
    assert_eq!(reply.qid, 0x4321);
    assert!(reply.qr);
    assert_eq!(reply.rcode, dnspkt::NOERROR);
    assert!(reply.answer.is_empty());
    assert_eq!(reply.nameserver.len(), 1);
    assert_eq!(reply.nameserver[0].rrtype, dnspkt::RR_SOA);

    assert!(h.log.recent()[0].blocked);
    h.stop();
}

#[test]
fn loop_survives_garbage() {
    let mut h = Harness::start(AnswerMode::Sinkhole);
    h.device.send(&[0x45, 0x00, 0x00]).unwrap();
    h.device.send(b"not a packet at all").unwrap();
    h.send_query(9, "ads.example.com");

    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 9);
    assert_eq!(
        reply.first_a().map(|(_, ip)| ip),
        Some(std::net::Ipv4Addr::UNSPECIFIED)
    );
    h.stop();
}

#[test]
fn reconfigure_changes_answer_mode() {
    let mut h = Harness::start(AnswerMode::Classic);
    h.send_query(1, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert!(reply.answer.is_empty());

    let mut settings = h.settings();
    settings.answer = AnswerMode::Sinkhole;
    h.handle.reconfigure(settings);

    h.send_query(2, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 2);
    assert_eq!(reply.answer.len(), 1);
    h.stop();
}

#[test]
fn stuck_session_restarts() {
    let mut h = Harness::start(AnswerMode::Classic);
    for qid in 0..=(filter::MAX_ONE_WAY_DNS_REQUESTS as u16) {
        h.send_query(qid, "silent.example.com");
    }
    h.wait_for_event(&TunnelEvent::Stuck);
    h.wait_for_event(&TunnelEvent::Restarting {
        delay: Duration::from_millis(300),
    });

    /* The restarted loop still answers. */
    h.send_query(100, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 100);
    h.stop();
}

#[test]
fn stop_before_run() {
    let (_device, tun) = UnixDatagram::pair().unwrap();
    let settings = Settings::new(vec!["127.0.0.1:53".parse().unwrap()]);
    let mut tunnel = TunnelEventLoop::new(
        tun,
        &settings,
        Arc::new(StaticBlockade::default()),
        Arc::new(MemoryRequestLog::default()),
        Forwarder::new(&ForwarderConfig::default()),
    );
    let handle = tunnel.handle();
    handle.stop();
    handle.stop();
    assert!(handle.is_stopped());
    assert!(tunnel.run().is_ok());
    tunnel.run_with_retry();
}

#[test]
fn stop_is_idempotent() {
    let mut h = Harness::start(AnswerMode::Classic);
    h.handle.stop();
    h.stop();
    h.stop();
    assert!(h.handle.is_stopped());
}

#[test]
fn eperm_counting() {
    let (_device, tun) = UnixDatagram::pair().unwrap();
    let mut settings = Settings::new(vec!["127.0.0.1:53".parse().unwrap()]);
    settings.powersave = true;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let mut tunnel = TunnelEventLoop::new(
        tun,
        &settings,
        Arc::new(StaticBlockade::default()),
        Arc::new(MemoryRequestLog::default()),
        Forwarder::new(&ForwarderConfig::default()),
    )
    .with_events(Arc::new(move |event: TunnelEvent| {
        sink.lock().unwrap().push(event)
    }));

    let eperm = || Error::Io(io::Error::from_raw_os_error(Errno::EPERM as i32));
    tunnel.note_failure(&eperm());
    tunnel.note_failure(&eperm());
    assert!(events.lock().unwrap().is_empty());
    tunnel.note_failure(&eperm());
    assert_eq!(*events.lock().unwrap(), vec![TunnelEvent::PowerSaving]);

    /* Any other failure starts the count again. */
    tunnel.note_failure(&eperm());
    tunnel.note_failure(&eperm());
    tunnel.note_failure(&Error::Filter(filter::Error::StuckSession(11)));
    tunnel.note_failure(&eperm());
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[test]
fn wait_for_stop_interrupted() {
    let (_device, tun) = UnixDatagram::pair().unwrap();
    let settings = Settings::new(vec!["127.0.0.1:53".parse().unwrap()]);
    let tunnel = TunnelEventLoop::new(
        tun,
        &settings,
        Arc::new(StaticBlockade::default()),
        Arc::new(MemoryRequestLog::default()),
        Forwarder::new(&ForwarderConfig::default()),
    );
    assert!(!tunnel.wait_for_stop(Duration::from_millis(10)));

    let handle = tunnel.handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    });
    let start = Instant::now();
    assert!(tunnel.wait_for_stop(Duration::from_secs(60)));
    assert!(start.elapsed() < Duration::from_secs(30));
    stopper.join().unwrap();
}

#[test]
fn restart_keeps_inflight_queries() {
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    upstream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let (mut tunnel, device) = manual_loop(
        vec![socket_v4(&upstream)],
        Forwarder::new(&ForwarderConfig::default()),
    );

    let mut buf = device_packet(0x55, "late.example.com", proxy());
    assert_eq!(
        tunnel.filter.handle_from_device(&mut buf, &mut tunnel.loopback),
        Ok(false)
    );
    tunnel.forward(&buf).unwrap();
    assert_eq!(tunnel.forwarder.size(), 1);
    assert_eq!(tunnel.filter().one_way_requests(), 1);

    tunnel.restart();
    assert_eq!(tunnel.forwarder.size(), 1);
    assert_eq!(tunnel.filter().one_way_requests(), 0);

    answer_one(&upstream, "192.0.2.90");
    {
        let rule = tunnel.forwarder.iter().next().unwrap();
        let mut fds = [PollFd::new(rule, PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, 5000).unwrap(), 1);
    }
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    tunnel.from_forwarder(0, &mut datagram, &mut buf);
    assert_eq!(tunnel.forwarder.size(), 0);
    assert_eq!(tunnel.forwarder.idle(), 1);

    let (src, dst, reply) = recv_reply(&device);
    assert_eq!(src, proxy());
    assert_eq!(dst, client());
    assert_eq!(reply.qid, 0x55);
}

#[test]
fn forward_eperm_is_fatal() {
    let server: SocketAddrV4 = "127.0.0.1:53".parse().unwrap();
    let forwarder = Forwarder::with_factory(&ForwarderConfig::default(), failing_factory(Errno::EPERM));
    let (mut tunnel, _device) = manual_loop(vec![server], forwarder);
    let buf = device_packet(1, "www.example.com", server);
    match tunnel.forward(&buf) {
        Err(e @ Error::Forward(_)) => assert!(e.is_eperm()),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(tunnel.forwarder.size(), 0);
}

#[test]
fn forward_unreachable_is_dropped() {
    let server: SocketAddrV4 = "127.0.0.1:53".parse().unwrap();
    let forwarder =
        Forwarder::with_factory(&ForwarderConfig::default(), failing_factory(Errno::ENETUNREACH));
    let (mut tunnel, _device) = manual_loop(vec![server], forwarder);
    let buf = device_packet(1, "www.example.com", server);
    assert!(tunnel.forward(&buf).is_ok());
    assert_eq!(tunnel.forwarder.size(), 0);
}

#[test]
fn forward_exhausted_is_dropped() {
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server = socket_v4(&upstream);
    let config = ForwarderConfig {
        max_sockets: 1,
        timeout: Duration::from_secs(3600),
    };
    let (mut tunnel, _device) = manual_loop(vec![server], Forwarder::new(&config));
    assert!(tunnel.forward(&device_packet(1, "one.example.com", server)).is_ok());
    assert!(tunnel.forward(&device_packet(2, "two.example.com", server)).is_ok());
    assert_eq!(tunnel.forwarder.size(), 1);
}

#[test]
fn forward_ignores_other_destinations() {
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server = socket_v4(&upstream);
    let (mut tunnel, _device) =
        manual_loop(vec![server], Forwarder::new(&ForwarderConfig::default()));
    let stray = "127.0.0.1:9".parse().unwrap();
    assert!(tunnel.forward(&device_packet(1, "www.example.com", stray)).is_ok());
    let broadcast = "10.111.222.255:53".parse().unwrap();
    assert!(tunnel.forward(&device_packet(2, "www.example.com", broadcast)).is_ok());
    assert_eq!(tunnel.forwarder.size(), 0);
}

#[test]
fn eperm_from_forwarder_restarts_loop() {
    let forwarder = Forwarder::with_factory(&ForwarderConfig::default(), failing_factory(Errno::EPERM));
    let mut h = Harness::start_with(AnswerMode::Classic, true, forwarder);
    for qid in 1..=3 {
        h.send_query(qid, &format!("q{}.example.com", qid));
    }
    h.wait_for_event(&TunnelEvent::PowerSaving);
    assert!(h.restarts() >= 3);

    /* Blocked queries don't need the forwarder, so the restarted loop still answers them. */
    h.send_query(50, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 50);
    h.stop();
}

#[test]
fn unreachable_upstream_keeps_loop_running() {
    let forwarder =
        Forwarder::with_factory(&ForwarderConfig::default(), failing_factory(Errno::ENETUNREACH));
    let mut h = Harness::start_with(AnswerMode::Classic, true, forwarder);
    h.send_query(1, "www.example.com");
    h.send_query(2, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 2);
    assert_eq!(h.restarts(), 0);
    h.stop();
}

#[test]
fn exhausted_forwarder_keeps_loop_running() {
    let config = ForwarderConfig {
        max_sockets: 1,
        timeout: Duration::from_secs(3600),
    };
    let mut h = Harness::start_with(AnswerMode::Classic, false, Forwarder::new(&config));
    h.send_query(1, "one.example.com");
    h.send_query(2, "two.example.com");
    h.send_query(3, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 3);
    assert_eq!(h.restarts(), 0);

    let seen = answer_one(&h.upstream, "192.0.2.91");
    assert_eq!(seen.qid, 1);
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 1);
    h.stop();
}

#[test]
fn reconfigure_keeps_inflight_queries() {
    let mut h = Harness::start(AnswerMode::Classic);
    h.send_query(0x77, "slow.example.com");
    let mut buf = [0u8; 2048];
    let (len, from) = h.upstream.recv_from(&mut buf).unwrap();

    let mut settings = h.settings();
    settings.answer = AnswerMode::Sinkhole;
    h.handle.reconfigure(settings);
    h.send_query(0x78, "ads.example.com");
    let (_, _, reply) = h.recv_reply();
    assert_eq!(reply.qid, 0x78);
    assert_eq!(reply.answer.len(), 1);

    /* The answer to the query sent before the reconfigure still gets through. */
    let mut msg = dns::parse_message(&buf[..len]).unwrap();
    msg.qr = true;
    h.upstream.send_to(&msg.serialise(), from).unwrap();
    let (src, _, reply) = h.recv_reply();
    assert_eq!(src, proxy());
    assert_eq!(reply.qid, 0x77);
    h.stop();
}
