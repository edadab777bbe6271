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
 *  Synthesised answers for blocked names.
 */
use crate::dns::dnspkt;

const BLOCKED_TTL: u32 = 5;
const BLOCKED_ZONE: &[&str] = &["org", "blokada", "invalid"];
pub const SINKHOLE_ADDR: std::net::Ipv4Addr = std::net::Ipv4Addr::UNSPECIFIED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerMode {
    /// An SOA for an invalid zone in the authority section.
    #[default]
    Classic,
    /// An A record pointing at the unspecified address.
    Sinkhole,
}

impl std::str::FromStr for AnswerMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(AnswerMode::Classic),
            "sinkhole" => Ok(AnswerMode::Sinkhole),
            other => Err(format!(
                "Unknown answer mode {:?}, expected classic or sinkhole",
                other
            )),
        }
    }
}

impl std::fmt::Display for AnswerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerMode::Classic => write!(f, "classic"),
            AnswerMode::Sinkhole => write!(f, "sinkhole"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DnsAnswerPolicy {
    mode: AnswerMode,
    soa: dnspkt::RR,
}

impl DnsAnswerPolicy {
    pub fn new(mode: AnswerMode) -> Self {
        let zone = dnspkt::Domain::from_static(BLOCKED_ZONE);
        Self {
            mode,
            soa: dnspkt::RR {
                domain: zone.clone(),
                class: dnspkt::CLASS_IN,
                rrtype: dnspkt::RR_SOA,
                ttl: BLOCKED_TTL,
                rdata: dnspkt::RData::Soa(dnspkt::SoaData {
                    mname: zone.clone(),
                    rname: zone,
                    serial: 0,
                    refresh: 0,
                    retry: 0,
                    expire: 0,
                    minimum: BLOCKED_TTL,
                }),
            },
        }
    }

    pub fn mode(&self) -> AnswerMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AnswerMode) {
        self.mode = mode;
    }

    /// Turn `msg` into the "blocked" response for its question.
    pub fn apply(&self, msg: &mut dnspkt::DNSPkt) {
        msg.qr = true;
        msg.tc = false;
        msg.rcode = dnspkt::NOERROR;
        msg.answer.clear();
        msg.nameserver.clear();
        msg.additional.clear();

        match self.mode {
            AnswerMode::Sinkhole if msg.question.qtype == dnspkt::RR_A => {
                msg.answer.push(dnspkt::RR {
                    domain: msg.question.qdomain.clone(),
                    class: dnspkt::CLASS_IN,
                    rrtype: dnspkt::RR_A,
                    ttl: BLOCKED_TTL,
                    rdata: dnspkt::RData::A(SINKHOLE_ADDR),
                });
            }
            _ => msg.nameserver.push(self.soa.clone()),
        }
    }
}

impl Default for DnsAnswerPolicy {
    fn default() -> Self {
        Self::new(AnswerMode::default())
    }
}

#[cfg(test)]
fn query(qtype: dnspkt::Type) -> dnspkt::DNSPkt {
    dnspkt::DNSPkt {
        qid: 7,
        rd: true,
        tc: false,
        aa: false,
        qr: false,
        opcode: dnspkt::OPCODE_QUERY,
        cd: false,
        ad: false,
        ra: false,
        rcode: dnspkt::NOERROR,
        bufsize: 1232,
        edns_ver: Some(0),
        edns_do: false,
        question: dnspkt::Question {
            qdomain: "ads.example.com".parse().unwrap(),
            qclass: dnspkt::CLASS_IN,
            qtype,
        },
        answer: vec![],
        nameserver: vec![],
        additional: vec![],
        edns: Some(dnspkt::EdnsData::new()),
    }
}

#[test]
fn test_classic_answer() {
    let policy = DnsAnswerPolicy::new(AnswerMode::Classic);
    let mut msg = query(dnspkt::RR_A);
    policy.apply(&mut msg);
    assert!(msg.qr);
    assert_eq!(msg.rcode, dnspkt::NOERROR);
    assert!(msg.answer.is_empty());
    assert_eq!(msg.nameserver.len(), 1);
    let soa = &msg.nameserver[0];
    assert_eq!(soa.ttl, 5);
    assert_eq!(soa.domain.to_string(), "org.blokada.invalid");
    match &soa.rdata {
        dnspkt::RData::Soa(s) => {
            assert_eq!(s.mname, soa.domain);
            assert_eq!(s.minimum, 5);
            assert_eq!(s.serial, 0);
        }
        other => panic!("unexpected rdata {:?}", other),
    }
    /* EDNS survives, and the result still serialises and reparses. */
    assert!(msg.edns.is_some());
    let wire = msg.serialise();
    assert_eq!(super::parse_message(&wire).unwrap(), msg);
}

#[test]
fn test_sinkhole_answer() {
    let policy = DnsAnswerPolicy::new(AnswerMode::Sinkhole);
    let mut msg = query(dnspkt::RR_A);
    msg.additional.push(dnspkt::RR {
        domain: "stale.example.com".parse().unwrap(),
        class: dnspkt::CLASS_IN,
        rrtype: dnspkt::RR_A,
        ttl: 60,
        rdata: dnspkt::RData::A("192.0.2.1".parse().unwrap()),
    });
    policy.apply(&mut msg);
    assert!(msg.nameserver.is_empty());
    assert!(msg.additional.is_empty());
    assert_eq!(msg.answer.len(), 1);
    assert_eq!(msg.answer[0].ttl, 5);
    assert_eq!(msg.answer[0].domain, msg.question.qdomain);
    assert_eq!(msg.answer[0].rdata, dnspkt::RData::A(SINKHOLE_ADDR));
}

#[test]
fn test_sinkhole_falls_back_for_other_types() {
    let policy = DnsAnswerPolicy::new(AnswerMode::Sinkhole);
    let mut msg = query(dnspkt::RR_AAAA);
    policy.apply(&mut msg);
    assert!(msg.answer.is_empty());
    assert_eq!(msg.nameserver[0].rrtype, dnspkt::RR_SOA);
}

#[test]
fn test_answer_mode_from_str() {
    assert_eq!("classic".parse(), Ok(AnswerMode::Classic));
    assert_eq!("sinkhole".parse(), Ok(AnswerMode::Sinkhole));
    assert!("nxdomain".parse::<AnswerMode>().is_err());
    assert_eq!(AnswerMode::Sinkhole.to_string(), "sinkhole");
}
