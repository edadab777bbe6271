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
 *  Datastructures and serialisation of DNS packets.
 */

use std::fmt;

#[derive(Eq, Ord, PartialOrd, PartialEq, Clone, Copy)]
pub struct Class(pub u16);

pub const CLASS_IN: Class = Class(1); /* Internet */

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            &CLASS_IN => write!(f, "IN"),
            Class(x) => write!(f, "Class#{}", x),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Class({})", self)
    }
}

#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Copy)]
pub struct Type(pub u16);

pub const RR_A: Type = Type(1);
pub const RR_NS: Type = Type(2);
pub const RR_CNAME: Type = Type(5);
pub const RR_SOA: Type = Type(6);
pub const RR_PTR: Type = Type(12);
pub const RR_AAAA: Type = Type(28);
pub const RR_OPT: Type = Type(41);

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            &RR_A => write!(f, "A"),
            &RR_NS => write!(f, "NS"),
            &RR_CNAME => write!(f, "CNAME"),
            &RR_SOA => write!(f, "SOA"),
            &RR_PTR => write!(f, "PTR"),
            &RR_AAAA => write!(f, "AAAA"),
            &RR_OPT => write!(f, "OPT"),
            Type(x) => write!(f, "Type#{}", x),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Type({})", self)
    }
}

#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Copy)]
pub struct RCode(pub u16);
pub const NOERROR: RCode = RCode(0);
pub const FORMERR: RCode = RCode(1);
pub const SERVFAIL: RCode = RCode(2);
pub const NXDOMAIN: RCode = RCode(3);
pub const NOTIMP: RCode = RCode(4);
pub const REFUSED: RCode = RCode(5);

impl fmt::Display for RCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            &NOERROR => write!(f, "NOERROR"),
            &FORMERR => write!(f, "FORMERR"),
            &SERVFAIL => write!(f, "SERVFAIL"),
            &NXDOMAIN => write!(f, "NXDOMAIN"),
            &NOTIMP => write!(f, "NOTIMP"),
            &REFUSED => write!(f, "REFUSED"),
            RCode(x) => write!(f, "RCode#{}", x),
        }
    }
}

impl fmt::Debug for RCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RCode({})", self)
    }
}

fn display_byte(b: u8) -> String {
    match b {
        n @ 32..=127 => char::from(n).to_string(),
        n => format!("\\{}", n),
    }
}

#[derive(Ord, Clone, PartialEq, Eq, PartialOrd, Hash, Debug)]
pub struct Label(Vec<u8>);

impl Label {
    fn eq_ignore_case(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl TryFrom<Vec<u8>> for Label {
    type Error = &'static str;
    fn try_from(mut v: Vec<u8>) -> Result<Self, Self::Error> {
        if v.is_empty() {
            return Err("illegal empty label");
        }
        if v.len() > 63 {
            return Err("label too long");
        }
        v.shrink_to_fit();
        Ok(Label(v))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.0.iter().map(|&b| display_byte(b)).collect::<String>()
        )
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Hash)]
pub struct Domain(Vec<Label>);

impl Domain {
    /// Builds a domain from labels that are known to be valid.
    pub(crate) fn from_static(labels: &[&'static str]) -> Self {
        Domain(
            labels
                .iter()
                .map(|l| Label(l.as_bytes().to_vec()))
                .collect(),
        )
    }

    /// Domain names compare case insensitively on the wire.
    pub fn eq_ignore_case(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(l, r)| l.eq_ignore_case(r))
    }

    /// The lower cased, dot separated name without the trailing root label, as used for policy
    /// lookups and logging.
    pub fn host(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl From<Vec<Label>> for Domain {
    fn from(mut v: Vec<Label>) -> Self {
        v.shrink_to_fit();
        Domain(v)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.0
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<String>>()
                .join(".")
        )
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Domain({:?})", self.0)
    }
}

impl std::str::FromStr for Domain {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut v = vec![];
        let mut l = vec![];
        for c in s.chars() {
            match c {
                '\\' => return Err("\\ not supported in domain names"),
                '.' => {
                    v.push(Label::try_from(l)?);
                    l = vec![]
                }
                ch if ch.is_ascii() => l.push(ch as u8),
                _ => return Err("illegal charactor in label"),
            }
        }
        if !l.is_empty() {
            v.push(Label::try_from(l)?);
        }
        v.shrink_to_fit();
        Ok(Domain(v))
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Question {
    pub qdomain: Domain,
    pub qclass: Class,
    pub qtype: Type,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} {:?}", self.qdomain, self.qclass, self.qtype)
    }
}

impl fmt::Debug for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Question({:?} {:?} {:?})",
            self.qdomain, self.qclass, self.qtype
        )
    }
}

#[derive(Ord, Eq, PartialEq, PartialOrd, Clone, Debug)]
pub struct EdnsCode(pub u16);

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EdnsOption {
    pub code: EdnsCode,
    pub data: Vec<u8>,
}

/// EDNS options are carried through opaquely.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct EdnsData(Vec<EdnsOption>);

impl EdnsData {
    pub const fn new() -> Self {
        Self(vec![])
    }

    fn push_opt(&self, v: &mut Vec<u8>) {
        for o in &self.0 {
            push_u16(v, o.code.0);
            push_u16(v, o.data.len() as u16);
            v.extend_from_slice(o.data.as_slice());
        }
    }

    pub fn set_opt(&mut self, opt: EdnsOption) {
        self.0.push(opt);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SoaData {
    pub mname: Domain,
    pub rname: Domain,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RData {
    A(std::net::Ipv4Addr),
    CName(Domain),
    Ns(Domain),
    Ptr(Domain),
    Soa(SoaData),
    Opt(EdnsData),
    Other(Vec<u8>),
}

impl std::fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RData::*;
        match self {
            A(ip) => write!(f, "{}", ip),
            CName(d) | Ns(d) | Ptr(d) => write!(f, "\"{}\"", d),
            Soa(v) => write!(
                f,
                "{:?} {:?} {} {} {} {} {}",
                v.mname, v.rname, v.serial, v.refresh, v.retry, v.expire, v.minimum
            ),
            Opt(v) => write!(f, "{:?}", v),
            Other(v) => write!(f, "\\#{} {:?}", v.len(), v),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct RR {
    pub domain: Domain,
    pub class: Class,
    pub rrtype: Type,
    pub ttl: u32,
    pub rdata: RData,
}

impl std::fmt::Display for RR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" {} {:?} {:?} {}",
            self.domain, self.ttl, self.class, self.rrtype, self.rdata
        )
    }
}

impl fmt::Debug for RR {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RR({})", self)
    }
}

#[derive(Ord, Eq, PartialOrd, PartialEq, Clone, Copy)]
pub struct Opcode(pub u8);

pub const OPCODE_QUERY: Opcode = Opcode(0);

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            &OPCODE_QUERY => write!(f, "QUERY"),
            Opcode(x) => write!(f, "#{}", x),
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Opcode({})", self)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DNSPkt {
    pub qid: u16,
    pub rd: bool,
    pub tc: bool,
    pub aa: bool,
    pub qr: bool,
    pub opcode: Opcode,

    pub cd: bool,
    pub ad: bool,
    pub ra: bool,
    pub rcode: RCode,
    pub bufsize: u16,
    pub edns_ver: Option<u8>,
    pub edns_do: bool,

    pub question: Question,

    pub answer: Vec<RR>,
    pub nameserver: Vec<RR>,
    pub additional: Vec<RR>,

    pub edns: Option<EdnsData>,
}

#[derive(Clone)]
struct DomainTree<T: Default> {
    label: Label,
    data: T,
    children: std::collections::LinkedList<Self>,
}

#[cfg(test)]
impl<T: fmt::Debug + Default> fmt::Debug for DomainTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DomainTree(label: {}, data: {:?}, children: {:#?})",
            self.label, self.data, self.children
        )
    }
}

impl<T: Default> DomainTree<T> {
    fn new() -> Self {
        DomainTree {
            label: Label("root".into()),
            data: Default::default(),
            children: Default::default(),
        }
    }
}

type DomainOffsets = DomainTree<u16>;

fn push_u16(v: &mut Vec<u8>, d: u16) {
    v.extend_from_slice(&d.to_be_bytes());
}

fn push_u32(v: &mut Vec<u8>, d: u32) {
    v.extend_from_slice(&d.to_be_bytes());
}

fn push_label(v: &mut Vec<u8>, l: &Label) {
    v.push(l.0.len() as u8);
    v.extend_from_slice(l.0.as_slice())
}

/* Label compression over a suffix tree of the domains already written.
 * node is Some if a node exists in the tree for the suffix seen so far, None if not (and a label
 * must be written).
 * Returns Some with a new node to attach if this call wrote a label, or None if an existing node
 * covered the rest of the domain and a compression pointer was written.
 */
fn push_prefix(
    v: &mut Vec<u8>,
    l: &[Label],
    node: &mut Option<&mut DomainOffsets>,
    base_offset: usize,
) -> Option<DomainOffsets> {
    let label = &l[l.len() - 1];
    let prefix = &l[..l.len() - 1];
    let mut child = None;
    if let Some(ref mut node) = node {
        for it in &mut node.children {
            if it.label == *label {
                child = Some(&mut *it);
            }
        }
    }
    if !prefix.is_empty() {
        let ret = push_prefix(v, prefix, &mut child, base_offset);
        match (ret, child) {
            (None, None) => {
                /* A pointer was written for a suffix that has no node. */
                unreachable!()
            }
            (None, Some(_)) => None,
            (Some(r), None) => {
                let offset = v.len() + base_offset;
                push_label(v, label);
                let mut children = std::collections::LinkedList::new();
                children.push_back(r);
                Some(DomainTree {
                    label: label.clone(),
                    data: offset as u16,
                    children,
                })
            }
            (Some(r), Some(n)) => {
                n.children.push_back(r);
                v.push(0b1100_0000u8 + (n.data >> 8) as u8);
                v.push((n.data & 0xff) as u8);
                None
            }
        }
    } else {
        match &child {
            None => {
                let offset = v.len() + base_offset;
                push_label(v, label);
                Some(DomainTree {
                    label: label.clone(),
                    data: offset as u16,
                    children: std::collections::LinkedList::new(),
                })
            }
            Some(n) => {
                v.push(0b1100_0000u8 + (n.data >> 8) as u8);
                v.push((n.data & 0xff) as u8);
                None
            }
        }
    }
}

fn push_compressed_domain(
    v: &mut Vec<u8>,
    d: &Domain,
    offsets: &mut DomainOffsets,
    base_offset: usize,
) {
    if d.0.is_empty() {
        v.push(0u8);
    } else {
        match push_prefix(v, &d.0, &mut Some(offsets), base_offset) {
            None => { /* Suffix compression already output */ }
            Some(n) => {
                offsets.children.push_back(n);
                v.push(0u8);
            }
        }
    }
}

fn push_rr(v: &mut Vec<u8>, rr: &RR, offsets: &mut DomainOffsets) {
    push_compressed_domain(v, &rr.domain, offsets, 0);
    push_u16(v, rr.rrtype.0);
    push_u16(v, rr.class.0);
    push_u32(v, rr.ttl);
    match &rr.rdata {
        RData::A(ip) => {
            push_u16(v, 4);
            v.extend_from_slice(&ip.octets());
        }
        RData::CName(d) | RData::Ptr(d) | RData::Ns(d) => {
            let mut vs = vec![];
            push_compressed_domain(&mut vs, d, offsets, v.len() + 2);
            push_u16(v, vs.len() as u16);
            v.extend_from_slice(vs.as_slice());
        }
        RData::Soa(s) => {
            let mut vs = vec![];
            push_compressed_domain(&mut vs, &s.mname, offsets, v.len() + 2);
            push_compressed_domain(&mut vs, &s.rname, offsets, v.len() + 2);
            push_u32(&mut vs, s.serial);
            push_u32(&mut vs, s.refresh);
            push_u32(&mut vs, s.retry);
            push_u32(&mut vs, s.expire);
            push_u32(&mut vs, s.minimum);

            push_u16(v, vs.len() as u16);
            v.extend_from_slice(vs.as_slice());
        }
        RData::Opt(o) => {
            let mut vo = vec![];
            o.push_opt(&mut vo);

            push_u16(v, vo.len() as u16);
            v.extend_from_slice(vo.as_slice());
        }
        RData::Other(x) => {
            push_u16(v, x.len() as u16);
            v.extend_from_slice(x.as_slice());
        }
    }
}

impl DNSPkt {
    /// The first A record in the answer section.
    pub fn first_a(&self) -> Option<(&Domain, std::net::Ipv4Addr)> {
        self.answer.iter().find_map(|rr| match rr.rdata {
            RData::A(ip) => Some((&rr.domain, ip)),
            _ => None,
        })
    }

    pub fn serialise(&self) -> Vec<u8> {
        self.serialise_with_size(65535)
    }

    pub fn serialise_with_size(&self, size: usize) -> Vec<u8> {
        let mut ret: Vec<u8> = Vec::new();
        let mut offsets = DomainOffsets::new();
        let flag1: u8 = u8::from(self.rd)
            | (if self.tc { 0b0000_0010 } else { 0b0 })
            | (if self.aa { 0b0000_0100 } else { 0b0 })
            | (if self.qr { 0b1000_0000 } else { 0b0 })
            | ((self.opcode.0 & 0b1111) << 3);
        let flag2: u8 = (if self.cd { 0b0010_0000 } else { 0b0 })
            | (if self.ad { 0b0100_0000 } else { 0b0 })
            | (if self.ra { 0b1000_0000 } else { 0b0 })
            | ((self.rcode.0 & 0b0000_1111) as u8);
        let mut additional = self.additional.clone();

        if let Some(edns) = &self.edns {
            additional.push(RR {
                domain: Domain::from(vec![]),
                class: Class(self.bufsize),
                rrtype: RR_OPT,
                ttl: (((self.rcode.0 >> 4) as u32 & 0xFF) << 24)
                    | ((self.edns_ver.unwrap_or(0) as u32) << 16)
                    | (if self.edns_do {
                        0b0000_0000_0000_0000_1000_0000_0000_0000
                    } else {
                        0b0
                    }),
                rdata: RData::Opt(edns.clone()),
            });
        }

        push_u16(&mut ret, self.qid);
        ret.push(flag1);
        ret.push(flag2);
        push_u16(&mut ret, 1); // qcount
        push_u16(&mut ret, self.answer.len() as u16);
        push_u16(&mut ret, self.nameserver.len() as u16);
        push_u16(&mut ret, additional.len() as u16);
        push_compressed_domain(&mut ret, &self.question.qdomain, &mut offsets, 0);
        push_u16(&mut ret, self.question.qtype.0);
        push_u16(&mut ret, self.question.qclass.0);

        let mut trunc = false;
        let mut counts = [0u16; 3];

        for (section, rrs) in [&self.answer, &self.nameserver, &additional]
            .iter()
            .enumerate()
        {
            for rr in rrs.iter() {
                let offset = ret.len();
                push_rr(&mut ret, rr, &mut offsets);
                if ret.len() > size {
                    ret.truncate(offset);
                    trunc = true;
                    break;
                }
                counts[section] += 1;
            }
            if trunc {
                break;
            }
        }

        if trunc {
            // Update the header with the fact we truncated this.
            ret[2] |= 0b0000_0010;
            ret.splice(6..8, counts[0].to_be_bytes().iter().copied());
            ret.splice(8..10, counts[1].to_be_bytes().iter().copied());
            ret.splice(10..12, counts[2].to_be_bytes().iter().copied());
        }

        ret
    }
}

#[test]
fn test_compressed_domain() {
    let mut v = vec![];
    let domain = Domain(vec![]);
    let mut offsets = DomainOffsets::new();
    push_compressed_domain(&mut v, &domain, &mut offsets, 0);
    push_compressed_domain(&mut v, &"local".parse().unwrap(), &mut offsets, 0);
    push_compressed_domain(&mut v, &"c.d.example.com".parse().unwrap(), &mut offsets, 0);
    push_compressed_domain(
        &mut v,
        &"a.b.c.d.example.com".parse().unwrap(),
        &mut offsets,
        0,
    );
    assert_eq!(
        v,
        [
            0, /* empty domain */
            5, 108, 111, 99, 97, 108, 0, /* local */
            1, 99, 1, 100, 7, 101, 120, 97, 109, 112, 108, 101, 3, 99, 111, 109,
            0, /* c.d.example.com */
            1, 97, 1, 98, 192, 8 /* a.b.<offset 8> */
        ]
    );
}

#[test]
fn test_compression_roundtrip() {
    let mut v = vec![];
    let mut offsets = DomainOffsets::new();
    for d in ["test.example.com", "tracker.example.net", "test.example.com"] {
        push_compressed_domain(&mut v, &d.parse().unwrap(), &mut offsets, 0);
    }
    let mut p = super::parse::PktParser::new(&v);
    assert_eq!(p.get_domain().unwrap(), "test.example.com".parse().unwrap());
    assert_eq!(
        p.get_domain().unwrap(),
        "tracker.example.net".parse().unwrap()
    );
    assert_eq!(p.get_domain().unwrap(), "test.example.com".parse().unwrap());
}

#[test]
fn test_rr_roundtrip() {
    let mut v = vec![];
    let mut offsets = DomainOffsets::new();
    let orig_cname = RR {
        domain: "a.example.com".parse().unwrap(),
        class: CLASS_IN,
        rrtype: RR_CNAME,
        ttl: 300,
        rdata: RData::CName("tracker.example.net".parse().unwrap()),
    };
    let orig_a = RR {
        domain: "tracker.example.net".parse().unwrap(),
        class: CLASS_IN,
        rrtype: RR_A,
        ttl: 60,
        rdata: RData::A("192.0.2.7".parse().unwrap()),
    };
    let orig_soa = RR {
        domain: "example.net".parse().unwrap(),
        class: CLASS_IN,
        rrtype: RR_SOA,
        ttl: 5,
        rdata: RData::Soa(SoaData {
            mname: "ns1.example.net".parse().unwrap(),
            rname: "hostmaster.example.net".parse().unwrap(),
            serial: 1,
            refresh: 3600,
            retry: 300,
            expire: 86400,
            minimum: 600,
        }),
    };
    push_rr(&mut v, &orig_cname, &mut offsets);
    push_rr(&mut v, &orig_a, &mut offsets);
    push_rr(&mut v, &orig_soa, &mut offsets);
    let mut p = super::parse::PktParser::new(&v);
    assert_eq!(orig_cname, p.get_rr().unwrap());
    assert_eq!(orig_a, p.get_rr().unwrap());
    assert_eq!(orig_soa, p.get_rr().unwrap());
}

#[test]
fn test_pkt_roundtrip() {
    let orig_pkt = DNSPkt {
        qid: 140,
        rd: true,
        tc: false,
        aa: false,
        qr: true,
        opcode: OPCODE_QUERY,
        cd: false,
        ad: false,
        ra: true,
        rcode: NOERROR,
        bufsize: 1232,
        edns_ver: Some(0),
        edns_do: false,
        question: Question {
            qdomain: "a.example.com".parse().unwrap(),
            qclass: CLASS_IN,
            qtype: RR_A,
        },
        answer: vec![
            RR {
                domain: "a.example.com".parse().unwrap(),
                ttl: 300,
                class: CLASS_IN,
                rrtype: RR_CNAME,
                rdata: RData::CName("b.example.com".parse().unwrap()),
            },
            RR {
                domain: "b.example.com".parse().unwrap(),
                ttl: 300,
                class: CLASS_IN,
                rrtype: RR_A,
                rdata: RData::A("192.0.2.1".parse().unwrap()),
            },
        ],
        nameserver: vec![],
        additional: vec![],
        edns: Some(EdnsData::new()),
    };
    let v = orig_pkt.serialise();
    let mut p = super::parse::PktParser::new(&v);
    let parsed = p.get_dns().unwrap();
    assert_eq!(orig_pkt, parsed);
    assert_eq!(
        parsed.first_a(),
        Some((
            &"b.example.com".parse().unwrap(),
            "192.0.2.1".parse().unwrap()
        ))
    );
}

#[test]
fn test_truncation_updates_counts() {
    let pkt = DNSPkt {
        qid: 1,
        rd: true,
        tc: false,
        aa: false,
        qr: true,
        opcode: OPCODE_QUERY,
        cd: false,
        ad: false,
        ra: true,
        rcode: NOERROR,
        bufsize: 512,
        edns_ver: None,
        edns_do: false,
        question: Question {
            qdomain: "example.com".parse().unwrap(),
            qclass: CLASS_IN,
            qtype: RR_A,
        },
        answer: (0..100)
            .map(|i| RR {
                domain: "example.com".parse().unwrap(),
                ttl: 300,
                class: CLASS_IN,
                rrtype: RR_A,
                rdata: RData::A(std::net::Ipv4Addr::new(192, 0, 2, i)),
            })
            .collect(),
        nameserver: vec![],
        additional: vec![],
        edns: None,
    };
    let v = pkt.serialise_with_size(512);
    assert!(v.len() <= 512);
    assert_eq!(v.len(), 12 + 17 + 16 * 30);
    let parsed = super::parse::PktParser::new(&v).get_dns().unwrap();
    assert!(parsed.tc);
    assert_eq!(parsed.answer.len(), 30);
}

#[test]
fn domain_from_str() {
    assert_eq!(
        "example.com".parse(),
        Ok(Domain(vec![
            Label(vec![b'e', b'x', b'a', b'm', b'p', b'l', b'e']),
            Label(vec![b'c', b'o', b'm'])
        ]))
    );
    assert_eq!(
        "org.blokada.invalid.".parse::<Domain>().unwrap().to_string(),
        "org.blokada.invalid"
    );
    assert!("a..b".parse::<Domain>().is_err());
}

#[test]
fn domain_case() {
    let upper: Domain = "WWW.Example.COM".parse().unwrap();
    let lower: Domain = "www.example.com".parse().unwrap();
    assert_ne!(upper, lower);
    assert!(upper.eq_ignore_case(&lower));
    assert!(!upper.eq_ignore_case(&"example.com".parse().unwrap()));
    assert_eq!(upper.host(), "www.example.com");
}
