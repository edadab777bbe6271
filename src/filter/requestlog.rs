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
 *  Per query records of what the tunnel did.
 */
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::SystemTime;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// DNS transaction id.
    pub id: u16,
    pub domain: String,
    pub blocked: bool,
    pub rcode: Option<u16>,
    pub ip: Option<Ipv4Addr>,
    pub cnamed_domain: Option<String>,
    pub time: SystemTime,
}

impl LogEntry {
    pub fn new(id: u16, domain: String, blocked: bool) -> Self {
        Self {
            id,
            domain,
            blocked,
            rcode: None,
            ip: None,
            cnamed_domain: None,
            time: SystemTime::now(),
        }
    }

    pub fn apply(&mut self, diff: LogDiff) {
        if diff.rcode.is_some() {
            self.rcode = diff.rcode;
        }
        if diff.ip.is_some() {
            self.ip = diff.ip;
        }
        if diff.cnamed_domain.is_some() {
            self.cnamed_domain = diff.cnamed_domain;
            self.blocked = true;
        }
    }
}

/// What was learnt from the upstream reply to a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDiff {
    pub rcode: Option<u16>,
    pub ip: Option<Ipv4Addr>,
    pub cnamed_domain: Option<String>,
}

pub trait RequestLog: Send + Sync {
    fn add(&self, entry: LogEntry);
    fn update(&self, matches: &dyn Fn(&LogEntry) -> bool, diff: LogDiff);
}

struct Inner {
    entries: VecDeque<LogEntry>,
    blocked: u64,
}

/// A bounded log kept in memory, newest entry first.
pub struct MemoryRequestLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoryRequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                blocked: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn recent(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many blocked queries have been recorded since startup.
    pub fn blocked_count(&self) -> u64 {
        self.lock().blocked
    }
}

impl Default for MemoryRequestLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RequestLog for MemoryRequestLog {
    fn add(&self, entry: LogEntry) {
        let mut inner = self.lock();
        /* Repeated lookups of the same name (eg A then AAAA) only get one line. */
        if inner.entries.front().map(|e| &e.domain) == Some(&entry.domain) {
            return;
        }
        if entry.blocked {
            inner.blocked += 1;
        }
        inner.entries.push_front(entry);
        inner.entries.truncate(self.capacity);
    }

    fn update(&self, matches: &dyn Fn(&LogEntry) -> bool, diff: LogDiff) {
        let mut inner = self.lock();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| matches(e) && !e.blocked && e.rcode.is_none())
        {
            let newly_blocked = diff.cnamed_domain.is_some();
            entry.apply(diff);
            if newly_blocked {
                inner.blocked += 1;
            }
        }
    }
}

#[test]
fn test_add_newest_first_and_dedup() {
    let log = MemoryRequestLog::new(3);
    log.add(LogEntry::new(1, "a.example.com".into(), false));
    log.add(LogEntry::new(2, "a.example.com".into(), false));
    log.add(LogEntry::new(3, "b.example.com".into(), true));
    let recent = log.recent();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, 3);
    assert_eq!(recent[1].id, 1);
    assert_eq!(log.blocked_count(), 1);

    log.add(LogEntry::new(4, "c.example.com".into(), false));
    log.add(LogEntry::new(5, "d.example.com".into(), false));
    let recent = log.recent();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].id, 5);
    assert_eq!(recent[2].id, 3);
}

#[test]
fn test_update_at_most_once() {
    let log = MemoryRequestLog::default();
    log.add(LogEntry::new(9, "a.example.com".into(), false));
    log.update(
        &|e| e.id == 9,
        LogDiff {
            rcode: Some(0),
            ip: Some("192.0.2.1".parse().unwrap()),
            cnamed_domain: None,
        },
    );
    log.update(
        &|e| e.id == 9,
        LogDiff {
            rcode: Some(3),
            ..Default::default()
        },
    );
    let e = &log.recent()[0];
    assert_eq!(e.rcode, Some(0));
    assert_eq!(e.ip, Some("192.0.2.1".parse().unwrap()));
    assert!(!e.blocked);
}

#[test]
fn test_update_cname_marks_blocked() {
    let log = MemoryRequestLog::default();
    log.add(LogEntry::new(9, "a.example.com".into(), false));
    log.update(
        &|e| e.id == 9,
        LogDiff {
            rcode: Some(0),
            ip: None,
            cnamed_domain: Some("tracker.example.net".into()),
        },
    );
    let e = &log.recent()[0];
    assert!(e.blocked);
    assert_eq!(e.cnamed_domain.as_deref(), Some("tracker.example.net"));
    assert_eq!(log.blocked_count(), 1);
}
