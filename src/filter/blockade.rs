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
 *  Allow/deny decisions for host names.
 */
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Answers whether a host is explicitly allowed or denied.
///
/// Both lookups happen for every DNS query on the tunnel thread, while other threads may be
/// updating the lists, so implementations must be cheap and thread safe.  Host names are passed
/// lower cased without a trailing dot.
pub trait Blockade: Send + Sync {
    fn allowed(&self, host: &str) -> bool;
    fn denied(&self, host: &str) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct Lists {
    pub allow: HashSet<String>,
    pub deny: HashSet<String>,
}

fn normalise(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Exact match allow and deny lists.  Readers get an immutable snapshot, writers swap in a
/// modified copy.
#[derive(Debug, Default)]
pub struct StaticBlockade {
    lists: RwLock<Arc<Lists>>,
}

impl StaticBlockade {
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let ret = Self::default();
        ret.replace(allow, deny);
        ret
    }

    pub fn snapshot(&self) -> Arc<Lists> {
        match self.lists.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, lists: Lists) {
        let lists = Arc::new(lists);
        match self.lists.write() {
            Ok(mut l) => *l = lists,
            Err(poisoned) => *poisoned.into_inner() = lists,
        }
    }

    pub fn replace<A, D>(&self, allow: A, deny: D)
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        self.swap(Lists {
            allow: allow.into_iter().map(|h| normalise(h.as_ref())).collect(),
            deny: deny.into_iter().map(|h| normalise(h.as_ref())).collect(),
        })
    }

    pub fn allow(&self, host: &str) {
        let mut lists = (*self.snapshot()).clone();
        lists.allow.insert(normalise(host));
        self.swap(lists);
    }

    pub fn deny(&self, host: &str) {
        let mut lists = (*self.snapshot()).clone();
        lists.deny.insert(normalise(host));
        self.swap(lists);
    }
}

impl Blockade for StaticBlockade {
    fn allowed(&self, host: &str) -> bool {
        self.snapshot().allow.contains(host)
    }

    fn denied(&self, host: &str) -> bool {
        self.snapshot().deny.contains(host)
    }
}

#[test]
fn test_static_blockade() {
    let b = StaticBlockade::new(["Good.Example.com."], ["ads.example.com", "good.example.com"]);
    assert!(b.allowed("good.example.com"));
    assert!(b.denied("good.example.com"));
    assert!(b.denied("ads.example.com"));
    assert!(!b.allowed("ads.example.com"));
    /* Exact match only. */
    assert!(!b.denied("x.ads.example.com"));
    assert!(!b.denied("unknown.example.com"));
}

#[test]
fn test_snapshot_is_stable() {
    let b = StaticBlockade::new(Vec::<String>::new(), ["ads.example.com"]);
    let before = b.snapshot();
    b.deny("tracker.example.net");
    b.allow("ads.example.com");
    assert!(!before.deny.contains("tracker.example.net"));
    assert!(b.denied("tracker.example.net"));
    assert!(b.allowed("ads.example.com"));
}
