//! Eviction queue of resident files.
//!
//! Entries live in a slab arena and form one circular doubly-linked list.
//! The tail is always `prev` of the head, so only the head index is stored.
//! A `HashMap` from fast-tier path to slab key gives constant time lookup.

mod policy;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::trace;
use slab::Slab;

use crate::error::{Result, TierError};

pub use policy::{CacheEntry, ReplacementPolicy};

#[derive(Debug)]
struct Node {
    entry: CacheEntry,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub struct EvictionQueue {
    policy: ReplacementPolicy,
    nodes: Slab<Node>,
    index: HashMap<PathBuf, usize>,
    head: Option<usize>,
}

impl EvictionQueue {
    pub fn new(policy: ReplacementPolicy) -> Self {
        Self {
            policy,
            nodes: Slab::new(),
            index: HashMap::new(),
            head: None,
        }
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.index.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.index.get(path).map(|&key| &self.nodes[key].entry)
    }

    /// The next eviction candidate.
    pub fn head(&self) -> Option<&CacheEntry> {
        self.head.map(|key| &self.nodes[key].entry)
    }

    pub fn tail(&self) -> Option<&CacheEntry> {
        self.head.map(|key| &self.nodes[self.nodes[key].prev].entry)
    }

    /// Entries from head to tail.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            cursor: self.head,
            remaining: self.len(),
        }
    }

    /// Record an access to `path`, inserting it with frequency one if it is
    /// not queued yet.
    pub fn touch(&mut self, path: &Path) {
        match self.index.get(path).copied() {
            Some(key) => {
                self.unlink(key);
                self.nodes[key].entry.bump();
                self.place(key);
            }
            None => {
                let entry = CacheEntry::new(path.to_path_buf());
                let key = self.alloc(entry);
                self.place(key);
            }
        }
        trace!("touched {} ({} queued)", path.display(), self.len());
    }

    /// Remove and return the head.
    pub fn evict_head(&mut self) -> Result<CacheEntry> {
        let key = self.head.ok_or(TierError::EmptyQueue)?;
        Ok(self.take(key))
    }

    /// Remove and return the first entry from the head that `skip` does not
    /// reject.
    pub fn evict_where<F>(&mut self, mut skip: F) -> Option<CacheEntry>
    where
        F: FnMut(&Path) -> bool,
    {
        let mut cursor = self.head?;
        for _ in 0..self.len() {
            if !skip(&self.nodes[cursor].entry.path) {
                return Some(self.take(cursor));
            }
            cursor = self.nodes[cursor].next;
        }
        None
    }

    /// Idempotent.
    pub fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        let key = self.index.get(path).copied()?;
        Some(self.take(key))
    }

    /// Re-key `old` as `new` without moving it. An entry already queued
    /// under `new` is dropped.
    pub fn rename_key(&mut self, old: &Path, new: &Path) {
        if old == new {
            return;
        }
        let Some(key) = self.index.remove(old) else {
            return;
        };
        if let Some(replaced) = self.index.get(new).copied() {
            self.take(replaced);
        }
        self.nodes[key].entry.path = new.to_path_buf();
        self.index.insert(new.to_path_buf(), key);
    }

    /// Re-key every entry below `old_dir` to the same relative path below
    /// `new_dir`.
    pub fn rename_prefix(&mut self, old_dir: &Path, new_dir: &Path) {
        let moved: Vec<PathBuf> = self
            .index
            .keys()
            .filter(|p| p.starts_with(old_dir) && p.as_path() != old_dir)
            .cloned()
            .collect();
        for old in moved {
            if let Ok(rel) = old.strip_prefix(old_dir) {
                let new = new_dir.join(rel);
                self.rename_key(&old, &new);
            }
        }
    }

    /// Put back an entry whose demotion failed, without counting it as a
    /// use. It goes behind its equals: the tail under the recency policy,
    /// the back of its frequency band otherwise.
    pub fn requeue(&mut self, entry: CacheEntry) {
        if let Some(key) = self.index.get(&entry.path).copied() {
            self.take(key);
        }
        let key = self.alloc(entry);
        self.place(key);
    }

    fn alloc(&mut self, entry: CacheEntry) -> usize {
        let path = entry.path.clone();
        let key = self.nodes.insert(Node {
            entry,
            prev: 0,
            next: 0,
        });
        self.nodes[key].prev = key;
        self.nodes[key].next = key;
        self.index.insert(path, key);
        key
    }

    fn take(&mut self, key: usize) -> CacheEntry {
        self.unlink(key);
        let node = self.nodes.remove(key);
        self.index.remove(&node.entry.path);
        node.entry
    }

    /// Link an unlinked node according to the policy.
    fn place(&mut self, key: usize) {
        match self.policy {
            ReplacementPolicy::Recency => self.link_back(key),
            ReplacementPolicy::Frequency => {
                let freq = self.nodes[key].entry.freq;
                match self.find(|node| node.entry.freq > freq) {
                    Some(at) => self.link_before(key, at),
                    None => self.link_back(key),
                }
            }
        }
    }

    /// First linked node from the head matching `pred`.
    fn find<P>(&self, pred: P) -> Option<usize>
    where
        P: Fn(&Node) -> bool,
    {
        let head = self.head?;
        let mut cursor = head;
        loop {
            if pred(&self.nodes[cursor]) {
                return Some(cursor);
            }
            cursor = self.nodes[cursor].next;
            if cursor == head {
                return None;
            }
        }
    }

    fn link_back(&mut self, key: usize) {
        match self.head {
            Some(head) => {
                self.insert_between(key, head);
            }
            None => {
                self.nodes[key].prev = key;
                self.nodes[key].next = key;
                self.head = Some(key);
            }
        }
    }

    /// Link `key` in front of the linked node `at`, becoming the new head if
    /// `at` was the head.
    fn link_before(&mut self, key: usize, at: usize) {
        self.insert_between(key, at);
        if self.head == Some(at) {
            self.head = Some(key);
        }
    }

    fn insert_between(&mut self, key: usize, at: usize) {
        let prev = self.nodes[at].prev;
        self.nodes[key].prev = prev;
        self.nodes[key].next = at;
        self.nodes[prev].next = key;
        self.nodes[at].prev = key;
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = (self.nodes[key].prev, self.nodes[key].next);
        if next == key {
            self.head = None;
        } else {
            self.nodes[prev].next = next;
            self.nodes[next].prev = prev;
            if self.head == Some(key) {
                self.head = Some(next);
            }
        }
        self.nodes[key].prev = key;
        self.nodes[key].next = key;
    }
}

pub struct Iter<'a> {
    queue: &'a EvictionQueue,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a CacheEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let key = self.cursor?;
        let node = &self.queue.nodes[key];
        self.remaining -= 1;
        self.cursor = Some(node.next);
        Some(&node.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn p(name: &str) -> PathBuf {
        PathBuf::from("/ssd").join(name)
    }

    fn order(queue: &EvictionQueue) -> Vec<PathBuf> {
        queue.iter().map(|e| e.path.clone()).collect()
    }

    /// The queue is empty or exactly one cycle through every node, walkable
    /// both ways, and the index agrees with the arena.
    fn check_structure(queue: &EvictionQueue) -> std::result::Result<(), String> {
        if queue.nodes.len() != queue.index.len() {
            return Err(format!(
                "{} nodes but {} index entries",
                queue.nodes.len(),
                queue.index.len()
            ));
        }
        let Some(head) = queue.head else {
            return if queue.nodes.is_empty() {
                Ok(())
            } else {
                Err("no head but nodes remain".into())
            };
        };
        let mut forward = 0;
        let mut cursor = head;
        loop {
            let node = &queue.nodes[cursor];
            if queue.nodes[node.next].prev != cursor {
                return Err(format!("broken back link at {cursor}"));
            }
            if queue.index.get(&node.entry.path) != Some(&cursor) {
                return Err(format!("index disagrees for {}", node.entry.path.display()));
            }
            forward += 1;
            cursor = node.next;
            if cursor == head || forward > queue.nodes.len() {
                break;
            }
        }
        if forward != queue.nodes.len() {
            return Err(format!("cycle covers {forward} of {}", queue.nodes.len()));
        }
        let mut backward = 0;
        let mut cursor = head;
        loop {
            backward += 1;
            cursor = queue.nodes[cursor].prev;
            if cursor == head || backward > queue.nodes.len() {
                break;
            }
        }
        if backward != forward {
            return Err("backward walk differs from forward walk".into());
        }
        Ok(())
    }

    #[test]
    fn recency_touch_moves_to_tail() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        for name in ["a", "b", "c"] {
            queue.touch(&p(name));
        }
        queue.touch(&p("a"));
        assert_eq!(order(&queue), vec![p("b"), p("c"), p("a")]);
        assert_eq!(queue.tail().unwrap().path, p("a"));
        assert_eq!(queue.evict_head().unwrap().path, p("b"));
        assert_eq!(order(&queue), vec![p("c"), p("a")]);
    }

    #[test]
    fn frequency_orders_by_count_then_recency() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Frequency);
        queue.touch(&p("a"));
        queue.touch(&p("b"));
        queue.touch(&p("a"));
        queue.touch(&p("a"));
        assert_eq!(queue.head().unwrap().path, p("b"));
        assert_eq!(queue.get(&p("a")).unwrap().freq, 3);
        assert_eq!(queue.evict_head().unwrap().path, p("b"));

        // equal counts land at the tail of their band
        queue.touch(&p("c"));
        queue.touch(&p("d"));
        assert_eq!(order(&queue), vec![p("c"), p("d"), p("a")]);
    }

    #[test]
    fn evicting_empty_queue_fails() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        assert!(matches!(queue.evict_head(), Err(TierError::EmptyQueue)));
        queue.touch(&p("x"));
        queue.evict_head().unwrap();
        assert!(queue.is_empty());
        assert!(queue.head().is_none() && queue.tail().is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        queue.touch(&p("a"));
        queue.touch(&p("b"));
        assert!(queue.remove(&p("a")).is_some());
        assert!(queue.remove(&p("a")).is_none());
        assert!(queue.remove(&p("never")).is_none());
        assert_eq!(order(&queue), vec![p("b")]);
        check_structure(&queue).unwrap();
    }

    #[test]
    fn rename_keeps_position_and_replaces_destination() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        for name in ["a", "b", "c"] {
            queue.touch(&p(name));
        }
        queue.rename_key(&p("b"), &p("z"));
        assert_eq!(order(&queue), vec![p("a"), p("z"), p("c")]);

        queue.rename_key(&p("a"), &p("c"));
        assert_eq!(order(&queue), vec![p("c"), p("z")]);

        queue.rename_key(&p("missing"), &p("q"));
        assert_eq!(queue.len(), 2);
        check_structure(&queue).unwrap();
    }

    #[test]
    fn rename_prefix_moves_directory_contents() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        queue.touch(&p("dir/one"));
        queue.touch(&p("dir2"));
        queue.touch(&p("dir/sub/two"));
        queue.rename_prefix(&p("dir"), &p("moved"));
        assert_eq!(
            order(&queue),
            vec![p("moved/one"), p("dir2"), p("moved/sub/two")]
        );
    }

    #[test]
    fn evict_where_skips_pinned() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        for name in ["a", "b", "c"] {
            queue.touch(&p(name));
        }
        let pinned = p("a");
        let victim = queue.evict_where(|path| path == pinned).unwrap();
        assert_eq!(victim.path, p("b"));
        assert!(queue.evict_where(|_| true).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn requeue_goes_behind_equals() {
        let mut queue = EvictionQueue::new(ReplacementPolicy::Recency);
        queue.touch(&p("a"));
        queue.touch(&p("b"));
        let head = queue.evict_head().unwrap();
        queue.requeue(head);
        assert_eq!(order(&queue), vec![p("b"), p("a")]);
        assert_eq!(queue.get(&p("a")).unwrap().freq, 1);

        let mut lfu = EvictionQueue::new(ReplacementPolicy::Frequency);
        lfu.touch(&p("a"));
        lfu.touch(&p("b"));
        lfu.touch(&p("b"));
        lfu.touch(&p("d"));
        lfu.touch(&p("d"));
        lfu.touch(&p("d"));
        let mut entry = CacheEntry::new(p("c"));
        entry.freq = 2;
        lfu.requeue(entry);
        assert_eq!(order(&lfu), vec![p("a"), p("b"), p("c"), p("d")]);
        check_structure(&lfu).unwrap();
    }

    fn run_ops(policy: ReplacementPolicy, ops: Vec<(u8, u8, u8)>) -> TestResult {
        let mut queue = EvictionQueue::new(policy);
        for (op, a, b) in ops {
            let (a, b) = (p(&format!("f{}", a % 8)), p(&format!("f{}", b % 8)));
            match op % 5 {
                0 | 1 => queue.touch(&a),
                2 => {
                    let was_empty = queue.is_empty();
                    if queue.evict_head().is_ok() == was_empty {
                        return TestResult::error("evict_head disagrees with is_empty");
                    }
                }
                3 => {
                    queue.remove(&a);
                    if queue.contains(&a) {
                        return TestResult::error("removed path still queued");
                    }
                }
                _ => queue.rename_key(&a, &b),
            }
            if let Err(msg) = check_structure(&queue) {
                return TestResult::error(msg);
            }
            if policy == ReplacementPolicy::Frequency {
                let freqs: Vec<u64> = queue.iter().map(|e| e.freq).collect();
                if freqs.windows(2).any(|w| w[0] > w[1]) {
                    return TestResult::error(format!("frequencies out of order: {freqs:?}"));
                }
            }
        }
        TestResult::passed()
    }

    #[quickcheck]
    fn prop_recency_queue_stays_one_cycle(ops: Vec<(u8, u8, u8)>) -> TestResult {
        run_ops(ReplacementPolicy::Recency, ops)
    }

    #[quickcheck]
    fn prop_frequency_queue_stays_sorted(ops: Vec<(u8, u8, u8)>) -> TestResult {
        run_ops(ReplacementPolicy::Frequency, ops)
    }
}
