use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::discourse::{Post, Topic};

pub const DEFAULT_MAX_ENTRIES: usize = 20;
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub topic: Topic,
    pub posts: Vec<Post>,
    inserted_at: Instant,
}

/// Bounded per-topic cache. Eviction is strictly by insertion order and
/// reads never promote an entry, so this is FIFO rather than LRU;
/// overwriting an existing key refreshes its timestamp but keeps its
/// place in the eviction queue.
#[derive(Debug)]
pub struct TopicCache {
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
    max_entries: usize,
    expiry: Duration,
}

impl Default for TopicCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_EXPIRY)
    }
}

impl TopicCache {
    pub fn new(max_entries: usize, expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            expiry,
        }
    }

    /// Returns the entry for a topic unless it has expired; an expired
    /// entry is purged on the spot and reported as absent.
    pub fn get(&mut self, topic_id: u64) -> Option<&CacheEntry> {
        match self.entries.get(&topic_id) {
            Some(entry) if entry.inserted_at.elapsed() < self.expiry => {
                self.entries.get(&topic_id)
            }
            Some(_) => {
                self.invalidate(topic_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, topic_id: u64, topic: Topic, posts: Vec<Post>) {
        let entry = CacheEntry {
            topic,
            posts,
            inserted_at: Instant::now(),
        };
        if self.entries.insert(topic_id, entry).is_some() {
            return;
        }
        self.order.push_back(topic_id);
        while self.entries.len() > self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&mut self, topic_id: u64) {
        if self.entries.remove(&topic_id).is_some() {
            self.order.retain(|id| *id != topic_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
