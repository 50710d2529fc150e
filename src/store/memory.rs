//! In-process store backed by DashMap.
//!
//! Correct for a single instance only. Used for development and tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use super::{KvStore, StoreError, WindowCount};

#[derive(Debug)]
enum Slot {
    Text(String),
    Counter(u64),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A thread-safe in-memory key-value store with TTL support.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    /// Number of live and not-yet-swept entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Counter(0),
            expires_at: Some(now + window),
        });

        if entry.is_expired(now) || !matches!(entry.slot, Slot::Counter(_)) {
            *entry = Entry {
                slot: Slot::Counter(0),
                expires_at: Some(now + window),
            };
        }

        let count = match &mut entry.slot {
            Slot::Counter(c) => {
                *c += 1;
                *c
            }
            _ => 1,
        };
        let ttl = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);

        Ok(WindowCount { count, ttl })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(e) if e.is_expired(now) => None,
            Some(e) => match &e.slot {
                Slot::Text(s) => Some(s.clone()),
                Slot::Counter(c) => Some(c.to_string()),
                Slot::List(_) => {
                    return Err(StoreError::Serialization(format!("{key} holds a list")))
                }
            },
            None => return Ok(None),
        };
        if value.is_none() {
            self.remove_if_expired(key, now);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = Entry {
            slot: Slot::Text(value.to_string()),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|e| {
            e.expires_at
                .filter(|at| *at > now)
                .map(|at| at.saturating_duration_since(now))
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::List(VecDeque::new()),
            expires_at: None,
        });
        if !matches!(entry.slot, Slot::List(_)) {
            *entry = Entry {
                slot: Slot::List(VecDeque::new()),
                expires_at: None,
            };
        }
        if let Slot::List(list) = &mut entry.slot {
            list.push_front(value.to_string());
            list.truncate(max_len);
        }
        Ok(())
    }

    async fn range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(match self.entries.get(key) {
            Some(e) => match &e.slot {
                Slot::List(list) => list.iter().skip(offset).take(limit).cloned().collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        })
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(match self.entries.get(key) {
            Some(e) => match &e.slot {
                Slot::List(list) => list.len(),
                _ => 0,
            },
            None => 0,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
