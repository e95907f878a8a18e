//! Local Quick Memory: process-global hot cache of affairs, cached searches,
//! and the pending write buffer.
//!
//! Cross-process visibility comes only from KB flush; within the process every
//! mutation funnels through here. The three caches:
//!
//! - **Affairs hot map**: per-client affairs, TTL- and count-bounded. Eviction
//!   never drops a client whose affair is currently ACTIVE.
//! - **Search cache**: normalized query -> results with expiry, invalidated
//!   when a store's subject overlaps the query.
//! - **Write buffer**: pending KB writes, searchable so read-your-writes holds
//!   before flush. Oldest NORMAL entries are evicted first when full; CRITICAL
//!   entries survive until flushed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::settings::MemorySettings;

use super::{Affair, AffairStatus, PendingWrite, WritePriority};

const SEARCH_CACHE_TTL: Duration = Duration::from_secs(300);

struct ClientEntry {
    affairs: HashMap<String, Affair>,
    touched_at: Instant,
}

struct CachedSearch {
    results: Vec<Value>,
    expires_at: Instant,
}

#[derive(Clone, Debug, Default)]
pub struct LqmStats {
    pub clients: usize,
    pub affairs_count: usize,
    pub buffer_writes: usize,
    pub cache_size: usize,
}

pub struct LocalQuickMemory {
    affairs: DashMap<String, ClientEntry>,
    search_cache: DashMap<String, CachedSearch>,
    write_buffer: Mutex<Vec<PendingWrite>>,
    max_warm_entries: usize,
    warm_ttl: Duration,
    write_buffer_max: usize,
}

static GLOBAL_LQM: OnceCell<LocalQuickMemory> = OnceCell::new();

/// The process-global LQM singleton, created from settings on first use.
pub fn global_lqm(settings: &MemorySettings) -> &'static LocalQuickMemory {
    GLOBAL_LQM.get_or_init(|| {
        info!(
            max_warm = settings.lqm_max_warm_entries,
            ttl_s = settings.lqm_warm_ttl_seconds,
            buffer_max = settings.lqm_write_buffer_max,
            "LQM singleton initialized"
        );
        LocalQuickMemory::new(settings)
    })
}

impl LocalQuickMemory {
    pub fn new(settings: &MemorySettings) -> Self {
        Self {
            affairs: DashMap::new(),
            search_cache: DashMap::new(),
            write_buffer: Mutex::new(Vec::new()),
            max_warm_entries: settings.lqm_max_warm_entries.max(1),
            warm_ttl: Duration::from_secs(settings.lqm_warm_ttl_seconds),
            write_buffer_max: settings.lqm_write_buffer_max.max(1),
        }
    }

    // ── Affairs hot map ─────────────────────────────────────────────────

    /// Stores or updates an affair. An affair becoming ACTIVE parks any other
    /// ACTIVE affair of the same client, preserving the one-active invariant.
    pub fn store_affair(&self, affair: Affair) {
        let client_id = affair.client_id.clone();
        let mut entry = self.affairs.entry(client_id.clone()).or_insert_with(|| ClientEntry {
            affairs: HashMap::new(),
            touched_at: Instant::now(),
        });
        entry.touched_at = Instant::now();

        if affair.status == AffairStatus::Active {
            for other in entry.affairs.values_mut() {
                if other.id != affair.id && other.status == AffairStatus::Active {
                    warn!(
                        client = %client_id,
                        demoted = %other.id,
                        promoted = %affair.id,
                        "second active affair, parking the previous one"
                    );
                    other.status = AffairStatus::Parked;
                }
            }
        }
        entry.affairs.insert(affair.id.clone(), affair);
        drop(entry);
        self.evict_if_needed();
    }

    pub fn get_affair(&self, client_id: &str, affair_id: &str) -> Option<Affair> {
        let mut entry = self.affairs.get_mut(client_id)?;
        entry.touched_at = Instant::now();
        entry.affairs.get(affair_id).cloned()
    }

    pub fn get_active_affair(&self, client_id: &str) -> Option<Affair> {
        let entry = self.affairs.get(client_id)?;
        entry
            .affairs
            .values()
            .find(|a| a.status == AffairStatus::Active)
            .cloned()
    }

    pub fn get_parked_affairs(&self, client_id: &str) -> Vec<Affair> {
        self.affairs
            .get(client_id)
            .map(|entry| {
                entry
                    .affairs
                    .values()
                    .filter(|a| a.status == AffairStatus::Parked)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops expired client entries, then trims to capacity oldest-first.
    /// Entries holding an ACTIVE affair are never evicted.
    fn evict_if_needed(&self) {
        let ttl = self.warm_ttl;
        self.affairs.retain(|_, entry| {
            entry.touched_at.elapsed() < ttl
                || entry
                    .affairs
                    .values()
                    .any(|a| a.status == AffairStatus::Active)
        });

        while self.affairs.len() > self.max_warm_entries {
            let oldest = self
                .affairs
                .iter()
                .filter(|e| {
                    !e.value()
                        .affairs
                        .values()
                        .any(|a| a.status == AffairStatus::Active)
                })
                .min_by_key(|e| e.value().touched_at)
                .map(|e| e.key().clone());
            let Some(key) = oldest else {
                break;
            };
            debug!(client = %key, "evicting warm client entry");
            self.affairs.remove(&key);
        }
    }

    // ── Search cache ────────────────────────────────────────────────────

    fn normalize_query(query: &str) -> String {
        query.trim().to_lowercase()
    }

    pub fn cache_search(&self, query: &str, results: Vec<Value>) {
        self.search_cache.insert(
            Self::normalize_query(query),
            CachedSearch {
                results,
                expires_at: Instant::now() + SEARCH_CACHE_TTL,
            },
        );
    }

    pub fn get_cached_search(&self, query: &str) -> Option<Vec<Value>> {
        let key = Self::normalize_query(query);
        let hit = self.search_cache.get(&key)?;
        if hit.expires_at < Instant::now() {
            drop(hit);
            self.search_cache.remove(&key);
            return None;
        }
        Some(hit.results.clone())
    }

    /// Drops cached searches whose query overlaps the subject (either way).
    pub fn invalidate_search(&self, subject: &str) {
        let subject = Self::normalize_query(subject);
        if subject.is_empty() {
            return;
        }
        self.search_cache
            .retain(|query, _| !query.contains(&subject) && !subject.contains(query.as_str()));
    }

    // ── Write buffer ────────────────────────────────────────────────────

    /// Appends a pending write. When the buffer is full, the oldest
    /// non-critical entry is evicted first; if every entry is critical the
    /// buffer grows past its bound rather than dropping one.
    pub fn buffer_write(&self, write: PendingWrite) {
        let mut buf = self.write_buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() >= self.write_buffer_max {
            if let Some(pos) = buf.iter().position(|w| w.priority != WritePriority::Critical) {
                let evicted = buf.remove(pos);
                warn!(urn = %evicted.source_urn, "write buffer full, evicting oldest normal write");
            }
        }
        buf.push(write);
    }

    /// Snapshot of the buffer for a flush pass; entries stay until
    /// [`remove_synced`](Self::remove_synced).
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.write_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Removes a successfully flushed write from the buffer.
    pub fn remove_synced(&self, key: &(String, String)) {
        self.write_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|w| &w.key() != key);
    }

    /// Substring search over source_urn and content, newest first.
    pub fn search_write_buffer(&self, query: &str) -> Vec<PendingWrite> {
        let needle = Self::normalize_query(query);
        if needle.is_empty() {
            return Vec::new();
        }
        let buf = self.write_buffer.lock().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<PendingWrite> = buf
            .iter()
            .filter(|w| {
                w.source_urn.to_lowercase().contains(&needle)
                    || w.content.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.reverse();
        hits
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    pub fn clear(&self) {
        self.affairs.clear();
        self.search_cache.clear();
        self.write_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn stats(&self) -> LqmStats {
        LqmStats {
            clients: self.affairs.len(),
            affairs_count: self.affairs.iter().map(|e| e.value().affairs.len()).sum(),
            buffer_writes: self
                .write_buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            cache_size: self.search_cache.len(),
        }
    }
}
