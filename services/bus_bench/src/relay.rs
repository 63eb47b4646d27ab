//! Bounded relay correlation ledger.
//!
//! A blocking relay forwards each timestamped request under a fresh relay id
//! and must map the eventual response back to the originating client and its
//! original id. Entries are bounded by count and by age; evicted entries are
//! logged and counted as errors because their responses can no longer be
//! routed.

use crate::error::Result;
use crate::stats::ErrorCounter;
use crate::units::parse_duration;
use exabus::EndPoint;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Ledger bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayLedgerConfig {
    pub capacity: usize,
    /// Maximum entry age, e.g. `30s`
    pub ttl: String,
}

impl Default for RelayLedgerConfig {
    fn default() -> Self {
        Self {
            capacity: 65_536,
            ttl: "30s".to_string(),
        }
    }
}

/// Where a relayed request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub origin: EndPoint,
    pub origin_id: i32,
    pub inserted: Instant,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: HashMap<i32, RelayEntry>,
    order: VecDeque<i32>,
    next_id: i32,
}

#[derive(Debug)]
pub struct RelayLedger {
    state: Mutex<LedgerState>,
    capacity: usize,
    ttl: Duration,
    evicted: AtomicU64,
    errors: Arc<ErrorCounter>,
}

impl RelayLedger {
    pub fn new(capacity: usize, ttl: Duration, errors: Arc<ErrorCounter>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            capacity: capacity.max(1),
            ttl,
            evicted: AtomicU64::new(0),
            errors,
        }
    }

    pub fn from_config(config: &RelayLedgerConfig, errors: Arc<ErrorCounter>) -> Result<Self> {
        Ok(Self::new(config.capacity, parse_duration(&config.ttl)?, errors))
    }

    /// Remember a forwarded request; returns the relay id to send it under
    pub fn register(&self, origin: EndPoint, origin_id: i32) -> i32 {
        self.register_at(origin, origin_id, Instant::now())
    }

    pub fn register_at(&self, origin: EndPoint, origin_id: i32, now: Instant) -> i32 {
        let mut state = self.state.lock();
        self.evict(&mut state, now);

        let mut id = state.next_id;
        while state.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        state.next_id = id.wrapping_add(1);
        state.entries.insert(
            id,
            RelayEntry {
                origin,
                origin_id,
                inserted: now,
            },
        );
        state.order.push_back(id);
        if state.order.len() > 2 * self.capacity {
            Self::compact(&mut state);
        }
        id
    }

    /// Claim the entry for a response
    pub fn complete(&self, id: i32) -> Option<RelayEntry> {
        self.state.lock().entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop order slots of completed entries, keeping the newest slot of a reused id
    fn compact(state: &mut LedgerState) {
        let LedgerState { entries, order, .. } = state;
        let mut seen = HashSet::with_capacity(entries.len());
        let mut live: Vec<i32> = order
            .iter()
            .rev()
            .copied()
            .filter(|id| entries.contains_key(id) && seen.insert(*id))
            .collect();
        live.reverse();
        *order = live.into();
    }

    /// Drop entries past their TTL and make room for one more
    fn evict(&self, state: &mut LedgerState, now: Instant) {
        while let Some(&oldest) = state.order.front() {
            let entry = match state.entries.get(&oldest) {
                // completed already; just drop the order slot
                None => {
                    state.order.pop_front();
                    continue;
                }
                Some(entry) => entry,
            };
            let expired = now.saturating_duration_since(entry.inserted) >= self.ttl;
            if !expired && state.entries.len() < self.capacity {
                break;
            }

            state.order.pop_front();
            if let Some(entry) = state.entries.remove(&oldest) {
                warn!(
                    relay_id = oldest,
                    origin = %entry.origin,
                    origin_id = entry.origin_id,
                    expired,
                    "Evicting unanswered relay entry"
                );
                self.evicted.fetch_add(1, Ordering::Relaxed);
                self.errors.record("relay_eviction");
            }
        }
    }
}
