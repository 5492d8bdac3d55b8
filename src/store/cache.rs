use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::queue::PersistentQueue;
use crate::store::block::{BlockId, CachedBlock};

/// Maximum frequency limit for a resident entry.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Fan-out of the persistent queues backing the eviction lanes.
const LANE_FANOUT: usize = 32;

/// Ghost entries retained even when the cache is nearly empty.
const MIN_GHOST_ENTRIES: usize = 16;

/// Snapshot of cache hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Lane {
    Small,
    Main,
}

/// Eviction-order element. Lanes carry (id, seq) only; payloads live in the
/// entry map. A lane element whose seq no longer matches the map is stale
/// (the block was overwritten or moved lanes) and is skipped on dequeue.
#[derive(Clone, Copy)]
struct LaneEntry {
    id: BlockId,
    seq: u64,
}

struct Slot {
    block: CachedBlock,
    freq: AtomicU8,
    seq: u64,
    lane: Lane,
}

type EvictionLane = PersistentQueue<LaneEntry, LANE_FANOUT>;

/// Byte-bounded resident set with S3-FIFO admission.
///
/// New blocks enter a probationary `small` lane; blocks touched at least
/// twice get promoted to the protected `main` lane on their way out; ids
/// evicted from `small` are remembered in a `ghost` lane so a quick
/// re-admission goes straight to `main`. All three lanes are persistent
/// queues, so a consistent view of the eviction order can be snapshotted
/// while the cache keeps mutating.
///
/// Eviction removes the id→block mapping only; holders of a [`CachedBlock`]
/// keep the payload alive through shared ownership.
pub struct ResidentCache {
    max_bytes: usize,
    max_main_bytes: usize,
    entries: HashMap<BlockId, Slot>,
    small: EvictionLane,
    main: EvictionLane,
    ghost: EvictionLane,
    ghost_ids: HashMap<BlockId, u64>,
    seq_counter: u64,
    usage: usize,
    small_bytes: usize,
    main_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResidentCache {
    pub fn new(max_bytes: usize) -> Self {
        // 1/10 of the budget is probationary, the rest protected.
        let max_small_bytes = max_bytes / 10;
        Self {
            max_bytes,
            max_main_bytes: max_bytes - max_small_bytes,
            entries: HashMap::new(),
            small: EvictionLane::new(),
            main: EvictionLane::new(),
            ghost: EvictionLane::new(),
            ghost_ids: HashMap::new(),
            seq_counter: 0,
            usage: 0,
            small_bytes: 0,
            main_bytes: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the resident block for `id`, bumping its access frequency.
    pub fn get(&self, id: &BlockId) -> Option<CachedBlock> {
        match self.entries.get(id) {
            Some(slot) => {
                let freq = slot.freq.load(Ordering::SeqCst);
                slot.freq
                    .store((freq + 1).min(MAX_FREQUENCY_LIMIT), Ordering::SeqCst);
                self.hits.fetch_add(1, Ordering::SeqCst);
                Some(slot.block.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    /// Installs a block, overwriting any prior entry for the same id, and
    /// evicts under capacity pressure. If the block alone exceeds the byte
    /// budget it may itself be evicted right away.
    pub fn insert(&mut self, block: CachedBlock) {
        let id = block.id();
        let len = block.len();
        self.seq_counter += 1;
        let seq = self.seq_counter;

        let lane = if let Some(slot) = self.entries.get_mut(&id) {
            // Overwrite in place; the old lane element goes stale.
            let (old_len, lane) = (slot.block.len(), slot.lane);
            slot.block = block;
            slot.seq = seq;
            self.usage -= old_len;
            match lane {
                Lane::Small => self.small_bytes -= old_len,
                Lane::Main => self.main_bytes -= old_len,
            }
            lane
        } else {
            // A ghost-remembered id was evicted recently: admit it straight
            // into the protected lane.
            let lane = if self.ghost_ids.remove(&id).is_some() {
                Lane::Main
            } else {
                Lane::Small
            };
            self.entries.insert(
                id,
                Slot {
                    block,
                    freq: AtomicU8::new(0),
                    seq,
                    lane,
                },
            );
            lane
        };

        self.usage += len;
        match lane {
            Lane::Small => {
                self.small_bytes += len;
                self.small.enqueue(LaneEntry { id, seq });
            }
            Lane::Main => {
                self.main_bytes += len;
                self.main.enqueue(LaneEntry { id, seq });
            }
        }

        self.evict();
    }

    /// Total payload bytes currently resident.
    pub fn memory_usage(&self) -> usize {
        self.usage
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }

    /// Blocks in eviction order (probationary lane first), for diagnostics.
    ///
    /// Built from lane snapshots, so the view is consistent even though the
    /// lanes themselves keep rotating entries during eviction scans.
    pub fn eviction_order(&self) -> Vec<BlockId> {
        let small = self.small.snapshot();
        let main = self.main.snapshot();
        small
            .iter()
            .filter(|e| self.live_in_lane(e, Lane::Small).is_some())
            .chain(main.iter().filter(|e| self.live_in_lane(e, Lane::Main).is_some()))
            .map(|e| e.id)
            .collect()
    }

    fn evict(&mut self) {
        while self.usage > self.max_bytes {
            if self.main_bytes >= self.max_main_bytes || self.small_bytes == 0 {
                if !self.evict_main() && !self.evict_small() {
                    break;
                }
            } else if !self.evict_small() && !self.evict_main() {
                break;
            }
        }
    }

    /// Dequeues main-lane elements until one live entry is evicted,
    /// decrementing frequencies along the way (second chance).
    fn evict_main(&mut self) -> bool {
        while let Ok(entry) = self.main.dequeue() {
            let Some((freq, len)) = self.live_in_lane(&entry, Lane::Main) else {
                continue;
            };
            if freq > 0 {
                if let Some(slot) = self.entries.get(&entry.id) {
                    slot.freq.store(freq - 1, Ordering::SeqCst);
                }
                self.main.enqueue(entry);
            } else {
                self.entries.remove(&entry.id);
                self.main_bytes -= len;
                self.usage -= len;
                tracing::debug!(block = %entry.id, bytes = len, lane = "main", "Evicted block");
                return true;
            }
        }
        false
    }

    /// Dequeues small-lane elements, promoting twice-touched entries to
    /// main, until one live entry is evicted to the ghost lane.
    fn evict_small(&mut self) -> bool {
        while let Ok(entry) = self.small.dequeue() {
            let Some((freq, len)) = self.live_in_lane(&entry, Lane::Small) else {
                continue;
            };
            if freq > 1 {
                if let Some(slot) = self.entries.get_mut(&entry.id) {
                    slot.lane = Lane::Main;
                }
                self.small_bytes -= len;
                self.main_bytes += len;
                self.main.enqueue(entry);
            } else {
                self.entries.remove(&entry.id);
                self.small_bytes -= len;
                self.usage -= len;
                self.push_ghost(entry.id);
                tracing::debug!(block = %entry.id, bytes = len, lane = "small", "Evicted block");
                return true;
            }
        }
        false
    }

    /// Returns (freq, len) if the lane element still refers to the live
    /// entry for its id in the given lane.
    fn live_in_lane(&self, entry: &LaneEntry, lane: Lane) -> Option<(u8, usize)> {
        let slot = self.entries.get(&entry.id)?;
        if slot.seq != entry.seq || slot.lane != lane {
            return None;
        }
        Some((slot.freq.load(Ordering::SeqCst), slot.block.len()))
    }

    fn push_ghost(&mut self, id: BlockId) {
        self.seq_counter += 1;
        let seq = self.seq_counter;
        self.ghost_ids.insert(id, seq);
        self.ghost.enqueue(LaneEntry { id, seq });

        let limit = self.entries.len().max(MIN_GHOST_ENTRIES);
        while self.ghost.len() > limit {
            let Ok(entry) = self.ghost.dequeue() else {
                break;
            };
            if self.ghost_ids.get(&entry.id) == Some(&entry.seq) {
                self.ghost_ids.remove(&entry.id);
            }
        }
    }
}
