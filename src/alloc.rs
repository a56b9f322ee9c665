//! The chunked allocator (component C).
//!
//! `spec.md` §5 asks for a bump allocator over fixed-size chunks, with
//! reclaiming done by bookkeeping rather than by ever physically freeing a
//! slot: a reclaimed slot is just marked dead and its count moved from
//! `used` to `free`, and stays safely dereferenceable for as long as any
//! `TwigRef` might still point at it. A `compact` rebuild (see `gc.rs`) is
//! the only thing that ever shrinks the chunk list.
//!
//! Chunks are grown by pushing a fresh `Vec<Twig>`, never by reallocating
//! an existing one in place, so that a `TwigRef { chunk, slot }` handed out
//! today stays valid even after the allocator grows (teacher idiom:
//! `patch/branch.rs`'s `table_grow`, which reallocates a *new* backing
//! array rather than mutating the old one in place, here applied one level
//! up at chunk granularity instead of per-branch).

use crate::memusage::MemUsage;
use crate::node::{Twig, TwigRef};

/// Tuning knobs for a fresh `Allocator` (`spec.md` §5, "Configuration").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocConfig {
    pub chunk_size: u32,
    /// Below this global `live / used` ratio, `memusage().fragmented` is
    /// set and a caller doing a non-forced `compact` will rebuild. The
    /// per-chunk ">50% dead" criterion (`PER_CHUNK_DEAD_FRACTION`) is
    /// checked alongside this one and is not configurable (`spec.md`
    /// §4.3 gives it as a fixed figure, unlike the global ratio).
    pub fragmentation_threshold: f64,
}

impl Default for AllocConfig {
    fn default() -> Self {
        AllocConfig {
            chunk_size: 1024,
            fragmentation_threshold: 0.75,
        }
    }
}

/// Per-chunk dead-fraction above which that chunk alone marks the
/// allocator fragmented, regardless of the global ratio (`spec.md` §4.3).
const PER_CHUNK_DEAD_FRACTION: f64 = 0.5;

#[derive(Clone)]
struct Chunk {
    slots: Vec<Twig>,
    /// Once a chunk is shared by more than one snapshot, slots inside it
    /// may no longer be mutated in place; new writes must go through a
    /// fresh allocation and a parent-side update of the owning `TwigRef`.
    shared: bool,
    /// Slots beyond this index have never been written (the chunk's bump
    /// pointer). Slots before it may be live or dead.
    len: u32,
    dead: u32,
}

impl Chunk {
    fn new(capacity: u32) -> Self {
        Chunk {
            slots: Vec::with_capacity(capacity as usize),
            shared: false,
            len: 0,
            dead: 0,
        }
    }
}

/// Owns every twig in one trie generation. Cloning a `TwigRef` is just
/// copying two integers; the allocator is what gives those integers
/// meaning. `Clone` deep-copies every chunk's backing storage, for
/// `trie::Qp`'s per-transaction working-copy clone.
#[derive(Clone)]
pub struct Allocator {
    config: AllocConfig,
    chunks: Vec<Chunk>,
    hold: u64,
}

impl Allocator {
    pub fn new(config: AllocConfig) -> Self {
        Allocator {
            config,
            chunks: Vec::new(),
            hold: 0,
        }
    }

    pub fn config(&self) -> AllocConfig {
        self.config
    }

    /// Appends `twig` to the active chunk, growing a fresh chunk first if
    /// the active one is full or shared. Returns a ref valid until the
    /// next `compact`.
    pub fn alloc(&mut self, twig: Twig) -> TwigRef {
        if self.chunks.is_empty() || self.active_chunk().len as usize >= self.chunks.last().unwrap().slots.capacity() || self.active_chunk().shared {
            self.chunks.push(Chunk::new(self.config.chunk_size));
        }
        let chunk_index = self.chunks.len() as u32 - 1;
        let chunk = self.chunks.last_mut().unwrap();
        let slot = chunk.len;
        if (slot as usize) < chunk.slots.len() {
            chunk.slots[slot as usize] = twig;
        } else {
            chunk.slots.push(twig);
        }
        chunk.len += 1;
        TwigRef {
            chunk: chunk_index,
            slot,
        }
    }

    /// Reserves `count` contiguous fresh slots in a single chunk (used to
    /// build a branch's packed child array) and returns a ref to the
    /// first one.
    pub fn alloc_run(&mut self, count: u32, fill: Twig) -> TwigRef {
        if count == 0 {
            return TwigRef::NULL;
        }
        let need_fresh = self.chunks.is_empty()
            || self.active_chunk().shared
            || self.chunks.last().unwrap().slots.capacity() as u32 - self.active_chunk().len < count;
        if need_fresh {
            let capacity = count.max(self.config.chunk_size);
            self.chunks.push(Chunk::new(capacity));
        }
        let chunk_index = self.chunks.len() as u32 - 1;
        let chunk = self.chunks.last_mut().unwrap();
        let slot = chunk.len;
        for _ in 0..count {
            chunk.slots.push(fill);
        }
        chunk.len += count;
        TwigRef {
            chunk: chunk_index,
            slot,
        }
    }

    fn active_chunk(&self) -> &Chunk {
        self.chunks.last().unwrap()
    }

    pub fn get(&self, r: TwigRef) -> Twig {
        self.chunks[r.chunk as usize].slots[r.slot as usize]
    }

    /// Writes `twig` into `r`'s slot in place. Caller must have already
    /// checked `is_mutable(r)`.
    pub fn set(&mut self, r: TwigRef, twig: Twig) {
        self.chunks[r.chunk as usize].slots[r.slot as usize] = twig;
    }

    /// Whether `r`'s chunk may still be mutated in place, i.e. no snapshot
    /// besides the current writer can observe it.
    pub fn is_mutable(&self, r: TwigRef) -> bool {
        !self.chunks[r.chunk as usize].shared
    }

    /// Marks every chunk currently in use as shared, so that all further
    /// writes copy-on-write. Called once a version is published to
    /// readers (`multi::QpMulti::commit`).
    pub fn mark_all_shared(&mut self) {
        for chunk in &mut self.chunks {
            chunk.shared = true;
        }
    }

    /// Marks `count` slots starting at `r` as dead. The slots remain
    /// dereferenceable; only the accounting changes. If `r`'s chunk is
    /// shared, the same count is also added to `hold`: a shared chunk may
    /// still be reachable through a pinned snapshot's root, so these
    /// slots are dead-but-not-yet-free until that snapshot retires and
    /// the caller balances the count with `release_hold`.
    pub fn reclaim(&mut self, r: TwigRef, count: u32) {
        if r.is_null() || count == 0 {
            return;
        }
        let shared = self.chunks[r.chunk as usize].shared;
        self.chunks[r.chunk as usize].dead += count;
        if shared {
            self.hold += count as u64;
        }
    }

    /// Moves `count` slots from the free count into a hold count, for
    /// slots that are dead but still reachable from a pinned snapshot
    /// (`multi::QpMulti`'s deferred-detach bookkeeping).
    pub fn add_hold(&mut self, count: u64) {
        self.hold += count;
    }

    pub fn release_hold(&mut self, count: u64) {
        self.hold = self.hold.saturating_sub(count);
    }

    /// Global `live / used` ratio across every chunk, `1.0` when nothing
    /// has ever been allocated.
    fn live_fraction(&self) -> f64 {
        let used: u64 = self.chunks.iter().map(|c| c.len as u64).sum();
        if used == 0 {
            return 1.0;
        }
        let dead: u64 = self.chunks.iter().map(|c| c.dead as u64).sum();
        (used - dead) as f64 / used as f64
    }

    /// Whether any single chunk is more than `PER_CHUNK_DEAD_FRACTION`
    /// dead, independent of how healthy the global ratio looks.
    fn has_hot_chunk(&self) -> bool {
        self.chunks
            .iter()
            .any(|c| c.len > 0 && (c.dead as f64 / c.len as f64) > PER_CHUNK_DEAD_FRACTION)
    }

    pub fn memusage(&self, leaves: u64) -> MemUsage {
        let used: u64 = self.chunks.iter().map(|c| c.len as u64).sum();
        let dead: u64 = self.chunks.iter().map(|c| c.dead as u64).sum();
        let free = dead.saturating_sub(self.hold);
        let live = used.saturating_sub(dead);
        let chunk_count = self.chunks.len() as u64;
        MemUsage {
            leaves,
            live,
            used,
            hold: self.hold,
            free,
            node_size: std::mem::size_of::<Twig>() as u64,
            chunk_size: self.config.chunk_size as u64,
            chunk_count,
            bytes: used * std::mem::size_of::<Twig>() as u64,
            fragmented: self.fragmented(),
        }
    }

    /// `spec.md` §4.3: fragmented when the global `live / used` ratio
    /// drops below `fragmentation_threshold`, or when any single chunk is
    /// more than half dead, whichever triggers first.
    pub fn fragmented(&self) -> bool {
        self.live_fraction() < self.config.fragmentation_threshold || self.has_hot_chunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtable::LeafValue;

    fn dummy_leaf() -> Twig {
        Twig::Leaf(crate::node::Leaf {
            value: LeafValue::new(0, 0),
            hash: 0,
        })
    }

    #[test]
    fn one_hot_chunk_among_many_healthy_ones_trips_fragmented() {
        // Global ratio stays well above 0.75 even though one chunk alone
        // is entirely dead.
        let mut alloc = Allocator::new(AllocConfig {
            chunk_size: 4,
            fragmentation_threshold: 0.75,
        });
        let hot = alloc.alloc_run(4, Twig::Empty);
        alloc.reclaim(hot, 4);
        for _ in 0..40 {
            alloc.alloc(dummy_leaf());
        }
        assert!(!alloc.fragmented(), "global ratio alone should not yet trip");
        // Force a fresh chunk for the hot run to be isolated and recount.
        let mut isolated = Allocator::new(AllocConfig {
            chunk_size: 4,
            fragmentation_threshold: 0.75,
        });
        let hot2 = isolated.alloc_run(4, Twig::Empty);
        isolated.reclaim(hot2, 4);
        assert!(isolated.fragmented(), "a fully dead chunk must trip fragmented on its own");
    }

    #[test]
    fn global_ratio_below_threshold_trips_fragmented_with_no_hot_chunk() {
        let mut alloc = Allocator::new(AllocConfig {
            chunk_size: 16,
            fragmentation_threshold: 0.75,
        });
        let run = alloc.alloc_run(16, Twig::Empty);
        // 40% dead, spread over one chunk: below 0.5 per-chunk but the
        // global live ratio (0.6) is still under the 0.75 threshold.
        alloc.reclaim(run, 7);
        assert!(alloc.fragmented());
    }

    #[test]
    fn reclaim_on_shared_chunk_adds_to_hold_not_just_dead() {
        let mut alloc = Allocator::new(AllocConfig::default());
        let run = alloc.alloc_run(4, Twig::Empty);
        alloc.mark_all_shared();
        alloc.reclaim(run, 2);
        let usage = alloc.memusage(0);
        assert_eq!(usage.hold, 2);
        assert_eq!(usage.free, 0, "shared-chunk reclaims aren't free until the hold is released");
        alloc.release_hold(2);
        let usage = alloc.memusage(0);
        assert_eq!(usage.free, 2);
    }

    #[test]
    fn reclaim_on_unshared_chunk_is_immediately_free() {
        let mut alloc = Allocator::new(AllocConfig::default());
        let run = alloc.alloc_run(4, Twig::Empty);
        alloc.reclaim(run, 2);
        let usage = alloc.memusage(0);
        assert_eq!(usage.hold, 0);
        assert_eq!(usage.free, 2);
    }
}
