//! Tracked tile records and ordering
//!
//! A tile moves Seen -> Loading -> Loaded -> Mapped; the scheduler keeps
//! one ordered collection per pipeline stage and sorts each with a
//! [`TilePriority`] comparator before working through it.

use std::cmp::Ordering;

use crate::tiling::{ResourceId, TileAddress};

/// Lifecycle stage of a tracked tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStage {
    /// Resolved from a visibility sample, not yet dispatched
    Seen,
    /// Handed to the loader, bytes not yet available
    Loading,
    /// Bytes available, awaiting a pool slot
    Loaded,
    /// Resident in the physical pool
    Mapped,
}

/// Per-tile mutable state
#[derive(Debug)]
pub struct TrackedTile {
    pub resource: ResourceId,
    pub address: TileAddress,
    pub mip: u32,
    pub face: u32,
    /// Frame-clock value of the last visibility sample hitting this tile
    pub last_seen_frame: u64,
    /// Physical pool slot, valid only once Mapped
    pub slot: Option<u32>,
    /// Pool buffer, owned only between load completion and byte upload
    pub payload: Option<Vec<u8>>,
    pub stage: TileStage,
}

impl TrackedTile {
    pub fn seen(
        resource: ResourceId,
        address: TileAddress,
        mip: u32,
        face: u32,
        frame: u64,
    ) -> Self {
        Self {
            resource,
            address,
            mip,
            face,
            last_seen_frame: frame,
            slot: None,
            payload: None,
            stage: TileStage::Seen,
        }
    }
}

/// Stage-collection comparators
///
/// An explicit tagged enum instead of comparator delegates; each variant
/// dispatches to one comparison function.
#[derive(Debug, Clone, Copy)]
pub enum TilePriority {
    /// Order `seen` for dispatch: stalest first, finer mips break ties.
    ///
    /// Popping the stalest candidate first is preserved as observed even
    /// though freshest-first is the plausibly intended policy.
    Load,
    /// Order `loading` for promotion: ready tiles first, then load order
    Ready,
    /// Order `mapped` for eviction: most stale first
    Evict,
}

impl TilePriority {
    pub fn compare(self, a: &TrackedTile, b: &TrackedTile) -> Ordering {
        match self {
            TilePriority::Load => load_order(a, b),
            TilePriority::Ready => ready_order(a, b),
            TilePriority::Evict => evict_order(a, b),
        }
    }
}

fn load_order(a: &TrackedTile, b: &TrackedTile) -> Ordering {
    a.last_seen_frame
        .cmp(&b.last_seen_frame)
        .then(a.mip.cmp(&b.mip))
}

fn ready_order(a: &TrackedTile, b: &TrackedTile) -> Ordering {
    let a_waiting = a.stage != TileStage::Loaded;
    let b_waiting = b.stage != TileStage::Loaded;
    a_waiting.cmp(&b_waiting).then_with(|| load_order(a, b))
}

fn evict_order(a: &TrackedTile, b: &TrackedTile) -> Ordering {
    a.last_seen_frame
        .cmp(&b.last_seen_frame)
        .then(b.mip.cmp(&a.mip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(frame: u64, mip: u32, stage: TileStage) -> TrackedTile {
        let mut t = TrackedTile::seen(
            ResourceId(0),
            TileAddress::new(0, 0, mip),
            mip,
            0,
            frame,
        );
        t.stage = stage;
        t
    }

    #[test]
    fn test_load_order_stalest_first() {
        let stale = tile(3, 2, TileStage::Seen);
        let fresh = tile(9, 0, TileStage::Seen);
        assert_eq!(TilePriority::Load.compare(&stale, &fresh), Ordering::Less);
        // Tie on frame: finer mip sorts first.
        let fine = tile(5, 0, TileStage::Seen);
        let coarse = tile(5, 3, TileStage::Seen);
        assert_eq!(TilePriority::Load.compare(&fine, &coarse), Ordering::Less);
    }

    #[test]
    fn test_ready_order_loaded_before_loading() {
        let ready = tile(9, 0, TileStage::Loaded);
        let waiting = tile(1, 0, TileStage::Loading);
        assert_eq!(TilePriority::Ready.compare(&ready, &waiting), Ordering::Less);

        let ready_stale = tile(2, 0, TileStage::Loaded);
        assert_eq!(
            TilePriority::Ready.compare(&ready_stale, &ready),
            Ordering::Less
        );
    }

    #[test]
    fn test_evict_order_most_stale_first() {
        let stale = tile(1, 0, TileStage::Mapped);
        let fresh = tile(8, 0, TileStage::Mapped);
        assert_eq!(TilePriority::Evict.compare(&stale, &fresh), Ordering::Less);
        // Tie on frame: inverted tie-break relative to load order.
        let fine = tile(4, 0, TileStage::Mapped);
        let coarse = tile(4, 3, TileStage::Mapped);
        assert_eq!(
            TilePriority::Evict.compare(&coarse, &fine),
            Ordering::Less
        );
    }
}
