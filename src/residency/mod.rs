//! Tile residency management
//!
//! The [`ResidencyManager`] decides, once per frame, which tiles of the
//! managed sparse textures must live in the shared physical tile pool:
//! it resolves visibility samples into tracked tiles across a mip
//! fallback chain, dispatches bounded-concurrency loads, promotes
//! completed loads into pool slots (evicting stale residents under
//! capacity pressure), applies the resulting mapping updates as one
//! coalesced batch per resource, and keeps a per-face residency bitmap
//! the sampling shader can consult.
//!
//! All collection/table/bitmap mutation happens on the caller's frame
//! context; loader workers only touch the buffer pool and the
//! completion channel.

pub mod bitmap;
pub mod tile;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use glam::Vec2;
use log::{debug, info};

use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::loader::{BufferPool, LoadedTile, TileLoader};
use crate::mapping::{MappingUpdate, TileMappingBackend};
use crate::tiling::{
    subresource_index, ResourceId, TileAddress, TileKey, TiledTextureDesc, INVALID_SLOT,
};

use bitmap::ResidencyMap;
use tile::{TilePriority, TileStage, TrackedTile};

/// One visibility sample produced by the external feedback pass
#[derive(Debug, Clone, Copy)]
pub struct DecodedSample {
    /// Normalized texture coordinate on `face`
    pub uv: Vec2,
    /// Requested mip level (clamped by the resolver)
    pub mip: u32,
    /// Cube face index
    pub face: u32,
}

impl DecodedSample {
    pub fn new(u: f32, v: f32, mip: u32, face: u32) -> Self {
        Self {
            uv: Vec2::new(u, v),
            mip,
            face,
        }
    }
}

/// One sparse texture under management
struct ManagedResource {
    desc: TiledTextureDesc,
    loader: TileLoader,
    residency: ResidencyMap,
    vis_dirty: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    loads_dispatched: u64,
    loads_completed: u64,
    orphaned_loads: u64,
    evictions: u64,
    dropped_stale: u64,
    frames_processed: u64,
}

/// Snapshot of manager state and activity
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidencyStats {
    /// Tiles in the tracking table
    pub tracked: usize,
    /// Candidates not yet dispatched
    pub seen: usize,
    /// Dispatched, bytes not yet available
    pub loading: usize,
    /// Bytes available, awaiting a slot
    pub loaded: usize,
    /// Resident in the pool
    pub mapped: usize,
    /// Loads currently in flight
    pub in_flight: usize,
    /// Unused pool slots
    pub free_slots: usize,
    /// Slots held back for the default tile and packed mips
    pub reserved_slots: u32,
    pub loads_dispatched: u64,
    pub loads_completed: u64,
    pub orphaned_loads: u64,
    pub evictions: u64,
    pub dropped_stale: u64,
    pub frames_processed: u64,
}

/// Virtual-texture tile residency manager
pub struct ResidencyManager<B: TileMappingBackend> {
    config: StreamConfig,
    backend: B,
    resources: Vec<ManagedResource>,
    tiles: HashMap<TileKey, TrackedTile>,
    seen: VecDeque<TileKey>,
    loading: VecDeque<TileKey>,
    mapped: VecDeque<TileKey>,
    free_slots: Vec<u32>,
    reserved_slots: u32,
    /// Shared zero-filled tile every unloaded address maps to
    default_slot: Option<u32>,
    pool: Arc<BufferPool>,
    in_flight: Arc<AtomicUsize>,
    done_tx: Sender<LoadedTile>,
    done_rx: Receiver<LoadedTile>,
    counters: Counters,
}

impl<B: TileMappingBackend> ResidencyManager<B> {
    pub fn new(config: StreamConfig, backend: B) -> StreamResult<Self> {
        config.validate()?;
        let (done_tx, done_rx) = mpsc::channel();
        // Pop order hands out slot 0 first.
        let free_slots: Vec<u32> = (0..config.pool_size_in_tiles).rev().collect();
        let pool = Arc::new(BufferPool::new(config.tile_size_in_bytes));
        Ok(Self {
            config,
            backend,
            resources: Vec::new(),
            tiles: HashMap::new(),
            seen: VecDeque::new(),
            loading: VecDeque::new(),
            mapped: VecDeque::new(),
            free_slots,
            reserved_slots: 0,
            default_slot: None,
            pool,
            in_flight: Arc::new(AtomicUsize::new(0)),
            done_tx,
            done_rx,
            counters: Counters::default(),
        })
    }

    /// Register a tiled texture backed by `path`.
    ///
    /// Validates the reported tiling, builds the per-resource loader and
    /// residency bitmap, makes the packed-mip blocks permanently
    /// resident, and, if the default tile already exists, maps every
    /// standard tile address to it so no address is left dangling.
    pub fn manage_texture(
        &mut self,
        desc: TiledTextureDesc,
        path: &Path,
    ) -> StreamResult<ResourceId> {
        desc.validate()?;
        if desc.packed.packed_mip_count > 0 && self.free_slots.len() < desc.face_count as usize {
            return Err(StreamError::config(format!(
                "pool has {} free slots, {} packed-mip blocks need one each",
                self.free_slots.len(),
                desc.face_count
            )));
        }
        let id = ResourceId(self.resources.len() as u32);
        let loader = TileLoader::new(
            path,
            &desc,
            self.pool.clone(),
            self.done_tx.clone(),
            self.config.loader_threads,
            self.config.max_simultaneous_loads,
            self.config.debug_tile_borders,
        )?;
        let residency = ResidencyMap::new(desc.base_tiling(), desc.mip_count, desc.face_count);
        info!(
            "managing texture {}: {} mips ({} packed), {} tiles, {}",
            id.0,
            desc.mip_count,
            desc.packed.packed_mip_count,
            desc.total_tiles(),
            path.display()
        );
        self.resources.push(ManagedResource {
            desc,
            loader,
            residency,
            vis_dirty: true,
        });

        self.map_packed_mips(id)?;
        if self.default_slot.is_some() {
            self.map_all_to_default(id)?;
        }
        Ok(id)
    }

    /// Resolve one frame's visibility samples for `resource`.
    ///
    /// Each sample requests its clamped mip plus every coarser standard
    /// mip, so the renderer can fall back gracefully while the ideal mip
    /// is still loading. `frame` is the caller's frame clock; it must
    /// not decrease between batches.
    pub fn enqueue_samples(
        &mut self,
        resource: ResourceId,
        samples: &[DecodedSample],
        frame: u64,
    ) -> StreamResult<()> {
        let res = self
            .resources
            .get(resource.index())
            .ok_or_else(|| StreamError::config(format!("unknown resource {}", resource.0)))?;
        let desc = &res.desc;
        // A fully packed resource has no standard tiles to stream; its
        // mips are resident from registration.
        if desc.packed.standard_mip_count == 0 {
            return Ok(());
        }
        let coarsest = desc.coarsest_standard_mip();

        for sample in samples {
            if sample.face >= desc.face_count {
                continue;
            }
            let first = sample.mip.min(desc.mip_count - 1).min(coarsest);
            for mip in first..=coarsest {
                let tiling = desc.tiling_for_mip(mip);
                let tx = ((sample.uv.x * tiling.width_in_tiles as f32) as i64)
                    .clamp(0, tiling.width_in_tiles as i64 - 1) as u32;
                let ty = ((sample.uv.y * tiling.height_in_tiles as f32) as i64)
                    .clamp(0, tiling.height_in_tiles as i64 - 1) as u32;
                let address =
                    TileAddress::new(tx, ty, subresource_index(mip, sample.face, desc.mip_count));
                let key = TileKey::new(resource, address);
                match self.tiles.entry(key) {
                    Entry::Occupied(mut entry) => {
                        entry.get_mut().last_seen_frame = frame;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(TrackedTile::seen(resource, address, mip, sample.face, frame));
                        self.seen.push_back(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one scheduling cycle.
    ///
    /// Drains load completions, dispatches new loads under the
    /// concurrency cap, promotes loaded tiles into pool slots (evicting
    /// under capacity pressure), applies the coalesced mapping batches,
    /// and refreshes dirty residency visualizations.
    pub fn process_queues(&mut self) -> StreamResult<()> {
        self.drain_completions();
        self.sort_queues();
        self.dispatch_loads()?;
        let (unmaps, maps) = self.promote_and_evict();
        self.apply_batches(&unmaps, &maps)?;
        self.refresh_visualizations(false)?;
        self.counters.frames_processed += 1;
        #[cfg(debug_assertions)]
        self.assert_invariants();
        Ok(())
    }

    /// Drop all tracked tiles and return every address to a safe state.
    ///
    /// Every standard tile address of every resource is null-mapped and
    /// then mapped to the shared zero-filled default tile; consecutive
    /// resets are observably identical. On first use this also reserves
    /// the default slot and uploads its zero payload. Packed-mip
    /// mappings stay intact. Reads still in flight complete on their own
    /// and drain later as orphans.
    pub fn reset(&mut self) -> StreamResult<()> {
        for (_, tile) in self.tiles.drain() {
            if let Some(payload) = tile.payload {
                self.pool.release(payload);
            }
            if let Some(slot) = tile.slot {
                self.free_slots.push(slot);
            }
        }
        self.seen.clear();
        self.loading.clear();
        self.mapped.clear();

        self.ensure_default_tile()?;
        let default_slot = self.default_slot.unwrap(); // ensured above

        for idx in 0..self.resources.len() {
            let resource = ResourceId(idx as u32);
            self.resources[idx].residency.clear();
            self.resources[idx].vis_dirty = true;

            let addresses = standard_addresses(&self.resources[idx].desc);
            let mut entries: Vec<MappingUpdate> = addresses
                .iter()
                .map(|&a| MappingUpdate::unmap(a, INVALID_SLOT))
                .collect();
            entries.extend(
                addresses
                    .iter()
                    .map(|&a| MappingUpdate::map(a, default_slot)),
            );
            self.backend
                .update_mappings(resource, &entries, self.config.pool_size_in_tiles)?;
            self.backend.barrier(resource);
        }
        info!(
            "reset: {} resources remapped to the default tile",
            self.resources.len()
        );
        Ok(())
    }

    /// Force a refresh of every resource's residency visualization.
    pub fn render_visualization(&mut self) -> StreamResult<()> {
        self.refresh_visualizations(true)
    }

    pub fn stats(&self) -> ResidencyStats {
        let loaded = self
            .loading
            .iter()
            .filter(|k| self.tiles[*k].stage == TileStage::Loaded)
            .count();
        ResidencyStats {
            tracked: self.tiles.len(),
            seen: self.seen.len(),
            loading: self.loading.len() - loaded,
            loaded,
            mapped: self.mapped.len(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            free_slots: self.free_slots.len(),
            reserved_slots: self.reserved_slots,
            loads_dispatched: self.counters.loads_dispatched,
            loads_completed: self.counters.loads_completed,
            orphaned_loads: self.counters.orphaned_loads,
            evictions: self.counters.evictions,
            dropped_stale: self.counters.dropped_stale,
            frames_processed: self.counters.frames_processed,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stage of one tracked tile, if tracked at all.
    pub fn tile_stage(&self, key: TileKey) -> Option<TileStage> {
        self.tiles.get(&key).map(|t| t.stage)
    }

    /// Residency bitmap of one resource.
    pub fn residency_map(&self, resource: ResourceId) -> Option<&ResidencyMap> {
        self.resources.get(resource.index()).map(|r| &r.residency)
    }

    // ---- scheduling steps -------------------------------------------------

    fn drain_completions(&mut self) {
        while let Ok(done) = self.done_rx.try_recv() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            match self.tiles.get_mut(&done.key) {
                Some(tile) if tile.stage == TileStage::Loading => {
                    tile.payload = Some(done.payload);
                    tile.stage = TileStage::Loaded;
                    self.counters.loads_completed += 1;
                }
                _ => {
                    // The tile lost a load-vs-evict race and is gone from
                    // tracking; the read was wasted.
                    self.pool.release(done.payload);
                    self.counters.orphaned_loads += 1;
                }
            }
        }
    }

    fn sort_queues(&mut self) {
        let tiles = &self.tiles;
        self.seen
            .make_contiguous()
            .sort_by(|a, b| TilePriority::Load.compare(&tiles[a], &tiles[b]));
        self.loading
            .make_contiguous()
            .sort_by(|a, b| TilePriority::Ready.compare(&tiles[a], &tiles[b]));
        self.mapped
            .make_contiguous()
            .sort_by(|a, b| TilePriority::Evict.compare(&tiles[a], &tiles[b]));
    }

    fn dispatch_loads(&mut self) -> StreamResult<()> {
        while self.in_flight.load(Ordering::Acquire) < self.config.max_simultaneous_loads {
            let Some(key) = self.seen.pop_front() else {
                break;
            };
            let tile = self.tiles.get_mut(&key).unwrap(); // seen keys are tracked
            tile.stage = TileStage::Loading;
            self.resources[key.resource.index()].loader.dispatch(key)?;
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            self.loading.push_back(key);
            self.counters.loads_dispatched += 1;
        }
        Ok(())
    }

    /// Step 3: move loaded tiles into pool slots under the per-frame
    /// budget, evicting the stalest resident when the pool is full.
    /// Returns the per-resource unmap and map batch halves.
    fn promote_and_evict(&mut self) -> (Vec<Vec<MappingUpdate>>, Vec<Vec<MappingUpdate>>) {
        let n = self.resources.len();
        let mut unmaps: Vec<Vec<MappingUpdate>> = vec![Vec::new(); n];
        let mut maps: Vec<Vec<MappingUpdate>> = vec![Vec::new(); n];

        for _ in 0..self.config.max_tiles_promoted_per_frame {
            let Some(front) = self.loading.front() else {
                break;
            };
            // Ready-first ordering makes this a safe early exit.
            if self.tiles[front].stage != TileStage::Loaded {
                break;
            }
            let key = self.loading.pop_front().unwrap();

            let slot = match self.free_slots.pop() {
                Some(slot) => slot,
                None => {
                    let Some(&victim) = self.mapped.front() else {
                        // The whole pool is reserved; nothing can be promoted.
                        self.drop_pending(key);
                        continue;
                    };
                    if self.tiles[&key].last_seen_frame < self.tiles[&victim].last_seen_frame {
                        // The pending tile is staler than the eviction
                        // candidate; drop it rather than evicting a
                        // fresher resident.
                        self.drop_pending(key);
                        continue;
                    }
                    self.mapped.pop_front();
                    let victim_tile = self.tiles.remove(&victim).unwrap();
                    let victim_slot = victim_tile.slot.unwrap(); // mapped tiles carry a slot
                    unmaps[victim.resource.index()]
                        .push(MappingUpdate::unmap(victim_tile.address, victim_slot));
                    let res = &mut self.resources[victim.resource.index()];
                    res.residency.update(
                        victim_tile.face,
                        victim_tile.mip,
                        victim_tile.address.x,
                        victim_tile.address.y,
                        res.desc.tiling_for_mip(victim_tile.mip),
                        false,
                    );
                    res.vis_dirty = true;
                    self.counters.evictions += 1;
                    debug!(
                        "evicted tile {:?} (last seen {}) for {:?}",
                        victim.address, victim_tile.last_seen_frame, key.address
                    );
                    victim_slot
                }
            };

            let tile = self.tiles.get_mut(&key).unwrap();
            tile.slot = Some(slot);
            tile.stage = TileStage::Mapped;
            maps[key.resource.index()].push(MappingUpdate::map(tile.address, slot));
            let (face, mip, ax, ay) = (tile.face, tile.mip, tile.address.x, tile.address.y);
            let res = &mut self.resources[key.resource.index()];
            res.residency
                .update(face, mip, ax, ay, res.desc.tiling_for_mip(mip), true);
            res.vis_dirty = true;
            self.mapped.push_back(key);
        }

        (unmaps, maps)
    }

    fn drop_pending(&mut self, key: TileKey) {
        let tile = self.tiles.remove(&key).unwrap();
        if let Some(payload) = tile.payload {
            self.pool.release(payload);
        }
        self.counters.dropped_stale += 1;
    }

    /// Step 4: one ordered mapping update per resource (all unmaps, then
    /// all maps), a barrier, then the byte uploads for the new tiles.
    fn apply_batches(
        &mut self,
        unmaps: &[Vec<MappingUpdate>],
        maps: &[Vec<MappingUpdate>],
    ) -> StreamResult<()> {
        for idx in 0..self.resources.len() {
            if unmaps[idx].is_empty() && maps[idx].is_empty() {
                continue;
            }
            let resource = ResourceId(idx as u32);
            let mut entries = Vec::with_capacity(unmaps[idx].len() + maps[idx].len());
            entries.extend_from_slice(&unmaps[idx]);
            entries.extend_from_slice(&maps[idx]);
            self.backend
                .update_mappings(resource, &entries, self.config.pool_size_in_tiles)?;
            self.backend.barrier(resource);

            for update in &maps[idx] {
                let key = TileKey::new(resource, update.address);
                let tile = self.tiles.get_mut(&key).unwrap();
                let payload = tile.payload.take().expect("mapped tile lost its payload");
                self.backend.upload_tile(update.slot, &payload)?;
                self.resources[idx].loader.complete_loading(payload);
            }
        }
        Ok(())
    }

    fn refresh_visualizations(&mut self, force: bool) -> StreamResult<()> {
        for idx in 0..self.resources.len() {
            if !force && !self.resources[idx].vis_dirty {
                continue;
            }
            let resource = ResourceId(idx as u32);
            let size = self.config.visualization_size;
            for face in 0..self.resources[idx].desc.face_count {
                let texels = self.resources[idx].residency.downsample(face, size);
                self.backend
                    .write_residency_texture(resource, face, size, &texels)?;
            }
            self.resources[idx].vis_dirty = false;
        }
        Ok(())
    }

    // ---- registration helpers ---------------------------------------------

    /// Load each face's packed block synchronously and map every packed
    /// mip of that face to one reserved slot. Packed mips stay resident
    /// for the lifetime of the manager.
    fn map_packed_mips(&mut self, id: ResourceId) -> StreamResult<()> {
        let res = &self.resources[id.index()];
        if res.desc.packed.packed_mip_count == 0 {
            return Ok(());
        }
        let mip_count = res.desc.mip_count;
        let standard = res.desc.packed.standard_mip_count;
        for face in 0..res.desc.face_count {
            // Registration checked capacity for all faces up front.
            let slot = self.free_slots.pop().expect("packed slot available");
            self.reserved_slots += 1;

            let res = &self.resources[id.index()];
            let block = TileAddress::new(0, 0, subresource_index(standard, face, mip_count));
            let payload = res.loader.read_tile_blocking(block);

            let updates: Vec<MappingUpdate> = (standard..mip_count)
                .map(|mip| {
                    MappingUpdate::map(
                        TileAddress::new(0, 0, subresource_index(mip, face, mip_count)),
                        slot,
                    )
                })
                .collect();
            self.backend
                .update_mappings(id, &updates, self.config.pool_size_in_tiles)?;
            self.backend.barrier(id);
            self.backend.upload_tile(slot, &payload)?;
            self.resources[id.index()].loader.complete_loading(payload);
        }
        Ok(())
    }

    fn map_all_to_default(&mut self, id: ResourceId) -> StreamResult<()> {
        let default_slot = self.default_slot.unwrap(); // caller checked
        let addresses = standard_addresses(&self.resources[id.index()].desc);
        let entries: Vec<MappingUpdate> = addresses
            .into_iter()
            .map(|a| MappingUpdate::map(a, default_slot))
            .collect();
        self.backend
            .update_mappings(id, &entries, self.config.pool_size_in_tiles)?;
        self.backend.barrier(id);
        Ok(())
    }

    /// Reserve the shared default slot and upload its zero-filled tile.
    ///
    /// Some hardware leaves reads from never-mapped addresses undefined;
    /// pointing every unloaded address at a zero tile makes "not yet
    /// loaded" observably safe.
    fn ensure_default_tile(&mut self) -> StreamResult<()> {
        if self.default_slot.is_some() {
            return Ok(());
        }
        let slot = self
            .free_slots
            .pop()
            .ok_or_else(|| StreamError::config("pool too small for the default tile"))?;
        self.reserved_slots += 1;
        let mut payload = self.pool.acquire();
        payload.fill(0);
        self.backend.upload_tile(slot, &payload)?;
        self.pool.release(payload);
        self.default_slot = Some(slot);
        debug!("default tile reserved in slot {}", slot);
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self) {
        assert!(
            self.mapped.len() as u32 + self.reserved_slots <= self.config.pool_size_in_tiles,
            "pool over capacity: {} mapped + {} reserved > {}",
            self.mapped.len(),
            self.reserved_slots,
            self.config.pool_size_in_tiles
        );
        let mut membership: HashMap<TileKey, usize> = HashMap::new();
        for &k in self.seen.iter().chain(&self.loading).chain(&self.mapped) {
            *membership.entry(k).or_insert(0) += 1;
        }
        for (key, tile) in &self.tiles {
            assert_eq!(
                membership.get(key).copied().unwrap_or(0),
                1,
                "tile {:?} not in exactly one stage collection",
                key
            );
            let expected = match tile.stage {
                TileStage::Seen => self.seen.contains(key),
                TileStage::Loading | TileStage::Loaded => self.loading.contains(key),
                TileStage::Mapped => self.mapped.contains(key),
            };
            assert!(expected, "tile {:?} in wrong collection for {:?}", key, tile.stage);
        }
        assert_eq!(membership.len(), self.tiles.len(), "untracked key in a stage collection");
    }
}

/// Every individually tiled address of a resource, excluding the
/// packed-mip region.
fn standard_addresses(desc: &TiledTextureDesc) -> Vec<TileAddress> {
    let mut out = Vec::with_capacity((desc.face_count * desc.standard_tiles_per_face()) as usize);
    for face in 0..desc.face_count {
        for mip in 0..desc.packed.standard_mip_count {
            let tiling = desc.tiling_for_mip(mip);
            let sub = subresource_index(mip, face, desc.mip_count);
            for y in 0..tiling.height_in_tiles {
                for x in 0..tiling.width_in_tiles {
                    out.push(TileAddress::new(x, y, sub));
                }
            }
        }
    }
    out
}
