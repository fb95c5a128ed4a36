//! Mapping-table updates and the sparse-binding backend seam
//!
//! The residency manager never talks to a graphics device directly; it
//! emits coalesced per-resource batches of map/unmap operations through
//! the [`TileMappingBackend`] trait. A device-backed implementation
//! forwards them to the sparse-binding facility; [`RecordingBackend`]
//! keeps the state in memory for tests and headless runs.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::error::StreamResult;
use crate::tiling::{ResourceId, TileAddress, INVALID_SLOT};

/// Operation applied to one tile address in a mapping batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOp {
    Map,
    Unmap,
}

/// One entry of a coalesced per-resource mapping batch
///
/// `slot` is the physical pool slot being mapped, or the slot being
/// released for an eviction unmap; full null-mapping updates carry
/// [`INVALID_SLOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingUpdate {
    pub address: TileAddress,
    pub op: MappingOp,
    pub slot: u32,
}

impl MappingUpdate {
    pub fn map(address: TileAddress, slot: u32) -> Self {
        Self {
            address,
            op: MappingOp::Map,
            slot,
        }
    }

    pub fn unmap(address: TileAddress, slot: u32) -> Self {
        Self {
            address,
            op: MappingOp::Unmap,
            slot,
        }
    }
}

/// GPU-facing mapping entry, 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MappingEntry {
    pub x: u32,
    pub y: u32,
    pub subresource: u32,
    /// 1 = map, 0 = unmap
    pub mapped: u32,
    pub slot: u32,
    pub _pad: [u32; 3],
}

impl From<MappingUpdate> for MappingEntry {
    fn from(update: MappingUpdate) -> Self {
        Self {
            x: update.address.x,
            y: update.address.y,
            subresource: update.address.subresource,
            mapped: (update.op == MappingOp::Map) as u32,
            slot: update.slot,
            _pad: [0; 3],
        }
    }
}

/// Contract of the external sparse-binding facility
///
/// One `update_mappings` call carries a whole frame's unmap and map
/// operations for one resource, so partial states are never visible to
/// the mapping-table consumer; `barrier` fences the update before tile
/// payload uploads for the same frame.
pub trait TileMappingBackend {
    /// Apply one ordered batch of map/unmap operations for a resource.
    fn update_mappings(
        &mut self,
        resource: ResourceId,
        updates: &[MappingUpdate],
        pool_size_in_tiles: u32,
    ) -> StreamResult<()>;

    /// Fence the preceding mapping update for `resource`.
    fn barrier(&mut self, resource: ResourceId);

    /// Upload one tile's bytes into a physical pool slot.
    fn upload_tile(&mut self, slot: u32, data: &[u8]) -> StreamResult<()>;

    /// Upload one face of a resource's residency visualization grid.
    fn write_residency_texture(
        &mut self,
        resource: ResourceId,
        face: u32,
        size: u32,
        texels: &[u8],
    ) -> StreamResult<()>;
}

/// In-memory backend tracking the observable mapping state
///
/// Mirrors what a sparse-binding implementation would hold: the tile
/// address -> slot table per resource, upload activity, and the last
/// residency texture written per face.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    /// Current mapping per address; `None` = explicitly null-mapped
    mappings: HashMap<(ResourceId, TileAddress), Option<u32>>,
    /// Byte length of the last upload per slot
    slot_uploads: HashMap<u32, usize>,
    /// Last visualization texels per (resource, face)
    residency_textures: HashMap<(ResourceId, u32), Vec<u8>>,
    pub update_calls: u64,
    pub barrier_calls: u64,
    pub upload_calls: u64,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot currently mapped at `address`, if any.
    pub fn mapped_slot(&self, resource: ResourceId, address: TileAddress) -> Option<u32> {
        self.mappings.get(&(resource, address)).copied().flatten()
    }

    /// True if the address has ever been touched by a mapping update.
    pub fn is_tracked(&self, resource: ResourceId, address: TileAddress) -> bool {
        self.mappings.contains_key(&(resource, address))
    }

    /// Snapshot of the full mapping table, for state comparisons.
    pub fn mapping_snapshot(&self) -> Vec<((ResourceId, TileAddress), Option<u32>)> {
        let mut out: Vec<_> = self.mappings.iter().map(|(k, v)| (*k, *v)).collect();
        out.sort_by_key(|((r, a), _)| (*r, a.subresource, a.y, a.x));
        out
    }

    pub fn upload_len(&self, slot: u32) -> Option<usize> {
        self.slot_uploads.get(&slot).copied()
    }

    pub fn residency_texture(&self, resource: ResourceId, face: u32) -> Option<&[u8]> {
        self.residency_textures
            .get(&(resource, face))
            .map(Vec::as_slice)
    }
}

impl TileMappingBackend for RecordingBackend {
    fn update_mappings(
        &mut self,
        resource: ResourceId,
        updates: &[MappingUpdate],
        _pool_size_in_tiles: u32,
    ) -> StreamResult<()> {
        for update in updates {
            // Apply from the same GPU-facing entry a device backend
            // would upload.
            let entry = MappingEntry::from(*update);
            debug_assert!(entry.mapped == 0 || entry.slot != INVALID_SLOT);
            let address = TileAddress::new(entry.x, entry.y, entry.subresource);
            let value = (entry.mapped == 1).then_some(entry.slot);
            self.mappings.insert((resource, address), value);
        }
        self.update_calls += 1;
        Ok(())
    }

    fn barrier(&mut self, _resource: ResourceId) {
        self.barrier_calls += 1;
    }

    fn upload_tile(&mut self, slot: u32, data: &[u8]) -> StreamResult<()> {
        self.slot_uploads.insert(slot, data.len());
        self.upload_calls += 1;
        Ok(())
    }

    fn write_residency_texture(
        &mut self,
        resource: ResourceId,
        face: u32,
        _size: u32,
        texels: &[u8],
    ) -> StreamResult<()> {
        self.residency_textures
            .insert((resource, face), texels.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_entry_layout() {
        assert_eq!(std::mem::size_of::<MappingEntry>(), 32);

        let entry: MappingEntry = MappingUpdate::map(TileAddress::new(3, 7, 2), 41).into();
        assert_eq!(entry.x, 3);
        assert_eq!(entry.y, 7);
        assert_eq!(entry.subresource, 2);
        assert_eq!(entry.mapped, 1);
        assert_eq!(entry.slot, 41);
    }

    #[test]
    fn test_recording_backend_applies_in_order() {
        let mut backend = RecordingBackend::new();
        let resource = ResourceId(0);
        let address = TileAddress::new(0, 0, 0);

        // Unmap then map in one batch: the map wins.
        backend
            .update_mappings(
                resource,
                &[
                    MappingUpdate::unmap(address, 5),
                    MappingUpdate::map(address, 9),
                ],
                16,
            )
            .unwrap();
        assert_eq!(backend.mapped_slot(resource, address), Some(9));

        backend
            .update_mappings(resource, &[MappingUpdate::unmap(address, 9)], 16)
            .unwrap();
        assert_eq!(backend.mapped_slot(resource, address), None);
        assert!(backend.is_tracked(resource, address));
        assert_eq!(backend.update_calls, 2);
    }
}
