//! Tile identity and tiling metadata
//!
//! This module provides the value types naming tiles across managed
//! resources (address + owning resource index) and the per-resource
//! tiling description used to resolve samples, compute file offsets,
//! and validate device-reported tiling at registration.

use crate::error::{StreamError, StreamResult};

/// Number of faces in a cube texture
pub const CUBE_FACE_COUNT: u32 = 6;

/// Slot value used when a batch entry carries no pool association
pub const INVALID_SLOT: u32 = u32::MAX;

/// Non-owning index into the manager's resource arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Address of a tile within one resource's tiling layout
///
/// `subresource` encodes mip level and cube face, see
/// [`subresource_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAddress {
    /// Tile X coordinate within the subresource grid
    pub x: u32,
    /// Tile Y coordinate within the subresource grid
    pub y: u32,
    /// Linearized subresource index (mip + face)
    pub subresource: u32,
}

impl TileAddress {
    pub fn new(x: u32, y: u32, subresource: u32) -> Self {
        Self { x, y, subresource }
    }
}

/// Unique name of a tile across all managed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub resource: ResourceId,
    pub address: TileAddress,
}

impl TileKey {
    pub fn new(resource: ResourceId, address: TileAddress) -> Self {
        Self { resource, address }
    }
}

/// Linearize (mip, face) into a subresource index
#[inline]
pub fn subresource_index(mip: u32, face: u32, mip_count: u32) -> u32 {
    face * mip_count + mip
}

/// Recover (mip, face) from a subresource index
#[inline]
pub fn subresource_mip_face(subresource: u32, mip_count: u32) -> (u32, u32) {
    (subresource % mip_count, subresource / mip_count)
}

/// Tile-grid dimensions of one subresource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
}

impl SubresourceTiling {
    pub fn new(width_in_tiles: u32, height_in_tiles: u32) -> Self {
        Self {
            width_in_tiles,
            height_in_tiles,
        }
    }

    pub fn tile_count(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles
    }
}

/// Packed-mip description: the coarsest mips of a resource stored as
/// one shared block per face rather than individually tiled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackedMipDesc {
    /// Mips with their own tile grids
    pub standard_mip_count: u32,
    /// Mips sharing the packed block
    pub packed_mip_count: u32,
    /// Blocks occupied by the packed region, per face
    pub tiles_for_packed_mips: u32,
}

/// Description of a tiled texture handed to the manager at registration
///
/// `tiling` carries the device-reported per-mip tile grids (identical
/// across faces); the manager cross-checks them against the grids
/// implied by the texel dimensions and rejects the resource on any
/// mismatch.
#[derive(Debug, Clone)]
pub struct TiledTextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    /// 6 for cube textures; 1 for plain 2D
    pub face_count: u32,
    /// Texels per tile edge, horizontal
    pub tile_texel_width: u32,
    /// Texels per tile edge, vertical
    pub tile_texel_height: u32,
    /// Device-reported tiling, one entry per mip; packed mips are (0, 0)
    pub tiling: Vec<SubresourceTiling>,
    pub packed: PackedMipDesc,
}

impl TiledTextureDesc {
    /// Build a description whose reported tiling equals the computed one.
    pub fn with_computed_tiling(
        width: u32,
        height: u32,
        mip_count: u32,
        face_count: u32,
        tile_texel_width: u32,
        tile_texel_height: u32,
        standard_mip_count: u32,
    ) -> Self {
        let packed_mip_count = mip_count - standard_mip_count;
        let packed = PackedMipDesc {
            standard_mip_count,
            packed_mip_count,
            tiles_for_packed_mips: if packed_mip_count > 0 { 1 } else { 0 },
        };
        let mut desc = Self {
            width,
            height,
            mip_count,
            face_count,
            tile_texel_width,
            tile_texel_height,
            tiling: Vec::new(),
            packed,
        };
        desc.tiling = desc.expected_tiling();
        desc
    }

    /// Tile grids implied by the texel dimensions and mip chain
    pub fn expected_tiling(&self) -> Vec<SubresourceTiling> {
        (0..self.mip_count)
            .map(|mip| {
                if mip >= self.packed.standard_mip_count {
                    return SubresourceTiling::new(0, 0);
                }
                let w = (self.width >> mip).max(1);
                let h = (self.height >> mip).max(1);
                SubresourceTiling::new(
                    w.div_ceil(self.tile_texel_width),
                    h.div_ceil(self.tile_texel_height),
                )
            })
            .collect()
    }

    /// Cross-check the reported tiling against the computed one.
    ///
    /// A mismatch means a corrupt or unexpected resource description and
    /// is surfaced immediately at registration.
    pub fn validate(&self) -> StreamResult<()> {
        if self.mip_count == 0 || self.face_count == 0 {
            return Err(StreamError::tiling("resource has no subresources"));
        }
        if self.tile_texel_width == 0 || self.tile_texel_height == 0 {
            return Err(StreamError::tiling("tile texel dimensions must be nonzero"));
        }
        if self.packed.standard_mip_count + self.packed.packed_mip_count != self.mip_count {
            return Err(StreamError::tiling(format!(
                "packed-mip split {}+{} does not cover {} mips",
                self.packed.standard_mip_count, self.packed.packed_mip_count, self.mip_count
            )));
        }
        if self.tiling.len() != self.mip_count as usize {
            return Err(StreamError::tiling(format!(
                "reported tiling covers {} subresources, expected {}",
                self.tiling.len(),
                self.mip_count
            )));
        }
        for (mip, (reported, expected)) in self
            .tiling
            .iter()
            .zip(self.expected_tiling().iter())
            .enumerate()
        {
            if reported != expected {
                return Err(StreamError::tiling(format!(
                    "mip {}: reported {}x{} tiles, expected {}x{}",
                    mip,
                    reported.width_in_tiles,
                    reported.height_in_tiles,
                    expected.width_in_tiles,
                    expected.height_in_tiles
                )));
            }
        }
        Ok(())
    }

    /// Tiling of one mip level
    pub fn tiling_for_mip(&self, mip: u32) -> SubresourceTiling {
        self.tiling[mip as usize]
    }

    /// Tiling of the base (finest) subresource
    pub fn base_tiling(&self) -> SubresourceTiling {
        self.tiling[0]
    }

    /// Index of the coarsest individually-tiled mip
    pub fn coarsest_standard_mip(&self) -> u32 {
        self.packed.standard_mip_count.saturating_sub(1)
    }

    /// Standard tiles per face, excluding the packed region
    pub fn standard_tiles_per_face(&self) -> u32 {
        self.tiling[..self.packed.standard_mip_count as usize]
            .iter()
            .map(|t| t.tile_count())
            .sum()
    }

    /// Total blocks in the backing file across all faces
    pub fn total_tiles(&self) -> u32 {
        self.face_count * (self.standard_tiles_per_face() + self.packed.tiles_for_packed_mips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_round_trip() {
        let mip_count = 6;
        for face in 0..CUBE_FACE_COUNT {
            for mip in 0..mip_count {
                let sub = subresource_index(mip, face, mip_count);
                assert_eq!(subresource_mip_face(sub, mip_count), (mip, face));
            }
        }
    }

    #[test]
    fn test_expected_tiling_mip_chain() {
        let desc = TiledTextureDesc::with_computed_tiling(2048, 2048, 6, 1, 256, 256, 6);
        let dims: Vec<(u32, u32)> = desc
            .tiling
            .iter()
            .map(|t| (t.width_in_tiles, t.height_in_tiles))
            .collect();
        assert_eq!(
            dims,
            vec![(8, 8), (4, 4), (2, 2), (1, 1), (1, 1), (1, 1)]
        );
        assert_eq!(desc.standard_tiles_per_face(), 64 + 16 + 4 + 3);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_packed_mips_excluded_from_grids() {
        let desc = TiledTextureDesc::with_computed_tiling(4096, 4096, 8, 6, 256, 256, 5);
        assert_eq!(desc.packed.packed_mip_count, 3);
        assert_eq!(desc.tiling[5], SubresourceTiling::new(0, 0));
        assert_eq!(
            desc.total_tiles(),
            6 * (256 + 64 + 16 + 4 + 1 + 1)
        );
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_tiling_mismatch_rejected() {
        let mut desc = TiledTextureDesc::with_computed_tiling(2048, 2048, 4, 1, 256, 256, 4);
        desc.tiling[1] = SubresourceTiling::new(3, 4);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_non_square_grid() {
        let desc = TiledTextureDesc::with_computed_tiling(1024, 512, 1, 1, 256, 128, 1);
        assert_eq!(desc.base_tiling(), SubresourceTiling::new(4, 4));
    }
}
