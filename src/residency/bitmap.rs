//! Per-face residency bitmap
//!
//! A byte grid per cube face at base-subresource tile resolution. Each
//! cell records the finest resident detail covering it, encoded so that
//! larger means finer: `encode(mip) = mip_count - mip`, with 0 meaning
//! no detail at all. Mapping a tile refines every covered cell with
//! `max`; evicting one coarsens with `min` against the detail the
//! fallback chain still provides, so overlapping updates from different
//! mip levels never regress a cell below what is still resident
//! elsewhere. A small down-sampled copy of the grid is what the sampling
//! shader actually reads.

use crate::tiling::SubresourceTiling;

/// Available-detail grid for every face of one resource
#[derive(Debug)]
pub struct ResidencyMap {
    base: SubresourceTiling,
    mip_count: u32,
    faces: Vec<Vec<u8>>,
}

impl ResidencyMap {
    pub fn new(base: SubresourceTiling, mip_count: u32, face_count: u32) -> Self {
        let cells = base.tile_count() as usize;
        Self {
            base,
            mip_count,
            faces: (0..face_count).map(|_| vec![0u8; cells]).collect(),
        }
    }

    /// Encoded detail value of one mip level; 0 means "no detail"
    pub fn encode(&self, mip: u32) -> u8 {
        (self.mip_count - mip.min(self.mip_count)) as u8
    }

    /// Reset every cell to "no detail".
    pub fn clear(&mut self) {
        for face in &mut self.faces {
            face.fill(0);
        }
    }

    /// Apply one tile's footprint to its face.
    ///
    /// `refine` = the tile was just mapped; otherwise it was evicted and
    /// every covered cell falls back to one level coarser.
    pub fn update(
        &mut self,
        face: u32,
        mip: u32,
        tile_x: u32,
        tile_y: u32,
        tiling: SubresourceTiling,
        refine: bool,
    ) {
        // Footprint in base cells of one tile at this mip.
        let scale_x = (self.base.width_in_tiles / tiling.width_in_tiles).max(1);
        let scale_y = (self.base.height_in_tiles / tiling.height_in_tiles).max(1);

        let x0 = tile_x * scale_x;
        let y0 = tile_y * scale_y;
        let x1 = (x0 + scale_x).min(self.base.width_in_tiles);
        let y1 = (y0 + scale_y).min(self.base.height_in_tiles);

        let value = if refine {
            self.encode(mip)
        } else {
            self.encode(mip).saturating_sub(1)
        };

        let grid = &mut self.faces[face as usize];
        for y in y0..y1 {
            let row = (y * self.base.width_in_tiles) as usize;
            for x in x0..x1 {
                let cell = &mut grid[row + x as usize];
                *cell = if refine {
                    (*cell).max(value)
                } else {
                    (*cell).min(value)
                };
            }
        }
    }

    pub fn cell(&self, face: u32, x: u32, y: u32) -> u8 {
        self.faces[face as usize][(y * self.base.width_in_tiles + x) as usize]
    }

    pub fn face(&self, face: u32) -> &[u8] {
        &self.faces[face as usize]
    }

    pub fn face_count(&self) -> u32 {
        self.faces.len() as u32
    }

    /// Max-pool one face into a `size` x `size` visualization grid.
    pub fn downsample(&self, face: u32, size: u32) -> Vec<u8> {
        let grid = &self.faces[face as usize];
        let mut out = vec![0u8; (size * size) as usize];
        for (i, v) in grid.iter().enumerate() {
            let x = i as u32 % self.base.width_in_tiles;
            let y = i as u32 / self.base.width_in_tiles;
            let ox = (x * size / self.base.width_in_tiles).min(size - 1);
            let oy = (y * size / self.base.height_in_tiles).min(size - 1);
            let cell = &mut out[(oy * size + ox) as usize];
            *cell = (*cell).max(*v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_8x8(mip_count: u32) -> ResidencyMap {
        ResidencyMap::new(SubresourceTiling::new(8, 8), mip_count, 1)
    }

    #[test]
    fn test_encode_finer_is_larger() {
        let map = map_8x8(4);
        assert_eq!(map.encode(0), 4);
        assert_eq!(map.encode(3), 1);
        assert!(map.encode(0) > map.encode(1));
    }

    #[test]
    fn test_refine_covers_footprint() {
        let mut map = map_8x8(4);
        // A mip-2 tile (2x2 grid) covers a 4x4 block of base cells.
        map.update(0, 2, 1, 0, SubresourceTiling::new(2, 2), true);
        assert_eq!(map.cell(0, 4, 0), map.encode(2));
        assert_eq!(map.cell(0, 7, 3), map.encode(2));
        assert_eq!(map.cell(0, 3, 0), 0);
        assert_eq!(map.cell(0, 4, 4), 0);
    }

    #[test]
    fn test_refine_never_regresses_finer_detail() {
        let mut map = map_8x8(4);
        map.update(0, 0, 0, 0, SubresourceTiling::new(8, 8), true);
        // A coarser overlapping tile must not lower the cell.
        map.update(0, 3, 0, 0, SubresourceTiling::new(1, 1), true);
        assert_eq!(map.cell(0, 0, 0), map.encode(0));
    }

    #[test]
    fn test_coarsen_round_trip() {
        let mut map = map_8x8(4);
        // Fallback chain resident: mip 3 everywhere, then mip 2.
        map.update(0, 3, 0, 0, SubresourceTiling::new(1, 1), true);
        map.update(0, 2, 0, 0, SubresourceTiling::new(2, 2), true);
        let before: Vec<u8> = map.face(0).to_vec();

        // Map then evict a mip-1 tile: every covered cell is restored.
        map.update(0, 1, 0, 0, SubresourceTiling::new(4, 4), true);
        assert_eq!(map.cell(0, 0, 0), map.encode(1));
        map.update(0, 1, 0, 0, SubresourceTiling::new(4, 4), false);
        assert_eq!(map.face(0), &before[..]);
    }

    #[test]
    fn test_clear_resets_to_no_detail() {
        let mut map = map_8x8(4);
        map.update(0, 0, 3, 3, SubresourceTiling::new(8, 8), true);
        map.clear();
        assert!(map.face(0).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_downsample_max_pools() {
        let mut map = map_8x8(4);
        map.update(0, 0, 7, 7, SubresourceTiling::new(8, 8), true);
        let vis = map.downsample(0, 4);
        assert_eq!(vis.len(), 16);
        assert_eq!(vis[15], map.encode(0));
        assert_eq!(vis[0], 0);
    }
}
