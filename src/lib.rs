//! tilestream: virtual-texture tile residency management
//!
//! Large sparse cube textures are split into fixed-size tiles backed by
//! a tile file on disk; only a small physical tile pool is ever
//! resident. Each frame the [`ResidencyManager`] turns visibility
//! samples from the renderer's feedback pass into load, eviction, and
//! mapping decisions:
//!
//! - [`residency`] — the per-frame scheduler, tile tracking table, and
//!   residency bitmaps
//! - [`loader`] — bounded-concurrency background tile reads and the
//!   shared payload buffer pool
//! - [`mapping`] — coalesced map/unmap batches and the backend trait the
//!   sparse-binding facility implements
//! - [`tiling`] — tile addressing, subresource layout, and texture
//!   descriptions
//!
//! The crate is renderer-agnostic: graphics-API work (binding updates,
//! uploads, barriers) happens behind [`mapping::TileMappingBackend`].

pub mod config;
pub mod error;
pub mod loader;
pub mod mapping;
pub mod residency;
pub mod tiling;

pub use config::StreamConfig;
pub use error::{StreamError, StreamResult};
pub use loader::{BufferPool, TileLoader};
pub use mapping::{MappingEntry, MappingOp, MappingUpdate, RecordingBackend, TileMappingBackend};
pub use residency::bitmap::ResidencyMap;
pub use residency::tile::{TilePriority, TileStage, TrackedTile};
pub use residency::{DecodedSample, ResidencyManager, ResidencyStats};
pub use tiling::{
    PackedMipDesc, ResourceId, SubresourceTiling, TileAddress, TileKey, TiledTextureDesc,
    CUBE_FACE_COUNT, INVALID_SLOT,
};
