//! Streaming configuration
//!
//! Recognized options for the residency manager: physical pool budget,
//! load concurrency cap, per-frame promotion budget, and the fixed tile
//! block size, plus a few knobs for the loader and the residency
//! visualization.

use crate::error::{StreamError, StreamResult};

/// Configuration for the tile residency manager
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Physical tile pool capacity, shared by all managed resources
    pub pool_size_in_tiles: u32,
    /// Maximum number of simultaneously in-flight tile loads
    pub max_simultaneous_loads: usize,
    /// Per-frame budget of tiles promoted into mapped slots
    pub max_tiles_promoted_per_frame: usize,
    /// Fixed size of one tile block in the backing file and the pool
    pub tile_size_in_bytes: usize,
    /// Worker threads per resource loader
    pub loader_threads: usize,
    /// Stamp a subresource-derived border pattern into loaded blocks
    pub debug_tile_borders: bool,
    /// Edge length of the per-face residency visualization grid
    pub visualization_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pool_size_in_tiles: 512,
            max_simultaneous_loads: 16,
            max_tiles_promoted_per_frame: 100,
            tile_size_in_bytes: 64 * 1024, // 64 KiB standard tile
            loader_threads: 2,
            debug_tile_borders: false,
            visualization_size: 16,
        }
    }
}

impl StreamConfig {
    /// Validate option ranges before the manager is constructed
    pub fn validate(&self) -> StreamResult<()> {
        if self.pool_size_in_tiles == 0 {
            return Err(StreamError::config("pool_size_in_tiles must be nonzero"));
        }
        if self.max_simultaneous_loads == 0 {
            return Err(StreamError::config("max_simultaneous_loads must be nonzero"));
        }
        if self.max_tiles_promoted_per_frame == 0 {
            return Err(StreamError::config(
                "max_tiles_promoted_per_frame must be nonzero",
            ));
        }
        if self.tile_size_in_bytes == 0 {
            return Err(StreamError::config("tile_size_in_bytes must be nonzero"));
        }
        if self.visualization_size == 0 {
            return Err(StreamError::config("visualization_size must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.pool_size_in_tiles, 512);
        assert_eq!(config.max_simultaneous_loads, 16);
        assert_eq!(config.tile_size_in_bytes, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = StreamConfig {
            pool_size_in_tiles: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
