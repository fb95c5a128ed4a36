//! Buffer pool and file-backed tile loader
//!
//! Tile bytes live in a backing file as fixed-size blocks, one per
//! (face, subresource, tile address), with the packed mips of each face
//! stored as one shared block. The loader precomputes the byte offset of
//! the first block of every subresource at construction and performs
//! synchronous random-access reads on a small worker pool; completions
//! are drained by the scheduler over a channel. Buffers are borrowed
//! from a shared fixed-size pool and returned once the byte upload for a
//! tile has completed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{StreamError, StreamResult};
use crate::tiling::{subresource_mip_face, SubresourceTiling, TileAddress, TileKey, TiledTextureDesc};

/// Shared pool of fixed-size tile byte buffers
///
/// The one structure mutated concurrently by in-flight load tasks; all
/// borrow/return traffic goes through the lock.
pub struct BufferPool {
    tile_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(tile_size: usize) -> Self {
        Self {
            tile_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Borrow a buffer, allocating one if the pool is empty.
    ///
    /// Contents are whatever the previous borrower left behind; loads
    /// overwrite the full buffer.
    pub fn acquire(&self) -> Vec<u8> {
        let recycled = self.free.lock().expect("buffer pool poisoned").pop();
        recycled.unwrap_or_else(|| vec![0u8; self.tile_size])
    }

    /// Return a borrowed buffer to the pool.
    pub fn release(&self, buf: Vec<u8>) {
        debug_assert_eq!(buf.len(), self.tile_size);
        self.free.lock().expect("buffer pool poisoned").push(buf);
    }

    /// Buffers currently sitting idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.free.lock().expect("buffer pool poisoned").len()
    }
}

/// Completed load delivered to the scheduler
pub struct LoadedTile {
    pub key: TileKey,
    pub payload: Vec<u8>,
}

struct LoadRequest {
    key: TileKey,
    offset: u64,
    subresource: u32,
}

/// Precomputed block offsets for one resource's backing file
///
/// Layout: per face, every standard subresource's tiles in mip order
/// (row-major within a subresource), then that face's packed block.
#[derive(Debug)]
pub struct FileLayout {
    offsets: Vec<u64>,
    tiling: Vec<SubresourceTiling>,
    mip_count: u32,
    standard_mip_count: u32,
    tile_size: u64,
    total_bytes: u64,
}

impl FileLayout {
    pub fn new(desc: &TiledTextureDesc, tile_size: usize) -> Self {
        let tile_size = tile_size as u64;
        let mut offsets = vec![0u64; (desc.face_count * desc.mip_count) as usize];
        let mut offset = 0u64;
        for face in 0..desc.face_count {
            for mip in 0..desc.packed.standard_mip_count {
                offsets[(face * desc.mip_count + mip) as usize] = offset;
                offset += desc.tiling_for_mip(mip).tile_count() as u64 * tile_size;
            }
            if desc.packed.packed_mip_count > 0 {
                for mip in desc.packed.standard_mip_count..desc.mip_count {
                    offsets[(face * desc.mip_count + mip) as usize] = offset;
                }
                offset += desc.packed.tiles_for_packed_mips as u64 * tile_size;
            }
        }
        Self {
            offsets,
            tiling: desc.tiling.clone(),
            mip_count: desc.mip_count,
            standard_mip_count: desc.packed.standard_mip_count,
            tile_size,
            total_bytes: offset,
        }
    }

    /// Byte offset of one tile block.
    pub fn offset_of(&self, address: TileAddress) -> u64 {
        let (mip, _face) = subresource_mip_face(address.subresource, self.mip_count);
        let base = self.offsets[address.subresource as usize];
        if mip >= self.standard_mip_count {
            // Packed mips share one block per face.
            return base;
        }
        let tiling = self.tiling[mip as usize];
        base + (address.y * tiling.width_in_tiles + address.x) as u64 * self.tile_size
    }

    /// Size the backing file must have.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// File-backed tile loader for one managed resource
///
/// Requests travel request channel -> dispatcher -> per-worker channels;
/// each worker opens the file read-only, seeks to the precomputed
/// offset, and reads exactly one tile into a pool buffer. Completions go
/// to the channel supplied at construction, shared by all loaders, and
/// are drained by the frame-side scheduler.
pub struct TileLoader {
    req_tx: SyncSender<LoadRequest>,
    layout: FileLayout,
    path: PathBuf,
    pool: Arc<BufferPool>,
    _dispatcher: thread::JoinHandle<()>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl TileLoader {
    pub fn new(
        path: &Path,
        desc: &TiledTextureDesc,
        pool: Arc<BufferPool>,
        done_tx: Sender<LoadedTile>,
        worker_count: usize,
        queue_capacity: usize,
        debug_borders: bool,
    ) -> StreamResult<Self> {
        let layout = FileLayout::new(desc, pool.tile_size());

        let metadata = std::fs::metadata(path)?;
        if metadata.len() < layout.total_bytes() {
            return Err(StreamError::loader(format!(
                "{}: {} bytes, tiling layout needs {}",
                path.display(),
                metadata.len(),
                layout.total_bytes()
            )));
        }

        let (req_tx, req_rx) = mpsc::sync_channel::<LoadRequest>(queue_capacity.max(1));

        let mut worker_txs = Vec::new();
        let mut workers = Vec::new();
        for _ in 0..worker_count.max(1) {
            let (wtx, wrx) = mpsc::channel::<LoadRequest>();
            worker_txs.push(wtx);
            let done_tx = done_tx.clone();
            let pool = pool.clone();
            let path = path.to_path_buf();
            let handle = thread::spawn(move || {
                while let Ok(req) = wrx.recv() {
                    let mut payload = pool.acquire();
                    read_tile_block(&path, req.offset, &mut payload);
                    if debug_borders {
                        stamp_debug_border(&mut payload, req.subresource);
                    }
                    let _ = done_tx.send(LoadedTile {
                        key: req.key,
                        payload,
                    });
                }
            });
            workers.push(handle);
        }

        let dispatcher = thread::spawn(move || {
            let mut idx: usize = 0;
            while let Ok(req) = req_rx.recv() {
                let _ = worker_txs[idx % worker_txs.len()].send(req);
                idx = idx.wrapping_add(1);
            }
        });

        Ok(Self {
            req_tx,
            layout,
            path: path.to_path_buf(),
            pool,
            _dispatcher: dispatcher,
            _workers: workers,
        })
    }

    /// Hand one tile to the worker pool.
    ///
    /// The caller enforces the in-flight budget; a full queue therefore
    /// indicates an accounting bug and is surfaced as an error.
    pub fn dispatch(&self, key: TileKey) -> StreamResult<()> {
        let offset = self.layout.offset_of(key.address);
        self.req_tx
            .try_send(LoadRequest {
                key,
                offset,
                subresource: key.address.subresource,
            })
            .map_err(|_| StreamError::loader("load queue rejected request"))
    }

    /// Read one tile block on the calling thread.
    ///
    /// Used for the packed-mip blocks mapped eagerly at registration;
    /// the buffer must be returned via [`Self::complete_loading`].
    pub fn read_tile_blocking(&self, address: TileAddress) -> Vec<u8> {
        let mut payload = self.pool.acquire();
        read_tile_block(&self.path, self.layout.offset_of(address), &mut payload);
        payload
    }

    /// Return a payload buffer to the pool after its upload completed.
    pub fn complete_loading(&self, payload: Vec<u8>) {
        self.pool.release(payload);
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }
}

/// Read exactly one tile block at `offset`.
///
/// A short or failed read would desynchronize every precomputed offset,
/// so it is fatal rather than recoverable.
fn read_tile_block(path: &Path, offset: u64, buf: &mut [u8]) {
    let mut file = File::open(path)
        .unwrap_or_else(|e| panic!("tile file {} unreadable: {}", path.display(), e));
    file.seek(SeekFrom::Start(offset))
        .unwrap_or_else(|e| panic!("seek to {} in {} failed: {}", offset, path.display(), e));
    file.read_exact(buf).unwrap_or_else(|e| {
        panic!(
            "short tile read at offset {} in {}: {}",
            offset,
            path.display(),
            e
        )
    });
}

/// Stamp a subresource-derived marker into the block edges so streamed
/// tiles can be told apart on screen.
fn stamp_debug_border(buf: &mut [u8], subresource: u32) {
    let marker = 0x40u8.wrapping_add((subresource as u8).wrapping_mul(0x10));
    let edge = buf.len().min(64);
    for b in &mut buf[..edge] {
        *b = marker;
    }
    let len = buf.len();
    for b in &mut buf[len - edge..] {
        *b = marker;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::subresource_index;

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(128);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.len(), 128);
        assert_eq!(pool.idle_count(), 0);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 2);

        let _c = pool.acquire();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_layout_offsets_standard_mips() {
        // 4x4 base grid, 2 mips, single face, 1 KiB tiles.
        let desc = TiledTextureDesc::with_computed_tiling(1024, 1024, 2, 1, 256, 256, 2);
        let layout = FileLayout::new(&desc, 1024);

        assert_eq!(layout.offset_of(TileAddress::new(0, 0, 0)), 0);
        assert_eq!(layout.offset_of(TileAddress::new(1, 0, 0)), 1024);
        assert_eq!(layout.offset_of(TileAddress::new(0, 1, 0)), 4 * 1024);
        // Mip 1 starts after the 16 base tiles.
        assert_eq!(layout.offset_of(TileAddress::new(0, 0, 1)), 16 * 1024);
        assert_eq!(layout.total_bytes(), (16 + 4) * 1024);
    }

    #[test]
    fn test_layout_offsets_faces_and_packed() {
        // 2 mips standard, 1 packed; 2 faces.
        let desc = TiledTextureDesc::with_computed_tiling(512, 512, 3, 2, 256, 256, 2);
        let layout = FileLayout::new(&desc, 64);
        let per_face = (4 + 1 + 1) as u64 * 64;

        let face1_base = subresource_index(0, 1, 3);
        assert_eq!(
            layout.offset_of(TileAddress::new(0, 0, face1_base)),
            per_face
        );
        // Packed mip of face 0 sits after its standard tiles.
        let packed0 = subresource_index(2, 0, 3);
        assert_eq!(layout.offset_of(TileAddress::new(0, 0, packed0)), 5 * 64);
        assert_eq!(layout.total_bytes(), 2 * per_face);
    }

    #[test]
    fn test_debug_border_stamp() {
        let mut buf = vec![0u8; 256];
        stamp_debug_border(&mut buf, 1);
        assert_eq!(buf[0], 0x50);
        assert_eq!(buf[255], 0x50);
        assert_eq!(buf[128], 0);
    }

    #[test]
    fn test_loader_rejects_truncated_file() {
        let desc = TiledTextureDesc::with_computed_tiling(512, 512, 1, 1, 256, 256, 1);
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(64).unwrap(); // needs 4 tiles

        let pool = Arc::new(BufferPool::new(1024));
        let (done_tx, _done_rx) = mpsc::channel();
        let result = TileLoader::new(file.path(), &desc, pool, done_tx, 1, 4, false);
        assert!(result.is_err());
    }
}
