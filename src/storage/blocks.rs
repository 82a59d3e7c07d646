//! Block storage shared by all partitions: the codec, the cold directory and a
//! bounded cache of decoded blocks.

use crate::core::{Result, StoreError};
use crate::storage::compression::{BlockCodec, CompressedBlock, CompressionLevel, CompressionStats};
use crate::storage::types::Row;
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cache key: partition key plus the encoding of its body
type BlockKey = (String, CompressionLevel);

/// A columnar block written to the cold directory
#[derive(Debug, Clone)]
pub struct SpilledBlock {
    /// File holding the compressed block
    pub path: PathBuf,
    /// Encoding of the file contents
    pub level: CompressionLevel,
    /// Rows in the block
    pub row_count: usize,
    /// File size in bytes
    pub compressed_size: usize,
}

/// Codec, cold directory and decoded-block cache.
pub struct BlockStore {
    codec: Arc<dyn BlockCodec>,
    cold_dir: PathBuf,
    cache: Mutex<LruCache<BlockKey, Arc<Vec<Row>>>>,
}

impl BlockStore {
    /// Create a block store; the cold directory is created on first spill
    pub fn new(codec: Arc<dyn BlockCodec>, data_dir: &Path, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            codec,
            cold_dir: data_dir.join("cold"),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Encode rows with the configured codec
    pub fn encode(&self, rows: &[Row], level: CompressionLevel) -> Result<CompressedBlock> {
        self.codec.encode(rows, level)
    }

    /// Codec counters
    pub fn stats(&self) -> CompressionStats {
        self.codec.stats()
    }

    /// Decoded rows of an in-memory block
    pub fn rows_of(&self, partition_key: &str, block: &CompressedBlock) -> Result<Arc<Vec<Row>>> {
        self.cached(partition_key, block.level, || {
            self.codec.decode(&block.data, block.level)
        })
    }

    /// Decoded rows of a spilled block, read through a memory map
    pub fn read_spilled(&self, partition_key: &str, block: &SpilledBlock) -> Result<Arc<Vec<Row>>> {
        self.cached(partition_key, block.level, || {
            let file = File::open(&block.path).map_err(|e| {
                StoreError::PartitionUnavailable(format!("{} ({:?}: {})", partition_key, block.path, e))
            })?;
            // The file is written once before the partition points at it and never modified.
            let mmap = unsafe { Mmap::map(&file)? };
            self.codec.decode(&mmap[..], block.level)
        })
    }

    fn cached<F>(&self, partition_key: &str, level: CompressionLevel, load: F) -> Result<Arc<Vec<Row>>>
    where
        F: FnOnce() -> Result<Vec<Row>>,
    {
        let key = (partition_key.to_string(), level);
        if let Some(rows) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(rows));
        }
        let rows = Arc::new(load()?);
        self.cache.lock().put(key, Arc::clone(&rows));
        Ok(rows)
    }

    /// Write a block to the cold directory
    pub fn spill(&self, partition_key: &str, block: &CompressedBlock) -> Result<SpilledBlock> {
        std::fs::create_dir_all(&self.cold_dir)?;
        let path = self.cold_dir.join(format!("{}.block", partition_key));
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &block.data)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(
            "Spilled partition {} to {:?} ({} bytes)",
            partition_key,
            path,
            block.compressed_size
        );

        Ok(SpilledBlock {
            path,
            level: block.level,
            row_count: block.row_count,
            compressed_size: block.compressed_size,
        })
    }

    /// Delete a spilled block's file
    pub fn remove_spilled(&self, block: &SpilledBlock) -> Result<()> {
        match std::fs::remove_file(&block.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every cached decoding of a partition
    pub fn evict(&self, partition_key: &str) {
        let mut cache = self.cache.lock();
        for level in [CompressionLevel::Fast, CompressionLevel::Columnar] {
            cache.pop(&(partition_key.to_string(), level));
        }
    }

    /// Number of decoded blocks currently cached
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().len()
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("cold_dir", &self.cold_dir)
            .field("cached_blocks", &self.cached_blocks())
            .finish()
    }
}
