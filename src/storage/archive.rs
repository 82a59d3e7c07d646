//! Export of expired partitions to long-term archive storage.
//!
//! Each archived partition becomes two files in the sink directory:
//! - `<key>.archive`: LZ4-compressed bincode rows
//! - `<key>.index`: a lightweight JSON sidecar (time bounds, counts and
//!   per-organization row bitmaps) that can be read without the archive

use crate::core::{Result, StoreError};
use crate::storage::types::Row;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Destination for partitions leaving the cold tier.
pub trait ArchiveSink: Send + Sync {
    /// Persist the rows of one partition; the store deletes them afterwards
    fn export(
        &self,
        partition_key: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        rows: &[Row],
    ) -> Result<ArchiveIndex>;
}

/// Lightweight index entry for a single archived partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveIndex {
    /// Partition key (e.g. `20240315T00`)
    pub partition_key: String,

    /// Window start
    pub window_start: DateTime<Utc>,

    /// Window end (exclusive)
    pub window_end: DateTime<Utc>,

    /// Number of rows in the archive
    pub row_count: u64,

    /// Smallest and largest observation id, if any rows
    pub id_range: Option<(u64, u64)>,

    /// Metrics present in the archive
    pub metrics: BTreeSet<String>,

    /// Organization → row positions, serialized `RoaringBitmap`s
    pub organization_rows: BTreeMap<String, Vec<u8>>,

    /// Archive file size in bytes
    pub file_size: u64,

    /// LZ4 compression ratio (compressed/uncompressed)
    pub compression_ratio: f32,
}

impl ArchiveIndex {
    /// Build the index for a set of rows.
    pub fn build(
        partition_key: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        rows: &[Row],
    ) -> Result<Self> {
        let mut metrics = BTreeSet::new();
        let mut bitmaps: AHashMap<&str, RoaringBitmap> = AHashMap::new();
        for (position, row) in rows.iter().enumerate() {
            metrics.insert(row.observation.metric_id.as_str().to_string());
            bitmaps
                .entry(row.observation.organization_id.as_str())
                .or_default()
                .insert(position as u32);
        }

        let mut organization_rows = BTreeMap::new();
        for (organization, bitmap) in bitmaps {
            let mut serialized = Vec::with_capacity(bitmap.serialized_size());
            bitmap.serialize_into(&mut serialized).map_err(|e| {
                StoreError::archive(format!("Failed to serialize organization bitmap: {}", e))
            })?;
            organization_rows.insert(organization.to_string(), serialized);
        }

        let id_range = match (rows.iter().map(|r| r.id.0).min(), rows.iter().map(|r| r.id.0).max()) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        };

        Ok(Self {
            partition_key: partition_key.to_string(),
            window_start,
            window_end,
            row_count: rows.len() as u64,
            id_range,
            metrics,
            organization_rows,
            file_size: 0,
            compression_ratio: 1.0,
        })
    }

    /// Row positions belonging to an organization.
    pub fn organization_positions(&self, organization: &str) -> Result<Vec<u32>> {
        match self.organization_rows.get(organization) {
            Some(data) => {
                let bitmap = RoaringBitmap::deserialize_from(&data[..]).map_err(|e| {
                    StoreError::archive(format!("Failed to deserialize organization bitmap: {}", e))
                })?;
                Ok(bitmap.iter().collect())
            },
            None => Ok(Vec::new()),
        }
    }
}

/// Archive sink writing into a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    archive_dir: PathBuf,
}

impl DirectorySink {
    /// Create the sink, creating its directory if needed.
    pub fn new<P: AsRef<Path>>(archive_dir: P) -> Result<Self> {
        let archive_dir = archive_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&archive_dir).map_err(|e| {
            StoreError::archive(format!(
                "Failed to create archive directory {:?}: {}",
                archive_dir, e
            ))
        })?;
        Ok(Self { archive_dir })
    }

    /// Directory archives are written to
    pub fn path(&self) -> &Path {
        &self.archive_dir
    }

    fn archive_path(&self, partition_key: &str) -> PathBuf {
        self.archive_dir.join(format!("{}.archive", partition_key))
    }

    fn index_path(&self, partition_key: &str) -> PathBuf {
        self.archive_dir.join(format!("{}.index", partition_key))
    }

    /// Load a specific index file.
    pub fn load_index(&self, partition_key: &str) -> Result<ArchiveIndex> {
        let data = std::fs::read(self.index_path(partition_key))
            .map_err(|e| StoreError::archive(format!("Failed to read index file: {}", e)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load all available indices, keyed by partition.
    pub fn load_indices(&self) -> Result<BTreeMap<String, ArchiveIndex>> {
        let mut indices = BTreeMap::new();
        let entries = std::fs::read_dir(&self.archive_dir)
            .map_err(|e| StoreError::archive(format!("Failed to read archive directory: {}", e)))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "index") {
                if let Some(stem) = path.file_stem() {
                    let partition_key = stem.to_string_lossy().to_string();
                    let index = self.load_index(&partition_key)?;
                    indices.insert(partition_key, index);
                }
            }
        }

        tracing::debug!("Loaded {} archive indices", indices.len());
        Ok(indices)
    }

    /// Read back every row of an archived partition.
    pub fn read_rows(&self, partition_key: &str) -> Result<Vec<Row>> {
        let data = std::fs::read(self.archive_path(partition_key))
            .map_err(|e| StoreError::archive(format!("Failed to read archive: {}", e)))?;
        let decompressed = decompress_size_prepended(&data)
            .map_err(|e| StoreError::archive(format!("Failed to decompress archive: {}", e)))?;
        Ok(bincode::deserialize(&decompressed)?)
    }

    /// Totals over every archived partition.
    pub fn stats(&self) -> Result<ArchiveStats> {
        let indices = self.load_indices()?;
        let mut stats = ArchiveStats::default();
        for index in indices.values() {
            stats.total_partitions += 1;
            stats.total_rows += index.row_count;
            stats.total_size_bytes += index.file_size;
        }
        if stats.total_partitions > 0 {
            stats.avg_compression_ratio = indices.values().map(|i| i.compression_ratio).sum::<f32>()
                / indices.len() as f32;
        }
        Ok(stats)
    }
}

/// Write through a temporary file so readers never see a partial archive.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)
        .map_err(|e| StoreError::archive(format!("Failed to write {:?}: {}", tmp, e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::archive(format!("Failed to move {:?} into place: {}", path, e)))
}

impl ArchiveSink for DirectorySink {
    fn export(
        &self,
        partition_key: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        rows: &[Row],
    ) -> Result<ArchiveIndex> {
        let mut index = ArchiveIndex::build(partition_key, window_start, window_end, rows)?;

        let serialized = bincode::serialize(rows)?;
        let compressed = compress_prepend_size(&serialized);
        index.file_size = compressed.len() as u64;
        index.compression_ratio = if serialized.is_empty() {
            1.0
        } else {
            compressed.len() as f32 / serialized.len() as f32
        };

        write_atomic(&self.archive_path(partition_key), &compressed)?;
        write_atomic(&self.index_path(partition_key), &serde_json::to_vec(&index)?)?;

        tracing::info!(
            "Archived partition: {} ({} rows, compression: {:.2}x)",
            partition_key,
            index.row_count,
            1.0 / index.compression_ratio.max(f32::EPSILON)
        );

        Ok(index)
    }
}

/// Archive statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ArchiveStats {
    /// Archived partitions
    pub total_partitions: u64,
    /// Archived rows
    pub total_rows: u64,
    /// Bytes on disk (archives only)
    pub total_size_bytes: u64,
    /// Mean compression ratio
    pub avg_compression_ratio: f32,
}
