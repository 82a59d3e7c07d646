//! Block compression for sealed partitions.
//!
//! Two strategies, matched to the retention tiers:
//! - `Fast`: row-oriented bincode + LZ4, used when sealing and for warm blocks
//! - `Columnar`: per-field columns with a block-local string dictionary and
//!   delta-encoded ids/timestamps, then LZ4; used for cold blocks on disk

use crate::core::{
    ContextMap, ContextValue, MetricId, Observation, ObservationId, OrganizationId, Result,
    StoreError,
};
use crate::storage::types::Row;
use ahash::AHashMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Compression strategy for different storage tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionLevel {
    /// Row-oriented LZ4, for sealed and warm partitions
    Fast,
    /// Columnar layout + LZ4, for cold partitions
    Columnar,
}

impl CompressionLevel {
    /// Get compression ratio estimate
    pub fn estimated_ratio(&self) -> f32 {
        match self {
            Self::Fast => 0.3,      // 3:1 ratio
            Self::Columnar => 0.15, // 6.7:1 ratio
        }
    }
}

/// Encoder/decoder for partition blocks.
///
/// The store only talks to this trait so a failing codec can be swapped in.
pub trait BlockCodec: Send + Sync {
    /// Encode rows at the given level
    fn encode(&self, rows: &[Row], level: CompressionLevel) -> Result<CompressedBlock>;

    /// Decode a block produced by [`BlockCodec::encode`]
    fn decode(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<Row>>;

    /// Counters since creation
    fn stats(&self) -> CompressionStats;
}

/// Compressed partition body
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    /// Compressed data
    pub data: Bytes,
    /// Compression level used
    pub level: CompressionLevel,
    /// Serialized size before LZ4
    pub original_size: usize,
    /// Compressed size
    pub compressed_size: usize,
    /// Number of rows in the block
    pub row_count: usize,
}

impl CompressedBlock {
    /// Get compression ratio
    pub fn compression_ratio(&self) -> f32 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f32 / self.original_size as f32
        }
    }
}

/// String interning pool for columnar blocks
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StringPool {
    /// ID to string mapping
    strings: Vec<String>,
    /// String to ID mapping
    #[serde(skip)]
    lookup: AHashMap<String, u32>,
}

impl StringPool {
    /// Create a new string pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its ID
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.lookup.insert(s.to_string(), id);
        self.strings.push(s.to_string());
        id
    }

    /// Get string by ID
    pub fn get(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    fn resolve(&self, id: u32) -> Result<String> {
        self.get(id)
            .map(str::to_string)
            .ok_or_else(|| StoreError::compression(format!("dangling string id {} in block", id)))
    }

    /// Get the size of the pool
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Check if pool is empty
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ContextCell {
    Text(u32),
    Number(f64),
}

/// Columnar representation of a partition for better compression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnarBlock {
    /// Block-local dictionary
    strings: StringPool,
    /// First id; `id_deltas` are relative to the previous row
    base_id: u64,
    id_deltas: Vec<u64>,
    /// Seconds since the first row's timestamp
    base_secs: i64,
    ts_secs: Vec<i64>,
    ts_nanos: Vec<u32>,
    metric: Vec<u32>,
    organization: Vec<u32>,
    kpi_code: Vec<Option<u32>>,
    value: Vec<f64>,
    unit: Vec<Option<u32>>,
    period_start: Vec<Option<(i64, u32)>>,
    period_end: Vec<Option<(i64, u32)>>,
    process: Vec<Option<u32>>,
    /// Row i owns context entries `context_offsets[i]..context_offsets[i + 1]`
    context_offsets: Vec<u32>,
    context_keys: Vec<u32>,
    context_values: Vec<ContextCell>,
    confidence: Vec<Option<f64>>,
    data_source: Vec<Option<u32>>,
    notes: Vec<Option<String>>,
}

fn split_ts(ts: DateTime<Utc>) -> (i64, u32) {
    (ts.timestamp(), ts.timestamp_subsec_nanos())
}

fn join_ts((secs, nanos): (i64, u32)) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| StoreError::compression(format!("timestamp {}s out of range", secs)))
}

impl ColumnarBlock {
    /// Convert rows to columnar format
    pub fn from_rows(rows: &[Row]) -> Self {
        let n = rows.len();
        let mut strings = StringPool::new();
        let base_id = rows.first().map_or(0, |r| r.id.0);
        let base_secs = rows.first().map_or(0, |r| r.observation.timestamp.timestamp());

        let mut block = Self {
            strings: StringPool::new(),
            base_id,
            id_deltas: Vec::with_capacity(n),
            base_secs,
            ts_secs: Vec::with_capacity(n),
            ts_nanos: Vec::with_capacity(n),
            metric: Vec::with_capacity(n),
            organization: Vec::with_capacity(n),
            kpi_code: Vec::with_capacity(n),
            value: Vec::with_capacity(n),
            unit: Vec::with_capacity(n),
            period_start: Vec::with_capacity(n),
            period_end: Vec::with_capacity(n),
            process: Vec::with_capacity(n),
            context_offsets: Vec::with_capacity(n + 1),
            context_keys: Vec::new(),
            context_values: Vec::new(),
            confidence: Vec::with_capacity(n),
            data_source: Vec::with_capacity(n),
            notes: Vec::with_capacity(n),
        };

        let mut previous_id = base_id;
        block.context_offsets.push(0);
        for row in rows {
            let obs = &row.observation;
            block.id_deltas.push(row.id.0.wrapping_sub(previous_id));
            previous_id = row.id.0;

            let (secs, nanos) = split_ts(obs.timestamp);
            block.ts_secs.push(secs - base_secs);
            block.ts_nanos.push(nanos);

            block.metric.push(strings.intern(obs.metric_id.as_str()));
            block.organization.push(strings.intern(obs.organization_id.as_str()));
            block.kpi_code.push(obs.kpi_code.as_deref().map(|s| strings.intern(s)));
            block.value.push(obs.value);
            block.unit.push(obs.unit.as_deref().map(|s| strings.intern(s)));
            block.period_start.push(obs.observation_period_start.map(split_ts));
            block.period_end.push(obs.observation_period_end.map(split_ts));
            block.process.push(obs.process_id.as_deref().map(|s| strings.intern(s)));

            for (key, value) in &obs.context {
                block.context_keys.push(strings.intern(key));
                block.context_values.push(match value {
                    ContextValue::Text(s) => ContextCell::Text(strings.intern(s)),
                    ContextValue::Number(n) => ContextCell::Number(*n),
                });
            }
            block.context_offsets.push(block.context_keys.len() as u32);

            block.confidence.push(obs.confidence_level);
            block.data_source.push(obs.data_source.as_deref().map(|s| strings.intern(s)));
            block.notes.push(obs.notes.clone());
        }

        block.strings = strings;
        block
    }

    /// Number of rows in the block
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// True when the block holds no rows
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Rebuild the rows
    pub fn into_rows(self) -> Result<Vec<Row>> {
        let pool = &self.strings;
        let opt = |id: Option<u32>| id.map(|i| pool.resolve(i)).transpose();

        let mut rows = Vec::with_capacity(self.len());
        let mut id = self.base_id;
        for i in 0..self.len() {
            id = id.wrapping_add(self.id_deltas[i]);

            let start = self.context_offsets[i] as usize;
            let end = self.context_offsets[i + 1] as usize;
            let mut context = ContextMap::new();
            for j in start..end {
                let value = match &self.context_values[j] {
                    ContextCell::Text(s) => ContextValue::Text(pool.resolve(*s)?),
                    ContextCell::Number(n) => ContextValue::Number(*n),
                };
                context.insert(pool.resolve(self.context_keys[j])?, value);
            }

            let observation = Observation {
                timestamp: join_ts((self.base_secs + self.ts_secs[i], self.ts_nanos[i]))?,
                metric_id: MetricId::new(pool.resolve(self.metric[i])?)?,
                kpi_code: opt(self.kpi_code[i])?,
                value: self.value[i],
                unit: opt(self.unit[i])?,
                observation_period_start: self.period_start[i].map(join_ts).transpose()?,
                observation_period_end: self.period_end[i].map(join_ts).transpose()?,
                organization_id: OrganizationId::new(pool.resolve(self.organization[i])?)?,
                process_id: opt(self.process[i])?,
                context,
                confidence_level: self.confidence[i],
                data_source: opt(self.data_source[i])?,
                notes: self.notes[i].clone(),
            };
            rows.push(Row {
                id: ObservationId(id),
                observation,
            });
        }
        Ok(rows)
    }

    fn rebuild_lookup(&mut self) {
        self.strings.lookup = self
            .strings
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
    }
}

/// Compression performance statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct CompressionStats {
    /// Total bytes compressed
    pub total_input_bytes: u64,
    /// Total compressed output bytes
    pub total_output_bytes: u64,
    /// Total compression time in microseconds
    pub total_compression_time_us: u64,
    /// Number of compression operations
    pub compression_operations: u64,
    /// Number of decompression operations
    pub decompression_operations: u64,
}

impl CompressionStats {
    /// Get overall compression ratio
    pub fn compression_ratio(&self) -> f32 {
        if self.total_input_bytes == 0 {
            1.0
        } else {
            self.total_output_bytes as f32 / self.total_input_bytes as f32
        }
    }
}

/// bincode + LZ4 codec with statistics
#[derive(Debug, Default)]
pub struct CompressionEngine {
    stats: RwLock<CompressionStats>,
}

impl CompressionEngine {
    /// Create a new compression engine
    pub fn new() -> Self {
        Self::default()
    }

    fn update_stats(&self, input_bytes: usize, output_bytes: usize, compression_time_us: u64) {
        let mut stats = self.stats.write();
        stats.total_input_bytes += input_bytes as u64;
        stats.total_output_bytes += output_bytes as u64;
        stats.total_compression_time_us += compression_time_us;
        stats.compression_operations += 1;
    }
}

impl BlockCodec for CompressionEngine {
    fn encode(&self, rows: &[Row], level: CompressionLevel) -> Result<CompressedBlock> {
        let start_time = std::time::Instant::now();

        let serialized = match level {
            CompressionLevel::Fast => bincode::serialize(rows)?,
            CompressionLevel::Columnar => bincode::serialize(&ColumnarBlock::from_rows(rows))?,
        };

        let compressed = compress_prepend_size(&serialized);
        let compressed_len = compressed.len();

        self.update_stats(
            serialized.len(),
            compressed_len,
            start_time.elapsed().as_micros() as u64,
        );

        Ok(CompressedBlock {
            data: Bytes::from(compressed),
            level,
            original_size: serialized.len(),
            compressed_size: compressed_len,
            row_count: rows.len(),
        })
    }

    fn decode(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<Row>> {
        let decompressed = decompress_size_prepended(data)
            .map_err(|e| StoreError::compression(format!("LZ4 decompression failed: {}", e)))?;
        self.stats.write().decompression_operations += 1;

        match level {
            CompressionLevel::Fast => Ok(bincode::deserialize(&decompressed)?),
            CompressionLevel::Columnar => {
                let mut block: ColumnarBlock = bincode::deserialize(&decompressed)?;
                block.rebuild_lookup();
                block.into_rows()
            },
        }
    }

    fn stats(&self) -> CompressionStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn rows() -> Vec<Row> {
        let base = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        (0..50u64)
            .map(|i| Row {
                id: ObservationId((7 << 32) | (i + 1)),
                observation: Observation::builder()
                    .timestamp(base + chrono::Duration::seconds(i as i64 * 61))
                    .metric_id(if i % 2 == 0 { "RL.1.1" } else { "RS.1.1" })
                    .organization_id("42")
                    .kpi_code("POF")
                    .value(90.0 + (i % 10) as f64)
                    .unit("percentage")
                    .context("region", if i % 3 == 0 { "EU" } else { "NA" })
                    .context("line", i as f64)
                    .notes(format!("row {}", i))
                    .build()
                    .unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_compression_levels() {
        assert!(
            CompressionLevel::Columnar.estimated_ratio() < CompressionLevel::Fast.estimated_ratio()
        );
    }

    #[test]
    fn test_string_pool() {
        let mut pool = StringPool::new();

        let id1 = pool.intern("EU");
        let id2 = pool.intern("NA");
        let id3 = pool.intern("EU"); // Should reuse

        assert_eq!(id1, id3);
        assert_ne!(id1, id2);
        assert_eq!(pool.get(id2), Some("NA"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_fast_block_decodes_to_same_rows() {
        let engine = CompressionEngine::new();
        let rows = rows();

        let block = engine.encode(&rows, CompressionLevel::Fast).unwrap();
        assert_eq!(block.row_count, 50);
        assert_eq!(engine.decode(&block.data, block.level).unwrap(), rows);

        let stats = engine.stats();
        assert_eq!(stats.compression_operations, 1);
        assert_eq!(stats.decompression_operations, 1);
    }

    #[test]
    fn test_columnar_block_decodes_to_same_rows() {
        let engine = CompressionEngine::new();
        let rows = rows();

        let columnar = engine.encode(&rows, CompressionLevel::Columnar).unwrap();
        assert_eq!(columnar.level, CompressionLevel::Columnar);
        assert_eq!(engine.decode(&columnar.data, columnar.level).unwrap(), rows);
    }

    #[test]
    fn test_corrupt_block_is_an_error() {
        let engine = CompressionEngine::new();
        assert!(engine.decode(&[1, 2, 3], CompressionLevel::Fast).is_err());
    }
}
