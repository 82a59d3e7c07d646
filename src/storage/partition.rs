//! A single time-window partition.
//!
//! One type covers every stage of a partition's life: `lifecycle` tracks the
//! write side (open, sealed, compressed) and `tier` tracks where the body lives
//! (hot rows, warm in-memory block, cold spilled block, gone). Row positions
//! are stable for the life of the partition: the row with sequence number `n`
//! is always at position `n - 1` of body followed by corrections, which is what
//! the per-organization bitmaps index.

use crate::core::{Observation, ObservationId, OrganizationId, Result, StoreError};
use crate::storage::blocks::{BlockStore, SpilledBlock};
use crate::storage::compression::{CompressedBlock, CompressionLevel};
use crate::storage::types::{Lifecycle, Row, Tier};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use roaring::RoaringBitmap;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Shared reference to a partition
pub type PartitionHandle = Arc<Partition>;

const SEQ_BITS: u32 = 32;

/// Observation ids carry the window ordinal in the high bits and the
/// in-partition sequence number in the low bits.
pub fn compose_id(ordinal: u32, seq: u32) -> ObservationId {
    ObservationId((u64::from(ordinal) << SEQ_BITS) | u64::from(seq))
}

/// Window ordinal encoded in an id
pub fn ordinal_of(id: ObservationId) -> u32 {
    (id.0 >> SEQ_BITS) as u32
}

fn seq_of(id: ObservationId) -> u32 {
    (id.0 & u64::from(u32::MAX)) as u32
}

/// Stable name of a window, used for files and logs
pub fn partition_key(window_start: DateTime<Utc>) -> String {
    window_start.format("%Y%m%dT%H").to_string()
}

/// Where the partition's rows live
#[derive(Debug)]
pub enum PartitionBody {
    /// Appendable rows
    Raw(Vec<Row>),
    /// In-memory compressed block
    Compressed(CompressedBlock),
    /// Block in the cold directory
    Spilled(SpilledBlock),
    /// Archived or purged
    Dropped,
}

impl PartitionBody {
    fn name(&self) -> &'static str {
        match self {
            PartitionBody::Raw(_) => "raw",
            PartitionBody::Compressed(_) => "compressed",
            PartitionBody::Spilled(_) => "spilled",
            PartitionBody::Dropped => "dropped",
        }
    }
}

#[derive(Debug)]
struct PartitionState {
    lifecycle: Lifecycle,
    tier: Tier,
    body: PartitionBody,
    body_len: usize,
    corrections: Vec<Row>,
    organizations: AHashMap<OrganizationId, RoaringBitmap>,
    last_seq: u32,
}

impl PartitionState {
    fn next_position(&mut self, ordinal: u32, key: &str) -> Result<(ObservationId, u32)> {
        let seq = self
            .last_seq
            .checked_add(1)
            .ok_or_else(|| StoreError::storage(format!("partition {} is full", key)))?;
        self.last_seq = seq;
        Ok((compose_id(ordinal, seq), seq - 1))
    }

    fn index(&mut self, organization: &OrganizationId, position: u32) {
        match self.organizations.get_mut(organization) {
            Some(bitmap) => {
                bitmap.insert(position);
            },
            None => {
                let mut bitmap = RoaringBitmap::new();
                bitmap.insert(position);
                self.organizations.insert(organization.clone(), bitmap);
            },
        }
    }

    fn last_id(&self, ordinal: u32) -> Option<ObservationId> {
        (self.last_seq > 0).then(|| compose_id(ordinal, self.last_seq))
    }
}

/// Result of a partition scan
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOutcome {
    /// Highest id assigned when the scan started; later appends get larger ids
    pub last_id: Option<ObservationId>,
    /// Rows handed to the visitor
    pub visited: usize,
    /// True if the visitor stopped early
    pub stopped: bool,
}

/// A contiguous, epoch-aligned time window of observations
#[derive(Debug)]
pub struct Partition {
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    ordinal: u32,
    key: String,
    state: RwLock<PartitionState>,
}

impl Partition {
    /// Create an open, hot partition
    pub fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>, ordinal: u32) -> Self {
        Self {
            window_start,
            window_end,
            ordinal,
            key: partition_key(window_start),
            state: RwLock::new(PartitionState {
                lifecycle: Lifecycle::Open,
                tier: Tier::Hot,
                body: PartitionBody::Raw(Vec::new()),
                body_len: 0,
                corrections: Vec::new(),
                organizations: AHashMap::new(),
                last_seq: 0,
            }),
        }
    }

    /// Inclusive window start
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Exclusive window end
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }

    /// Window ordinal since the epoch
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Partition key (e.g. `20240315T00`)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.read().lifecycle
    }

    /// Current tier
    pub fn tier(&self) -> Tier {
        self.state.read().tier
    }

    /// Rows in the partition, corrections included
    pub fn row_count(&self) -> usize {
        let state = self.state.read();
        state.body_len + state.corrections.len()
    }

    /// Late rows not yet compacted into the body
    pub fn correction_count(&self) -> usize {
        self.state.read().corrections.len()
    }

    /// Highest id assigned so far
    pub fn last_id(&self) -> Option<ObservationId> {
        self.state.read().last_id(self.ordinal)
    }

    /// Short description of the body encoding
    pub fn body_kind(&self) -> &'static str {
        self.state.read().body.name()
    }

    /// True if `ts` falls inside the window
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.window_start <= ts && ts < self.window_end
    }

    /// Append a row to an open partition
    pub fn append(&self, observation: Observation) -> Result<ObservationId> {
        let mut state = self.state.write();
        if state.lifecycle.is_sealed() {
            return Err(StoreError::PartitionSealed(self.key.clone()));
        }
        self.push_body(&mut state, observation)
    }

    /// Record a late row in the correction segment of a sealed partition
    pub fn append_correction(&self, observation: Observation) -> Result<ObservationId> {
        let mut state = self.state.write();
        self.push_correction(&mut state, observation)
    }

    /// Append to the body while open, to the correction segment once sealed.
    ///
    /// The lifecycle check and the write happen under one lock, so a row is
    /// never lost to a concurrent seal. Returns the id and whether it was late.
    pub fn append_or_correct(&self, observation: Observation) -> Result<(ObservationId, bool)> {
        let mut state = self.state.write();
        if state.lifecycle.is_sealed() {
            self.push_correction(&mut state, observation).map(|id| (id, true))
        } else {
            self.push_body(&mut state, observation).map(|id| (id, false))
        }
    }

    fn push_body(&self, state: &mut PartitionState, observation: Observation) -> Result<ObservationId> {
        if !matches!(state.body, PartitionBody::Raw(_)) {
            return Err(StoreError::storage(format!(
                "open partition {} has a {} body",
                self.key,
                state.body.name()
            )));
        }
        let (id, position) = state.next_position(self.ordinal, &self.key)?;
        state.index(&observation.organization_id, position);
        if let PartitionBody::Raw(rows) = &mut state.body {
            rows.push(Row { id, observation });
        }
        state.body_len += 1;
        Ok(id)
    }

    fn push_correction(&self, state: &mut PartitionState, observation: Observation) -> Result<ObservationId> {
        if !state.tier.is_readable() {
            return Err(StoreError::PartitionUnavailable(self.key.clone()));
        }
        let (id, position) = state.next_position(self.ordinal, &self.key)?;
        state.index(&observation.organization_id, position);
        state.corrections.push(Row { id, observation });
        Ok(id)
    }

    /// Open → Sealed. Returns false if already sealed.
    pub fn seal(&self) -> bool {
        let mut state = self.state.write();
        match state.lifecycle.seal() {
            Some(next) => {
                state.lifecycle = next;
                true
            },
            None => false,
        }
    }

    /// Sealed → Compressed. Returns false when there is nothing to do.
    ///
    /// On failure the partition stays sealed with its raw body.
    pub fn compress(&self, blocks: &BlockStore) -> Result<bool> {
        let state = self.state.upgradable_read();
        let Some(next) = state.lifecycle.compress() else {
            return Ok(false);
        };

        let block = match &state.body {
            PartitionBody::Raw(rows) => Some(blocks.encode(rows, CompressionLevel::Fast)?),
            _ => None,
        };

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        if let Some(block) = block {
            state.body = PartitionBody::Compressed(block);
        }
        state.lifecycle = next;
        Ok(true)
    }

    /// Move one step down the tiers, re-encoding the body as needed.
    ///
    /// `Archived`/`Purged` are handled by [`Partition::drop_data`].
    pub fn demote(&self, target: Tier, blocks: &BlockStore) -> Result<()> {
        let state = self.state.upgradable_read();
        if !state.lifecycle.is_sealed() {
            return Err(StoreError::storage(format!(
                "partition {} is still open",
                self.key
            )));
        }

        match target {
            Tier::Warm => {
                let block = match &state.body {
                    PartitionBody::Raw(rows) => Some(blocks.encode(rows, CompressionLevel::Fast)?),
                    _ => None,
                };
                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                if let Some(block) = block {
                    state.body = PartitionBody::Compressed(block);
                    state.lifecycle = Lifecycle::Compressed;
                }
                state.tier = Tier::Warm;
            },
            Tier::Cold => {
                let rows = self.all_rows(&state, blocks)?;
                let block = blocks.encode(&rows, CompressionLevel::Columnar)?;
                let spilled = blocks.spill(&self.key, &block)?;

                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                state.body_len = rows.len();
                state.body = PartitionBody::Spilled(spilled);
                state.corrections = Vec::new();
                state.lifecycle = Lifecycle::Compressed;
                state.tier = Tier::Cold;
                blocks.evict(&self.key);
            },
            Tier::Hot | Tier::Archived | Tier::Purged => {
                return Err(StoreError::storage(format!(
                    "cannot demote partition {} to {}",
                    self.key, target
                )))
            },
        }
        Ok(())
    }

    /// Every row in id order, for export
    pub fn export_rows(&self, blocks: &BlockStore) -> Result<Vec<Row>> {
        let state = self.state.read();
        self.all_rows(&state, blocks)
    }

    fn all_rows(&self, state: &PartitionState, blocks: &BlockStore) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(state.body_len + state.corrections.len());
        match &state.body {
            PartitionBody::Raw(body) => rows.extend(body.iter().cloned()),
            PartitionBody::Compressed(block) => {
                rows.extend(blocks.rows_of(&self.key, block)?.iter().cloned())
            },
            PartitionBody::Spilled(block) => {
                rows.extend(blocks.read_spilled(&self.key, block)?.iter().cloned())
            },
            PartitionBody::Dropped => {
                return Err(StoreError::PartitionUnavailable(self.key.clone()))
            },
        }
        rows.extend(state.corrections.iter().cloned());
        Ok(rows)
    }

    /// Release all raw data; the partition ends in `tier` (archived or purged).
    pub fn drop_data(&self, tier: Tier, blocks: &BlockStore) -> Result<()> {
        let mut state = self.state.write();
        if let PartitionBody::Spilled(block) = &state.body {
            blocks.remove_spilled(block)?;
        }
        blocks.evict(&self.key);
        state.body = PartitionBody::Dropped;
        state.body_len = 0;
        state.corrections = Vec::new();
        state.organizations.clear();
        state.tier = tier;
        Ok(())
    }

    /// Visit rows in id order, optionally restricted to one organization.
    ///
    /// The partition stays read-locked while the visitor runs.
    pub fn scan<F>(
        &self,
        blocks: &BlockStore,
        organization: Option<&OrganizationId>,
        mut visit: F,
    ) -> Result<ScanOutcome>
    where
        F: FnMut(&Row) -> ControlFlow<()>,
    {
        let state = self.state.read();
        let decoded;
        let body: &[Row] = match &state.body {
            PartitionBody::Raw(rows) => rows,
            PartitionBody::Compressed(block) => {
                decoded = blocks.rows_of(&self.key, block)?;
                decoded.as_slice()
            },
            PartitionBody::Spilled(block) => {
                decoded = blocks.read_spilled(&self.key, block)?;
                decoded.as_slice()
            },
            PartitionBody::Dropped => {
                return Err(StoreError::PartitionUnavailable(self.key.clone()))
            },
        };

        let mut outcome = ScanOutcome {
            last_id: state.last_id(self.ordinal),
            ..ScanOutcome::default()
        };

        let row_at = |position: usize| -> Option<&Row> {
            if position < body.len() {
                body.get(position)
            } else {
                state.corrections.get(position - body.len())
            }
        };

        match organization {
            Some(organization) => {
                let Some(bitmap) = state.organizations.get(organization) else {
                    return Ok(outcome);
                };
                for position in bitmap.iter() {
                    if let Some(row) = row_at(position as usize) {
                        outcome.visited += 1;
                        if visit(row).is_break() {
                            outcome.stopped = true;
                            break;
                        }
                    }
                }
            },
            None => {
                for row in body.iter().chain(state.corrections.iter()) {
                    outcome.visited += 1;
                    if visit(row).is_break() {
                        outcome.stopped = true;
                        break;
                    }
                }
            },
        }

        Ok(outcome)
    }

    /// Point lookup by id
    pub fn find(&self, id: ObservationId, blocks: &BlockStore) -> Result<Option<Observation>> {
        if ordinal_of(id) != self.ordinal || seq_of(id) == 0 {
            return Ok(None);
        }
        let position = (seq_of(id) - 1) as usize;

        let state = self.state.read();
        let found = if position < state.body_len {
            match &state.body {
                PartitionBody::Raw(rows) => rows.get(position).cloned(),
                PartitionBody::Compressed(block) => {
                    blocks.rows_of(&self.key, block)?.get(position).cloned()
                },
                PartitionBody::Spilled(block) => {
                    blocks.read_spilled(&self.key, block)?.get(position).cloned()
                },
                PartitionBody::Dropped => None,
            }
        } else {
            state.corrections.get(position - state.body_len).cloned()
        };

        Ok(found.filter(|row| row.id == id).map(|row| row.observation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::compression::CompressionEngine;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        (start, start + chrono::Duration::days(1))
    }

    fn obs(org: &str, value: f64) -> Observation {
        Observation::builder()
            .timestamp(window().0 + chrono::Duration::hours(10))
            .metric_id("RL.1.1")
            .organization_id(org)
            .value(value)
            .build()
            .unwrap()
    }

    fn blocks(dir: &TempDir) -> BlockStore {
        BlockStore::new(Arc::new(CompressionEngine::new()), dir.path(), 4)
    }

    fn collect(partition: &Partition, blocks: &BlockStore, org: Option<&str>) -> Vec<f64> {
        let org = org.map(|o| OrganizationId::new(o).unwrap());
        let mut values = Vec::new();
        partition
            .scan(blocks, org.as_ref(), |row| {
                values.push(row.observation.value);
                ControlFlow::Continue(())
            })
            .unwrap();
        values
    }

    #[test]
    fn test_ids_are_monotonic_and_carry_ordinal() {
        let (start, end) = window();
        let partition = Partition::new(start, end, 19797);

        let a = partition.append(obs("42", 1.0)).unwrap();
        let b = partition.append(obs("42", 2.0)).unwrap();
        assert!(a < b);
        assert_eq!(ordinal_of(a), 19797);
        assert_eq!(partition.last_id(), Some(b));
        assert_eq!(partition.key(), "20240315T00");
    }

    #[test]
    fn test_sealed_partition_refuses_appends() {
        let (start, end) = window();
        let partition = Partition::new(start, end, 1);
        partition.append(obs("42", 1.0)).unwrap();

        assert!(partition.seal());
        assert!(!partition.seal());
        let err = partition.append(obs("42", 2.0)).unwrap_err();
        assert!(matches!(err, StoreError::PartitionSealed(_)));
        assert_eq!(partition.row_count(), 1);

        let late = partition.append_correction(obs("42", 3.0)).unwrap();
        assert_eq!(partition.correction_count(), 1);
        assert_eq!(partition.last_id(), Some(late));

        let (later, was_late) = partition.append_or_correct(obs("42", 4.0)).unwrap();
        assert!(was_late);
        assert!(later > late);
        assert_eq!(partition.row_count(), 3);
    }

    #[test]
    fn test_organization_bitmap_scan() {
        let dir = TempDir::new().unwrap();
        let blocks = blocks(&dir);
        let (start, end) = window();
        let partition = Partition::new(start, end, 1);

        partition.append(obs("42", 1.0)).unwrap();
        partition.append(obs("7", 2.0)).unwrap();
        partition.append(obs("42", 3.0)).unwrap();
        partition.seal();
        partition.append_correction(obs("42", 4.0)).unwrap();

        assert_eq!(collect(&partition, &blocks, Some("42")), vec![1.0, 3.0, 4.0]);
        assert_eq!(collect(&partition, &blocks, Some("7")), vec![2.0]);
        assert_eq!(collect(&partition, &blocks, None), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rows_survive_every_tier() {
        let dir = TempDir::new().unwrap();
        let blocks = blocks(&dir);
        let (start, end) = window();
        let partition = Partition::new(start, end, 1);

        let first = partition.append(obs("42", 1.0)).unwrap();
        partition.append(obs("7", 2.0)).unwrap();
        partition.seal();
        assert!(partition.compress(&blocks).unwrap());
        assert_eq!(partition.lifecycle(), Lifecycle::Compressed);
        let late = partition.append_correction(obs("42", 5.0)).unwrap();

        partition.demote(Tier::Warm, &blocks).unwrap();
        assert_eq!(collect(&partition, &blocks, Some("42")), vec![1.0, 5.0]);

        partition.demote(Tier::Cold, &blocks).unwrap();
        assert_eq!(partition.tier(), Tier::Cold);
        assert_eq!(partition.correction_count(), 0);
        assert_eq!(partition.body_kind(), "spilled");
        assert_eq!(collect(&partition, &blocks, Some("42")), vec![1.0, 5.0]);
        assert_eq!(partition.find(first, &blocks).unwrap().unwrap().value, 1.0);
        assert_eq!(partition.find(late, &blocks).unwrap().unwrap().value, 5.0);

        partition.drop_data(Tier::Purged, &blocks).unwrap();
        assert_eq!(partition.tier(), Tier::Purged);
        assert!(partition.scan(&blocks, None, |_| ControlFlow::Continue(())).is_err());
        assert!(partition.append_correction(obs("42", 6.0)).is_err());
    }

    #[test]
    fn test_scan_reports_watermark() {
        let dir = TempDir::new().unwrap();
        let blocks = blocks(&dir);
        let (start, end) = window();
        let partition = Partition::new(start, end, 3);
        let id = partition.append(obs("42", 1.0)).unwrap();

        let outcome = partition
            .scan(&blocks, None, |_| ControlFlow::Break(()))
            .unwrap();
        assert_eq!(outcome.last_id, Some(id));
        assert!(outcome.stopped);
        assert_eq!(outcome.visited, 1);
    }
}
