use std::collections::{HashMap, HashSet};

use tokio::sync::RwLockWriteGuard;

use crate::model::*;

use super::grid::now_ms;
use super::store::Ledger;
use super::{Engine, EngineError};

/// Occupied values inside one range, as seen by one transaction.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    occupied: HashMap<Hz, OccupancyRecord>,
}

impl Snapshot {
    pub(crate) fn from_records<'a>(
        range: ChannelRange,
        records: impl Iterator<Item = &'a OccupancyRecord>,
    ) -> Self {
        let occupied = records
            .filter(|r| range.contains(r.value))
            .map(|r| (r.value, r.clone()))
            .collect();
        Self { occupied }
    }

    pub fn is_occupied(&self, value: Hz) -> bool {
        self.occupied.contains_key(&value)
    }

    pub fn get(&self, value: Hz) -> Option<&OccupancyRecord> {
        self.occupied.get(&value)
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }
}

/// Exclusive read/write transaction over the occupancy ledger.
///
/// Holds the ledger write lock until committed or dropped. Writes are staged
/// in a [`LedgerDelta`] and reach the WAL as a single record on `commit`;
/// dropping the transaction discards them.
#[must_use = "a transaction does nothing unless committed"]
pub struct Transaction<'e> {
    engine: &'e Engine,
    ledger: RwLockWriteGuard<'e, Ledger>,
    delta: LedgerDelta,
}

impl<'e> Transaction<'e> {
    pub(super) fn new(engine: &'e Engine, ledger: RwLockWriteGuard<'e, Ledger>) -> Self {
        Self {
            engine,
            ledger,
            delta: LedgerDelta::default(),
        }
    }

    /// Committed state in `range` overlaid with this transaction's staged writes.
    pub fn snapshot(&self, range: ChannelRange) -> Snapshot {
        let released = self.released_set();
        let committed = self
            .ledger
            .range(range)
            .filter(|r| !released.contains(&r.value));
        Snapshot::from_records(range, committed.chain(self.delta.occupied.iter()))
    }

    /// Stage new occupancy records. Fails as a whole, staging nothing, if any
    /// value is already occupied (committed or staged) or repeats in `records`.
    pub fn insert_many(
        &mut self,
        records: Vec<OccupancyRecord>,
        record_history: bool,
    ) -> Result<(), EngineError> {
        let released = self.released_set();
        let staged: HashSet<Hz> = self.delta.occupied.iter().map(|r| r.value).collect();
        let mut seen = HashSet::with_capacity(records.len());
        for rec in &records {
            let committed = self.ledger.is_occupied(rec.value) && !released.contains(&rec.value);
            if committed || staged.contains(&rec.value) || !seen.insert(rec.value) {
                metrics::counter!(crate::observability::WRITE_CONFLICTS_TOTAL).increment(1);
                tracing::warn!(value = rec.value, "write conflict on occupied frequency");
                return Err(EngineError::WriteConflict(rec.value));
            }
        }
        if record_history {
            self.delta.history.extend(records.iter().map(HistoryRecord::from));
        }
        self.delta.occupied.extend(records);
        Ok(())
    }

    /// Stage one record per value for `holder`. The sentinel holder leaves no history.
    pub fn occupy(&mut self, values: &[Hz], holder: &Holder) -> Result<(), EngineError> {
        let now = now_ms();
        let records = values.iter().map(|v| holder.occupancy(*v, now)).collect();
        self.insert_many(records, !holder.is_forbidden())
    }

    /// Stage removal of every record in `range` held by `holder`. Returns the count.
    pub fn delete_matching(&mut self, range: ChannelRange, holder: &str) -> usize {
        let released = self.released_set();
        let values: Vec<Hz> = self
            .ledger
            .range(range)
            .filter(|r| r.holder == holder && !released.contains(&r.value))
            .map(|r| r.value)
            .collect();
        let staged = self.unstage(|r| range.contains(r.value) && r.holder == holder);
        let count = values.len() + staged;
        self.delta.released.extend(values);
        count
    }

    /// Stage removal of every record held by `holder`. Returns the count.
    pub fn delete_holder(&mut self, holder: &str) -> usize {
        let released = self.released_set();
        let values: Vec<Hz> = self
            .ledger
            .held_by(holder)
            .filter(|r| !released.contains(&r.value))
            .map(|r| r.value)
            .collect();
        let staged = self.unstage(|r| r.holder == holder);
        let count = values.len() + staged;
        self.delta.released.extend(values);
        count
    }

    /// Stage removal of one value regardless of holder. False if it was free.
    pub fn delete_value(&mut self, value: Hz) -> bool {
        if self.unstage(|r| r.value == value) > 0 {
            return true;
        }
        if self.ledger.is_occupied(value) && !self.delta.released.contains(&value) {
            self.delta.released.push(value);
            return true;
        }
        false
    }

    /// Persist the staged delta as one WAL record, then apply it.
    pub async fn commit(mut self) -> Result<(), EngineError> {
        if self.delta.is_empty() {
            return Ok(());
        }
        // Last line of defence against double-booking.
        if let Some(value) = self.ledger.first_conflict(&self.delta) {
            metrics::counter!(crate::observability::WRITE_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::WriteConflict(value));
        }
        let delta = std::mem::take(&mut self.delta);
        self.engine
            .wal_append(Event::LedgerCommitted { delta: delta.clone() })
            .await?;
        self.ledger.apply(&delta);
        metrics::counter!(crate::observability::CHANNELS_ALLOCATED_TOTAL)
            .increment(delta.occupied.len() as u64);
        metrics::counter!(crate::observability::CHANNELS_RELEASED_TOTAL)
            .increment(delta.released.len() as u64);
        Ok(())
    }

    fn released_set(&self) -> HashSet<Hz> {
        self.delta.released.iter().copied().collect()
    }

    fn unstage(&mut self, pred: impl Fn(&OccupancyRecord) -> bool) -> usize {
        let before = self.delta.occupied.len();
        self.delta.occupied.retain(|r| !pred(r));
        before - self.delta.occupied.len()
    }
}
