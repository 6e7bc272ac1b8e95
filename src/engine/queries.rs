use ulid::Ulid;

use crate::model::*;

use super::grid::Grid;
use super::policy::available;
use super::txn::Snapshot;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_band(&self, id: &Ulid) -> Option<Band> {
        self.bands.get(id).map(|b| b.value().clone())
    }

    /// All bands ordered by lower bound, then id.
    pub fn list_bands(&self) -> Vec<Band> {
        let mut bands: Vec<Band> = self.bands.iter().map(|b| b.value().clone()).collect();
        bands.sort_by_key(|b| (b.from, b.id));
        bands
    }

    /// Committed occupancy in `range`, outside any write transaction.
    pub(super) async fn read_snapshot(&self, range: ChannelRange) -> Snapshot {
        let ledger = self.ledger.read().await;
        Snapshot::from_records(range, ledger.range(range))
    }

    async fn band_grid(&self, band_id: &Ulid, range: ChannelRange) -> Result<(Grid, Snapshot), EngineError> {
        let (_, grid) = self.checked_grid(band_id, range)?;
        let snapshot = self.read_snapshot(grid.range()).await;
        Ok((grid, snapshot))
    }

    /// Free grid values in `range`. Writes nothing.
    pub async fn available_channels(
        &self,
        band_id: Ulid,
        range: ChannelRange,
    ) -> Result<Vec<Hz>, EngineError> {
        let (grid, snapshot) = self.band_grid(&band_id, range).await?;
        Ok(available(&grid, &snapshot))
    }

    /// Every grid value in `range` with its current status.
    pub async fn channel_table(
        &self,
        band_id: Ulid,
        range: ChannelRange,
    ) -> Result<Vec<ChannelStatus>, EngineError> {
        let (grid, snapshot) = self.band_grid(&band_id, range).await?;
        Ok(grid
            .iter()
            .map(|value| match snapshot.get(value) {
                None => ChannelStatus::Free { value },
                Some(rec) if rec.is_forbidden() => ChannelStatus::Forbidden(rec.clone()),
                Some(rec) => ChannelStatus::Held(rec.clone()),
            })
            .collect())
    }

    /// Occupancy records with `start <= value <= end`, ascending.
    pub async fn occupancy_in_range(&self, range: ChannelRange) -> Result<Vec<OccupancyRecord>, EngineError> {
        if range.start > range.end {
            return Err(EngineError::validation("start", "must be less than or equal to end"));
        }
        let ledger = self.ledger.read().await;
        Ok(ledger.range(range).cloned().collect())
    }

    pub async fn all_occupancy(&self) -> Vec<OccupancyRecord> {
        self.ledger.read().await.all().cloned().collect()
    }

    /// Channels held by `holder`, ascending.
    pub async fn holdings(&self, holder: &str) -> Vec<OccupancyRecord> {
        self.ledger.read().await.held_by(holder).cloned().collect()
    }

    /// Past assignments of `value`, newest first.
    pub async fn history(&self, value: Hz) -> Vec<HistoryRecord> {
        let ledger = self.ledger.read().await;
        ledger
            .history()
            .iter()
            .rev()
            .filter(|h| h.value == value)
            .cloned()
            .collect()
    }

    pub async fn occupied_count(&self) -> usize {
        self.ledger.read().await.occupied_count()
    }
}
