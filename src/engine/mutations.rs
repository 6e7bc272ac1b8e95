use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::grid::{validate_band, Grid};
use super::policy::{select_all, select_first_n, select_spaced};
use super::{Engine, EngineError, WalCommand};

pub(super) const ACQUIRED_MESSAGE: &str = "Frequencies acquired successfully!";

fn is_email_shaped(contact: &str) -> bool {
    match contact.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !contact.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

pub(super) fn validate_holder_id(id: &str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::validation("holder", "must not be empty"));
    }
    if id.len() > MAX_HOLDER_LEN {
        return Err(EngineError::LimitExceeded("holder id too long"));
    }
    Ok(())
}

pub(super) fn validate_holder(holder: &Holder) -> Result<(), EngineError> {
    validate_holder_id(&holder.id)?;
    if holder.contact.len() > MAX_CONTACT_LEN {
        return Err(EngineError::LimitExceeded("contact too long"));
    }
    if !holder.is_forbidden() && !is_email_shaped(&holder.contact) {
        return Err(EngineError::validation("contact", "must be an e-mail address"));
    }
    let Location { latitude, longitude } = holder.location;
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(EngineError::validation("latitude", "must be between -90 and 90"));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(EngineError::validation("longitude", "must be between -180 and 180"));
    }
    Ok(())
}

fn validate_count(count: usize) -> Result<(), EngineError> {
    if count == 0 {
        return Err(EngineError::validation("count", "must be at least 1"));
    }
    if count > MAX_CHANNELS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many channels requested"));
    }
    Ok(())
}

fn validate_fine_spacing(band: &Band, fine: Hz) -> Result<(), EngineError> {
    if fine <= 0 {
        return Err(EngineError::validation("spacing", "must be greater than 0"));
    }
    if fine % band.spacing != 0 {
        return Err(EngineError::validation(
            "spacing",
            format!("must be a multiple of the band spacing {}", band.spacing),
        ));
    }
    Ok(())
}

fn count_rejection(policy: &'static str, result: &Result<AllocationOutcome, EngineError>) {
    if let Err(EngineError::InsufficientAvailability {
        available,
        requested,
    }) = result
    {
        metrics::counter!(crate::observability::ALLOCATIONS_REJECTED_TOTAL, "policy" => policy)
            .increment(1);
        tracing::debug!(policy, available, requested, "allocation rejected");
    }
}

impl Engine {
    // ── Bands ────────────────────────────────────────────

    pub async fn create_band(
        &self,
        id: Ulid,
        name: String,
        from: Hz,
        to: Hz,
        spacing: Hz,
    ) -> Result<Band, EngineError> {
        validate_band(&name, from, to, spacing)?;
        let _writer = self.ledger.write().await;
        if self.bands.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.bands.len() >= MAX_BANDS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many bands"));
        }
        let band = Band {
            id,
            name,
            from,
            to,
            spacing,
        };
        self.wal_append(Event::BandCreated { band: band.clone() }).await?;
        self.bands.insert(id, band.clone());
        tracing::info!(band_id = %id, name = %band.name, from, to, spacing, "band created");
        Ok(band)
    }

    /// Replace a band's definition. Existing occupancy is left as is.
    pub async fn update_band(
        &self,
        id: Ulid,
        name: String,
        from: Hz,
        to: Hz,
        spacing: Hz,
    ) -> Result<Band, EngineError> {
        validate_band(&name, from, to, spacing)?;
        let _writer = self.ledger.write().await;
        if !self.bands.contains_key(&id) {
            return Err(EngineError::BandNotFound(id));
        }
        let band = Band {
            id,
            name,
            from,
            to,
            spacing,
        };
        self.wal_append(Event::BandUpdated { band: band.clone() }).await?;
        self.bands.insert(id, band.clone());
        tracing::info!(band_id = %id, "band updated");
        Ok(band)
    }

    pub async fn delete_band(&self, id: Ulid) -> Result<(), EngineError> {
        let _writer = self.ledger.write().await;
        if !self.bands.contains_key(&id) {
            return Err(EngineError::BandNotFound(id));
        }
        self.wal_append(Event::BandDeleted { id }).await?;
        self.bands.remove(&id);
        tracing::info!(band_id = %id, "band deleted");
        Ok(())
    }

    // ── Allocation ───────────────────────────────────────

    /// Run one allocation request for `holder`.
    ///
    /// `AllocateAll` and `AllocateFirstN` commit before returning.
    /// `AllocateSpacedN` only previews: its values come back
    /// `PendingConfirmation` and must be passed to [`Engine::confirm`].
    pub async fn allocate(
        &self,
        request: AllocationRequest,
        holder: &Holder,
    ) -> Result<AllocationOutcome, EngineError> {
        validate_holder(holder)?;
        if holder.is_forbidden() {
            return Err(EngineError::validation("holder", "reserved for debarred ranges"));
        }
        let policy = request.policy_name();
        let result = self.allocate_for(request, holder).await;
        count_rejection(policy, &result);
        result
    }

    /// Choose-in-range preview on its own; needs no holder and writes nothing.
    pub async fn preview_spaced(
        &self,
        band_id: Ulid,
        range: ChannelRange,
        count: usize,
        fine_spacing: Hz,
    ) -> Result<AllocationOutcome, EngineError> {
        let result = match self.checked_grid(&band_id, range) {
            Ok((band, grid)) => self.spaced_preview(&band, &grid, count, fine_spacing).await,
            Err(e) => Err(e),
        };
        count_rejection("spaced_n", &result);
        result
    }

    pub(super) fn checked_grid(&self, band_id: &Ulid, range: ChannelRange) -> Result<(Band, Grid), EngineError> {
        let band = self.require_band(band_id)?;
        let grid = Grid::new(&band, range)?;
        grid.check_scan_limit()?;
        Ok((band, grid))
    }

    async fn allocate_for(
        &self,
        request: AllocationRequest,
        holder: &Holder,
    ) -> Result<AllocationOutcome, EngineError> {
        let (band, grid) = self.checked_grid(&request.band_id(), request.range())?;

        match request {
            AllocationRequest::AllocateAll { .. } => {
                let mut txn = self.begin().await;
                let values = select_all(&grid, &txn.snapshot(grid.range()));
                txn.occupy(&values, holder)?;
                txn.commit().await?;
                tracing::debug!(band_id = %band.id, holder = %holder.id, count = values.len(), "range allocated");
                Ok(AllocationOutcome {
                    message: format!("Allocated {} frequencies.", values.len()),
                    values,
                    status: AllocationStatus::Committed,
                })
            }
            AllocationRequest::AllocateFirstN { count, .. } => {
                validate_count(count)?;
                let mut txn = self.begin().await;
                let values = select_first_n(&grid, &txn.snapshot(grid.range()), count)?;
                txn.occupy(&values, holder)?;
                txn.commit().await?;
                tracing::debug!(band_id = %band.id, holder = %holder.id, ?values, "first-n allocated");
                Ok(AllocationOutcome {
                    values,
                    message: ACQUIRED_MESSAGE.to_string(),
                    status: AllocationStatus::Committed,
                })
            }
            AllocationRequest::AllocateSpacedN {
                count,
                fine_spacing,
                ..
            } => self.spaced_preview(&band, &grid, count, fine_spacing).await,
        }
    }

    async fn spaced_preview(
        &self,
        band: &Band,
        grid: &Grid,
        count: usize,
        fine_spacing: Hz,
    ) -> Result<AllocationOutcome, EngineError> {
        validate_count(count)?;
        validate_fine_spacing(band, fine_spacing)?;
        let snapshot = self.read_snapshot(grid.range()).await;
        let selection = select_spaced(grid, &snapshot, count, fine_spacing)?;
        tracing::debug!(
            band_id = %band.id,
            values = ?selection.values,
            matched = ?selection.matched,
            "spaced selection previewed"
        );
        Ok(AllocationOutcome {
            message: selection.message(),
            values: selection.values,
            status: AllocationStatus::PendingConfirmation,
        })
    }

    /// Commit previously previewed values for `holder`, all or nothing.
    ///
    /// Values taken since the preview fail the whole call with `WriteConflict`.
    pub async fn confirm(
        &self,
        values: &[Hz],
        holder: &Holder,
    ) -> Result<AllocationOutcome, EngineError> {
        validate_holder(holder)?;
        if holder.is_forbidden() {
            return Err(EngineError::validation("holder", "reserved for debarred ranges"));
        }
        if values.is_empty() {
            return Err(EngineError::validation("values", "must not be empty"));
        }
        if values.len() > MAX_CHANNELS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many channels requested"));
        }
        let mut seen = HashSet::with_capacity(values.len());
        for value in values {
            if !seen.insert(*value) {
                return Err(EngineError::validation("values", format!("{value} listed twice")));
            }
            if !self.bands.iter().any(|b| b.is_aligned(*value)) {
                return Err(EngineError::validation(
                    "values",
                    format!("{value} is not a channel of any band"),
                ));
            }
        }
        let mut sorted = values.to_vec();
        sorted.sort_unstable();

        let mut txn = self.begin().await;
        txn.occupy(&sorted, holder)?;
        txn.commit().await?;
        tracing::debug!(holder = %holder.id, values = ?sorted, "selection confirmed");
        Ok(AllocationOutcome {
            values: sorted,
            message: ACQUIRED_MESSAGE.to_string(),
            status: AllocationStatus::Committed,
        })
    }

    // ── Deallocation ─────────────────────────────────────

    /// Release `holder`'s channels in `range`. Returns how many were released;
    /// zero is not an error.
    pub async fn deallocate_range(
        &self,
        band_id: Ulid,
        range: ChannelRange,
        holder: &str,
    ) -> Result<usize, EngineError> {
        validate_holder_id(holder)?;
        let band = self.require_band(&band_id)?;
        Grid::new(&band, range)?;

        let mut txn = self.begin().await;
        let released = txn.delete_matching(range, holder);
        txn.commit().await?;
        tracing::debug!(band_id = %band_id, holder, released, "range deallocated");
        Ok(released)
    }

    /// Block every free channel in `range`.
    pub async fn debar_range(
        &self,
        band_id: Ulid,
        range: ChannelRange,
    ) -> Result<AllocationOutcome, EngineError> {
        let request = AllocationRequest::AllocateAll { band_id, range };
        let outcome = self.allocate_for(request, &Holder::forbidden()).await?;
        tracing::info!(band_id = %band_id, blocked = outcome.values.len(), "range debarred");
        Ok(outcome)
    }

    /// Lift debarment in `range`. Returns how many channels were freed.
    pub async fn allow_range(&self, band_id: Ulid, range: ChannelRange) -> Result<usize, EngineError> {
        let freed = self.deallocate_range(band_id, range, FORBIDDEN_HOLDER).await?;
        tracing::info!(band_id = %band_id, freed, "range allowed");
        Ok(freed)
    }

    /// Free one channel whoever holds it.
    pub async fn release_channel(&self, value: Hz) -> Result<(), EngineError> {
        let mut txn = self.begin().await;
        if !txn.delete_value(value) {
            return Err(EngineError::ChannelNotFound(value));
        }
        txn.commit().await
    }

    /// Free every channel held by `holder`. Returns the count.
    pub async fn release_holder(&self, holder: &str) -> Result<usize, EngineError> {
        validate_holder_id(holder)?;
        let mut txn = self.begin().await;
        let released = txn.delete_holder(holder);
        txn.commit().await?;
        tracing::debug!(holder, released, "holder released");
        Ok(released)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// History is carried over in full.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Writers take the write lock, so holding the read lock freezes state.
        let ledger = self.ledger.read().await;
        let mut bands: Vec<Band> = self.bands.iter().map(|b| b.value().clone()).collect();
        bands.sort_by_key(|b| b.id);

        let mut events: Vec<Event> = bands
            .into_iter()
            .map(|band| Event::BandCreated { band })
            .collect();
        let delta = LedgerDelta {
            released: vec![],
            occupied: ledger.all().cloned().collect(),
            history: ledger.history().to_vec(),
        };
        if !delta.is_empty() {
            events.push(Event::LedgerCommitted { delta });
        }
        let count = events.len();

        self.wal_request(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(ledger);
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_request(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape() {
        assert!(is_email_shaped("op@example.org"));
        assert!(is_email_shaped("a.b+c@mail.example.co"));
        assert!(!is_email_shaped("op"));
        assert!(!is_email_shaped("@example.org"));
        assert!(!is_email_shaped("op@"));
        assert!(!is_email_shaped("op@localhost"));
        assert!(!is_email_shaped("op@@example.org"));
        assert!(!is_email_shaped("o p@example.org"));
        assert!(!is_email_shaped("op@example."));
    }

    #[test]
    fn holder_validation() {
        let ok = Holder::new("user_1", "op@example.org", Location::new(12.97, 77.59));
        assert!(validate_holder(&ok).is_ok());
        assert!(validate_holder(&Holder::forbidden()).is_ok());

        let field = |h: Holder| match validate_holder(&h) {
            Err(EngineError::Validation { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        };
        assert_eq!(field(Holder::new(" ", "op@example.org", Location::default())), "holder");
        assert_eq!(field(Holder::new("u", "nope", Location::default())), "contact");
        assert_eq!(field(Holder::new("u", "op@example.org", Location::new(90.5, 0.0))), "latitude");
        assert_eq!(
            field(Holder::new("u", "op@example.org", Location::new(0.0, f64::NAN))),
            "longitude"
        );
        assert!(matches!(
            validate_holder(&Holder::new("u".repeat(MAX_HOLDER_LEN + 1), "op@example.org", Location::default())),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn count_bounds() {
        assert!(validate_count(1).is_ok());
        assert!(matches!(validate_count(0), Err(EngineError::Validation { field: "count", .. })));
        assert!(matches!(
            validate_count(MAX_CHANNELS_PER_REQUEST + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn fine_spacing_must_ride_band_grid() {
        let band = Band {
            id: Ulid::new(),
            name: "2m".into(),
            from: 144_000_000,
            to: 146_000_000,
            spacing: 12_500,
        };
        assert!(validate_fine_spacing(&band, 25_000).is_ok());
        assert!(validate_fine_spacing(&band, 12_500).is_ok());
        assert!(validate_fine_spacing(&band, 20_000).is_err());
        assert!(validate_fine_spacing(&band, 0).is_err());
        assert!(validate_fine_spacing(&band, -25_000).is_err());
    }
}
