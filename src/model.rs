use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Frequency on the integer grid. Always unscaled (Hz).
pub type Hz = i64;

/// Unix milliseconds.
pub type Ms = i64;

/// Holder id that marks a channel as administratively blocked.
pub const FORBIDDEN_HOLDER: &str = "forbidden";

/// A named interval `[from, to]` with a fixed channel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub id: Ulid,
    pub name: String,
    pub from: Hz,
    pub to: Hz,
    pub spacing: Hz,
}

impl Band {
    /// Number of grid points in the whole band.
    pub fn channel_count(&self) -> u64 {
        ((self.to - self.from) / self.spacing) as u64 + 1
    }

    pub fn is_aligned(&self, value: Hz) -> bool {
        value >= self.from && value <= self.to && (value - self.from) % self.spacing == 0
    }

    pub fn full_range(&self) -> ChannelRange {
        ChannelRange::new(self.from, self.to)
    }
}

/// Inclusive value range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelRange {
    pub start: Hz,
    pub end: Hz,
}

impl ChannelRange {
    pub fn new(start: Hz, end: Hz) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, value: Hz) -> bool {
        self.start <= value && value <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Identity attached to every occupancy record a request creates.
#[derive(Debug, Clone, PartialEq)]
pub struct Holder {
    pub id: String,
    pub contact: String,
    pub location: Location,
}

impl Holder {
    pub fn new(id: impl Into<String>, contact: impl Into<String>, location: Location) -> Self {
        Self {
            id: id.into(),
            contact: contact.into(),
            location,
        }
    }

    /// The administrative sentinel used for debarred ranges.
    pub fn forbidden() -> Self {
        Self::new(FORBIDDEN_HOLDER, FORBIDDEN_HOLDER, Location::default())
    }

    pub fn is_forbidden(&self) -> bool {
        self.id == FORBIDDEN_HOLDER
    }

    pub(crate) fn occupancy(&self, value: Hz, created_at: Ms) -> OccupancyRecord {
        OccupancyRecord {
            value,
            holder: self.id.clone(),
            contact: self.contact.clone(),
            location: self.location,
            created_at,
        }
    }
}

/// One currently-assigned channel. At most one per value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyRecord {
    pub value: Hz,
    pub holder: String,
    pub contact: String,
    pub location: Location,
    pub created_at: Ms,
}

impl OccupancyRecord {
    pub fn is_forbidden(&self) -> bool {
        self.holder == FORBIDDEN_HOLDER
    }
}

/// Append-only audit entry for an assignment event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub value: Hz,
    pub holder: String,
    pub contact: String,
    pub location: Location,
    pub created_at: Ms,
}

impl From<&OccupancyRecord> for HistoryRecord {
    fn from(r: &OccupancyRecord) -> Self {
        Self {
            value: r.value,
            holder: r.holder.clone(),
            contact: r.contact.clone(),
            location: r.location,
            created_at: r.created_at,
        }
    }
}

/// Everything a single ledger transaction changes. Applied in field order:
/// releases first, then new occupancy, then history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LedgerDelta {
    pub released: Vec<Hz>,
    pub occupied: Vec<OccupancyRecord>,
    pub history: Vec<HistoryRecord>,
}

impl LedgerDelta {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.occupied.is_empty() && self.history.is_empty()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BandCreated { band: Band },
    BandUpdated { band: Band },
    BandDeleted { id: Ulid },
    /// One committed transaction against the occupancy ledger.
    LedgerCommitted { delta: LedgerDelta },
}

// ── Allocation requests ──────────────────────────────────────────

/// The three allocation shapes. Each variant carries only the fields its
/// policy reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationRequest {
    /// Every free channel in the range.
    AllocateAll { band_id: Ulid, range: ChannelRange },
    /// The `count` lowest free channels in the range, or nothing.
    AllocateFirstN {
        band_id: Ulid,
        range: ChannelRange,
        count: usize,
    },
    /// `count` channels ideally `fine_spacing` apart. Preview only.
    AllocateSpacedN {
        band_id: Ulid,
        range: ChannelRange,
        count: usize,
        fine_spacing: Hz,
    },
}

impl AllocationRequest {
    pub fn band_id(&self) -> Ulid {
        match self {
            AllocationRequest::AllocateAll { band_id, .. }
            | AllocationRequest::AllocateFirstN { band_id, .. }
            | AllocationRequest::AllocateSpacedN { band_id, .. } => *band_id,
        }
    }

    pub fn range(&self) -> ChannelRange {
        match self {
            AllocationRequest::AllocateAll { range, .. }
            | AllocationRequest::AllocateFirstN { range, .. }
            | AllocationRequest::AllocateSpacedN { range, .. } => *range,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        match self {
            AllocationRequest::AllocateAll { .. } => "all",
            AllocationRequest::AllocateFirstN { .. } => "first_n",
            AllocationRequest::AllocateSpacedN { .. } => "spaced_n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    /// Values are now held by the requester.
    Committed,
    /// Values were selected but nothing was written; the caller must confirm.
    PendingConfirmation,
}

impl AllocationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AllocationStatus::Committed => "committed",
            AllocationStatus::PendingConfirmation => "pending_confirmation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    /// Ascending channel values.
    pub values: Vec<Hz>,
    pub message: String,
    pub status: AllocationStatus,
}

// ── Query result types ───────────────────────────────────────────

/// One row of a band's channel table.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Free { value: Hz },
    Held(OccupancyRecord),
    Forbidden(OccupancyRecord),
}

impl ChannelStatus {
    pub fn value(&self) -> Hz {
        match self {
            ChannelStatus::Free { value } => *value,
            ChannelStatus::Held(r) | ChannelStatus::Forbidden(r) => r.value,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelStatus::Free { .. } => "free",
            ChannelStatus::Held(_) => "held",
            ChannelStatus::Forbidden(_) => "forbidden",
        }
    }

    pub fn record(&self) -> Option<&OccupancyRecord> {
        match self {
            ChannelStatus::Free { .. } => None,
            ChannelStatus::Held(r) | ChannelStatus::Forbidden(r) => Some(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(from: Hz, to: Hz, spacing: Hz) -> Band {
        Band {
            id: Ulid::new(),
            name: "VHF".into(),
            from,
            to,
            spacing,
        }
    }

    #[test]
    fn band_channel_count_includes_both_ends() {
        assert_eq!(band(100, 200, 10).channel_count(), 11);
        // 195 is not on the grid, so the last channel is 190
        assert_eq!(band(100, 195, 10).channel_count(), 10);
    }

    #[test]
    fn band_alignment() {
        let b = band(100, 200, 10);
        assert!(b.is_aligned(100));
        assert!(b.is_aligned(200));
        assert!(!b.is_aligned(105));
        assert!(!b.is_aligned(90));
        assert!(!b.is_aligned(210));
    }

    #[test]
    fn range_is_inclusive() {
        let r = ChannelRange::new(100, 200);
        assert!(r.contains(100));
        assert!(r.contains(200));
        assert!(!r.contains(201));
        assert!(!r.contains(99));
    }

    #[test]
    fn sentinel_holder() {
        let h = Holder::forbidden();
        assert!(h.is_forbidden());
        assert!(h.occupancy(100, 0).is_forbidden());
        let user = Holder::new("user_1", "a@b.c", Location::new(12.9, 77.5));
        assert!(!user.is_forbidden());
    }

    #[test]
    fn request_accessors() {
        let id = Ulid::new();
        let range = ChannelRange::new(100, 200);
        let req = AllocationRequest::AllocateSpacedN {
            band_id: id,
            range,
            count: 3,
            fine_spacing: 20,
        };
        assert_eq!(req.band_id(), id);
        assert_eq!(req.range(), range);
        assert_eq!(req.policy_name(), "spaced_n");
    }

    #[test]
    fn channel_status_helpers() {
        let free = ChannelStatus::Free { value: 140 };
        assert_eq!(free.value(), 140);
        assert_eq!(free.label(), "free");
        assert!(free.record().is_none());

        let rec = Holder::forbidden().occupancy(150, 7);
        let blocked = ChannelStatus::Forbidden(rec.clone());
        assert_eq!(blocked.value(), 150);
        assert_eq!(blocked.label(), "forbidden");
        assert_eq!(blocked.record(), Some(&rec));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let holder = Holder::new("user_1", "a@b.c", Location::new(-33.5, 151.25));
        let rec = holder.occupancy(145_500_000, 1_700_000_000_000);
        let event = Event::LedgerCommitted {
            delta: LedgerDelta {
                released: vec![144_000_000],
                history: vec![HistoryRecord::from(&rec)],
                occupied: vec![rec],
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
