use std::collections::{BTreeMap, HashSet};

use crate::model::*;

/// Committed occupancy and history for one tenant.
///
/// `occupancy` is keyed by channel value, so a value can never be held twice.
/// `history` only ever grows.
#[derive(Debug, Default)]
pub struct Ledger {
    occupancy: BTreeMap<Hz, OccupancyRecord>,
    history: Vec<HistoryRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupancy.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn get(&self, value: Hz) -> Option<&OccupancyRecord> {
        self.occupancy.get(&value)
    }

    pub fn is_occupied(&self, value: Hz) -> bool {
        self.occupancy.contains_key(&value)
    }

    /// Occupied records with `start <= value <= end`, ascending.
    pub fn range(&self, range: ChannelRange) -> impl Iterator<Item = &OccupancyRecord> {
        // BTreeMap::range panics on inverted bounds; the filter empties that case.
        self.occupancy
            .range(range.start..=range.end.max(range.start))
            .map(|(_, r)| r)
            .filter(move |r| range.contains(r.value))
    }

    pub fn all(&self) -> impl Iterator<Item = &OccupancyRecord> {
        self.occupancy.values()
    }

    pub fn held_by<'a>(&'a self, holder: &'a str) -> impl Iterator<Item = &'a OccupancyRecord> + 'a {
        self.occupancy.values().filter(move |r| r.holder == holder)
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// First value in `delta.occupied` that would violate uniqueness once
    /// `delta.released` is applied: already held, or listed twice.
    pub fn first_conflict(&self, delta: &LedgerDelta) -> Option<Hz> {
        let released: HashSet<Hz> = delta.released.iter().copied().collect();
        let mut seen = HashSet::with_capacity(delta.occupied.len());
        for rec in &delta.occupied {
            let held = self.is_occupied(rec.value) && !released.contains(&rec.value);
            if held || !seen.insert(rec.value) {
                return Some(rec.value);
            }
        }
        None
    }

    /// Apply a committed delta. Callers check `first_conflict` first.
    pub fn apply(&mut self, delta: &LedgerDelta) {
        for value in &delta.released {
            self.occupancy.remove(value);
        }
        for rec in &delta.occupied {
            self.occupancy.insert(rec.value, rec.clone());
        }
        self.history.extend(delta.history.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(value: Hz, holder: &str) -> OccupancyRecord {
        Holder::new(holder, "a@b.c", Location::default()).occupancy(value, 0)
    }

    fn delta(occupied: Vec<OccupancyRecord>) -> LedgerDelta {
        LedgerDelta {
            history: occupied.iter().map(HistoryRecord::from).collect(),
            occupied,
            released: vec![],
        }
    }

    #[test]
    fn apply_and_range() {
        let mut ledger = Ledger::new();
        ledger.apply(&delta(vec![rec(130, "u"), rec(100, "u"), rec(250, "v")]));
        let values: Vec<Hz> = ledger.range(ChannelRange::new(100, 200)).map(|r| r.value).collect();
        assert_eq!(values, vec![100, 130]);
        assert_eq!(ledger.occupied_count(), 3);
        assert_eq!(ledger.history_len(), 3);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let mut ledger = Ledger::new();
        ledger.apply(&delta(vec![rec(100, "u"), rec(200, "u")]));
        assert_eq!(ledger.range(ChannelRange::new(100, 200)).count(), 2);
        assert_eq!(ledger.range(ChannelRange::new(101, 199)).count(), 0);
        assert_eq!(ledger.range(ChannelRange::new(200, 100)).count(), 0);
    }

    #[test]
    fn conflict_with_existing_value() {
        let mut ledger = Ledger::new();
        ledger.apply(&delta(vec![rec(100, "u")]));
        assert_eq!(ledger.first_conflict(&delta(vec![rec(110, "v"), rec(100, "v")])), Some(100));
        assert_eq!(ledger.first_conflict(&delta(vec![rec(110, "v")])), None);
    }

    #[test]
    fn conflict_within_batch() {
        let ledger = Ledger::new();
        assert_eq!(ledger.first_conflict(&delta(vec![rec(110, "v"), rec(110, "w")])), Some(110));
    }

    #[test]
    fn released_value_can_be_reoccupied_in_same_delta() {
        let mut ledger = Ledger::new();
        ledger.apply(&delta(vec![rec(100, "u")]));
        let mut d = delta(vec![rec(100, "v")]);
        d.released.push(100);
        assert_eq!(ledger.first_conflict(&d), None);
        ledger.apply(&d);
        assert_eq!(ledger.get(100).unwrap().holder, "v");
    }

    #[test]
    fn release_keeps_history() {
        let mut ledger = Ledger::new();
        ledger.apply(&delta(vec![rec(100, "u"), rec(110, "u")]));
        ledger.apply(&LedgerDelta {
            released: vec![100, 110],
            ..Default::default()
        });
        assert_eq!(ledger.occupied_count(), 0);
        assert_eq!(ledger.history_len(), 2);
    }

    #[test]
    fn held_by_filters_holder() {
        let mut ledger = Ledger::new();
        ledger.apply(&delta(vec![rec(100, "u"), rec(110, "v"), rec(120, "u")]));
        let mine: Vec<Hz> = ledger.held_by("u").map(|r| r.value).collect();
        assert_eq!(mine, vec![100, 120]);
    }
}
