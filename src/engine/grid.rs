use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Band invariants: `0 <= from < to`, `0 < spacing < to - from`.
pub(crate) fn validate_band(name: &str, from: Hz, to: Hz, spacing: Hz) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("band name too long"));
    }
    if from < 0 {
        return Err(EngineError::validation("from", "must be greater than or equal to 0"));
    }
    if to <= 0 {
        return Err(EngineError::validation("to", "must be greater than 0"));
    }
    if to > MAX_FREQUENCY_HZ {
        return Err(EngineError::LimitExceeded("frequency too high"));
    }
    if spacing <= 0 {
        return Err(EngineError::validation("spacing", "must be greater than 0"));
    }
    if from >= to {
        return Err(EngineError::validation("from", "must be less than to"));
    }
    if spacing >= to - from {
        return Err(EngineError::validation("spacing", "must be less than (to - from)"));
    }
    Ok(())
}

/// Smallest grid point `>= start`. Requires `start >= from`.
pub fn first_aligned(from: Hz, spacing: Hz, start: Hz) -> Hz {
    let offset = start - from;
    from + (offset + spacing - 1) / spacing * spacing
}

/// Grid-aligned channel values of a band restricted to `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    from: Hz,
    spacing: Hz,
    range: ChannelRange,
}

impl Grid {
    /// Fails if `start > end` or either bound lies outside the band.
    pub fn new(band: &Band, range: ChannelRange) -> Result<Self, EngineError> {
        if range.start > range.end {
            return Err(EngineError::validation("start", "must be less than or equal to end"));
        }
        for (field, value) in [("start", range.start), ("end", range.end)] {
            if value < band.from || value > band.to {
                return Err(EngineError::validation(
                    field,
                    format!("{value} outside band [{}, {}]", band.from, band.to),
                ));
            }
        }
        Ok(Self {
            from: band.from,
            spacing: band.spacing,
            range,
        })
    }

    pub fn spacing(&self) -> Hz {
        self.spacing
    }

    pub fn range(&self) -> ChannelRange {
        self.range
    }

    pub fn first(&self) -> Option<Hz> {
        let first = first_aligned(self.from, self.spacing, self.range.start);
        (first <= self.range.end).then_some(first)
    }

    pub fn len(&self) -> u64 {
        match self.first() {
            Some(first) => ((self.range.end - first) / self.spacing) as u64 + 1,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    /// Ascending channel values, stepping by the band spacing.
    pub fn iter(&self) -> impl Iterator<Item = Hz> + use<> {
        let spacing = self.spacing;
        let end = self.range.end;
        std::iter::successors(self.first(), move |v| Some(v + spacing).filter(|next| *next <= end))
    }

    pub(crate) fn check_scan_limit(&self) -> Result<(), EngineError> {
        if self.len() > MAX_GRID_SCAN {
            return Err(EngineError::LimitExceeded("range covers too many channels"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn band(from: Hz, to: Hz, spacing: Hz) -> Band {
        Band {
            id: Ulid::new(),
            name: "test".into(),
            from,
            to,
            spacing,
        }
    }

    #[test]
    fn full_band_grid() {
        let b = band(100, 200, 10);
        let g = Grid::new(&b, b.full_range()).unwrap();
        let values: Vec<Hz> = g.iter().collect();
        assert_eq!(values, vec![100, 110, 120, 130, 140, 150, 160, 170, 180, 190, 200]);
        assert_eq!(g.len(), 11);
    }

    #[test]
    fn unaligned_start_rounds_up() {
        let b = band(100, 200, 10);
        let g = Grid::new(&b, ChannelRange::new(101, 135)).unwrap();
        assert_eq!(g.iter().collect::<Vec<_>>(), vec![110, 120, 130]);
    }

    #[test]
    fn range_between_grid_points_is_empty() {
        let b = band(100, 200, 10);
        let g = Grid::new(&b, ChannelRange::new(101, 109)).unwrap();
        assert!(g.is_empty());
        assert_eq!(g.len(), 0);
        assert_eq!(g.iter().count(), 0);
    }

    #[test]
    fn single_point_range() {
        let b = band(100, 200, 10);
        let g = Grid::new(&b, ChannelRange::new(150, 150)).unwrap();
        assert_eq!(g.iter().collect::<Vec<_>>(), vec![150]);
    }

    #[test]
    fn inverted_range_rejected() {
        let b = band(100, 200, 10);
        let err = Grid::new(&b, ChannelRange::new(150, 140)).unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "start", .. }));
    }

    #[test]
    fn out_of_band_bounds_rejected() {
        let b = band(100, 200, 10);
        let err = Grid::new(&b, ChannelRange::new(90, 150)).unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "start", .. }));
        let err = Grid::new(&b, ChannelRange::new(150, 210)).unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "end", .. }));
    }

    #[test]
    fn grid_properties_hold_across_parameters() {
        for (from, to, spacing) in [(0, 97, 7), (100, 200, 10), (30_000_000, 88_000_000, 12_500), (5, 6, 1)] {
            let b = band(from, to, spacing);
            let step = ((to - from) / 9).max(1);
            let mut start = from;
            while start <= to {
                let mut end = start;
                while end <= to {
                    let g = Grid::new(&b, ChannelRange::new(start, end)).unwrap();
                    let values: Vec<Hz> = g.iter().collect();
                    assert!(values.windows(2).all(|w| w[0] < w[1]));
                    assert!(values.iter().all(|v| (v - from) % spacing == 0));
                    assert!(values.iter().all(|v| *v >= start && *v <= end));
                    if let Some(first) = values.first() {
                        assert!(*first - spacing < start, "first value must be minimal");
                    }
                    assert_eq!(values.len() as u64, g.len());
                    end += step;
                }
                start += step;
            }
        }
    }

    #[test]
    fn band_validation() {
        assert!(validate_band("VHF", 30_000_000, 300_000_000, 25_000).is_ok());
        let field = |r: Result<(), EngineError>| match r {
            Err(EngineError::Validation { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        };
        assert_eq!(field(validate_band("", 0, 10, 1)), "name");
        assert_eq!(field(validate_band("x", -1, 10, 1)), "from");
        assert_eq!(field(validate_band("x", 0, 0, 1)), "to");
        assert_eq!(field(validate_band("x", 0, 10, 0)), "spacing");
        assert_eq!(field(validate_band("x", 20, 10, 1)), "from");
        assert_eq!(field(validate_band("x", 0, 10, 10)), "spacing");
        assert!(matches!(
            validate_band("x", 0, MAX_FREQUENCY_HZ + 1, 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn scan_limit() {
        let b = band(0, MAX_FREQUENCY_HZ, 1);
        let g = Grid::new(&b, b.full_range()).unwrap();
        assert!(matches!(g.check_scan_limit(), Err(EngineError::LimitExceeded(_))));
        let g = Grid::new(&b, ChannelRange::new(0, 999)).unwrap();
        assert!(g.check_scan_limit().is_ok());
    }
}
