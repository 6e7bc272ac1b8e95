use crate::model::Hz;
use crate::units::format_mhz;

use super::grid::Grid;
use super::txn::Snapshot;
use super::EngineError;

/// Free grid values in the range, ascending.
pub fn available(grid: &Grid, snapshot: &Snapshot) -> Vec<Hz> {
    grid.iter().filter(|v| !snapshot.is_occupied(*v)).collect()
}

pub fn select_all(grid: &Grid, snapshot: &Snapshot) -> Vec<Hz> {
    available(grid, snapshot)
}

/// The `n` lowest free values. Never returns a partial selection.
pub fn select_first_n(grid: &Grid, snapshot: &Snapshot, n: usize) -> Result<Vec<Hz>, EngineError> {
    let picked: Vec<Hz> = grid
        .iter()
        .filter(|v| !snapshot.is_occupied(*v))
        .take(n)
        .collect();
    if picked.len() < n {
        return Err(EngineError::InsufficientAvailability {
            available: picked.len(),
            requested: n,
        });
    }
    Ok(picked)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacedMatch {
    /// Every value is `spacing` away from the previous free pick.
    Exact { spacing: Hz },
    /// The fine grid had too few free slots; values were spread over what was free.
    Closest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpacedSelection {
    pub values: Vec<Hz>,
    pub matched: SpacedMatch,
}

impl SpacedSelection {
    pub fn message(&self) -> String {
        match self.matched {
            SpacedMatch::Exact { spacing } => format!(
                "Acquire {} frequencies {} MHz apart.",
                self.values.len(),
                format_mhz(spacing)
            ),
            SpacedMatch::Closest => {
                "Unable to get requested frequencies, returning closest match.".to_string()
            }
        }
    }
}

/// Best-effort `n` values `fine` apart.
///
/// Walks up from the first grid value: a free candidate is taken and the walk
/// advances by `fine`, an occupied one advances by the band spacing. When that
/// yields fewer than `n`, falls back to [`spread`] over every free value.
/// `fine` must be a positive multiple of the band spacing.
pub fn select_spaced(
    grid: &Grid,
    snapshot: &Snapshot,
    n: usize,
    fine: Hz,
) -> Result<SpacedSelection, EngineError> {
    let end = grid.range().end;
    let mut picked = Vec::with_capacity(n);
    let mut next = grid.first();
    while let Some(v) = next {
        if picked.len() == n {
            break;
        }
        let step = if snapshot.is_occupied(v) {
            grid.spacing()
        } else {
            picked.push(v);
            fine
        };
        next = v.checked_add(step).filter(|c| *c <= end);
    }
    if picked.len() == n {
        return Ok(SpacedSelection {
            values: picked,
            matched: SpacedMatch::Exact { spacing: fine },
        });
    }

    let free = available(grid, snapshot);
    if free.len() < n {
        return Err(EngineError::InsufficientAvailability {
            available: free.len(),
            requested: n,
        });
    }
    Ok(SpacedSelection {
        values: spread(&free, n),
        matched: SpacedMatch::Closest,
    })
}

/// `values[0], values[d], values[2d], ...` with `d = len / n`, first `n` taken.
pub fn spread(values: &[Hz], n: usize) -> Vec<Hz> {
    if n == 0 {
        return Vec::new();
    }
    let delta = (values.len() / n).max(1);
    values.iter().copied().step_by(delta).take(n).collect()
}
