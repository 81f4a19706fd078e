use std::{fmt, ops::Range};

use crate::grid::Grid;

/// A half-open row range `[start, end)` computed by one worker for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: usize,
    pub end: usize,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn rows(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
    NoWorkers,
    EmptyGrid,
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::NoWorkers => write!(f, "no workers available"),
            PartitionError::EmptyGrid => write!(f, "grid has no rows"),
        }
    }
}

impl std::error::Error for PartitionError {}

/// Splits `height` rows into contiguous partitions, one per worker.
///
/// Every partition gets `height / n` rows and the last one absorbs the
/// remainder. With more workers than rows each row gets its own worker and
/// the rest sit out the turn, so partitions are never empty.
pub fn partition(
    height: usize,
    num_workers: usize,
) -> Result<Vec<Partition>, PartitionError> {
    if num_workers == 0 {
        return Err(PartitionError::NoWorkers);
    }
    if height == 0 {
        return Err(PartitionError::EmptyGrid);
    }
    let n = num_workers.min(height);
    let base = height / n;
    Ok((0..n)
        .map(|i| Partition {
            start: i * base,
            end: if i == n - 1 { height } else { (i + 1) * base },
        })
        .collect())
}

/// The rows bordering `partition` from above and below, with wrapping.
pub fn halo_for<'g>(partition: &Partition, grid: &'g Grid) -> (&'g [u8], &'g [u8]) {
    (
        grid.row_wrapping(partition.start as isize - 1),
        grid.row_wrapping(partition.end as isize),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{grid::Grid, worker::kernel::step};

    fn assert_covers(parts: &[Partition], height: usize) {
        assert!(!parts.is_empty());
        assert_eq!(parts[0].start, 0);
        assert_eq!(parts.last().unwrap().end, height);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!(parts.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn covers_every_row_exactly_once() {
        for height in 1..=64 {
            for workers in 1..=80 {
                let parts = partition(height, workers).unwrap();
                assert_covers(&parts, height);
                assert_eq!(parts.len(), workers.min(height));
            }
        }
    }

    #[test]
    fn last_partition_absorbs_remainder() {
        let parts = partition(10, 3).unwrap();
        assert_eq!(
            parts,
            vec![
                Partition { start: 0, end: 3 },
                Partition { start: 3, end: 6 },
                Partition { start: 6, end: 10 },
            ]
        );
    }

    #[test]
    fn surplus_workers_sit_out() {
        let parts = partition(2, 5).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.len() == 1));
    }

    #[test]
    fn no_workers_is_an_error() {
        assert_eq!(partition(16, 0), Err(PartitionError::NoWorkers));
        assert_eq!(partition(0, 2), Err(PartitionError::EmptyGrid));
    }

    #[test]
    fn halos_wrap_at_the_edges() {
        let grid = Grid::with_alive(3, 4, &[(0, 0), (1, 3)]).unwrap();
        let first = Partition { start: 0, end: 2 };
        let (above, below) = halo_for(&first, &grid);
        assert_eq!(above, grid.row(3));
        assert_eq!(below, grid.row(2));

        let last = Partition { start: 2, end: 4 };
        let (above, below) = halo_for(&last, &grid);
        assert_eq!(above, grid.row(1));
        assert_eq!(below, grid.row(0));
    }

    #[test]
    fn halo_exchange_matches_unpartitioned_step() {
        // 3x3 grid split into two partitions
        let grid = Grid::with_alive(3, 3, &[(1, 0), (1, 1), (1, 2), (0, 0)]).unwrap();
        let whole = step(
            grid.cells(),
            grid.row_wrapping(-1),
            grid.row_wrapping(3),
            3,
        )
        .unwrap();

        let mut merged = Vec::new();
        for part in partition(3, 2).unwrap() {
            let (above, below) = halo_for(&part, &grid);
            merged.extend(step(grid.rows(part.start, part.end), above, below, 3).unwrap());
        }
        assert_eq!(merged, whole);
    }
}
