use std::fmt;

use crate::grid::{ALIVE, DEAD};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    ZeroWidth,
    /// The slice is empty or not a whole number of rows.
    RaggedRows { len: usize, width: usize },
    /// A halo row isn't exactly one row wide.
    HaloWidth { len: usize, width: usize },
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::ZeroWidth => write!(f, "width must be non-zero"),
            StepError::RaggedRows { len, width } => {
                write!(f, "{len} cells is not a whole number of {width}-wide rows")
            }
            StepError::HaloWidth { len, width } => {
                write!(f, "halo row has {len} cells, expected {width}")
            }
        }
    }
}

impl std::error::Error for StepError {}

/// Computes the next generation of a horizontal slice of a toroidal grid.
///
/// `rows` holds one or more complete rows. `halo_above` is the row directly
/// above the first row of the slice and `halo_below` the row directly below
/// the last; for a slice covering the whole grid they are the grid's own
/// last and first rows. Columns wrap modulo `width`.
pub fn step(
    rows: &[u8],
    halo_above: &[u8],
    halo_below: &[u8],
    width: usize,
) -> Result<Vec<u8>, StepError> {
    if width == 0 {
        return Err(StepError::ZeroWidth);
    }
    if rows.is_empty() || rows.len() % width != 0 {
        return Err(StepError::RaggedRows {
            len: rows.len(),
            width,
        });
    }
    for halo in [halo_above, halo_below] {
        if halo.len() != width {
            return Err(StepError::HaloWidth {
                len: halo.len(),
                width,
            });
        }
    }

    let height = rows.len() / width;
    // row -1 is the upper halo, row `height` the lower one
    let row = move |r: isize| {
        if r < 0 {
            halo_above
        } else if r as usize >= height {
            halo_below
        } else {
            let r = r as usize;
            &rows[r * width..(r + 1) * width]
        }
    };

    let mut next = Vec::with_capacity(rows.len());
    for y in 0..height as isize {
        let (above, here, below) = (row(y - 1), row(y), row(y + 1));
        for x in 0..width {
            let left = (x + width - 1) % width;
            let right = (x + 1) % width;
            let neighbours = [
                above[left],
                above[x],
                above[right],
                here[left],
                here[right],
                below[left],
                below[x],
                below[right],
            ]
            .iter()
            .filter(|&&c| c == ALIVE)
            .count();

            next.push(match (here[x] == ALIVE, neighbours) {
                (true, 2) | (true, 3) => ALIVE,
                (false, 3) => ALIVE,
                _ => DEAD,
            });
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    /// Steps the whole grid as a single slice.
    fn step_grid(grid: &Grid) -> Grid {
        let h = grid.height() as isize;
        let next = step(
            grid.cells(),
            grid.row_wrapping(-1),
            grid.row_wrapping(h),
            grid.width(),
        )
        .unwrap();
        Grid::from_cells(next, grid.width(), grid.height()).unwrap()
    }

    #[test]
    fn blinker_oscillates() {
        let vertical = Grid::with_alive(5, 5, &[(2, 1), (2, 2), (2, 3)]).unwrap();
        let horizontal = Grid::with_alive(5, 5, &[(1, 2), (2, 2), (3, 2)]).unwrap();
        assert_eq!(step_grid(&vertical), horizontal);
        assert_eq!(step_grid(&horizontal), vertical);
    }

    #[test]
    fn glider_wraps_around_the_torus() {
        let mut grid =
            Grid::with_alive(8, 8, &[(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)])
                .unwrap();
        let start = grid.clone();
        // a glider moves one cell diagonally every four generations, so it
        // returns home after 4 * 8 steps on an 8x8 torus
        for _ in 0..32 {
            grid = step_grid(&grid);
        }
        assert_eq!(grid, start);
    }

    #[test]
    fn block_is_still() {
        let block = Grid::with_alive(4, 4, &[(1, 1), (2, 1), (1, 2), (2, 2)]).unwrap();
        assert_eq!(step_grid(&block), block);
    }

    #[test]
    fn single_row_slice_uses_both_halos() {
        // three alive cells stacked vertically; the middle one is the slice
        let above = [DEAD, ALIVE, DEAD];
        let here = [DEAD, ALIVE, DEAD];
        let below = [DEAD, ALIVE, DEAD];
        assert_eq!(step(&here, &above, &below, 3).unwrap(), vec![ALIVE; 3]);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert_eq!(step(&[], &[], &[], 0), Err(StepError::ZeroWidth));
        assert_eq!(
            step(&[DEAD; 5], &[DEAD; 3], &[DEAD; 3], 3),
            Err(StepError::RaggedRows { len: 5, width: 3 })
        );
        assert_eq!(
            step(&[DEAD; 3], &[DEAD; 2], &[DEAD; 3], 3),
            Err(StepError::HaloWidth { len: 2, width: 3 })
        );
    }
}
