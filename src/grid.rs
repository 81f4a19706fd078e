use std::fmt;

use rand::Rng;
use rkyv::{Archive, Deserialize, Serialize};

/// Byte value of a live cell. Matches the PGM encoding used for input and
/// output images.
pub const ALIVE: u8 = 255;
/// Byte value of a dead cell.
pub const DEAD: u8 = 0;

/// The coordinate of a live cell. `x` is the column, `y` the row.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// Width or height is zero.
    ZeroDimension { width: usize, height: usize },
    /// The number of rows doesn't match the declared height.
    RowCount { expected: usize, actual: usize },
    /// A row doesn't match the declared width.
    RowWidth { row: usize, expected: usize, actual: usize },
    /// A cell is neither [`ALIVE`] nor [`DEAD`].
    CellValue { x: usize, y: usize, value: u8 },
    /// `width * height` doesn't fit in memory.
    TooLarge { width: usize, height: usize },
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::ZeroDimension { width, height } => {
                write!(f, "grid dimensions must be non-zero, got {width}x{height}")
            }
            GridError::RowCount { expected, actual } => {
                write!(f, "expected {expected} rows, got {actual}")
            }
            GridError::RowWidth { row, expected, actual } => {
                write!(f, "row {row} has {actual} cells, expected {expected}")
            }
            GridError::CellValue { x, y, value } => {
                write!(f, "cell ({x}, {y}) has value {value}, expected {ALIVE} or {DEAD}")
            }
            GridError::TooLarge { width, height } => {
                write!(f, "a {width}x{height} grid is too large")
            }
        }
    }
}

impl std::error::Error for GridError {}

/// Number of cells in a `width x height` grid.
fn cell_count(width: usize, height: usize) -> Result<usize, GridError> {
    if width == 0 || height == 0 {
        return Err(GridError::ZeroDimension { width, height });
    }
    width
        .checked_mul(height)
        .ok_or(GridError::TooLarge { width, height })
}

/// A toroidal Game of Life grid stored row-major in a single buffer.
///
/// Grids are immutable once built; each turn produces a new grid.
#[derive(Clone, PartialEq, Eq)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl Grid {
    /// Creates an all-dead grid.
    pub fn dead(width: usize, height: usize) -> Result<Self, GridError> {
        let len = cell_count(width, height)?;
        Ok(Self {
            width,
            height,
            cells: vec![DEAD; len],
        })
    }

    /// Builds a grid from rows, checking them against the declared
    /// dimensions.
    pub fn from_rows(
        rows: &[Vec<u8>],
        width: usize,
        height: usize,
    ) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::ZeroDimension { width, height });
        }
        if rows.len() != height {
            return Err(GridError::RowCount {
                expected: height,
                actual: rows.len(),
            });
        }
        // every row must be checked before reserving: the dimensions come
        // off the wire and may not match what was actually sent
        if let Some((y, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
            return Err(GridError::RowWidth {
                row: y,
                expected: width,
                actual: row.len(),
            });
        }
        let mut cells = Vec::with_capacity(cell_count(width, height)?);
        for row in rows {
            cells.extend_from_slice(row);
        }
        Self::from_cells(cells, width, height)
    }

    /// Builds a grid from a row-major cell buffer.
    pub fn from_cells(
        cells: Vec<u8>,
        width: usize,
        height: usize,
    ) -> Result<Self, GridError> {
        if cells.len() != cell_count(width, height)? {
            return Err(GridError::RowCount {
                expected: height,
                actual: cells.len() / width,
            });
        }
        if let Some(i) = cells.iter().position(|&c| c != ALIVE && c != DEAD) {
            return Err(GridError::CellValue {
                x: i % width,
                y: i / width,
                value: cells[i],
            });
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    /// Builds a grid with the given live cells.
    pub fn with_alive(
        width: usize,
        height: usize,
        alive: &[(usize, usize)],
    ) -> Result<Self, GridError> {
        let mut grid = Self::dead(width, height)?;
        for &(x, y) in alive {
            let idx = (y % height) * width + (x % width);
            grid.cells[idx] = ALIVE;
        }
        Ok(grid)
    }

    /// Fills a grid at random, each cell alive with probability `density`.
    pub fn random<R: Rng>(
        width: usize,
        height: usize,
        density: f64,
        rng: &mut R,
    ) -> Result<Self, GridError> {
        let mut grid = Self::dead(width, height)?;
        let density = density.clamp(0.0, 1.0);
        for cell in grid.cells.iter_mut() {
            if rng.gen_bool(density) {
                *cell = ALIVE;
            }
        }
        Ok(grid)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Returns row `y`. Panics if `y >= height`.
    pub fn row(&self, y: usize) -> &[u8] {
        &self.cells[y * self.width..(y + 1) * self.width]
    }

    /// Returns row `y` with toroidal wrapping, so `-1` is the last row.
    pub fn row_wrapping(&self, y: isize) -> &[u8] {
        self.row(y.rem_euclid(self.height as isize) as usize)
    }

    /// Returns the contiguous cells of rows `start..end`.
    pub fn rows(&self, start: usize, end: usize) -> &[u8] {
        &self.cells[start * self.width..end * self.width]
    }

    /// Cell at `(x, y)` with toroidal wrapping.
    pub fn get(&self, x: isize, y: isize) -> u8 {
        let x = x.rem_euclid(self.width as isize) as usize;
        self.row_wrapping(y)[x]
    }

    pub fn is_alive(&self, x: isize, y: isize) -> bool {
        self.get(x, y) == ALIVE
    }

    pub fn alive_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c == ALIVE).count()
    }

    /// Coordinates of all live cells in row-major order.
    pub fn alive_cells(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == ALIVE)
            .map(|(i, _)| Cell {
                x: (i % self.width) as u32,
                y: (i / self.width) as u32,
            })
            .collect()
    }

    /// Copies the grid out as one `Vec` per row, the shape used on the wire.
    pub fn to_rows(&self) -> Vec<Vec<u8>> {
        self.cells.chunks(self.width).map(<[u8]>::to_vec).collect()
    }

    /// A digest of the dimensions and cells. Two grids with the same digest
    /// are identical for all practical purposes.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.width as u64).to_le_bytes());
        hasher.update(&(self.height as u64).to_le_bytes());
        hasher.update(&self.cells);
        hasher.finalize()
    }
}

impl fmt::Debug for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Grid {}x{}", self.width, self.height)?;
        for row in self.cells.chunks(self.width) {
            for &c in row {
                f.write_str(if c == ALIVE { "#" } else { "." })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_rejects_mismatched_dimensions() {
        let rows = vec![vec![0, 0, 0], vec![0, 0]];
        assert_eq!(
            Grid::from_rows(&rows, 3, 2),
            Err(GridError::RowWidth {
                row: 1,
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(
            Grid::from_rows(&rows, 3, 3),
            Err(GridError::RowCount {
                expected: 3,
                actual: 2
            })
        );
        assert!(matches!(
            Grid::from_rows(&[], 0, 0),
            Err(GridError::ZeroDimension { .. })
        ));
    }

    #[test]
    fn huge_declared_width_is_rejected_before_allocating() {
        let rows = vec![Vec::new(); 200_000];
        assert_eq!(
            Grid::from_rows(&rows, u32::MAX as usize, 200_000),
            Err(GridError::RowWidth {
                row: 0,
                expected: u32::MAX as usize,
                actual: 0
            })
        );
        assert_eq!(
            Grid::from_cells(vec![0; 4], usize::MAX, 2),
            Err(GridError::TooLarge {
                width: usize::MAX,
                height: 2
            })
        );
        assert!(matches!(
            Grid::dead(usize::MAX, usize::MAX),
            Err(GridError::TooLarge { .. })
        ));
    }

    #[test]
    fn from_rows_rejects_foreign_cell_values() {
        let rows = vec![vec![0, 7], vec![255, 0]];
        assert_eq!(
            Grid::from_rows(&rows, 2, 2),
            Err(GridError::CellValue { x: 1, y: 0, value: 7 })
        );
    }

    #[test]
    fn wrapping_access() {
        let grid = Grid::with_alive(4, 3, &[(0, 0), (3, 2)]).unwrap();
        assert!(grid.is_alive(4, 3));
        assert!(grid.is_alive(-1, -1));
        assert!(!grid.is_alive(-1, 0));
        assert_eq!(grid.row_wrapping(-1), grid.row(2));
        assert_eq!(grid.row_wrapping(3), grid.row(0));
    }

    #[test]
    fn alive_cells_are_row_major() {
        let grid = Grid::with_alive(3, 3, &[(2, 0), (0, 1), (1, 0)]).unwrap();
        assert_eq!(
            grid.alive_cells(),
            vec![Cell { x: 1, y: 0 }, Cell { x: 2, y: 0 }, Cell { x: 0, y: 1 }]
        );
        assert_eq!(grid.alive_count(), 3);
    }

    #[test]
    fn digest_tracks_content_and_shape() {
        let a = Grid::dead(4, 2).unwrap();
        let b = Grid::dead(2, 4).unwrap();
        let c = Grid::with_alive(4, 2, &[(1, 1)]).unwrap();
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest(), Grid::dead(4, 2).unwrap().digest());
    }
}
