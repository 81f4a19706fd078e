//! Binary PGM (P5) images, one byte per cell.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{InputSource, OutputSink};
use crate::grid::{Grid, GridError};

#[derive(Debug)]
pub enum PgmError {
    Io(io::Error),
    /// The header is missing, truncated or not P5.
    Header(String),
    /// The image isn't the size the caller asked for.
    Size {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    Grid(GridError),
}

impl fmt::Display for PgmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgmError::Io(e) => write!(f, "io error: {e}"),
            PgmError::Header(reason) => write!(f, "bad pgm header: {reason}"),
            PgmError::Size { expected, actual } => write!(
                f,
                "image is {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            PgmError::Grid(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PgmError {}

impl From<io::Error> for PgmError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<GridError> for PgmError {
    fn from(e: GridError) -> Self {
        Self::Grid(e)
    }
}

pub fn encode(grid: &Grid) -> Vec<u8> {
    let header = format!("P5\n{} {}\n255\n", grid.width(), grid.height());
    let mut out = Vec::with_capacity(header.len() + grid.cells().len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(grid.cells());
    out
}

/// Reads the next header token, skipping whitespace and `#` comments.
fn token<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8], PgmError> {
    loop {
        match bytes.get(*pos) {
            Some(b) if b.is_ascii_whitespace() => *pos += 1,
            Some(b'#') => {
                while bytes.get(*pos).is_some_and(|&b| b != b'\n') {
                    *pos += 1;
                }
            }
            Some(_) => break,
            None => return Err(PgmError::Header("truncated".into())),
        }
    }
    let start = *pos;
    while bytes.get(*pos).is_some_and(|b| !b.is_ascii_whitespace()) {
        *pos += 1;
    }
    Ok(&bytes[start..*pos])
}

fn number(bytes: &[u8], pos: &mut usize, what: &str) -> Result<usize, PgmError> {
    let raw = token(bytes, pos)?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PgmError::Header(format!("{what} is not a number")))
}

pub fn decode(bytes: &[u8]) -> Result<Grid, PgmError> {
    let mut pos = 0;
    if token(bytes, &mut pos)? != b"P5" {
        return Err(PgmError::Header("not a binary pgm".into()));
    }
    let width = number(bytes, &mut pos, "width")?;
    let height = number(bytes, &mut pos, "height")?;
    let maxval = number(bytes, &mut pos, "maxval")?;
    if maxval != 255 {
        return Err(PgmError::Header(format!("maxval {maxval}, expected 255")));
    }
    let expected = width
        .checked_mul(height)
        .ok_or_else(|| PgmError::Header(format!("{width}x{height} is too large")))?;
    // exactly one whitespace byte separates the header from the raster
    pos += 1;
    let raster = bytes.get(pos..).unwrap_or_default();
    if raster.len() != expected {
        return Err(PgmError::Header(format!(
            "raster has {} bytes, expected {expected}",
            raster.len()
        )));
    }
    Ok(Grid::from_cells(raster.to_vec(), width, height)?)
}

/// Reads `{input}/{name}.pgm` and writes `{output}/{name}.pgm`.
#[derive(Debug, Clone)]
pub struct PgmImages {
    input: PathBuf,
    output: PathBuf,
}

impl PgmImages {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.pgm"))
    }
}

impl InputSource for PgmImages {
    type Error = PgmError;

    fn read_grid(&self, name: &str, width: usize, height: usize) -> Result<Grid, PgmError> {
        let path = Self::path(&self.input, name);
        debug!(path = %path.display(), "reading image");
        let grid = decode(&fs::read(path)?)?;
        if (grid.width(), grid.height()) != (width, height) {
            return Err(PgmError::Size {
                expected: (width, height),
                actual: (grid.width(), grid.height()),
            });
        }
        Ok(grid)
    }
}

impl OutputSink for PgmImages {
    type Error = PgmError;

    fn write_grid(&self, name: &str, grid: &Grid) -> Result<(), PgmError> {
        fs::create_dir_all(&self.output)?;
        let path = Self::path(&self.output, name);
        fs::write(&path, encode(grid))?;
        debug!(path = %path.display(), "wrote image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_raster() {
        let grid = Grid::with_alive(3, 2, &[(0, 0), (2, 1)]).unwrap();
        let bytes = encode(&grid);
        assert!(bytes.starts_with(b"P5\n3 2\n255\n"));
        assert_eq!(&bytes[bytes.len() - 6..], &[255, 0, 0, 0, 0, 255]);
        assert_eq!(decode(&bytes).unwrap(), grid);
    }

    #[test]
    fn comments_in_the_header_are_skipped() {
        let mut bytes = b"P5\n# made by hand\n2 2\n# max\n255\n".to_vec();
        bytes.extend_from_slice(&[0, 255, 255, 0]);
        let grid = decode(&bytes).unwrap();
        assert_eq!(grid.alive_count(), 2);
        assert!(grid.is_alive(1, 0));
    }

    #[test]
    fn rejects_other_formats() {
        assert!(matches!(decode(b"P2\n1 1\n255\n0"), Err(PgmError::Header(_))));
        assert!(matches!(decode(b"P5\n2 2\n15\n\0\0\0\0"), Err(PgmError::Header(_))));
        assert!(matches!(decode(b"P5\n2 2\n255\n\0\0\0"), Err(PgmError::Header(_))));
        assert!(matches!(decode(b"P5\n2"), Err(PgmError::Header(_))));
        let huge = format!("P5\n{} 2\n255\n", usize::MAX);
        assert!(matches!(decode(huge.as_bytes()), Err(PgmError::Header(_))));
    }

    #[test]
    fn grey_pixels_are_not_cells() {
        let mut bytes = b"P5\n2 1\n255\n".to_vec();
        bytes.extend_from_slice(&[0, 128]);
        assert!(matches!(
            decode(&bytes),
            Err(PgmError::Grid(GridError::CellValue { x: 1, y: 0, value: 128 }))
        ));
    }

    #[test]
    fn images_on_disk() {
        let dir = std::env::temp_dir().join(format!("mitosis-pgm-{}", std::process::id()));
        let images = PgmImages::new(dir.join("out"), dir.join("out"));
        let grid = Grid::with_alive(4, 4, &[(1, 2), (2, 2), (3, 2)]).unwrap();

        images.write_grid("4x4", &grid).unwrap();
        assert_eq!(images.read_grid("4x4", 4, 4).unwrap(), grid);
        assert!(matches!(
            images.read_grid("4x4", 8, 8),
            Err(PgmError::Size { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }
}
