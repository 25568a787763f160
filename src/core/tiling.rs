use crate::config::TileSpec;
use crate::types::{InsarError, InsarResult, RasterExtent, Window};

/// Rectangular partition of the raster extent processed as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    /// Position in the row-major tile sequence
    pub index: usize,
    pub grid_row: usize,
    pub grid_col: usize,
    pub window: Window,
}

impl Tile {
    /// Reproducible tile name used for intermediate products and reports
    pub fn name(&self) -> String {
        format!(
            "tile_{:04}_r{:05}_c{:05}",
            self.index, self.window.row_off, self.window.col_off
        )
    }
}

/// Splits the raster extent into tiles
#[derive(Debug, Clone)]
pub struct TileScheduler {
    extent: RasterExtent,
    row_bounds: Vec<usize>,
    col_bounds: Vec<usize>,
    tiles: Vec<Tile>,
    workers: usize,
}

/// Split `len` into `count` chunks of `len / count`, the last absorbing the remainder
fn split_axis(len: usize, count: usize) -> Vec<usize> {
    let step = len / count;
    let mut bounds: Vec<usize> = (0..count).map(|i| i * step).collect();
    bounds.push(len);
    bounds
}

/// Bounds at multiples of `size`; a short final chunk is merged into its predecessor
fn step_axis(len: usize, size: usize) -> Vec<usize> {
    let count = (len / size).max(1);
    let mut bounds: Vec<usize> = (0..count).map(|i| i * size).collect();
    bounds.push(len);
    bounds
}

impl TileScheduler {
    /// Create a tile layout for `extent`.
    ///
    /// When the extent is not evenly divisible the last tile of each row and
    /// column grows to absorb the remainder; tiles are never padded.
    pub fn new(extent: RasterExtent, spec: TileSpec, workers: usize) -> InsarResult<Self> {
        if extent.rows == 0 || extent.cols == 0 {
            return Err(InsarError::InvalidInput(format!(
                "Cannot tile an empty extent {}x{}",
                extent.rows, extent.cols
            )));
        }

        let (row_bounds, col_bounds) = match spec {
            TileSpec::Size { rows, cols } => {
                if rows == 0 || cols == 0 {
                    return Err(InsarError::InvalidConfig(
                        "Tile size must be non-zero".to_string(),
                    ));
                }
                (step_axis(extent.rows, rows), step_axis(extent.cols, cols))
            }
            TileSpec::Count { rows, cols } => {
                if rows == 0 || cols == 0 || rows > extent.rows || cols > extent.cols {
                    return Err(InsarError::InvalidConfig(format!(
                        "Cannot split {}x{} extent into {}x{} tiles",
                        extent.rows, extent.cols, rows, cols
                    )));
                }
                (split_axis(extent.rows, rows), split_axis(extent.cols, cols))
            }
        };
        let (n_rows, n_cols) = (row_bounds.len() - 1, col_bounds.len() - 1);

        let mut tiles = Vec::with_capacity(n_rows * n_cols);
        for grid_row in 0..n_rows {
            for grid_col in 0..n_cols {
                let (r0, r1) = (row_bounds[grid_row], row_bounds[grid_row + 1]);
                let (c0, c1) = (col_bounds[grid_col], col_bounds[grid_col + 1]);
                tiles.push(Tile {
                    index: tiles.len(),
                    grid_row,
                    grid_col,
                    window: Window::new(r0, c0, r1 - r0, c1 - c0),
                });
            }
        }

        let workers = if workers == 0 {
            rayon::current_num_threads()
        } else {
            workers
        };

        log::info!(
            "Tiled {}x{} extent into {}x{} tiles for {} worker(s)",
            extent.rows,
            extent.cols,
            n_rows,
            n_cols,
            workers
        );

        Ok(Self {
            extent,
            row_bounds,
            col_bounds,
            tiles,
            workers,
        })
    }

    pub fn extent(&self) -> &RasterExtent {
        &self.extent
    }

    /// Tiles in row-major order
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Tile grid dimensions (rows, cols)
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.row_bounds.len() - 1, self.col_bounds.len() - 1)
    }

    /// Tile containing an absolute pixel
    pub fn tile_at(&self, row: usize, col: usize) -> Option<&Tile> {
        if row >= self.extent.rows || col >= self.extent.cols {
            return None;
        }
        let grid_row = self.row_bounds.partition_point(|&b| b <= row) - 1;
        let grid_col = self.col_bounds.partition_point(|&b| b <= col) - 1;
        let (_, n_cols) = self.grid_shape();
        self.tiles.get(grid_row * n_cols + grid_col)
    }
}

/// Map `f` over tiles; results come back in tile order whatever the execution order
pub fn map_tiles<T, F>(tiles: &[Tile], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Tile) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        tiles.par_iter().map(f).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        tiles.iter().map(f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_tile_absorbs_remainder() {
        let scheduler =
            TileScheduler::new(RasterExtent::new(250, 100), TileSpec::Size { rows: 100, cols: 100 }, 2)
                .unwrap();
        assert_eq!(scheduler.grid_shape(), (2, 1));
        let tiles = scheduler.tiles();
        assert_eq!(tiles[0].window, Window::new(0, 0, 100, 100));
        assert_eq!(tiles[1].window, Window::new(100, 0, 150, 100));
    }

    #[test]
    fn test_tiles_cover_extent_exactly_once() {
        let extent = RasterExtent::new(37, 23);
        let scheduler = TileScheduler::new(extent, TileSpec::Count { rows: 3, cols: 4 }, 3).unwrap();
        let mut hits = vec![0u32; 37 * 23];
        for tile in scheduler.tiles() {
            for r in tile.window.row_off..tile.window.row_end() {
                for c in tile.window.col_off..tile.window.col_end() {
                    hits[r * 23 + c] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_size_spec_keeps_target_size() {
        // An even split into 3 would give 0,11,22,35; size 10 must keep 10-row tiles
        let scheduler =
            TileScheduler::new(RasterExtent::new(35, 12), TileSpec::Size { rows: 10, cols: 5 }, 1).unwrap();
        assert_eq!(scheduler.grid_shape(), (3, 2));
        let windows: Vec<Window> = scheduler.tiles().iter().map(|t| t.window).collect();
        assert_eq!(windows[0], Window::new(0, 0, 10, 5));
        assert_eq!(windows[1], Window::new(0, 5, 10, 7));
        assert_eq!(windows[2], Window::new(10, 0, 10, 5));
        assert_eq!(windows[5], Window::new(20, 5, 15, 7));

        // Count keeps the even split
        let scheduler =
            TileScheduler::new(RasterExtent::new(35, 12), TileSpec::Count { rows: 3, cols: 1 }, 1).unwrap();
        let rows: Vec<usize> = scheduler.tiles().iter().map(|t| t.window.rows).collect();
        assert_eq!(rows, vec![11, 11, 13]);
    }

    #[test]
    fn test_tile_lookup_and_names() {
        let scheduler =
            TileScheduler::new(RasterExtent::new(10, 10), TileSpec::Size { rows: 4, cols: 4 }, 1).unwrap();
        let tile = scheduler.tile_at(9, 3).unwrap();
        assert_eq!((tile.grid_row, tile.grid_col), (1, 0));
        assert_eq!(tile.name(), "tile_0002_r00004_c00000");
        assert!(scheduler.tile_at(10, 0).is_none());
    }

    #[test]
    fn test_oversized_tile_count_rejected() {
        let result = TileScheduler::new(RasterExtent::new(2, 2), TileSpec::Count { rows: 3, cols: 1 }, 1);
        assert!(matches!(result, Err(InsarError::InvalidConfig(_))));
    }
}
