//! Reassembly of per-tile products into full-extent mosaics.

use crate::core::tiling::{Tile, TileScheduler};
use crate::types::{InsarError, InsarResult, Mask, RasterExtent, RasterStack};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};

/// Full-extent multi-band product
#[derive(Debug, Clone)]
pub struct Mosaic {
    extent: RasterExtent,
    band_names: Vec<String>,
    data: RasterStack,
    coverage: Mask,
}

impl Mosaic {
    pub fn extent(&self) -> &RasterExtent {
        &self.extent
    }

    pub fn band_names(&self) -> &[String] {
        &self.band_names
    }

    /// (band, row, col) data; uncovered pixels are NaN
    pub fn data(&self) -> &RasterStack {
        &self.data
    }

    pub fn band(&self, name: &str) -> Option<ArrayView2<'_, f32>> {
        let index = self.band_names.iter().position(|b| b == name)?;
        Some(self.data.index_axis(Axis(0), index))
    }

    /// True where a tile contributed the pixel
    pub fn coverage(&self) -> &Mask {
        &self.coverage
    }

    pub fn is_complete(&self) -> bool {
        self.coverage.iter().all(|&c| c)
    }
}

/// Collects tile outputs and places them at their absolute offsets
#[derive(Debug, Clone)]
pub struct TileMerger {
    extent: RasterExtent,
    band_names: Vec<String>,
    tiles: Vec<Tile>,
    placed: Vec<bool>,
    data: RasterStack,
    coverage: Mask,
}

impl TileMerger {
    pub fn new(scheduler: &TileScheduler, band_names: Vec<String>) -> Self {
        let extent = *scheduler.extent();
        Self {
            data: Array3::from_elem((band_names.len(), extent.rows, extent.cols), f32::NAN),
            coverage: Array2::from_elem((extent.rows, extent.cols), false),
            placed: vec![false; scheduler.tiles().len()],
            tiles: scheduler.tiles().to_vec(),
            band_names,
            extent,
        }
    }

    /// Copy one tile's (band, row, col) output into place
    pub fn place(&mut self, tile: &Tile, bands: &RasterStack) -> InsarResult<()> {
        let window = tile.window;
        let expected = (self.band_names.len(), window.rows, window.cols);
        if bands.dim() != expected {
            return Err(InsarError::Processing(format!(
                "{} output is {:?}, expected {:?}",
                tile.name(),
                bands.dim(),
                expected
            )));
        }
        if !window.fits_in(&self.extent) {
            return Err(InsarError::Processing(format!(
                "{} lies outside the {}x{} mosaic",
                tile.name(),
                self.extent.rows,
                self.extent.cols
            )));
        }

        let region = s![window.row_off..window.row_end(), window.col_off..window.col_end()];
        if self.coverage.slice(region).iter().any(|&c| c) {
            return Err(InsarError::Processing(format!(
                "{} overlaps an already merged tile",
                tile.name()
            )));
        }

        self.data
            .slice_mut(s![.., window.row_off..window.row_end(), window.col_off..window.col_end()])
            .assign(bands);
        self.coverage
            .slice_mut(s![window.row_off..window.row_end(), window.col_off..window.col_end()])
            .fill(true);
        if let Some(flag) = self.placed.get_mut(tile.index) {
            *flag = true;
        }
        log::debug!("Merged {}", tile.name());
        Ok(())
    }

    /// Names of scheduled tiles with no output yet
    pub fn missing(&self) -> Vec<String> {
        self.tiles
            .iter()
            .zip(&self.placed)
            .filter(|(_, placed)| !**placed)
            .map(|(tile, _)| tile.name())
            .collect()
    }

    /// Finish the mosaic.
    ///
    /// Missing tiles are an error unless `allow_partial`, in which case the
    /// returned mosaic carries a coverage map marking the gaps.
    pub fn finish(self, allow_partial: bool) -> InsarResult<Mosaic> {
        let missing = self.missing();
        if !missing.is_empty() {
            if !allow_partial {
                return Err(InsarError::IncompleteMosaic { missing });
            }
            log::warn!(
                "Writing partial mosaic: {} of {} tiles missing {:?}",
                missing.len(),
                self.tiles.len(),
                missing
            );
        }
        Ok(Mosaic {
            extent: self.extent,
            band_names: self.band_names,
            data: self.data,
            coverage: self.coverage,
        })
    }
}
