use chrono::NaiveDate;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Real-valued raster sample (unwrapped phase, variance, rate, ...)
pub type RasterReal = f32;

/// 2D raster (rows x cols), NaN marks invalid pixels
pub type Raster = Array2<RasterReal>;

/// 3D raster stack (band x rows x cols)
pub type RasterStack = Array3<RasterReal>;

/// Per-pixel boolean mask
pub type Mask = Array2<bool>;

/// Days per year used to convert pair time spans
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// GDAL ordering of the six coefficients
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }
}

/// Full extent of the common raster grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterExtent {
    pub rows: usize,
    pub cols: usize,
    pub geo_transform: Option<GeoTransform>,
}

impl RasterExtent {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            geo_transform: None,
        }
    }

    pub fn with_geo_transform(mut self, geo_transform: GeoTransform) -> Self {
        self.geo_transform = Some(geo_transform);
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// A single acquisition date with its ordinal position in the sorted epoch set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch {
    pub date: NaiveDate,
    pub index: usize,
}

/// Interferometric pair metadata. `first` is the master epoch, `second` the slave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairMeta {
    pub id: String,
    pub first: NaiveDate,
    pub second: NaiveDate,
}

impl PairMeta {
    pub fn new(id: impl Into<String>, first: NaiveDate, second: NaiveDate) -> Self {
        Self {
            id: id.into(),
            first,
            second,
        }
    }

    /// Temporal baseline in years (signed, second - first)
    pub fn time_span(&self) -> f64 {
        (self.second - self.first).num_days() as f64 / DAYS_PER_YEAR
    }
}

/// Axis-aligned window on the common raster grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub row_off: usize,
    pub col_off: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Window {
    pub fn new(row_off: usize, col_off: usize, rows: usize, cols: usize) -> Self {
        Self {
            row_off,
            col_off,
            rows,
            cols,
        }
    }

    pub fn full(extent: &RasterExtent) -> Self {
        Self::new(0, 0, extent.rows, extent.cols)
    }

    pub fn row_end(&self) -> usize {
        self.row_off + self.rows
    }

    pub fn col_end(&self) -> usize {
        self.col_off + self.cols
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row_off && row < self.row_end() && col >= self.col_off && col < self.col_end()
    }

    pub fn fits_in(&self, extent: &RasterExtent) -> bool {
        self.row_end() <= extent.rows && self.col_end() <= extent.cols
    }

    /// Grow the window by `halo` pixels on every side, clamped to the extent
    pub fn expanded(&self, halo: usize, extent: &RasterExtent) -> Window {
        let row_off = self.row_off.saturating_sub(halo);
        let col_off = self.col_off.saturating_sub(halo);
        let row_end = (self.row_end() + halo).min(extent.rows);
        let col_end = (self.col_end() + halo).min(extent.cols);
        Window::new(row_off, col_off, row_end - row_off, col_end - col_off)
    }

    /// Position of `inner` relative to this window, if fully contained
    pub fn relative(&self, inner: &Window) -> Option<(usize, usize)> {
        if inner.row_off < self.row_off
            || inner.col_off < self.col_off
            || inner.row_end() > self.row_end()
            || inner.col_end() > self.col_end()
        {
            return None;
        }
        Some((inner.row_off - self.row_off, inner.col_off - self.col_off))
    }
}

/// Rasters of one pair over one window
#[derive(Debug, Clone)]
pub struct PairWindow {
    pub phase: Raster,
    pub variance: Option<Raster>,
}

/// Why a pair left the effective network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExclusionReason {
    /// Pair lies in a component not containing the reference epoch
    Disconnected,
    /// Reference pixel/window is masked in this pair
    ReferencePixelInvalid,
    /// Too few valid pixels for the orbital polynomial
    OrbitalFitFailed,
    /// Too many pixels breach the phase closure threshold
    PhaseClosure,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::Disconnected => write!(f, "disconnected"),
            ExclusionReason::ReferencePixelInvalid => write!(f, "reference pixel invalid"),
            ExclusionReason::OrbitalFitFailed => write!(f, "orbital fit failed"),
            ExclusionReason::PhaseClosure => write!(f, "phase closure"),
        }
    }
}

/// A pair removed from inversion, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedPair {
    pub pair_index: usize,
    pub id: String,
    pub reason: ExclusionReason,
}

/// Error types for network correction and inversion
#[derive(Debug, thiserror::Error)]
pub enum InsarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Disconnected network: reference epoch {reference} reaches only {component_epochs} epoch(s); excluded pairs: {excluded:?}"
    )]
    DisconnectedNetwork {
        reference: String,
        component_epochs: usize,
        excluded: Vec<String>,
    },

    #[error("Insufficient data for {context}: {available} available, {required} required")]
    InsufficientData {
        context: String,
        available: usize,
        required: usize,
    },

    #[error("Reference pixel ({row}, {col}) is invalid in pair {pair}")]
    ReferencePixelInvalid { pair: String, row: usize, col: usize },

    #[error("Singular system: rank {rank}, {required} required")]
    SingularSystem { rank: usize, required: usize },

    #[error("Incomplete mosaic: {} tile(s) missing: {missing:?}", .missing.len())]
    IncompleteMosaic { missing: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for network processing operations
pub type InsarResult<T> = Result<T, InsarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_span_in_years() {
        let pair = PairMeta::new(
            "a",
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
        );
        assert!((pair.time_span() - 366.0 / 365.25).abs() < 1e-12);
    }

    #[test]
    fn test_window_expansion_is_clamped() {
        let extent = RasterExtent::new(10, 12);
        let w = Window::new(0, 8, 5, 4).expanded(3, &extent);
        assert_eq!(w, Window::new(0, 5, 8, 7));
        assert_eq!(w.relative(&Window::new(0, 8, 5, 4)), Some((0, 3)));
        assert!(w.relative(&Window::new(0, 0, 2, 2)).is_none());
    }
}
