//! Processing parameters for the correction / inversion / stacking run.
//!
//! Every parameter group carries its own `Default`, mirroring the per-processor
//! parameter structs used throughout the core modules. File loading is left to
//! the caller; any serde format can produce a [`ProcessingConfig`].

use crate::types::{InsarError, InsarResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Polynomial surface removed by the orbital correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrbitalModel {
    /// Orbital correction disabled
    None,
    /// offset + x + y
    Planar,
    /// Planar + x^2 + y^2 + xy
    Quadratic,
    /// Quadratic + xy^2
    PartCubic,
}

impl OrbitalModel {
    /// Number of polynomial coefficients (including the constant offset)
    pub fn n_coeffs(&self) -> usize {
        match self {
            OrbitalModel::None => 0,
            OrbitalModel::Planar => 3,
            OrbitalModel::Quadratic => 6,
            OrbitalModel::PartCubic => 7,
        }
    }
}

/// How per-pair orbital coefficients relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrbitalMethod {
    /// Each pair fitted on its own
    Independent,
    /// Independent fits projected onto per-epoch surfaces through the network
    Network,
}

/// Where orbital normal equations are accumulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrbitalScope {
    /// Over the full extent, before tile dispatch
    Global,
    /// Inside every tile independently
    Tile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitalParams {
    pub model: OrbitalModel,
    pub method: OrbitalMethod,
    pub scope: OrbitalScope,
    /// Pixel decimation (absolute grid) when accumulating the fit
    pub stride: usize,
    /// Minimum valid pixels for a fit; defaults to the number of coefficients
    pub min_valid_pixels: Option<usize>,
}

impl Default for OrbitalParams {
    fn default() -> Self {
        Self {
            model: OrbitalModel::Planar,
            method: OrbitalMethod::Independent,
            scope: OrbitalScope::Global,
            stride: 1,
            min_valid_pixels: None,
        }
    }
}

impl OrbitalParams {
    pub fn enabled(&self) -> bool {
        self.model != OrbitalModel::None
    }

    /// Degrees-of-freedom threshold for a single fit
    pub fn required_pixels(&self) -> usize {
        self.min_valid_pixels
            .unwrap_or(0)
            .max(self.model.n_coeffs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParams {
    pub enabled: bool,
    /// Reference pixel (row, col); searched automatically when `None`
    pub pixel: Option<(usize, usize)>,
    /// Half size of the square reference window (0 = single pixel)
    pub half_window: usize,
    /// Minimum fraction of valid pixels inside the reference window
    pub min_valid_fraction: f64,
    /// Grid spacing of candidate pixels for the automatic search
    pub search_step: usize,
}

impl Default for ReferenceParams {
    fn default() -> Self {
        Self {
            enabled: true,
            pixel: None,
            half_window: 2,
            min_valid_fraction: 0.5,
            search_step: 16,
        }
    }
}

/// Spatial low-pass kernel of the atmospheric filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SpatialKernel {
    /// Gaussian weights with the given sigma (pixels)
    Gaussian { sigma: f64 },
    /// Uniform average
    Mean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApsParams {
    pub enabled: bool,
    pub kernel: SpatialKernel,
    /// Kernel radius in pixels; also the halo read around every tile
    pub radius: usize,
    /// Temporal Gaussian cutoff (days) separating signal from atmosphere
    pub temporal_cutoff_days: f64,
}

impl Default for ApsParams {
    fn default() -> Self {
        Self {
            enabled: false,
            kernel: SpatialKernel::Gaussian { sigma: 2.0 },
            radius: 6,
            temporal_cutoff_days: 90.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureParams {
    pub enabled: bool,
    /// Absolute loop closure (radians) above which a pixel breaches
    pub threshold: f64,
    /// Pairs with a larger fraction of breached pixels are excluded
    pub max_pair_breach_fraction: f64,
    /// Pixels breaching in at least this many loops are masked
    pub min_pixel_loops: usize,
}

impl Default for ClosureParams {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: std::f64::consts::PI,
            max_pair_breach_fraction: 0.5,
            min_pixel_loops: 1,
        }
    }
}

/// Tile partitioning request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileSpec {
    /// Target tile dimensions (rows, cols)
    Size { rows: usize, cols: usize },
    /// Number of tiles along each axis
    Count { rows: usize, cols: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingParams {
    pub tile: TileSpec,
    /// Worker pool size (0 = rayon default)
    pub workers: usize,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            tile: TileSpec::Size { rows: 512, cols: 512 },
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InversionParams {
    /// Tikhonov temporal smoothing strength (0 = plain least squares)
    pub smoothing_factor: f64,
    /// Relative singular value cutoff for rank and pseudo-inverse
    pub rcond: f64,
}

impl Default for InversionParams {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.0,
            rcond: 1e-10,
        }
    }
}

/// Observation weighting used by the rate stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackWeighting {
    /// Per-pixel inverse variance (unit weights without variance rasters)
    InverseVariance,
    /// Pair variance-covariance matrix from the maximum variance estimate
    Vcm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackParams {
    pub weighting: StackWeighting,
    /// Outlier rejection threshold in a-posteriori sigmas
    pub nsig: Option<f64>,
    /// Restrict each pixel to a minimum spanning tree of its valid pairs
    pub use_mst: bool,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            weighting: StackWeighting::InverseVariance,
            nsig: None,
            use_mst: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeParams {
    /// Emit mosaics with a coverage map when tiles are missing
    pub allow_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Abort on the first tile failure instead of reporting after the barrier
    pub fail_fast: bool,
    /// Extra attempts per tile before recording a permanent failure
    pub max_retries: usize,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_retries: 1,
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Zero-displacement epoch; earliest epoch of the largest component when `None`
    pub reference_epoch: Option<NaiveDate>,
    /// Per-pixel valid pair threshold shared by inversion and stacking
    pub min_valid_pairs: usize,
    pub orbital: OrbitalParams,
    pub reference: ReferenceParams,
    pub aps: ApsParams,
    pub closure: ClosureParams,
    pub tiling: TilingParams,
    pub inversion: InversionParams,
    pub stack: StackParams,
    pub merge: MergeParams,
    pub execution: ExecutionParams,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            reference_epoch: None,
            min_valid_pairs: 2,
            orbital: OrbitalParams::default(),
            reference: ReferenceParams::default(),
            aps: ApsParams::default(),
            closure: ClosureParams::default(),
            tiling: TilingParams::default(),
            inversion: InversionParams::default(),
            stack: StackParams::default(),
            merge: MergeParams::default(),
            execution: ExecutionParams::default(),
        }
    }
}

impl ProcessingConfig {
    /// Check parameter ranges before any data is touched
    pub fn validate(&self) -> InsarResult<()> {
        if self.min_valid_pairs == 0 {
            return Err(InsarError::InvalidConfig(
                "min_valid_pairs must be at least 1".to_string(),
            ));
        }
        if self.orbital.stride == 0 {
            return Err(InsarError::InvalidConfig(
                "orbital stride must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reference.min_valid_fraction) {
            return Err(InsarError::InvalidConfig(format!(
                "reference min_valid_fraction {} outside [0, 1]",
                self.reference.min_valid_fraction
            )));
        }
        if self.reference.search_step == 0 {
            return Err(InsarError::InvalidConfig(
                "reference search_step must be at least 1".to_string(),
            ));
        }
        if self.aps.enabled {
            if self.aps.radius == 0 {
                return Err(InsarError::InvalidConfig(
                    "APS filter radius must be at least 1".to_string(),
                ));
            }
            if let SpatialKernel::Gaussian { sigma } = self.aps.kernel {
                if !(sigma > 0.0) {
                    return Err(InsarError::InvalidConfig(format!(
                        "APS Gaussian sigma must be positive, got {}",
                        sigma
                    )));
                }
            }
            if !(self.aps.temporal_cutoff_days > 0.0) {
                return Err(InsarError::InvalidConfig(
                    "APS temporal cutoff must be positive".to_string(),
                ));
            }
        }
        if self.closure.enabled && !(self.closure.threshold > 0.0) {
            return Err(InsarError::InvalidConfig(
                "phase closure threshold must be positive".to_string(),
            ));
        }
        match self.tiling.tile {
            TileSpec::Size { rows, cols } | TileSpec::Count { rows, cols } => {
                if rows == 0 || cols == 0 {
                    return Err(InsarError::InvalidConfig(
                        "tile dimensions must be non-zero".to_string(),
                    ));
                }
            }
        }
        if !(self.inversion.smoothing_factor >= 0.0) {
            return Err(InsarError::InvalidConfig(format!(
                "smoothing factor must be non-negative, got {}",
                self.inversion.smoothing_factor
            )));
        }
        if !(self.inversion.rcond > 0.0) {
            return Err(InsarError::InvalidConfig(
                "rcond must be positive".to_string(),
            ));
        }
        if let Some(nsig) = self.stack.nsig {
            if !(nsig > 0.0) {
                return Err(InsarError::InvalidConfig(format!(
                    "nsig must be positive, got {}",
                    nsig
                )));
            }
        }
        Ok(())
    }

    /// Halo read around each tile so that spatial filtering matches an untiled run
    pub fn tile_halo(&self) -> usize {
        if self.aps.enabled {
            self.aps.radius
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProcessingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_min_valid_pairs() {
        let config = ProcessingConfig {
            min_valid_pairs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(InsarError::InvalidConfig(_))));
    }

    #[test]
    fn test_orbital_dof_threshold() {
        let mut params = OrbitalParams::default();
        assert_eq!(params.required_pixels(), 3);
        params.model = OrbitalModel::PartCubic;
        params.min_valid_pixels = Some(100);
        assert_eq!(params.required_pixels(), 100);
        params.min_valid_pixels = Some(2);
        assert_eq!(params.required_pixels(), 7);
    }

    #[test]
    fn test_halo_follows_aps_radius() {
        let mut config = ProcessingConfig::default();
        assert_eq!(config.tile_halo(), 0);
        config.aps.enabled = true;
        config.aps.radius = 4;
        assert_eq!(config.tile_halo(), 4);
    }
}
