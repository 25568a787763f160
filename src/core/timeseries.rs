//! Per-pixel network inversion into cumulative displacement.
//!
//! Every pixel solves `A·x = φ` restricted to the pairs valid at that pixel.
//! Pixels sharing a valid-pair pattern share one decomposition: systems are
//! built lazily into an arena keyed by the pattern's [`PairMask`].

use crate::config::InversionParams;
use crate::core::linalg;
use crate::core::network::{DesignMatrix, PairMask};
use crate::types::{Raster, RasterStack, Window};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3};
use std::collections::HashMap;

/// Outcome class of a pixel inversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelStatus {
    Solved,
    /// Fewer valid pairs than `min_valid_pairs`
    Insufficient,
    /// Valid pairs do not span every epoch of the network
    Singular,
}

/// Pre-built solver for one valid-pair pattern
#[derive(Debug, Clone)]
pub struct PixelSystem {
    rows: Vec<usize>,
    /// Maps the valid observations to the unknowns (n_unknowns x rows)
    solver: Option<DMatrix<f64>>,
    restricted: DMatrix<f64>,
    status: PixelStatus,
}

impl PixelSystem {
    pub fn status(&self) -> PixelStatus {
        self.status
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }
}

/// Lazily populated cache of pixel systems for one tile
#[derive(Debug, Default)]
pub struct SystemArena {
    systems: Vec<PixelSystem>,
    index: HashMap<PairMask, usize>,
}

impl SystemArena {
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// Inversion result of one pixel
#[derive(Debug, Clone)]
pub struct PixelSolution {
    pub status: PixelStatus,
    /// Displacement of every non-reference epoch
    pub displacement: Option<DVector<f64>>,
    /// Residual sum of squares per degree of freedom (0 for exactly determined systems)
    pub quality: f64,
}

/// Pixel counts by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InversionStats {
    pub solved: usize,
    pub insufficient: usize,
    pub singular: usize,
    /// Distinct valid-pair patterns decomposed
    pub systems: usize,
}

/// Per-tile time series products
#[derive(Debug, Clone)]
pub struct TimeSeriesResult {
    pub window: Window,
    /// (non-reference epoch, row, col) cumulative displacement
    pub displacement: RasterStack,
    /// Residual-based quality per pixel
    pub quality: Raster,
    /// Linear rate of the displacement series (per year)
    pub linear_rate: Raster,
    pub linear_error: Raster,
    pub linear_rsquared: Raster,
    pub stats: InversionStats,
}

impl TimeSeriesResult {
    /// Names of the bands returned by [`Self::to_bands`], given the epoch labels
    pub fn band_names(epoch_labels: &[String]) -> Vec<String> {
        let mut names: Vec<String> = epoch_labels.iter().map(|d| format!("displacement_{}", d)).collect();
        names.extend(
            ["quality", "linear_rate", "linear_error", "linear_rsquared"]
                .iter()
                .map(|s| s.to_string()),
        );
        names
    }

    /// Stack every product into one (band, row, col) array
    pub fn to_bands(&self) -> RasterStack {
        let (n_epochs, rows, cols) = self.displacement.dim();
        let mut bands = Array3::from_elem((n_epochs + 4, rows, cols), f32::NAN);
        bands
            .slice_mut(ndarray::s![..n_epochs, .., ..])
            .assign(&self.displacement);
        for (i, band) in [&self.quality, &self.linear_rate, &self.linear_error, &self.linear_rsquared]
            .into_iter()
            .enumerate()
        {
            bands.index_axis_mut(ndarray::Axis(0), n_epochs + i).assign(band);
        }
        bands
    }
}

/// Linear regression of a displacement series against epoch time.
///
/// Returns (rate, standard error, R²); the error is NaN with only two epochs.
pub fn linear_rate(years: &[f64], series: &[f64]) -> (f64, f64, f64) {
    let points: Vec<(f64, f64)> = years
        .iter()
        .zip(series)
        .filter(|(_, v)| v.is_finite())
        .map(|(&t, &v)| (t, v))
        .collect();
    let n = points.len();
    if n < 2 {
        return (f64::NAN, f64::NAN, f64::NAN);
    }
    let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n as f64;
    let mean_v = points.iter().map(|p| p.1).sum::<f64>() / n as f64;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_t).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_t) * (p.1 - mean_v)).sum();
    let sst: f64 = points.iter().map(|p| (p.1 - mean_v).powi(2)).sum();
    if sxx <= 0.0 {
        return (f64::NAN, f64::NAN, f64::NAN);
    }
    let rate = sxy / sxx;
    let intercept = mean_v - rate * mean_t;
    let ssr: f64 = points
        .iter()
        .map(|p| (p.1 - intercept - rate * p.0).powi(2))
        .sum();
    let error = if n > 2 {
        (ssr / (n - 2) as f64 / sxx).sqrt()
    } else {
        f64::NAN
    };
    let rsquared = if sst > 0.0 { 1.0 - ssr / sst } else { 1.0 };
    (rate, error, rsquared)
}

/// Time-aware second-difference operator over all epochs, reference column removed
fn smoothing_operator(design: &DesignMatrix, epoch_years: &[f64], factor: f64) -> Option<DMatrix<f64>> {
    let n_epochs = epoch_years.len();
    if factor <= 0.0 || n_epochs < 3 {
        return None;
    }
    let mut op = DMatrix::zeros(n_epochs - 2, design.n_unknowns());
    for i in 1..n_epochs - 1 {
        let dt_prev = epoch_years[i] - epoch_years[i - 1];
        let dt_next = epoch_years[i + 1] - epoch_years[i];
        let terms = [
            (i - 1, 1.0 / dt_prev),
            (i, -1.0 / dt_prev - 1.0 / dt_next),
            (i + 1, 1.0 / dt_next),
        ];
        for (epoch, coeff) in terms {
            if let Some(col) = design.column_of(epoch) {
                op[(i - 1, col)] = factor * coeff;
            }
        }
    }
    Some(op)
}

/// Network inversion of corrected pair phases
#[derive(Debug, Clone)]
pub struct TimeSeriesInverter<'a> {
    design: &'a DesignMatrix,
    epoch_years: Vec<f64>,
    smoothing: Option<DMatrix<f64>>,
    min_valid_pairs: usize,
    rcond: f64,
}

impl<'a> TimeSeriesInverter<'a> {
    /// `epoch_years` is the time of every network epoch relative to the reference
    pub fn new(
        design: &'a DesignMatrix,
        epoch_years: Vec<f64>,
        min_valid_pairs: usize,
        params: &InversionParams,
    ) -> Self {
        let smoothing = smoothing_operator(design, &epoch_years, params.smoothing_factor);
        Self {
            design,
            epoch_years,
            smoothing,
            min_valid_pairs,
            rcond: params.rcond,
        }
    }

    /// Plain least squares inverter used for provisional decompositions
    pub fn unregularised(design: &'a DesignMatrix, epoch_years: Vec<f64>, rcond: f64) -> Self {
        Self {
            design,
            epoch_years,
            smoothing: None,
            min_valid_pairs: 1,
            rcond,
        }
    }

    pub fn n_unknowns(&self) -> usize {
        self.design.n_unknowns()
    }

    fn build_system(&self, mask: &PairMask) -> PixelSystem {
        let rows = mask.indices();
        let restricted = self.design.restricted(&rows);
        let n = self.design.n_unknowns();

        if rows.len() < self.min_valid_pairs || rows.is_empty() {
            return PixelSystem {
                rows,
                solver: None,
                restricted,
                status: PixelStatus::Insufficient,
            };
        }
        if linalg::rank(&restricted, self.rcond) < n {
            return PixelSystem {
                rows,
                solver: None,
                restricted,
                status: PixelStatus::Singular,
            };
        }

        let m = rows.len();
        let solver = match &self.smoothing {
            None => linalg::pseudo_inverse(&restricted, self.rcond).map(|p| p.matrix),
            Some(op) => {
                let mut augmented = DMatrix::zeros(m + op.nrows(), n);
                augmented.rows_mut(0, m).copy_from(&restricted);
                augmented.rows_mut(m, op.nrows()).copy_from(op);
                linalg::pseudo_inverse(&augmented, self.rcond).map(|p| p.matrix.columns(0, m).into_owned())
            }
        };
        let status = if solver.is_some() {
            PixelStatus::Solved
        } else {
            PixelStatus::Singular
        };
        PixelSystem {
            rows,
            solver,
            restricted,
            status,
        }
    }

    /// Solve one pixel; `observations` holds one phase per network edge (NaN = invalid)
    pub fn solve_pixel(&self, arena: &mut SystemArena, observations: &[f64]) -> PixelSolution {
        let flags: Vec<bool> = observations.iter().map(|v| v.is_finite()).collect();
        let mask = PairMask::from_flags(&flags);
        let slot = match arena.index.get(&mask) {
            Some(&slot) => slot,
            None => {
                let system = self.build_system(&mask);
                arena.systems.push(system);
                arena.index.insert(mask, arena.systems.len() - 1);
                arena.systems.len() - 1
            }
        };
        let system = &arena.systems[slot];

        let Some(solver) = &system.solver else {
            return PixelSolution {
                status: system.status,
                displacement: None,
                quality: f64::NAN,
            };
        };

        let y = DVector::from_iterator(system.rows.len(), system.rows.iter().map(|&r| observations[r]));
        let x = solver * &y;
        let residual = &y - &system.restricted * &x;
        let dof = system.rows.len().saturating_sub(self.design.n_unknowns());
        let quality = if dof > 0 {
            residual.norm_squared() / dof as f64
        } else {
            0.0
        };
        PixelSolution {
            status: PixelStatus::Solved,
            displacement: Some(x),
            quality,
        }
    }

    /// Displacement of every epoch (reference = 0) for a solved pixel
    pub fn full_series(&self, displacement: &DVector<f64>) -> Vec<f64> {
        (0..self.epoch_years.len())
            .map(|e| match self.design.column_of(e) {
                Some(col) => displacement[col],
                None => 0.0,
            })
            .collect()
    }

    /// Invert every pixel of a tile; `phases` is indexed by network edge
    pub fn invert(&self, window: Window, phases: &[Raster]) -> TimeSeriesResult {
        let (rows, cols) = window.dim();
        let n = self.design.n_unknowns();
        log::debug!(
            "Inverting {}x{} pixels against {} pairs / {} unknowns",
            rows,
            cols,
            phases.len(),
            n
        );

        let mut displacement = Array3::from_elem((n, rows, cols), f32::NAN);
        let mut quality = Array2::from_elem((rows, cols), f32::NAN);
        let mut linear = Array3::from_elem((3, rows, cols), f32::NAN);
        let mut stats = InversionStats::default();
        let mut arena = SystemArena::default();
        let mut observations = vec![f64::NAN; phases.len()];

        for r in 0..rows {
            for c in 0..cols {
                for (e, phase) in phases.iter().enumerate() {
                    observations[e] = phase[[r, c]] as f64;
                }
                let solution = self.solve_pixel(&mut arena, &observations);
                match solution.status {
                    PixelStatus::Solved => stats.solved += 1,
                    PixelStatus::Insufficient => stats.insufficient += 1,
                    PixelStatus::Singular => stats.singular += 1,
                }
                let Some(x) = solution.displacement else {
                    continue;
                };
                for (k, v) in x.iter().enumerate() {
                    displacement[[k, r, c]] = *v as f32;
                }
                quality[[r, c]] = solution.quality as f32;

                let series = self.full_series(&x);
                let (rate, error, rsq) = linear_rate(&self.epoch_years, &series);
                linear[[0, r, c]] = rate as f32;
                linear[[1, r, c]] = error as f32;
                linear[[2, r, c]] = rsq as f32;
            }
        }
        stats.systems = arena.len();

        if stats.singular > 0 || stats.insufficient > 0 {
            log::debug!(
                "Inversion masked {} insufficient and {} rank-deficient pixel(s)",
                stats.insufficient,
                stats.singular
            );
        }

        TimeSeriesResult {
            window,
            displacement,
            quality,
            linear_rate: linear.index_axis(ndarray::Axis(0), 0).to_owned(),
            linear_error: linear.index_axis(ndarray::Axis(0), 1).to_owned(),
            linear_rsquared: linear.index_axis(ndarray::Axis(0), 2).to_owned(),
            stats,
        }
    }

    /// Provisional (epoch, row, col) series over all epochs, reference at zero.
    ///
    /// Unsolvable pixels are NaN in every epoch.
    pub fn provisional_series(&self, phases: &[Raster]) -> Array3<f64> {
        let (rows, cols) = phases.first().map(|p| p.dim()).unwrap_or((0, 0));
        let mut series = Array3::from_elem((self.epoch_years.len(), rows, cols), f64::NAN);
        let mut arena = SystemArena::default();
        let mut observations = vec![f64::NAN; phases.len()];
        for r in 0..rows {
            for c in 0..cols {
                for (e, phase) in phases.iter().enumerate() {
                    observations[e] = phase[[r, c]] as f64;
                }
                if let Some(x) = self.solve_pixel(&mut arena, &observations).displacement {
                    for (e, v) in self.full_series(&x).into_iter().enumerate() {
                        series[[e, r, c]] = v;
                    }
                }
            }
        }
        series
    }
}
