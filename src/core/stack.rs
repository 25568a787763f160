//! Linear rate by stacking: weighted least squares of pair phase against
//! pair time span, through the origin.

use crate::config::{ProcessingConfig, StackParams, StackWeighting};
use crate::core::correct::CorrectedStack;
use crate::core::linalg;
use crate::core::network::{NetworkGraph, PairMask};
use crate::types::{Raster, RasterStack, Window};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3, Axis};
use std::collections::HashMap;

/// Band names of [`StackResult::to_bands`]
pub const STACK_BANDS: [&str; 4] = ["rate", "rate_uncertainty", "chi2", "n_used"];

/// Rate estimate of one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRate {
    pub rate: f64,
    pub uncertainty: f64,
    /// Reduced chi-square (NaN with a single degree of freedom left)
    pub chi2: f64,
    pub n_used: usize,
}

impl PixelRate {
    fn masked() -> Self {
        Self {
            rate: f64::NAN,
            uncertainty: f64::NAN,
            chi2: f64::NAN,
            n_used: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rate.is_finite()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    pub estimated: usize,
    pub masked: usize,
    /// Observations dropped by outlier rejection
    pub rejected: usize,
}

/// Per-tile stacking products
#[derive(Debug, Clone)]
pub struct StackResult {
    pub window: Window,
    pub rate: Raster,
    pub uncertainty: Raster,
    pub chi2: Raster,
    pub n_used: Raster,
    pub stats: StackStats,
}

impl StackResult {
    pub fn to_bands(&self) -> RasterStack {
        let (rows, cols) = self.window.dim();
        let mut bands = Array3::from_elem((STACK_BANDS.len(), rows, cols), f32::NAN);
        for (i, band) in [&self.rate, &self.uncertainty, &self.chi2, &self.n_used]
            .into_iter()
            .enumerate()
        {
            bands.index_axis_mut(Axis(0), i).assign(band);
        }
        bands
    }
}

/// Observation weighting of a pixel's selected pairs
enum Weights<'w> {
    /// Diagonal weights, one per selected observation
    Diagonal(Vec<f64>),
    /// Full weight matrix (inverse covariance)
    Full(&'w DMatrix<f64>),
}

/// Fit through the origin; `None` when the normal equation is degenerate
fn fit(spans: &[f64], obs: &[f64], weights: &Weights) -> Option<(f64, f64, f64, Vec<f64>)> {
    let n = obs.len();
    let (stt, sty) = match weights {
        Weights::Diagonal(w) => (
            w.iter().zip(spans).map(|(w, t)| w * t * t).sum::<f64>(),
            w.iter().zip(spans).zip(obs).map(|((w, t), y)| w * t * y).sum::<f64>(),
        ),
        Weights::Full(w) => {
            let t = DVector::from_column_slice(spans);
            let y = DVector::from_column_slice(obs);
            ((t.transpose() * *w * &t)[(0, 0)], (t.transpose() * *w * &y)[(0, 0)])
        }
    };
    if !(stt > 0.0) {
        return None;
    }
    let rate = sty / stt;
    let residuals: Vec<f64> = obs.iter().zip(spans).map(|(y, t)| y - rate * t).collect();

    let (chi, whitened) = match weights {
        Weights::Diagonal(w) => (
            residuals.iter().zip(w).map(|(r, w)| w * r * r).sum::<f64>(),
            residuals.iter().zip(w).map(|(r, w)| r * w.sqrt()).collect(),
        ),
        Weights::Full(w) => {
            let r = DVector::from_column_slice(&residuals);
            let chi = (r.transpose() * *w * &r)[(0, 0)];
            let whitened = residuals
                .iter()
                .enumerate()
                .map(|(i, r)| r * w[(i, i)].max(0.0).sqrt())
                .collect();
            (chi, whitened)
        }
    };
    let chi2 = if n > 1 { chi / (n - 1) as f64 } else { f64::NAN };
    Some((rate, (1.0 / stt).sqrt(), chi2, whitened))
}

/// Weighted linear-rate estimator over the effective network
#[derive(Debug, Clone)]
pub struct StackEstimator<'a> {
    network: &'a NetworkGraph,
    params: StackParams,
    threshold: usize,
    vcm: Option<DMatrix<f64>>,
    mst_weights: Option<Vec<f64>>,
    rcond: f64,
}

impl<'a> StackEstimator<'a> {
    /// `vcm` is the edge-ordered pair covariance used with [`StackWeighting::Vcm`];
    /// `mst_weights` ranks edges for the per-pixel spanning tree (lower is preferred).
    pub fn new(
        network: &'a NetworkGraph,
        config: &ProcessingConfig,
        vcm: Option<DMatrix<f64>>,
        mst_weights: Option<Vec<f64>>,
    ) -> Self {
        if config.stack.weighting == StackWeighting::Vcm && vcm.is_none() {
            log::warn!("VCM weighting requested without a covariance matrix; using inverse variance");
        }
        Self {
            network,
            params: config.stack.clone(),
            threshold: config.min_valid_pairs.max(2),
            vcm,
            mst_weights,
            rcond: config.inversion.rcond,
        }
    }

    /// Minimum number of pairs a pixel needs for a rate
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn use_vcm(&self) -> bool {
        self.params.weighting == StackWeighting::Vcm && self.vcm.is_some()
    }

    /// Inverse of the restricted VCM, cached per selection
    fn vcm_weights<'c>(
        &self,
        cache: &'c mut HashMap<PairMask, Option<DMatrix<f64>>>,
        selected: &[bool],
    ) -> Option<&'c DMatrix<f64>> {
        let mask = PairMask::from_flags(selected);
        cache
            .entry(mask)
            .or_insert_with_key(|mask| {
                let vcm = self.vcm.as_ref()?;
                let rows = mask.indices();
                let q = vcm.select_rows(rows.iter()).select_columns(rows.iter());
                if q.iter().any(|v| !v.is_finite()) {
                    return None;
                }
                linalg::pseudo_inverse(&q, self.rcond).map(|p| p.matrix)
            })
            .as_ref()
    }

    /// Rate of one pixel; `phases` and `variances` are indexed by edge.
    ///
    /// `None` marks a pair without a variance raster, which gets unit weight.
    /// A pair with a raster needs a finite positive variance at this pixel.
    pub fn estimate_pixel(
        &self,
        cache: &mut HashMap<PairMask, Option<DMatrix<f64>>>,
        phases: &[f64],
        variances: &[Option<f64>],
        stats: &mut StackStats,
    ) -> PixelRate {
        let edges = self.network.edges();
        let mut selected: Vec<bool> = phases
            .iter()
            .zip(variances)
            .map(|(p, v)| p.is_finite() && v.map_or(true, |v| v.is_finite() && v > 0.0))
            .collect();

        if self.params.use_mst {
            if let Some(weights) = &self.mst_weights {
                let tree = self.network.minimum_spanning_forest(weights, &selected);
                selected = vec![false; edges.len()];
                for e in tree {
                    selected[e] = true;
                }
            }
        }

        loop {
            let idx: Vec<usize> = (0..edges.len()).filter(|&e| selected[e]).collect();
            if idx.len() < self.threshold {
                return PixelRate::masked();
            }
            let spans: Vec<f64> = idx.iter().map(|&e| edges[e].time_span).collect();
            let obs: Vec<f64> = idx.iter().map(|&e| phases[e]).collect();

            let fitted = if self.use_vcm() {
                match self.vcm_weights(cache, &selected) {
                    Some(w) => fit(&spans, &obs, &Weights::Full(w)),
                    None => None,
                }
            } else {
                let w = idx
                    .iter()
                    .map(|&e| variances[e].map_or(1.0, |v| 1.0 / v))
                    .collect();
                fit(&spans, &obs, &Weights::Diagonal(w))
            };
            let Some((rate, uncertainty, chi2, whitened)) = fitted else {
                return PixelRate::masked();
            };

            if let Some(nsig) = self.params.nsig {
                let sigma = chi2.sqrt();
                if sigma.is_finite() && sigma > 0.0 {
                    let outliers: Vec<usize> = idx
                        .iter()
                        .zip(&whitened)
                        .filter(|(_, r)| r.abs() > nsig * sigma)
                        .map(|(&e, _)| e)
                        .collect();
                    if !outliers.is_empty() {
                        stats.rejected += outliers.len();
                        for e in outliers {
                            selected[e] = false;
                        }
                        continue;
                    }
                }
            }

            return PixelRate {
                rate,
                uncertainty,
                chi2,
                n_used: idx.len(),
            };
        }
    }

    /// Rate maps of one corrected tile
    pub fn estimate(&self, stack: &CorrectedStack) -> StackResult {
        let window = *stack.window();
        let (rows, cols) = window.dim();
        let n_edges = stack.phases.len();
        log::debug!("Stacking {} pairs over {}x{} pixels", n_edges, rows, cols);

        let mut out = Array3::from_elem((STACK_BANDS.len(), rows, cols), f32::NAN);
        let mut stats = StackStats::default();
        let mut cache = HashMap::new();
        let mut phases = vec![f64::NAN; n_edges];
        let mut variances = vec![None; n_edges];

        for r in 0..rows {
            for c in 0..cols {
                for e in 0..n_edges {
                    phases[e] = stack.phases[e][[r, c]] as f64;
                    variances[e] = stack.variances[e].as_ref().map(|v| v[[r, c]] as f64);
                }
                let pixel = self.estimate_pixel(&mut cache, &phases, &variances, &mut stats);
                if !pixel.is_valid() {
                    stats.masked += 1;
                    continue;
                }
                stats.estimated += 1;
                out[[0, r, c]] = pixel.rate as f32;
                out[[1, r, c]] = pixel.uncertainty as f32;
                out[[2, r, c]] = pixel.chi2 as f32;
                out[[3, r, c]] = pixel.n_used as f32;
            }
        }

        let band = |i: usize| -> Array2<f32> { out.index_axis(Axis(0), i).to_owned() };
        StackResult {
            window,
            rate: band(0),
            uncertainty: band(1),
            chi2: band(2),
            n_used: band(3),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkBuilder;
    use crate::core::tiling::Tile;
    use crate::types::PairMeta;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    fn network() -> NetworkGraph {
        let d = |m, day| NaiveDate::from_ymd_opt(2020, m, day).unwrap();
        let pairs = vec![
            PairMeta::new("p0", d(1, 1), d(4, 1)),
            PairMeta::new("p1", d(4, 1), d(7, 1)),
            PairMeta::new("p2", d(1, 1), d(7, 1)),
            PairMeta::new("p3", d(7, 1), d(12, 1)),
        ];
        NetworkBuilder::new(None).build(&pairs, &[]).unwrap()
    }

    fn config(min_valid_pairs: usize) -> ProcessingConfig {
        ProcessingConfig {
            min_valid_pairs,
            ..Default::default()
        }
    }

    #[test]
    fn test_unit_weight_rate_matches_closed_form() {
        let network = network();
        let estimator = StackEstimator::new(&network, &config(2), None, None);
        let spans: Vec<f64> = network.edges().iter().map(|e| e.time_span).collect();
        let phases: Vec<f64> = spans.iter().map(|t| 4.0 * t).collect();
        let mut stats = StackStats::default();
        let pixel = estimator.estimate_pixel(&mut HashMap::new(), &phases, &[None; 4], &mut stats);
        assert_abs_diff_eq!(pixel.rate, 4.0, epsilon = 1e-9);
        let stt: f64 = spans.iter().map(|t| t * t).sum();
        assert_abs_diff_eq!(pixel.uncertainty, (1.0 / stt).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(pixel.chi2, 0.0, epsilon = 1e-12);
        assert_eq!(pixel.n_used, 4);
    }

    #[test]
    fn test_threshold_boundary() {
        let network = network();
        let estimator = StackEstimator::new(&network, &config(3), None, None);
        let mut stats = StackStats::default();
        let nan = f64::NAN;
        let two = estimator.estimate_pixel(&mut HashMap::new(), &[1.0, 1.0, nan, nan], &[None; 4], &mut stats);
        assert!(two.rate.is_nan() && two.uncertainty.is_nan());
        let three = estimator.estimate_pixel(&mut HashMap::new(), &[1.0, 1.0, 2.0, nan], &[None; 4], &mut stats);
        assert!(three.is_valid());
        assert_eq!(three.n_used, 3);
    }

    #[test]
    fn test_inverse_variance_weights() {
        let network = network();
        let estimator = StackEstimator::new(&network, &config(2), None, None);
        let spans: Vec<f64> = network.edges().iter().map(|e| e.time_span).collect();
        let phases = [1.0, 2.0, 2.5, 0.5];
        let variances = [1.0, 4.0, 0.5, 2.0];
        let mut stats = StackStats::default();
        let pixel = estimator.estimate_pixel(&mut HashMap::new(), &phases, &variances.map(Some), &mut stats);

        let stt: f64 = spans.iter().zip(&variances).map(|(t, v)| t * t / v).sum();
        let sty: f64 = spans
            .iter()
            .zip(&variances)
            .zip(&phases)
            .map(|((t, v), y)| t * y / v)
            .sum();
        assert_abs_diff_eq!(pixel.rate, sty / stt, epsilon = 1e-12);
        assert_abs_diff_eq!(pixel.uncertainty, (1.0 / stt).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_diagonal_vcm_matches_inverse_variance() {
        let network = network();
        let variances = [1.0, 4.0, 0.5, 2.0];
        let vcm = DMatrix::from_diagonal(&DVector::from_column_slice(&variances));
        let mut cfg = config(2);
        cfg.stack.weighting = StackWeighting::Vcm;
        let gls = StackEstimator::new(&network, &cfg, Some(vcm), None);
        let wls = StackEstimator::new(&network, &config(2), None, None);
        let phases = [1.0, 2.0, 2.5, 0.5];
        let mut stats = StackStats::default();
        let a = gls.estimate_pixel(&mut HashMap::new(), &phases, &[None; 4], &mut stats);
        let b = wls.estimate_pixel(&mut HashMap::new(), &phases, &variances.map(Some), &mut stats);
        assert_abs_diff_eq!(a.rate, b.rate, epsilon = 1e-9);
        assert_abs_diff_eq!(a.chi2, b.chi2, epsilon = 1e-9);
    }

    #[test]
    fn test_outlier_rejection() {
        let network = network();
        let mut cfg = config(2);
        cfg.stack.nsig = Some(1.2);
        let estimator = StackEstimator::new(&network, &cfg, None, None);
        let spans: Vec<f64> = network.edges().iter().map(|e| e.time_span).collect();
        let mut phases: Vec<f64> = spans.iter().map(|t| 2.0 * t).collect();
        phases[3] += 5.0;
        let mut stats = StackStats::default();
        let pixel = estimator.estimate_pixel(&mut HashMap::new(), &phases, &[None; 4], &mut stats);
        assert_eq!(pixel.n_used, 3);
        assert_eq!(stats.rejected, 1);
        assert_abs_diff_eq!(pixel.rate, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mst_drops_redundant_pair() {
        let network = network();
        let mut cfg = config(2);
        cfg.stack.use_mst = true;
        let estimator = StackEstimator::new(&network, &cfg, None, Some(vec![0.1, 0.1, 0.9, 0.1]));
        let mut stats = StackStats::default();
        let pixel = estimator.estimate_pixel(&mut HashMap::new(), &[1.0, 1.0, 1.0, 1.0], &[None; 4], &mut stats);
        // p2 closes the only loop and carries the largest weight
        assert_eq!(pixel.n_used, 3);
    }

    #[test]
    fn test_nan_variance_masks_observation() {
        let network = network();
        let window = Window::new(0, 0, 1, 2);
        // Only p1 has a variance raster; its first pixel is NaN
        let phases: Vec<Raster> = network
            .edges()
            .iter()
            .map(|e| Array2::from_elem((1, 2), (3.0 * e.time_span) as f32))
            .collect();
        let mut variances: Vec<Option<Raster>> = vec![None; 4];
        variances[1] = Some(Array2::from_shape_vec((1, 2), vec![f32::NAN, 0.25]).unwrap());
        let corrected = CorrectedStack {
            tile: Tile {
                index: 0,
                grid_row: 0,
                grid_col: 0,
                window,
            },
            phases,
            variances,
        };

        let result = StackEstimator::new(&network, &config(2), None, None).estimate(&corrected);
        assert_eq!(result.n_used[[0, 0]], 3.0);
        assert_eq!(result.n_used[[0, 1]], 4.0);
        assert_abs_diff_eq!(result.rate[[0, 0]], 3.0, epsilon = 1e-4);
    }
}
