//! Atmospheric phase screen (APS) estimation.
//!
//! The atmosphere is modelled as the part of the per-epoch phase that is
//! uncorrelated in time but correlated in space: a temporal high-pass of the
//! provisional time series followed by a spatial low-pass per epoch.

use crate::config::{ApsParams, SpatialKernel};
use crate::core::network::NetworkEdge;
use crate::types::Raster;
use ndarray::{Array2, Array3, Axis};

/// Kernel weights on a (2r+1)^2 grid; zero outside the circular radius
pub fn kernel_weights(kernel: SpatialKernel, radius: usize) -> Array2<f64> {
    let size = 2 * radius + 1;
    let r2 = (radius * radius) as f64;
    Array2::from_shape_fn((size, size), |(i, j)| {
        let dr = i as f64 - radius as f64;
        let dc = j as f64 - radius as f64;
        let d2 = dr * dr + dc * dc;
        if d2 > r2 {
            return 0.0;
        }
        match kernel {
            SpatialKernel::Gaussian { sigma } => (-d2 / (2.0 * sigma * sigma)).exp(),
            SpatialKernel::Mean => 1.0,
        }
    })
}

fn filter_pixel(image: &Array2<f64>, weights: &Array2<f64>, radius: usize, r: usize, c: usize) -> f64 {
    let (height, width) = image.dim();
    let r_start = r.saturating_sub(radius);
    let r_end = (r + radius + 1).min(height);
    let c_start = c.saturating_sub(radius);
    let c_end = (c + radius + 1).min(width);

    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for i in r_start..r_end {
        for j in c_start..c_end {
            let v = image[[i, j]];
            if !v.is_finite() {
                continue;
            }
            let w = weights[[i + radius - r, j + radius - c]];
            sum += w * v;
            weight_sum += w;
        }
    }
    if weight_sum > 0.0 {
        sum / weight_sum
    } else {
        f64::NAN
    }
}

/// NaN-aware spatial low-pass; NaN where the kernel sees no valid pixel
pub fn spatial_low_pass(image: &Array2<f64>, kernel: SpatialKernel, radius: usize) -> Array2<f64> {
    let weights = kernel_weights(kernel, radius);
    let mut filtered = Array2::from_elem(image.dim(), f64::NAN);

    #[cfg(feature = "parallel")]
    {
        ndarray::Zip::indexed(&mut filtered)
            .par_for_each(|(r, c), out| *out = filter_pixel(image, &weights, radius, r, c));
    }
    #[cfg(not(feature = "parallel"))]
    {
        ndarray::Zip::indexed(&mut filtered)
            .for_each(|(r, c), out| *out = filter_pixel(image, &weights, radius, r, c));
    }

    filtered
}

/// Residual of a temporal Gaussian smoothing of one pixel's time series
pub fn temporal_high_pass(series: &[f64], years: &[f64], cutoff_years: f64) -> Vec<f64> {
    series
        .iter()
        .zip(years)
        .map(|(&value, &tj)| {
            if !value.is_finite() {
                return f64::NAN;
            }
            let mut sum = 0.0;
            let mut weight_sum = 0.0;
            for (&v, &tk) in series.iter().zip(years) {
                if v.is_finite() {
                    let u = (tj - tk) / cutoff_years;
                    let w = (-0.5 * u * u).exp();
                    sum += w * v;
                    weight_sum += w;
                }
            }
            value - sum / weight_sum
        })
        .collect()
}

/// Spatio-temporal APS filter
#[derive(Debug, Clone)]
pub struct ApsFilter {
    params: ApsParams,
    epoch_years: Vec<f64>,
}

impl ApsFilter {
    /// `epoch_years` holds the time of every network epoch (reference included)
    pub fn new(params: ApsParams, epoch_years: Vec<f64>) -> Self {
        Self { params, epoch_years }
    }

    /// Per-epoch screens from a provisional (epoch, row, col) time series
    pub fn estimate(&self, series: &Array3<f64>) -> Array3<f64> {
        let cutoff_years = self.params.temporal_cutoff_days / crate::types::DAYS_PER_YEAR;
        let (n_epochs, rows, cols) = series.dim();
        log::debug!(
            "Estimating APS for {} epochs over {}x{} pixels",
            n_epochs,
            rows,
            cols
        );

        let mut high_pass = Array3::from_elem((n_epochs, rows, cols), f64::NAN);
        for r in 0..rows {
            for c in 0..cols {
                let pixel: Vec<f64> = series.slice(ndarray::s![.., r, c]).to_vec();
                let filtered = temporal_high_pass(&pixel, &self.epoch_years, cutoff_years);
                for (e, v) in filtered.into_iter().enumerate() {
                    high_pass[[e, r, c]] = v;
                }
            }
        }

        let mut screens = Array3::from_elem((n_epochs, rows, cols), f64::NAN);
        for (e, layer) in high_pass.axis_iter(Axis(0)).enumerate() {
            let low = spatial_low_pass(&layer.to_owned(), self.params.kernel, self.params.radius);
            screens.index_axis_mut(Axis(0), e).assign(&low);
        }
        screens
    }

    /// Copies of the edge phases with the differential screen removed.
    ///
    /// Pixels whose screen is undefined become NaN.
    pub fn correct(&self, phases: &[Raster], edges: &[NetworkEdge], screens: &Array3<f64>) -> Vec<Raster> {
        phases
            .iter()
            .zip(edges)
            .map(|(phase, edge)| {
                let first = screens.index_axis(Axis(0), edge.first);
                let second = screens.index_axis(Axis(0), edge.second);
                let mut out = phase.clone();
                ndarray::Zip::from(&mut out)
                    .and(&first)
                    .and(&second)
                    .for_each(|v, &a, &b| {
                        if v.is_finite() {
                            let delta = b - a;
                            *v = if delta.is_finite() {
                                (*v as f64 - delta) as f32
                            } else {
                                f32::NAN
                            };
                        }
                    });
                out
            })
            .collect()
    }
}
