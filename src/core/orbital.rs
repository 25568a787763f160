//! Orbital error removal by low-order polynomial surfaces.
//!
//! Pixel coordinates are normalised to [-1, 1] over the full extent, so a
//! surface evaluated at absolute pixel positions is the same whichever tile
//! evaluates it.

use crate::config::{OrbitalMethod, OrbitalModel};
use crate::core::linalg;
use crate::core::network::{DesignMatrix, NetworkGraph};
use crate::types::{InsarError, InsarResult, Raster, RasterExtent, Window};
use nalgebra::{DMatrix, DVector};

/// Normalised coordinate of `index` on an axis of length `len`
fn normalise(index: usize, len: usize) -> f64 {
    if len > 1 {
        2.0 * index as f64 / (len - 1) as f64 - 1.0
    } else {
        0.0
    }
}

/// Polynomial basis terms at normalised (x, y)
pub fn basis(model: OrbitalModel, x: f64, y: f64) -> Vec<f64> {
    match model {
        OrbitalModel::None => Vec::new(),
        OrbitalModel::Planar => vec![1.0, x, y],
        OrbitalModel::Quadratic => vec![1.0, x, y, x * x, y * y, x * y],
        OrbitalModel::PartCubic => vec![1.0, x, y, x * x, y * y, x * y, x * y * y],
    }
}

/// Fitted polynomial surface of one pair
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitalSurface {
    pub model: OrbitalModel,
    pub coeffs: DVector<f64>,
}

impl OrbitalSurface {
    /// Surface value at an absolute pixel
    pub fn evaluate(&self, row: usize, col: usize, extent: &RasterExtent) -> f64 {
        let x = normalise(col, extent.cols);
        let y = normalise(row, extent.rows);
        basis(self.model, x, y)
            .iter()
            .zip(self.coeffs.iter())
            .map(|(b, c)| b * c)
            .sum()
    }

    /// Copy of `phase` (covering `window`) with the surface removed
    pub fn remove(&self, phase: &Raster, window: &Window, extent: &RasterExtent) -> Raster {
        let mut corrected = phase.clone();
        for ((r, c), value) in corrected.indexed_iter_mut() {
            if value.is_finite() {
                let surface = self.evaluate(window.row_off + r, window.col_off + c, extent);
                *value = (*value as f64 - surface) as f32;
            }
        }
        corrected
    }
}

/// Least squares normal equations, accumulated tile by tile
#[derive(Debug, Clone)]
pub struct NormalEquations {
    model: OrbitalModel,
    ata: DMatrix<f64>,
    atb: DVector<f64>,
    count: usize,
}

impl NormalEquations {
    pub fn new(model: OrbitalModel) -> Self {
        let n = model.n_coeffs();
        Self {
            model,
            ata: DMatrix::zeros(n, n),
            atb: DVector::zeros(n),
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn add(&mut self, x: f64, y: f64, value: f64) {
        let terms = basis(self.model, x, y);
        for (i, ti) in terms.iter().enumerate() {
            self.atb[i] += ti * value;
            for (j, tj) in terms.iter().enumerate() {
                self.ata[(i, j)] += ti * tj;
            }
        }
        self.count += 1;
    }

    /// Accumulate every valid pixel of `phase` lying on the absolute stride grid
    pub fn add_window(&mut self, phase: &Raster, window: &Window, extent: &RasterExtent, stride: usize) {
        for ((r, c), &value) in phase.indexed_iter() {
            let (row, col) = (window.row_off + r, window.col_off + c);
            if row % stride != 0 || col % stride != 0 || !value.is_finite() {
                continue;
            }
            self.add(normalise(col, extent.cols), normalise(row, extent.rows), value as f64);
        }
    }

    pub fn merge(&mut self, other: &NormalEquations) {
        self.ata += &other.ata;
        self.atb += &other.atb;
        self.count += other.count;
    }

    /// Solve for the surface; fails below `required` valid pixels
    pub fn solve(&self, required: usize, context: &str) -> InsarResult<OrbitalSurface> {
        let required = required.max(self.model.n_coeffs());
        if self.count < required {
            return Err(InsarError::InsufficientData {
                context: format!("orbital fit of {}", context),
                available: self.count,
                required,
            });
        }
        let coeffs = linalg::solve_least_squares(&self.ata, &self.atb, 1e-12).ok_or_else(|| {
            InsarError::SingularSystem {
                rank: linalg::rank(&self.ata, 1e-12),
                required: self.model.n_coeffs(),
            }
        })?;
        Ok(OrbitalSurface {
            model: self.model,
            coeffs,
        })
    }
}

/// Fit a surface to a single window (tile-scope correction)
pub fn fit_window(
    model: OrbitalModel,
    phase: &Raster,
    window: &Window,
    extent: &RasterExtent,
    stride: usize,
    required: usize,
    context: &str,
) -> InsarResult<OrbitalSurface> {
    let mut equations = NormalEquations::new(model);
    equations.add_window(phase, window, extent, stride);
    equations.solve(required, context)
}

/// Make independent per-pair surfaces consistent with the network.
///
/// Each non-constant coefficient is treated as a pair observation of per-epoch
/// orbit coefficients and projected through the design matrix. Constant
/// offsets stay per pair. Pairs outside the network are left untouched.
pub fn apply_method(
    method: OrbitalMethod,
    surfaces: &[Option<OrbitalSurface>],
    network: &NetworkGraph,
    design: &DesignMatrix,
    rcond: f64,
) -> Vec<Option<OrbitalSurface>> {
    if method == OrbitalMethod::Independent {
        return surfaces.to_vec();
    }

    let rows: Vec<usize> = network
        .edges()
        .iter()
        .enumerate()
        .filter(|(_, e)| surfaces[e.pair_index].is_some())
        .map(|(row, _)| row)
        .collect();
    let Some(model) = surfaces.iter().flatten().map(|s| s.model).next() else {
        return surfaces.to_vec();
    };
    if rows.is_empty() {
        return surfaces.to_vec();
    }

    let a = design.restricted(&rows);
    let Some(pinv) = linalg::pseudo_inverse(&a, rcond) else {
        log::warn!("Network orbital projection failed; keeping independent fits");
        return surfaces.to_vec();
    };
    let projector = &a * &pinv.matrix;

    let mut projected = surfaces.to_vec();
    for k in 1..model.n_coeffs() {
        let observed = DVector::from_iterator(
            rows.len(),
            rows.iter().map(|&row| {
                let pair = network.edges()[row].pair_index;
                surfaces[pair].as_ref().map(|s| s.coeffs[k]).unwrap_or(0.0)
            }),
        );
        let consistent = &projector * observed;
        for (i, &row) in rows.iter().enumerate() {
            let pair = network.edges()[row].pair_index;
            if let Some(surface) = projected[pair].as_mut() {
                surface.coeffs[k] = consistent[i];
            }
        }
    }
    log::debug!("Projected {} orbital surfaces through the network", rows.len());
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkBuilder;
    use crate::types::PairMeta;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;
    use ndarray::Array2;

    fn planar_ramp(extent: &RasterExtent, a: f64, b: f64, c: f64) -> Raster {
        Array2::from_shape_fn((extent.rows, extent.cols), |(r, col)| {
            (a + b * normalise(col, extent.cols) + c * normalise(r, extent.rows)) as f32
        })
    }

    #[test]
    fn test_planar_fit_recovers_ramp() {
        let extent = RasterExtent::new(20, 30);
        let phase = planar_ramp(&extent, 0.5, 2.0, -1.0);
        let surface = fit_window(
            OrbitalModel::Planar,
            &phase,
            &Window::full(&extent),
            &extent,
            1,
            3,
            "ramp",
        )
        .unwrap();
        assert_abs_diff_eq!(surface.coeffs[0], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(surface.coeffs[1], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(surface.coeffs[2], -1.0, epsilon = 1e-5);

        let corrected = surface.remove(&phase, &Window::full(&extent), &extent);
        assert!(corrected.iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn test_tile_accumulation_matches_full_extent() {
        let extent = RasterExtent::new(16, 16);
        let phase = planar_ramp(&extent, 1.0, 0.3, 0.7);
        let full = fit_window(OrbitalModel::Quadratic, &phase, &Window::full(&extent), &extent, 2, 6, "full")
            .unwrap();

        let mut equations = NormalEquations::new(OrbitalModel::Quadratic);
        for (r0, c0) in [(0, 0), (0, 8), (8, 0), (8, 8)] {
            let window = Window::new(r0, c0, 8, 8);
            let part = phase.slice(ndarray::s![r0..r0 + 8, c0..c0 + 8]).to_owned();
            equations.add_window(&part, &window, &extent, 2);
        }
        let tiled = equations.solve(6, "tiled").unwrap();
        for k in 0..6 {
            assert_abs_diff_eq!(full.coeffs[k], tiled.coeffs[k], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_insufficient_pixels() {
        let extent = RasterExtent::new(4, 4);
        let mut phase = Array2::from_elem((4, 4), f32::NAN);
        phase[[0, 0]] = 1.0;
        phase[[1, 1]] = 2.0;
        let result = fit_window(OrbitalModel::Planar, &phase, &Window::full(&extent), &extent, 1, 3, "p");
        assert!(matches!(
            result,
            Err(InsarError::InsufficientData { available: 2, required: 3, .. })
        ));
    }

    #[test]
    fn test_network_projection_enforces_closure() {
        let d = |day| NaiveDate::from_ymd_opt(2020, 1, day).unwrap();
        let pairs = vec![
            PairMeta::new("a", d(1), d(2)),
            PairMeta::new("b", d(2), d(3)),
            PairMeta::new("c", d(1), d(3)),
        ];
        let network = NetworkBuilder::new(None).build(&pairs, &[]).unwrap();
        let design = DesignMatrix::from_network(&network);
        let surface = |x: f64| OrbitalSurface {
            model: OrbitalModel::Planar,
            coeffs: DVector::from_vec(vec![0.0, x, 0.0]),
        };
        // a + b != c; projection must make the loop close
        let surfaces = vec![Some(surface(1.0)), Some(surface(1.0)), Some(surface(3.0))];
        let projected = apply_method(OrbitalMethod::Network, &surfaces, &network, &design, 1e-10);
        let x: Vec<f64> = projected.iter().map(|s| s.as_ref().unwrap().coeffs[1]).collect();
        assert_abs_diff_eq!(x[0] + x[1], x[2], epsilon = 1e-10);
        assert_abs_diff_eq!(x[2], 8.0 / 3.0, epsilon = 1e-10);
    }
}
