//! Maximum phase variance per pair and the pair variance-covariance matrix.

use crate::core::network::NetworkGraph;
use crate::types::Raster;
use nalgebra::DMatrix;

/// Streaming mean/variance (Chan et al. parallel combination)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VarianceAccumulator {
    count: usize,
    mean: f64,
    m2: f64,
}

impl VarianceAccumulator {
    pub fn add_raster(&mut self, raster: &Raster) {
        for &v in raster.iter().filter(|v| v.is_finite()) {
            self.count += 1;
            let delta = v as f64 - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (v as f64 - self.mean);
        }
    }

    pub fn merge(&mut self, other: &VarianceAccumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / n;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other.count as f64 / n;
        self.count += other.count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample variance; `None` below two samples
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            None
        } else {
            Some(self.m2 / (self.count - 1) as f64)
        }
    }
}

/// Temporal variance-covariance matrix of the network pairs.
///
/// Pairs sharing an epoch are correlated with coefficient +0.5 when they share
/// the same role (both first or both second) and -0.5 otherwise. `maxvar` is
/// indexed by pair index.
pub fn pair_vcm(network: &NetworkGraph, maxvar: &[f64]) -> DMatrix<f64> {
    let edges = network.edges();
    let n = edges.len();
    let mut vcm = DMatrix::zeros(n, n);
    for (i, ei) in edges.iter().enumerate() {
        let vi = maxvar[ei.pair_index];
        vcm[(i, i)] = vi;
        for (j, ej) in edges.iter().enumerate().skip(i + 1) {
            let vj = maxvar[ej.pair_index];
            let mut coeff = 0.0;
            if ei.first == ej.first || ei.second == ej.second {
                coeff += 0.5;
            }
            if ei.first == ej.second || ei.second == ej.first {
                coeff -= 0.5;
            }
            let value = coeff * (vi * vj).sqrt();
            vcm[(i, j)] = value;
            vcm[(j, i)] = value;
        }
    }
    vcm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkBuilder;
    use crate::types::PairMeta;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;
    use ndarray::Array2;

    #[test]
    fn test_merged_variance_matches_single_pass() {
        let a = Array2::from_shape_vec((1, 4), vec![1.0f32, 2.0, f32::NAN, 4.0]).unwrap();
        let b = Array2::from_shape_vec((1, 3), vec![7.0f32, 3.0, 5.0]).unwrap();
        let mut left = VarianceAccumulator::default();
        left.add_raster(&a);
        let mut right = VarianceAccumulator::default();
        right.add_raster(&b);
        left.merge(&right);

        let values = [1.0, 2.0, 4.0, 7.0, 3.0, 5.0];
        let mean = values.iter().sum::<f64>() / 6.0;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / 5.0;
        assert_eq!(left.count(), 6);
        assert_abs_diff_eq!(left.variance().unwrap(), var, epsilon = 1e-12);
    }

    #[test]
    fn test_vcm_signs() {
        let d = |day| NaiveDate::from_ymd_opt(2020, 5, day).unwrap();
        let pairs = vec![
            PairMeta::new("ab", d(1), d(2)),
            PairMeta::new("bc", d(2), d(3)),
            PairMeta::new("ac", d(1), d(3)),
        ];
        let network = NetworkBuilder::new(None).build(&pairs, &[]).unwrap();
        let vcm = pair_vcm(&network, &[4.0, 1.0, 9.0]);
        assert_eq!(vcm[(0, 0)], 4.0);
        // ab / bc share b in opposite roles
        assert_abs_diff_eq!(vcm[(0, 1)], -1.0, epsilon = 1e-12);
        // ab / ac share first epoch a
        assert_abs_diff_eq!(vcm[(0, 2)], 3.0, epsilon = 1e-12);
        // bc / ac share second epoch c
        assert_abs_diff_eq!(vcm[(1, 2)], 1.5, epsilon = 1e-12);
        assert_eq!(vcm[(2, 1)], vcm[(1, 2)]);
    }
}
