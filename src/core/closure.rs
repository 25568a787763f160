//! Phase closure check over triangular loops of the network.
//!
//! For a loop of epochs a < b < c the closure `φab + φbc − φac` is zero for
//! consistently unwrapped data; large closures flag unwrapping errors.

use crate::core::network::NetworkGraph;
use crate::types::Raster;
use ndarray::Array2;
use std::collections::HashMap;

/// Triangle of network edges with the sign each edge enters the closure with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosureLoop {
    /// Edge positions in the network
    pub edges: [usize; 3],
    pub signs: [f64; 3],
}

/// All triangular loops of the network (one edge per epoch pair)
pub fn find_loops(network: &NetworkGraph) -> Vec<ClosureLoop> {
    let mut by_epochs: HashMap<(usize, usize), (usize, f64)> = HashMap::new();
    for (pos, edge) in network.edges().iter().enumerate() {
        let key = (edge.first.min(edge.second), edge.first.max(edge.second));
        let sign = if edge.first < edge.second { 1.0 } else { -1.0 };
        by_epochs.entry(key).or_insert((pos, sign));
    }

    let mut keys: Vec<(usize, usize)> = by_epochs.keys().copied().collect();
    keys.sort_unstable();
    let n_epochs = network.epochs().len();

    let mut loops = Vec::new();
    for &(a, b) in &keys {
        for c in (b + 1)..n_epochs {
            if let (Some(&(bc, s_bc)), Some(&(ac, s_ac))) = (by_epochs.get(&(b, c)), by_epochs.get(&(a, c))) {
                let (ab, s_ab) = by_epochs[&(a, b)];
                loops.push(ClosureLoop {
                    edges: [ab, bc, ac],
                    signs: [s_ab, s_bc, -s_ac],
                });
            }
        }
    }
    log::debug!("Found {} closure loops", loops.len());
    loops
}

/// Per-edge count of breaching loops at each pixel.
///
/// `phases` is indexed by edge position; every raster shares one shape.
pub fn breach_counts(loops: &[ClosureLoop], phases: &[Raster], threshold: f64) -> Vec<Array2<u16>> {
    let dim = phases.first().map(|p| p.dim()).unwrap_or((0, 0));
    let mut counts = vec![Array2::<u16>::zeros(dim); phases.len()];
    for lp in loops {
        let [e0, e1, e2] = lp.edges;
        for ((r, c), &p0) in phases[e0].indexed_iter() {
            let (p1, p2) = (phases[e1][[r, c]], phases[e2][[r, c]]);
            if !(p0.is_finite() && p1.is_finite() && p2.is_finite()) {
                continue;
            }
            let closure = lp.signs[0] * p0 as f64 + lp.signs[1] * p1 as f64 + lp.signs[2] * p2 as f64;
            if closure.abs() > threshold {
                for e in lp.edges {
                    counts[e][[r, c]] = counts[e][[r, c]].saturating_add(1);
                }
            }
        }
    }
    counts
}

/// Breached and valid pixel counts per edge, accumulated over tiles
#[derive(Debug, Clone, Default)]
pub struct ClosureStats {
    pub breached: Vec<usize>,
    pub valid: Vec<usize>,
}

impl ClosureStats {
    pub fn new(n_edges: usize) -> Self {
        Self {
            breached: vec![0; n_edges],
            valid: vec![0; n_edges],
        }
    }

    pub fn add(&mut self, phases: &[Raster], counts: &[Array2<u16>]) {
        for (e, (phase, count)) in phases.iter().zip(counts).enumerate() {
            self.valid[e] += phase.iter().filter(|v| v.is_finite()).count();
            self.breached[e] += count.iter().filter(|&&c| c > 0).count();
        }
    }

    pub fn merge(&mut self, other: &ClosureStats) {
        for (a, b) in self.breached.iter_mut().zip(&other.breached) {
            *a += b;
        }
        for (a, b) in self.valid.iter_mut().zip(&other.valid) {
            *a += b;
        }
    }

    /// Fraction of valid pixels breaching in at least one loop
    pub fn breach_fraction(&self, edge: usize) -> f64 {
        if self.valid[edge] == 0 {
            0.0
        } else {
            self.breached[edge] as f64 / self.valid[edge] as f64
        }
    }
}

/// Copy of `phases` with pixels breaching in at least `min_loops` loops set to NaN
pub fn mask_breaches(phases: &[Raster], counts: &[Array2<u16>], min_loops: usize) -> (Vec<Raster>, usize) {
    let mut masked = 0;
    let out = phases
        .iter()
        .zip(counts)
        .map(|(phase, count)| {
            let mut p = phase.clone();
            ndarray::Zip::from(&mut p).and(count).for_each(|v, &n| {
                if v.is_finite() && n as usize >= min_loops.max(1) {
                    *v = f32::NAN;
                    masked += 1;
                }
            });
            p
        })
        .collect();
    (out, masked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::NetworkBuilder;
    use crate::types::PairMeta;
    use chrono::NaiveDate;

    fn network() -> NetworkGraph {
        let d = |day| NaiveDate::from_ymd_opt(2020, 2, day).unwrap();
        let pairs = vec![
            PairMeta::new("ab", d(1), d(2)),
            PairMeta::new("cb", d(3), d(2)),
            PairMeta::new("ac", d(1), d(3)),
            PairMeta::new("cd", d(3), d(4)),
        ];
        NetworkBuilder::new(None).build(&pairs, &[]).unwrap()
    }

    #[test]
    fn test_single_triangle_with_reversed_edge() {
        let loops = find_loops(&network());
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].edges, [0, 1, 2]);
        assert_eq!(loops[0].signs, [1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_breach_detection_and_masking() {
        let loops = find_loops(&network());
        // displacement a=0, b=1, c=3 at both pixels; pixel 1 has an unwrapping error on "ab"
        let ab = Array2::from_shape_vec((1, 2), vec![1.0f32, 1.0 + 6.3]).unwrap();
        let cb = Array2::from_shape_vec((1, 2), vec![-2.0f32, -2.0]).unwrap();
        let ac = Array2::from_shape_vec((1, 2), vec![3.0f32, 3.0]).unwrap();
        let cd = Array2::from_shape_vec((1, 2), vec![0.5f32, 0.5]).unwrap();
        let phases = vec![ab, cb, ac, cd];

        let counts = breach_counts(&loops, &phases, std::f64::consts::PI);
        assert_eq!(counts[0][[0, 0]], 0);
        assert_eq!(counts[0][[0, 1]], 1);
        assert_eq!(counts[3][[0, 1]], 0);

        let mut stats = ClosureStats::new(4);
        stats.add(&phases, &counts);
        assert_eq!(stats.breach_fraction(0), 0.5);
        assert_eq!(stats.breach_fraction(3), 0.0);

        let (masked, n) = mask_breaches(&phases, &counts, 1);
        assert_eq!(n, 3);
        assert!(masked[2][[0, 1]].is_nan());
        assert_eq!(masked[3][[0, 1]], 0.5);
    }
}
