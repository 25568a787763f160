use crate::config::ReferenceParams;
use crate::io::TileSource;
use crate::types::{InsarError, InsarResult, Raster, RasterExtent, Window};
use num_traits::Float;

/// Median of the finite values; `None` when there are none.
///
/// Reorders `values` in place.
pub fn nan_median<T: Float>(values: &mut Vec<T>) -> Option<T> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    let two = T::one() + T::one();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / two
    })
}

/// Square window centred on the reference pixel, clamped to the extent
pub fn reference_window(pixel: (usize, usize), half_window: usize, extent: &RasterExtent) -> Window {
    Window::new(pixel.0, pixel.1, 1, 1).expanded(half_window, extent)
}

/// Reference value of one pair: median of the reference window.
///
/// `None` when the fraction of valid pixels is below `min_valid_fraction` or
/// no pixel is valid at all.
pub fn reference_value(window_phase: &Raster, min_valid_fraction: f64) -> Option<f64> {
    let total = window_phase.len();
    let mut values: Vec<f64> = window_phase
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| v as f64)
        .collect();
    if values.is_empty() || (values.len() as f64) < min_valid_fraction * total as f64 {
        return None;
    }
    nan_median(&mut values)
}

/// Copy of `phase` with `value` subtracted from every valid pixel
pub fn normalise(phase: &Raster, value: f64) -> Raster {
    phase.mapv(|v| if v.is_finite() { (v as f64 - value) as f32 } else { v })
}

/// Sample standard deviation of the finite values
fn nan_std(values: &Raster) -> Option<f64> {
    let valid: Vec<f64> = values.iter().filter(|v| v.is_finite()).map(|&v| v as f64).collect();
    if valid.len() < 2 {
        return None;
    }
    let mean = valid.iter().sum::<f64>() / valid.len() as f64;
    let var = valid.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (valid.len() - 1) as f64;
    Some(var.sqrt())
}

/// Pick a reference pixel on a regular candidate grid.
///
/// A candidate qualifies when its window satisfies `min_valid_fraction` in
/// every pair of `pairs`; among those, the one with the lowest mean window
/// standard deviation wins (first in row-major order on ties).
pub fn search_reference_pixel<S: TileSource + ?Sized>(
    source: &S,
    pairs: &[usize],
    params: &ReferenceParams,
) -> InsarResult<(usize, usize)> {
    let extent = source.extent();
    let step = params.search_step.max(1);
    let first = params.half_window.min(extent.rows.saturating_sub(1));
    let first_col = params.half_window.min(extent.cols.saturating_sub(1));

    log::info!(
        "Searching reference pixel on a {}-pixel grid over {} pairs",
        step,
        pairs.len()
    );

    let mut best: Option<((usize, usize), f64)> = None;
    for row in (first..extent.rows).step_by(step) {
        for col in (first_col..extent.cols).step_by(step) {
            let window = reference_window((row, col), params.half_window, &extent);
            let mut score = 0.0;
            let mut qualifies = true;
            for &pair in pairs {
                let data = source.read_window(pair, &window)?;
                if reference_value(&data.phase, params.min_valid_fraction).is_none() {
                    qualifies = false;
                    break;
                }
                score += nan_std(&data.phase).unwrap_or(0.0);
            }
            if !qualifies {
                continue;
            }
            let score = score / pairs.len().max(1) as f64;
            if best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some(((row, col), score));
            }
        }
    }

    match best {
        Some((pixel, score)) => {
            log::info!(
                "Selected reference pixel ({}, {}) with mean window std {:.4}",
                pixel.0,
                pixel.1,
                score
            );
            Ok(pixel)
        }
        None => Err(InsarError::InvalidInput(
            "No candidate reference pixel is valid in every pair".to_string(),
        )),
    }
}
