//! Python module definition

use crate::config::{ProcessingConfig, TileSpec};
use crate::core::ProcessingEngine;
use crate::io::IfgStack;
use crate::types::{InsarError, PairMeta, RasterExtent};
use chrono::NaiveDate;
use ndarray::{s, Axis};
use numpy::{PyArray2, PyArray3, PyReadonlyArray3};
use pyo3::prelude::*;

fn to_py_err(e: InsarError) -> PyErr {
    match e {
        InsarError::InvalidConfig(_) | InsarError::InvalidInput(_) => {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
        }
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
    }
}

fn parse_date(value: &str) -> PyResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
        PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("Invalid date '{}': {}", value, e))
    })
}

/// Run the full pipeline on an in-memory stack.
///
/// `pairs` holds (id, first date, second date) with ISO dates, `phases` is a
/// (pair, row, col) float32 array with NaN for invalid pixels. Returns
/// displacement (epoch, row, col), rate and rate uncertainty.
#[pyfunction]
#[pyo3(signature = (pairs, phases, reference_epoch=None, tile_rows=512, tile_cols=512))]
fn run_network<'py>(
    py: Python<'py>,
    pairs: Vec<(String, String, String)>,
    phases: PyReadonlyArray3<'py, f32>,
    reference_epoch: Option<String>,
    tile_rows: usize,
    tile_cols: usize,
) -> PyResult<(&'py PyArray3<f32>, &'py PyArray2<f32>, &'py PyArray2<f32>)> {
    let phases = phases.as_array();
    let (n_pairs, rows, cols) = phases.dim();
    if n_pairs != pairs.len() {
        return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
            "{} pair descriptions for {} phase rasters",
            pairs.len(),
            n_pairs
        )));
    }

    let mut stack = IfgStack::new(RasterExtent::new(rows, cols));
    for ((id, first, second), phase) in pairs.iter().zip(phases.axis_iter(Axis(0))) {
        let meta = PairMeta::new(id.clone(), parse_date(first)?, parse_date(second)?);
        stack.add_pair(meta, phase.to_owned(), None, None).map_err(to_py_err)?;
    }

    let mut config = ProcessingConfig::default();
    config.reference_epoch = reference_epoch.as_deref().map(parse_date).transpose()?;
    config.tiling.tile = TileSpec::Size {
        rows: tile_rows,
        cols: tile_cols,
    };
    let engine = ProcessingEngine::new(config).map_err(to_py_err)?;
    let products = py.allow_threads(|| engine.run(&stack)).map_err(to_py_err)?;

    let n_epochs = products.report.epochs.len() - 1;
    let displacement = products
        .timeseries
        .data()
        .slice(s![..n_epochs, .., ..])
        .to_owned();
    let band = |name: &str| {
        products
            .stack
            .band(name)
            .map(|b| b.to_owned())
            .ok_or_else(|| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("Missing band {}", name)))
    };
    let rate = band("rate")?;
    let uncertainty = band("rate_uncertainty")?;

    Ok((
        PyArray3::from_owned_array(py, displacement),
        PyArray2::from_owned_array(py, rate),
        PyArray2::from_owned_array(py, uncertainty),
    ))
}

#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_network, m)?)?;
    Ok(())
}
