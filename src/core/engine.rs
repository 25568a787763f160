//! Run orchestration: network, global corrections, tile dispatch and merge.

use crate::config::{ProcessingConfig, StackWeighting};
use crate::core::correct::{CorrectionPipeline, CorrectionReport, GlobalCorrections};
use crate::core::covariance::pair_vcm;
use crate::core::merge::{Mosaic, TileMerger};
use crate::core::network::{DesignMatrix, NetworkBuilder, NetworkGraph};
use crate::core::stack::{StackEstimator, StackStats, STACK_BANDS};
use crate::core::tiling::{map_tiles, Tile, TileScheduler};
use crate::core::timeseries::{InversionStats, TimeSeriesInverter, TimeSeriesResult};
use crate::io::TileSource;
use crate::types::{ExcludedPair, InsarError, InsarResult, RasterStack};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Statistics of one successfully processed tile
#[derive(Debug, Clone, Serialize)]
pub struct TileReport {
    pub tile: String,
    pub attempts: usize,
    pub orbital_masked: Vec<String>,
    pub closure_masked_pixels: usize,
    pub aps_applied: bool,
    pub solved_pixels: usize,
    pub singular_pixels: usize,
    pub insufficient_pixels: usize,
    pub pixel_systems: usize,
    pub stacked_pixels: usize,
    pub stack_masked_pixels: usize,
    pub stack_rejected: usize,
}

impl TileReport {
    fn new(tile: &Tile, attempts: usize, corrections: CorrectionReport, inversion: InversionStats, stack: StackStats) -> Self {
        Self {
            tile: tile.name(),
            attempts,
            orbital_masked: corrections.orbital_masked,
            closure_masked_pixels: corrections.closure_masked_pixels,
            aps_applied: corrections.aps_applied,
            solved_pixels: inversion.solved,
            singular_pixels: inversion.singular,
            insufficient_pixels: inversion.insufficient,
            pixel_systems: inversion.systems,
            stacked_pixels: stack.estimated,
            stack_masked_pixels: stack.masked,
            stack_rejected: stack.rejected,
        }
    }
}

/// A tile that never produced output
#[derive(Debug, Clone, Serialize)]
pub struct TileFailure {
    pub tile: String,
    pub attempts: usize,
    pub message: String,
}

/// Everything needed to diagnose a run without re-running it
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub epochs: Vec<NaiveDate>,
    pub reference_epoch: NaiveDate,
    pub reference_pixel: Option<(usize, usize)>,
    pub pairs_used: usize,
    pub excluded: Vec<ExcludedPair>,
    pub tiles: Vec<TileReport>,
    pub failed: Vec<TileFailure>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Final products of a run
#[derive(Debug, Clone)]
pub struct RunProducts {
    /// Displacement per non-reference epoch, quality and linear-fit bands
    pub timeseries: Mosaic,
    /// Rate, uncertainty, chi-square and pair count bands
    pub stack: Mosaic,
    pub report: RunReport,
}

/// Per-tile output before merging
struct TileOutput {
    tile: Tile,
    timeseries: RasterStack,
    stack: RasterStack,
    report: TileReport,
}

/// Read-only state shared by every tile worker
struct RunContext<'a> {
    pipeline: CorrectionPipeline<'a>,
    inverter: TimeSeriesInverter<'a>,
    stack: StackEstimator<'a>,
}

impl RunContext<'_> {
    fn process_tile<S: TileSource + ?Sized>(&self, source: &S, tile: &Tile, attempts: usize) -> InsarResult<TileOutput> {
        let (corrected, corrections) = self.pipeline.apply(source, tile)?;
        let series = self.inverter.invert(tile.window, &corrected.phases);
        let rates = self.stack.estimate(&corrected);
        Ok(TileOutput {
            tile: *tile,
            timeseries: series.to_bands(),
            stack: rates.to_bands(),
            report: TileReport::new(tile, attempts, corrections, series.stats, rates.stats),
        })
    }
}

/// Tiled correction, inversion and stacking engine
#[derive(Debug, Clone)]
pub struct ProcessingEngine {
    config: ProcessingConfig,
}

impl ProcessingEngine {
    pub fn new(config: ProcessingConfig) -> InsarResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// Process every tile of `source` and merge the results.
    pub fn run<S: TileSource + ?Sized>(&self, source: &S) -> InsarResult<RunProducts> {
        let extent = source.extent();
        let scheduler = TileScheduler::new(extent, self.config.tiling.tile, self.config.tiling.workers)?;

        log::info!(
            "🚀 Processing {} pairs over a {}x{} grid with {} worker(s)",
            source.pairs().len(),
            extent.rows,
            extent.cols,
            scheduler.workers()
        );

        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(scheduler.workers())
                .build()
                .map_err(|e| InsarError::Processing(format!("Failed to build worker pool: {}", e)))?;
            pool.install(|| self.run_scheduled(source, &scheduler))
        }
        #[cfg(not(feature = "parallel"))]
        {
            self.run_scheduled(source, &scheduler)
        }
    }

    fn run_scheduled<S: TileSource + ?Sized>(&self, source: &S, scheduler: &TileScheduler) -> InsarResult<RunProducts> {
        let config = &self.config;
        let extent = source.extent();
        let builder = NetworkBuilder::new(config.reference_epoch);

        let initial = builder.build(source.pairs(), &[])?;
        let globals = GlobalCorrections::estimate(source, &initial, scheduler, config)?;
        let network = if globals.exclusions().len() > initial.excluded().len() {
            log::info!("Rebuilding network without {} excluded pair(s)", globals.exclusions().len());
            builder.build(source.pairs(), globals.exclusions())?
        } else {
            initial
        };
        let design = DesignMatrix::from_network(&network);

        let vcm = (config.stack.weighting == StackWeighting::Vcm).then(|| pair_vcm(&network, globals.maxvar()));
        let mst_weights = config.stack.use_mst.then(|| {
            network
                .edges()
                .iter()
                .map(|e| globals.nan_fraction()[e.pair_index])
                .collect::<Vec<f64>>()
        });

        let context = RunContext {
            pipeline: CorrectionPipeline::new(config, extent, &network, &design, &globals),
            inverter: TimeSeriesInverter::new(&design, network.epoch_years(), config.min_valid_pairs, &config.inversion),
            stack: StackEstimator::new(&network, config, vcm, mst_weights),
        };

        log::info!(
            "Dispatching {} tiles: {} epochs, {} pairs, {} unknowns",
            scheduler.tiles().len(),
            network.epochs().len(),
            network.n_edges(),
            design.n_unknowns()
        );

        let cancelled = AtomicBool::new(false);
        let outcomes = map_tiles(scheduler.tiles(), |tile| {
            self.process_with_retries(&context, source, tile, &cancelled)
        });

        // Barrier passed: every tile has completed or failed permanently
        let mut outputs = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(output) => outputs.push(output),
                Err((failure, error)) => {
                    log::warn!("{} failed after {} attempt(s): {}", failure.tile, failure.attempts, failure.message);
                    failed.push(failure);
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        if config.execution.fail_fast {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        let products = self.merge(scheduler, &network, outputs, failed, &globals)?;
        log::info!(
            "✅ Run finished: {} tiles merged, {} failed",
            products.report.tiles.len(),
            products.report.failed.len()
        );
        Ok(products)
    }

    fn process_with_retries<S: TileSource + ?Sized>(
        &self,
        context: &RunContext<'_>,
        source: &S,
        tile: &Tile,
        cancelled: &AtomicBool,
    ) -> Result<TileOutput, (TileFailure, InsarError)> {
        let max_attempts = 1 + self.config.execution.max_retries;
        let mut attempts = 0;
        loop {
            if cancelled.load(Ordering::Relaxed) {
                let message = "cancelled after a sibling tile failed".to_string();
                return Err((
                    TileFailure {
                        tile: tile.name(),
                        attempts,
                        message: message.clone(),
                    },
                    InsarError::Processing(format!("{}: {}", tile.name(), message)),
                ));
            }
            attempts += 1;
            log::debug!("Processing {} (attempt {})", tile.name(), attempts);
            match context.process_tile(source, tile, attempts) {
                Ok(output) => return Ok(output),
                Err(e) if attempts < max_attempts => {
                    log::warn!("{} attempt {} failed: {}; retrying", tile.name(), attempts, e);
                }
                Err(e) => {
                    if self.config.execution.fail_fast {
                        cancelled.store(true, Ordering::Relaxed);
                    }
                    return Err((
                        TileFailure {
                            tile: tile.name(),
                            attempts,
                            message: e.to_string(),
                        },
                        e,
                    ));
                }
            }
        }
    }

    fn merge(
        &self,
        scheduler: &TileScheduler,
        network: &NetworkGraph,
        outputs: Vec<TileOutput>,
        failed: Vec<TileFailure>,
        globals: &GlobalCorrections,
    ) -> InsarResult<RunProducts> {
        let labels: Vec<String> = network
            .epochs()
            .dates()
            .iter()
            .enumerate()
            .filter(|(e, _)| *e != network.reference_epoch())
            .map(|(_, d)| d.format("%Y%m%d").to_string())
            .collect();

        let mut timeseries = TileMerger::new(scheduler, TimeSeriesResult::band_names(&labels));
        let mut stack = TileMerger::new(scheduler, STACK_BANDS.iter().map(|s| s.to_string()).collect());
        let mut tiles = Vec::with_capacity(outputs.len());
        for output in outputs {
            timeseries.place(&output.tile, &output.timeseries)?;
            stack.place(&output.tile, &output.stack)?;
            tiles.push(output.report);
        }

        let allow_partial = self.config.merge.allow_partial;
        let report = RunReport {
            epochs: network.epochs().dates().to_vec(),
            reference_epoch: network.reference_date(),
            reference_pixel: globals.reference_pixel(),
            pairs_used: network.n_edges(),
            excluded: network.excluded().to_vec(),
            tiles,
            failed,
        };
        Ok(RunProducts {
            timeseries: timeseries.finish(allow_partial)?,
            stack: stack.finish(allow_partial)?,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrbitalModel, TileSpec};
    use crate::io::IfgStack;
    use crate::types::{PairMeta, PairWindow, RasterExtent, Window};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, m, d).unwrap()
    }

    /// Uniform 5 rad/yr motion on every pixel of a small four-epoch network
    fn linear_stack(extent: RasterExtent) -> IfgStack {
        let mut stack = IfgStack::new(extent);
        let pairs = [
            ("a", date(1, 1), date(3, 1)),
            ("b", date(3, 1), date(5, 1)),
            ("c", date(5, 1), date(7, 1)),
            ("d", date(1, 1), date(7, 1)),
        ];
        for (id, first, second) in pairs {
            let meta = PairMeta::new(id, first, second);
            let phase = Array2::from_elem((extent.rows, extent.cols), (5.0 * meta.time_span()) as f32);
            stack.add_pair(meta, phase, None, None).unwrap();
        }
        stack
    }

    fn config() -> ProcessingConfig {
        let mut config = ProcessingConfig::default();
        config.orbital.model = OrbitalModel::None;
        // uniform motion would vanish under reference normalisation
        config.reference.enabled = false;
        config.tiling.tile = TileSpec::Count { rows: 2, cols: 2 };
        config.tiling.workers = 2;
        config
    }

    #[test]
    fn test_uniform_motion_recovered() {
        let stack = linear_stack(RasterExtent::new(6, 6));
        let products = ProcessingEngine::new(config()).unwrap().run(&stack).unwrap();
        let rate = products.stack.band("rate").unwrap();
        assert!(rate.iter().all(|v| (v - 5.0).abs() < 1e-4));
        let ts_rate = products.timeseries.band("linear_rate").unwrap();
        assert!(ts_rate.iter().all(|v| (v - 5.0).abs() < 1e-4));

        let last = products.timeseries.band("displacement_20220701").unwrap();
        let span = PairMeta::new("x", date(1, 1), date(7, 1)).time_span();
        assert_abs_diff_eq!(last[[3, 4]], (5.0 * span) as f32, epsilon = 1e-4);
        assert_eq!(products.report.tiles.len(), 4);
        assert!(products.report.is_complete());
    }

    /// Source whose reads fail inside one region
    struct FlakySource {
        inner: IfgStack,
        broken: Window,
    }

    impl TileSource for FlakySource {
        fn extent(&self) -> RasterExtent {
            self.inner.extent()
        }

        fn pairs(&self) -> &[PairMeta] {
            self.inner.pairs()
        }

        fn read_window(&self, pair: usize, window: &Window) -> InsarResult<PairWindow> {
            if window == &self.broken {
                return Err(InsarError::Processing("simulated read failure".to_string()));
            }
            self.inner.read_window(pair, window)
        }
    }

    #[test]
    fn test_failed_tile_reported_and_mosaic_incomplete() {
        let source = FlakySource {
            inner: linear_stack(RasterExtent::new(6, 6)),
            broken: Window::new(3, 3, 3, 3),
        };
        let result = ProcessingEngine::new(config()).unwrap().run(&source);
        assert!(matches!(result, Err(InsarError::IncompleteMosaic { ref missing }) if missing.len() == 1));

        let mut partial = config();
        partial.merge.allow_partial = true;
        let products = ProcessingEngine::new(partial).unwrap().run(&source).unwrap();
        assert_eq!(products.report.failed.len(), 1);
        assert_eq!(products.report.failed[0].attempts, 2);
        assert!(!products.stack.is_complete());
        assert!(products.stack.band("rate").unwrap()[[5, 5]].is_nan());
        assert!((products.stack.band("rate").unwrap()[[0, 0]] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_fail_fast_returns_tile_error() {
        let source = FlakySource {
            inner: linear_stack(RasterExtent::new(6, 6)),
            broken: Window::new(0, 3, 3, 3),
        };
        let mut cfg = config();
        cfg.execution.fail_fast = true;
        let result = ProcessingEngine::new(cfg).unwrap().run(&source);
        assert!(matches!(result, Err(InsarError::Processing(_))));
    }
}
