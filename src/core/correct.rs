//! Correction pipeline: global per-pair estimates and per-tile application.
//!
//! Everything that needs full-extent statistics (orbital coefficients,
//! reference values, closure breach rates, pair variances) is estimated once
//! by [`GlobalCorrections::estimate`] before tiles are dispatched. The
//! per-tile [`CorrectionPipeline`] only combines those read-only values with
//! data inside the tile and its halo.

use crate::config::{OrbitalScope, ProcessingConfig, StackWeighting};
use crate::core::aps::ApsFilter;
use crate::core::closure::{self, ClosureLoop, ClosureStats};
use crate::core::covariance::VarianceAccumulator;
use crate::core::network::{DesignMatrix, NetworkBuilder, NetworkGraph};
use crate::core::orbital::{self, NormalEquations, OrbitalSurface};
use crate::core::ref_phase;
use crate::core::tiling::{map_tiles, Tile, TileScheduler};
use crate::core::timeseries::TimeSeriesInverter;
use crate::io::TileSource;
use crate::types::{
    ExcludedPair, ExclusionReason, InsarError, InsarResult, Mask, Raster, RasterExtent, Window,
};
use ndarray::{s, Array2};

/// Per-pair corrections estimated from the full extent
#[derive(Debug, Clone)]
pub struct GlobalCorrections {
    orbital: Vec<Option<OrbitalSurface>>,
    reference_pixel: Option<(usize, usize)>,
    reference_values: Vec<Option<f64>>,
    /// Raw reference-window phase per pair, kept for tile-scope orbit fits
    reference_window: Option<Window>,
    reference_phases: Vec<Option<Raster>>,
    maxvar: Vec<f64>,
    nan_fraction: Vec<f64>,
    exclusions: Vec<ExcludedPair>,
}

impl GlobalCorrections {
    /// No corrections for `n_pairs` pairs
    pub fn identity(n_pairs: usize) -> Self {
        Self {
            orbital: vec![None; n_pairs],
            reference_pixel: None,
            reference_values: vec![None; n_pairs],
            reference_window: None,
            reference_phases: vec![None; n_pairs],
            maxvar: vec![f64::NAN; n_pairs],
            nan_fraction: vec![f64::NAN; n_pairs],
            exclusions: Vec::new(),
        }
    }

    /// Run the global pre-pass over every tile of `scheduler`.
    ///
    /// Pairs failing a global estimate are not errors: they are recorded in
    /// [`Self::exclusions`] and the caller rebuilds the network without them.
    pub fn estimate<S: TileSource + ?Sized>(
        source: &S,
        network: &NetworkGraph,
        scheduler: &TileScheduler,
        config: &ProcessingConfig,
    ) -> InsarResult<Self> {
        let mut globals = Self::identity(source.pairs().len());
        globals.exclusions = network.excluded().to_vec();

        log::info!(
            "Estimating global corrections for {} pairs over {} tiles",
            network.n_edges(),
            scheduler.tiles().len()
        );

        if config.orbital.enabled() && config.orbital.scope == OrbitalScope::Global {
            globals.estimate_orbits(source, scheduler, config)?;
        }
        if config.reference.enabled {
            globals.estimate_reference(source, config)?;
        }

        if config.closure.enabled || config.stack.weighting == StackWeighting::Vcm || config.stack.use_mst {
            globals.sweep(source, scheduler, config)?;
        }

        let newly_excluded = globals.exclusions.len() - network.excluded().len();
        log::info!(
            "Global corrections done: {} pair(s) excluded by corrections",
            newly_excluded
        );
        Ok(globals)
    }

    pub fn orbital_surface(&self, pair: usize) -> Option<&OrbitalSurface> {
        self.orbital.get(pair).and_then(|s| s.as_ref())
    }

    pub fn reference_pixel(&self) -> Option<(usize, usize)> {
        self.reference_pixel
    }

    pub fn reference_value(&self, pair: usize) -> Option<f64> {
        self.reference_values.get(pair).copied().flatten()
    }

    /// Phase variance of every pair (NaN when not estimated)
    pub fn maxvar(&self) -> &[f64] {
        &self.maxvar
    }

    /// Fraction of invalid pixels of every pair after correction (NaN when not estimated)
    pub fn nan_fraction(&self) -> &[f64] {
        &self.nan_fraction
    }

    /// Every excluded pair, network disconnection included, sorted by pair index
    pub fn exclusions(&self) -> &[ExcludedPair] {
        &self.exclusions
    }

    fn is_excluded(&self, pair: usize) -> bool {
        self.exclusions.iter().any(|e| e.pair_index == pair)
    }

    fn active_pairs(&self) -> Vec<usize> {
        (0..self.orbital.len()).filter(|&p| !self.is_excluded(p)).collect()
    }

    fn exclude(&mut self, pair: usize, id: &str, reason: ExclusionReason) {
        if self.is_excluded(pair) {
            return;
        }
        self.exclusions.push(ExcludedPair {
            pair_index: pair,
            id: id.to_string(),
            reason,
        });
        self.exclusions.sort_by_key(|e| e.pair_index);
    }

    fn estimate_orbits<S: TileSource + ?Sized>(
        &mut self,
        source: &S,
        scheduler: &TileScheduler,
        config: &ProcessingConfig,
    ) -> InsarResult<()> {
        let params = &config.orbital;
        let extent = source.extent();
        let active = self.active_pairs();
        log::info!(
            "Fitting {:?} orbital surfaces for {} pairs (stride {})",
            params.model,
            active.len(),
            params.stride
        );

        let partials = map_tiles(scheduler.tiles(), |tile| -> InsarResult<Vec<NormalEquations>> {
            active
                .iter()
                .map(|&pair| {
                    let data = source.read_window(pair, &tile.window)?;
                    let mut equations = NormalEquations::new(params.model);
                    equations.add_window(&data.phase, &tile.window, &extent, params.stride);
                    Ok(equations)
                })
                .collect()
        });

        let mut totals: Vec<NormalEquations> = active.iter().map(|_| NormalEquations::new(params.model)).collect();
        for partial in partials {
            for (total, equations) in totals.iter_mut().zip(partial?.iter()) {
                total.merge(equations);
            }
        }

        for (&pair, equations) in active.iter().zip(&totals) {
            let id = source.pairs()[pair].id.clone();
            match equations.solve(params.required_pixels(), &id) {
                Ok(surface) => self.orbital[pair] = Some(surface),
                Err(e @ (InsarError::InsufficientData { .. } | InsarError::SingularSystem { .. })) => {
                    log::warn!("{}; excluding pair {} from the network", e, id);
                    self.exclude(pair, &id, ExclusionReason::OrbitalFitFailed);
                }
                Err(e) => return Err(e),
            }
        }

        if params.method == crate::config::OrbitalMethod::Network {
            let current = NetworkBuilder::new(config.reference_epoch).build(source.pairs(), &self.exclusions)?;
            let design = DesignMatrix::from_network(&current);
            self.orbital = orbital::apply_method(
                params.method,
                &self.orbital,
                &current,
                &design,
                config.inversion.rcond,
            );
        }
        Ok(())
    }

    fn estimate_reference<S: TileSource + ?Sized>(
        &mut self,
        source: &S,
        config: &ProcessingConfig,
    ) -> InsarResult<()> {
        let params = &config.reference;
        let extent = source.extent();
        let active = self.active_pairs();

        let pixel = match params.pixel {
            Some((row, col)) => {
                if row >= extent.rows || col >= extent.cols {
                    return Err(InsarError::InvalidConfig(format!(
                        "Reference pixel ({}, {}) outside {}x{} extent",
                        row, col, extent.rows, extent.cols
                    )));
                }
                (row, col)
            }
            None => ref_phase::search_reference_pixel(source, &active, params)?,
        };
        let window = ref_phase::reference_window(pixel, params.half_window, &extent);
        log::info!(
            "Normalising {} pairs to reference pixel ({}, {}) with a {}x{} window",
            active.len(),
            pixel.0,
            pixel.1,
            window.rows,
            window.cols
        );

        let tile_scope = config.orbital.enabled() && config.orbital.scope == OrbitalScope::Tile;
        for pair in active {
            let data = source.read_window(pair, &window)?;
            let phase = match &self.orbital[pair] {
                Some(surface) => surface.remove(&data.phase, &window, &extent),
                None => data.phase,
            };
            match ref_phase::reference_value(&phase, params.min_valid_fraction) {
                Some(value) => {
                    self.reference_values[pair] = Some(value);
                    if tile_scope {
                        self.reference_phases[pair] = Some(phase);
                    }
                }
                None => {
                    let id = source.pairs()[pair].id.clone();
                    let err = InsarError::ReferencePixelInvalid {
                        pair: id.clone(),
                        row: pixel.0,
                        col: pixel.1,
                    };
                    log::warn!("{}; excluding pair from the network", err);
                    self.exclude(pair, &id, ExclusionReason::ReferencePixelInvalid);
                }
            }
        }
        self.reference_pixel = Some(pixel);
        self.reference_window = Some(window);
        Ok(())
    }

    /// One pass over all tiles collecting closure statistics and pair variances
    fn sweep<S: TileSource + ?Sized>(
        &mut self,
        source: &S,
        scheduler: &TileScheduler,
        config: &ProcessingConfig,
    ) -> InsarResult<()> {
        let closure_enabled = config.closure.enabled;
        let extent = source.extent();
        let current = NetworkBuilder::new(config.reference_epoch).build(source.pairs(), &self.exclusions)?;
        let edges = current.edges();
        let loops = if closure_enabled {
            closure::find_loops(&current)
        } else {
            Vec::new()
        };
        let this = &*self;

        let partials = map_tiles(
            scheduler.tiles(),
            |tile| -> InsarResult<(ClosureStats, Vec<VarianceAccumulator>)> {
                let mut phases = Vec::with_capacity(edges.len());
                for edge in edges {
                    let data = source.read_window(edge.pair_index, &tile.window)?;
                    let id = &source.pairs()[edge.pair_index].id;
                    let corrected = this
                        .pre_correct(edge.pair_index, id, &data.phase, &tile.window, &tile.window, &extent, config)?
                        .unwrap_or_else(|| Array2::from_elem(tile.window.dim(), f32::NAN));
                    phases.push(corrected);
                }

                let mut stats = ClosureStats::new(edges.len());
                if !loops.is_empty() {
                    let counts = closure::breach_counts(&loops, &phases, config.closure.threshold);
                    stats.add(&phases, &counts);
                }
                let mut variances = vec![VarianceAccumulator::default(); edges.len()];
                for (acc, phase) in variances.iter_mut().zip(&phases) {
                    acc.add_raster(phase);
                }
                Ok((stats, variances))
            },
        );

        let mut stats = ClosureStats::new(edges.len());
        let mut variances = vec![VarianceAccumulator::default(); edges.len()];
        for partial in partials {
            let (tile_stats, tile_variances) = partial?;
            stats.merge(&tile_stats);
            for (acc, v) in variances.iter_mut().zip(&tile_variances) {
                acc.merge(v);
            }
        }

        let pixels = extent.pixel_count() as f64;
        for (edge, acc) in edges.iter().zip(&variances) {
            self.maxvar[edge.pair_index] = acc.variance().unwrap_or(f64::NAN);
            self.nan_fraction[edge.pair_index] = 1.0 - acc.count() as f64 / pixels;
        }

        if closure_enabled {
            log::info!("Checked {} closure loops", loops.len());
            for (e, edge) in edges.iter().enumerate() {
                let fraction = stats.breach_fraction(e);
                if fraction > config.closure.max_pair_breach_fraction {
                    let id = source.pairs()[edge.pair_index].id.clone();
                    log::warn!(
                        "Pair {} breaches phase closure at {:.1}% of valid pixels; excluding it",
                        id,
                        100.0 * fraction
                    );
                    self.exclude(edge.pair_index, &id, ExclusionReason::PhaseClosure);
                }
            }
        }
        Ok(())
    }

    /// Orbital removal then reference normalisation of one pair window.
    ///
    /// `fit_window` is the part of `read_window` used for tile-scope orbital
    /// fits. `Ok(None)` means the tile-scope fit lacked data and the pair must
    /// be masked in this tile.
    #[allow(clippy::too_many_arguments)]
    pub fn pre_correct(
        &self,
        pair: usize,
        id: &str,
        phase: &Raster,
        read_window: &Window,
        fit_window: &Window,
        extent: &RasterExtent,
        config: &ProcessingConfig,
    ) -> InsarResult<Option<Raster>> {
        let params = &config.orbital;
        let mut reference = self.reference_value(pair);
        let deramped = if !params.enabled() {
            None
        } else {
            match params.scope {
                OrbitalScope::Global => self.orbital[pair]
                    .as_ref()
                    .map(|surface| surface.remove(phase, read_window, extent)),
                OrbitalScope::Tile => {
                    let (r, c) = read_window.relative(fit_window).ok_or_else(|| {
                        InsarError::Processing(format!(
                            "Fit window {:?} outside read window {:?}",
                            fit_window, read_window
                        ))
                    })?;
                    let core = phase
                        .slice(s![r..r + fit_window.rows, c..c + fit_window.cols])
                        .to_owned();
                    let surface = match orbital::fit_window(
                        params.model,
                        &core,
                        fit_window,
                        extent,
                        params.stride,
                        params.required_pixels(),
                        id,
                    ) {
                        Ok(surface) => surface,
                        Err(InsarError::InsufficientData { .. } | InsarError::SingularSystem { .. }) => {
                            return Ok(None)
                        }
                        Err(e) => return Err(e),
                    };
                    // The reference window is normalised against this tile's own surface
                    if let (Some(window), Some(raw)) = (&self.reference_window, &self.reference_phases[pair]) {
                        reference = ref_phase::reference_value(
                            &surface.remove(raw, window, extent),
                            config.reference.min_valid_fraction,
                        )
                        .or(reference);
                    }
                    Some(surface.remove(phase, read_window, extent))
                }
            }
        };

        let corrected = match (deramped, reference) {
            (Some(d), Some(v)) => ref_phase::normalise(&d, v),
            (Some(d), None) => d,
            (None, Some(v)) => ref_phase::normalise(phase, v),
            (None, None) => phase.clone(),
        };
        Ok(Some(corrected))
    }
}

/// Corrected pair rasters of one tile, in network edge order
#[derive(Debug, Clone)]
pub struct CorrectedStack {
    pub tile: Tile,
    pub phases: Vec<Raster>,
    pub variances: Vec<Option<Raster>>,
}

impl CorrectedStack {
    pub fn window(&self) -> &Window {
        &self.tile.window
    }

    /// Validity of one edge's pixels after every correction
    pub fn validity(&self, edge: usize) -> Mask {
        self.phases[edge].mapv(|v| v.is_finite())
    }

    /// Number of valid pairs per pixel
    pub fn valid_pair_count(&self) -> Array2<u16> {
        let mut count = Array2::<u16>::zeros(self.tile.window.dim());
        for phase in &self.phases {
            ndarray::Zip::from(&mut count).and(phase).for_each(|n, &v| {
                if v.is_finite() {
                    *n += 1;
                }
            });
        }
        count
    }
}

/// What the correction stages did to one tile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionReport {
    /// Pairs masked because the tile-scope orbital fit lacked data
    pub orbital_masked: Vec<String>,
    /// Pixels masked by the phase closure check (summed over pairs)
    pub closure_masked_pixels: usize,
    pub aps_applied: bool,
}

/// Per-tile correction stages driven by read-only global state
pub struct CorrectionPipeline<'a> {
    config: &'a ProcessingConfig,
    extent: RasterExtent,
    network: &'a NetworkGraph,
    globals: &'a GlobalCorrections,
    loops: Vec<ClosureLoop>,
    aps: Option<(ApsFilter, TimeSeriesInverter<'a>)>,
}

impl<'a> CorrectionPipeline<'a> {
    pub fn new(
        config: &'a ProcessingConfig,
        extent: RasterExtent,
        network: &'a NetworkGraph,
        design: &'a DesignMatrix,
        globals: &'a GlobalCorrections,
    ) -> Self {
        let loops = if config.closure.enabled {
            closure::find_loops(network)
        } else {
            Vec::new()
        };
        let aps = config.aps.enabled.then(|| {
            let years = network.epoch_years();
            (
                ApsFilter::new(config.aps.clone(), years.clone()),
                TimeSeriesInverter::unregularised(design, years, config.inversion.rcond),
            )
        });
        Self {
            config,
            extent,
            network,
            globals,
            loops,
            aps,
        }
    }

    /// Read one tile (plus halo), correct it and crop back to the tile.
    ///
    /// The source is only read; corrected rasters are new allocations.
    pub fn apply<S: TileSource + ?Sized>(
        &self,
        source: &S,
        tile: &Tile,
    ) -> InsarResult<(CorrectedStack, CorrectionReport)> {
        let read_window = tile.window.expanded(self.config.tile_halo(), &self.extent);
        let mut report = CorrectionReport::default();
        let edges = self.network.edges();

        let mut phases = Vec::with_capacity(edges.len());
        let mut variances = Vec::with_capacity(edges.len());
        for edge in edges {
            let data = source.read_window(edge.pair_index, &read_window)?;
            let id = &source.pairs()[edge.pair_index].id;
            let corrected = match self.globals.pre_correct(
                edge.pair_index,
                id,
                &data.phase,
                &read_window,
                &tile.window,
                &self.extent,
                self.config,
            )? {
                Some(phase) => phase,
                None => {
                    log::debug!("{}: orbital fit of {} lacks data, pair masked", tile.name(), id);
                    report.orbital_masked.push(id.clone());
                    Array2::from_elem(read_window.dim(), f32::NAN)
                }
            };
            phases.push(corrected);
            variances.push(data.variance);
        }

        if !self.loops.is_empty() {
            let counts = closure::breach_counts(&self.loops, &phases, self.config.closure.threshold);
            let (masked, n_masked) =
                closure::mask_breaches(&phases, &counts, self.config.closure.min_pixel_loops);
            phases = masked;
            report.closure_masked_pixels = n_masked;
        }

        if let Some((filter, inverter)) = &self.aps {
            let series = inverter.provisional_series(&phases);
            let screens = filter.estimate(&series);
            phases = filter.correct(&phases, edges, &screens);
            report.aps_applied = true;
        }

        let (r, c) = read_window.relative(&tile.window).ok_or_else(|| {
            InsarError::Processing(format!("{} is outside its read window", tile.name()))
        })?;
        let (rows, cols) = tile.window.dim();
        let crop = |raster: &Raster| raster.slice(s![r..r + rows, c..c + cols]).to_owned();

        Ok((
            CorrectedStack {
                tile: *tile,
                phases: phases.iter().map(crop).collect(),
                variances: variances.iter().map(|v| v.as_ref().map(crop)).collect(),
            },
            report,
        ))
    }
}
