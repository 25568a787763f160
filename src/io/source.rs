use crate::types::{
    InsarError, InsarResult, Mask, PairMeta, PairWindow, Raster, RasterExtent, Window,
};
use ndarray::s;

/// Provider of per-pair raster windows on the common grid.
///
/// Implementations must return NaN for every invalid pixel; explicit validity
/// masks are folded into the phase when the window is read.
pub trait TileSource: Sync {
    /// Full extent of the common grid
    fn extent(&self) -> RasterExtent;

    /// Pair metadata, indexed by pair position
    fn pairs(&self) -> &[PairMeta];

    /// Read one pair over one window
    fn read_window(&self, pair: usize, window: &Window) -> InsarResult<PairWindow>;
}

/// In-memory interferogram stack
#[derive(Debug, Clone)]
pub struct IfgStack {
    extent: RasterExtent,
    pairs: Vec<PairMeta>,
    phase: Vec<Raster>,
    variance: Vec<Option<Raster>>,
}

impl IfgStack {
    pub fn new(extent: RasterExtent) -> Self {
        Self {
            extent,
            pairs: Vec::new(),
            phase: Vec::new(),
            variance: Vec::new(),
        }
    }

    /// Add a pair; pixels where `mask` is false are stored as NaN
    pub fn add_pair(
        &mut self,
        meta: PairMeta,
        mut phase: Raster,
        variance: Option<Raster>,
        mask: Option<&Mask>,
    ) -> InsarResult<()> {
        let shape = (self.extent.rows, self.extent.cols);
        if phase.dim() != shape {
            return Err(InsarError::InvalidInput(format!(
                "Pair {} phase is {:?}, expected {:?}",
                meta.id,
                phase.dim(),
                shape
            )));
        }
        if let Some(var) = &variance {
            if var.dim() != shape {
                return Err(InsarError::InvalidInput(format!(
                    "Pair {} variance is {:?}, expected {:?}",
                    meta.id,
                    var.dim(),
                    shape
                )));
            }
        }
        if let Some(mask) = mask {
            if mask.dim() != shape {
                return Err(InsarError::InvalidInput(format!(
                    "Pair {} mask is {:?}, expected {:?}",
                    meta.id,
                    mask.dim(),
                    shape
                )));
            }
            ndarray::Zip::from(&mut phase).and(mask).for_each(|p, &valid| {
                if !valid {
                    *p = f32::NAN;
                }
            });
        }

        log::debug!("Added pair {} ({} -> {})", meta.id, meta.first, meta.second);
        self.pairs.push(meta);
        self.phase.push(phase);
        self.variance.push(variance);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn phase(&self, pair: usize) -> Option<&Raster> {
        self.phase.get(pair)
    }
}

impl TileSource for IfgStack {
    fn extent(&self) -> RasterExtent {
        self.extent
    }

    fn pairs(&self) -> &[PairMeta] {
        &self.pairs
    }

    fn read_window(&self, pair: usize, window: &Window) -> InsarResult<PairWindow> {
        if !window.fits_in(&self.extent) {
            return Err(InsarError::InvalidInput(format!(
                "Window {:?} exceeds extent {}x{}",
                window, self.extent.rows, self.extent.cols
            )));
        }
        let phase = self.phase.get(pair).ok_or_else(|| {
            InsarError::InvalidInput(format!("Pair index {} out of range", pair))
        })?;
        let (r0, r1) = (window.row_off, window.row_end());
        let (c0, c1) = (window.col_off, window.col_end());
        Ok(PairWindow {
            phase: phase.slice(s![r0..r1, c0..c1]).to_owned(),
            variance: self.variance[pair]
                .as_ref()
                .map(|v| v.slice(s![r0..r1, c0..c1]).to_owned()),
        })
    }
}
