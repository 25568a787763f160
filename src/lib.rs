//! ifgstack: tiled InSAR network correction, time series inversion and rate stacking
//!
//! Turns an irregular network of unwrapped interferograms into per-epoch
//! cumulative displacement and secular rate maps. Rasters are split into tiles
//! processed in parallel against one read-only network and set of global
//! corrections, then reassembled into full-extent mosaics.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use config::ProcessingConfig;
pub use core::{Mosaic, ProcessingEngine, RunProducts, RunReport};
pub use io::{IfgStack, TileSource};
pub use types::{
    ExcludedPair, ExclusionReason, GeoTransform, InsarError, InsarResult, PairMeta, Raster,
    RasterExtent, Window,
};
