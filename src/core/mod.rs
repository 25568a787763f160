//! Network correction and inversion modules

pub mod aps;
pub mod closure;
pub mod correct;
pub mod covariance;
pub mod engine;
pub mod linalg;
pub mod merge;
pub mod network;
pub mod orbital;
pub mod ref_phase;
pub mod stack;
pub mod tiling;
pub mod timeseries;

// Re-export main types
pub use correct::{CorrectedStack, CorrectionPipeline, CorrectionReport, GlobalCorrections};
pub use engine::{ProcessingEngine, RunProducts, RunReport, TileFailure, TileReport};
pub use merge::{Mosaic, TileMerger};
pub use network::{DesignMatrix, EpochSet, NetworkBuilder, NetworkEdge, NetworkGraph, PairMask};
pub use orbital::{NormalEquations, OrbitalSurface};
pub use stack::{PixelRate, StackEstimator, StackResult, STACK_BANDS};
pub use tiling::{Tile, TileScheduler};
pub use timeseries::{InversionStats, PixelStatus, SystemArena, TimeSeriesInverter, TimeSeriesResult};
