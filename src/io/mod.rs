//! Tile-level access to interferogram stacks

pub mod source;
#[cfg(feature = "gdal")]
pub mod geotiff;

pub use source::{IfgStack, TileSource};
#[cfg(feature = "gdal")]
pub use geotiff::{write_mosaic, write_raster, GeoTiffPair, GeoTiffStack};
