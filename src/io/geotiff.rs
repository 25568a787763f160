//! GeoTIFF-backed tile source and mosaic writer.

use crate::core::merge::Mosaic;
use crate::io::TileSource;
use crate::types::{
    GeoTransform, InsarError, InsarResult, PairMeta, PairWindow, Raster, RasterExtent, Window,
};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Files of one interferometric pair
#[derive(Debug, Clone)]
pub struct GeoTiffPair {
    pub meta: PairMeta,
    pub phase: PathBuf,
    pub variance: Option<PathBuf>,
}

/// Interferogram stack stored as one single-band GeoTIFF per pair.
///
/// Datasets are opened per read so the stack can be shared across worker
/// threads.
#[derive(Debug, Clone)]
pub struct GeoTiffStack {
    extent: RasterExtent,
    pairs: Vec<PairMeta>,
    files: Vec<GeoTiffPair>,
}

impl GeoTiffStack {
    /// Open a stack; every file must share the grid of the first phase file
    pub fn open(files: Vec<GeoTiffPair>) -> InsarResult<Self> {
        let first = files
            .first()
            .ok_or_else(|| InsarError::InvalidInput("No GeoTIFF pairs supplied".to_string()))?;
        let dataset = Dataset::open(&first.phase)?;
        let (width, height) = dataset.raster_size();
        let mut extent = RasterExtent::new(height, width);
        if let Ok(gt) = dataset.geo_transform() {
            extent = extent.with_geo_transform(GeoTransform::from_gdal(gt));
        }
        log::info!(
            "Opening GeoTIFF stack of {} pairs on a {}x{} grid",
            files.len(),
            height,
            width
        );

        for pair in &files {
            for path in std::iter::once(&pair.phase).chain(pair.variance.as_ref()) {
                let size = Dataset::open(path)?.raster_size();
                if size != (width, height) {
                    return Err(InsarError::InvalidInput(format!(
                        "{} is {}x{}, expected {}x{}",
                        path.display(),
                        size.1,
                        size.0,
                        height,
                        width
                    )));
                }
            }
        }

        Ok(Self {
            extent,
            pairs: files.iter().map(|f| f.meta.clone()).collect(),
            files,
        })
    }
}

/// Read band 1 of `path` over `window`; nodata becomes NaN
fn read_window(path: &Path, window: &Window) -> InsarResult<Raster> {
    let dataset = Dataset::open(path)?;
    let band = dataset.rasterband(1)?;
    let nodata = band.no_data_value();
    let buffer = band.read_as::<f32>(
        (window.col_off as isize, window.row_off as isize),
        (window.cols, window.rows),
        (window.cols, window.rows),
        None,
    )?;
    let mut raster = Array2::from_shape_vec((window.rows, window.cols), buffer.data)
        .map_err(|e| InsarError::Processing(format!("Failed to reshape {}: {}", path.display(), e)))?;
    if let Some(nodata) = nodata.filter(|v| !v.is_nan()) {
        raster.mapv_inplace(|v| if v as f64 == nodata { f32::NAN } else { v });
    }
    Ok(raster)
}

impl TileSource for GeoTiffStack {
    fn extent(&self) -> RasterExtent {
        self.extent
    }

    fn pairs(&self) -> &[PairMeta] {
        &self.pairs
    }

    fn read_window(&self, pair: usize, window: &Window) -> InsarResult<PairWindow> {
        let files = self
            .files
            .get(pair)
            .ok_or_else(|| InsarError::InvalidInput(format!("No pair at index {}", pair)))?;
        if !window.fits_in(&self.extent) {
            return Err(InsarError::InvalidInput(format!(
                "Window {:?} outside {}x{} grid",
                window, self.extent.rows, self.extent.cols
            )));
        }
        Ok(PairWindow {
            phase: read_window(&files.phase, window)?,
            variance: files
                .variance
                .as_deref()
                .map(|path| read_window(path, window))
                .transpose()?,
        })
    }
}

fn write_bands<'b>(
    path: &Path,
    extent: &RasterExtent,
    bands: impl ExactSizeIterator<Item = (String, ndarray::ArrayView2<'b, f32>)>,
) -> InsarResult<()> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (width, height) = (extent.cols, extent.rows);
    let mut dataset = driver.create_with_band_type::<f32, _>(path, width as isize, height as isize, bands.len() as isize)?;
    if let Some(gt) = &extent.geo_transform {
        dataset.set_geo_transform(&gt.to_gdal())?;
    }

    for (i, (name, data)) in bands.enumerate() {
        dataset.set_metadata_item(&format!("BAND_{}", i + 1), &name, "")?;
        let mut band = dataset.rasterband(i as isize + 1)?;
        let buffer = Buffer::new((width, height), data.iter().cloned().collect());
        band.write((0, 0), (width, height), &buffer)?;
        band.set_no_data_value(Some(f64::NAN))?;
    }
    Ok(())
}

/// Write a single raster as a one-band float32 GeoTIFF
pub fn write_raster<P: AsRef<Path>>(path: P, raster: &Raster, extent: &RasterExtent) -> InsarResult<()> {
    if raster.dim() != (extent.rows, extent.cols) {
        return Err(InsarError::InvalidInput(format!(
            "Raster is {:?}, extent is {}x{}",
            raster.dim(),
            extent.rows,
            extent.cols
        )));
    }
    write_bands(path.as_ref(), extent, std::iter::once(("band".to_string(), raster.view())))
}

/// Write every band of a mosaic (plus a coverage band when incomplete)
pub fn write_mosaic<P: AsRef<Path>>(path: P, mosaic: &Mosaic) -> InsarResult<()> {
    log::info!(
        "Writing {}-band mosaic to {}",
        mosaic.band_names().len(),
        path.as_ref().display()
    );
    let coverage = (!mosaic.is_complete()).then(|| mosaic.coverage().mapv(|c| if c { 1.0f32 } else { 0.0 }));
    if coverage.is_some() {
        log::warn!("Mosaic is incomplete; adding a coverage band");
    }

    let mut bands: Vec<(String, ndarray::ArrayView2<f32>)> = mosaic
        .band_names()
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), mosaic.data().index_axis(ndarray::Axis(0), i)))
        .collect();
    if let Some(coverage) = &coverage {
        bands.push(("coverage".to_string(), coverage.view()));
    }
    write_bands(path.as_ref(), mosaic.extent(), bands.into_iter())
}
