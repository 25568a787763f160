#![cfg(feature = "gdal")]

use anyhow::Result;
use chrono::NaiveDate;
use ifgstack::config::{OrbitalModel, TileSpec};
use ifgstack::io::{write_mosaic, write_raster, GeoTiffPair, GeoTiffStack};
use ifgstack::{GeoTransform, PairMeta, ProcessingConfig, ProcessingEngine, RasterExtent, TileSource, Window};
use ndarray::Array2;

fn extent() -> RasterExtent {
    RasterExtent::new(12, 10).with_geo_transform(GeoTransform {
        top_left_x: 500000.0,
        pixel_width: 30.0,
        rotation_x: 0.0,
        top_left_y: 4200000.0,
        rotation_y: 0.0,
        pixel_height: -30.0,
    })
}

#[test]
fn test_geotiff_stack_round_trip_through_engine() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let extent = extent();
    let d = |m| NaiveDate::from_ymd_opt(2022, m, 1).unwrap();

    let mut files = Vec::new();
    for (id, first, second) in [("ab", d(1), d(3)), ("bc", d(3), d(5)), ("ac", d(1), d(5))] {
        let meta = PairMeta::new(id, first, second);
        let phase = Array2::from_elem((extent.rows, extent.cols), (4.0 * meta.time_span()) as f32);
        let path = dir.path().join(format!("{}.tif", id));
        write_raster(&path, &phase, &extent)?;
        files.push(GeoTiffPair {
            meta,
            phase: path,
            variance: None,
        });
    }

    let stack = GeoTiffStack::open(files)?;
    assert_eq!(stack.extent().rows, 12);
    assert_eq!(stack.extent().geo_transform, extent.geo_transform);
    let window = stack.read_window(2, &Window::new(4, 3, 2, 2))?;
    assert_eq!(window.phase.dim(), (2, 2));
    assert!(window.variance.is_none());

    let mut config = ProcessingConfig::default();
    config.orbital.model = OrbitalModel::None;
    config.reference.enabled = false;
    config.tiling.tile = TileSpec::Count { rows: 2, cols: 2 };
    let products = ProcessingEngine::new(config)?.run(&stack)?;
    assert!(products.stack.band("rate").unwrap().iter().all(|v| (v - 4.0).abs() < 1e-3));

    let out = dir.path().join("stack.tif");
    write_mosaic(&out, &products.stack)?;
    let dataset = gdal::Dataset::open(&out)?;
    assert_eq!(dataset.raster_count(), 4);
    assert_eq!(dataset.raster_size(), (10, 12));
    Ok(())
}

#[test]
fn test_mismatched_grid_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let d = |m| NaiveDate::from_ymd_opt(2022, m, 1).unwrap();
    let small = RasterExtent::new(5, 5);

    let a = dir.path().join("a.tif");
    let b = dir.path().join("b.tif");
    write_raster(&a, &Array2::zeros((12, 10)), &extent())?;
    write_raster(&b, &Array2::zeros((5, 5)), &small)?;

    let result = GeoTiffStack::open(vec![
        GeoTiffPair {
            meta: PairMeta::new("a", d(1), d(2)),
            phase: a,
            variance: None,
        },
        GeoTiffPair {
            meta: PairMeta::new("b", d(2), d(3)),
            phase: b,
            variance: None,
        },
    ]);
    assert!(matches!(result, Err(ifgstack::InsarError::InvalidInput(_))));
    Ok(())
}
