use anyhow::Result;
use chrono::NaiveDate;
use ifgstack::config::TileSpec;
use ifgstack::core::{DesignMatrix, NetworkBuilder};
use ifgstack::{
    ExcludedPair, ExclusionReason, IfgStack, InsarError, PairMeta, ProcessingConfig,
    ProcessingEngine, RasterExtent,
};
use ndarray::Array2;

fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, month, day).unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two disjoint triangles: {Jan 1, Jan 13, Jan 25} and {Mar 1, Mar 13, Mar 25}
fn two_clusters() -> Vec<PairMeta> {
    vec![
        PairMeta::new("a1", date(1, 1), date(1, 13)),
        PairMeta::new("a2", date(1, 13), date(1, 25)),
        PairMeta::new("a3", date(1, 1), date(1, 25)),
        PairMeta::new("b1", date(3, 1), date(3, 13)),
        PairMeta::new("b2", date(3, 13), date(3, 25)),
        PairMeta::new("b3", date(3, 1), date(3, 25)),
        PairMeta::new("b4", date(3, 25), date(4, 6)),
    ]
}

#[test]
fn test_pinned_reference_keeps_its_component() -> Result<()> {
    init_logging();
    let pairs = two_clusters();
    let network = NetworkBuilder::new(Some(date(1, 13))).build(&pairs, &[])?;

    assert_eq!(network.reference_date(), date(1, 13));
    assert_eq!(network.n_edges(), 3);
    assert_eq!(network.epochs().len(), 3);
    let excluded: Vec<&str> = network.excluded().iter().map(|e| e.id.as_str()).collect();
    assert_eq!(excluded, vec!["b1", "b2", "b3", "b4"]);
    assert!(network
        .excluded()
        .iter()
        .all(|e| e.reason == ExclusionReason::Disconnected));
    Ok(())
}

#[test]
fn test_largest_component_chosen_without_reference() -> Result<()> {
    init_logging();
    let pairs = two_clusters();
    let network = NetworkBuilder::new(None).build(&pairs, &[])?;

    // March cluster has four epochs; its earliest epoch becomes the reference
    assert_eq!(network.epochs().len(), 4);
    assert_eq!(network.reference_date(), date(3, 1));
    assert_eq!(network.excluded().len(), 3);

    let design = DesignMatrix::from_network(&network);
    assert_eq!(design.n_rows(), 4);
    assert_eq!(design.n_unknowns(), 3);
    Ok(())
}

#[test]
fn test_isolated_reference_epoch_is_an_error() {
    init_logging();
    let pairs = vec![
        PairMeta::new("ab", date(1, 1), date(1, 13)),
        PairMeta::new("bc", date(1, 13), date(1, 25)),
        PairMeta::new("cd", date(1, 25), date(2, 6)),
    ];
    let pre_excluded = vec![ExcludedPair {
        pair_index: 0,
        id: "ab".to_string(),
        reason: ExclusionReason::ReferencePixelInvalid,
    }];
    let result = NetworkBuilder::new(Some(date(1, 1))).build(&pairs, &pre_excluded);
    match result {
        Err(InsarError::DisconnectedNetwork {
            component_epochs,
            excluded,
            ..
        }) => {
            assert_eq!(component_epochs, 1);
            assert!(excluded.contains(&"bc".to_string()));
        }
        other => panic!("expected a disconnected network, got {:?}", other.map(|n| n.n_edges())),
    }
}

#[test]
fn test_unknown_reference_epoch_rejected() {
    let pairs = two_clusters();
    let result = NetworkBuilder::new(Some(date(6, 1))).build(&pairs, &[]);
    assert!(matches!(result, Err(InsarError::InvalidConfig(_))));
}

#[test]
fn test_engine_reports_disconnected_pairs() -> Result<()> {
    init_logging();
    let extent = RasterExtent::new(8, 8);
    let mut stack = IfgStack::new(extent);
    for meta in two_clusters() {
        let value = (3.0 * meta.time_span()) as f32;
        stack.add_pair(meta, Array2::from_elem((8, 8), value), None, None)?;
    }

    let mut config = ProcessingConfig::default();
    config.reference_epoch = Some(date(1, 1));
    config.reference.enabled = false;
    config.orbital.model = ifgstack::config::OrbitalModel::None;
    config.tiling.tile = TileSpec::Count { rows: 2, cols: 1 };

    let products = ProcessingEngine::new(config)?.run(&stack)?;
    assert_eq!(products.report.pairs_used, 3);
    assert_eq!(products.report.excluded.len(), 4);
    assert_eq!(products.report.epochs, vec![date(1, 1), date(1, 13), date(1, 25)]);
    assert_eq!(
        products.timeseries.band_names()[..2],
        ["displacement_20230113".to_string(), "displacement_20230125".to_string()]
    );
    let rate = products.stack.band("rate").unwrap();
    assert!(rate.iter().all(|v| (v - 3.0).abs() < 1e-3));
    Ok(())
}
