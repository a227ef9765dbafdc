mod common;

use common::{assert_values, column_of, day, init_logging, two_asset_panel};
use factor_graph::{
    DatetimeAttr, Device, Factor, FactorError, FactorRegistry, GroupBy, KernelArgs, KernelInput,
    Pipeline, RunConfig, Tensor,
};

#[test]
fn delayed_returns_are_trimmed_to_the_requested_range() {
    init_logging();
    let panel = two_asset_panel(6);
    let close = Factor::column("close");
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("mom", &close.returns(3).expect("returns"));
    pipeline.add("close", &close);

    let out = pipeline.run(&panel, day(4), day(6)).expect("run");
    assert_eq!(out.len(), 6);
    assert_eq!(out.dates().first(), Some(&day(4)));
    assert_eq!(out.assets(), &[7, 9, 7, 9, 7, 9]);

    // Value on day d uses the window ending on day d - 1.
    let mom = out.values("mom").expect("mom");
    assert_values(&column_of(mom, out.assets(), 7), &[2.0, 1.0, 2.0 / 3.0]);
    assert_values(&column_of(mom, out.assets(), 9), &[2.0, 1.0, 2.0 / 3.0]);
    let lagged = out.values("close").expect("close");
    assert_values(lagged, &[3.0, 30.0, 4.0, 40.0, 5.0, 50.0]);
}

#[test]
fn calendar_attributes_are_not_shifted() {
    let registry = FactorRegistry::new();
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("weekday", &registry.datetime(DatetimeAttr::Weekday));
    let out = pipeline
        .run(&two_asset_panel(3), day(1), day(3))
        .expect("run");
    assert_values(
        out.values("weekday").expect("weekday"),
        &[0.0, 0.0, 1.0, 1.0, 2.0, 2.0],
    );
}

#[test]
fn cross_section_rank_per_date() {
    let close = Factor::column("close");
    let volume = Factor::column("volume");
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("rank", &close.mul(&volume).rank(true));
    let out = pipeline
        .run(&two_asset_panel(5), day(2), day(5))
        .expect("run");
    let ranks = out.values("rank").expect("rank");
    for pair in ranks.chunks(2) {
        let mut sorted = pair.to_vec();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, vec![1.0, 2.0]);
    }
}

#[test]
fn filter_masks_every_root() {
    let close = Factor::column("close");
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("close", &close);
    pipeline.set_filter(Some(&close.gt(2.5)));
    let out = pipeline
        .run(&two_asset_panel(4), day(2), day(4))
        .expect("run");
    let values = out.values("close").expect("close");
    assert_values(
        &column_of(values, out.assets(), 7),
        &[f64::NAN, f64::NAN, 3.0],
    );
    assert_values(&column_of(values, out.assets(), 9), &[10.0, 20.0, 30.0]);
}

#[test]
fn parallel_device_matches_sequential() {
    init_logging();
    let close = Factor::column("close");
    let volume = Factor::column("volume");
    let vwap = close
        .mul(&volume)
        .sum(3)
        .expect("sum")
        .div(&volume.sum(3).expect("sum"));
    let spread = close.sub(&vwap);
    let build = |config: RunConfig| {
        let mut pipeline = Pipeline::new(config);
        pipeline.add("spread_rank", &spread.rank(false));
        pipeline.add("spread_z", &spread.zscore());
        pipeline.add("corr", &close.corr(&volume, 4).expect("corr"));
        pipeline
    };

    let config = RunConfig::from_toml_str("device = \"parallel\"").expect("config");
    assert_eq!(config.device, Device::Parallel);
    let panel = two_asset_panel(12);
    let a = build(RunConfig::default())
        .run(&panel, day(5), day(12))
        .expect("sequential");
    let b = build(config).run(&panel, day(5), day(12)).expect("parallel");
    for name in ["spread_rank", "spread_z", "corr"] {
        assert_values(b.values(name).expect(name), a.values(name).expect(name));
    }
}

#[test]
fn reused_graph_gives_identical_runs() {
    let close = Factor::column("close");
    let smooth = close.mean(3).expect("mean");
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("fast", &smooth);
    pipeline.add("slow", &smooth.mean(2).expect("mean"));
    let panel = two_asset_panel(8);
    let first = pipeline.run(&panel, day(4), day(8)).expect("first");
    let second = pipeline.run(&panel, day(4), day(8)).expect("second");
    for name in ["fast", "slow"] {
        assert_values(second.values(name).expect(name), first.values(name).expect(name));
    }
    assert_eq!(smooth.ref_count(), 0);
    assert!(!smooth.has_cache());
}

#[test]
fn multi_output_root_keeps_every_output() {
    let close = Factor::column("close");
    let volume = Factor::column("volume");
    let reg = close.linear_regression(&volume, 3).expect("regression");

    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("reg", &reg);
    pipeline.add("slope", &reg.select(0).expect("slope"));
    let out = pipeline
        .run(&two_asset_panel(5), day(3), day(5))
        .expect("run");
    let both = out.get("reg").expect("reg");
    assert_eq!(both.shape().depth, 2);
    assert_eq!(both.shape().rows, 6);
    let slopes: Vec<f64> = both
        .as_f64()
        .expect("float")
        .chunks(2)
        .map(|pair| pair[0])
        .collect();
    assert_values(out.values("slope").expect("slope"), &slopes);
}

#[test]
fn collaborator_errors_surface() {
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("missing", &Factor::column("open"));
    let err = pipeline
        .run(&two_asset_panel(3), day(1), day(3))
        .expect_err("no open column");
    assert!(matches!(err, FactorError::MissingColumn { .. }));

    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("close", &Factor::column("close"));
    let err = pipeline
        .run(&two_asset_panel(3), day(10), day(12))
        .expect_err("no rows");
    assert!(matches!(err, FactorError::InvalidPanel { .. }));
}

#[test]
fn graph_view_shows_the_delay_shift() {
    let close = Factor::column("close");
    let mut pipeline = Pipeline::new(RunConfig::default());
    pipeline.add("mean", &close.mean(2).expect("mean"));
    let graph = pipeline.graph();
    assert_eq!(graph.len(), 3);
    let root = graph.nodes.last().expect("root");
    assert!(root.name.starts_with("shift#"));
    let json = graph.to_json().expect("json");
    assert!(json.contains("\"win\": 2"));
}

#[test]
fn delayed_bool_root_must_be_upcast() {
    let close = Factor::column("close");
    for config in [RunConfig::default(), RunConfig::parallel()] {
        let mut pipeline = Pipeline::new(config);
        pipeline.add("up", &close.gt(2.0));
        let err = pipeline
            .run(&two_asset_panel(3), day(2), day(3))
            .expect_err("bool shift");
        assert!(matches!(err, FactorError::UnsupportedDtype { .. }));
        assert!(err.to_string().contains("to_float"));

        let mut pipeline = Pipeline::new(pipeline.config().clone());
        pipeline.add("up", &close.gt(2.0).to_float());
        let out = pipeline
            .run(&two_asset_panel(3), day(2), day(3))
            .expect("run");
        assert_values(out.values("up").expect("up"), &[0.0, 1.0, 0.0, 1.0]);
    }
}

#[test]
fn kernel_panic_fails_the_run_instead_of_hanging() {
    init_logging();
    let close = Factor::column("close");
    let broken = Factor::custom(
        "explode",
        vec![close.into()],
        1,
        GroupBy::Asset,
        |_: &KernelArgs<'_>, _: &[KernelInput]| -> Result<Tensor, FactorError> {
            panic!("kernel blew up")
        },
    )
    .expect("custom");
    // Shared by two consumers, so parallel runs put it on its own lane.
    let root = broken.add(&broken);
    for config in [RunConfig::default(), RunConfig::parallel()] {
        let mut pipeline = Pipeline::new(config);
        pipeline.add("broken", &root);
        let err = pipeline
            .run(&two_asset_panel(3), day(2), day(3))
            .expect_err("kernel panic");
        match err {
            FactorError::KernelPanicked { reason, .. } => assert!(reason.contains("blew up")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(root.ref_count(), 0);
    }
}
