use super::*;
use crate::context::GroupBy;
use crate::error::FactorError;
use crate::node::Operand;
use crate::ops::{KernelArgs, KernelInput};
use crate::registry::{DatetimeAttr, FactorRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Identity kernel that counts its invocations.
fn counted(input: &Factor, calls: &Arc<AtomicUsize>) -> Factor {
    let calls = Arc::clone(calls);
    Factor::custom(
        "counted",
        vec![input.into()],
        1,
        GroupBy::Asset,
        move |args: &KernelArgs<'_>, inputs: &[KernelInput]| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(inputs[0].tensor(args.node)?.clone())
        },
    )
    .expect("custom factor")
}

#[test]
fn shared_node_runs_once_for_every_consumer() {
    init_logging();
    let calls = Arc::new(AtomicUsize::new(0));
    let close = Factor::column("close");
    let shared = counted(&close, &calls);
    let plus = shared.add(1.0);
    let twice = shared.mul(2.0);
    let root = plus.add(&twice).add(&shared);

    let ctx = context(single_asset_panel(vec![1.0, 2.0, 3.0]), RunConfig::default());
    root.pre_compute(&ctx).expect("prepare");
    assert_eq!(shared.ref_count(), 3);
    let out = root.compute(None).expect("compute").wait().expect("value");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_values(out.as_f64().expect("float"), &[5.0, 9.0, 13.0]);

    assert_eq!(shared.ref_count(), 0);
    assert!(!shared.has_cache());
    root.clean_up(false);
}

#[test]
fn consumers_share_one_cached_output() {
    let calls = Arc::new(AtomicUsize::new(0));
    let shared = counted(&Factor::column("close"), &calls);
    let ctx = context(single_asset_panel(vec![1.0, 2.0]), RunConfig::default());
    shared.pre_compute(&ctx).expect("first consumer");
    shared.pre_compute(&ctx).expect("second consumer");
    let first = shared.compute(None).expect("first");
    assert!(shared.has_cache());
    let second = shared.compute(None).expect("second");
    assert!(first.same(&second));
    assert!(!shared.has_cache());
    shared.clean_up(false);
}

#[test]
fn compute_without_prepare_underflows() {
    let close = Factor::column("close");
    let err = close.compute(None).expect_err("no pre_compute");
    assert!(matches!(err, FactorError::RefCountUnderflow { .. }));
}

#[test]
fn extra_compute_call_underflows() {
    let close = Factor::column("close");
    let ctx = context(single_asset_panel(vec![1.0, 2.0]), RunConfig::default());
    close.pre_compute(&ctx).expect("prepare");
    close.compute(None).expect("compute");
    assert!(matches!(
        close.compute(None),
        Err(FactorError::RefCountUnderflow { .. })
    ));
    close.clean_up(false);
}

#[test]
fn history_adds_each_window_minus_one() {
    let a = Factor::column("close").mean(3).expect("a");
    let b = a.mean(5).expect("b");
    let c = b.add(1.0);
    assert_eq!(a.total_backwards(), 2);
    assert_eq!(c.total_backwards(), 6);
}

#[test]
fn mask_history_counts_and_resets_on_change() {
    let close = Factor::column("close");
    let node = close.add(0.0);
    assert_eq!(node.total_backwards(), 0);
    let slow = close.mean(10).expect("slow").gt(0.0);
    node.set_mask(Some(slow));
    assert_eq!(node.total_backwards(), 9);
    node.set_mask(None);
    assert_eq!(node.total_backwards(), 0);
}

#[test]
fn masked_positions_are_missing_before_the_kernel() {
    let panel = single_asset_panel(vec![1.0, 2.0, 3.0])
        .with_column("flag", vec![1.0, 0.0, 1.0])
        .expect("flag");
    let ctx = context(panel, RunConfig::default());
    let mask = Factor::column("flag").gt(0.0);

    let filtered = Factor::column("close").filter(&mask);
    assert_values(&evaluate_f64(&filtered, &ctx), &[1.0, f64::NAN, 3.0]);

    let seen = Arc::new(AtomicUsize::new(0));
    let observer = {
        let seen = Arc::clone(&seen);
        Factor::custom(
            "observer",
            vec![Operand::from(Factor::column("close"))],
            1,
            GroupBy::Asset,
            move |args: &KernelArgs<'_>, inputs: &[KernelInput]| {
                let input = inputs[0].tensor(args.node)?;
                let values = input.float_values(args.node, "observer")?;
                assert!(values[1].is_nan());
                assert!(args.mask.is_some());
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(input.clone())
            },
        )
        .expect("observer")
    };
    observer.set_mask(Some(mask));
    evaluate_f64(&observer, &ctx);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn source_nodes_honour_their_mask() {
    let panel = single_asset_panel(vec![1.0, 2.0, 3.0])
        .with_column("keep", vec![1.0, 0.0, 1.0])
        .expect("keep");
    let ctx = context(panel, RunConfig::default());
    let keep = Factor::column("keep").gt(0.5);

    let close = Factor::column("close");
    close.set_mask(Some(keep.clone()));
    assert_values(&evaluate_f64(&close, &ctx), &[1.0, f64::NAN, 3.0]);

    let day = FactorRegistry::new().datetime(DatetimeAttr::Day);
    day.set_mask(Some(keep.clone()));
    assert_values(&evaluate_f64(&day, &ctx), &[1.0, f64::NAN, 3.0]);

    let sector = Factor::classifier([(1, 4.0)], 0.0);
    sector.set_mask(Some(keep));
    assert_values(&evaluate_f64(&sector, &ctx), &[4.0, f64::NAN, 4.0]);
}

#[test]
fn float_mask_is_rejected() {
    let ctx = context(single_asset_panel(vec![1.0, 2.0]), RunConfig::default());
    let close = Factor::column("close");
    let node = close.add(1.0);
    node.set_mask(Some(close.clone()));
    node.pre_compute(&ctx).expect("prepare");
    let err = node.compute(None).expect_err("float mask");
    assert!(matches!(err, FactorError::InvalidMask { .. }));
    node.clean_up(true);
}

#[test]
fn multi_output_needs_select_before_rolling() {
    let panel = single_asset_panel(vec![1.0, 2.0, 4.0, 8.0])
        .with_column("x", vec![1.0, 2.0, 3.0, 4.0])
        .expect("x");
    let ctx = context(panel, RunConfig::default());
    let y = Factor::column("close");
    let x = Factor::column("x");
    let reg = y.linear_regression(&x, 2).expect("regression");

    let smoothed = reg.mean(2).expect("mean");
    smoothed.pre_compute(&ctx).expect("prepare");
    let err = smoothed.compute(None).expect_err("two outputs");
    assert!(matches!(err, FactorError::MultipleOutputs { outputs: 2, .. }));
    assert!(err.to_string().contains("select"));
    smoothed.clean_up(true);

    let slope = reg.select(0).expect("slope");
    let values = evaluate_f64(&slope, &ctx);
    // A single point has no spread in x, so its slope is 0.
    assert_values(&values, &[0.0, 1.0, 2.0, 4.0]);
}

#[test]
fn shift_of_bool_asks_for_upcast() {
    let ctx = context(single_asset_panel(vec![1.0, 2.0]), RunConfig::default());
    let shifted = Factor::column("close").gt(1.0).shift(1);
    shifted.pre_compute(&ctx).expect("prepare");
    let err = shifted.compute(None).expect_err("bool shift");
    assert!(matches!(err, FactorError::UnsupportedDtype { .. }));
    assert!(err.to_string().contains("to_float"));
    shifted.clean_up(true);

    let fixed = Factor::column("close").gt(1.0).to_float().shift(1);
    assert_values(&evaluate_f64(&fixed, &ctx), &[f64::NAN, 0.0]);
}

#[test]
fn kept_cache_survives_clean_up_within_a_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let kept = counted(&Factor::column("close"), &calls);
    kept.set_keep_cache(true);
    let ctx = context(single_asset_panel(vec![3.0, 4.0]), RunConfig::default());

    kept.pre_compute(&ctx).expect("prepare");
    assert_eq!(kept.ref_count(), 2);
    kept.compute(None).expect("compute");
    assert!(kept.has_cache());
    kept.clean_up(false);
    assert!(kept.has_cache());

    kept.pre_compute(&ctx).expect("prepare again");
    let again = kept.compute(None).expect("cached").wait().expect("value");
    assert_values(again.as_f64().expect("float"), &[3.0, 4.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    kept.clean_up(true);
    assert!(!kept.has_cache());

    let next_run = context(single_asset_panel(vec![3.0, 4.0]), RunConfig::default());
    evaluate(&kept, &next_run);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    kept.clean_up(true);
}

#[test]
fn cross_section_regroups_by_date_and_back() {
    let panel = grid_panel(&[1, 2, 3], 2)
        .with_column("close", vec![3.0, 1.0, 2.0, 5.0, f64::NAN, 4.0])
        .expect("close");
    let ctx = context(panel, RunConfig::default());
    let rank = Factor::column("close").rank(true);
    assert_eq!(rank.groupby(), &GroupBy::Date);
    assert_values(
        &evaluate_f64(&rank, &ctx),
        &[3.0, 1.0, 2.0, 2.0, f64::NAN, 1.0],
    );

    // Back to asset grouping: per-asset change of the date rank.
    let change = rank.sub(&rank.shift(1));
    assert_values(
        &evaluate_f64(&change, &ctx),
        &[f64::NAN, f64::NAN, f64::NAN, -1.0, f64::NAN, -1.0],
    );
}

#[test]
fn classifier_and_datetime_sources() {
    let panel = grid_panel(&[1, 2], 2)
        .with_column("close", vec![1.0; 4])
        .expect("close");
    let ctx = context(panel, RunConfig::default());

    let sector = Factor::classifier([(1, 10.0)], -1.0);
    assert!(!sector.should_delay());
    assert_values(&evaluate_f64(&sector, &ctx), &[10.0, -1.0, 10.0, -1.0]);

    let registry = FactorRegistry::new();
    let day_of_month = registry.datetime(DatetimeAttr::Day);
    assert!(!day_of_month.should_delay());
    assert_values(&evaluate_f64(&day_of_month, &ctx), &[1.0, 1.0, 2.0, 2.0]);
}

#[test]
fn custom_key_column_groups_rows() {
    let panel = grid_panel(&[1, 2, 3, 4], 1)
        .with_column("close", vec![1.0, 2.0, 3.0, 6.0])
        .and_then(|panel| panel.with_column("sector", vec![0.0, 1.0, 0.0, 1.0]))
        .expect("columns");
    let ctx = context(panel, RunConfig::default());
    let close = Factor::column("close");
    let by_sector = Factor::custom(
        "sector_demean",
        vec![close.into()],
        1,
        GroupBy::Column("sector".to_string()),
        |args: &KernelArgs<'_>, inputs: &[KernelInput]| {
            let input = inputs[0].tensor(args.node)?;
            let shape = input.shape();
            let values = input.float_values(args.node, "demean")?;
            let out = values
                .chunks(shape.cols)
                .flat_map(|row| {
                    let mean = crate::ops::stats::nanmean(row);
                    row.iter().map(move |v| v - mean)
                })
                .collect();
            Tensor::new(shape, crate::tensor::TensorData::Float(out))
        },
    )
    .expect("custom");
    assert_values(&evaluate_f64(&by_sector, &ctx), &[-1.0, -2.0, 1.0, 2.0]);

    let bad = grid_panel(&[1, 2], 1)
        .with_column("close", vec![1.0, 2.0])
        .and_then(|panel| panel.with_column("sector", vec![0.5, 1.0]))
        .expect("columns");
    let ctx = context(bad, RunConfig::default());
    assert!(matches!(
        ctx.layout(&GroupBy::Column("sector".to_string())),
        Err(FactorError::InvalidGroupKey { row: 0, .. })
    ));
}

#[test]
fn adjusted_column_uses_last_multiplier() {
    let panel = single_asset_panel(vec![10.0, 10.0, 10.0, 10.0])
        .with_column("adj", vec![1.0, 1.0, 1.0, 2.0])
        .expect("adj");
    let ctx = context(panel, RunConfig::default());
    let close = Factor::adjustable_column("close", "adj");

    let mean = close.mean(4).expect("mean");
    let values = evaluate_f64(&mean, &ctx);
    assert!(approx_eq(values[3], 6.25));

    let view = close.adjusted().expect("adjusted");
    assert_values(&evaluate_f64(&view, &ctx), &[5.0, 5.0, 5.0, 10.0]);
}

#[test]
fn parallel_lanes_match_sequential_results() {
    init_logging();
    let close_values: Vec<f64> = (0..24).map(|i| ((i * 7) % 13) as f64 + 1.0).collect();
    let build_panel = || {
        grid_panel(&[1, 2, 3], 8)
            .with_column("close", close_values.clone())
            .expect("close")
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let close = Factor::column("close");
    let shared = counted(&close.mean(3).expect("mean"), &calls);
    let left = shared.rank(false);
    let right = shared.sub(&close).std(2).expect("std").zscore();
    let root = left.add(&right).add(&shared);

    let sequential = evaluate_f64(&root, &context(build_panel(), RunConfig::default()));
    let ctx = context(build_panel(), RunConfig::parallel());
    let parallel = evaluate_f64(&root, &ctx);
    assert!(ctx.lanes().len() >= 2);
    assert_values(&parallel, &sequential);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn lane_errors_surface_through_the_output() {
    let ctx = context(single_asset_panel(vec![1.0, 2.0]), RunConfig::parallel());
    let close = Factor::column("close");
    let bad = close.gt(0.0).shift(1);
    let root = bad.add(&bad);
    root.pre_compute(&ctx).expect("prepare");
    let lane = ctx.lanes().open().expect("lane");
    let output = root.compute(Some(&lane)).expect("enqueued");
    let err = output.wait().expect_err("bool shift fails on the lane");
    assert!(matches!(err, FactorError::UnsupportedDtype { .. }));
    root.clean_up(true);
}

#[test]
fn elementwise_builders_over_one_asset() {
    let close = Factor::column("close");
    let run = |root: &Factor| {
        let ctx = context(single_asset_panel(vec![1.0, 2.0, 3.0, 4.0]), RunConfig::default());
        evaluate_f64(root, &ctx)
    };
    assert_values(&run(&close.rem(3.0)), &[1.0, 2.0, 0.0, 1.0]);
    assert_values(&run(&close.rsub(10.0)), &[9.0, 8.0, 7.0, 6.0]);
    assert_values(&run(&close.rdiv(12.0)), &[12.0, 6.0, 4.0, 3.0]);

    let inside = close.gt(1.5).logical_and(&close.lt(3.5));
    assert_values(&run(&inside.to_float()), &[0.0, 1.0, 1.0, 0.0]);
    let either = close.equals(1.0).logical_or(&close.not_equals(3.0));
    assert_values(&run(&either.to_float()), &[1.0, 1.0, 0.0, 1.0]);
    let not_first = close.equals(1.0).logical_not();
    assert_values(&run(&not_first.to_float()), &[0.0, 1.0, 1.0, 1.0]);
}

#[test]
fn weighted_zscore_centers_on_the_weighted_mean() {
    let panel = grid_panel(&[1, 2], 1)
        .with_column("close", vec![1.0, 3.0])
        .and_then(|p| p.with_column("weight", vec![3.0, 1.0]))
        .expect("columns");
    let close = Factor::column("close");
    let root = close.zscore_weighted(&Factor::column("weight"));
    let ctx = context(panel, RunConfig::default());
    assert_values(&evaluate_f64(&root, &ctx), &[-0.5, 1.5]);
}

#[test]
fn forced_delay_overrides_inputs() {
    let smooth = Factor::column("close").mean(2).expect("mean");
    assert!(smooth.should_delay());
    smooth.set_delay(Some(false));
    assert!(!smooth.should_delay());
    smooth.set_delay(None);
    assert!(smooth.should_delay());
    assert!(!FactorRegistry::new().datetime(DatetimeAttr::Day).should_delay());
}

#[test]
fn context_groups_rows_per_asset() {
    let panel = grid_panel(&[1, 2], 2)
        .with_column("close", vec![1.0, 2.0, 3.0, 4.0])
        .expect("close");
    let ctx = context(panel, RunConfig::default());
    let flat = Tensor::flat_f64(vec![1.0, 2.0, 3.0, 4.0]);
    let grouped = ctx.group_by("t", &flat, &GroupBy::Asset).expect("group");
    assert_eq!(grouped.shape().leading(), (2, 2));
    assert_values(grouped.as_f64().expect("float"), &[1.0, 3.0, 2.0, 4.0]);
    let back = ctx.revert("t", &grouped, &GroupBy::Asset).expect("revert");
    assert_eq!(back, flat);
}
