use super::*;
use crate::context::GroupBy;
use crate::error::FactorError;

/// Four assets over two dates; assets 1 and 2 sit in sector 1, assets 3 and 4 in sector 2.
fn sector_panel() -> Panel {
    grid_panel(&[1, 2, 3, 4], 2)
        .with_column("close", vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0])
        .and_then(|p| p.with_column("sector", vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]))
        .expect("columns")
}

#[test]
fn top_and_bottom_pick_by_rank() {
    let panel = grid_panel(&[1, 2, 3], 1)
        .with_column("close", vec![3.0, 1.0, 2.0])
        .expect("close");
    let close = Factor::column("close");
    let ctx = context(panel.clone(), RunConfig::default());
    assert_values(&evaluate_f64(&close.top(1).to_float(), &ctx), &[1.0, 0.0, 0.0]);
    let ctx = context(panel, RunConfig::default());
    assert_values(&evaluate_f64(&close.bottom(2).to_float(), &ctx), &[0.0, 1.0, 1.0]);
}

#[test]
fn one_hot_encodes_each_distinct_value() {
    let close = Factor::column("close");
    let encoded = close.one_hot();
    let ctx = context(
        single_asset_panel(vec![2.0, 1.0, 2.0, f64::NAN]),
        RunConfig::default(),
    );
    let out = evaluate(&encoded, &ctx);
    assert_eq!(out.shape().depth, 2);
    assert_eq!(
        out.as_bool(),
        Some(&[false, true, true, false, false, true, false, false][..])
    );

    let ctx = context(
        single_asset_panel(vec![2.0, 1.0, 2.0, f64::NAN]),
        RunConfig::default(),
    );
    let twos = encoded.select(1).expect("select").to_float();
    assert_values(&evaluate_f64(&twos, &ctx), &[1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn one_hot_of_missing_data_fails() {
    let ctx = context(single_asset_panel(vec![f64::NAN; 3]), RunConfig::default());
    let encoded = Factor::column("close").one_hot();
    encoded.pre_compute(&ctx).expect("prepare");
    let err = encoded.compute(None).expect_err("nothing to encode");
    assert!(matches!(err, FactorError::InvalidParam { param: "inputs", .. }));
    encoded.clean_up(true);
}

#[test]
fn demean_within_groups_each_date_separately() {
    // Asset 4 is unmapped and falls into the default group alone.
    let sectors = Factor::classifier([(1, 1.0), (2, 1.0), (3, 2.0)], 9.0);
    let root = Factor::column("close").demean_within(&sectors);
    let ctx = context(sector_panel(), RunConfig::default());
    assert_values(
        &evaluate_f64(&root, &ctx),
        &[-0.5, 0.5, 0.0, 0.0, -5.0, 5.0, 0.0, 0.0],
    );
}

#[test]
fn demean_by_column_groups_across_dates() {
    let root = Factor::column("close").demean_by(GroupBy::Column("sector".to_string()));
    let ctx = context(sector_panel(), RunConfig::default());
    assert_values(
        &evaluate_f64(&root, &ctx),
        &[-7.25, -6.25, -16.25, -15.25, 1.75, 11.75, 10.75, 20.75],
    );
}

#[test]
fn zscore_and_quantile_accept_a_grouping() {
    let close = Factor::column("close");
    let z = close.zscore_by(GroupBy::Whole);
    assert_eq!(z.groupby(), &GroupBy::Whole);
    let ctx = context(sector_panel(), RunConfig::default());
    let values = evaluate_f64(&z, &ctx);
    assert!(approx_eq(values.iter().sum::<f64>(), 0.0));
    assert!(values[7] > values[6] && values[0] < values[1]);

    let halves = close.quantile_by(2, GroupBy::Whole).expect("quantile");
    let ctx = context(sector_panel(), RunConfig::default());
    assert_values(
        &evaluate_f64(&halves, &ctx),
        &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
    );
}

#[test]
fn winsorize_cuts_count_present_values_only() {
    // Four present values: z = 0.2 keeps the 1st and 2nd order statistics as the cuts.
    let panel = grid_panel(&[1, 2, 3, 4, 5, 6], 1)
        .with_column("close", vec![1.0, 2.0, 3.0, 4.0, f64::NAN, f64::NAN])
        .expect("close");
    let ctx = context(panel, RunConfig::default());
    let root = Factor::column("close").winsorize(0.2).expect("winsorize");
    assert_values(
        &evaluate_f64(&root, &ctx),
        &[1.0, 2.0, 2.0, 2.0, f64::NAN, f64::NAN],
    );
}

#[test]
fn panel_winsorize_shares_cuts_across_dates() {
    let panel = grid_panel(&[1, 2, 3], 2)
        .with_column("close", vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0])
        .expect("close");
    let ctx = context(panel, RunConfig::default());
    let root = Factor::column("close").winsorize_panel(0.2).expect("winsorize");
    assert_values(&evaluate_f64(&root, &ctx), &[2.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
}
