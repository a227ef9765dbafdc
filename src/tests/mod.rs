use crate::config::RunConfig;
use crate::context::RunContext;
use crate::node::Factor;
use crate::panel::Panel;
use crate::tensor::Tensor;
use chrono::NaiveDate;
use std::sync::Arc;

mod cross_section;
mod node;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn approx_eq(lhs: f64, rhs: f64) -> bool {
    lhs == rhs || (lhs.is_nan() && rhs.is_nan()) || (lhs - rhs).abs() < 1e-9
}

fn assert_values(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(approx_eq(*a, *e), "index {i}: {a} != {e} in {actual:?}");
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).expect("valid date")
}

/// `days` dates of `assets.len()` rows each, date-major like a loaded panel.
fn grid_panel(assets: &[u32], days: u32) -> Panel {
    let mut dates = Vec::new();
    let mut ids = Vec::new();
    for d in 1..=days {
        for &asset in assets {
            dates.push(day(d));
            ids.push(asset);
        }
    }
    Panel::new(dates, ids).expect("panel")
}

fn single_asset_panel(close: Vec<f64>) -> Panel {
    let days = close.len() as u32;
    grid_panel(&[1], days)
        .with_column("close", close)
        .expect("close column")
}

fn context(panel: Panel, config: RunConfig) -> Arc<RunContext> {
    let dates = panel.dates().to_vec();
    let start = dates.first().copied().unwrap_or_else(|| day(1));
    let end = dates.last().copied().unwrap_or_else(|| day(1));
    RunContext::new(panel, config, start, end).expect("context")
}

/// Full protocol for one root: prepare, compute, wait, revert to flat rows, clean up.
fn evaluate(root: &Factor, ctx: &Arc<RunContext>) -> Tensor {
    root.pre_compute(ctx).expect("prepare");
    let lane = if ctx.is_parallel() {
        Some(ctx.lanes().open().expect("main lane"))
    } else {
        None
    };
    let output = root.compute(lane.as_deref()).expect("compute");
    let grouped = output.wait().expect("output");
    let flat = ctx
        .revert(root.name(), &grouped, root.groupby())
        .expect("revert");
    root.clean_up(false);
    flat
}

fn evaluate_f64(root: &Factor, ctx: &Arc<RunContext>) -> Vec<f64> {
    evaluate(root, ctx)
        .as_f64()
        .expect("float output")
        .to_vec()
}
