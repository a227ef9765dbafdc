#![allow(dead_code)]

use chrono::NaiveDate;
use factor_graph::Panel;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn approx_eq(lhs: f64, rhs: f64) -> bool {
    lhs == rhs || (lhs.is_nan() && rhs.is_nan()) || (lhs - rhs).abs() < 1e-9
}

pub fn assert_values(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(approx_eq(*a, *e), "index {i}: {a} != {e} in {actual:?}");
    }
}

/// 2024-01-01 is a Monday.
pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).expect("valid date")
}

/// Assets 7 and 9 over `days` dates; asset 9 trades at ten times asset 7.
pub fn two_asset_panel(days: u32) -> Panel {
    let mut dates = Vec::new();
    let mut assets = Vec::new();
    let mut close = Vec::new();
    let mut volume = Vec::new();
    for d in 1..=days {
        for (asset, scale) in [(7, 1.0), (9, 10.0)] {
            dates.push(day(d));
            assets.push(asset);
            close.push(f64::from(d) * scale);
            volume.push(f64::from((d * 37 + asset) % 11) + 1.0);
        }
    }
    Panel::new(dates, assets)
        .and_then(|panel| panel.with_column("close", close))
        .and_then(|panel| panel.with_column("volume", volume))
        .expect("panel")
}

/// Values of `asset` in row order.
pub fn column_of(values: &[f64], assets: &[u32], asset: u32) -> Vec<f64> {
    values
        .iter()
        .zip(assets)
        .filter(|(_, &a)| a == asset)
        .map(|(v, _)| *v)
        .collect()
}
