//! NaN-aware reductions over contiguous slices.
//!
//! Grouped data is row-major, so a cross-section (one group's row) and a rolling
//! window (one cell's history) are both contiguous slices; every kernel here works on
//! `&[f64]` and the row helpers fan slices out over rayon.

use rayon::prelude::*;

/// Offset used by the even-mean kth selector to pick the adjacent rank.
///
/// `floor(kth + 0.6)` moves to the next rank once the fractional position reaches 0.4,
/// so a median over an even count averages the two middle values.
pub const EVEN_MEAN_OFFSET: f64 = 0.6;

#[inline]
pub fn nancount(values: &[f64]) -> usize {
    values.iter().filter(|v| !v.is_nan()).count()
}

/// Missing values count as zero; an all-missing slice sums to zero.
#[inline]
pub fn nansum(values: &[f64]) -> f64 {
    values.iter().filter(|v| !v.is_nan()).sum()
}

#[inline]
pub fn nanprod(values: &[f64]) -> f64 {
    values.iter().filter(|v| !v.is_nan()).product()
}

#[inline]
pub fn nanmean(values: &[f64]) -> f64 {
    let n = nancount(values);
    if n == 0 {
        return f64::NAN;
    }
    nansum(values) / n as f64
}

pub fn nanvar(values: &[f64], ddof: usize) -> f64 {
    let n = nancount(values);
    if n <= ddof {
        return f64::NAN;
    }
    let mean = nansum(values) / n as f64;
    let m2: f64 = values
        .iter()
        .filter(|v| !v.is_nan())
        .map(|v| (v - mean) * (v - mean))
        .sum();
    m2 / (n - ddof) as f64
}

#[inline]
pub fn nanstd(values: &[f64], ddof: usize) -> f64 {
    nanvar(values, ddof).sqrt()
}

pub fn nanmax(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
        .unwrap_or(f64::NAN)
}

pub fn nanmin(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.min(v))))
        .unwrap_or(f64::NAN)
}

#[inline]
pub fn nanlast(values: &[f64]) -> f64 {
    values
        .iter()
        .rev()
        .copied()
        .find(|v| !v.is_nan())
        .unwrap_or(f64::NAN)
}

/// Last value whose mask bit is set, or NaN.
pub fn masked_last(values: &[f64], mask: &[bool]) -> f64 {
    debug_assert_eq!(values.len(), mask.len());
    values
        .iter()
        .zip(mask)
        .rev()
        .find_map(|(&v, &keep)| keep.then_some(v))
        .unwrap_or(f64::NAN)
}

pub fn masked_first(values: &[f64], mask: &[bool]) -> f64 {
    debug_assert_eq!(values.len(), mask.len());
    values
        .iter()
        .zip(mask)
        .find_map(|(&v, &keep)| keep.then_some(v))
        .unwrap_or(f64::NAN)
}

/// Forward-fills missing values in place; leading gaps stay missing.
pub fn pad_forward(values: &mut [f64]) {
    let mut last = f64::NAN;
    for v in values.iter_mut() {
        if v.is_nan() {
            *v = last;
        } else {
            last = *v;
        }
    }
}

#[inline]
fn paired<'a>(x: &'a [f64], y: &'a [f64]) -> impl Iterator<Item = (f64, f64)> + 'a {
    debug_assert_eq!(x.len(), y.len());
    x.iter()
        .zip(y)
        .map(|(&a, &b)| (a, b))
        .filter(|(a, b)| !(a * b).is_nan())
}

/// Covariance over pairs where both sides are present.
pub fn covariance(x: &[f64], y: &[f64], ddof: usize) -> f64 {
    let (n, sx, sy) = paired(x, y).fold((0usize, 0.0, 0.0), |(n, sx, sy), (a, b)| {
        (n + 1, sx + a, sy + b)
    });
    if n <= ddof {
        return f64::NAN;
    }
    let (mx, my) = (sx / n as f64, sy / n as f64);
    let sxy: f64 = paired(x, y).map(|(a, b)| (a - mx) * (b - my)).sum();
    sxy / (n - ddof) as f64
}

pub fn pearsonr(x: &[f64], y: &[f64], ddof: usize) -> f64 {
    let (n, sx, sy) = paired(x, y).fold((0usize, 0.0, 0.0), |(n, sx, sy), (a, b)| {
        (n + 1, sx + a, sy + b)
    });
    if n <= ddof {
        return f64::NAN;
    }
    let (mx, my) = (sx / n as f64, sy / n as f64);
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in paired(x, y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}

/// Spearman correlation from precomputed ranks.
pub fn spearman(rank_x: &[f64], rank_y: &[f64]) -> f64 {
    let (n, se) = rank_x
        .iter()
        .zip(rank_y)
        .map(|(a, b)| (a - b) * (a - b))
        .filter(|d| !d.is_nan())
        .fold((0usize, 0.0), |(n, s), d| (n + 1, s + d));
    let n = n as f64;
    1.0 - 6.0 * se / (n * (n * n - 1.0))
}

/// Ordinary least squares `y = slope * x + intercept`; a flat `x` yields slope 0.
pub fn linear_regression_1d(x: &[f64], y: &[f64]) -> (f64, f64) {
    let (n, sx, sy) = paired(x, y).fold((0usize, 0.0, 0.0), |(n, sx, sy), (a, b)| {
        (n + 1, sx + a, sy + b)
    });
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let (x_bar, y_bar) = (sx / n as f64, sy / n as f64);
    let (mut cov, mut x_var) = (0.0, 0.0);
    for (a, b) in paired(x, y) {
        cov += (a - x_bar) * (b - y_bar);
        x_var += (a - x_bar) * (a - x_bar);
    }
    let slope = if x_var == 0.0 { 0.0 } else { cov / x_var };
    (slope, y_bar - slope * x_bar)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankMethod {
    /// Ties broken by position.
    Ordinal,
    /// Ties share the mean of their positions.
    Average,
    /// Ties share a rank; ranks stay consecutive.
    Dense,
}

/// 1-based ranks; missing values keep a missing rank.
pub fn rankdata(values: &[f64], ascending: bool, method: RankMethod) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    order.sort_by(|&a, &b| {
        let ord = values[a].total_cmp(&values[b]);
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    let mut ranks = vec![f64::NAN; values.len()];
    match method {
        RankMethod::Ordinal => {
            for (pos, &idx) in order.iter().enumerate() {
                ranks[idx] = (pos + 1) as f64;
            }
        }
        RankMethod::Average | RankMethod::Dense => {
            let mut start = 0;
            let mut dense = 0.0;
            while start < order.len() {
                let head = values[order[start]];
                let mut end = start + 1;
                while end < order.len() && values[order[end]] == head {
                    end += 1;
                }
                dense += 1.0;
                let rank = match method {
                    RankMethod::Average => (start + 1 + end) as f64 * 0.5,
                    _ => dense,
                };
                for &idx in &order[start..end] {
                    ranks[idx] = rank;
                }
                start = end;
            }
        }
    }
    ranks
}

/// Assigns each value to one of `bins` equal-count buckets (0-based).
///
/// Bucket edges interpolate between neighbouring order statistics; the lowest edge is
/// lowered by one so the minimum lands in bucket 0. A single-column row is all bucket 0.
pub fn quantile_bins(values: &[f64], bins: usize) -> Vec<f64> {
    if values.len() == 1 {
        return vec![0.0];
    }
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() || bins == 0 {
        return vec![f64::NAN; values.len()];
    }
    sorted.sort_by(f64::total_cmp);
    let last = sorted.len() - 1;
    let mut edges: Vec<f64> = (0..=bins)
        .map(|i| {
            let pos = (i as f64 / bins as f64) * last as f64;
            let lo = (pos.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        })
        .collect();
    edges[0] -= 1.0;
    values
        .iter()
        .map(|&v| {
            edges
                .windows(2)
                .position(|edge| v > edge[0] && v <= edge[1])
                .map_or(f64::NAN, |tile| tile as f64)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NanPolicy {
    /// Missing values drop out of the universe count.
    Omit,
    /// Missing values are replaced and still counted.
    Fill(f64),
}

/// Value at percent position `k` of the masked universe.
///
/// A negative `k` counts from the top. With `even_mean`, the value is averaged with
/// the adjacent rank selected through [`EVEN_MEAN_OFFSET`].
pub fn masked_kth_value(
    values: &[f64],
    universe: &[bool],
    k: f64,
    even_mean: bool,
    nan_policy: NanPolicy,
) -> f64 {
    debug_assert_eq!(values.len(), universe.len());
    if values.is_empty() {
        return f64::NAN;
    }
    let mut count = 0usize;
    let mut filled: Vec<f64> = values
        .iter()
        .zip(universe)
        .map(|(&v, &member)| {
            if !member {
                return f64::INFINITY;
            }
            if v.is_nan() {
                return match nan_policy {
                    NanPolicy::Fill(fill) => {
                        count += 1;
                        fill
                    }
                    NanPolicy::Omit => f64::INFINITY,
                };
            }
            count += 1;
            v
        })
        .collect();
    if count == 0 {
        return f64::NAN;
    }
    filled.sort_by(f64::total_cmp);
    let count = count as f64;
    let kth = match (even_mean, k < 0.0) {
        (true, true) => count - k.abs() * (count - 1.0),
        (true, false) => k * (count - 1.0),
        (false, true) => count - (k.abs() * count).trunc() - 1.0,
        (false, false) => k * count,
    };
    let last = filled.len() - 1;
    let at = |pos: f64| filled[(pos.max(0.0).trunc() as usize).min(last)];
    let odd = at(kth);
    if even_mean {
        (odd + at(kth + EVEN_MEAN_OFFSET)) / 2.0
    } else {
        odd
    }
}

#[inline]
pub fn nanmedian(values: &[f64]) -> f64 {
    let universe = vec![true; values.len()];
    masked_kth_value(values, &universe, 0.5, true, NanPolicy::Omit)
}

/// Reduces every `row_len`-wide row of `values` to one value.
pub(crate) fn reduce_rows<F>(values: &[f64], row_len: usize, rows: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64 + Sync + Send,
{
    if row_len == 0 {
        return vec![f(&[]); rows];
    }
    values.par_chunks(row_len).map(f).collect()
}

/// Maps every `row_len`-wide row to a row of the same width.
pub(crate) fn map_rows<F>(values: &[f64], row_len: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> Vec<f64> + Sync + Send,
{
    if row_len == 0 {
        return Vec::new();
    }
    values.par_chunks(row_len).flat_map_iter(f).collect()
}
