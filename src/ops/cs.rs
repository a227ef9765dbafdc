use super::elem::single_output;
use super::stats::{self, RankMethod};
use super::{KernelArgs, KernelInput};
use crate::error::FactorError;
use crate::tensor::{Shape, Tensor};
use std::collections::HashMap;

/// Single float input laid out as `(dates, instruments)`.
fn cross_section<'a>(
    args: &KernelArgs<'_>,
    inputs: &'a [KernelInput],
    arity: usize,
) -> Result<(Shape, &'a [f64]), FactorError> {
    args.expect_arity(inputs, arity)?;
    let input = inputs[0].tensor(args.node)?;
    let shape = single_output(args, input)?;
    Ok((shape, input.float_values(args.node, "cross-section")?))
}

fn map_sections<F>(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
    f: F,
) -> Result<Tensor, FactorError>
where
    F: Fn(&[f64]) -> Vec<f64> + Sync + Send,
{
    let (shape, values) = cross_section(args, inputs, 1)?;
    Ok(Tensor::from_f64(shape, stats::map_rows(values, shape.cols, f)))
}

/// 1-based ordinal rank inside each date; missing stays missing.
pub fn cs_rank(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    let ascending = args.param.ascending();
    map_sections(args, inputs, move |row| {
        stats::rankdata(row, ascending, RankMethod::Ordinal)
    })
}

/// `(x - mean) / std`; with a weight input the mean is `sum(x * w) / sum(w)`.
pub fn cs_zscore(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    if inputs.len() == 1 {
        return map_sections(args, inputs, |row| {
            let mean = stats::nanmean(row);
            let std = stats::nanstd(row, 0);
            row.iter().map(|v| (v - mean) / std).collect()
        });
    }
    let (shape, values) = cross_section(args, inputs, 2)?;
    let weight = inputs[1].tensor(args.node)?;
    if weight.shape() != shape {
        return Err(FactorError::ShapeMismatch {
            node: args.node.to_string(),
            reason: format!("weight {:?} does not match data {:?}", weight.shape(), shape),
        });
    }
    let weight = weight.float_values(args.node, "zscore weight")?;
    let mut out = Vec::with_capacity(values.len());
    for row in 0..shape.rows {
        let span = row * shape.cols..(row + 1) * shape.cols;
        let (x, w) = (&values[span.clone()], &weight[span]);
        let weighted: Vec<f64> = x.iter().zip(w).map(|(a, b)| a * b).collect();
        let mean = stats::nansum(&weighted) / stats::nansum(w);
        let std = stats::nanstd(x, 0);
        out.extend(x.iter().map(|v| (v - mean) / std));
    }
    Ok(Tensor::from_f64(shape, out))
}

pub fn cs_demean(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    map_sections(args, inputs, |row| {
        let mean = stats::nanmean(row);
        row.iter().map(|v| v - mean).collect()
    })
}

pub fn cs_quantile(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    let bins = args.param.bins().unwrap_or(5);
    map_sections(args, inputs, move |row| stats::quantile_bins(row, bins))
}

/// Scales each date so absolute weights sum to one, optionally demeaning first.
pub fn cs_to_weight(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    let demean = args.param.demean();
    map_sections(args, inputs, move |row| {
        let mean = if demean { stats::nanmean(row) } else { 0.0 };
        let centered: Vec<f64> = row.iter().map(|v| v - mean).collect();
        let gross: f64 = centered.iter().filter(|v| !v.is_nan()).map(|v| v.abs()).sum();
        centered.into_iter().map(|v| v / gross).collect()
    })
}

fn clamp_values(values: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    values
        .iter()
        .map(|&v| {
            if v > upper {
                upper
            } else if v < lower {
                lower
            } else {
                v
            }
        })
        .collect()
}

/// Winsorize cut points over the present values; `None` when nothing is present.
///
/// The order statistics count present values only, so missing cells never pull a cut.
fn winsor_bounds(values: &[f64], z: f64) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    // 1-based order statistics, kept inside the present values.
    let upper_k = ((n as f64 * (1.0 - z)) as usize).saturating_sub(1).clamp(1, n);
    let lower_k = ((n as f64 * z) as usize + 1).clamp(1, n);
    Some((sorted[lower_k - 1], sorted[upper_k - 1]))
}

/// Clamps each date to its `z` and `1 - z` order statistics.
pub fn cs_winsorize(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    let z = args.param.z().unwrap_or(0.05);
    map_sections(args, inputs, move |row| match winsor_bounds(row, z) {
        Some((lower, upper)) => clamp_values(row, lower, upper),
        None => row.to_vec(),
    })
}

/// Like [`cs_winsorize`], with one pair of cut points over every date at once.
pub fn cs_winsorize_panel(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    let z = args.param.z().unwrap_or(0.05);
    let (shape, values) = cross_section(args, inputs, 1)?;
    let out = match winsor_bounds(values, z) {
        Some((lower, upper)) => clamp_values(values, lower, upper),
        None => values.to_vec(),
    };
    Ok(Tensor::from_f64(shape, out))
}

/// Demeans each date within the groups named by the second input's codes.
///
/// Cells whose code is missing form one group of their own.
pub fn cs_group_demean(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    let (shape, values) = cross_section(args, inputs, 2)?;
    let groups = inputs[1].tensor(args.node)?;
    if groups.shape() != shape {
        return Err(FactorError::ShapeMismatch {
            node: args.node.to_string(),
            reason: format!("groups {:?} do not match data {:?}", groups.shape(), shape),
        });
    }
    let groups = groups.float_values(args.node, "group codes")?;
    // -0.0 and 0.0 are one group; every NaN code is another.
    let key = |code: f64| {
        if code.is_nan() {
            f64::NAN.to_bits()
        } else {
            (code + 0.0).to_bits()
        }
    };
    let mut out = Vec::with_capacity(values.len());
    let mut sums: HashMap<u64, (f64, usize)> = HashMap::new();
    for row in 0..shape.rows {
        let span = row * shape.cols..(row + 1) * shape.cols;
        let (x, g) = (&values[span.clone()], &groups[span]);
        sums.clear();
        for (&v, &code) in x.iter().zip(g) {
            if !v.is_nan() {
                let entry = sums.entry(key(code)).or_insert((0.0, 0));
                entry.0 += v;
                entry.1 += 1;
            }
        }
        out.extend(x.iter().zip(g).map(|(&v, &code)| match sums.get(&key(code)) {
            Some(&(sum, count)) => v - sum / count as f64,
            None => f64::NAN,
        }));
    }
    Ok(Tensor::from_f64(shape, out))
}

/// Clamps each date to `median +- z * MAD`.
pub fn cs_mad_clamp(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    let z = args.param.z().unwrap_or(5.0);
    map_sections(args, inputs, move |row| {
        let median = stats::nanmedian(row);
        let deviations: Vec<f64> = row.iter().map(|v| (v - median).abs()).collect();
        let mad = stats::nanmedian(&deviations);
        clamp_values(row, median - z * mad, median + z * mad)
    })
}
