use super::{stats, KernelArgs, KernelInput};
use crate::error::FactorError;
use crate::layout::{DenseWindows, RollingView};
use crate::tensor::{Shape, Tensor};
use log::trace;

#[inline]
fn window_input<'a>(
    args: &KernelArgs<'_>,
    inputs: &'a [KernelInput],
) -> Result<&'a RollingView, FactorError> {
    args.expect_arity(inputs, 1)?;
    let view = inputs[0].rolling(args.node)?;
    trace!(
        "`{}` over {:?} in {} chunk(s)",
        args.node,
        view.shape(),
        view.chunks().len()
    );
    Ok(view)
}

fn window_pair<'a>(
    args: &KernelArgs<'_>,
    inputs: &'a [KernelInput],
) -> Result<(&'a RollingView, &'a RollingView), FactorError> {
    args.expect_arity(inputs, 2)?;
    Ok((inputs[0].rolling(args.node)?, inputs[1].rolling(args.node)?))
}

pub fn ts_sum(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nansum(args.node)
}

pub fn ts_product(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nanprod(args.node)
}

pub fn ts_mean(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nanmean(args.node)
}

pub fn ts_std(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nanstd(args.node, 0)
}

pub fn ts_var(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nanvar(args.node)
}

pub fn ts_max(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nanmax(args.node)
}

pub fn ts_min(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.nanmin(args.node)
}

pub fn ts_count(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    Ok(window_input(args, inputs)?.count())
}

pub fn ts_rank(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    window_input(args, inputs)?.rank_last(args.node, args.param.ascending())
}

/// `last / first - 1` over the adjusted window.
pub fn ts_returns(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    let view = window_input(args, inputs)?;
    view.aggregate(args.node, &[], |dense, _| {
        Ok(dense.reduce(|w| w[w.len() - 1] / w[0] - 1.0))
    })
}

fn bool_reduce(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
    f: fn(&[f64]) -> bool,
) -> Result<Tensor, FactorError> {
    let view = window_input(args, inputs)?;
    view.aggregate(args.node, &[], |dense: &DenseWindows, _| {
        let shape = dense.shape();
        let out = (0..shape.rows)
            .flat_map(|row| (0..shape.cols).map(move |col| (row, col)))
            .map(|(row, col)| f(dense.window(row, col)))
            .collect();
        Ok(Tensor::from_bool(Shape::grid(shape.rows, shape.cols), out))
    })
}

/// True when any window value is set (non-zero, present).
pub fn ts_any(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    bool_reduce(args, inputs, |w| w.iter().any(|&v| v != 0.0 && !v.is_nan()))
}

/// True when every window value is set; padded history counts as unset.
pub fn ts_all(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    bool_reduce(args, inputs, |w| w.iter().all(|&v| v != 0.0 && !v.is_nan()))
}

pub fn ts_corr(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    let (x, y) = window_pair(args, inputs)?;
    x.aggregate(args.node, &[y], |x, others| {
        Ok(x.zip_reduce(&others[0], 1, |a, b| vec![stats::pearsonr(a, b, 0)]))
    })
}

pub fn ts_cov(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    let (x, y) = window_pair(args, inputs)?;
    x.aggregate(args.node, &[y], |x, others| {
        Ok(x.zip_reduce(&others[0], 1, |a, b| vec![stats::covariance(a, b, 0)]))
    })
}

/// Regresses input 0 on input 1 per window; outputs `[slope, intercept]`.
pub fn ts_linear_regression(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    let (y, x) = window_pair(args, inputs)?;
    y.aggregate(args.node, &[x], |y, others| {
        Ok(others[0].zip_reduce(y, 2, |x, y| {
            let (slope, intercept) = stats::linear_regression_1d(x, y);
            vec![slope, intercept]
        }))
    })
}
