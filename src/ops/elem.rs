use super::{stats, KernelArgs, KernelInput};
use crate::error::FactorError;
use crate::tensor::{DType, Shape, Tensor, TensorData};
use log::trace;
use std::borrow::Cow;

enum Operand<'a> {
    Values(Cow<'a, [f64]>),
    Scalar(f64),
}

impl Operand<'_> {
    #[inline]
    fn at(&self, idx: usize) -> f64 {
        match self {
            Self::Values(values) => values[idx],
            Self::Scalar(value) => *value,
        }
    }
}

/// Numeric view of an operand; bool and int tensors are read as floats.
fn numeric<'a>(input: &'a KernelInput, node: &str) -> Result<(Operand<'a>, Option<Shape>), FactorError> {
    if let Some(value) = input.scalar() {
        return Ok((Operand::Scalar(value), None));
    }
    let tensor = input.tensor(node)?;
    let values: Cow<'a, [f64]> = match tensor.data() {
        TensorData::Float(values) => Cow::Borrowed(values),
        TensorData::Bool(values) => Cow::Owned(values.iter().map(|&b| f64::from(u8::from(b))).collect()),
        TensorData::Int(values) => Cow::Owned(values.iter().map(|&v| v as f64).collect()),
    };
    Ok((Operand::Values(values), Some(tensor.shape())))
}

fn result_shape(node: &str, lhs: Option<Shape>, rhs: Option<Shape>) -> Result<Shape, FactorError> {
    match (lhs, rhs) {
        (Some(l), Some(r)) if l != r => Err(FactorError::ShapeMismatch {
            node: node.to_string(),
            reason: format!("operands {l:?} and {r:?} differ"),
        }),
        (Some(shape), _) | (None, Some(shape)) => Ok(shape),
        (None, None) => Err(FactorError::InvalidParam {
            node: node.to_string(),
            param: "inputs",
            reason: "at least one operand must be a factor".to_string(),
        }),
    }
}

fn binary<T, F>(args: &KernelArgs<'_>, inputs: &[KernelInput], f: F) -> Result<(Shape, Vec<T>), FactorError>
where
    F: Fn(f64, f64) -> T,
{
    args.expect_arity(inputs, 2)?;
    let (lhs, lhs_shape) = numeric(&inputs[0], args.node)?;
    let (rhs, rhs_shape) = numeric(&inputs[1], args.node)?;
    let shape = result_shape(args.node, lhs_shape, rhs_shape)?;
    let out = (0..shape.len()).map(|idx| f(lhs.at(idx), rhs.at(idx))).collect();
    Ok((shape, out))
}

fn arithmetic(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, FactorError> {
    let (shape, out) = binary(args, inputs, f)?;
    Ok(Tensor::from_f64(shape, out))
}

fn compare(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
    f: impl Fn(f64, f64) -> bool,
) -> Result<Tensor, FactorError> {
    let (shape, out) = binary(args, inputs, f)?;
    Ok(Tensor::from_bool(shape, out))
}

fn unary(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
    f: impl Fn(f64) -> f64,
) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let (values, shape) = numeric(&inputs[0], args.node)?;
    let shape = result_shape(args.node, shape, None)?;
    Ok(Tensor::from_f64(
        shape,
        (0..shape.len()).map(|idx| f(values.at(idx))).collect(),
    ))
}

pub fn elem_add(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    arithmetic(args, inputs, |a, b| a + b)
}

pub fn elem_sub(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    arithmetic(args, inputs, |a, b| a - b)
}

pub fn elem_mul(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    arithmetic(args, inputs, |a, b| a * b)
}

pub fn elem_div(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    arithmetic(args, inputs, |a, b| a / b)
}

/// Floored modulo; the result takes the divisor's sign.
pub fn elem_mod(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    arithmetic(args, inputs, |a, b| a - b * (a / b).floor())
}

pub fn elem_pow(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    arithmetic(args, inputs, f64::powf)
}

pub fn elem_neg(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    unary(args, inputs, |v| -v)
}

pub fn elem_abs(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    unary(args, inputs, f64::abs)
}

pub fn elem_log(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    unary(args, inputs, f64::ln)
}

/// -1, 0 or 1; missing stays missing.
pub fn elem_sign(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    unary(args, inputs, |v| {
        if v.is_nan() || v == 0.0 {
            v
        } else {
            v.signum()
        }
    })
}

pub fn elem_lt(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    compare(args, inputs, |a, b| a < b)
}

pub fn elem_le(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    compare(args, inputs, |a, b| a <= b)
}

pub fn elem_gt(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    compare(args, inputs, |a, b| a > b)
}

pub fn elem_ge(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    compare(args, inputs, |a, b| a >= b)
}

pub fn elem_eq(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    compare(args, inputs, |a, b| a == b)
}

pub fn elem_ne(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    compare(args, inputs, |a, b| a != b)
}

fn logical(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
    f: impl Fn(bool, bool) -> bool,
) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 2)?;
    let lhs = inputs[0].tensor(args.node)?;
    let rhs = inputs[1].tensor(args.node)?;
    let shape = result_shape(args.node, Some(lhs.shape()), Some(rhs.shape()))?;
    let lhs = lhs.bool_values(args.node, "logical op")?;
    let rhs = rhs.bool_values(args.node, "logical op")?;
    Ok(Tensor::from_bool(
        shape,
        lhs.iter().zip(rhs).map(|(&a, &b)| f(a, b)).collect(),
    ))
}

pub fn elem_and(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    logical(args, inputs, |a, b| a && b)
}

pub fn elem_or(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    logical(args, inputs, |a, b| a || b)
}

pub fn elem_not(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    let values = input.bool_values(args.node, "not")?;
    Ok(Tensor::from_bool(
        input.shape(),
        values.iter().map(|v| !v).collect(),
    ))
}

/// Bool data has no missing marker and passes through.
pub fn elem_fillna(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    let fill = args.param.fill().unwrap_or(0.0);
    match input.data() {
        TensorData::Float(values) => Ok(Tensor::from_f64(
            input.shape(),
            values
                .iter()
                .map(|&v| if v.is_nan() { fill } else { v })
                .collect(),
        )),
        _ => Ok(input.clone()),
    }
}

pub fn elem_masked_fill(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 2)?;
    let data = inputs[0].tensor(args.node)?;
    let mask = inputs[1].tensor(args.node)?;
    let shape = result_shape(args.node, Some(data.shape()), Some(mask.shape()))?;
    let values = data.float_values(args.node, "masked_fill")?;
    let mask = mask.bool_values(args.node, "masked_fill")?;
    let fill = args.param.fill().unwrap_or(f64::NAN);
    Ok(Tensor::from_f64(
        shape,
        values
            .iter()
            .zip(mask)
            .map(|(&v, &hit)| if hit { fill } else { v })
            .collect(),
    ))
}

pub fn elem_clamp(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    let (lo, hi) = args
        .param
        .clamp()
        .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
    unary(args, inputs, |v| if v.is_nan() { v } else { v.clamp(lo, hi) })
}

/// Passes the (already masked) input through.
pub fn elem_filter(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    Ok(inputs[0].tensor(args.node)?.clone())
}

/// Moves every row `periods` steps along time, filling the vacated cells with NaN.
pub fn elem_shift(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    let values = input.float_values(args.node, "shift")?;
    let shape = input.shape();
    let periods = args.param.periods().unwrap_or(1);
    trace!("shift `{}` by {periods}", args.node);
    let mut out = vec![f64::NAN; shape.len()];
    for row in 0..shape.rows {
        for col in 0..shape.cols {
            let src = col as isize - periods;
            if src < 0 || src >= shape.cols as isize {
                continue;
            }
            let dst = shape.offset(row, col, 0);
            let src = shape.offset(row, src as usize, 0);
            out[dst..dst + shape.depth].copy_from_slice(&values[src..src + shape.depth]);
        }
    }
    Ok(Tensor::from_f64(shape, out))
}

/// Forward-fills missing values along time.
pub fn elem_pad(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    let shape = single_output(args, input)?;
    let values = input.float_values(args.node, "pad")?;
    let out = stats::map_rows(values, shape.cols, |row| {
        let mut row = row.to_vec();
        stats::pad_forward(&mut row);
        row
    });
    Ok(Tensor::from_f64(shape, out))
}

/// `data * multiplier / last(multiplier)` within each instrument.
pub fn elem_adjusted(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    let shape = single_output(args, input)?;
    let values = input.float_values(args.node, "adjusted")?;
    let Some(Some(multiplier)) = args.adjustments.first() else {
        return Err(FactorError::InvalidParam {
            node: args.node.to_string(),
            param: "adjustment",
            reason: "input carries no adjustment multiplier".to_string(),
        });
    };
    let multiplier = multiplier.float_values(args.node, "adjusted")?;
    let mut out = Vec::with_capacity(values.len());
    for row in 0..shape.rows {
        let span = row * shape.cols..(row + 1) * shape.cols;
        let last = stats::nanlast(&multiplier[span.clone()]);
        out.extend(
            values[span.clone()]
                .iter()
                .zip(&multiplier[span])
                .map(|(v, m)| v * m / last),
        );
    }
    Ok(Tensor::from_f64(shape, out))
}

pub fn elem_select(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    input.select_depth(args.node, args.param.select().unwrap_or(0))
}

pub fn elem_to_float(
    args: &KernelArgs<'_>,
    inputs: &[KernelInput],
) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    Ok(inputs[0].tensor(args.node)?.to_float())
}

/// One bool output per distinct present value, classes in ascending order.
pub fn elem_one_hot(args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
    args.expect_arity(inputs, 1)?;
    let input = inputs[0].tensor(args.node)?;
    let shape = single_output(args, input)?;
    let values = input.float_values(args.node, "one_hot")?;
    let mut classes: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    classes.sort_by(f64::total_cmp);
    classes.dedup();
    if classes.is_empty() {
        return Err(FactorError::InvalidParam {
            node: args.node.to_string(),
            param: "inputs",
            reason: "one_hot found no present values to encode".to_string(),
        });
    }
    let mut out = Vec::with_capacity(values.len() * classes.len());
    for &v in values {
        out.extend(classes.iter().map(|&class| v == class));
    }
    Ok(Tensor::from_bool(
        Shape::new(shape.rows, shape.cols, classes.len()),
        out,
    ))
}

/// Row-wise kernels need exactly one output per cell.
pub(super) fn single_output(args: &KernelArgs<'_>, input: &Tensor) -> Result<Shape, FactorError> {
    let shape = input.shape();
    if shape.depth > 1 {
        return Err(FactorError::MultipleOutputs {
            node: args.node.to_string(),
            outputs: shape.depth,
        });
    }
    if input.dtype() != DType::Float {
        return Err(FactorError::UnsupportedDtype {
            node: args.node.to_string(),
            op: "row kernel",
            dtype: input.dtype().name(),
        });
    }
    Ok(shape)
}
