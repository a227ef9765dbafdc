use crate::error::FactorError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float,
    Bool,
    Int,
}

impl DType {
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Int => "int",
        }
    }
}

/// Row-major `(rows, cols, depth)` extent.
///
/// Grouped data is `(groups, width, outputs)`; a flat column is `(n, 1, outputs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
    pub depth: usize,
}

impl Shape {
    #[inline]
    pub const fn new(rows: usize, cols: usize, depth: usize) -> Self {
        Self { rows, cols, depth }
    }

    #[inline]
    pub const fn grid(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, 1)
    }

    #[inline]
    pub const fn flat(len: usize) -> Self {
        Self::new(len, 1, 1)
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.rows * self.cols * self.depth
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub const fn leading(self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub const fn offset(self, row: usize, col: usize, d: usize) -> usize {
        (row * self.cols + col) * self.depth + d
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Int(Vec<i64>),
}

impl TensorData {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub const fn dtype(&self) -> DType {
        match self {
            Self::Float(_) => DType::Float,
            Self::Bool(_) => DType::Bool,
            Self::Int(_) => DType::Int,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Shape, data: TensorData) -> Result<Self, FactorError> {
        if shape.len() != data.len() {
            return Err(FactorError::ShapeMismatch {
                node: "tensor".to_string(),
                reason: format!("shape {shape:?} holds {} values, got {}", shape.len(), data.len()),
            });
        }
        Ok(Self { shape, data })
    }

    /// Caller guarantees `shape.len() == values.len()`.
    #[inline]
    pub(crate) fn from_f64(shape: Shape, values: Vec<f64>) -> Self {
        debug_assert_eq!(shape.len(), values.len());
        Self {
            shape,
            data: TensorData::Float(values),
        }
    }

    #[inline]
    pub(crate) fn from_bool(shape: Shape, values: Vec<bool>) -> Self {
        debug_assert_eq!(shape.len(), values.len());
        Self {
            shape,
            data: TensorData::Bool(values),
        }
    }

    pub fn flat_f64(values: Vec<f64>) -> Self {
        Self::from_f64(Shape::flat(values.len()), values)
    }

    pub fn flat_bool(values: Vec<bool>) -> Self {
        Self::from_bool(Shape::flat(values.len()), values)
    }

    pub fn flat_i64(values: Vec<i64>) -> Self {
        Self {
            shape: Shape::flat(values.len()),
            data: TensorData::Int(values),
        }
    }

    pub fn full_f64(shape: Shape, value: f64) -> Self {
        Self::from_f64(shape, vec![value; shape.len()])
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[inline]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> TensorData {
        self.data
    }

    #[inline]
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::Float(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Float view, or a dtype error naming the node and operation that needed it.
    pub fn float_values(&self, node: &str, op: &'static str) -> Result<&[f64], FactorError> {
        self.as_f64().ok_or_else(|| FactorError::UnsupportedDtype {
            node: node.to_string(),
            op,
            dtype: self.dtype().name(),
        })
    }

    pub fn bool_values(&self, node: &str, op: &'static str) -> Result<&[bool], FactorError> {
        self.as_bool().ok_or_else(|| FactorError::UnsupportedDtype {
            node: node.to_string(),
            op,
            dtype: self.dtype().name(),
        })
    }

    pub fn to_float(&self) -> Tensor {
        let values = match &self.data {
            TensorData::Float(v) => v.clone(),
            TensorData::Bool(v) => v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
            TensorData::Int(v) => v.iter().map(|&i| i as f64).collect(),
        };
        Self::from_f64(self.shape, values)
    }

    pub fn reshape(self, shape: Shape) -> Result<Tensor, FactorError> {
        Self::new(shape, self.data)
    }

    /// Picks output `index` out of a multi-output tensor.
    pub fn select_depth(&self, node: &str, index: usize) -> Result<Tensor, FactorError> {
        let shape = self.shape;
        if shape.depth <= 1 || index >= shape.depth {
            return Err(FactorError::SelectOutOfBounds {
                node: node.to_string(),
                outputs: shape.depth,
                index,
            });
        }
        let out_shape = Shape::grid(shape.rows, shape.cols);
        let picked = |len: usize| (0..len).map(move |cell| cell * shape.depth + index);
        let data = match &self.data {
            TensorData::Float(v) => {
                TensorData::Float(picked(out_shape.len()).map(|i| v[i]).collect())
            }
            TensorData::Bool(v) => TensorData::Bool(picked(out_shape.len()).map(|i| v[i]).collect()),
            TensorData::Int(v) => TensorData::Int(picked(out_shape.len()).map(|i| v[i]).collect()),
        };
        Ok(Self {
            shape: out_shape,
            data,
        })
    }

    /// Rows `rows` of this tensor, all columns and outputs kept.
    pub fn slice_rows(&self, rows: std::ops::Range<usize>) -> Tensor {
        let row_len = self.shape.cols * self.shape.depth;
        let cells = rows.start * row_len..rows.end * row_len;
        let data = match &self.data {
            TensorData::Float(v) => TensorData::Float(v[cells].to_vec()),
            TensorData::Bool(v) => TensorData::Bool(v[cells].to_vec()),
            TensorData::Int(v) => TensorData::Int(v[cells].to_vec()),
        };
        Self {
            shape: Shape::new(rows.len(), self.shape.cols, self.shape.depth),
            data,
        }
    }

    /// Concatenates same-row-count parts along the column (time) axis.
    pub fn concat_cols(node: &str, parts: Vec<Tensor>) -> Result<Tensor, FactorError> {
        let Some(first) = parts.first() else {
            return Err(FactorError::ShapeMismatch {
                node: node.to_string(),
                reason: "nothing to concatenate".to_string(),
            });
        };
        let rows = first.shape.rows;
        let depth = first.shape.depth;
        let dtype = first.dtype();
        let mut cols = 0;
        for part in &parts {
            if part.shape.rows != rows || part.shape.depth != depth || part.dtype() != dtype {
                return Err(FactorError::ShapeMismatch {
                    node: node.to_string(),
                    reason: format!(
                        "chunk {:?}/{} does not match ({rows}, _, {depth})/{}",
                        part.shape,
                        part.dtype().name(),
                        dtype.name()
                    ),
                });
            }
            cols += part.shape.cols;
        }
        let shape = Shape::new(rows, cols, depth);
        if parts.len() == 1 {
            let mut parts = parts;
            return Ok(parts.swap_remove(0));
        }
        match dtype {
            DType::Float => {
                let mut out = vec![f64::NAN; shape.len()];
                let mut col_base = 0;
                for part in &parts {
                    if let TensorData::Float(v) = &part.data {
                        copy_cols(&mut out, v, shape, part.shape, col_base);
                    }
                    col_base += part.shape.cols;
                }
                Ok(Self::from_f64(shape, out))
            }
            DType::Bool => {
                let mut out = vec![false; shape.len()];
                let mut col_base = 0;
                for part in &parts {
                    if let TensorData::Bool(v) = &part.data {
                        copy_cols(&mut out, v, shape, part.shape, col_base);
                    }
                    col_base += part.shape.cols;
                }
                Ok(Self::from_bool(shape, out))
            }
            DType::Int => {
                let mut out = vec![0; shape.len()];
                let mut col_base = 0;
                for part in &parts {
                    if let TensorData::Int(v) = &part.data {
                        copy_cols(&mut out, v, shape, part.shape, col_base);
                    }
                    col_base += part.shape.cols;
                }
                Ok(Self {
                    shape,
                    data: TensorData::Int(out),
                })
            }
        }
    }
}

fn copy_cols<T: Copy>(out: &mut [T], part: &[T], out_shape: Shape, part_shape: Shape, col_base: usize) {
    let run = part_shape.cols * part_shape.depth;
    for row in 0..part_shape.rows {
        let src = row * run;
        let dst = out_shape.offset(row, col_base, 0);
        out[dst..dst + run].copy_from_slice(&part[src..src + run]);
    }
}

#[cfg(test)]
mod tests {
    use super::{Shape, Tensor};

    #[test]
    fn concat_cols_stitches_row_segments_in_order() {
        let left = Tensor::from_f64(Shape::grid(2, 2), vec![1.0, 2.0, 5.0, 6.0]);
        let right = Tensor::from_f64(Shape::grid(2, 1), vec![3.0, 7.0]);
        let joined = Tensor::concat_cols("t", vec![left, right]).expect("concat");
        assert_eq!(joined.shape(), Shape::grid(2, 3));
        assert_eq!(
            joined.as_f64().expect("float"),
            &[1.0, 2.0, 3.0, 5.0, 6.0, 7.0]
        );
    }

    #[test]
    fn select_depth_rejects_single_output() {
        let t = Tensor::flat_f64(vec![1.0, 2.0]);
        assert!(t.select_depth("t", 0).is_err());
    }
}
