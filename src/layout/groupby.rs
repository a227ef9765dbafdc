use crate::error::FactorError;
use crate::tensor::{DType, Shape, Tensor, TensorData};

/// Padded slot marker in the take table; never a valid row index.
pub const INVALID_SLOT: usize = usize::MAX;

/// Dense `(groups, width)` arrangement of rows partitioned by an integer key.
///
/// Row `g` holds the original row indices of the `g`-th smallest key, left-aligned in
/// original order; the tail of shorter groups is padded with [`INVALID_SLOT`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLayout {
    rows: usize,
    groups: usize,
    width: usize,
    /// `(groups, width)` table of original row indices.
    take: Vec<usize>,
    /// Padded-table position of every original row.
    inverse: Vec<usize>,
    group_keys: Vec<i64>,
}

impl GroupLayout {
    pub fn build(keys: &[i64]) -> Result<Self, FactorError> {
        if let Some((row, &key)) = keys.iter().enumerate().find(|&(_, &key)| key < 0) {
            return Err(FactorError::InvalidGroupKey {
                row,
                value: key as f64,
            });
        }
        let rows = keys.len();
        // Stable: rows sharing a key keep their original order.
        let mut sorted: Vec<usize> = (0..rows).collect();
        sorted.sort_by_key(|&row| keys[row]);

        let mut boundary = Vec::with_capacity(rows.min(1024) + 1);
        if rows > 0 {
            boundary.push(0);
            for pos in 1..rows {
                if keys[sorted[pos]] != keys[sorted[pos - 1]] {
                    boundary.push(pos);
                }
            }
        }
        boundary.push(rows);

        let groups = boundary.len() - 1;
        let width = boundary
            .windows(2)
            .map(|edge| edge[1] - edge[0])
            .max()
            .unwrap_or(0);

        let mut take = vec![INVALID_SLOT; groups * width];
        for (group, edge) in boundary.windows(2).enumerate() {
            let base = group * width;
            for (slot, pos) in (edge[0]..edge[1]).enumerate() {
                take[base + slot] = sorted[pos];
            }
        }

        // Padded slots sit past every real row, so the inverse is a bijection over `rows`.
        let mut inverse = vec![0; rows];
        for (pos, &row) in take.iter().enumerate() {
            if row != INVALID_SLOT {
                inverse[row] = pos;
            }
        }

        let group_keys = boundary[..groups]
            .iter()
            .map(|&start| keys[sorted[start]])
            .collect();

        Ok(Self {
            rows,
            groups,
            width,
            take,
            inverse,
            group_keys,
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn groups(&self) -> usize {
        self.groups
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Distinct keys in group order.
    pub fn group_keys(&self) -> &[i64] {
        &self.group_keys
    }

    /// Original row index at `(group, slot)`, `None` for padding.
    #[inline]
    pub fn row_at(&self, group: usize, slot: usize) -> Option<usize> {
        let row = self.take[group * self.width + slot];
        (row != INVALID_SLOT).then_some(row)
    }

    pub fn padding_mask(&self) -> Vec<bool> {
        self.take.iter().map(|&row| row == INVALID_SLOT).collect()
    }

    /// Gathers flat `(rows, 1, depth)` data into `(groups, width, depth)`.
    pub fn split(&self, node: &str, data: &Tensor) -> Result<Tensor, FactorError> {
        let shape = data.shape();
        if shape.rows != self.rows || shape.cols != 1 {
            return Err(FactorError::ShapeMismatch {
                node: node.to_string(),
                reason: format!(
                    "cannot group {:?} with a layout over {} rows",
                    shape, self.rows
                ),
            });
        }
        let depth = shape.depth;
        let out_shape = Shape::new(self.groups, self.width, depth);
        let data = match data.data() {
            TensorData::Float(values) => {
                TensorData::Float(self.gather(values, depth, f64::NAN))
            }
            TensorData::Bool(values) => TensorData::Bool(self.gather(values, depth, false)),
            TensorData::Int(_) => {
                return Err(FactorError::UnsupportedDtype {
                    node: node.to_string(),
                    op: "group split",
                    dtype: DType::Int.name(),
                })
            }
        };
        Tensor::new(out_shape, data)
    }

    fn gather<T: Copy>(&self, values: &[T], depth: usize, missing: T) -> Vec<T> {
        let mut out = Vec::with_capacity(self.take.len() * depth);
        for &row in &self.take {
            if row == INVALID_SLOT {
                out.extend(std::iter::repeat(missing).take(depth));
            } else {
                out.extend_from_slice(&values[row * depth..(row + 1) * depth]);
            }
        }
        out
    }

    /// Scatters `(groups, width, depth)` data back to flat row order.
    pub fn revert(&self, node: &str, padded: &Tensor) -> Result<Tensor, FactorError> {
        let shape = padded.shape();
        if shape.leading() != (self.groups, self.width) {
            return Err(FactorError::LayoutMismatch {
                node: node.to_string(),
                expected: (self.groups, self.width),
                actual: shape.leading(),
            });
        }
        let depth = shape.depth;
        let out_shape = Shape::new(self.rows, 1, depth);
        let data = match padded.data() {
            TensorData::Float(values) => TensorData::Float(self.scatter(values, depth)),
            TensorData::Bool(values) => TensorData::Bool(self.scatter(values, depth)),
            TensorData::Int(values) => TensorData::Int(self.scatter(values, depth)),
        };
        Tensor::new(out_shape, data)
    }

    fn scatter<T: Copy>(&self, values: &[T], depth: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(self.rows * depth);
        for &pos in &self.inverse {
            out.extend_from_slice(&values[pos * depth..(pos + 1) * depth]);
        }
        out
    }

    /// Fresh `(groups, width)` array: `fill` on real slots, missing on padding.
    pub fn create(&self, node: &str, dtype: DType, fill: f64) -> Result<Tensor, FactorError> {
        let shape = Shape::grid(self.groups, self.width);
        match dtype {
            DType::Float => Ok(Tensor::from_f64(
                shape,
                self.take
                    .iter()
                    .map(|&row| if row == INVALID_SLOT { f64::NAN } else { fill })
                    .collect(),
            )),
            DType::Bool => Ok(Tensor::from_bool(
                shape,
                self.take
                    .iter()
                    .map(|&row| row != INVALID_SLOT && fill != 0.0)
                    .collect(),
            )),
            DType::Int => Err(FactorError::UnsupportedDtype {
                node: node.to_string(),
                op: "group create",
                dtype: dtype.name(),
            }),
        }
    }
}

/// Single-group layout over data that needs no sorting or padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WholeLayout {
    rows: usize,
}

impl WholeLayout {
    pub fn new(rows: usize) -> Self {
        Self { rows }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn split(&self, node: &str, data: &Tensor) -> Result<Tensor, FactorError> {
        let shape = data.shape();
        if shape.rows != self.rows || shape.cols != 1 {
            return Err(FactorError::ShapeMismatch {
                node: node.to_string(),
                reason: format!("cannot group {:?} as one group of {} rows", shape, self.rows),
            });
        }
        if data.dtype() == DType::Int {
            return Err(FactorError::UnsupportedDtype {
                node: node.to_string(),
                op: "group split",
                dtype: DType::Int.name(),
            });
        }
        data.clone()
            .reshape(Shape::new(1, self.rows, shape.depth))
    }

    pub fn revert(&self, node: &str, padded: &Tensor) -> Result<Tensor, FactorError> {
        let shape = padded.shape();
        if shape.leading() != (1, self.rows) {
            return Err(FactorError::LayoutMismatch {
                node: node.to_string(),
                expected: (1, self.rows),
                actual: shape.leading(),
            });
        }
        padded
            .clone()
            .reshape(Shape::new(self.rows, 1, shape.depth))
    }

    pub fn create(&self, node: &str, dtype: DType, fill: f64) -> Result<Tensor, FactorError> {
        let shape = Shape::grid(1, self.rows);
        match dtype {
            DType::Float => Ok(Tensor::full_f64(shape, fill)),
            DType::Bool => Ok(Tensor::from_bool(shape, vec![fill != 0.0; self.rows])),
            DType::Int => Err(FactorError::UnsupportedDtype {
                node: node.to_string(),
                op: "group create",
                dtype: dtype.name(),
            }),
        }
    }
}
