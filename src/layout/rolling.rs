use crate::error::FactorError;
use crate::ops::stats::{self, RankMethod};
use crate::tensor::{Shape, Tensor};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Overlapping windows of a grouped `(rows, cols)` float array.
///
/// The source is left-padded with `win - 1` missing columns once; window `(g, t)` is
/// then the contiguous slice `padded[g][t..t + win]`, so reading a window never copies.
#[derive(Debug, Clone)]
pub struct RollingView {
    win: usize,
    rows: usize,
    cols: usize,
    padded: Vec<f64>,
    adjustment: Option<Box<Adjustment>>,
    split: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
struct Adjustment {
    windows: RollingView,
    /// Last present multiplier of each window, `(rows, cols)`.
    last: Vec<f64>,
}

impl RollingView {
    pub fn new(
        node: &str,
        grouped: &Tensor,
        win: usize,
        adjustment: Option<&Tensor>,
        split_multiplier: f64,
    ) -> Result<Self, FactorError> {
        let mut view = Self::unadjusted(node, grouped, win, split_multiplier)?;
        if let Some(multiplier) = adjustment {
            if multiplier.shape().leading() != grouped.shape().leading() {
                return Err(FactorError::ShapeMismatch {
                    node: node.to_string(),
                    reason: format!(
                        "adjustment {:?} does not match data {:?}",
                        multiplier.shape(),
                        grouped.shape()
                    ),
                });
            }
            let windows = Self::unadjusted(node, multiplier, win, split_multiplier)?;
            let last = windows.reduce_raw(stats::nanlast);
            view.adjustment = Some(Box::new(Adjustment { windows, last }));
        }
        Ok(view)
    }

    fn unadjusted(
        node: &str,
        grouped: &Tensor,
        win: usize,
        split_multiplier: f64,
    ) -> Result<Self, FactorError> {
        let shape = grouped.shape();
        if shape.depth > 1 {
            return Err(FactorError::MultipleOutputs {
                node: node.to_string(),
                outputs: shape.depth,
            });
        }
        if win == 0 {
            return Err(FactorError::WindowTooSmall {
                node: node.to_string(),
                win,
                min_win: 1,
            });
        }
        let values = grouped.float_values(node, "rolling window")?;
        let (rows, cols) = shape.leading();
        let padded_cols = cols + win - 1;
        let mut padded = vec![f64::NAN; rows * padded_cols];
        for row in 0..rows {
            let dst = row * padded_cols + win - 1;
            padded[dst..dst + cols].copy_from_slice(&values[row * cols..(row + 1) * cols]);
        }
        Ok(Self {
            win,
            rows,
            cols,
            padded,
            adjustment: None,
            split: chunk_bounds(rows, cols, win, split_multiplier),
        })
    }

    #[inline]
    pub fn win(&self) -> usize {
        self.win
    }

    /// `(rows, cols)` of the source; the logical view is `(rows, cols, win)`.
    #[inline]
    pub fn shape(&self) -> Shape {
        Shape::new(self.rows, self.cols, self.win)
    }

    #[inline]
    pub fn has_adjustment(&self) -> bool {
        self.adjustment.is_some()
    }

    /// Time chunks `aggregate` materializes one at a time.
    pub fn chunks(&self) -> &[(usize, usize)] {
        &self.split
    }

    /// Raw (unadjusted) window ending at time `col` of group `row`.
    #[inline]
    pub fn window(&self, row: usize, col: usize) -> &[f64] {
        let start = row * (self.cols + self.win - 1) + col;
        &self.padded[start..start + self.win]
    }

    fn reduce_raw<F>(&self, f: F) -> Vec<f64>
    where
        F: Fn(&[f64]) -> f64,
    {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for row in 0..self.rows {
            for col in 0..self.cols {
                out.push(f(self.window(row, col)));
            }
        }
        out
    }

    /// Copies windows `start..end` into a dense block, applying `adj / adj_last`.
    ///
    /// This is the only materializing read; keep `end - start` bounded.
    pub fn adjust(&self, start: usize, end: usize) -> DenseWindows {
        debug_assert!(start <= end && end <= self.cols);
        let cols = end - start;
        let mut values = Vec::with_capacity(self.rows * cols * self.win);
        for row in 0..self.rows {
            for col in start..end {
                let raw = self.window(row, col);
                match &self.adjustment {
                    Some(adj) => {
                        let last = adj.last[row * self.cols + col];
                        let ratios = adj.windows.window(row, col);
                        values.extend(raw.iter().zip(ratios).map(|(v, r)| v * r / last));
                    }
                    None => values.extend_from_slice(raw),
                }
            }
        }
        DenseWindows {
            rows: self.rows,
            cols,
            win: self.win,
            values,
        }
    }

    /// Applies `op` chunk by chunk and stitches the `(rows, chunk)` results along time.
    ///
    /// `others` are cut at the same chunk boundaries and must share this view's window.
    pub fn aggregate<F>(
        &self,
        node: &str,
        others: &[&RollingView],
        mut op: F,
    ) -> Result<Tensor, FactorError>
    where
        F: FnMut(&DenseWindows, &[DenseWindows]) -> Result<Tensor, FactorError>,
    {
        for other in others {
            if other.win != self.win || other.rows != self.rows || other.cols != self.cols {
                return Err(FactorError::ShapeMismatch {
                    node: node.to_string(),
                    reason: format!(
                        "rolling inputs must share shape and window: {:?} vs {:?}",
                        other.shape(),
                        self.shape()
                    ),
                });
            }
        }
        if self.split.is_empty() {
            return Ok(Tensor::full_f64(Shape::grid(self.rows, 0), f64::NAN));
        }
        let mut parts = Vec::with_capacity(self.split.len());
        for &(start, end) in &self.split {
            let dense = self.adjust(start, end);
            let other_dense: Vec<DenseWindows> =
                others.iter().map(|other| other.adjust(start, end)).collect();
            let part = op(&dense, &other_dense)?;
            if part.shape().leading() != (self.rows, end - start) {
                return Err(FactorError::LayoutMismatch {
                    node: node.to_string(),
                    expected: (self.rows, end - start),
                    actual: part.shape().leading(),
                });
            }
            parts.push(part);
        }
        Tensor::concat_cols(node, parts)
    }

    fn reduce<F>(&self, node: &str, f: F) -> Result<Tensor, FactorError>
    where
        F: Fn(&[f64]) -> f64 + Sync + Send + Copy,
    {
        self.aggregate(node, &[], |dense, _| Ok(dense.reduce(f)))
    }

    pub fn sum(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| w.iter().sum())
    }

    pub fn nansum(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, stats::nansum)
    }

    pub fn nanprod(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, stats::nanprod)
    }

    pub fn mean(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| w.iter().sum::<f64>() / w.len() as f64)
    }

    pub fn nanmean(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, stats::nanmean)
    }

    /// Population standard deviation; any missing value makes the window missing.
    pub fn std(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| strict(w, |w| stats::nanstd(w, 0)))
    }

    pub fn nanstd(&self, node: &str, ddof: usize) -> Result<Tensor, FactorError> {
        self.reduce(node, move |w| stats::nanstd(w, ddof))
    }

    pub fn var(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| strict(w, |w| stats::nanvar(w, 0)))
    }

    pub fn nanvar(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| stats::nanvar(w, 0))
    }

    pub fn max(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| strict(w, stats::nanmax))
    }

    pub fn min(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, |w| strict(w, stats::nanmin))
    }

    pub fn nanmax(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, stats::nanmax)
    }

    pub fn nanmin(&self, node: &str) -> Result<Tensor, FactorError> {
        self.reduce(node, stats::nanmin)
    }

    /// Value at window slot `k`; the newest slot needs no adjustment.
    pub fn loc(&self, node: &str, k: usize) -> Result<Tensor, FactorError> {
        if k + 1 == self.win {
            return Ok(Tensor::from_f64(
                Shape::grid(self.rows, self.cols),
                self.reduce_raw(|w| w[k]),
            ));
        }
        self.reduce(node, move |w| w[k])
    }

    pub fn last(&self, node: &str) -> Result<Tensor, FactorError> {
        self.loc(node, self.win - 1)
    }

    pub fn first(&self, node: &str) -> Result<Tensor, FactorError> {
        self.loc(node, 0)
    }

    /// Present values per window, counted on raw data.
    pub fn count(&self) -> Tensor {
        Tensor::from_f64(
            Shape::grid(self.rows, self.cols),
            self.reduce_raw(|w| stats::nancount(w) as f64),
        )
    }

    /// Ordinal rank of the newest value inside its window, divided by `win`.
    pub fn rank_last(&self, node: &str, ascending: bool) -> Result<Tensor, FactorError> {
        let win = self.win as f64;
        self.reduce(node, move |w| {
            let ranks = stats::rankdata(w, ascending, RankMethod::Ordinal);
            ranks[ranks.len() - 1] / win
        })
    }
}

#[inline]
fn strict(window: &[f64], f: impl Fn(&[f64]) -> f64) -> f64 {
    if window.iter().any(|v| v.is_nan()) {
        f64::NAN
    } else {
        f(window)
    }
}

/// Chunk boundaries sized so each materialized chunk stays near a GiB budget.
fn chunk_bounds(rows: usize, cols: usize, win: usize, split_multiplier: f64) -> Vec<(usize, usize)> {
    if cols == 0 {
        return Vec::new();
    }
    let elements = (rows * cols * win) as f64;
    let memory = elements * win as f64 / GIB * split_multiplier;
    let step = if memory > 0.0 {
        ((cols as f64 / memory) as usize).max(1)
    } else {
        cols
    };
    (0..cols)
        .step_by(step)
        .map(|start| (start, (start + step).min(cols)))
        .collect()
}

/// Materialized `(rows, cols, win)` block of adjusted windows.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseWindows {
    rows: usize,
    cols: usize,
    win: usize,
    values: Vec<f64>,
}

impl DenseWindows {
    #[inline]
    pub fn shape(&self) -> Shape {
        Shape::new(self.rows, self.cols, self.win)
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn window(&self, row: usize, col: usize) -> &[f64] {
        let start = (row * self.cols + col) * self.win;
        &self.values[start..start + self.win]
    }

    /// One value per window, `(rows, cols)`.
    pub fn reduce<F>(&self, f: F) -> Tensor
    where
        F: Fn(&[f64]) -> f64 + Sync + Send,
    {
        let cells = self.rows * self.cols;
        Tensor::from_f64(
            Shape::grid(self.rows, self.cols),
            stats::reduce_rows(&self.values, self.win, cells, f),
        )
    }

    /// Pairs each window with the matching window of `other`, `(rows, cols, outputs)`.
    pub fn zip_reduce<F>(&self, other: &DenseWindows, outputs: usize, f: F) -> Tensor
    where
        F: Fn(&[f64], &[f64]) -> Vec<f64>,
    {
        debug_assert_eq!(self.shape(), other.shape());
        let mut out = Vec::with_capacity(self.rows * self.cols * outputs);
        for row in 0..self.rows {
            for col in 0..self.cols {
                let values = f(self.window(row, col), other.window(row, col));
                debug_assert_eq!(values.len(), outputs);
                out.extend(values);
            }
        }
        Tensor::from_f64(Shape::new(self.rows, self.cols, outputs), out)
    }
}

#[cfg(test)]
mod tests {
    use super::{chunk_bounds, RollingView};
    use crate::tensor::{Shape, Tensor};

    fn grouped(rows: usize, values: Vec<f64>) -> Tensor {
        let cols = values.len() / rows;
        Tensor::from_f64(Shape::grid(rows, cols), values)
    }

    #[test]
    fn windows_are_left_padded_with_missing() {
        let data = grouped(1, vec![1.0, 2.0, 3.0, 4.0]);
        let view = RollingView::new("t", &data, 3, None, 1.0).expect("view");
        let w0 = view.window(0, 0);
        assert!(w0[0].is_nan() && w0[1].is_nan());
        assert_eq!(w0[2], 1.0);
        let w1 = view.window(0, 1);
        assert!(w1[0].is_nan());
        assert_eq!(&w1[1..], &[1.0, 2.0]);
        assert_eq!(view.window(0, 2), &[1.0, 2.0, 3.0]);
        assert_eq!(view.window(0, 3), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn chunk_bounds_cover_every_column_once() {
        assert_eq!(chunk_bounds(1, 4, 3, 1.0), vec![(0, 4)]);
        let bounds = chunk_bounds(1, 4, 3, 1e9);
        assert_eq!(bounds, vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        assert!(chunk_bounds(2, 0, 3, 1.0).is_empty());
    }

    #[test]
    fn bool_input_is_rejected_with_upcast_hint() {
        let data = Tensor::from_bool(Shape::grid(1, 2), vec![true, false]);
        let err = RollingView::new("flag", &data, 2, None, 1.0).expect_err("bool rolling");
        assert!(err.to_string().contains("to_float"));
    }
}
