//! Array layouts a node reads its inputs in.
//!
//! `groupby` turns flat panel columns into dense `(groups, width)` arrays and back;
//! `rolling` turns a grouped array into overlapping time windows.

pub mod groupby;
pub mod rolling;

pub use groupby::{GroupLayout, WholeLayout, INVALID_SLOT};
pub use rolling::{DenseWindows, RollingView};

use crate::error::FactorError;
use crate::tensor::{DType, Tensor};

/// A built layout for one group key over one run's rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Layout {
    Grouped(GroupLayout),
    Whole(WholeLayout),
}

impl Layout {
    pub fn grouped(keys: &[i64]) -> Result<Self, FactorError> {
        GroupLayout::build(keys).map(Self::Grouped)
    }

    pub fn whole(rows: usize) -> Self {
        Self::Whole(WholeLayout::new(rows))
    }

    /// Original (flat) row count.
    pub fn rows(&self) -> usize {
        match self {
            Self::Grouped(layout) => layout.rows(),
            Self::Whole(layout) => layout.rows(),
        }
    }

    pub fn groups(&self) -> usize {
        match self {
            Self::Grouped(layout) => layout.groups(),
            Self::Whole(_) => 1,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Self::Grouped(layout) => layout.width(),
            Self::Whole(layout) => layout.rows(),
        }
    }

    #[inline]
    pub fn padded_shape(&self) -> (usize, usize) {
        (self.groups(), self.width())
    }

    /// Key of each group row; `None` for the single-group layout.
    pub fn group_keys(&self) -> Option<&[i64]> {
        match self {
            Self::Grouped(layout) => Some(layout.group_keys()),
            Self::Whole(_) => None,
        }
    }

    pub fn split(&self, node: &str, data: &Tensor) -> Result<Tensor, FactorError> {
        match self {
            Self::Grouped(layout) => layout.split(node, data),
            Self::Whole(layout) => layout.split(node, data),
        }
    }

    pub fn revert(&self, node: &str, padded: &Tensor) -> Result<Tensor, FactorError> {
        match self {
            Self::Grouped(layout) => layout.revert(node, padded),
            Self::Whole(layout) => layout.revert(node, padded),
        }
    }

    pub fn create(&self, node: &str, dtype: DType, fill: f64) -> Result<Tensor, FactorError> {
        match self {
            Self::Grouped(layout) => layout.create(node, dtype, fill),
            Self::Whole(layout) => layout.create(node, dtype, fill),
        }
    }
}
