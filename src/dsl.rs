//! Builder methods that grow a factor graph.
//!
//! Every method returns a new node wired to its operands; nothing is computed here.
//! Builders whose window or parameters can be wrong return `Result` and reject bad
//! values immediately, before any run.

use crate::context::GroupBy;
use crate::error::FactorError;
use crate::node::{CustomKernel, Factor, Kernel, NodeKind, Operand};
use crate::ops::{Domain, KernelArgs, KernelInput, OpCode, OpParam, OperatorRegistry};
use crate::registry::DatetimeAttr;
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::sync::Arc;

#[allow(clippy::should_implement_trait)]
impl Factor {
    /// Raw panel column; delayed one period by default.
    pub fn column(name: &str) -> Factor {
        Factor::from_parts(
            NodeKind::Column {
                column: name.to_string(),
                adjustment: None,
            },
            Vec::new(),
            1,
            GroupBy::Asset,
        )
    }

    /// Panel column whose rolling windows are normalized by a cumulative multiplier column.
    pub fn adjustable_column(name: &str, multiplier: &str) -> Factor {
        Factor::from_parts(
            NodeKind::Column {
                column: name.to_string(),
                adjustment: Some(multiplier.to_string()),
            },
            Vec::new(),
            1,
            GroupBy::Asset,
        )
    }

    /// Per-asset category code; unmapped assets get `default`.
    pub fn classifier(mapping: impl IntoIterator<Item = (u32, f64)>, default: f64) -> Factor {
        Factor::from_parts(
            NodeKind::Classifier {
                mapping: mapping.into_iter().collect::<BTreeMap<_, _>>(),
                default,
            },
            Vec::new(),
            1,
            GroupBy::Asset,
        )
    }

    /// Calendar attribute of each row's date. Prefer `FactorRegistry::datetime` to share nodes.
    pub fn datetime(attr: DatetimeAttr) -> Factor {
        Factor::from_parts(NodeKind::Datetime { attr }, Vec::new(), 1, GroupBy::Asset)
    }

    /// User kernel over `inputs`; with `win > 1` every factor input arrives as a rolling view.
    pub fn custom<F>(
        name: &str,
        inputs: Vec<Operand>,
        win: usize,
        groupby: GroupBy,
        func: F,
    ) -> Result<Factor, FactorError>
    where
        F: Fn(&KernelArgs<'_>, &[KernelInput]) -> Result<Tensor, FactorError>
            + Send
            + Sync
            + 'static,
    {
        if win == 0 {
            return Err(FactorError::WindowTooSmall {
                node: name.to_string(),
                win,
                min_win: 1,
            });
        }
        let func: CustomKernel = Arc::new(func);
        Ok(Factor::from_parts(
            NodeKind::Compute {
                kernel: Kernel::Custom {
                    name: name.to_string(),
                    func,
                },
            },
            inputs,
            win,
            groupby,
        ))
    }

    /// Catalog op with validated arity and window.
    pub fn op(
        op: OpCode,
        param: OpParam,
        inputs: Vec<Operand>,
        win: usize,
    ) -> Result<Factor, FactorError> {
        let meta = OperatorRegistry::get_by_op(op);
        if !meta.arity.accepts(inputs.len()) {
            return Err(FactorError::InvalidArity {
                node: meta.name.to_string(),
                expected: meta.arity.max,
                actual: inputs.len(),
            });
        }
        if win < meta.min_win {
            return Err(FactorError::WindowTooSmall {
                node: meta.name.to_string(),
                win,
                min_win: meta.min_win,
            });
        }
        if meta.domain != Domain::Ts && win != 1 {
            return Err(FactorError::InvalidParam {
                node: meta.name.to_string(),
                param: "win",
                reason: format!("`{}` reads one step, got win {win}", meta.name),
            });
        }
        let groupby = match meta.domain {
            Domain::Cs => GroupBy::Date,
            Domain::Elem | Domain::Ts => GroupBy::Asset,
        };
        Ok(Factor::from_parts(
            NodeKind::Compute {
                kernel: Kernel::Op { op, param },
            },
            inputs,
            win,
            groupby,
        ))
    }

    /// Single-step op whose operand count is fixed by the calling method.
    fn elem(op: OpCode, param: OpParam, inputs: Vec<Operand>) -> Factor {
        Factor::from_parts(
            NodeKind::Compute {
                kernel: Kernel::Op { op, param },
            },
            inputs,
            1,
            GroupBy::Asset,
        )
    }

    fn unary(&self, op: OpCode) -> Factor {
        Self::elem(op, OpParam::None, vec![self.into()])
    }

    fn binary(&self, op: OpCode, rhs: impl Into<Operand>) -> Factor {
        Self::elem(op, OpParam::None, vec![self.into(), rhs.into()])
    }

    fn rolling(&self, op: OpCode, param: OpParam, win: usize) -> Result<Factor, FactorError> {
        Self::op(op, param, vec![self.into()], win)
    }

    fn cross_section(&self, op: OpCode, param: OpParam) -> Factor {
        self.cross_section_by(op, param, GroupBy::Date)
    }

    fn cross_section_by(&self, op: OpCode, param: OpParam, groupby: GroupBy) -> Factor {
        Factor::from_parts(
            NodeKind::Compute {
                kernel: Kernel::Op { op, param },
            },
            vec![self.into()],
            1,
            groupby,
        )
    }

    /// Output count per cell when it is known before the data is seen.
    pub fn outputs(&self) -> Option<usize> {
        match self.kind() {
            NodeKind::Compute {
                kernel: Kernel::Op { op, .. },
            } => Some(OperatorRegistry::get_by_op(*op).outputs).filter(|n| *n > 0),
            NodeKind::Compute {
                kernel: Kernel::Custom { .. },
            } => None,
            _ => Some(1),
        }
    }

    pub fn add(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemAdd, rhs)
    }

    pub fn sub(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemSub, rhs)
    }

    pub fn mul(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemMul, rhs)
    }

    pub fn div(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemDiv, rhs)
    }

    pub fn rem(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemMod, rhs)
    }

    pub fn pow(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemPow, rhs)
    }

    /// `lhs - self`, for scalars on the left.
    pub fn rsub(&self, lhs: f64) -> Factor {
        Self::elem(OpCode::ElemSub, OpParam::None, vec![lhs.into(), self.into()])
    }

    pub fn rdiv(&self, lhs: f64) -> Factor {
        Self::elem(OpCode::ElemDiv, OpParam::None, vec![lhs.into(), self.into()])
    }

    pub fn neg(&self) -> Factor {
        self.unary(OpCode::ElemNeg)
    }

    pub fn abs(&self) -> Factor {
        self.unary(OpCode::ElemAbs)
    }

    pub fn log(&self) -> Factor {
        self.unary(OpCode::ElemLog)
    }

    pub fn sign(&self) -> Factor {
        self.unary(OpCode::ElemSign)
    }

    pub fn lt(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemLt, rhs)
    }

    pub fn le(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemLe, rhs)
    }

    pub fn gt(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemGt, rhs)
    }

    pub fn ge(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemGe, rhs)
    }

    pub fn equals(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemEq, rhs)
    }

    pub fn not_equals(&self, rhs: impl Into<Operand>) -> Factor {
        self.binary(OpCode::ElemNe, rhs)
    }

    pub fn logical_and(&self, rhs: &Factor) -> Factor {
        self.binary(OpCode::ElemAnd, rhs)
    }

    pub fn logical_or(&self, rhs: &Factor) -> Factor {
        self.binary(OpCode::ElemOr, rhs)
    }

    pub fn logical_not(&self) -> Factor {
        self.unary(OpCode::ElemNot)
    }

    pub fn fill_na(&self, value: f64) -> Factor {
        Self::elem(OpCode::ElemFillNa, OpParam::Fill(value), vec![self.into()])
    }

    /// Replaces values where `mask` is true with `fill`.
    pub fn masked_fill(&self, mask: &Factor, fill: f64) -> Factor {
        Self::elem(
            OpCode::ElemMaskedFill,
            OpParam::Fill(fill),
            vec![self.into(), mask.into()],
        )
    }

    pub fn clamp(&self, lo: f64, hi: f64) -> Result<Factor, FactorError> {
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(FactorError::InvalidParam {
                node: "clamp".to_string(),
                param: "bounds",
                reason: format!("need lo <= hi, got [{lo}, {hi}]"),
            });
        }
        Ok(Self::elem(
            OpCode::ElemClamp,
            OpParam::Clamp { lo, hi },
            vec![self.into()],
        ))
    }

    /// This factor with everything outside `mask` set to missing.
    pub fn filter(&self, mask: &Factor) -> Factor {
        let filtered = self.unary(OpCode::ElemFilter);
        filtered.set_mask(Some(mask.clone()));
        filtered
    }

    /// Moves values `periods` steps later in time (earlier when negative).
    pub fn shift(&self, periods: isize) -> Factor {
        Self::elem(OpCode::ElemShift, OpParam::Periods(periods), vec![self.into()])
    }

    /// Forward-fills missing values within each asset.
    pub fn pad(&self) -> Factor {
        self.unary(OpCode::ElemPad)
    }

    /// Column scaled by `multiplier / last(multiplier)`; needs an adjustable column.
    pub fn adjusted(&self) -> Result<Factor, FactorError> {
        match self.kind() {
            NodeKind::Column {
                adjustment: Some(_),
                ..
            } => Ok(self.unary(OpCode::ElemAdjusted)),
            _ => Err(FactorError::InvalidParam {
                node: self.name().to_string(),
                param: "adjustment",
                reason: "only an adjustable column can be adjusted".to_string(),
            }),
        }
    }

    /// Picks one output of a multi-output factor.
    pub fn select(&self, index: usize) -> Result<Factor, FactorError> {
        if let Some(outputs) = self.outputs() {
            if outputs <= 1 || index >= outputs {
                return Err(FactorError::SelectOutOfBounds {
                    node: self.name().to_string(),
                    outputs,
                    index,
                });
            }
        }
        Ok(Self::elem(
            OpCode::ElemSelect,
            OpParam::Select(index),
            vec![self.into()],
        ))
    }

    pub fn to_float(&self) -> Factor {
        self.unary(OpCode::ElemToFloat)
    }

    /// One bool output per distinct value seen in the run, in ascending order.
    pub fn one_hot(&self) -> Factor {
        self.unary(OpCode::ElemOneHot)
    }

    pub fn sum(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsSum, OpParam::None, win)
    }

    pub fn product(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsProduct, OpParam::None, win)
    }

    pub fn mean(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsMean, OpParam::None, win)
    }

    pub fn std(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsStd, OpParam::None, win)
    }

    pub fn var(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsVar, OpParam::None, win)
    }

    pub fn max(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsMax, OpParam::None, win)
    }

    pub fn min(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsMin, OpParam::None, win)
    }

    pub fn count(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsCount, OpParam::None, win)
    }

    /// Rank of the newest value inside its window, scaled to `(0, 1]`.
    pub fn ts_rank(&self, win: usize, ascending: bool) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsRank, OpParam::Ascending(ascending), win)
    }

    pub fn returns(&self, win: usize) -> Result<Factor, FactorError> {
        self.rolling(OpCode::TsReturns, OpParam::None, win)
    }

    pub fn any(&self, win: usize) -> Result<Factor, FactorError> {
        self.to_float().rolling(OpCode::TsAny, OpParam::None, win)
    }

    pub fn all(&self, win: usize) -> Result<Factor, FactorError> {
        self.to_float().rolling(OpCode::TsAll, OpParam::None, win)
    }

    pub fn corr(&self, other: &Factor, win: usize) -> Result<Factor, FactorError> {
        Self::op(OpCode::TsCorr, OpParam::None, vec![self.into(), other.into()], win)
    }

    pub fn cov(&self, other: &Factor, win: usize) -> Result<Factor, FactorError> {
        Self::op(OpCode::TsCov, OpParam::None, vec![self.into(), other.into()], win)
    }

    /// Rolling regression of `self` on `x`; two outputs, `select(0)` slope and `select(1)` intercept.
    pub fn linear_regression(&self, x: &Factor, win: usize) -> Result<Factor, FactorError> {
        Self::op(
            OpCode::TsLinearRegression,
            OpParam::None,
            vec![self.into(), x.into()],
            win,
        )
    }

    pub fn rank(&self, ascending: bool) -> Factor {
        self.cross_section(OpCode::CsRank, OpParam::Ascending(ascending))
    }

    /// True for the `n` largest values of each date.
    pub fn top(&self, n: usize) -> Factor {
        self.rank(false).le(n as f64)
    }

    /// True for the `n` smallest values of each date.
    pub fn bottom(&self, n: usize) -> Factor {
        self.rank(true).le(n as f64)
    }

    pub fn zscore(&self) -> Factor {
        self.cross_section(OpCode::CsZscore, OpParam::None)
    }

    pub fn zscore_by(&self, groupby: GroupBy) -> Factor {
        self.cross_section_by(OpCode::CsZscore, OpParam::None, groupby)
    }

    pub fn zscore_weighted(&self, weight: &Factor) -> Factor {
        Factor::from_parts(
            NodeKind::Compute {
                kernel: Kernel::Op {
                    op: OpCode::CsZscore,
                    param: OpParam::None,
                },
            },
            vec![self.into(), weight.into()],
            1,
            GroupBy::Date,
        )
    }

    pub fn demean(&self) -> Factor {
        self.cross_section(OpCode::CsDemean, OpParam::None)
    }

    /// Demeans inside each group of `groupby` instead of each date.
    pub fn demean_by(&self, groupby: GroupBy) -> Factor {
        self.cross_section_by(OpCode::CsDemean, OpParam::None, groupby)
    }

    /// Demeans each date separately within every group code of `groups`, e.g. a sector
    /// classifier.
    pub fn demean_within(&self, groups: &Factor) -> Factor {
        Factor::from_parts(
            NodeKind::Compute {
                kernel: Kernel::Op {
                    op: OpCode::CsGroupDemean,
                    param: OpParam::None,
                },
            },
            vec![self.into(), groups.into()],
            1,
            GroupBy::Date,
        )
    }

    pub fn quantile(&self, bins: usize) -> Result<Factor, FactorError> {
        self.quantile_by(bins, GroupBy::Date)
    }

    pub fn quantile_by(&self, bins: usize, groupby: GroupBy) -> Result<Factor, FactorError> {
        if bins == 0 {
            return Err(FactorError::InvalidParam {
                node: "quantile".to_string(),
                param: "bins",
                reason: "bins must be positive".to_string(),
            });
        }
        Ok(self.cross_section_by(OpCode::CsQuantile, OpParam::Bins(bins), groupby))
    }

    pub fn to_weight(&self, demean: bool) -> Factor {
        self.cross_section(OpCode::CsToWeight, OpParam::Demean(demean))
    }

    /// Clamps each date's tails at the `z` and `1 - z` quantiles.
    pub fn winsorize(&self, z: f64) -> Result<Factor, FactorError> {
        check_tail("winsorize", z)?;
        Ok(self.cross_section(OpCode::CsWinsorize, OpParam::Z(z)))
    }

    /// Clamps at quantiles taken over every date of the run together.
    pub fn winsorize_panel(&self, z: f64) -> Result<Factor, FactorError> {
        check_tail("winsorize_panel", z)?;
        Ok(self.cross_section(OpCode::CsWinsorizePanel, OpParam::Z(z)))
    }

    pub fn mad_clamp(&self, z: f64) -> Result<Factor, FactorError> {
        if !(z.is_finite() && z > 0.0) {
            return Err(FactorError::InvalidParam {
                node: "mad_clamp".to_string(),
                param: "z",
                reason: format!("z must be a positive number, got {z}"),
            });
        }
        Ok(self.cross_section(OpCode::CsMadClamp, OpParam::Z(z)))
    }
}

fn check_tail(node: &str, z: f64) -> Result<(), FactorError> {
    if z > 0.0 && z < 1.0 {
        return Ok(());
    }
    Err(FactorError::InvalidParam {
        node: node.to_string(),
        param: "z",
        reason: format!("z must be in (0, 1), got {z}"),
    })
}
