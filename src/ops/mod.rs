//! Operator layer entry.
//!
//! Extension path (minimal touch points):
//! 1) implement kernel in `elem.rs` / `ts.rs` / `cs.rs`,
//! 2) add opcode in `spec.rs` and register meta in `catalog.rs` (`OP_METAS`),
//! 3) add a builder on `Factor` in `dsl.rs` and a test in `src/tests`.

use crate::error::FactorError;
use crate::layout::RollingView;
use crate::tensor::Tensor;

/// Call-site facts a kernel may need besides its inputs.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<'a> {
    /// Display name of the node being computed, for error messages.
    pub node: &'a str,
    pub param: OpParam,
    pub win: usize,
    /// The node's mask, already in the node's own layout.
    pub mask: Option<&'a Tensor>,
    /// Adjustment multiplier of each input, in the node's own layout.
    pub adjustments: &'a [Option<Tensor>],
}

impl KernelArgs<'_> {
    #[inline]
    pub fn expect_arity(&self, inputs: &[KernelInput], expected: usize) -> Result<(), FactorError> {
        if inputs.len() != expected {
            return Err(FactorError::InvalidArity {
                node: self.node.to_string(),
                expected,
                actual: inputs.len(),
            });
        }
        Ok(())
    }
}

/// One formatted operand: a grouped array, a rolling view over one, or a constant.
#[derive(Debug, Clone)]
pub enum KernelInput {
    Tensor(Tensor),
    Rolling(RollingView),
    Scalar(f64),
}

impl KernelInput {
    pub fn tensor(&self, node: &str) -> Result<&Tensor, FactorError> {
        match self {
            Self::Tensor(tensor) => Ok(tensor),
            Self::Rolling(_) => Err(FactorError::InvalidParam {
                node: node.to_string(),
                param: "win",
                reason: "operator reads single values, not rolling windows".to_string(),
            }),
            Self::Scalar(_) => Err(FactorError::InvalidParam {
                node: node.to_string(),
                param: "inputs",
                reason: "operator needs a factor input, got a scalar".to_string(),
            }),
        }
    }

    pub fn rolling(&self, node: &str) -> Result<&RollingView, FactorError> {
        match self {
            Self::Rolling(view) => Ok(view),
            _ => Err(FactorError::InvalidParam {
                node: node.to_string(),
                param: "win",
                reason: "operator reads rolling windows, node win must be > 1".to_string(),
            }),
        }
    }

    #[inline]
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }
}

pub type OpKernel = fn(&KernelArgs<'_>, &[KernelInput]) -> Result<Tensor, FactorError>;

pub mod catalog;
pub mod spec;
pub mod stats;

mod cs;
mod elem;
mod ts;

pub use catalog::{Arity, OpMeta, OperatorRegistry};
pub use spec::{Domain, OpCode, OpParam};
