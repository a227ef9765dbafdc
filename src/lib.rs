pub mod config;
pub mod context;
mod dsl;
pub mod error;
pub mod graph;
pub mod lane;
pub mod layout;
pub mod node;
pub mod ops;
pub mod panel;
pub mod pipeline;
pub mod registry;
pub mod tensor;

pub use config::{Device, Precision, RunConfig};
pub use context::{GroupBy, RunContext};
pub use error::FactorError;
pub use graph::{GraphView, InputView, NodeView};
pub use lane::{Event, Lane, Output};
pub use layout::{GroupLayout, Layout, RollingView};
pub use node::{Factor, FactorNode, Kernel, NodeKind, Operand};
pub use ops::{KernelArgs, KernelInput, OpCode, OpParam, OperatorRegistry};
pub use panel::Panel;
pub use pipeline::{Pipeline, PipelineOutput};
pub use registry::{DatetimeAttr, FactorRegistry};
pub use tensor::{DType, Shape, Tensor, TensorData};

#[cfg(test)]
mod tests;
