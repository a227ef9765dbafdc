//! The factor graph node and its two-phase run protocol.
//!
//! A run calls [`FactorNode::pre_compute`] on every root, then [`FactorNode::compute`]
//! on every root, then [`FactorNode::clean_up`]. `pre_compute` counts how many
//! consumers will ask for a node; `compute` hands the first consumer a freshly computed
//! [`Output`] and the rest the cached one, so each node runs its kernel at most once per
//! run. The counting lives here and nowhere else; kernels only see formatted inputs.

use crate::context::{GroupBy, RunContext};
use crate::error::FactorError;
use crate::lane::{panic_message, Event, Lane, Output};
use crate::layout::{Layout, RollingView};
use crate::ops::{KernelArgs, KernelInput, OpCode, OpParam, OperatorRegistry};
use crate::registry::DatetimeAttr;
use crate::tensor::{DType, Tensor, TensorData};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub type CustomKernel =
    Arc<dyn Fn(&KernelArgs<'_>, &[KernelInput]) -> Result<Tensor, FactorError> + Send + Sync>;

#[derive(Clone)]
pub enum Kernel {
    Op { op: OpCode, param: OpParam },
    Custom { name: String, func: CustomKernel },
}

impl Kernel {
    pub fn name(&self) -> &str {
        match self {
            Self::Op { op, .. } => OperatorRegistry::get_by_op(*op).name,
            Self::Custom { name, .. } => name,
        }
    }

    pub fn param(&self) -> OpParam {
        match self {
            Self::Op { param, .. } => *param,
            Self::Custom { .. } => OpParam::None,
        }
    }

    fn call(&self, args: &KernelArgs<'_>, inputs: &[KernelInput]) -> Result<Tensor, FactorError> {
        match self {
            Self::Op { op, .. } => (OperatorRegistry::get_by_op(*op).kernel)(args, inputs),
            Self::Custom { func, .. } => func(args, inputs),
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Op { op, param } => f
                .debug_struct("Op")
                .field("op", op)
                .field("param", param)
                .finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Panel column, optionally carrying a cumulative adjustment multiplier column.
    Column {
        column: String,
        adjustment: Option<String>,
    },
    /// Static per-asset category code.
    Classifier {
        mapping: BTreeMap<u32, f64>,
        default: f64,
    },
    Datetime { attr: DatetimeAttr },
    Compute { kernel: Kernel },
}

impl NodeKind {
    pub fn label(&self) -> &str {
        match self {
            Self::Column { column, .. } => column,
            Self::Classifier { .. } => "classifier",
            Self::Datetime { attr } => match attr {
                DatetimeAttr::Year => "year",
                DatetimeAttr::Month => "month",
                DatetimeAttr::Day => "day",
                DatetimeAttr::Weekday => "weekday",
                DatetimeAttr::DayOfYear => "day_of_year",
            },
            Self::Compute { kernel } => kernel.name(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Factor(Factor),
    Scalar(f64),
}

impl From<Factor> for Operand {
    fn from(factor: Factor) -> Self {
        Self::Factor(factor)
    }
}

impl From<&Factor> for Operand {
    fn from(factor: &Factor) -> Self {
        Self::Factor(factor.clone())
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

#[derive(Debug, Clone)]
struct SourceData {
    values: Arc<Tensor>,
    adjustment: Option<Arc<Tensor>>,
}

#[derive(Debug, Default)]
struct RunState {
    ref_count: usize,
    cache: Option<Output>,
    /// Fires when the cached output is complete on its producing lane.
    cache_event: Option<Event>,
    /// Run that produced `cache`.
    cache_run: Option<u64>,
    clean_required: bool,
    ctx: Option<Arc<RunContext>>,
    source: Option<SourceData>,
}

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(1);

pub struct FactorNode {
    id: usize,
    name: String,
    kind: NodeKind,
    inputs: Vec<Operand>,
    win: usize,
    groupby: GroupBy,
    mask: RwLock<Option<Factor>>,
    force_delay: RwLock<Option<bool>>,
    keep_cache: AtomicBool,
    backwards: Mutex<Option<usize>>,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for FactorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactorNode")
            .field("name", &self.name)
            .field("win", &self.win)
            .field("groupby", &self.groupby)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

/// Shared handle to a graph node; cloning shares the node.
#[derive(Clone)]
pub struct Factor(Arc<FactorNode>);

impl std::ops::Deref for Factor {
    type Target = FactorNode;

    fn deref(&self) -> &FactorNode {
        &self.0
    }
}

impl std::fmt::Debug for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl Factor {
    pub(crate) fn from_parts(
        kind: NodeKind,
        inputs: Vec<Operand>,
        win: usize,
        groupby: GroupBy,
    ) -> Self {
        let id = NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}#{id}", kind.label());
        Self(Arc::new(FactorNode {
            id,
            name,
            kind,
            inputs,
            win,
            groupby,
            mask: RwLock::new(None),
            force_delay: RwLock::new(None),
            keep_cache: AtomicBool::new(false),
            backwards: Mutex::new(None),
            state: Mutex::new(RunState::default()),
        }))
    }

    /// Same node, not merely equal configuration.
    pub fn same(&self, other: &Factor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl FactorNode {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Operand] {
        &self.inputs
    }

    #[inline]
    pub fn win(&self) -> usize {
        self.win
    }

    pub fn groupby(&self) -> &GroupBy {
        &self.groupby
    }

    pub fn mask(&self) -> Option<Factor> {
        self.mask.read().clone()
    }

    /// Masked positions of every input read as missing before the kernel runs.
    pub fn set_mask(&self, mask: Option<Factor>) {
        *self.mask.write() = mask;
        *self.backwards.lock() = None;
    }

    /// `None` follows the inputs; `Some` forces the answer.
    pub fn set_delay(&self, delay: Option<bool>) {
        *self.force_delay.write() = delay;
    }

    /// Keeps the computed output alive after the last consumer, until a forced clean-up.
    pub fn set_keep_cache(&self, keep: bool) {
        self.keep_cache.store(keep, Ordering::Relaxed);
    }

    #[inline]
    pub fn keep_cache(&self) -> bool {
        self.keep_cache.load(Ordering::Relaxed)
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn has_cache(&self) -> bool {
        self.state.lock().cache.is_some()
    }

    fn factor_inputs(&self) -> impl Iterator<Item = &Factor> {
        self.inputs.iter().filter_map(|input| match input {
            Operand::Factor(factor) => Some(factor),
            Operand::Scalar(_) => None,
        })
    }

    /// Whether the value must be shifted one period before it is exposed.
    pub fn should_delay(&self) -> bool {
        if let Some(forced) = *self.force_delay.read() {
            return forced;
        }
        match &self.kind {
            NodeKind::Column { .. } => true,
            NodeKind::Classifier { .. } | NodeKind::Datetime { .. } => false,
            NodeKind::Compute { .. } => self.factor_inputs().any(|input| input.should_delay()),
        }
    }

    /// Extra leading time steps this node and all its upstreams need.
    pub fn total_backwards(&self) -> usize {
        if let Some(cached) = *self.backwards.lock() {
            return cached;
        }
        let upstream = self
            .factor_inputs()
            .map(|input| input.total_backwards())
            .max()
            .unwrap_or(0);
        let mut total = upstream + self.win - 1;
        if let Some(mask) = self.mask() {
            total = total.max(mask.total_backwards());
        }
        *self.backwards.lock() = Some(total);
        total
    }

    /// Registers one more consumer for this run; only the first call walks upstream.
    pub fn pre_compute(&self, ctx: &Arc<RunContext>) -> Result<(), FactorError> {
        let walk_upstream = {
            let mut state = self.state.lock();
            state.clean_required = true;
            state.ref_count += 1;
            if state.ref_count > 1 {
                return Ok(());
            }
            state.ctx = Some(Arc::clone(ctx));
            let kept = state.cache.is_some() && state.cache_run == Some(ctx.id());
            if !kept {
                state.cache = None;
                state.cache_event = None;
                state.cache_run = None;
            }
            if self.keep_cache() {
                state.ref_count += 1;
            }
            !kept
        };
        debug!("prepare `{}`", self.name);
        if !walk_upstream {
            return Ok(());
        }

        ctx.layout(&self.groupby)?;
        for input in self.factor_inputs() {
            input.pre_compute(ctx)?;
        }
        if let Some(mask) = self.mask() {
            mask.pre_compute(ctx)?;
        }
        let source = match &self.kind {
            NodeKind::Column { column, adjustment } => Some(SourceData {
                values: ctx.column(column)?,
                adjustment: adjustment
                    .as_deref()
                    .map(|name| ctx.column(name))
                    .transpose()?,
            }),
            NodeKind::Datetime { attr } => Some(SourceData {
                values: ctx.datetime(*attr),
                adjustment: None,
            }),
            NodeKind::Classifier { .. } | NodeKind::Compute { .. } => None,
        };
        self.state.lock().source = source;
        Ok(())
    }

    /// Flat adjustment multiplier of a column node loaded for the current run.
    fn adjustment(&self) -> Option<Arc<Tensor>> {
        self.state
            .lock()
            .source
            .as_ref()
            .and_then(|source| source.adjustment.clone())
    }

    /// Produces this node's output for one consumer, computing it on first request.
    ///
    /// With `lane` set, work is enqueued instead of run: a shared node opens its own
    /// lane and makes `lane` wait on it, so independent subgraphs overlap. The returned
    /// output is then fulfilled asynchronously; kernel errors surface through it.
    pub fn compute(&self, lane: Option<&Lane>) -> Result<Output, FactorError> {
        let (ctx, shared) = {
            let mut state = self.state.lock();
            if state.ref_count == 0 {
                return Err(FactorError::RefCountUnderflow {
                    node: self.name.clone(),
                });
            }
            state.ref_count -= 1;
            if let Some(cache) = state.cache.clone() {
                if let (Some(lane), Some(event)) = (lane, state.cache_event.as_ref()) {
                    lane.wait_event(event);
                }
                trace!("cache hit `{}`, {} consumer(s) left", self.name, state.ref_count);
                if state.ref_count == 0 {
                    state.cache = None;
                    state.cache_event = None;
                    state.cache_run = None;
                    debug!("release cache `{}`", self.name);
                }
                return Ok(cache);
            }
            let ctx = state.ctx.clone().ok_or_else(|| FactorError::NotPrepared {
                node: self.name.clone(),
            })?;
            (ctx, state.ref_count > 0)
        };

        let own_lane = match lane {
            Some(_) if shared => {
                let opened = ctx.lanes().open()?;
                debug!("`{}` runs on lane {}", self.name, opened.id());
                Some(opened)
            }
            _ => None,
        };
        let exec = own_lane.as_deref().or(lane);

        let job = self.prepare_job(&ctx, exec)?;
        let output = match exec {
            Some(exec) => {
                let output = Output::pending();
                let slot = output.clone();
                exec.submit(move || slot.fulfill(job.run_guarded().map(Arc::new)));
                output
            }
            None => Output::ready(Ok(Arc::new(job.run_guarded()?))),
        };

        let event = own_lane.as_ref().map(|own| {
            let event = own.record_event();
            if let Some(caller) = lane {
                caller.wait_event(&event);
            }
            event
        });

        if shared {
            let mut state = self.state.lock();
            state.cache = Some(output.clone());
            state.cache_event = event;
            state.cache_run = Some(ctx.id());
        }
        Ok(output)
    }

    /// Computes mask and inputs on `exec` and captures what the kernel job needs.
    fn prepare_job(
        &self,
        ctx: &Arc<RunContext>,
        exec: Option<&Lane>,
    ) -> Result<ComputeJob, FactorError> {
        let layout = ctx.layout(&self.groupby)?;
        let source = self.state.lock().source.clone();
        let mask = match self.mask() {
            Some(mask) => Some(JobInput {
                output: mask.compute(exec)?,
                layout: ctx.layout(mask.groupby())?,
                adjustment: None,
            }),
            None => None,
        };
        let body = match &self.kind {
            NodeKind::Column { .. } | NodeKind::Datetime { .. } => {
                let source = source.ok_or_else(|| FactorError::NotPrepared {
                    node: self.name.clone(),
                })?;
                JobBody::Source {
                    values: source.values,
                }
            }
            NodeKind::Classifier { mapping, default } => JobBody::Classifier {
                mapping: mapping.clone(),
                default: *default,
            },
            NodeKind::Compute { kernel } => {
                let mut operands = Vec::with_capacity(self.inputs.len());
                for input in &self.inputs {
                    operands.push(match input {
                        Operand::Factor(factor) => JobOperand::Factor(JobInput {
                            output: factor.compute(exec)?,
                            layout: ctx.layout(factor.groupby())?,
                            adjustment: factor.adjustment(),
                        }),
                        Operand::Scalar(value) => JobOperand::Scalar(*value),
                    });
                }
                JobBody::Kernel {
                    kernel: kernel.clone(),
                    operands,
                }
            }
        };
        Ok(ComputeJob {
            node: self.name.clone(),
            win: self.win,
            split_multiplier: ctx.config().rolling_split_multiplier,
            layout,
            mask,
            body,
        })
    }

    /// Drops run state and recurses upstream; a no-op unless this run touched the node.
    pub fn clean_up(&self, force: bool) {
        {
            let mut state = self.state.lock();
            if !state.clean_required && !force {
                return;
            }
            state.clean_required = false;
            if !self.keep_cache() || force {
                state.cache = None;
                state.cache_event = None;
                state.cache_run = None;
            }
            state.ref_count = 0;
            state.ctx = None;
            state.source = None;
        }
        *self.backwards.lock() = None;
        trace!("clean up `{}` (force: {force})", self.name);
        for input in self.factor_inputs() {
            input.clean_up(force);
        }
        if let Some(mask) = self.mask() {
            mask.clean_up(force);
        }
    }
}

/// One upstream output plus the layout it is expressed in.
struct JobInput {
    output: Output,
    layout: Arc<Layout>,
    adjustment: Option<Arc<Tensor>>,
}

enum JobOperand {
    Factor(JobInput),
    Scalar(f64),
}

enum JobBody {
    Source {
        values: Arc<Tensor>,
    },
    Classifier {
        mapping: BTreeMap<u32, f64>,
        default: f64,
    },
    Kernel {
        kernel: Kernel,
        operands: Vec<JobOperand>,
    },
}

/// Everything a node's kernel run needs, detached from the graph so it can move to a lane.
struct ComputeJob {
    node: String,
    win: usize,
    split_multiplier: f64,
    layout: Arc<Layout>,
    mask: Option<JobInput>,
    body: JobBody,
}

impl ComputeJob {
    /// Runs the job, turning a kernel panic into an error for every consumer.
    fn run_guarded(self) -> Result<Tensor, FactorError> {
        let node = self.node.clone();
        panic::catch_unwind(AssertUnwindSafe(|| self.run())).unwrap_or_else(|payload| {
            Err(FactorError::KernelPanicked {
                node,
                reason: panic_message(&*payload),
            })
        })
    }

    fn run(self) -> Result<Tensor, FactorError> {
        let mask = self.mask_tensor()?;
        let out = match &self.body {
            JobBody::Source { values } => {
                let data = self.layout.split(&self.node, values)?;
                self.masked(data, mask.as_ref())?
            }
            JobBody::Classifier { mapping, default } => {
                let data = self.classify(mapping, *default)?;
                self.masked(data, mask.as_ref())?
            }
            JobBody::Kernel { kernel, operands } => {
                self.run_kernel(kernel, operands, mask.as_ref())?
            }
        };
        if out.shape().leading() != self.layout.padded_shape() {
            return Err(FactorError::LayoutMismatch {
                node: self.node,
                expected: self.layout.padded_shape(),
                actual: out.shape().leading(),
            });
        }
        Ok(out)
    }

    fn classify(&self, mapping: &BTreeMap<u32, f64>, default: f64) -> Result<Tensor, FactorError> {
        let keys = self
            .layout
            .group_keys()
            .ok_or_else(|| FactorError::InvalidParam {
                node: self.node.clone(),
                param: "groupby",
                reason: "classifier needs a keyed layout".to_string(),
            })?;
        let codes: Vec<f64> = keys
            .iter()
            .map(|&key| {
                u32::try_from(key)
                    .ok()
                    .and_then(|asset| mapping.get(&asset).copied())
                    .unwrap_or(default)
            })
            .collect();
        // Valid slots hold 1.0 and padding NaN, so scaling by the code keeps padding missing.
        let ones = self.layout.create(&self.node, DType::Float, 1.0)?;
        let width = self.layout.width();
        let values = ones
            .float_values(&self.node, "classifier")?
            .iter()
            .enumerate()
            .map(|(cell, one)| one * codes[cell / width])
            .collect();
        Ok(Tensor::from_f64(ones.shape(), values))
    }

    /// Brings an upstream output into this node's layout.
    fn regroup(&self, input: &JobInput) -> Result<Tensor, FactorError> {
        let raw = input.output.wait()?;
        if Arc::ptr_eq(&input.layout, &self.layout) {
            return Ok(raw.as_ref().clone());
        }
        let flat = input.layout.revert(&self.node, &raw)?;
        self.layout.split(&self.node, &flat)
    }

    /// The mask output in this node's layout; must be bool.
    fn mask_tensor(&self) -> Result<Option<Tensor>, FactorError> {
        let Some(input) = &self.mask else {
            return Ok(None);
        };
        let mask = self.regroup(input)?;
        if mask.dtype() != DType::Bool {
            return Err(FactorError::InvalidMask {
                node: self.node.clone(),
                dtype: mask.dtype().name(),
            });
        }
        Ok(Some(mask))
    }

    fn masked(&self, data: Tensor, mask: Option<&Tensor>) -> Result<Tensor, FactorError> {
        match mask {
            Some(mask) => apply_mask(&self.node, data, mask),
            None => Ok(data),
        }
    }

    fn run_kernel(
        &self,
        kernel: &Kernel,
        operands: &[JobOperand],
        mask: Option<&Tensor>,
    ) -> Result<Tensor, FactorError> {
        trace!("kernel `{}`", self.node);
        let mut inputs = Vec::with_capacity(operands.len());
        let mut adjustments = Vec::with_capacity(operands.len());
        for operand in operands {
            let input = match operand {
                JobOperand::Scalar(value) => {
                    inputs.push(KernelInput::Scalar(*value));
                    adjustments.push(None);
                    continue;
                }
                JobOperand::Factor(input) => input,
            };
            let data = self.masked(self.regroup(input)?, mask)?;
            let adjustment = input
                .adjustment
                .as_ref()
                .map(|flat| self.layout.split(&self.node, flat))
                .transpose()?;
            if self.win > 1 {
                inputs.push(KernelInput::Rolling(RollingView::new(
                    &self.node,
                    &data,
                    self.win,
                    adjustment.as_ref(),
                    self.split_multiplier,
                )?));
            } else {
                inputs.push(KernelInput::Tensor(data));
            }
            adjustments.push(adjustment);
        }
        let args = KernelArgs {
            node: &self.node,
            param: kernel.param(),
            win: self.win,
            mask,
            adjustments: &adjustments,
        };
        kernel.call(&args, &inputs)
    }
}

/// Masked-out cells become NaN (float) or false (bool).
fn apply_mask(node: &str, data: Tensor, mask: &Tensor) -> Result<Tensor, FactorError> {
    let Some(keep) = mask.as_bool() else {
        return Err(FactorError::InvalidMask {
            node: node.to_string(),
            dtype: mask.dtype().name(),
        });
    };
    if data.shape().leading() != mask.shape().leading() {
        return Err(FactorError::LayoutMismatch {
            node: node.to_string(),
            expected: data.shape().leading(),
            actual: mask.shape().leading(),
        });
    }
    let shape = data.shape();
    let depth = shape.depth;
    match data.into_data() {
        TensorData::Float(mut values) => {
            for (cell, &keep) in keep.iter().enumerate() {
                if !keep {
                    values[cell * depth..(cell + 1) * depth].fill(f64::NAN);
                }
            }
            Tensor::new(shape, TensorData::Float(values))
        }
        TensorData::Bool(mut values) => {
            for (cell, &keep) in keep.iter().enumerate() {
                if !keep {
                    values[cell * depth..(cell + 1) * depth].fill(false);
                }
            }
            Tensor::new(shape, TensorData::Bool(values))
        }
        TensorData::Int(_) => Err(FactorError::UnsupportedDtype {
            node: node.to_string(),
            op: "mask",
            dtype: DType::Int.name(),
        }),
    }
}
