//! Thin engine that drives the node protocol over a [`Panel`].
//!
//! One `run` is: size the history window, slice the panel, prepare every root, compute
//! every root, wait for and revert the outputs, clean up, then trim the warm-up rows.

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::FactorError;
use crate::graph::GraphView;
use crate::node::Factor;
use crate::panel::Panel;
use crate::tensor::Tensor;
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    roots: Vec<(String, Factor)>,
    filter: Option<Factor>,
    config: RunConfig,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        Self {
            roots: Vec::new(),
            filter: None,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Registers `factor` under `name`; a later root with the same name replaces it.
    pub fn add(&mut self, name: impl Into<String>, factor: &Factor) -> &mut Self {
        let name = name.into();
        self.roots.retain(|(existing, _)| *existing != name);
        self.roots.push((name, factor.clone()));
        self
    }

    /// Boolean factor applied to every root; rows outside it come back missing.
    pub fn set_filter(&mut self, filter: Option<&Factor>) -> &mut Self {
        self.filter = filter.cloned();
        self
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Roots as the run sees them: filtered, and shifted one period when delayed.
    fn exposed_roots(&self) -> Vec<ExposedRoot> {
        let filter_delay = self.filter.as_ref().is_some_and(|filter| filter.should_delay());
        self.roots
            .iter()
            .map(|(name, factor)| {
                let delayed = factor.should_delay() || filter_delay;
                let mut exposed = factor.clone();
                if let Some(filter) = &self.filter {
                    exposed = exposed.filter(filter);
                }
                if delayed {
                    exposed = exposed.shift(1);
                }
                ExposedRoot {
                    name: name.clone(),
                    history: exposed.total_backwards() + usize::from(delayed),
                    factor: exposed,
                }
            })
            .collect()
    }

    /// Snapshot of the graph the next run would walk.
    pub fn graph(&self) -> GraphView {
        let roots: Vec<Factor> = self
            .exposed_roots()
            .into_iter()
            .map(|root| root.factor)
            .collect();
        GraphView::from_roots(&roots)
    }

    pub fn run(
        &self,
        panel: &Panel,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PipelineOutput, FactorError> {
        let started = Instant::now();
        let roots = self.exposed_roots();
        let history = roots.iter().map(|root| root.history).max().unwrap_or(0);
        let rows = panel.rows_between(start, end, history);
        if rows.is_empty() {
            return Err(FactorError::InvalidPanel {
                reason: format!("no rows dated {start}..={end}"),
            });
        }
        debug!("history {history} period(s), panel rows {rows:?}");

        let ctx = RunContext::new(panel.slice(rows), self.config.clone(), start, end)?;
        let walked = walk(&ctx, &roots);
        for root in &roots {
            root.factor.clean_up(false);
        }
        let columns = walked?;

        let dates = ctx.panel().dates();
        let first = dates.partition_point(|date| *date < start);
        let output = PipelineOutput {
            dates: dates[first..].to_vec(),
            assets: ctx.panel().assets()[first..].to_vec(),
            columns: columns
                .into_iter()
                .map(|(name, flat)| (name, flat.slice_rows(first..flat.shape().rows)))
                .collect(),
        };
        info!(
            "pipeline run {}: {} factor(s), {} row(s), {} lane(s), {:?}",
            ctx.id(),
            roots.len(),
            output.len(),
            ctx.lanes().len(),
            started.elapsed()
        );
        Ok(output)
    }
}

#[derive(Debug)]
struct ExposedRoot {
    name: String,
    factor: Factor,
    history: usize,
}

fn walk(
    ctx: &Arc<RunContext>,
    roots: &[ExposedRoot],
) -> Result<BTreeMap<String, Tensor>, FactorError> {
    for root in roots {
        root.factor.pre_compute(ctx)?;
    }
    let main = if ctx.is_parallel() {
        Some(ctx.lanes().open()?)
    } else {
        None
    };
    let mut outputs = Vec::with_capacity(roots.len());
    for root in roots {
        outputs.push((root, root.factor.compute(main.as_deref())?));
    }
    let mut columns = BTreeMap::new();
    for (root, output) in outputs {
        let grouped = output.wait()?;
        let flat = ctx.revert(root.factor.name(), &grouped, root.factor.groupby())?;
        columns.insert(root.name.clone(), flat);
    }
    Ok(columns)
}

/// Flat results of one run, row-aligned with `dates` and `assets`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    dates: Vec<NaiveDate>,
    assets: Vec<u32>,
    columns: BTreeMap<String, Tensor>,
}

impl PipelineOutput {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[u32] {
        &self.assets
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.columns.get(name)
    }

    /// Float values of a single-output factor.
    pub fn values(&self, name: &str) -> Option<&[f64]> {
        self.get(name).and_then(Tensor::as_f64)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}
