use crate::config::{Device, RunConfig};
use crate::error::FactorError;
use crate::lane::LanePool;
use crate::layout::Layout;
use crate::panel::Panel;
use crate::registry::DatetimeAttr;
use crate::tensor::Tensor;
use chrono::NaiveDate;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which key a node's data is grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One row per instrument, time along the columns.
    Asset,
    /// One row per date, instruments along the columns.
    Date,
    /// A single row holding every panel row in order.
    Whole,
    /// Integer-coded panel column, e.g. a sector code.
    Column(String),
}

impl std::fmt::Display for GroupBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asset => f.write_str("asset"),
            Self::Date => f.write_str("date"),
            Self::Whole => f.write_str("whole"),
            Self::Column(name) => write!(f, "column:{name}"),
        }
    }
}

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Engine side of one run: the panel rows in scope plus everything built from them.
///
/// Layouts and loaded columns are built lazily, once per key, and dropped with the
/// context. Lanes opened during the run are joined when the context drops.
#[derive(Debug)]
pub struct RunContext {
    id: u64,
    panel: Panel,
    config: RunConfig,
    start: NaiveDate,
    end: NaiveDate,
    layouts: Mutex<HashMap<GroupBy, Arc<Layout>>>,
    columns: Mutex<HashMap<String, Arc<Tensor>>>,
    lanes: LanePool,
}

impl RunContext {
    pub fn new(
        panel: Panel,
        config: RunConfig,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<Self>, FactorError> {
        config.validate()?;
        let id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "run {id}: {} rows, {start}..={end}, {:?}",
            panel.len(),
            config.device
        );
        Ok(Arc::new(Self {
            id,
            panel,
            config,
            start,
            end,
            layouts: Mutex::new(HashMap::new()),
            columns: Mutex::new(HashMap::new()),
            lanes: LanePool::default(),
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.panel.len()
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Requested output range; the panel may hold earlier rows for history.
    pub fn range(&self) -> (NaiveDate, NaiveDate) {
        (self.start, self.end)
    }

    #[inline]
    pub fn is_parallel(&self) -> bool {
        self.config.device == Device::Parallel
    }

    pub fn lanes(&self) -> &LanePool {
        &self.lanes
    }

    pub fn layout(&self, groupby: &GroupBy) -> Result<Arc<Layout>, FactorError> {
        if let Some(layout) = self.layouts.lock().get(groupby) {
            return Ok(Arc::clone(layout));
        }
        let layout = Arc::new(match groupby {
            GroupBy::Asset => Layout::grouped(&self.panel.asset_keys())?,
            GroupBy::Date => Layout::grouped(&self.panel.date_keys())?,
            GroupBy::Whole => Layout::whole(self.rows()),
            GroupBy::Column(name) => Layout::grouped(&self.column_keys(name)?)?,
        });
        debug!(
            "run {}: built `{groupby}` layout {:?}",
            self.id,
            layout.padded_shape()
        );
        Ok(Arc::clone(
            self.layouts
                .lock()
                .entry(groupby.clone())
                .or_insert(layout),
        ))
    }

    fn column_keys(&self, name: &str) -> Result<Vec<i64>, FactorError> {
        let values = self.panel.column(name).ok_or_else(|| FactorError::MissingColumn {
            column: name.to_string(),
        })?;
        values
            .iter()
            .enumerate()
            .map(|(row, &value)| {
                if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
                    Ok(value as i64)
                } else {
                    Err(FactorError::InvalidGroupKey { row, value })
                }
            })
            .collect()
    }

    /// Flat `(rows, 1)` column, rounded to the configured precision.
    pub fn column(&self, name: &str) -> Result<Arc<Tensor>, FactorError> {
        if let Some(column) = self.columns.lock().get(name) {
            return Ok(Arc::clone(column));
        }
        let values = self.panel.column(name).ok_or_else(|| FactorError::MissingColumn {
            column: name.to_string(),
        })?;
        let precision = self.config.precision;
        let tensor = Arc::new(Tensor::flat_f64(
            values.iter().map(|&v| precision.apply(v)).collect(),
        ));
        Ok(Arc::clone(
            self.columns
                .lock()
                .entry(name.to_string())
                .or_insert(tensor),
        ))
    }

    pub fn datetime(&self, attr: DatetimeAttr) -> Arc<Tensor> {
        Arc::new(Tensor::flat_f64(
            self.panel.dates().iter().map(|&date| attr.extract(date)).collect(),
        ))
    }

    /// Splits flat data into the `groupby` layout.
    pub fn group_by(
        &self,
        node: &str,
        data: &Tensor,
        groupby: &GroupBy,
    ) -> Result<Tensor, FactorError> {
        self.layout(groupby)?.split(node, data)
    }

    /// Returns grouped data to flat row order.
    pub fn revert(
        &self,
        node: &str,
        data: &Tensor,
        groupby: &GroupBy,
    ) -> Result<Tensor, FactorError> {
        self.layout(groupby)?.revert(node, data)
    }
}
