use crate::error::FactorError;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// In-memory `(date, asset)` table, rows sorted by date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Panel {
    dates: Vec<NaiveDate>,
    assets: Vec<u32>,
    columns: BTreeMap<String, Arc<Vec<f64>>>,
}

impl Panel {
    pub fn new(dates: Vec<NaiveDate>, assets: Vec<u32>) -> Result<Self, FactorError> {
        if dates.len() != assets.len() {
            return Err(FactorError::InvalidPanel {
                reason: format!("{} dates but {} assets", dates.len(), assets.len()),
            });
        }
        if let Some(row) = dates.windows(2).position(|pair| pair[1] < pair[0]) {
            return Err(FactorError::InvalidPanel {
                reason: format!("rows must be sorted by date, row {} goes back in time", row + 1),
            });
        }
        Ok(Self {
            dates,
            assets,
            columns: BTreeMap::new(),
        })
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, FactorError> {
        let name = name.into();
        if values.len() != self.len() {
            return Err(FactorError::InvalidPanel {
                reason: format!(
                    "column `{name}` has {} values for {} rows",
                    values.len(),
                    self.len()
                ),
            });
        }
        self.columns.insert(name, Arc::new(values));
        Ok(self)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[u32] {
        &self.assets
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|values| values.as_slice())
    }

    pub fn asset_keys(&self) -> Vec<i64> {
        self.assets.iter().map(|&asset| i64::from(asset)).collect()
    }

    /// Dense index of each row's date among the distinct dates.
    pub fn date_keys(&self) -> Vec<i64> {
        let mut keys = Vec::with_capacity(self.len());
        let mut current = -1_i64;
        for (row, date) in self.dates.iter().enumerate() {
            if row == 0 || self.dates[row - 1] != *date {
                current += 1;
            }
            keys.push(current);
        }
        keys
    }

    /// Rows dated `start..=end`, widened backwards by `backwards` extra distinct dates.
    pub fn rows_between(&self, start: NaiveDate, end: NaiveDate, backwards: usize) -> Range<usize> {
        let first = self.dates.partition_point(|date| *date < start);
        let last = self.dates.partition_point(|date| *date <= end);
        if first >= last {
            return first..first;
        }
        let unique_before = {
            let mut dates = self.dates[..first].to_vec();
            dates.dedup();
            dates
        };
        let from = match unique_before.len().checked_sub(backwards) {
            Some(idx) if idx < unique_before.len() => {
                self.dates.partition_point(|date| *date < unique_before[idx])
            }
            Some(_) => first,
            None => 0,
        };
        from..last
    }

    pub fn slice(&self, rows: Range<usize>) -> Panel {
        Panel {
            dates: self.dates[rows.clone()].to_vec(),
            assets: self.assets[rows.clone()].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), Arc::new(values[rows.clone()].to_vec())))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Panel;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).expect("valid date")
    }

    fn two_asset_panel() -> Panel {
        let dates = vec![day(1), day(1), day(2), day(2), day(3), day(3)];
        Panel::new(dates, vec![7, 9, 7, 9, 7, 9]).expect("panel")
    }

    #[test]
    fn unsorted_dates_are_rejected() {
        let err = Panel::new(vec![day(2), day(1)], vec![1, 1]).expect_err("unsorted");
        assert!(err.to_string().contains("sorted by date"));
    }

    #[test]
    fn date_keys_are_dense() {
        assert_eq!(two_asset_panel().date_keys(), vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn rows_between_extends_back_by_whole_dates() {
        let panel = two_asset_panel();
        assert_eq!(panel.rows_between(day(3), day(3), 0), 4..6);
        assert_eq!(panel.rows_between(day(3), day(3), 1), 2..6);
        assert_eq!(panel.rows_between(day(2), day(3), 5), 0..6);
    }
}
