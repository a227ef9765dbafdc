use crate::node::Factor;
use chrono::{Datelike, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatetimeAttr {
    Year,
    Month,
    Day,
    /// Monday is 0.
    Weekday,
    DayOfYear,
}

impl DatetimeAttr {
    pub fn extract(self, date: NaiveDate) -> f64 {
        match self {
            Self::Year => f64::from(date.year()),
            Self::Month => f64::from(date.month()),
            Self::Day => f64::from(date.day()),
            Self::Weekday => f64::from(date.weekday().num_days_from_monday()),
            Self::DayOfYear => f64::from(date.ordinal()),
        }
    }
}

/// Scoped factory that hands out one shared node per data source.
///
/// Graphs built from the same registry share their source nodes, so a column read
/// by many factors is loaded and grouped once per run.
#[derive(Debug, Default)]
pub struct FactorRegistry {
    datetimes: Mutex<HashMap<DatetimeAttr, Factor>>,
    columns: Mutex<HashMap<String, Factor>>,
}

impl FactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn datetime(&self, attr: DatetimeAttr) -> Factor {
        self.datetimes
            .lock()
            .entry(attr)
            .or_insert_with(|| Factor::datetime(attr))
            .clone()
    }

    pub fn column(&self, name: &str) -> Factor {
        self.columns
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Factor::column(name))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.datetimes.lock().len() + self.columns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{DatetimeAttr, FactorRegistry};
    use chrono::NaiveDate;

    #[test]
    fn registry_hands_out_one_node_per_attribute() {
        let registry = FactorRegistry::new();
        let a = registry.datetime(DatetimeAttr::Weekday);
        let b = registry.datetime(DatetimeAttr::Weekday);
        let c = registry.datetime(DatetimeAttr::Month);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn datetime_attributes_follow_calendar() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date");
        assert_eq!(DatetimeAttr::Year.extract(date), 2024.0);
        assert_eq!(DatetimeAttr::Month.extract(date), 3.0);
        assert_eq!(DatetimeAttr::Day.extract(date), 1.0);
        // 2024-03-01 is a Friday.
        assert_eq!(DatetimeAttr::Weekday.extract(date), 4.0);
        assert_eq!(DatetimeAttr::DayOfYear.extract(date), 61.0);
    }
}
