//! Batch request model.
//!
//! A `BatchRequest` is built once per inbound call and never mutated
//! afterwards; the pipeline takes ownership of it and shares it with every
//! metric task behind an `Arc`.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::node::HierarchyLevel;

pub type MetricId = String;

/// One requested metric
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub id: MetricId,
    pub name: String,
    /// Source/category the metric belongs to (e.g. "Jira", "Sonar")
    pub category: String,
}

impl MetricDescriptor {
    pub fn new(id: impl Into<MetricId>, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Day,
    Week,
    Month,
}

/// Upper bound on the number of trend data points of one window
pub const MAX_DATA_POINTS: u32 = 400;

/// Number of trend data points and the width of each of them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrendWindow {
    pub unit: DurationUnit,
    pub data_points: usize,
}

impl TrendWindow {
    /// Returns the buckets of this window ending at `as_of`, oldest first.
    ///
    /// Buckets are generated newest first by stepping back one unit at a time
    /// and then reversed, so the last bucket always contains `as_of`. At most
    /// [`MAX_DATA_POINTS`] buckets are produced.
    pub fn buckets(&self, as_of: NaiveDate) -> Vec<Bucket> {
        let count = u32::try_from(self.data_points)
            .unwrap_or(u32::MAX)
            .min(MAX_DATA_POINTS);
        let mut buckets: Vec<Bucket> = (0..count)
            .map_while(|offset| Bucket::nth_before(self.unit, as_of, offset))
            .collect();
        buckets.reverse();
        buckets
    }
}

/// Inclusive date interval covered by one trend data point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub label: String,
}

impl Bucket {
    fn nth_before(unit: DurationUnit, as_of: NaiveDate, offset: u32) -> Option<Bucket> {
        match unit {
            DurationUnit::Day => {
                let day = as_of.checked_sub_days(Days::new(offset.into()))?;
                Some(Bucket {
                    start: day,
                    end: day,
                    label: day.format("%d-%b-%y").to_string(),
                })
            }
            DurationUnit::Week => {
                let monday = as_of
                    .checked_sub_days(Days::new(as_of.weekday().num_days_from_monday().into()))?;
                let start = monday.checked_sub_days(Days::new(7 * u64::from(offset)))?;
                let end = start.checked_add_days(Days::new(6))?;
                Some(Bucket {
                    start,
                    end,
                    label: format!("{} to {}", start.format("%d-%b-%y"), end.format("%d-%b-%y")),
                })
            }
            DurationUnit::Month => {
                let start = as_of.with_day(1)?.checked_sub_months(Months::new(offset))?;
                let end = start.checked_add_months(Months::new(1))?.pred_opt()?;
                Some(Bucket {
                    start,
                    end,
                    label: start.format("%b %Y").to_string(),
                })
            }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// The unit of work submitted by a caller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub metrics: Vec<MetricDescriptor>,
    /// Hierarchy level the results are aggregated to
    pub level: HierarchyLevel,
    /// Hierarchy group the metrics belong to
    pub group_id: u32,
    pub window: TrendWindow,
    /// Last day covered by the trend window
    pub as_of: NaiveDate,
    /// Sprint states included in the computation (e.g. "CLOSED", "ACTIVE")
    #[serde(default)]
    pub sprint_filter: Vec<String>,
    /// Hierarchy node ids the caller selected
    #[serde(default)]
    pub selected_ids: Vec<String>,
    #[serde(default)]
    pub tracker_id: Option<String>,
    /// False for callers authenticated with a non-interactive credential
    #[serde(default = "default_trust_project_cache")]
    pub trust_project_cache: bool,
}

fn default_trust_project_cache() -> bool {
    true
}

impl BatchRequest {
    pub fn buckets(&self) -> Vec<Bucket> {
        self.window.buckets(self.as_of)
    }

    /// Dates spanned by the trend window.
    pub fn date_range(&self) -> DateRange {
        let start = self
            .buckets()
            .first()
            .map(|bucket| bucket.start)
            .unwrap_or(self.as_of);
        DateRange {
            start,
            end: self.as_of,
        }
    }

    /// Whether the tracker id marks this request as an export.
    pub fn is_export(&self, marker: &str) -> bool {
        self.tracker_id
            .as_deref()
            .is_some_and(|tracker_id| tracker_id.contains(marker))
    }
}
