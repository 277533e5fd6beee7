//! Read-side analytical queries.
//!
//! Every function takes the tenant scope explicitly and returns strongly
//! typed rows. Aggregations run as raw SQL with bound parameters
//! (`diesel::sql_query`); row shapes derive `QueryableByName`. Queries only
//! ever see funnels that were resolved through the store, which enforces
//! `archived_at IS NULL` and tenant ownership.

pub mod cohorts;
pub mod events;
pub mod journeys;
pub mod live;
pub mod segments;
pub mod steps;
pub mod timeseries;
pub mod timing;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive analysis window, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration().num_seconds() as f64 / 3600.0
    }

    /// The window of the same length immediately preceding this one.
    pub fn previous(&self) -> DateRange {
        DateRange {
            start: self.start - self.duration(),
            end: self.start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
}

impl Granularity {
    /// The `date_trunc` unit for this granularity.
    pub fn pg_unit(self) -> &'static str {
        match self {
            Granularity::Hourly => "hour",
            Granularity::Daily => "day",
            Granularity::Weekly => "week",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl CohortPeriod {
    pub fn pg_unit(self) -> &'static str {
        match self {
            CohortPeriod::Daily => "day",
            CohortPeriod::Weekly => "week",
            CohortPeriod::Monthly => "month",
        }
    }
}

/// Dimensions users can be segmented on. The column expression is fixed per
/// variant, so interpolating it into SQL text is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentDimension {
    DeviceType,
    UtmSource,
    Platform,
    Geography,
}

impl SegmentDimension {
    pub fn column_expr(self) -> &'static str {
        match self {
            SegmentDimension::DeviceType => "COALESCE(e.device_type, 'unknown')",
            SegmentDimension::UtmSource => "COALESCE(e.utm_source, 'direct')",
            SegmentDimension::Platform => "COALESCE(e.platform, 'unknown')",
            SegmentDimension::Geography => "COALESCE(e.geo_country, 'unknown')",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentDimension::DeviceType => "device_type",
            SegmentDimension::UtmSource => "utm_source",
            SegmentDimension::Platform => "platform",
            SegmentDimension::Geography => "geography",
        }
    }
}
