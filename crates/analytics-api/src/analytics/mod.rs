//! The analytics engine: one module per analysis, sharing the cache/validate/
//! compute envelope in [`engine`].

pub mod attribution;
pub mod bottleneck;
pub mod cohort;
pub mod comparison;
pub mod conversion;
pub mod dropoff;
pub mod engine;
pub mod live;
pub mod path;
pub mod stats;
pub mod timing;

pub use engine::{Analyzed, AnalyticsEngine};
