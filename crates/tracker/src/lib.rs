//! Realtime funnel state tracker.
//!
//! Consumes normalized event records from an in-process channel, matches
//! them against the active published funnel definitions, and maintains each
//! user's [`UserFunnelState`](funnelcast_common::funnel::UserFunnelState).
//! The pipeline is best-effort: failures are logged and counted, never
//! surfaced to the event producer, and re-delivery of an event can only
//! repeat a state, never regress it.

pub mod funnel_cache;
pub mod matcher;
pub mod metrics;
pub mod processor;
pub mod store;
pub mod worker;

pub use metrics::TrackerMetrics;
pub use worker::{TrackerHandle, TrackerWorker};
