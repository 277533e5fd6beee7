pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod funnel;
pub mod health;
pub mod ids;
pub mod schema;
pub mod telemetry;
pub mod tenant;
