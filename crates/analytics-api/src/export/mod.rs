//! Asynchronous export jobs: request validation, size estimation, a
//! background worker generating CSV/JSON/Excel artifacts, and status
//! tracking with a 24-hour download window.

pub mod anonymize;
pub mod formats;
pub mod manager;
pub mod worker;

pub use manager::{ExportManager, ExportRequest, Notifier};
pub use worker::ExportWorker;
