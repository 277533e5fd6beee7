pub mod export_jobs;
pub mod funnels;
pub mod models;
pub mod user_states;
