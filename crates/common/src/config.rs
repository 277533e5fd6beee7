use serde::Deserialize;

fn default_empty_string() -> String {
    String::new()
}

// ---------------------------------------------------------------------------
// Analytics API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_api_port")]
    pub analytics_api_port: u16,

    pub database_url: String,

    /// Disables Diesel's prepared-statement cache on every pooled connection.
    /// Required when DATABASE_URL points at a transaction-mode pooler
    /// (PgBouncer et al.) that cannot track server-side prepared statements.
    #[serde(default)]
    pub db_disable_prepared_statements: bool,

    #[serde(default = "default_cors_origins")]
    pub cors_allowed_origins: String,

    #[serde(default = "default_export_directory")]
    pub export_directory: String,

    #[serde(default = "default_empty_string")]
    pub export_download_base_url: String,

    #[serde(default = "default_tracker_channel_capacity")]
    pub tracker_channel_capacity: usize,

    #[serde(default = "default_funnel_cache_ttl_secs")]
    pub funnel_cache_ttl_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_cors_origins() -> String {
    "*".to_string()
}

fn default_export_directory() -> String {
    "/tmp/exports".to_string()
}

fn default_tracker_channel_capacity() -> usize {
    4096
}

fn default_funnel_cache_ttl_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AnalyticsConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env::<Self>()?)
    }

    pub fn port(&self) -> u16 {
        self.analytics_api_port
    }
}
