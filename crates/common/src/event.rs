use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageContext {
    pub url: Option<String>,
    pub title: Option<String>,
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtmContext {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceContext {
    pub device_type: Option<String>,
    pub platform: Option<String>,
    pub os_name: Option<String>,
    pub browser: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoContext {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// A normalized user event as delivered by the upstream ingestion pipeline.
///
/// The core never mutates events; it reads them for analytics and feeds them
/// through the realtime tracker. Timestamps are UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub tenant_id: i64,
    pub workspace_id: i64,
    pub anonymous_id: String,
    pub lead_id: Option<String>,
    pub session_id: String,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub page: Option<PageContext>,
    pub utm: Option<UtmContext>,
    pub device: Option<DeviceContext>,
    pub geo: Option<GeoContext>,
    pub props: Option<serde_json::Value>,
    pub funnel_id: Option<i64>,
    pub funnel_step_order: Option<i32>,
}

/// Validates an [`EventRecord`] and returns a list of validation error messages.
/// Returns `Ok(())` if valid, or `Err(Vec<String>)` with all validation failures.
pub fn validate_event_record(event: &EventRecord) -> Result<(), Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    if event.tenant_id <= 0 || event.workspace_id <= 0 {
        errors.push("tenant_id and workspace_id are required".to_string());
    }

    // event_name max 256 chars
    if event.event_name.is_empty() || event.event_name.len() > 256 {
        errors.push("event_name must be between 1 and 256 characters".to_string());
    }

    // event_name allowed chars: alphanumeric + spaces + _ + . + - + $ (for system events)
    if !event
        .event_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == ' ' || c == '_' || c == '.' || c == '-' || c == '$')
    {
        errors.push(
            "event_name contains invalid characters; only alphanumeric, spaces, _, ., -, and $ are allowed"
                .to_string(),
        );
    }

    // anonymous_id non-empty
    if event.anonymous_id.is_empty() {
        errors.push("anonymous_id must not be empty".to_string());
    }

    if event.session_id.is_empty() {
        errors.push("session_id must not be empty".to_string());
    }

    // timestamp not >24h in the future
    let now = Utc::now();
    if event.timestamp > now + Duration::hours(24) {
        errors.push("timestamp must not be more than 24 hours in the future".to_string());
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventRecord {
        EventRecord {
            event_id: Uuid::new_v4(),
            tenant_id: 1,
            workspace_id: 1,
            anonymous_id: "a_u1".to_string(),
            lead_id: None,
            session_id: "sess-1".to_string(),
            event_name: "page_view".to_string(),
            timestamp: Utc::now(),
            page: None,
            utm: None,
            device: None,
            geo: None,
            props: None,
            funnel_id: None,
            funnel_step_order: None,
        }
    }

    #[test]
    fn accepts_valid_event() {
        assert!(validate_event_record(&sample()).is_ok());
    }

    #[test]
    fn rejects_missing_scope_and_empty_ids() {
        let mut event = sample();
        event.tenant_id = 0;
        event.anonymous_id = String::new();
        let errors = validate_event_record(&event).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_bad_event_name() {
        let mut event = sample();
        event.event_name = "bad{name}".to_string();
        assert!(validate_event_record(&event).is_err());
    }

    #[test]
    fn rejects_far_future_timestamp() {
        let mut event = sample();
        event.timestamp = Utc::now() + Duration::hours(48);
        assert!(validate_event_record(&event).is_err());
    }
}
