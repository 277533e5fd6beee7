//! Shared funnel domain types.
//!
//! The configuration store (analytics API) writes these; the realtime tracker
//! and the analytics engine read them. A published version is snapshotted by
//! value into its publication row, so analytics keep working against the
//! exact definition that was live at publish time.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::schema::funnel_user_states;

// ── Enums ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Draft,
    Published,
    Archived,
}

impl VersionState {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionState::Draft => "draft",
            VersionState::Published => "published",
            VersionState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "draft" => Ok(VersionState::Draft),
            "published" => Ok(VersionState::Published),
            "archived" => Ok(VersionState::Archived),
            other => Err(AppError::Validation(format!("Invalid version state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Start,
    Page,
    Event,
    Decision,
    Conversion,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Start => "start",
            StepType::Page => "page",
            StepType::Event => "event",
            StepType::Decision => "decision",
            StepType::Conversion => "conversion",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "start" => Ok(StepType::Start),
            "page" => Ok(StepType::Page),
            "event" => Ok(StepType::Event),
            "decision" => Ok(StepType::Decision),
            "conversion" => Ok(StepType::Conversion),
            other => Err(AppError::Validation(format!("Invalid step type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserFunnelStatus {
    Active,
    Completed,
    Abandoned,
}

impl UserFunnelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserFunnelStatus::Active => "active",
            UserFunnelStatus::Completed => "completed",
            UserFunnelStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "active" => Ok(UserFunnelStatus::Active),
            "completed" => Ok(UserFunnelStatus::Completed),
            "abandoned" => Ok(UserFunnelStatus::Abandoned),
            other => Err(AppError::Validation(format!("Invalid user funnel status: {other}"))),
        }
    }
}

// ── Step matching rules ─────────────────────────────────────────────

/// A rule deciding whether an event counts as completing a step.
///
/// Serialized into the `kind` + `rules` columns of `funnel_step_matches`;
/// the tag doubles as the `kind` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepMatchRule {
    EventName { value: String },
    PageUrl { pattern: String },
    PageTitle { pattern: String },
    UtmSource { value: String },
    CustomProperty { name: String, value: serde_json::Value },
}

impl StepMatchRule {
    pub fn kind(&self) -> &'static str {
        match self {
            StepMatchRule::EventName { .. } => "event_name",
            StepMatchRule::PageUrl { .. } => "page_url",
            StepMatchRule::PageTitle { .. } => "page_title",
            StepMatchRule::UtmSource { .. } => "utm_source",
            StepMatchRule::CustomProperty { .. } => "custom_property",
        }
    }
}

// ── Definition snapshot ─────────────────────────────────────────────

/// One ordered step of a funnel definition, with its match rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub order_index: i32,
    pub step_type: StepType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub matches: Vec<StepMatchRule>,
}

/// The complete published definition a tracker or analysis operates on.
///
/// `snapshot` (de)serializes this exact shape into `snapshot_data` of the
/// publication row, which is what makes published versions reconstructible
/// byte-for-byte later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub funnel_id: i64,
    pub funnel_version_id: i64,
    pub version: i32,
    pub window_days: i32,
    pub steps: Vec<StepDefinition>,
}

impl FunnelDefinition {
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, order_index: i32) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.order_index == order_index)
    }

    pub fn conversion_order(&self) -> Option<i32> {
        self.steps
            .iter()
            .filter(|s| s.step_type == StepType::Conversion)
            .map(|s| s.order_index)
            .max()
    }
}

/// Structural validation shared by the store and by snapshot loading.
/// Returns every violation found, not just the first.
pub fn validate_step_definitions(steps: &[StepDefinition]) -> Result<(), Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    if steps.is_empty() {
        errors.push("funnel must contain at least one step".to_string());
        return Err(errors);
    }

    // Orders must be consecutive from 0 with no gaps or duplicates.
    let mut orders: Vec<i32> = steps.iter().map(|s| s.order_index).collect();
    orders.sort_unstable();
    for (expected, got) in orders.iter().enumerate() {
        if *got != expected as i32 {
            errors.push(format!(
                "step orders must be consecutive from 0; found {got} at position {expected}"
            ));
            break;
        }
    }

    if !steps.iter().any(|s| s.step_type == StepType::Start) {
        errors.push("funnel must contain at least one start step".to_string());
    }
    if !steps.iter().any(|s| s.step_type == StepType::Conversion) {
        errors.push("funnel must contain at least one conversion step".to_string());
    }

    for step in steps {
        if step.matches.is_empty() {
            errors.push(format!("step {} must have at least one match rule", step.order_index));
        }
        if step.label.is_empty() || step.label.len() > 255 {
            errors.push(format!(
                "step {} label must be between 1 and 255 characters",
                step.order_index
            ));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

// ── Per-user funnel state ───────────────────────────────────────────

/// Per-(user, funnel) progress record maintained by the realtime tracker.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable, Serialize, Deserialize)]
#[diesel(table_name = funnel_user_states)]
pub struct UserFunnelState {
    pub id: i64,
    pub tenant_id: i64,
    pub workspace_id: i64,
    pub funnel_id: i64,
    pub funnel_version_id: i64,
    pub anonymous_id: String,
    pub lead_id: Option<String>,
    pub current_step_index: i32,
    pub entered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl UserFunnelState {
    pub fn status_enum(&self) -> Result<UserFunnelStatus, AppError> {
        UserFunnelStatus::parse(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition {
                order_index: 0,
                step_type: StepType::Start,
                label: "Landing".to_string(),
                metadata: None,
                matches: vec![StepMatchRule::EventName { value: "begin".to_string() }],
            },
            StepDefinition {
                order_index: 1,
                step_type: StepType::Page,
                label: "Checkout".to_string(),
                metadata: None,
                matches: vec![StepMatchRule::PageUrl { pattern: "/checkout".to_string() }],
            },
            StepDefinition {
                order_index: 2,
                step_type: StepType::Conversion,
                label: "Purchase".to_string(),
                metadata: None,
                matches: vec![StepMatchRule::EventName { value: "purchase".to_string() }],
            },
        ]
    }

    #[test]
    fn accepts_valid_steps() {
        assert!(validate_step_definitions(&steps()).is_ok());
    }

    #[test]
    fn rejects_order_gap() {
        let mut s = steps();
        s[2].order_index = 3;
        let errors = validate_step_definitions(&s).unwrap_err();
        assert!(errors[0].contains("consecutive"));
    }

    #[test]
    fn rejects_missing_conversion() {
        let mut s = steps();
        s[2].step_type = StepType::Event;
        let errors = validate_step_definitions(&s).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("conversion")));
    }

    #[test]
    fn rejects_step_without_matches() {
        let mut s = steps();
        s[1].matches.clear();
        assert!(validate_step_definitions(&s).is_err());
    }

    #[test]
    fn snapshot_round_trips() {
        let definition = FunnelDefinition {
            funnel_id: 1,
            funnel_version_id: 10,
            version: 1,
            window_days: 14,
            steps: steps(),
        };
        let snapshot = serde_json::to_value(&definition).unwrap();
        let restored: FunnelDefinition = serde_json::from_value(snapshot).unwrap();
        assert_eq!(restored, definition);
    }

    #[test]
    fn match_rule_tags_are_stable() {
        let rule = StepMatchRule::PageUrl { pattern: "/x/*".to_string() };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "page_url");
        assert_eq!(rule.kind(), "page_url");
    }
}
