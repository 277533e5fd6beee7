//! The state-transition algorithm.
//!
//! Pure planning separated from persistence: [`plan_transition`] decides
//! what the state should look like after an event, the worker persists it
//! through the monotonic upsert in [`crate::store`].

use funnelcast_common::event::EventRecord;
use funnelcast_common::funnel::{FunnelDefinition, StepDefinition, StepType, UserFunnelState};

use crate::store::StateUpsert;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// First matching event for this user and funnel.
    Entered,
    /// Forward progress to a higher step.
    Advanced,
    /// Reached a conversion step.
    Completed,
    /// Matched without forward progress; only activity is refreshed.
    ActivityOnly,
}

impl TransitionKind {
    /// Significant transitions invalidate the live-metrics cache.
    pub fn is_significant(self) -> bool {
        !matches!(self, TransitionKind::ActivityOnly)
    }
}

#[derive(Debug, Clone)]
pub struct PlannedTransition {
    pub kind: TransitionKind,
    pub upsert: StateUpsert,
}

/// Computes the post-event state for a matched step.
///
/// No prior state creates a fresh record at the matched step. With a prior
/// state, a higher matched order advances; a conversion-typed step completes
/// (completion is terminal). Anything else only refreshes activity, so
/// re-delivering an event never regresses the state.
pub fn plan_transition(
    definition: &FunnelDefinition,
    step: &StepDefinition,
    prior: Option<&UserFunnelState>,
    event: &EventRecord,
) -> PlannedTransition {
    let conversion_matched = step.step_type == StepType::Conversion;

    match prior {
        None => {
            let kind = if conversion_matched { TransitionKind::Completed } else { TransitionKind::Entered };
            PlannedTransition {
                kind,
                upsert: StateUpsert {
                    funnel_version_id: definition.funnel_version_id,
                    anonymous_id: event.anonymous_id.clone(),
                    lead_id: event.lead_id.clone(),
                    current_step_index: step.order_index,
                    entered_at: event.timestamp,
                    last_activity_at: event.timestamp,
                    completed_at: conversion_matched.then_some(event.timestamp),
                    status: if conversion_matched { "completed" } else { "active" }.to_string(),
                },
            }
        }
        Some(state) => {
            let already_completed = state.status == "completed";
            let advances = step.order_index > state.current_step_index;
            let completes = conversion_matched && !already_completed;

            let kind = if completes {
                TransitionKind::Completed
            } else if advances && !already_completed {
                TransitionKind::Advanced
            } else {
                TransitionKind::ActivityOnly
            };

            PlannedTransition {
                kind,
                upsert: StateUpsert {
                    funnel_version_id: state.funnel_version_id,
                    anonymous_id: state.anonymous_id.clone(),
                    lead_id: event.lead_id.clone().or_else(|| state.lead_id.clone()),
                    current_step_index: state.current_step_index.max(step.order_index),
                    entered_at: state.entered_at.min(event.timestamp),
                    last_activity_at: state.last_activity_at.max(event.timestamp),
                    completed_at: state
                        .completed_at
                        .or_else(|| completes.then_some(event.timestamp)),
                    status: if already_completed || completes {
                        "completed".to_string()
                    } else {
                        state.status.clone()
                    },
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use funnelcast_common::funnel::StepMatchRule;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, minute, 0).unwrap()
    }

    fn definition() -> FunnelDefinition {
        let step = |order: i32, step_type: StepType, rule: StepMatchRule| StepDefinition {
            order_index: order,
            step_type,
            label: format!("step {order}"),
            metadata: None,
            matches: vec![rule],
        };
        FunnelDefinition {
            funnel_id: 1,
            funnel_version_id: 7,
            version: 1,
            window_days: 14,
            steps: vec![
                step(0, StepType::Start, StepMatchRule::EventName { value: "begin".to_string() }),
                step(1, StepType::Page, StepMatchRule::PageUrl { pattern: "/checkout".to_string() }),
                step(2, StepType::Conversion, StepMatchRule::EventName { value: "purchase".to_string() }),
            ],
        }
    }

    fn event(name: &str, minute: u32) -> EventRecord {
        EventRecord {
            event_id: uuid::Uuid::nil(),
            tenant_id: 1,
            workspace_id: 1,
            anonymous_id: "a_u1".to_string(),
            lead_id: None,
            session_id: "s1".to_string(),
            event_name: name.to_string(),
            timestamp: ts(minute),
            page: None,
            utm: None,
            device: None,
            geo: None,
            props: None,
            funnel_id: None,
            funnel_step_order: None,
        }
    }

    fn state_from(upsert: &StateUpsert) -> UserFunnelState {
        UserFunnelState {
            id: 1,
            tenant_id: 1,
            workspace_id: 1,
            funnel_id: 1,
            funnel_version_id: upsert.funnel_version_id,
            anonymous_id: upsert.anonymous_id.clone(),
            lead_id: upsert.lead_id.clone(),
            current_step_index: upsert.current_step_index,
            entered_at: upsert.entered_at,
            last_activity_at: upsert.last_activity_at,
            completed_at: upsert.completed_at,
            exited_at: None,
            status: upsert.status.clone(),
        }
    }

    // Full progression: begin at 00:00, checkout at 00:05, purchase at
    // 00:10 ends completed at step 2 with the original entry time.
    #[test]
    fn full_progression_completes() {
        let definition = definition();

        let entered = plan_transition(
            &definition,
            definition.step(0).unwrap(),
            None,
            &event("begin", 0),
        );
        assert_eq!(entered.kind, TransitionKind::Entered);
        assert_eq!(entered.upsert.current_step_index, 0);
        assert_eq!(entered.upsert.status, "active");

        let after_entry = state_from(&entered.upsert);
        let advanced = plan_transition(
            &definition,
            definition.step(1).unwrap(),
            Some(&after_entry),
            &event("visit", 5),
        );
        assert_eq!(advanced.kind, TransitionKind::Advanced);
        assert_eq!(advanced.upsert.current_step_index, 1);

        let after_advance = state_from(&advanced.upsert);
        let completed = plan_transition(
            &definition,
            definition.step(2).unwrap(),
            Some(&after_advance),
            &event("purchase", 10),
        );
        assert_eq!(completed.kind, TransitionKind::Completed);
        assert_eq!(completed.upsert.current_step_index, 2);
        assert_eq!(completed.upsert.status, "completed");
        assert_eq!(completed.upsert.entered_at, ts(0));
        assert_eq!(completed.upsert.completed_at, Some(ts(10)));
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let definition = definition();
        let first = plan_transition(&definition, definition.step(0).unwrap(), None, &event("begin", 0));
        let state = state_from(&first.upsert);

        let replay = plan_transition(
            &definition,
            definition.step(0).unwrap(),
            Some(&state),
            &event("begin", 0),
        );
        assert_eq!(replay.kind, TransitionKind::ActivityOnly);
        assert_eq!(replay.upsert.current_step_index, state.current_step_index);
        assert_eq!(replay.upsert.entered_at, state.entered_at);
        assert_eq!(replay.upsert.last_activity_at, state.last_activity_at);
        assert_eq!(replay.upsert.status, state.status);
    }

    #[test]
    fn late_lower_step_never_regresses() {
        let definition = definition();
        let advanced = StateUpsert {
            funnel_version_id: 7,
            anonymous_id: "a_u1".to_string(),
            lead_id: None,
            current_step_index: 1,
            entered_at: ts(0),
            last_activity_at: ts(5),
            completed_at: None,
            status: "active".to_string(),
        };
        let state = state_from(&advanced);

        // A delayed step-0 event arrives after the user already reached 1.
        let replay = plan_transition(
            &definition,
            definition.step(0).unwrap(),
            Some(&state),
            &event("begin", 3),
        );
        assert_eq!(replay.kind, TransitionKind::ActivityOnly);
        assert_eq!(replay.upsert.current_step_index, 1);
        assert_eq!(replay.upsert.last_activity_at, ts(5));
    }

    #[test]
    fn completion_is_terminal() {
        let definition = definition();
        let done = StateUpsert {
            funnel_version_id: 7,
            anonymous_id: "a_u1".to_string(),
            lead_id: None,
            current_step_index: 2,
            entered_at: ts(0),
            last_activity_at: ts(10),
            completed_at: Some(ts(10)),
            status: "completed".to_string(),
        };
        let state = state_from(&done);

        let replay = plan_transition(
            &definition,
            definition.step(2).unwrap(),
            Some(&state),
            &event("purchase", 20),
        );
        assert_eq!(replay.kind, TransitionKind::ActivityOnly);
        assert_eq!(replay.upsert.status, "completed");
        assert_eq!(replay.upsert.completed_at, Some(ts(10)));
    }

    #[test]
    fn conversion_on_first_contact_completes_immediately() {
        let definition = definition();
        let planned = plan_transition(
            &definition,
            definition.step(2).unwrap(),
            None,
            &event("purchase", 0),
        );
        assert_eq!(planned.kind, TransitionKind::Completed);
        assert_eq!(planned.upsert.status, "completed");
    }

    #[test]
    fn significance_flags() {
        assert!(TransitionKind::Entered.is_significant());
        assert!(TransitionKind::Advanced.is_significant());
        assert!(TransitionKind::Completed.is_significant());
        assert!(!TransitionKind::ActivityOnly.is_significant());
    }
}
