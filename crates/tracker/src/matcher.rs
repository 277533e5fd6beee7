//! Step-match evaluation.
//!
//! `event_name` and `utm_source` match exactly. `page_url` / `page_title`
//! patterns containing `*` or `?` are treated as case-insensitive globs over
//! the whole string; without wildcards they fall back to case-insensitive
//! substring containment. `custom_property` compares the named property for
//! JSON equality.

use funnelcast_common::event::EventRecord;
use funnelcast_common::funnel::{FunnelDefinition, StepDefinition, StepMatchRule};

/// Finds the first step (in order) whose rules accept the event.
pub fn find_matching_step<'a>(
    definition: &'a FunnelDefinition,
    event: &EventRecord,
) -> Option<&'a StepDefinition> {
    definition
        .steps
        .iter()
        .find(|step| step.matches.iter().any(|rule| rule_matches(rule, event)))
}

pub fn rule_matches(rule: &StepMatchRule, event: &EventRecord) -> bool {
    match rule {
        StepMatchRule::EventName { value } => event.event_name == *value,
        StepMatchRule::PageUrl { pattern } => event
            .page
            .as_ref()
            .and_then(|p| p.url.as_deref())
            .is_some_and(|url| pattern_matches(pattern, url)),
        StepMatchRule::PageTitle { pattern } => event
            .page
            .as_ref()
            .and_then(|p| p.title.as_deref())
            .is_some_and(|title| pattern_matches(pattern, title)),
        StepMatchRule::UtmSource { value } => event
            .utm
            .as_ref()
            .and_then(|u| u.source.as_deref())
            .is_some_and(|source| source == value),
        StepMatchRule::CustomProperty { name, value } => event
            .props
            .as_ref()
            .and_then(|props| props.get(name))
            .is_some_and(|found| found == value),
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        match regex::RegexBuilder::new(&glob_to_regex(pattern))
            .case_insensitive(true)
            .build()
        {
            Ok(re) => re.is_match(text),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "unusable match pattern");
                false
            }
        }
    } else {
        text.to_lowercase().contains(&pattern.to_lowercase())
    }
}

/// Anchored regex for a glob pattern: `*` spans anything, `?` one character,
/// everything else is literal.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if "\\.+()[]{}|^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use funnelcast_common::event::{PageContext, UtmContext};
    use funnelcast_common::funnel::StepType;
    use serde_json::json;

    fn event(name: &str, url: Option<&str>) -> EventRecord {
        EventRecord {
            event_id: uuid::Uuid::nil(),
            tenant_id: 1,
            workspace_id: 1,
            anonymous_id: "a_u1".to_string(),
            lead_id: None,
            session_id: "s1".to_string(),
            event_name: name.to_string(),
            timestamp: Utc::now(),
            page: url.map(|u| PageContext {
                url: Some(u.to_string()),
                title: Some("Checkout | Shop".to_string()),
                referrer: None,
            }),
            utm: Some(UtmContext {
                source: Some("google".to_string()),
                medium: None,
                campaign: None,
                term: None,
                content: None,
            }),
            device: None,
            geo: None,
            props: Some(json!({ "plan": "pro", "seats": 3 })),
            funnel_id: None,
            funnel_step_order: None,
        }
    }

    #[test]
    fn event_name_is_exact() {
        let rule = StepMatchRule::EventName { value: "begin".to_string() };
        assert!(rule_matches(&rule, &event("begin", None)));
        assert!(!rule_matches(&rule, &event("Begin", None)));
        assert!(!rule_matches(&rule, &event("begin_now", None)));
    }

    #[test]
    fn page_url_substring_is_case_insensitive() {
        let rule = StepMatchRule::PageUrl { pattern: "/CHECKOUT".to_string() };
        assert!(rule_matches(&rule, &event("view", Some("https://shop.example/checkout?x=1"))));
        assert!(!rule_matches(&rule, &event("view", Some("https://shop.example/cart"))));
        assert!(!rule_matches(&rule, &event("view", None)));
    }

    #[test]
    fn page_url_glob_spans_whole_string() {
        let rule = StepMatchRule::PageUrl { pattern: "*/checkout/*".to_string() };
        assert!(rule_matches(&rule, &event("view", Some("https://shop.example/checkout/payment"))));
        assert!(!rule_matches(&rule, &event("view", Some("https://shop.example/checkout"))));

        let single = StepMatchRule::PageUrl { pattern: "/step-?".to_string() };
        assert!(rule_matches(&single, &event("view", Some("/step-2"))));
        assert!(!rule_matches(&single, &event("view", Some("/step-22"))));
    }

    #[test]
    fn page_title_matches_against_title() {
        let rule = StepMatchRule::PageTitle { pattern: "checkout".to_string() };
        assert!(rule_matches(&rule, &event("view", Some("/x"))));
    }

    #[test]
    fn utm_source_is_exact() {
        let rule = StepMatchRule::UtmSource { value: "google".to_string() };
        assert!(rule_matches(&rule, &event("view", None)));
        let other = StepMatchRule::UtmSource { value: "bing".to_string() };
        assert!(!rule_matches(&other, &event("view", None)));
    }

    #[test]
    fn custom_property_compares_json_values() {
        let string_rule = StepMatchRule::CustomProperty {
            name: "plan".to_string(),
            value: json!("pro"),
        };
        assert!(rule_matches(&string_rule, &event("view", None)));

        let number_rule = StepMatchRule::CustomProperty {
            name: "seats".to_string(),
            value: json!(3),
        };
        assert!(rule_matches(&number_rule, &event("view", None)));

        let missing = StepMatchRule::CustomProperty {
            name: "tier".to_string(),
            value: json!("pro"),
        };
        assert!(!rule_matches(&missing, &event("view", None)));
    }

    #[test]
    fn first_matching_step_wins() {
        let step = |order: i32, step_type: StepType, rule: StepMatchRule| StepDefinition {
            order_index: order,
            step_type,
            label: format!("step {order}"),
            metadata: None,
            matches: vec![rule],
        };
        let definition = FunnelDefinition {
            funnel_id: 1,
            funnel_version_id: 1,
            version: 1,
            window_days: 14,
            steps: vec![
                step(0, StepType::Start, StepMatchRule::EventName { value: "begin".to_string() }),
                step(1, StepType::Page, StepMatchRule::PageUrl { pattern: "/checkout".to_string() }),
                step(2, StepType::Conversion, StepMatchRule::EventName { value: "purchase".to_string() }),
            ],
        };

        let matched = find_matching_step(&definition, &event("purchase", None)).unwrap();
        assert_eq!(matched.order_index, 2);

        let matched = find_matching_step(&definition, &event("view", Some("/checkout"))).unwrap();
        assert_eq!(matched.order_index, 1);

        assert!(find_matching_step(&definition, &event("unrelated", None)).is_none());
    }
}
