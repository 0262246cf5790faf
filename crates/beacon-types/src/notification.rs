//! Notification rules, team specifications and people.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named delivery endpoint attached to a rule or to a team.
///
/// `filter`, `template`, `url` and `properties` may reference the
/// evaluation environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomNotification {
    pub name: String,
    /// Named connection the transport should use.
    #[serde(default)]
    pub connection: String,
    /// Target address or URL.
    #[serde(default)]
    pub url: String,
    /// Additional filter on top of the rule's filter. Empty matches everything.
    #[serde(default)]
    pub filter: String,
    /// Message override. Empty falls back to the rule's template.
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A registered notification policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: String,
    /// Event names this rule listens to.
    pub events: Vec<String>,
    /// Boolean expression evaluated against the event's environment.
    pub filter: String,
    /// Message body.
    pub template: String,
    /// Extra properties handed to the transport, templated like the body.
    pub properties: BTreeMap<String, String>,
    pub person_id: Option<String>,
    pub team_id: Option<String>,
    pub custom_notifications: Vec<CustomNotification>,
}

impl NotificationRule {
    /// Whether the rule names at least one recipient.
    pub fn has_recipients(&self) -> bool {
        self.person_id.is_some() || self.team_id.is_some() || !self.custom_notifications.is_empty()
    }

    /// A rule without recipients or without a template can never produce a send.
    pub fn is_inert(&self) -> bool {
        !self.has_recipients() || self.template.is_empty()
    }

    /// Finds a custom notification by name.
    pub fn custom_notification(&self, name: &str) -> Option<&CustomNotification> {
        self.custom_notifications.iter().find(|cn| cn.name == name)
    }
}

/// The notification-relevant part of a team's specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSpec {
    #[serde(default)]
    pub notifications: Vec<CustomNotification>,
}

impl TeamSpec {
    /// Finds a team sub-notification by name.
    pub fn notification(&self, name: &str) -> Option<&CustomNotification> {
        self.notifications.iter().find(|cn| cn.name == name)
    }
}

/// A person recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inert_rules() {
        let mut rule = NotificationRule {
            id: "r1".to_string(),
            template: "hello".to_string(),
            ..Default::default()
        };
        assert!(rule.is_inert(), "no recipients");

        rule.person_id = Some("p1".to_string());
        assert!(!rule.is_inert());

        rule.template.clear();
        assert!(rule.is_inert(), "no template");
    }

    #[test]
    fn team_spec_parses_with_missing_fields() {
        let spec: TeamSpec = serde_json::from_str(
            r#"{"notifications":[{"name":"oncall","url":"https://hooks.example/oncall"}],"components":[]}"#,
        )
        .expect("should parse");

        let cn = spec.notification("oncall").expect("should find oncall");
        assert_eq!(cn.url, "https://hooks.example/oncall");
        assert!(cn.filter.is_empty());
        assert!(spec.notification("other").is_none());
    }
}
