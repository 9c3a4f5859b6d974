//! RegistryRewriteRule Custom Resource Definition
//!
//! A RegistryRewriteRule is a cluster-scoped, named set of image rewrite
//! rules. Every rule set in the cluster contributes to a single flat,
//! priority-ordered rule list evaluated by the Pod mutation webhook.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a RegistryRewriteRule
///
/// Example:
/// ```yaml
/// apiVersion: registry-rewriter.dev/v1alpha1
/// kind: RegistryRewriteRule
/// metadata:
///   name: dockerhub-mirror
/// spec:
///   rules:
///     - match: '^docker\.io/(.*)'
///       replace: 'ecr.aws/dockerhub/$1'
///       priority: 10
///       conditions:
///         namespaces: [default, apps]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "registry-rewriter.dev",
    version = "v1alpha1",
    kind = "RegistryRewriteRule",
    plural = "registryrewriterules",
    shortname = "rrr",
    status = "RegistryRewriteRuleStatus",
    printcolumn = r#"{"name":"Rules","type":"integer","jsonPath":".status.ruleCount","description":"Number of rules"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready","description":"Whether the rules are ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRewriteRuleSpec {
    /// Rewrite rules declared by this rule set
    #[schemars(length(min = 1))]
    pub rules: Vec<Rule>,
}

impl RegistryRewriteRuleSpec {
    /// Validate the rule set
    ///
    /// Pattern syntax is not checked here: invalid patterns are dropped
    /// individually when the rule cache is rebuilt.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.rules.is_empty() {
            return Err(crate::Error::validation(
                "spec.rules must declare at least one rule",
            ));
        }

        if let Some(idx) = self.rules.iter().position(|r| r.match_.is_empty()) {
            return Err(crate::Error::validation(format!(
                "spec.rules[{}].match must not be empty",
                idx
            )));
        }

        Ok(())
    }
}

/// A single registry rewrite rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// RE2-compatible regular expression matched against the normalized image
    #[serde(rename = "match")]
    pub match_: String,

    /// Replacement template; `$1` / `${1}` expand to captured groups
    pub replace: String,

    /// Evaluation order, higher first
    #[serde(default)]
    pub priority: i32,

    /// Restricts where the rule applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<RuleConditions>,
}

impl Rule {
    /// Create an unconditioned rule with priority 0
    pub fn new(match_: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            match_: match_.into(),
            replace: replace.into(),
            ..Default::default()
        }
    }

    /// Set the priority and return self for chaining
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the conditions and return self for chaining
    pub fn conditions(mut self, conditions: RuleConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

/// Conditions under which a rule applies
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    /// Namespaces the rule is limited to; empty means all namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Pod labels that must all be present with exactly these values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Status for a RegistryRewriteRule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRewriteRuleStatus {
    /// Generation last observed by the rules watcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Whether the rules are ready to be used
    #[serde(default)]
    pub ready: bool,

    /// Number of rules in this resource
    #[serde(default)]
    pub rule_count: u32,

    /// Last time the rules were observed to change (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    /// Human-readable reason when not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RegistryRewriteRuleStatus {
    /// True when this status already reflects the given generation and rule count
    ///
    /// `last_update_time` is ignored so that writing the status does not
    /// trigger another write.
    pub fn is_current(&self, generation: Option<i64>, ready: bool, rule_count: u32) -> bool {
        self.observed_generation == generation
            && self.ready == ready
            && self.rule_count == rule_count
    }
}

impl RegistryRewriteRule {
    /// Number of rules declared in this rule set
    pub fn rule_count(&self) -> u32 {
        self.spec.rules.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn parses_rule_set_yaml() {
        let yaml = r#"
apiVersion: registry-rewriter.dev/v1alpha1
kind: RegistryRewriteRule
metadata:
  name: dockerhub-mirror
spec:
  rules:
    - match: '^docker\.io/(.*)'
      replace: 'ecr.aws/dockerhub/$1'
      priority: 10
      conditions:
        namespaces: [default, apps]
        labels:
          team: platform
    - match: '^quay\.io/(.*)'
      replace: 'mirror.local/quay/$1'
"#;
        let rr: RegistryRewriteRule = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(rr.spec.rules.len(), 2);

        let first = &rr.spec.rules[0];
        assert_eq!(first.match_, r"^docker\.io/(.*)");
        assert_eq!(first.replace, "ecr.aws/dockerhub/$1");
        assert_eq!(first.priority, 10);
        let conditions = first.conditions.as_ref().expect("conditions");
        assert_eq!(conditions.namespaces, vec!["default", "apps"]);
        assert_eq!(conditions.labels.get("team").map(String::as_str), Some("platform"));

        let second = &rr.spec.rules[1];
        assert_eq!(second.priority, 0, "priority defaults to 0");
        assert!(second.conditions.is_none());
    }

    #[test]
    fn match_field_serializes_without_trailing_underscore() {
        let rule = Rule::new("^a", "b").priority(3);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["match"], "^a");
        assert_eq!(json["priority"], 3);
        assert!(json.get("conditions").is_none());
    }

    #[test]
    fn validate_rejects_empty_rule_list() {
        let spec = RegistryRewriteRuleSpec { rules: vec![] };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("at least one rule"));
    }

    #[test]
    fn validate_rejects_empty_pattern() {
        let spec = RegistryRewriteRuleSpec {
            rules: vec![Rule::new("^ok", "x"), Rule::new("", "y")],
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("spec.rules[1].match"));
    }

    #[test]
    fn validate_accepts_rules_with_unparsable_patterns() {
        let spec = RegistryRewriteRuleSpec {
            rules: vec![Rule::new("([unclosed", "x")],
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn status_currency_ignores_timestamp() {
        let status = RegistryRewriteRuleStatus {
            observed_generation: Some(4),
            ready: true,
            rule_count: 2,
            last_update_time: Some("2025-01-01T00:00:00Z".to_string()),
            message: None,
        };
        assert!(status.is_current(Some(4), true, 2));
        assert!(!status.is_current(Some(5), true, 2));
        assert!(!status.is_current(Some(4), true, 3));
        assert!(!status.is_current(Some(4), false, 2));
    }

    #[test]
    fn crd_is_cluster_scoped_with_short_name() {
        let crd = RegistryRewriteRule::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("registryrewriterules.registry-rewriter.dev")
        );
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["rrr".to_string()])
        );
    }
}
