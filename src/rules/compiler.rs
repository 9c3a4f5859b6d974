//! Rule compilation
//!
//! Turns declared RegistryRewriteRule objects into a flat list of compiled
//! matchers, ordered the way the rewriter evaluates them.

use std::cmp::Reverse;

use regex::Regex;
use tracing::{debug, error};

use crate::crd::{RegistryRewriteRule, Rule};

/// A rule with its pattern compiled, ready to evaluate
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Name of the RegistryRewriteRule that declared this rule
    pub rule_set: String,
    /// The declared rule
    pub rule: Rule,
    regex: Regex,
}

impl CompiledRule {
    /// Compile a declared rule
    pub fn compile(rule_set: impl Into<String>, rule: Rule) -> Result<Self, regex::Error> {
        let regex = Regex::new(&rule.match_)?;
        Ok(Self {
            rule_set: rule_set.into(),
            rule,
            regex,
        })
    }

    /// Evaluation priority, higher first
    pub fn priority(&self) -> i32 {
        self.rule.priority
    }

    /// Whether the pattern matches anywhere in `image`
    pub fn is_match(&self, image: &str) -> bool {
        self.regex.is_match(image)
    }

    /// Replace every match in `image` with the template, expanding `$N` and
    /// `${N}` to the corresponding capture group
    pub fn apply(&self, image: &str) -> String {
        self.regex
            .replace_all(image, self.rule.replace.as_str())
            .into_owned()
    }
}

/// Compile every rule of every rule set into one evaluation-ordered list.
///
/// Rules whose pattern does not compile are logged and skipped; the rest are
/// still compiled. The result is sorted by priority, highest first. Rule sets
/// are visited in name order and rules in declaration order, so rules of
/// equal priority keep that order.
pub fn compile_rules(rule_sets: &[RegistryRewriteRule]) -> Vec<CompiledRule> {
    let mut ordered: Vec<&RegistryRewriteRule> = rule_sets.iter().collect();
    ordered.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    let mut compiled = Vec::new();
    for rule_set in ordered {
        let name = rule_set.metadata.name.as_deref().unwrap_or_default();
        for rule in &rule_set.spec.rules {
            match CompiledRule::compile(name, rule.clone()) {
                Ok(c) => compiled.push(c),
                Err(e) => {
                    error!(
                        rule_set = %name,
                        pattern = %rule.match_,
                        error = %e,
                        "Failed to compile rewrite rule pattern, skipping rule"
                    );
                }
            }
        }
    }

    // stable: equal priorities keep rule-set/declaration order
    compiled.sort_by_key(|c| Reverse(c.priority()));

    debug!(rules = compiled.len(), "Compiled rewrite rules");
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RegistryRewriteRuleSpec;

    fn rule_set(name: &str, rules: Vec<Rule>) -> RegistryRewriteRule {
        RegistryRewriteRule::new(name, RegistryRewriteRuleSpec { rules })
    }

    #[test]
    fn apply_substitutes_capture_groups() {
        let rule = CompiledRule::compile(
            "mirror",
            Rule::new(r"^docker\.io/(.*)", "ecr.aws/dockerhub/$1"),
        )
        .unwrap();
        assert!(rule.is_match("docker.io/library/nginx:latest"));
        assert_eq!(
            rule.apply("docker.io/library/nginx:latest"),
            "ecr.aws/dockerhub/library/nginx:latest"
        );
    }

    #[test]
    fn apply_supports_braced_groups_next_to_text() {
        let rule = CompiledRule::compile(
            "mirror",
            Rule::new(r"^quay\.io/([^/]+)/(.*)", "mirror.local/${1}_quay/$2"),
        )
        .unwrap();
        assert_eq!(
            rule.apply("quay.io/prometheus/node-exporter:v1"),
            "mirror.local/prometheus_quay/node-exporter:v1"
        );
    }

    #[test]
    fn invalid_patterns_are_skipped_without_dropping_others() {
        let sets = vec![rule_set(
            "mixed",
            vec![
                Rule::new("([unclosed", "x"),
                Rule::new(r"^gcr\.io/(.*)", "mirror/$1"),
            ],
        )];

        let compiled = compile_rules(&sets);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].rule.match_, r"^gcr\.io/(.*)");
        assert_eq!(compiled[0].rule_set, "mixed");
    }

    #[test]
    fn rules_from_all_sets_are_sorted_by_priority_descending() {
        let sets = vec![
            rule_set("a", vec![Rule::new("low", "x").priority(1)]),
            rule_set(
                "b",
                vec![
                    Rule::new("high", "x").priority(100),
                    Rule::new("negative", "x").priority(-5),
                ],
            ),
            rule_set("c", vec![Rule::new("mid", "x").priority(50)]),
        ];

        let order: Vec<_> = compile_rules(&sets)
            .iter()
            .map(|c| c.rule.match_.clone())
            .collect();
        assert_eq!(order, vec!["high", "mid", "low", "negative"]);
    }

    #[test]
    fn equal_priorities_follow_rule_set_name_then_declaration_order() {
        // listed out of name order on purpose
        let sets = vec![
            rule_set("zeta", vec![Rule::new("z1", "x"), Rule::new("z2", "x")]),
            rule_set("alpha", vec![Rule::new("a1", "x"), Rule::new("a2", "x")]),
        ];

        let order: Vec<_> = compile_rules(&sets)
            .iter()
            .map(|c| c.rule.match_.clone())
            .collect();
        assert_eq!(order, vec!["a1", "a2", "z1", "z2"]);
    }

    #[test]
    fn no_rule_sets_compile_to_empty_list() {
        assert!(compile_rules(&[]).is_empty());
    }
}
