//! Custom Resource Definitions for the registry rewriter

mod rewrite_rule;

pub use rewrite_rule::{
    RegistryRewriteRule, RegistryRewriteRuleSpec, RegistryRewriteRuleStatus, Rule, RuleConditions,
};
