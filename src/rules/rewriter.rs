//! Image rewriting
//!
//! Evaluates compiled rules against one image reference. Evaluation stops at
//! the first rule whose conditions and pattern both match.

use std::collections::BTreeMap;

use crate::crd::RuleConditions;

use super::compiler::CompiledRule;
use super::image::normalize_image;

/// Where the image being rewritten lives, used to evaluate rule conditions
#[derive(Debug, Clone, Copy)]
pub struct RewriteScope<'a> {
    /// Namespace of the Pod
    pub namespace: &'a str,
    /// Labels of the Pod
    pub labels: &'a BTreeMap<String, String>,
}

impl<'a> RewriteScope<'a> {
    /// Create a scope for a Pod in `namespace` with `labels`
    pub fn new(namespace: &'a str, labels: &'a BTreeMap<String, String>) -> Self {
        Self { namespace, labels }
    }

    /// Check whether a rule's conditions allow it in this scope
    ///
    /// No conditions always match. A non-empty namespace list must contain
    /// the namespace, and every listed label must be present with an equal
    /// value.
    pub fn allows(&self, conditions: Option<&RuleConditions>) -> bool {
        let Some(conditions) = conditions else {
            return true;
        };

        if !conditions.namespaces.is_empty()
            && !conditions.namespaces.iter().any(|ns| ns == self.namespace)
        {
            return false;
        }

        conditions
            .labels
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// The outcome of a matching rule
#[derive(Debug, Clone)]
pub struct Rewrite<'r> {
    /// Normalized form of the original image the rule was matched against
    pub normalized: String,
    /// Rewritten image
    pub image: String,
    /// The rule that produced the rewrite
    pub rule: &'r CompiledRule,
}

/// Find the first rule that applies to `image` and rewrite it.
///
/// `rules` must already be in evaluation order. The image is normalized
/// before matching; `None` means no rule applied and the caller should keep
/// the original reference as-is.
pub fn rewrite_image<'r>(
    image: &str,
    rules: &'r [CompiledRule],
    scope: &RewriteScope<'_>,
) -> Option<Rewrite<'r>> {
    let normalized = normalize_image(image);

    rules
        .iter()
        .filter(|rule| scope.allows(rule.rule.conditions.as_ref()))
        .find(|rule| rule.is_match(&normalized))
        .map(|rule| Rewrite {
            image: rule.apply(&normalized),
            normalized,
            rule,
        })
}

/// Resolve the image a container should run, falling back to the original
/// reference when no rule applies
pub fn resolve_image(image: &str, rules: &[CompiledRule], scope: &RewriteScope<'_>) -> String {
    rewrite_image(image, rules, scope)
        .map(|r| r.image)
        .unwrap_or_else(|| image.to_string())
}
