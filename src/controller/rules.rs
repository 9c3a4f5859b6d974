//! RegistryRewriteRule reconciliation
//!
//! Every reconcile drops the compiled rule cache so the next admission
//! request sees the current rule sets, then reports status on the rule set
//! that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{RegistryRewriteRule, RegistryRewriteRuleStatus};
use crate::rules::RuleCache;
use crate::{Error, FIELD_MANAGER};

/// Writes status onto RegistryRewriteRule resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleStatusClient: Send + Sync {
    /// Merge-patch the status subresource of the named rule set
    async fn patch_status(
        &self,
        name: &str,
        status: &RegistryRewriteRuleStatus,
    ) -> Result<(), Error>;
}

/// RuleStatusClient backed by the Kubernetes API
pub struct KubeRuleStatusClient {
    client: Client,
}

impl KubeRuleStatusClient {
    /// Create a new KubeRuleStatusClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RuleStatusClient for KubeRuleStatusClient {
    async fn patch_status(
        &self,
        name: &str,
        status: &RegistryRewriteRuleStatus,
    ) -> Result<(), Error> {
        let api: Api<RegistryRewriteRule> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "status": status
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Controller context
pub struct Context {
    /// Compiled rule cache shared with the webhook
    pub cache: Arc<RuleCache>,
    /// Status writer
    pub status: Arc<dyn RuleStatusClient>,
}

impl Context {
    /// Create a controller context
    pub fn new(cache: Arc<RuleCache>, status: Arc<dyn RuleStatusClient>) -> Self {
        Self { cache, status }
    }
}

/// Reconcile a RegistryRewriteRule
#[instrument(skip(rule_set, ctx), fields(rule_set = %rule_set.name_any()))]
pub async fn reconcile(
    rule_set: Arc<RegistryRewriteRule>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = rule_set.name_any();
    info!(rules = rule_set.rule_count(), "Reconciling RegistryRewriteRule");

    ctx.cache.invalidate();

    let status = desired_status(&rule_set);

    // Skip writes that would change nothing but the timestamp; avoids an update loop
    if let Some(ref current) = rule_set.status {
        if current.is_current(status.observed_generation, status.ready, status.rule_count) {
            debug!("Status unchanged, skipping update");
            return Ok(Action::await_change());
        }
    }

    ctx.status.patch_status(&name, &status).await?;
    info!(ready = status.ready, rule_count = status.rule_count, "Updated status");

    Ok(Action::await_change())
}

/// Status to report for a rule set as currently declared
pub fn desired_status(rule_set: &RegistryRewriteRule) -> RegistryRewriteRuleStatus {
    let (ready, message) = match rule_set.spec.validate() {
        Ok(()) => (true, None),
        Err(e) => {
            warn!(rule_set = %rule_set.name_any(), error = %e, "Invalid rule set");
            (false, Some(e.to_string()))
        }
    };

    RegistryRewriteRuleStatus {
        observed_generation: rule_set.metadata.generation,
        ready,
        rule_count: rule_set.rule_count(),
        last_update_time: Some(chrono::Utc::now().to_rfc3339()),
        message,
    }
}

/// Error policy for the controller
///
/// Returns an `Action` to requeue the resource after a delay.
pub fn error_policy(rule_set: Arc<RegistryRewriteRule>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        rule_set = %rule_set.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Whether a watch event should drop the compiled rule cache
///
/// Individual objects seen during a re-list are covered by the `InitDone`
/// that closes it.
pub fn invalidates(event: &Event<RegistryRewriteRule>) -> bool {
    matches!(event, Event::Apply(_) | Event::Delete(_) | Event::InitDone)
}

/// Invalidate the cache for every relevant event on `events`
///
/// Runs until the stream ends. The controller never sees deletions, so this
/// is what drops rules that were removed from the cluster.
pub async fn invalidate_on_events<S>(events: S, cache: &RuleCache)
where
    S: Stream<Item = Result<Event<RegistryRewriteRule>, watcher::Error>>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if invalidates(&event) {
                    match &event {
                        Event::Delete(rule_set) => {
                            info!(rule_set = %rule_set.name_any(), "Rule set deleted, invalidating cache")
                        }
                        _ => debug!("Rule sets changed, invalidating cache"),
                    }
                    cache.invalidate();
                }
            }
            Err(e) => warn!(error = %e, "Rule watcher error, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RegistryRewriteRuleSpec, Rule};
    use crate::metrics::NoopMetrics;
    use crate::rules::store::MockRuleStore;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn sample_rule_set(name: &str, rules: Vec<Rule>) -> RegistryRewriteRule {
        let mut rule_set = RegistryRewriteRule::new(name, RegistryRewriteRuleSpec { rules });
        rule_set.metadata.generation = Some(3);
        rule_set
    }

    fn mirror() -> RegistryRewriteRule {
        sample_rule_set(
            "mirror",
            vec![
                Rule::new(r"^docker\.io/(.*)", "ecr.aws/dockerhub/$1").priority(10),
                Rule::new(r"^quay\.io/(.*)", "ecr.aws/quay/$1"),
            ],
        )
    }

    async fn populated_cache() -> Arc<RuleCache> {
        let mut store = MockRuleStore::new();
        store.expect_list().returning(|| Ok(vec![mirror()]));
        let cache = Arc::new(RuleCache::new(Arc::new(store), Arc::new(NoopMetrics)));
        cache.get().await.unwrap();
        assert!(cache.is_populated());
        cache
    }

    fn context(cache: Arc<RuleCache>, status: MockRuleStatusClient) -> Arc<Context> {
        Arc::new(Context::new(cache, Arc::new(status)))
    }

    // =========================================================================
    // Status
    // =========================================================================

    #[test]
    fn test_desired_status_for_valid_rule_set() {
        let status = desired_status(&mirror());

        assert!(status.ready);
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.rule_count, 2);
        assert!(status.message.is_none());

        let updated = status.last_update_time.expect("timestamp set");
        assert!(chrono::DateTime::parse_from_rfc3339(&updated).is_ok());
    }

    #[test]
    fn test_desired_status_for_empty_rule_set_is_not_ready() {
        let status = desired_status(&sample_rule_set("empty", vec![]));

        assert!(!status.ready);
        assert_eq!(status.rule_count, 0);
        assert!(status.message.unwrap().contains("at least one rule"));
    }

    #[test]
    fn test_invalidating_events() {
        assert!(invalidates(&Event::Apply(mirror())));
        assert!(invalidates(&Event::Delete(mirror())));
        assert!(invalidates(&Event::InitDone));
        assert!(!invalidates(&Event::Init));
        assert!(!invalidates(&Event::InitApply(mirror())));
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: a new rule set drops the cache and gets its status written
    #[tokio::test]
    async fn story_reconcile_invalidates_and_writes_status() {
        let cache = populated_cache().await;

        let mut status = MockRuleStatusClient::new();
        status
            .expect_patch_status()
            .withf(|name, status| {
                name == "mirror"
                    && status.ready
                    && status.rule_count == 2
                    && status.observed_generation == Some(3)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(mirror()), context(cache.clone(), status))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(!cache.is_populated());
    }

    /// Story: a status that already reflects the generation is left alone
    #[tokio::test]
    async fn story_current_status_is_not_rewritten() {
        let cache = populated_cache().await;

        let mut rule_set = mirror();
        rule_set.status = Some(RegistryRewriteRuleStatus {
            observed_generation: Some(3),
            ready: true,
            rule_count: 2,
            last_update_time: Some("2026-01-01T00:00:00+00:00".into()),
            message: None,
        });

        let mut status = MockRuleStatusClient::new();
        status.expect_patch_status().never();

        let action = reconcile(Arc::new(rule_set), context(cache.clone(), status))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        // still invalidated: the watcher may have re-listed after a change
        assert!(!cache.is_populated());
    }

    /// Story: a newer generation is reported even if the rule count is the same
    #[tokio::test]
    async fn story_new_generation_updates_status() {
        let cache = populated_cache().await;

        let mut rule_set = mirror();
        rule_set.metadata.generation = Some(4);
        rule_set.status = Some(RegistryRewriteRuleStatus {
            observed_generation: Some(3),
            ready: true,
            rule_count: 2,
            ..Default::default()
        });

        let mut status = MockRuleStatusClient::new();
        status
            .expect_patch_status()
            .withf(|_, status| status.observed_generation == Some(4))
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(rule_set), context(cache, status))
            .await
            .unwrap();
    }

    /// Story: status write failures surface so the controller retries
    #[tokio::test]
    async fn story_status_failure_is_retried() {
        let cache = populated_cache().await;

        let mut status = MockRuleStatusClient::new();
        status
            .expect_patch_status()
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));
        let ctx = context(cache, status);

        let rule_set = Arc::new(mirror());
        let err = reconcile(rule_set.clone(), ctx.clone()).await.unwrap_err();

        let action = error_policy(rule_set, &err, ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    /// Story: deleting a rule set drops the cache even without a reconcile
    #[tokio::test]
    async fn story_deletion_invalidates_cache() {
        let cache = populated_cache().await;

        let events = futures::stream::iter(vec![Ok(Event::Delete(mirror()))]);
        invalidate_on_events(events, &cache).await;

        assert!(!cache.is_populated());
    }

    /// Story: a re-list invalidates once, at the end
    #[tokio::test]
    async fn story_relist_invalidates_when_done() {
        let cache = populated_cache().await;

        let events = futures::stream::iter(vec![Ok(Event::Init), Ok(Event::InitApply(mirror()))]);
        invalidate_on_events(events, &cache).await;
        assert!(cache.is_populated());

        let events = futures::stream::iter(vec![Ok(Event::InitDone)]);
        invalidate_on_events(events, &cache).await;
        assert!(!cache.is_populated());
    }
}
