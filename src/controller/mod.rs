//! Controller for RegistryRewriteRule resources
//!
//! Two loops keep the webhook's compiled rules fresh:
//! - a `Controller` that reconciles each rule set (cache invalidation + status)
//! - a plain watcher that invalidates on any change, deletions included

mod rules;

pub use rules::{
    desired_status, error_policy, invalidate_on_events, invalidates, reconcile, Context,
    KubeRuleStatusClient, RuleStatusClient,
};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};

use crate::crd::RegistryRewriteRule;
use crate::rules::RuleCache;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the RegistryRewriteRule controller future
pub fn build_rule_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let rule_sets: Api<RegistryRewriteRule> = Api::all(client);

    tracing::info!("- RegistryRewriteRule controller");

    Box::pin(
        Controller::new(
            rule_sets,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("RegistryRewriteRule")),
    )
}

/// Build the cache invalidation watcher future
pub fn build_invalidation_watcher(
    client: Client,
    cache: Arc<RuleCache>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let rule_sets: Api<RegistryRewriteRule> = Api::all(client);

    tracing::info!("- RegistryRewriteRule invalidation watcher");

    Box::pin(async move {
        let events = watcher::watcher(
            rule_sets,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff();
        invalidate_on_events(events, &cache).await;
        tracing::warn!("RegistryRewriteRule watcher stream ended");
    })
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
