//! Compiled rule cache
//!
//! Holds the most recently compiled rule list. The list is shared as an
//! immutable `Arc<[CompiledRule]>` and only ever replaced whole, so readers
//! observe either the previous list or the new one.
//!
//! Rebuilds are single-flight: callers that miss queue on the rebuild lock and
//! reuse the list installed by whoever got there first. Every invalidation
//! bumps a generation counter; a rebuild that started before the latest
//! invalidation still answers its caller but is not installed.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metrics::MetricsSink;
use crate::Error;

use super::compiler::{compile_rules, CompiledRule};
use super::store::RuleStore;

#[derive(Default)]
struct CacheState {
    rules: Option<Arc<[CompiledRule]>>,
    generation: u64,
}

/// Read-through cache of compiled rewrite rules
pub struct RuleCache {
    store: Arc<dyn RuleStore>,
    metrics: Arc<dyn MetricsSink>,
    state: RwLock<CacheState>,
    rebuild: Mutex<()>,
}

impl RuleCache {
    /// Create an empty cache reading from `store`
    pub fn new(store: Arc<dyn RuleStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            state: RwLock::new(CacheState::default()),
            rebuild: Mutex::new(()),
        }
    }

    /// Current rule list, rebuilding it from the store if the cache is empty
    pub async fn get(&self) -> Result<Arc<[CompiledRule]>, Error> {
        if let Some(rules) = self.cached() {
            self.metrics.record_cache_hit();
            return Ok(rules);
        }

        let _rebuilding = self.rebuild.lock().await;

        // Another caller may have rebuilt while we waited
        if let Some(rules) = self.cached() {
            self.metrics.record_cache_hit();
            return Ok(rules);
        }

        self.metrics.record_cache_miss();
        let generation = self.state.read().generation;

        let rule_sets = self.store.list().await?;
        let rules: Arc<[CompiledRule]> = compile_rules(&rule_sets).into();

        {
            let mut state = self.state.write();
            if state.generation == generation {
                state.rules = Some(rules.clone());
                self.metrics.set_active_rules(rules.len());
                info!(
                    rule_sets = rule_sets.len(),
                    rules = rules.len(),
                    "Rebuilt rewrite rule cache"
                );
            } else {
                debug!("Rule cache invalidated during rebuild, not caching result");
            }
        }

        Ok(rules)
    }

    /// Drop the cached list; the next `get` rebuilds it
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        state.rules = None;
        state.generation = state.generation.wrapping_add(1);
        debug!(generation = state.generation, "Rule cache invalidated");
    }

    /// Whether a compiled list is currently cached
    pub fn is_populated(&self) -> bool {
        self.state.read().rules.is_some()
    }

    fn cached(&self) -> Option<Arc<[CompiledRule]>> {
        self.state.read().rules.clone()
    }
}
