//! Registry Rewriter - mutating admission webhook for Pod container images
//!
//! Rewrites container image references (e.g. to a pull-through mirror) as
//! Pods are admitted, using prioritized regular-expression rules declared in
//! cluster-scoped `RegistryRewriteRule` resources.
//!
//! # Architecture
//!
//! - The webhook normalizes each image and applies the first matching rule
//! - Compiled rules are cached and rebuilt lazily after any rule set changes
//! - A controller invalidates the cache and reports status on rule sets
//! - Rule fetch failures fail open: Pods are admitted unchanged
//!
//! # Modules
//!
//! - [`crd`] - RegistryRewriteRule custom resource
//! - [`rules`] - Rule compilation, image normalization, rewriting and caching
//! - [`webhook`] - Admission webhook server and Pod mutation handler
//! - [`controller`] - Reconciliation and cache invalidation
//! - [`metrics`] - Mutation and cache metrics
//! - [`telemetry`] - Logging, tracing and metrics export setup
//! - [`startup`] - CRD installation
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod rules;
pub mod startup;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default webhook listen address
///
/// Port 9443 avoids requiring root privileges.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9443";

/// Default time a request may wait for rules before failing open
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;

/// Pod annotation that disables rewriting when set to `"true"`
pub const DISABLE_ANNOTATION: &str = "rewrite-disabled";

/// Path the API server posts Pod admission reviews to
pub const MUTATE_POD_PATH: &str = "/mutate-v1-pod";

/// Field manager for server-side apply and status patches
pub const FIELD_MANAGER: &str = "registry-rewriter";
