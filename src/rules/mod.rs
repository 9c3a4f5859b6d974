//! Image rewrite rules
//!
//! - [`image`] - image reference normalization
//! - [`compiler`] - compiles declared rules into ordered matchers
//! - [`rewriter`] - first-match evaluation against one image
//! - [`cache`] - read-through cache of the compiled list
//! - [`store`] - where declared rule sets are read from

pub mod cache;
pub mod compiler;
pub mod image;
pub mod rewriter;
pub mod store;

pub use cache::RuleCache;
pub use compiler::{compile_rules, CompiledRule};
pub use image::{normalize_image, registry_of};
pub use rewriter::{resolve_image, rewrite_image, Rewrite, RewriteScope};
pub use store::{KubeRuleStore, RuleStore};
