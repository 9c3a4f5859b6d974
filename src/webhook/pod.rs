//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pods, rewriting the image of every
//! container, init container and ephemeral container according to the
//! compiled rewrite rules.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use json_patch::{PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    core::Status,
};
use tracing::{debug, error, info, warn};

use crate::metrics::{MetricsSink, MutationStatus, MutationTimer};
use crate::rules::{registry_of, rewrite_image, CompiledRule, RewriteScope};
use crate::{Error, DISABLE_ANNOTATION};

use super::WebhookState;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admitted object could not be read as a Pod
    #[error("failed to decode pod: {0}")]
    Decode(#[from] serde_json::Error),

    /// The JSON patch could not be serialized
    #[error("failed to serialize patch: {0}")]
    Patch(String),
}

impl WebhookError {
    /// HTTP-style status code reported in the admission response
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Decode(_) => StatusCode::BAD_REQUEST,
            WebhookError::Patch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build a rejecting admission response carrying this error
    pub fn into_admission_response(self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let code = self.status_code();
        let message = self.to_string();
        let mut response = AdmissionResponse::from(request).deny(&message);
        response.result = Status::failure(&message, code.canonical_reason().unwrap_or("Error"))
            .with_code(code.as_u16());
        response
    }
}

/// Why a Pod was admitted without a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    /// The request carried no object
    NoObject,
    /// The Pod opted out with the disable annotation
    Disabled,
    /// Rules could not be fetched in time; failing open
    RulesUnavailable,
    /// No rules are declared
    NoRules,
    /// No image needed rewriting
    NoChanges,
}

impl AllowReason {
    /// Human-readable reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoObject => "no object in request",
            Self::Disabled => "rewrite disabled",
            Self::RulesUnavailable => "failed to get rules",
            Self::NoRules => "no rules configured",
            Self::NoChanges => "no mutations needed",
        }
    }
}

/// One container image to replace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChange {
    /// Pod spec field holding the container (`containers`, `initContainers`, `ephemeralContainers`)
    pub field: &'static str,
    /// Index of the container within that field
    pub index: usize,
    /// Container name
    pub container: String,
    /// Image as submitted
    pub from: String,
    /// Rewritten image
    pub to: String,
}

impl ImageChange {
    /// JSON pointer to the image field this change replaces
    pub fn path(&self) -> PointerBuf {
        let index = self.index.to_string();
        PointerBuf::from_tokens(["spec", self.field, index.as_str(), "image"])
    }
}

/// Outcome of evaluating a Pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodMutation {
    /// Admit the Pod as submitted
    Allow(AllowReason),
    /// Admit the Pod with these images replaced
    Rewrite(Vec<ImageChange>),
}

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match mutate_pod(&state, &req).await {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Failed to mutate pod");
            e.into_admission_response(&req)
        }
    };
    Json(response.into_review())
}

/// Process a single Pod admission request into a response
pub async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, WebhookError> {
    let timer = MutationTimer::start(request_namespace(request));
    let result = evaluate_pod(state, request).await;
    timer.finish(state.metrics.as_ref());

    match result? {
        PodMutation::Allow(reason) => {
            debug!(uid = %request.uid, reason = reason.as_str(), "Allowing pod unchanged");
            Ok(AdmissionResponse::from(request))
        }
        PodMutation::Rewrite(changes) => {
            let ops = build_patch_operations(&changes);
            info!(uid = %request.uid, patch_ops = ops.len(), "Applying image patch to pod");
            AdmissionResponse::from(request)
                .with_patch(json_patch::Patch(ops))
                .map_err(|e| WebhookError::Patch(e.to_string()))
        }
    }
}

/// Decide how a Pod should be mutated
///
/// Rule fetch failures and timeouts fail open: the Pod is allowed unchanged.
pub async fn evaluate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<PodMutation, WebhookError> {
    let uid = &request.uid;

    let obj = match &request.object {
        Some(obj) => obj,
        None => return Ok(PodMutation::Allow(AllowReason::NoObject)),
    };

    let pod = decode_pod(obj)?;
    let namespace = request_namespace(request);

    if is_rewrite_disabled(&pod) {
        info!(
            uid = %uid,
            pod = ?pod.metadata.name,
            namespace = %namespace,
            "Skipping mutation, {} annotation found",
            DISABLE_ANNOTATION
        );
        return Ok(PodMutation::Allow(AllowReason::Disabled));
    }

    let rules = match fetch_rules(state).await {
        Ok(rules) => rules,
        Err(e @ Error::Timeout(_)) => {
            warn!(uid = %uid, error = %e, "Timed out fetching rules, allowing pod unchanged");
            return Ok(PodMutation::Allow(AllowReason::RulesUnavailable));
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to get rules, allowing pod unchanged");
            return Ok(PodMutation::Allow(AllowReason::RulesUnavailable));
        }
    };

    if rules.is_empty() {
        return Ok(PodMutation::Allow(AllowReason::NoRules));
    }

    let Some(spec) = pod.spec.as_ref() else {
        return Ok(PodMutation::Allow(AllowReason::NoChanges));
    };

    let no_labels = BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&no_labels);
    let scope = RewriteScope::new(&namespace, labels);

    let changes = plan_image_changes(spec, &rules, &scope, state.metrics.as_ref());
    for change in &changes {
        info!(
            uid = %uid,
            field = change.field,
            container = %change.container,
            from = %change.from,
            to = %change.to,
            "Mutated container image"
        );
    }

    if changes.is_empty() {
        Ok(PodMutation::Allow(AllowReason::NoChanges))
    } else {
        Ok(PodMutation::Rewrite(changes))
    }
}

/// Namespace of the admitted Pod: the request's, else the object's metadata
fn request_namespace(request: &AdmissionRequest<DynamicObject>) -> String {
    request
        .namespace
        .clone()
        .or_else(|| {
            request
                .object
                .as_ref()
                .and_then(|obj| obj.metadata.namespace.clone())
        })
        .unwrap_or_default()
}

/// Current compiled rules, bounded by the store timeout
pub async fn fetch_rules(state: &WebhookState) -> Result<Arc<[CompiledRule]>, Error> {
    match tokio::time::timeout(state.store_timeout, state.cache.get()).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "rule store did not answer within {}ms",
            state.store_timeout.as_millis()
        ))),
    }
}

/// Read the admitted object as a Pod
fn decode_pod(obj: &DynamicObject) -> Result<Pod, serde_json::Error> {
    serde_json::to_value(obj).and_then(serde_json::from_value)
}

/// True when the Pod carries `rewrite-disabled: "true"`
pub fn is_rewrite_disabled(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DISABLE_ANNOTATION))
        .is_some_and(|v| v == "true")
}

/// Evaluate every container image in the Pod spec against the rules
///
/// Every image a rule matches is reported to `metrics`; only images that
/// actually change are returned.
pub fn plan_image_changes(
    spec: &PodSpec,
    rules: &[CompiledRule],
    scope: &RewriteScope<'_>,
    metrics: &dyn MetricsSink,
) -> Vec<ImageChange> {
    let containers = spec
        .containers
        .iter()
        .enumerate()
        .map(|(i, c)| ("containers", i, c.name.as_str(), c.image.as_deref()));
    let init_containers = spec
        .init_containers
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, c)| ("initContainers", i, c.name.as_str(), c.image.as_deref()));
    let ephemeral_containers = spec
        .ephemeral_containers
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, c)| ("ephemeralContainers", i, c.name.as_str(), c.image.as_deref()));

    let mut changes = Vec::new();
    for (field, index, name, image) in containers.chain(init_containers).chain(ephemeral_containers) {
        // Empty images are left for API server validation to reject
        let Some(image) = image.filter(|i| !i.is_empty()) else {
            continue;
        };
        let Some(rewrite) = rewrite_image(image, rules, scope) else {
            continue;
        };

        debug!(
            image = %rewrite.normalized,
            rule_set = %rewrite.rule.rule_set,
            pattern = %rewrite.rule.rule.match_,
            new_image = %rewrite.image,
            "Image matched rule"
        );

        let status = if rewrite.image == image {
            MutationStatus::Unchanged
        } else {
            MutationStatus::Success
        };
        metrics.record_mutation(
            scope.namespace,
            registry_of(&rewrite.normalized),
            registry_of(&rewrite.image),
            status,
        );

        if status == MutationStatus::Success {
            changes.push(ImageChange {
                field,
                index,
                container: name.to_string(),
                from: image.to_string(),
                to: rewrite.image,
            });
        }
    }
    changes
}

/// Build JSON patch operations replacing each changed image
pub fn build_patch_operations(changes: &[ImageChange]) -> Vec<PatchOperation> {
    changes
        .iter()
        .map(|change| {
            PatchOperation::Replace(ReplaceOperation {
                path: change.path(),
                value: serde_json::Value::String(change.to.clone()),
            })
        })
        .collect()
}
