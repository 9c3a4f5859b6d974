//! Startup tasks run before serving

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use crate::crd::RegistryRewriteRule;
use crate::{Error, FIELD_MANAGER};

/// Install or update the RegistryRewriteRule CRD using server-side apply
///
/// Keeps the installed CRD in step with the running binary.
pub async fn ensure_crd_installed(client: &Client) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = RegistryRewriteRule::crd();
    let name = crd_name();

    tracing::info!(crd = %name, "Installing RegistryRewriteRule CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd)).await?;

    tracing::info!(crd = %name, "RegistryRewriteRule CRD installed/updated");
    Ok(())
}

/// Render the CRD manifest as YAML
pub fn crd_yaml() -> Result<String, Error> {
    serde_yaml::to_string(&RegistryRewriteRule::crd())
        .map_err(|e| Error::serialization(format!("failed to serialize CRD: {}", e)))
}

fn crd_name() -> String {
    RegistryRewriteRule::crd_name().to_string()
}
