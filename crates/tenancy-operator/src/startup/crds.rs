//! CRD installation
//!
//! The operator installs its own CRDs on startup with server-side apply so
//! the schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use tenancy_common::crd::{Business, BusinessRoleTemplateBinding, RoleTemplate, User};
use tenancy_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn tenancy_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "roletemplates.tenancy.dev",
            crd: RoleTemplate::crd(),
        },
        CrdDef {
            name: "businesses.tenancy.dev",
            crd: Business::crd(),
        },
        CrdDef {
            name: "businessroletemplatebindings.tenancy.dev",
            crd: BusinessRoleTemplateBinding::crd(),
        },
        CrdDef {
            name: "users.tenancy.dev",
            crd: User::crd(),
        },
    ]
}

/// Install or update every tenancy CRD
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in tenancy_crds() {
        tracing::info!(crd = %def.name, "installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("tenancy CRDs installed/updated");
    Ok(())
}

/// All CRDs as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = tenancy_crds()
        .into_iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}
