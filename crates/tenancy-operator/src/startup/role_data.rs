//! Default role templates
//!
//! `business-owner` and `business-member` are applied on every start.
//! Server-side apply keeps them idempotent; fields an administrator adds
//! under another field manager are left alone.

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

use tenancy_common::crd::{PolicyRule, RoleTemplate, RoleTemplateSpec};
use tenancy_common::{FIELD_MANAGER, TENANCY_API_GROUP};

const READ: [&str; 3] = ["get", "list", "watch"];

/// Context marker for templates assigned within a Business
const BUSINESS_CONTEXT: &str = "business";

fn template(name: &str, display_name: &str, rules: Vec<PolicyRule>) -> RoleTemplate {
    RoleTemplate::new(
        name,
        RoleTemplateSpec {
            display_name: Some(display_name.to_string()),
            context: Some(BUSINESS_CONTEXT.to_string()),
            rules,
            locked: false,
            external: false,
            role_template_names: Vec::new(),
        },
    )
}

/// Templates every installation starts with
pub fn default_role_templates() -> Vec<RoleTemplate> {
    vec![
        template(
            "business-owner",
            "Business Owner",
            vec![
                PolicyRule::for_groups(["*"]).resources(["*"]).verbs(["*"]),
                PolicyRule::default().non_resource_urls(["*"]).verbs(["*"]),
            ],
        ),
        template(
            "business-member",
            "Business Member",
            vec![
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["businessroletemplatebindings"])
                    .verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["clusterroletemplatebindings"])
                    .verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["projects"])
                    .verbs(["create"]),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["nodes", "nodepools"])
                    .verbs(READ),
                PolicyRule::for_groups(["*"]).resources(["nodes"]).verbs(READ),
                PolicyRule::for_groups(["*"])
                    .resources(["persistentvolumes"])
                    .verbs(READ),
                PolicyRule::for_groups(["*"]).resources(["storageclasses"]).verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["clusterevents"])
                    .verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["clusterpipelines"])
                    .verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["clusterloggings"])
                    .verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["clusteralerts"])
                    .verbs(READ),
                PolicyRule::for_groups([TENANCY_API_GROUP])
                    .resources(["notifiers"])
                    .verbs(READ),
            ],
        ),
    ]
}

/// Apply the default templates
pub async fn ensure_default_role_templates(client: &Client) -> anyhow::Result<()> {
    let api: Api<RoleTemplate> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for template in default_role_templates() {
        let name = template.name_any();
        api.patch(&name, &params, &Patch::Apply(&template))
            .await
            .map_err(|e| anyhow::anyhow!("failed to apply role template {}: {}", name, e))?;
        tracing::info!(template = %name, "default role template applied");
    }
    Ok(())
}
