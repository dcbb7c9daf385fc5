//! Role template resolution
//!
//! Templates include other templates by name. Resolution walks the
//! inclusion DAG depth-first and collects each template once, keyed by
//! name. The walk tracks the current inclusion path so a cycle fails with
//! [`Error::CyclicTemplate`] instead of looping.

use std::collections::BTreeMap;

use tenancy_common::crd::RoleTemplate;
use tenancy_common::Error;

use crate::client::RbacClient;

/// Kind name used in not-found errors
const ROLE_TEMPLATE_KIND: &str = "RoleTemplate";

enum Step {
    Enter(String),
    Exit,
}

/// Resolve `root` into its transitive closure of included templates
///
/// Any missing template fails the whole resolution with `NotFound`.
pub async fn gather_templates(
    client: &dyn RbacClient,
    root: &str,
) -> Result<BTreeMap<String, RoleTemplate>, Error> {
    let mut gathered = BTreeMap::new();
    let mut path: Vec<String> = Vec::new();
    let mut stack = vec![Step::Enter(root.to_string())];

    while let Some(step) = stack.pop() {
        let name = match step {
            Step::Exit => {
                path.pop();
                continue;
            }
            Step::Enter(name) => name,
        };

        if let Some(start) = path.iter().position(|n| *n == name) {
            let mut chain = path[start..].to_vec();
            chain.push(name);
            return Err(Error::CyclicTemplate { chain });
        }
        if gathered.contains_key(&name) {
            continue;
        }

        let template = client
            .get_role_template(&name)
            .await?
            .ok_or_else(|| Error::not_found(ROLE_TEMPLATE_KIND, &name))?;

        stack.push(Step::Exit);
        for included in template.spec.role_template_names.iter().rev() {
            stack.push(Step::Enter(included.clone()));
        }
        path.push(name.clone());
        gathered.insert(name, template);
    }

    Ok(gathered)
}

/// Resolve `root` and fold templates that share a name
///
/// `gather_templates` already keys by name, so this only guarantees the
/// name inside each template matches its key.
pub async fn gather_and_dedupe_roles(
    client: &dyn RbacClient,
    root: &str,
) -> Result<Vec<RoleTemplate>, Error> {
    let gathered = gather_templates(client, root).await?;
    let mut roles: BTreeMap<String, RoleTemplate> = BTreeMap::new();
    for (key, template) in gathered {
        let name = template.metadata.name.clone().unwrap_or(key);
        roles.insert(name, template);
    }
    Ok(roles.into_values().collect())
}

/// Name of a resolved template
pub fn template_name(template: &RoleTemplate) -> &str {
    template.metadata.name.as_deref().unwrap_or_default()
}
