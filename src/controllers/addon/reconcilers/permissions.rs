use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::*;

use crate::agent::cluster_addon_group;
use crate::resources::addontemplates::{HubPermissionConfig, HubPermissionType};
use crate::resources::manifestworks::ADDON_NAME_LABEL;
use crate::resources::FIELD_MANAGER;
use crate::Result;

fn binding_name(addon_name: &str) -> String {
    format!("open-cluster-management:{addon_name}:agent")
}

fn agent_subject(cluster: &str, addon_name: &str) -> Subject {
    Subject {
        kind: "Group".into(),
        api_group: Some("rbac.authorization.k8s.io".into()),
        name: cluster_addon_group(cluster, addon_name),
        namespace: None,
    }
}

fn binding(
    name: String,
    namespace: &str,
    addon_name: &str,
    cluster: &str,
    role_ref: RoleRef,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some([(ADDON_NAME_LABEL.to_string(), addon_name.to_string())].into()),
            ..Default::default()
        },
        role_ref,
        subjects: Some(vec![agent_subject(cluster, addon_name)]),
    }
}

/// Bind the declared hub permissions to the agent group: a ClusterRole in the
/// cluster namespace, or a fixed role in one shared namespace.
pub async fn apply_hub_permissions(
    client: &Client,
    cluster: &str,
    addon_name: &str,
    permissions: &[HubPermissionConfig],
) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for permission in permissions {
        let role_binding = match permission.r#type {
            HubPermissionType::CurrentCluster => {
                let Some(current) = &permission.current_cluster else {
                    continue;
                };
                binding(
                    binding_name(addon_name),
                    cluster,
                    addon_name,
                    cluster,
                    RoleRef {
                        api_group: "rbac.authorization.k8s.io".into(),
                        kind: "ClusterRole".into(),
                        name: current.cluster_role_name.clone(),
                    },
                )
            }
            HubPermissionType::SingleNamespace => {
                let Some(single) = &permission.single_namespace else {
                    continue;
                };
                // one binding per cluster so removals stay independent
                binding(
                    format!("{}:{cluster}", binding_name(addon_name)),
                    &single.namespace,
                    addon_name,
                    cluster,
                    single.role_ref.clone(),
                )
            }
        };

        let namespace = role_binding.metadata.namespace.as_deref().unwrap_or_default();
        let name = role_binding.metadata.name.as_deref().unwrap_or_default();
        debug!(%namespace, %name, "Applying hub permission binding");
        let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
        api.patch(name, &params, &Patch::Apply(&role_binding))
            .await?;
    }
    Ok(())
}
