use k8s_openapi::api::rbac::v1::RoleRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::managedclusteraddons::RegistrationSubject;
use super::manifestworks::ManifestsTemplate;

/// AddOnTemplate carries the agent workload of a template-based add-on as raw
/// manifests with `{{VARIABLE}}` placeholders, plus the registration the agent
/// should perform. A descriptor opts in by listing addontemplates among its
/// supported configs.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "AddOnTemplate",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Addon name", "type":"string", "jsonPath":".spec.addonName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddOnTemplateSpec {
    pub addon_name: String,

    pub agent_spec: AgentSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<Vec<TemplateRegistration>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct AgentSpec {
    pub workload: ManifestsTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRegistration {
    pub r#type: TemplateRegistrationType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_client: Option<KubeClientRegistration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_signer: Option<CustomSignerRegistration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TemplateRegistrationType {
    /// Register with the hub kube-apiserver client signer.
    #[default]
    KubeClient,
    /// Register against an add-on specific signer.
    CustomSigner,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeClientRegistration {
    /// Permissions bound to the agent identity on the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_permissions: Option<Vec<HubPermissionConfig>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubPermissionConfig {
    pub r#type: HubPermissionType,

    /// ClusterRole bound in the cluster namespace when type is CurrentCluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cluster: Option<CurrentClusterBinding>,

    /// Role binding in one fixed namespace when type is SingleNamespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_namespace: Option<SingleNamespaceBinding>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum HubPermissionType {
    #[default]
    CurrentCluster,
    SingleNamespace,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CurrentClusterBinding {
    pub cluster_role_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SingleNamespaceBinding {
    pub namespace: String,
    pub role_ref: RoleRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomSignerRegistration {
    pub signer_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<RegistrationSubject>,

    /// Secret holding the signing key pair for this signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_ca: Option<SigningCaRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct SigningCaRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl AddOnTemplate {
    /// Deterministic hash of the template spec; children of the template
    /// manager are keyed by it.
    pub fn spec_hash(&self) -> String {
        // serde_json maps are sorted, so the serialization is canonical
        let raw = serde_json::to_vec(&self.spec).expect("AddOnTemplateSpec to serialize");
        let digest = Sha256::digest(&raw);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::manifestworks::Manifest;

    #[test]
    fn spec_hash_changes_with_workload() {
        let mut template = AddOnTemplate::new("hello", AddOnTemplateSpec::default());
        let base = template.spec_hash();
        assert_eq!(base, template.spec_hash(), "hash is stable");

        template.spec.agent_spec.workload.manifests =
            vec![Manifest(serde_json::json!({"kind": "ConfigMap"}))];
        assert_ne!(base, template.spec_hash());
    }
}
