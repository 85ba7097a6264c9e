use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace the agent is installed into when the spec leaves it empty.
pub static DEFAULT_INSTALL_NAMESPACE: &str = "open-cluster-management-agent-addon";

// Well-known annotations on the add-on instance and on rendered objects.
pub static DEPLOY_MODE_ANNOTATION: &str = "addon.open-cluster-management.io/agent-deploy-mode";
pub static HOSTING_CLUSTER_ANNOTATION: &str =
    "addon.open-cluster-management.io/hosting-cluster-name";
pub static MANIFEST_LOCATION_ANNOTATION: &str =
    "addon.open-cluster-management.io/hosted-manifest-location";
pub static PRE_DELETE_ANNOTATION: &str = "addon.open-cluster-management.io/addon-pre-delete";
pub static DELETION_ORPHAN_ANNOTATION: &str = "addon.open-cluster-management.io/deletion-orphan";
pub static IMAGE_REGISTRIES_ANNOTATION: &str =
    "addon.open-cluster-management.io/image-registries";
pub static VALUES_ANNOTATION: &str = "addon.open-cluster-management.io/values";
pub static LIFECYCLE_ANNOTATION: &str = "addon.open-cluster-management.io/lifecycle";
pub static SERVER_SIDE_APPLY_ANNOTATION: &str =
    "addon.open-cluster-management.io/server-side-apply";

pub static LIFECYCLE_SELF_MANAGED: &str = "self";
pub static LIFECYCLE_ADDON_MANAGER: &str = "addon-manager";

// Finalizers held on the instance. The legacy cluster.open-cluster-management.io
// names are recognized on read and rewritten to the current ones.
pub static PRE_DELETE_HOOK_FINALIZER: &str =
    "addon.open-cluster-management.io/addon-pre-delete";
pub static LEGACY_PRE_DELETE_HOOK_FINALIZER: &str =
    "cluster.open-cluster-management.io/addon-pre-delete";
pub static HOSTING_PRE_DELETE_HOOK_FINALIZER: &str =
    "addon.open-cluster-management.io/hosting-addon-pre-delete";
pub static HOSTING_MANIFESTS_CLEANUP_FINALIZER: &str =
    "addon.open-cluster-management.io/hosting-manifests-cleanup";
pub static LEGACY_HOSTING_MANIFESTS_CLEANUP_FINALIZER: &str =
    "cluster.open-cluster-management.io/hosting-manifests-cleanup";

// Condition types.
pub static CONDITION_MANIFEST_APPLIED: &str = "ManifestApplied";
pub static CONDITION_AVAILABLE: &str = "Available";
pub static CONDITION_PROGRESSING: &str = "Progressing";
pub static CONDITION_HOSTING_CLUSTER_VALIDITY: &str = "HostingClusterValidity";
pub static CONDITION_HOSTING_MANIFEST_APPLIED: &str = "HostingManifestApplied";
pub static CONDITION_HOOK_MANIFEST_COMPLETED: &str = "HookManifestCompleted";
pub static CONDITION_CONFIGURED: &str = "Configured";

// Condition reasons.
pub static REASON_MANIFEST_APPLIED: &str = "AddonManifestApplied";
pub static REASON_MANIFESTS_APPLY_FAILED: &str = "ManifestsApplyFailed";
pub static REASON_PROBE_AVAILABLE: &str = "ProbeAvailable";
pub static REASON_PROBE_UNAVAILABLE: &str = "ProbeUnavailable";
pub static REASON_WORK_NOT_FOUND: &str = "WorkNotFound";
pub static REASON_WORK_NOT_APPLY: &str = "WorkNotApply";
pub static REASON_NO_PROBE_RESULT: &str = "NoProbeResult";
pub static REASON_CONFIGURATIONS_CONFIGURED: &str = "ConfigurationsConfigured";
pub static REASON_CONFIGURATION_WRONG: &str = "ConfigurationWrong";
pub static REASON_INSTALLING: &str = "Installing";
pub static REASON_INSTALL_SUCCEED: &str = "InstallSucceed";
pub static REASON_UPGRADING: &str = "Upgrading";
pub static REASON_UPGRADE_SUCCEED: &str = "UpgradeSucceed";
pub static REASON_CONFIGURATION_UNSUPPORTED: &str = "ConfigurationUnsupported";
pub static REASON_HOSTING_CLUSTER_VALID: &str = "HostingClusterValid";
pub static REASON_HOSTING_CLUSTER_INVALID: &str = "HostingClusterInvalid";
pub static REASON_HOOK_COMPLETED: &str = "HookManifestIsCompleted";
pub static REASON_HOOK_NOT_COMPLETED: &str = "HookManifestIsNotCompleted";

pub static MESSAGE_NO_MANIFEST: &str = "no manifest need to apply";

/// ManagedClusterAddOn declares the intent to install one add-on on one managed
/// cluster. It lives in the cluster namespace and its name is the add-on name.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ManagedClusterAddOn",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Degraded", "priority": 1, "type":"string", "jsonPath":".status.conditions[?(@.type==\"Degraded\")].status"}"#,
    printcolumn = r#"{"name":"Progressing", "priority": 1, "type":"string", "jsonPath":".status.conditions[?(@.type==\"Progressing\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ManagedClusterAddOnStatus", shortname = "mca")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    /// Namespace on the managed cluster to install the add-on agent into.
    /// Defaults to open-cluster-management-agent-addon.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_namespace: String,

    /// Per-instance configuration overrides; later entries win for the same
    /// group/resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configs: Option<Vec<AddOnConfig>>,
}

/// Reference to a configuration object for the add-on.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct AddOnConfig {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// The namespace the agent manifests are deployed into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Resolved configuration references with their spec hashes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_references: Option<Vec<ConfigReference>>,

    /// Configuration kinds the add-on supports, mirrored from the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_configs: Option<Vec<ConfigGroupResource>>,

    /// Registration requirements published for the member agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrations: Option<Vec<RegistrationConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigGroupResource {
    #[serde(default)]
    pub group: String,
    pub resource: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReference {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,

    /// The configuration the operator wants applied, hashed over its spec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config: Option<ConfigSpecHash>,

    /// The configuration in the last successfully applied deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_config: Option<ConfigSpecHash>,

    /// The configuration of the last deployment that probed healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_good_config: Option<ConfigSpecHash>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpecHash {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub spec_hash: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConfig {
    /// Signer the agent should request a certificate from.
    pub signer_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<RegistrationSubject>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSubject {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization_units: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct HealthCheck {
    pub mode: HealthCheckMode,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum HealthCheckMode {
    /// The member agent maintains a lease; an external controller derives Available.
    Lease,
    /// Available is derived from work status feedback.
    WorkFeedback,
    /// The add-on reports its own availability.
    #[default]
    Customized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeployMode {
    #[default]
    Default,
    Hosted,
}

impl ManagedClusterAddOn {
    /// The managed cluster this instance targets (its namespace).
    pub fn cluster_name(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn deploy_mode(&self) -> DeployMode {
        match self.annotations().get(DEPLOY_MODE_ANNOTATION).map(|s| s.as_str()) {
            Some("Hosted") => DeployMode::Hosted,
            _ => DeployMode::Default,
        }
    }

    /// The hosting cluster name, when hosted mode is requested.
    pub fn hosting_cluster(&self) -> Option<&str> {
        if self.deploy_mode() != DeployMode::Hosted {
            return None;
        }
        self.annotations()
            .get(HOSTING_CLUSTER_ANNOTATION)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn install_namespace(&self) -> &str {
        if self.spec.install_namespace.is_empty() {
            DEFAULT_INSTALL_NAMESPACE
        } else {
            &self.spec.install_namespace
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == condition_type)
    }

    pub fn condition_is_true(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .map(|c| c.status == "True")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addon_with_annotations(pairs: &[(&str, &str)]) -> ManagedClusterAddOn {
        let mut addon = ManagedClusterAddOn::new("test", ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some("c1".into());
        addon.metadata.annotations = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        addon
    }

    #[test]
    fn deploy_mode_defaults_when_annotation_missing_or_unknown() {
        assert_eq!(addon_with_annotations(&[]).deploy_mode(), DeployMode::Default);
        assert_eq!(
            addon_with_annotations(&[(DEPLOY_MODE_ANNOTATION, "Hosted")]).deploy_mode(),
            DeployMode::Hosted
        );
        assert_eq!(
            addon_with_annotations(&[(DEPLOY_MODE_ANNOTATION, "hosted")]).deploy_mode(),
            DeployMode::Default
        );
    }

    #[test]
    fn hosting_cluster_requires_hosted_mode() {
        let addon = addon_with_annotations(&[(HOSTING_CLUSTER_ANNOTATION, "h1")]);
        assert_eq!(addon.hosting_cluster(), None);

        let addon = addon_with_annotations(&[
            (DEPLOY_MODE_ANNOTATION, "Hosted"),
            (HOSTING_CLUSTER_ANNOTATION, "h1"),
        ]);
        assert_eq!(addon.hosting_cluster(), Some("h1"));
    }

    #[test]
    fn install_namespace_defaults() {
        let addon = addon_with_annotations(&[]);
        assert_eq!(addon.install_namespace(), DEFAULT_INSTALL_NAMESPACE);

        let mut addon = addon;
        addon.spec.install_namespace = "default".into();
        assert_eq!(addon.install_namespace(), "default");
    }
}
