use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::managedclusteraddons::{
    AddOnConfig, ConfigSpecHash, LIFECYCLE_ADDON_MANAGER, LIFECYCLE_ANNOTATION,
};

/// ClusterManagementAddOn is the cluster-scoped descriptor of one add-on type:
/// the configuration kinds it supports, its defaults, and how it is installed
/// across clusters.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ClusterManagementAddOn",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Display name", "type":"string", "jsonPath":".spec.addOnMeta.displayName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ClusterManagementAddOnStatus", shortname = "cma")]
#[serde(rename_all = "camelCase")]
pub struct ClusterManagementAddOnSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_on_meta: Option<AddOnMeta>,

    /// Configuration kinds this add-on accepts, with optional defaults.
    /// Later entries win for the same group/resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_configs: Vec<ConfigMeta>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_strategy: Option<InstallStrategy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddOnMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMeta {
    #[serde(default)]
    pub group: String,
    pub resource: String,

    /// Default configuration applied to every instance unless overridden.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_config: Option<ConfigReferent>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ConfigReferent {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallStrategy {
    pub r#type: InstallStrategyType,

    /// Ordered placement references; instances are created for the union of
    /// their decisions, with per-placement config overrides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placements: Option<Vec<PlacementStrategy>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum InstallStrategyType {
    /// Instances are created externally, one cluster at a time.
    #[default]
    Manual,
    /// Instances are driven from placement decisions.
    Placements,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStrategy {
    pub name: String,
    pub namespace: String,

    /// Config overrides for clusters selected by this placement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configs: Option<Vec<AddOnConfig>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManagementAddOnStatus {
    /// Install/upgrade progression, one entry per placement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_progressions: Option<Vec<InstallProgression>>,

    /// Resolved defaults from supportedConfigs, with spec hashes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_config_references: Option<Vec<DefaultConfigReference>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgression {
    pub name: String,
    pub namespace: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_references: Option<Vec<InstallConfigReference>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfigReference {
    #[serde(default)]
    pub group: String,
    pub resource: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config: Option<ConfigSpecHash>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_config: Option<ConfigSpecHash>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_good_config: Option<ConfigSpecHash>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DefaultConfigReference {
    #[serde(default)]
    pub group: String,
    pub resource: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config: Option<ConfigSpecHash>,
}

impl ClusterManagementAddOn {
    /// Whether this operator owns the instance lifecycle for the add-on.
    pub fn manager_managed(&self) -> bool {
        self.annotations()
            .get(LIFECYCLE_ANNOTATION)
            .map(|v| v == LIFECYCLE_ADDON_MANAGER)
            .unwrap_or(false)
    }

    pub fn placement_strategies(&self) -> &[PlacementStrategy] {
        match self.spec.install_strategy.as_ref() {
            Some(strategy) if strategy.r#type == InstallStrategyType::Placements => {
                strategy.placements.as_deref().unwrap_or(&[])
            }
            _ => &[],
        }
    }
}
