use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on PlacementDecisions naming their owning Placement.
pub static PLACEMENT_LABEL: &str = "cluster.open-cluster-management.io/placement";

pub static CONDITION_MANAGED_CLUSTER_AVAILABLE: &str = "ManagedClusterConditionAvailable";

/// ManagedCluster is the hub-side record of a member cluster. We only consume
/// it: its namespace is the delivery namespace for works, its annotations can
/// carry image-registry mirrors, and its availability gates health synthesis.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ManagedCluster",
    group = "cluster.open-cluster-management.io",
    version = "v1",
    printcolumn = r#"{"name":"Accepted", "type":"string", "jsonPath":".spec.hubAcceptsClient"}"#,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ManagedClusterConditionAvailable\")].status"}"#
)]
#[kube(status = "ManagedClusterStatus", shortname = "mcl", derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_accepts_client: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ManagedClusterStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<ManagedClusterVersion>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ManagedClusterVersion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<String>,
}

impl ManagedCluster {
    /// True/False from the availability condition; None when unset or Unknown.
    pub fn available(&self) -> Option<bool> {
        let condition = self
            .status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == CONDITION_MANAGED_CLUSTER_AVAILABLE)?;
        match condition.status.as_str() {
            "True" => Some(true),
            "False" => Some(false),
            _ => None,
        }
    }
}

/// Placement selects a set of clusters; we only react to its decisions.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Placement",
    group = "cluster.open-cluster-management.io",
    version = "v1beta1",
    namespaced
)]
#[kube(status = "PlacementStatus")]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_clusters: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_selected_clusters: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// PlacementDecision carries a slice of the clusters selected by a Placement.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "PlacementDecision",
    group = "cluster.open-cluster-management.io",
    version = "v1beta1",
    namespaced
)]
#[kube(status = "PlacementDecisionStatus")]
pub struct PlacementDecisionSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PlacementDecisionStatus {
    pub decisions: Vec<ClusterDecision>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDecision {
    pub cluster_name: String,
    #[serde(default)]
    pub reason: String,
}
