use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AddOnDeploymentConfig is a reusable set of deployment knobs an add-on
/// instance or descriptor can reference: template variables, scheduling
/// constraints, image mirrors and proxy settings.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "AddOnDeploymentConfig",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AddOnDeploymentConfigSpec {
    /// Name/value pairs handed to the renderer as public values, in order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customized_variables: Option<Vec<CustomizedVariable>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_placement: Option<NodePlacement>,

    /// Image mirror rules, applied in order; the first matching source wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registries: Option<Vec<ImageMirror>>,

    /// Overrides the instance's install namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_install_namespace: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct CustomizedVariable {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ImageMirror {
    /// Source registry prefix; empty means any registry.
    #[serde(default)]
    pub source: String,
    pub mirror: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub no_proxy: String,
    /// PEM CA bundle the agent should trust for the proxy, base64 encoded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_bundle: String,
}
