use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Label carried by every work created for an add-on.
pub static ADDON_NAME_LABEL: &str = "open-cluster-management.io/addon-name";
/// Label identifying the add-on namespace for works that live outside it (hosted mode).
pub static ADDON_NAMESPACE_LABEL: &str = "open-cluster-management.io/addon-namespace";
/// Annotation carrying the JSON map of referenced config identities to their spec hashes.
pub static CONFIG_SPEC_HASH_ANNOTATION: &str =
    "addon.open-cluster-management.io/config-spec-hash";

pub static WORK_CONDITION_APPLIED: &str = "Applied";
pub static WORK_CONDITION_AVAILABLE: &str = "Available";

/// ManifestWork is the delivery envelope: an ordered list of raw manifests to be
/// applied on the cluster owning the namespace, plus per-manifest probe rules and
/// delete options. Its status mirrors apply/availability state and probe feedback
/// reported by the member agent.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "ManifestWork",
    group = "work.open-cluster-management.io",
    version = "v1",
    namespaced,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ManifestWorkStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    /// The resources to be delivered to the target cluster.
    pub workload: ManifestsTemplate,

    /// Per-manifest feedback rules and update strategies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_configs: Option<Vec<ManifestConfigOption>>,

    /// How resources are handled when the work is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_option: Option<DeleteOption>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ManifestsTemplate {
    pub manifests: Vec<Manifest>,
}

/// A single raw object manifest. The contents are passed through unvalidated.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Manifest(#[schemars(schema_with = "raw_object_schema")] pub serde_json::Value);

fn raw_object_schema(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
        "x-kubernetes-embedded-resource": true,
    }))
    .unwrap()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfigOption {
    pub resource_identifier: ResourceIdentifier,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_rules: Option<Vec<FeedbackRule>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

/// Identifies a single manifest within a work by group/resource/namespace/name.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ResourceIdentifier {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRule {
    pub r#type: FeedbackRuleType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_paths: Option<Vec<JsonPath>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum FeedbackRuleType {
    /// Probe the well-known status fields of the resource kind (Deployments, Jobs, ...).
    #[default]
    WellKnownStatus,
    /// Probe explicit JSON paths.
    #[serde(rename = "JSONPaths")]
    JsonPaths,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct JsonPath {
    /// Name of the returned feedback value.
    pub name: String,
    /// Optional resource version constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// A JSON path that leads to an integer, string or boolean field.
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    pub r#type: UpdateStrategyType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_side_apply: Option<ServerSideApplyConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategyType {
    #[default]
    Update,
    CreateOnly,
    ServerSideApply,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSideApplyConfig {
    #[serde(default)]
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_manager: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOption {
    pub propagation_policy: PropagationPolicy,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub selectively_orphan: Option<SelectivelyOrphan>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Delete all applied resources with the work.
    #[default]
    Foreground,
    /// Leave every applied resource in place.
    Orphan,
    /// Leave only the resources picked by orphaningRules in place.
    SelectivelyOrphan,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectivelyOrphan {
    pub orphaning_rules: Vec<OrphaningRule>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct OrphaningRule {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_status: Option<ManifestResourceStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ManifestResourceStatus {
    pub manifests: Vec<ManifestCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCondition {
    pub resource_meta: ManifestResourceMeta,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_feedbacks: Option<StatusFeedbackResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResourceMeta {
    #[serde(default)]
    pub ordinal: i32,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct StatusFeedbackResult {
    pub values: Vec<FeedbackValue>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValue {
    pub name: String,
    pub field_value: FieldValue,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    pub r#type: ValueType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub integer: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_raw: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ValueType {
    #[default]
    Integer,
    String,
    Boolean,
    JsonRaw,
}

impl FieldValue {
    pub fn integer(value: i64) -> Self {
        FieldValue {
            r#type: ValueType::Integer,
            integer: Some(value),
            ..Default::default()
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        FieldValue {
            r#type: ValueType::String,
            string: Some(value.into()),
            ..Default::default()
        }
    }
}

impl ManifestWork {
    fn condition_status(&self, condition_type: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == condition_type)
            .map(|c| c.status.as_str())
    }

    /// Whether the member agent reported the workload as applied.
    pub fn applied(&self) -> Option<bool> {
        self.condition_status(WORK_CONDITION_APPLIED)
            .map(|s| s == "True")
    }

    /// Whether the member agent reported the workload as available.
    pub fn available(&self) -> Option<bool> {
        self.condition_status(WORK_CONDITION_AVAILABLE)
            .map(|s| s == "True")
    }

    /// Probe results per manifest, in workload order.
    pub fn probe_results(&self) -> Vec<(&ManifestResourceMeta, &[FeedbackValue])> {
        let Some(resource_status) = self.status.as_ref().and_then(|s| s.resource_status.as_ref())
        else {
            return Vec::new();
        };
        resource_status
            .manifests
            .iter()
            .map(|m| {
                (
                    &m.resource_meta,
                    m.status_feedbacks
                        .as_ref()
                        .map(|f| f.values.as_slice())
                        .unwrap_or(&[]),
                )
            })
            .collect()
    }

    /// Feedback values for one manifest, identified by group/resource/namespace/name.
    pub fn feedback_values_for(&self, id: &ResourceIdentifier) -> Option<&[FeedbackValue]> {
        self.probe_results()
            .into_iter()
            .find(|(meta, _)| {
                meta.group == id.group
                    && meta.resource == id.resource
                    && meta.namespace == id.namespace
                    && meta.name == id.name
            })
            .map(|(_, values)| values)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn work_with_conditions(conditions: Vec<Condition>) -> ManifestWork {
        let mut work = ManifestWork::new("addon-test-deploy-0", ManifestWorkSpec::default());
        work.status = Some(ManifestWorkStatus {
            conditions: Some(conditions),
            resource_status: None,
        });
        work
    }

    fn condition(type_: &str, status: &str) -> Condition {
        Condition {
            type_: type_.into(),
            status: status.into(),
            reason: "Test".into(),
            message: String::new(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation: None,
        }
    }

    #[test]
    fn applied_and_available_follow_conditions() {
        let work = work_with_conditions(vec![
            condition(WORK_CONDITION_APPLIED, "True"),
            condition(WORK_CONDITION_AVAILABLE, "False"),
        ]);
        assert_eq!(work.applied(), Some(true));
        assert_eq!(work.available(), Some(false));

        let work = work_with_conditions(vec![]);
        assert_eq!(work.applied(), None);
    }

    #[test]
    fn feedback_lookup_matches_resource_identity() {
        let mut work = work_with_conditions(vec![]);
        work.status.as_mut().unwrap().resource_status = Some(ManifestResourceStatus {
            manifests: vec![ManifestCondition {
                resource_meta: ManifestResourceMeta {
                    group: "apps".into(),
                    resource: "deployments".into(),
                    name: "nginx".into(),
                    namespace: "default".into(),
                    ..Default::default()
                },
                status_feedbacks: Some(StatusFeedbackResult {
                    values: vec![FeedbackValue {
                        name: "ReadyReplicas".into(),
                        field_value: FieldValue::integer(1),
                    }],
                }),
                conditions: None,
            }],
        });

        let id = ResourceIdentifier {
            group: "apps".into(),
            resource: "deployments".into(),
            namespace: "default".into(),
            name: "nginx".into(),
        };
        let values = work.feedback_values_for(&id).unwrap();
        assert_eq!(values[0].field_value.integer, Some(1));

        let other = ResourceIdentifier {
            name: "other".into(),
            ..id
        };
        assert!(work.feedback_values_for(&other).is_none());
    }

    #[test]
    fn manifest_serializes_transparently() {
        let manifest = Manifest(serde_json::json!({"kind": "ConfigMap", "apiVersion": "v1"}));
        let raw = serde_json::to_string(&manifest).unwrap();
        assert_eq!(raw, r#"{"apiVersion":"v1","kind":"ConfigMap"}"#);
    }
}
