use std::collections::{BTreeMap, BTreeSet};

use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::*;

use crate::resources::managedclusteraddons::{
    DeployMode, ManagedClusterAddOn, DELETION_ORPHAN_ANNOTATION, MANIFEST_LOCATION_ANNOTATION,
};
use crate::resources::manifestworks::{
    DeleteOption, Manifest, ManifestConfigOption, ManifestWork, ManifestWorkSpec,
    ManifestsTemplate, OrphaningRule, PropagationPolicy, ResourceIdentifier, SelectivelyOrphan,
    ADDON_NAMESPACE_LABEL, ADDON_NAME_LABEL, CONFIG_SPEC_HASH_ANNOTATION,
};
use crate::resources::FIELD_MANAGER;
use crate::{Error, Result};

use super::hooks::is_hook_object;

/// Soft cap on the serialized workload of a single work; manifests beyond it
/// spill into the next indexed work.
pub const WORK_SIZE_LIMIT: usize = 500 * 1024;

pub fn deploy_work_name(addon_name: &str, index: usize) -> String {
    format!("addon-{addon_name}-deploy-{index}")
}

pub fn hosting_deploy_work_name(addon_name: &str, index: usize, cluster: &str) -> String {
    format!("addon-{addon_name}-deploy-{index}-hosting-{cluster}")
}

pub fn hook_work_name(addon_name: &str) -> String {
    format!("addon-{addon_name}-pre-delete")
}

pub fn hosting_hook_work_name(addon_name: &str, cluster: &str) -> String {
    format!("addon-{addon_name}-pre-delete-hosting-{cluster}")
}

/// Where a rendered object is delivered in hosted mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ManifestLocation {
    Managed,
    Hosting,
}

/// Read the location annotation of a rendered object. Outside hosted mode
/// everything is delivered to the managed cluster.
pub fn manifest_location(object: &Value, mode: DeployMode) -> Result<ManifestLocation> {
    if mode != DeployMode::Hosted {
        return Ok(ManifestLocation::Managed);
    }
    match object
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(MANIFEST_LOCATION_ANNOTATION))
        .and_then(Value::as_str)
    {
        None | Some("managed") => Ok(ManifestLocation::Managed),
        Some("hosting") => Ok(ManifestLocation::Hosting),
        Some(other) => Err(Error::UnsupportedManifestLocation(other.to_string())),
    }
}

/// Map a rendered object to its work resource identity. Only well-known kinds
/// are mapped; anything else gets no probe or hook treatment.
pub fn resource_identifier_for(object: &Value) -> Option<ResourceIdentifier> {
    let api_version = object.get("apiVersion")?.as_str()?;
    let kind = object.get("kind")?.as_str()?;
    let name = object.pointer("/metadata/name")?.as_str()?;
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    let resource = match kind {
        "Deployment" => "deployments",
        "DaemonSet" => "daemonsets",
        "StatefulSet" => "statefulsets",
        "Job" => "jobs",
        "Pod" => "pods",
        "Service" => "services",
        "ConfigMap" => "configmaps",
        "Secret" => "secrets",
        "ServiceAccount" => "serviceaccounts",
        "Namespace" => "namespaces",
        "Role" => "roles",
        "RoleBinding" => "rolebindings",
        "ClusterRole" => "clusterroles",
        "ClusterRoleBinding" => "clusterrolebindings",
        "CustomResourceDefinition" => "customresourcedefinitions",
        _ => return None,
    };

    Some(ResourceIdentifier {
        group: group.to_string(),
        resource: resource.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

/// Rendered objects split by destination, with pre-delete hooks separated out.
#[derive(Debug, Default)]
pub struct SplitObjects {
    pub managed: Vec<Value>,
    pub hosting: Vec<Value>,
    pub managed_hooks: Vec<Value>,
    pub hosting_hooks: Vec<Value>,
}

fn orphan_annotated(object: &Value) -> bool {
    object
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(DELETION_ORPHAN_ANNOTATION))
        .is_some()
}

/// Delete option for one work: objects annotated orphan-on-delete become
/// selectively-orphan rules, everything else is still deleted with the work.
fn delete_option(manifests: &[Manifest]) -> Option<DeleteOption> {
    let rules: Vec<OrphaningRule> = manifests
        .iter()
        .filter(|m| orphan_annotated(&m.0))
        .filter_map(|m| resource_identifier_for(&m.0))
        .map(|id| OrphaningRule {
            group: id.group,
            resource: id.resource,
            namespace: id.namespace,
            name: id.name,
        })
        .collect();
    (!rules.is_empty()).then(|| DeleteOption {
        propagation_policy: PropagationPolicy::SelectivelyOrphan,
        selectively_orphan: Some(SelectivelyOrphan {
            orphaning_rules: rules,
        }),
    })
}

pub fn split_objects(objects: Vec<Value>, mode: DeployMode) -> Result<SplitObjects> {
    let mut split = SplitObjects::default();
    for object in objects {
        let location = manifest_location(&object, mode)?;
        let hook = is_hook_object(&object);
        match (location, hook) {
            (ManifestLocation::Managed, false) => split.managed.push(object),
            (ManifestLocation::Managed, true) => split.managed_hooks.push(object),
            (ManifestLocation::Hosting, false) => split.hosting.push(object),
            (ManifestLocation::Hosting, true) => split.hosting_hooks.push(object),
        }
    }
    Ok(split)
}

/// Everything needed to stamp out the works of one reconcile pass.
pub struct WorkBuilder<'a> {
    pub addon: &'a ManagedClusterAddOn,
    /// JSON map stored in the config-spec-hash annotation.
    pub config_hashes: &'a BTreeMap<String, String>,
    /// Probe and update-strategy rules attached to deploy works.
    pub manifest_configs: Vec<ManifestConfigOption>,
}

impl WorkBuilder<'_> {
    fn addon_name(&self) -> &str {
        self.addon.metadata.name.as_deref().unwrap_or_default()
    }

    fn base_metadata(&self, name: String, namespace: &str, hosting: bool) -> ObjectMeta {
        let mut labels = BTreeMap::from([(
            ADDON_NAME_LABEL.to_string(),
            self.addon_name().to_string(),
        )]);
        if hosting {
            // points back at the add-on namespace from the hosting namespace
            labels.insert(
                ADDON_NAMESPACE_LABEL.to_string(),
                self.addon.cluster_name().to_string(),
            );
        }

        let mut annotations = BTreeMap::new();
        if !self.config_hashes.is_empty() {
            if let Ok(raw) = serde_json::to_string(self.config_hashes) {
                annotations.insert(CONFIG_SPEC_HASH_ANNOTATION.to_string(), raw);
            }
        }

        ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            // cross-namespace hosting works cannot reference the instance
            owner_references: (!hosting)
                .then(|| self.addon.controller_owner_ref(&()))
                .flatten()
                .map(|r| vec![r]),
            ..Default::default()
        }
    }

    /// Chunk objects into indexed deploy works for one destination namespace.
    pub fn deploy_works(
        &self,
        objects: &[Value],
        namespace: &str,
        hosting: bool,
    ) -> Result<Vec<ManifestWork>> {
        let mut chunks: Vec<Vec<Manifest>> = Vec::new();
        let mut current: Vec<Manifest> = Vec::new();
        let mut current_size = 0usize;

        for object in objects {
            let size = serde_json::to_vec(object)?.len();
            if !current.is_empty() && current_size + size > WORK_SIZE_LIMIT {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current.push(Manifest(object.clone()));
            current_size += size;
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let addon_name = self.addon_name();
        let works = chunks
            .into_iter()
            .enumerate()
            .map(|(index, manifests)| {
                let name = if hosting {
                    hosting_deploy_work_name(addon_name, index, self.addon.cluster_name())
                } else {
                    deploy_work_name(addon_name, index)
                };
                let delete_option = delete_option(&manifests);
                ManifestWork {
                    metadata: self.base_metadata(name, namespace, hosting),
                    spec: ManifestWorkSpec {
                        workload: ManifestsTemplate { manifests },
                        manifest_configs: (!self.manifest_configs.is_empty())
                            .then(|| self.manifest_configs.clone()),
                        delete_option,
                    },
                    status: None,
                }
            })
            .collect();
        Ok(works)
    }

    /// A single hook work; hooks always live in one envelope so completion can
    /// be judged in one place.
    pub fn hook_work(
        &self,
        objects: &[Value],
        namespace: &str,
        hosting: bool,
    ) -> Option<ManifestWork> {
        if objects.is_empty() {
            return None;
        }
        let addon_name = self.addon_name();
        let name = if hosting {
            hosting_hook_work_name(addon_name, self.addon.cluster_name())
        } else {
            hook_work_name(addon_name)
        };

        let manifest_configs: Vec<ManifestConfigOption> = objects
            .iter()
            .filter_map(resource_identifier_for)
            .map(|resource_identifier| ManifestConfigOption {
                resource_identifier,
                feedback_rules: Some(vec![Default::default()]),
                update_strategy: None,
            })
            .collect();

        Some(ManifestWork {
            metadata: self.base_metadata(name, namespace, hosting),
            spec: ManifestWorkSpec {
                workload: ManifestsTemplate {
                    manifests: objects.iter().cloned().map(Manifest).collect(),
                },
                manifest_configs: (!manifest_configs.is_empty()).then_some(manifest_configs),
                // hook resources are left behind so their results stay readable
                delete_option: Some(DeleteOption {
                    propagation_policy: PropagationPolicy::Orphan,
                    selectively_orphan: None,
                }),
            },
            status: None,
        })
    }
}

fn work_needs_apply(existing: &ManifestWork, desired: &ManifestWork) -> bool {
    existing.spec != desired.spec
        || desired
            .metadata
            .labels
            .as_ref()
            .is_some_and(|l| Some(l) != existing.metadata.labels.as_ref())
        || desired.metadata.annotations != existing.metadata.annotations
        || desired.metadata.owner_references != existing.metadata.owner_references
}

/// Server-side apply one work, skipping the call when the existing work
/// already matches.
pub async fn apply_work(api: &Api<ManifestWork>, desired: &ManifestWork) -> Result<ManifestWork> {
    let name = desired.metadata.name.as_deref().unwrap_or_default();
    if let Some(existing) = api.get_opt(name).await? {
        if !work_needs_apply(&existing, desired) {
            return Ok(existing);
        }
    }

    debug!(
        work = %name,
        namespace = %desired.metadata.namespace.as_deref().unwrap_or_default(),
        "Applying manifest work"
    );
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let applied = api.patch(name, &params, &Patch::Apply(desired)).await?;
    Ok(applied)
}

/// Label selector for the works of one add-on in its cluster namespace.
pub fn deploy_work_selector(addon_name: &str) -> String {
    format!("{ADDON_NAME_LABEL}={addon_name}")
}

/// Label selector for the hosting-side works of one (cluster, add-on) pair.
pub fn hosting_work_selector(addon_name: &str, addon_namespace: &str) -> String {
    format!("{ADDON_NAME_LABEL}={addon_name},{ADDON_NAMESPACE_LABEL}={addon_namespace}")
}

/// Delete every work matching the selector that is not in `keep`.
pub async fn prune_works(
    api: &Api<ManifestWork>,
    selector: &str,
    keep: &BTreeSet<String>,
) -> Result<()> {
    let params = ListParams::default().labels(selector);
    for work in api.list(&params).await? {
        let name = work.name_any();
        if keep.contains(&name) {
            continue;
        }
        debug!(work = %name, "Pruning stale manifest work");
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => {}
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use crate::resources::managedclusteraddons::{
        ManagedClusterAddOnSpec, DEPLOY_MODE_ANNOTATION, HOSTING_CLUSTER_ANNOTATION,
        PRE_DELETE_ANNOTATION,
    };

    fn addon(name: &str, cluster: &str) -> ManagedClusterAddOn {
        let mut addon = ManagedClusterAddOn::new(name, ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some(cluster.into());
        addon
    }

    fn deployment(name: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "agent-ns"},
            "spec": {"replicas": 1}
        })
    }

    #[test]
    fn deploy_work_names_match_convention() {
        assert_eq!(deploy_work_name("test", 0), "addon-test-deploy-0");
        assert_eq!(
            hosting_deploy_work_name("test", 0, "c1"),
            "addon-test-deploy-0-hosting-c1"
        );
        assert_eq!(hook_work_name("test"), "addon-test-pre-delete");
        assert_eq!(
            hosting_hook_work_name("test", "c1"),
            "addon-test-pre-delete-hosting-c1"
        );
    }

    #[test]
    fn builder_produces_single_indexed_work() {
        let addon = addon("test", "c1");
        let hashes = BTreeMap::new();
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };

        let works = builder
            .deploy_works(&[deployment("agent")], "c1", false)
            .unwrap();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].spec.workload.manifests.len(), 1);
        assert_json_include!(
            actual: serde_json::to_value(&works[0]).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "addon-test-deploy-0",
                    "namespace": "c1",
                    "labels": {ADDON_NAME_LABEL: "test"}
                }
            })
        );
    }

    #[test]
    fn oversized_workloads_spill_into_next_index() {
        let addon = addon("test", "c1");
        let hashes = BTreeMap::new();
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };

        let big = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "big"},
            "data": {"blob": "x".repeat(WORK_SIZE_LIMIT)}
        });
        let works = builder
            .deploy_works(&[big.clone(), big], "c1", false)
            .unwrap();
        assert_eq!(works.len(), 2);
        assert_eq!(works[1].name_any(), "addon-test-deploy-1");
    }

    #[test]
    fn config_hashes_land_in_the_annotation() {
        let addon = addon("test", "c1");
        let hashes = BTreeMap::from([(
            "addondeploymentconfigs.addon.open-cluster-management.io/ns/cfg".to_string(),
            "abc123".to_string(),
        )]);
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };

        let works = builder
            .deploy_works(&[deployment("agent")], "c1", false)
            .unwrap();
        let annotation = &works[0].metadata.annotations.as_ref().unwrap()[CONFIG_SPEC_HASH_ANNOTATION];
        assert!(annotation.contains("abc123"));
    }

    #[test]
    fn orphan_annotated_objects_become_selectively_orphan_rules() {
        let addon = addon("test", "c1");
        let hashes = BTreeMap::new();
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };

        let orphaned = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "keep-me",
                "namespace": "agent-ns",
                "annotations": {DELETION_ORPHAN_ANNOTATION: ""}
            }
        });
        let works = builder
            .deploy_works(&[deployment("agent"), orphaned], "c1", false)
            .unwrap();
        let option = works[0]
            .spec
            .delete_option
            .as_ref()
            .expect("annotated object must produce a delete option");
        assert_eq!(option.propagation_policy, PropagationPolicy::SelectivelyOrphan);
        let rules = &option.selectively_orphan.as_ref().unwrap().orphaning_rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].resource, "configmaps");
        assert_eq!(rules[0].name, "keep-me");

        // no annotations, no delete option
        let works = builder
            .deploy_works(&[deployment("agent")], "c1", false)
            .unwrap();
        assert!(works[0].spec.delete_option.is_none());
    }

    #[test]
    fn deploy_works_are_owned_by_their_instance() {
        let mut addon = addon("test", "c1");
        addon.metadata.uid = Some("uid-1".into());
        let hashes = BTreeMap::new();
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };

        let works = builder
            .deploy_works(&[deployment("agent")], "c1", false)
            .unwrap();
        let owners = works[0].metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].uid, "uid-1");
        assert_eq!(owners[0].controller, Some(true));

        // hosting works live in another namespace and rely on the label pair
        let hosted = builder
            .deploy_works(&[deployment("agent")], "h1", true)
            .unwrap();
        assert!(hosted[0].metadata.owner_references.is_none());
    }

    #[test]
    fn hosted_split_honors_location_annotation() {
        let mut addon = addon("test", "c1");
        addon.metadata.annotations = Some(
            [
                (DEPLOY_MODE_ANNOTATION.to_string(), "Hosted".to_string()),
                (HOSTING_CLUSTER_ANNOTATION.to_string(), "h1".to_string()),
            ]
            .into(),
        );

        let hosting_object = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "agent",
                "annotations": {MANIFEST_LOCATION_ANNOTATION: "hosting"}
            }
        });
        let split = split_objects(
            vec![deployment("managed-side"), hosting_object],
            DeployMode::Hosted,
        )
        .unwrap();
        assert_eq!(split.managed.len(), 1);
        assert_eq!(split.hosting.len(), 1);

        let err = split_objects(
            vec![json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"annotations": {MANIFEST_LOCATION_ANNOTATION: "elsewhere"}}
            })],
            DeployMode::Hosted,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedManifestLocation(_)));
    }

    #[test]
    fn location_annotation_ignored_in_default_mode() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"annotations": {MANIFEST_LOCATION_ANNOTATION: "hosting"}}
        });
        let split = split_objects(vec![object], DeployMode::Default).unwrap();
        assert_eq!(split.managed.len(), 1);
        assert!(split.hosting.is_empty());
    }

    #[test]
    fn hook_objects_build_an_orphaned_work_with_probes() {
        let addon = addon("test", "c1");
        let hashes = BTreeMap::new();
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };

        let job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": "cleanup",
                "namespace": "agent-ns",
                "annotations": {PRE_DELETE_ANNOTATION: ""}
            }
        });
        let work = builder.hook_work(&[job], "c1", false).unwrap();
        assert_eq!(work.name_any(), "addon-test-pre-delete");
        assert_eq!(
            work.spec.delete_option.as_ref().unwrap().propagation_policy,
            PropagationPolicy::Orphan
        );
        let configs = work.spec.manifest_configs.as_ref().unwrap();
        assert_eq!(configs[0].resource_identifier.resource, "jobs");
        assert!(builder.hook_work(&[], "c1", false).is_none());
    }

    #[test]
    fn unchanged_works_are_detected() {
        let addon = addon("test", "c1");
        let hashes = BTreeMap::new();
        let builder = WorkBuilder {
            addon: &addon,
            config_hashes: &hashes,
            manifest_configs: Vec::new(),
        };
        let works = builder
            .deploy_works(&[deployment("agent")], "c1", false)
            .unwrap();

        assert!(!work_needs_apply(&works[0], &works[0]));

        let mut changed = works[0].clone();
        changed.spec.workload.manifests[0] = Manifest(json!({"kind": "ConfigMap"}));
        assert!(work_needs_apply(&works[0], &changed));
    }
}
