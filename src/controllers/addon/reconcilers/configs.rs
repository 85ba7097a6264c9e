use std::collections::BTreeMap;

use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::*;

use crate::resources::clustermanagementaddons::ClusterManagementAddOn;
use crate::resources::managedclusteraddons::{
    AddOnConfig, ConfigGroupResource, ConfigReference, ConfigSpecHash, ManagedClusterAddOn,
    REASON_CONFIGURATION_UNSUPPORTED, REASON_CONFIGURATION_WRONG,
};
use crate::{Error, Result};

/// Hash of the part of a config object that affects rendering: its spec when
/// it has one, otherwise everything except metadata and status.
pub fn spec_hash(object: &Value) -> String {
    let hashed: Value = match object.get("spec") {
        Some(spec) => spec.clone(),
        None => {
            let mut trimmed = object.clone();
            if let Some(map) = trimmed.as_object_mut() {
                map.remove("metadata");
                map.remove("status");
            }
            trimmed
        }
    };
    // serde_json maps are sorted, so the serialization is canonical
    let raw = serde_json::to_vec(&hashed).unwrap_or_default();
    Sha256::digest(&raw)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Key under which a config's hash is recorded in the work annotation.
pub fn config_hash_key(reference: &ConfigReference) -> String {
    let group = if reference.group.is_empty() {
        "core".to_string()
    } else {
        reference.group.clone()
    };
    if reference.namespace.is_empty() {
        format!("{}.{}/{}", reference.resource, group, reference.name)
    } else {
        format!(
            "{}.{}/{}/{}",
            reference.resource, group, reference.namespace, reference.name
        )
    }
}

/// Merge descriptor defaults with instance overrides. Later layers win per
/// group/resource identity; instance entries win over descriptor defaults.
pub fn desired_configs(
    descriptor: Option<&ClusterManagementAddOn>,
    addon: &ManagedClusterAddOn,
) -> Vec<AddOnConfig> {
    let mut merged: BTreeMap<(String, String), AddOnConfig> = BTreeMap::new();

    if let Some(descriptor) = descriptor {
        for meta in &descriptor.spec.supported_configs {
            if let Some(default) = &meta.default_config {
                merged.insert(
                    (meta.group.clone(), meta.resource.clone()),
                    AddOnConfig {
                        group: meta.group.clone(),
                        resource: meta.resource.clone(),
                        namespace: default.namespace.clone(),
                        name: default.name.clone(),
                    },
                );
            }
        }
    }

    if let Some(configs) = &addon.spec.configs {
        for config in configs {
            merged.insert((config.group.clone(), config.resource.clone()), config.clone());
        }
    }

    merged.into_values().collect()
}

/// Reject configs the add-on does not declare support for.
pub fn check_supported(
    configs: &[AddOnConfig],
    supported: &[ConfigGroupResource],
) -> Result<()> {
    for config in configs {
        let ok = supported
            .iter()
            .any(|s| s.group == config.group && s.resource == config.resource);
        if !ok {
            return Err(Error::ConfigurationWrong {
                message: format!(
                    "the config {}/{} is not supported by the add-on",
                    config.group, config.resource
                ),
                reason: REASON_CONFIGURATION_UNSUPPORTED.into(),
            });
        }
    }
    Ok(())
}

fn missing_config_error(config: &AddOnConfig) -> Error {
    Error::ConfigurationWrong {
        message: format!(
            "the config {}/{} {}/{} does not exist",
            config.group, config.resource, config.namespace, config.name
        ),
        reason: REASON_CONFIGURATION_WRONG.into(),
    }
}

async fn api_resource_for(client: &Client, group: &str, resource: &str) -> Result<ApiResource> {
    let api_group = kube::discovery::group(client, group).await.map_err(|e| {
        Error::ConfigKindNotDiscovered {
            group: group.to_string(),
            resource: resource.to_string(),
            message: e.to_string(),
        }
    })?;
    api_group
        .recommended_resources()
        .into_iter()
        .map(|(ar, _)| ar)
        .find(|ar| ar.plural == resource)
        .ok_or_else(|| Error::ConfigKindNotDiscovered {
            group: group.to_string(),
            resource: resource.to_string(),
            message: "resource not served by the group".into(),
        })
}

/// Fetch every desired config and compute its spec hash, producing the
/// resolved references published to the instance status.
pub async fn resolve_config_references(
    client: &Client,
    configs: &[AddOnConfig],
    previous: Option<&[ConfigReference]>,
) -> Result<Vec<ConfigReference>> {
    let mut references = Vec::with_capacity(configs.len());

    for config in configs {
        let ar = api_resource_for(client, &config.group, &config.resource).await?;
        let api: Api<DynamicObject> = if config.namespace.is_empty() {
            Api::all_with(client.clone(), &ar)
        } else {
            Api::namespaced_with(client.clone(), &config.namespace, &ar)
        };

        let object = api
            .get_opt(&config.name)
            .await?
            .ok_or_else(|| missing_config_error(config))?;
        let raw = serde_json::to_value(&object)?;
        let hash = spec_hash(&raw);
        debug!(
            group = %config.group,
            resource = %config.resource,
            name = %config.name,
            hash = %hash,
            "Resolved add-on configuration"
        );

        // carry over apply progress tracked for the same identity
        let carried = previous.and_then(|refs| {
            refs.iter().find(|r| {
                r.group == config.group
                    && r.resource == config.resource
                    && r.namespace == config.namespace
                    && r.name == config.name
            })
        });

        references.push(ConfigReference {
            group: config.group.clone(),
            resource: config.resource.clone(),
            namespace: config.namespace.clone(),
            name: config.name.clone(),
            desired_config: Some(ConfigSpecHash {
                namespace: config.namespace.clone(),
                name: config.name.clone(),
                spec_hash: hash,
            }),
            last_applied_config: carried.and_then(|c| c.last_applied_config.clone()),
            last_known_good_config: carried.and_then(|c| c.last_known_good_config.clone()),
        });
    }

    Ok(references)
}

/// The annotation payload recorded on every work of this reconcile pass.
pub fn config_hash_map(references: &[ConfigReference]) -> BTreeMap<String, String> {
    references
        .iter()
        .filter_map(|r| {
            let hash = r.desired_config.as_ref()?.spec_hash.clone();
            Some((config_hash_key(r), hash))
        })
        .collect()
}

/// Whether every reference carries a resolved desired hash. Used by the
/// optional configuration gate before deploying.
pub fn configs_ready(references: &[ConfigReference]) -> bool {
    references.iter().all(|r| {
        r.desired_config
            .as_ref()
            .map(|d| !d.spec_hash.is_empty())
            .unwrap_or(false)
    })
}

/// Whether every desired config has been applied, judged from the references.
pub fn configs_applied(references: &[ConfigReference]) -> bool {
    references.iter().all(|r| {
        match (&r.desired_config, &r.last_applied_config) {
            (Some(desired), Some(applied)) => desired == applied,
            (None, _) => true,
            _ => false,
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    use crate::resources::clustermanagementaddons::{
        ClusterManagementAddOnSpec, ConfigMeta, ConfigReferent,
    };
    use crate::resources::managedclusteraddons::ManagedClusterAddOnSpec;

    #[test]
    fn spec_hash_ignores_metadata_and_status() {
        let a = json!({
            "metadata": {"name": "a", "resourceVersion": "1"},
            "spec": {"x": 1},
            "status": {"ready": true}
        });
        let b = json!({
            "metadata": {"name": "b", "resourceVersion": "99"},
            "spec": {"x": 1},
            "status": {"ready": false}
        });
        assert_eq!(spec_hash(&a), spec_hash(&b));

        let c = json!({"spec": {"x": 2}});
        assert_ne!(spec_hash(&a), spec_hash(&c));
    }

    #[test]
    fn instance_configs_override_descriptor_defaults() {
        let descriptor = ClusterManagementAddOn::new(
            "test",
            ClusterManagementAddOnSpec {
                supported_configs: vec![ConfigMeta {
                    group: "addon.open-cluster-management.io".into(),
                    resource: "addondeploymentconfigs".into(),
                    default_config: Some(ConfigReferent {
                        namespace: "defaults".into(),
                        name: "global".into(),
                    }),
                }],
                ..Default::default()
            },
        );

        let mut addon = ManagedClusterAddOn::new("test", ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some("c1".into());

        let configs = desired_configs(Some(&descriptor), &addon);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "global");

        addon.spec.configs = Some(vec![AddOnConfig {
            group: "addon.open-cluster-management.io".into(),
            resource: "addondeploymentconfigs".into(),
            namespace: "c1".into(),
            name: "mine".into(),
        }]);
        let configs = desired_configs(Some(&descriptor), &addon);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "mine");
    }

    #[test]
    fn unsupported_configs_are_rejected() {
        let configs = vec![AddOnConfig {
            group: "example.com".into(),
            resource: "widgets".into(),
            namespace: "ns".into(),
            name: "w".into(),
        }];
        let supported = vec![ConfigGroupResource {
            group: "addon.open-cluster-management.io".into(),
            resource: "addondeploymentconfigs".into(),
        }];
        let err = check_supported(&configs, &supported).unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigurationWrong { reason, .. } if reason == REASON_CONFIGURATION_UNSUPPORTED
        ));
    }

    #[test]
    fn hash_keys_are_stable() {
        let reference = ConfigReference {
            group: "addon.open-cluster-management.io".into(),
            resource: "addondeploymentconfigs".into(),
            namespace: "ns".into(),
            name: "cfg".into(),
            desired_config: Some(ConfigSpecHash {
                namespace: "ns".into(),
                name: "cfg".into(),
                spec_hash: "abc".into(),
            }),
            last_applied_config: None,
            last_known_good_config: None,
        };
        assert_eq!(
            config_hash_key(&reference),
            "addondeploymentconfigs.addon.open-cluster-management.io/ns/cfg"
        );
        let map = config_hash_map(&[reference]);
        assert_eq!(map.values().next().map(String::as_str), Some("abc"));
    }

    #[test]
    fn missing_configs_report_configuration_wrong() {
        let config = AddOnConfig {
            group: "addon.open-cluster-management.io".into(),
            resource: "addondeploymentconfigs".into(),
            namespace: "ns".into(),
            name: "gone".into(),
        };
        assert!(matches!(
            missing_config_error(&config),
            Error::ConfigurationWrong { reason, .. } if reason == REASON_CONFIGURATION_WRONG
        ));
    }

    #[test]
    fn configs_ready_requires_resolved_hashes() {
        let mut reference = ConfigReference {
            group: String::new(),
            resource: "configmaps".into(),
            namespace: "ns".into(),
            name: "cfg".into(),
            desired_config: None,
            last_applied_config: None,
            last_known_good_config: None,
        };
        assert!(!configs_ready(std::slice::from_ref(&reference)));

        reference.desired_config = Some(ConfigSpecHash {
            namespace: "ns".into(),
            name: "cfg".into(),
            spec_hash: "abc".into(),
        });
        assert!(configs_ready(std::slice::from_ref(&reference)));
        assert!(configs_ready(&[]));
    }

    #[test]
    fn configs_applied_compares_desired_and_applied() {
        let mut reference = ConfigReference {
            group: String::new(),
            resource: "configmaps".into(),
            namespace: "ns".into(),
            name: "cfg".into(),
            desired_config: Some(ConfigSpecHash {
                namespace: "ns".into(),
                name: "cfg".into(),
                spec_hash: "abc".into(),
            }),
            last_applied_config: None,
            last_known_good_config: None,
        };
        assert!(!configs_applied(std::slice::from_ref(&reference)));

        reference.last_applied_config = reference.desired_config.clone();
        assert!(configs_applied(&[reference]));
    }
}
