use serde_json::Value;

use crate::resources::addondeploymentconfigs::{
    AddOnDeploymentConfig, ImageMirror, NodePlacement, ProxyConfig,
};
use crate::resources::clusters::ManagedCluster;
use crate::resources::managedclusteraddons::{
    DeployMode, ManagedClusterAddOn, IMAGE_REGISTRIES_ANNOTATION, VALUES_ANNOTATION,
};
use crate::{Error, Result};

/// Values are JSON objects; serde_json maps are sorted, which keeps every
/// projection of them deterministic.
pub type Values = serde_json::Map<String, Value>;

/// A value function contributes one layer of values for a (cluster, add-on)
/// pair. Later functions win on conflicts.
pub type ValuesFn =
    Box<dyn Fn(&ManagedCluster, &ManagedClusterAddOn) -> Result<Values> + Send + Sync>;

/// Keys with this prefix steer the packaging decorators and never reach the
/// rendered manifests.
pub static PRIVATE_VALUE_PREFIX: &str = "__";

pub static NODE_PLACEMENT_PRIVATE_VALUE: &str = "__NODE_PLACEMENT";
pub static REGISTRIES_PRIVATE_VALUE: &str = "__REGISTRIES";
pub static PROXY_CONFIG_PRIVATE_VALUE: &str = "__PROXY_CONFIG";

pub static INSTALL_MODE_DEFAULT: &str = "Default";
pub static INSTALL_MODE_HOSTED: &str = "Hosted";

/// Secret name the agent's external managed-cluster kubeconfig lives under in
/// hosted mode.
pub static EXTERNAL_MANAGED_KUBECONFIG_SECRET: &str = "external-managed-kubeconfig";

/// The merged result, split into what templates may see and what only the
/// packaging decorators consume.
#[derive(Debug, Clone, Default)]
pub struct RenderValues {
    pub public: Values,
    pub private: Values,
}

impl RenderValues {
    pub fn node_placement(&self) -> Option<NodePlacement> {
        self.private
            .get(NODE_PLACEMENT_PRIVATE_VALUE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn registries(&self) -> Option<Vec<ImageMirror>> {
        self.private
            .get(REGISTRIES_PRIVATE_VALUE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn proxy_config(&self) -> Option<ProxyConfig> {
        self.private
            .get(PROXY_CONFIG_PRIVATE_VALUE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Public values as sorted (name, value) string pairs, erroring on any
    /// non-string value. Template substitution uses this strict form.
    pub fn string_pairs(&self) -> Result<Vec<(String, String)>> {
        self.public
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                _ => Err(Error::NonStringValue(k.clone())),
            })
            .collect()
    }

    /// Public values stringified for env injection: strings verbatim, the
    /// rest as compact JSON.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.public
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }
}

/// Run the value pipeline for one (cluster, add-on) pair: built-in defaults,
/// then provider value functions in order, then resolved configuration
/// layers, then the values annotation, then the non-overridable built-ins.
pub fn build_values(
    cluster: &ManagedCluster,
    addon: &ManagedClusterAddOn,
    install_namespace: &str,
    value_fns: &[ValuesFn],
    config_values: &[Values],
) -> Result<RenderValues> {
    let mut merged = builtin_defaults();

    for value_fn in value_fns {
        merge_values(&mut merged, value_fn(cluster, addon)?);
    }
    for layer in config_values {
        merge_values(&mut merged, layer.clone());
    }

    if let Some(raw) = addon
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(VALUES_ANNOTATION))
    {
        let overrides: Values = serde_json::from_str(raw)?;
        merge_values(&mut merged, overrides);
    }

    merge_values(&mut merged, builtin_finals(cluster, addon, install_namespace));

    let mut public = Values::new();
    let mut private = Values::new();
    for (key, value) in merged {
        if key.starts_with(PRIVATE_VALUE_PREFIX) {
            private.insert(key, value);
        } else {
            public.insert(key, value);
        }
    }

    Ok(RenderValues { public, private })
}

fn builtin_defaults() -> Values {
    let mut values = Values::new();
    values.insert(
        "HubKubeConfigPath".into(),
        Value::String("/managed/hub-kubeconfig/kubeconfig".into()),
    );
    values.insert(
        "ManagedKubeConfigPath".into(),
        Value::String("/managed/config/kubeconfig".into()),
    );
    values
}

fn builtin_finals(
    cluster: &ManagedCluster,
    addon: &ManagedClusterAddOn,
    install_namespace: &str,
) -> Values {
    let addon_name = addon.metadata.name.as_deref().unwrap_or_default();
    let mode = match addon.deploy_mode() {
        DeployMode::Hosted => INSTALL_MODE_HOSTED,
        DeployMode::Default => INSTALL_MODE_DEFAULT,
    };

    let mut values = Values::new();
    values.insert(
        "ClusterName".into(),
        Value::String(cluster.metadata.name.clone().unwrap_or_default()),
    );
    values.insert(
        "AddonInstallNamespace".into(),
        Value::String(install_namespace.into()),
    );
    values.insert(
        "HubKubeConfigSecret".into(),
        Value::String(format!("{addon_name}-hub-kubeconfig")),
    );
    values.insert(
        "ExternalManagedConfigSecret".into(),
        Value::String(EXTERNAL_MANAGED_KUBECONFIG_SECRET.into()),
    );
    values.insert("InstallMode".into(), Value::String(mode.into()));
    values
}

/// Recursive merge: objects merge key-wise, everything else (scalars and
/// arrays) is replaced wholesale.
pub fn merge_values(base: &mut Values, overrides: Values) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_values(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Rewrite an image reference through mirror rules; the first matching rule
/// wins. An empty source matches any registry and replaces everything before
/// the image name.
pub fn override_image(registries: &[ImageMirror], image: &str) -> String {
    for rule in registries {
        let source = rule.source.trim_end_matches('/');
        let mirror = rule.mirror.trim_end_matches('/');

        if source.is_empty() {
            let name = image.rsplit('/').next().unwrap_or(image);
            return format!("{mirror}/{name}");
        }
        if image == source {
            return mirror.to_string();
        }
        if let Some(rest) = image.strip_prefix(source) {
            if rest.starts_with('/') || rest.starts_with(':') || rest.starts_with('@') {
                return format!("{mirror}{rest}");
            }
        }
    }
    image.to_string()
}

/// Build a nested object from a dotted key, e.g. `global.imageOverrides.agent`
/// becomes `{"global": {"imageOverrides": {"agent": <value>}}}`.
pub fn nested_value(key: &str, value: Value) -> Values {
    let mut current = value;
    for part in key.rsplit('.') {
        let mut wrapper = Values::new();
        wrapper.insert(part.into(), current);
        current = Value::Object(wrapper);
    }
    match current {
        Value::Object(map) => map,
        // unreachable: rsplit yields at least one part
        _ => Values::new(),
    }
}

/// Value function source: one resolved AddOnDeploymentConfig.
pub fn deployment_config_values(config: &AddOnDeploymentConfig) -> Values {
    let mut values = Values::new();

    if let Some(variables) = &config.spec.customized_variables {
        for variable in variables {
            values.insert(variable.name.clone(), Value::String(variable.value.clone()));
        }
    }

    if let Some(node_placement) = &config.spec.node_placement {
        if let Ok(raw) = serde_json::to_value(node_placement) {
            values.insert(NODE_PLACEMENT_PRIVATE_VALUE.into(), raw);
        }
    }

    if let Some(registries) = &config.spec.registries {
        if let Ok(raw) = serde_json::to_value(registries) {
            values.insert(REGISTRIES_PRIVATE_VALUE.into(), raw);
        }
    }

    if let Some(proxy) = &config.spec.proxy_config {
        if let Ok(raw) = serde_json::to_value(proxy) {
            values.insert(PROXY_CONFIG_PRIVATE_VALUE.into(), raw);
        }
        let mut public_proxy = Values::new();
        if !proxy.http_proxy.is_empty() {
            public_proxy.insert("HTTP_PROXY".into(), Value::String(proxy.http_proxy.clone()));
        }
        if !proxy.https_proxy.is_empty() {
            public_proxy.insert(
                "HTTPS_PROXY".into(),
                Value::String(proxy.https_proxy.clone()),
            );
        }
        if !proxy.no_proxy.is_empty() {
            public_proxy.insert("NO_PROXY".into(), Value::String(proxy.no_proxy.clone()));
        }
        if !public_proxy.is_empty() {
            values.insert("ProxyConfig".into(), Value::Object(public_proxy));
        }
    }

    values
}

/// Value function source: the cluster's image-registries annotation, which
/// carries `{"registries": [{"source": ..., "mirror": ...}]}`.
pub fn cluster_image_registries_values(cluster: &ManagedCluster) -> Result<Values> {
    let mut values = Values::new();
    let Some(raw) = cluster
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(IMAGE_REGISTRIES_ANNOTATION))
    else {
        return Ok(values);
    };

    #[derive(serde::Deserialize)]
    struct RegistriesAnnotation {
        #[serde(default)]
        registries: Vec<ImageMirror>,
    }

    let parsed: RegistriesAnnotation = serde_json::from_str(raw)?;
    if !parsed.registries.is_empty() {
        values.insert(
            REGISTRIES_PRIVATE_VALUE.into(),
            serde_json::to_value(parsed.registries)?,
        );
    }
    Ok(values)
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;

    use crate::resources::managedclusteraddons::ManagedClusterAddOnSpec;

    fn cluster(name: &str) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    fn addon(name: &str, cluster: &str) -> ManagedClusterAddOn {
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(cluster.into()),
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec::default(),
            status: None,
        }
    }

    #[test]
    fn merge_is_recursive_and_arrays_replace() {
        let mut base = serde_json::from_value::<Values>(json!({
            "a": {"x": 1, "y": [1, 2]},
            "b": "keep",
        }))
        .unwrap();
        let overrides = serde_json::from_value::<Values>(json!({
            "a": {"y": [3], "z": true},
        }))
        .unwrap();

        merge_values(&mut base, overrides);
        assert_eq!(
            serde_json::Value::Object(base),
            json!({"a": {"x": 1, "y": [3], "z": true}, "b": "keep"})
        );
    }

    #[test]
    fn annotation_overrides_value_fns_but_not_finals() {
        let cluster = cluster("c1");
        let mut addon = addon("test", "c1");
        addon.metadata.annotations = Some(
            [(
                VALUES_ANNOTATION.to_string(),
                json!({"LogLevel": "debug", "ClusterName": "spoofed"}).to_string(),
            )]
            .into(),
        );

        let fns: Vec<ValuesFn> = vec![Box::new(|_, _| {
            let mut v = Values::new();
            v.insert("LogLevel".into(), Value::String("info".into()));
            Ok(v)
        })];

        let values = build_values(
            &cluster,
            &addon,
            "open-cluster-management-agent-addon",
            &fns,
            &[],
        )
        .unwrap();
        assert_eq!(values.public["LogLevel"], json!("debug"));
        assert_eq!(values.public["ClusterName"], json!("c1"));
        assert_eq!(
            values.public["AddonInstallNamespace"],
            json!("open-cluster-management-agent-addon")
        );
        assert_eq!(values.public["InstallMode"], json!("Default"));
        assert_eq!(
            values.public["ExternalManagedConfigSecret"],
            json!(EXTERNAL_MANAGED_KUBECONFIG_SECRET)
        );
    }

    #[test]
    fn private_values_are_split_out() {
        let cluster = cluster("c1");
        let addon = addon("test", "c1");
        let fns: Vec<ValuesFn> = vec![Box::new(|_, _| {
            let mut v = Values::new();
            v.insert(
                REGISTRIES_PRIVATE_VALUE.into(),
                json!([{"source": "quay.io", "mirror": "mirror.local"}]),
            );
            Ok(v)
        })];

        let values = build_values(&cluster, &addon, "ns", &fns, &[]).unwrap();
        assert!(!values.public.contains_key(REGISTRIES_PRIVATE_VALUE));
        let registries = values.registries().unwrap();
        assert_eq!(registries[0].mirror, "mirror.local");
    }

    #[test]
    fn image_override_rules() {
        let rules = vec![ImageMirror {
            source: "quay.io/open-cluster-management/".into(),
            mirror: "mirror.local/ocm".into(),
        }];
        assert_eq!(
            override_image(&rules, "quay.io/open-cluster-management/addon-agent:v1"),
            "mirror.local/ocm/addon-agent:v1"
        );
        // exact source match
        assert_eq!(
            override_image(&rules, "quay.io/open-cluster-management"),
            "mirror.local/ocm"
        );
        // prefix must end on a path boundary
        assert_eq!(
            override_image(
                &[ImageMirror {
                    source: "quay.io/open".into(),
                    mirror: "mirror.local".into()
                }],
                "quay.io/open-cluster-management/addon-agent:v1"
            ),
            "quay.io/open-cluster-management/addon-agent:v1"
        );
        // empty source matches any registry
        assert_eq!(
            override_image(
                &[ImageMirror {
                    source: String::new(),
                    mirror: "mirror.local/all".into()
                }],
                "quay.io/open-cluster-management/addon-agent:v1"
            ),
            "mirror.local/all/addon-agent:v1"
        );
        assert_eq!(override_image(&[], "busybox"), "busybox");
    }

    #[test]
    fn nested_value_builds_objects() {
        let values = nested_value("global.imageOverrides.agent", json!("img:v1"));
        assert_eq!(
            serde_json::Value::Object(values),
            json!({"global": {"imageOverrides": {"agent": "img:v1"}}})
        );
    }

    #[test]
    fn string_pairs_reject_non_strings() {
        let mut public = Values::new();
        public.insert("Numeric".into(), json!(3));
        let values = RenderValues {
            public,
            private: Values::new(),
        };
        assert!(matches!(
            values.string_pairs(),
            Err(Error::NonStringValue(_))
        ));
        assert_eq!(values.env_pairs(), vec![("Numeric".into(), "3".into())]);
    }

    #[test]
    fn deployment_config_values_split_public_and_private() {
        let config = AddOnDeploymentConfig::new(
            "cfg",
            serde_json::from_value(json!({
                "customizedVariables": [{"name": "LogLevel", "value": "debug"}],
                "registries": [{"source": "quay.io", "mirror": "mirror.local"}],
                "proxyConfig": {"httpProxy": "http://proxy:3128"}
            }))
            .unwrap(),
        );

        let values = deployment_config_values(&config);
        assert_eq!(values["LogLevel"], json!("debug"));
        assert!(values.contains_key(REGISTRIES_PRIVATE_VALUE));
        assert_eq!(
            values["ProxyConfig"],
            json!({"HTTP_PROXY": "http://proxy:3128"})
        );
    }
}
