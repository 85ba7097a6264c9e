use serde_json::{json, Value};

use crate::agent::values::RenderValues;
use crate::agent::{signer_mount_path, signer_secret_name};
use crate::resources::addondeploymentconfigs::{ImageMirror, NodePlacement, ProxyConfig};
use crate::resources::managedclusteraddons::RegistrationConfig;
use crate::Result;

use crate::agent::values::override_image;

/// Kinds we never stamp a namespace onto.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "APIService",
    "PriorityClass",
    "StorageClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "ManagedCluster",
];

/// Decorations applied to rendered objects before packaging.
pub struct Decorations<'a> {
    pub addon_name: &'a str,
    pub install_namespace: &'a str,
    pub values: &'a RenderValues,
    /// Template-based add-ons additionally get public values injected as env
    /// vars and hub kubeconfig volumes mounted per registration.
    pub template_based: bool,
    pub registrations: &'a [RegistrationConfig],
}

pub fn decorate(objects: &mut [Value], d: &Decorations) -> Result<()> {
    for object in objects.iter_mut() {
        default_namespace(object, d.install_namespace);
    }

    let node_placement = d.values.node_placement();
    let registries = d.values.registries();
    let proxy = d.values.proxy_config();
    let env_pairs = d.template_based.then(|| d.values.env_pairs());

    for object in objects.iter_mut() {
        if let Some(registries) = &registries {
            override_images(object, registries);
        }
        let Some(pod_spec) = pod_spec_mut(object) else {
            continue;
        };
        if let Some(node_placement) = &node_placement {
            apply_node_placement(pod_spec, node_placement);
        }
        if let Some(proxy) = &proxy {
            inject_proxy_env(pod_spec, proxy);
        }
        if let Some(env_pairs) = &env_pairs {
            inject_env(pod_spec, env_pairs);
        }
        if d.template_based {
            mount_signer_secrets(pod_spec, d.addon_name, d.registrations);
        }
    }
    Ok(())
}

/// Stamp the install namespace onto namespace-scoped objects that carry none.
pub fn default_namespace(object: &mut Value, namespace: &str) {
    let Some(kind) = object.get("kind").and_then(Value::as_str) else {
        return;
    };
    if CLUSTER_SCOPED_KINDS.contains(&kind) {
        return;
    }
    let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let missing = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .map(str::is_empty)
        .unwrap_or(true);
    if missing {
        metadata.insert("namespace".into(), Value::String(namespace.into()));
    }
}

/// Pod spec of a workload object (Deployment, DaemonSet, StatefulSet, Job) or
/// a bare Pod.
fn pod_spec_mut(object: &mut Value) -> Option<&mut Value> {
    match object.get("kind").and_then(Value::as_str)? {
        "Deployment" | "DaemonSet" | "StatefulSet" | "Job" => {
            object.pointer_mut("/spec/template/spec")
        }
        "Pod" => object.get_mut("spec"),
        _ => None,
    }
}

fn for_each_container(pod_spec: &mut Value, mut f: impl FnMut(&mut Value)) {
    if let Some(spec) = pod_spec.as_object_mut() {
        for key in ["initContainers", "containers"] {
            if let Some(list) = spec.get_mut(key).and_then(Value::as_array_mut) {
                for container in list {
                    f(container);
                }
            }
        }
    }
}

fn apply_node_placement(pod_spec: &mut Value, node_placement: &NodePlacement) {
    let Some(spec) = pod_spec.as_object_mut() else {
        return;
    };
    if let Some(selector) = &node_placement.node_selector {
        if let Ok(raw) = serde_json::to_value(selector) {
            spec.insert("nodeSelector".into(), raw);
        }
    }
    if let Some(tolerations) = &node_placement.tolerations {
        if let Ok(raw) = serde_json::to_value(tolerations) {
            spec.insert("tolerations".into(), raw);
        }
    }
}

fn override_images(object: &mut Value, registries: &[ImageMirror]) {
    let Some(pod_spec) = pod_spec_mut(object) else {
        return;
    };
    for_each_container(pod_spec, |container| {
        let Some(image) = container.get("image").and_then(Value::as_str) else {
            return;
        };
        let replaced = override_image(registries, image);
        container["image"] = Value::String(replaced);
    });
}

fn upsert_env(container: &mut Value, name: &str, value: &str) {
    let Some(container) = container.as_object_mut() else {
        return;
    };
    let env = container
        .entry("env")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(env) = env.as_array_mut() else {
        return;
    };
    if let Some(existing) = env
        .iter_mut()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(name))
    {
        existing["value"] = Value::String(value.into());
    } else {
        env.push(json!({"name": name, "value": value}));
    }
}

fn inject_proxy_env(pod_spec: &mut Value, proxy: &ProxyConfig) {
    for_each_container(pod_spec, |container| {
        if !proxy.http_proxy.is_empty() {
            upsert_env(container, "HTTP_PROXY", &proxy.http_proxy);
        }
        if !proxy.https_proxy.is_empty() {
            upsert_env(container, "HTTPS_PROXY", &proxy.https_proxy);
        }
        if !proxy.no_proxy.is_empty() {
            upsert_env(container, "NO_PROXY", &proxy.no_proxy);
        }
    });
}

fn inject_env(pod_spec: &mut Value, pairs: &[(String, String)]) {
    for_each_container(pod_spec, |container| {
        for (name, value) in pairs {
            upsert_env(container, name, value);
        }
    });
}

/// Mount the per-signer client secret into every container so template-based
/// agents can reach the hub without rendering the plumbing themselves.
fn mount_signer_secrets(
    pod_spec: &mut Value,
    addon_name: &str,
    registrations: &[RegistrationConfig],
) {
    for registration in registrations {
        let secret = signer_secret_name(addon_name, &registration.signer_name);
        let mount_path = signer_mount_path(&registration.signer_name);
        let volume_name = secret.clone();

        for_each_container(pod_spec, |container| {
            let Some(container) = container.as_object_mut() else {
                return;
            };
            let mounts = container
                .entry("volumeMounts")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(mounts) = mounts.as_array_mut() {
                let present = mounts
                    .iter()
                    .any(|m| m.get("name").and_then(Value::as_str) == Some(volume_name.as_str()));
                if !present {
                    mounts.push(json!({"name": volume_name.clone(), "mountPath": mount_path.clone()}));
                }
            }
        });

        if let Some(spec) = pod_spec.as_object_mut() {
            let volumes = spec
                .entry("volumes")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(volumes) = volumes.as_array_mut() {
                let present = volumes
                    .iter()
                    .any(|v| v.get("name").and_then(Value::as_str) == Some(volume_name.as_str()));
                if !present {
                    volumes.push(json!({
                        "name": volume_name,
                        "secret": {"secretName": secret}
                    }));
                }
            }
        }
    }
}
