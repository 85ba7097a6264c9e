use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::Value;

use crate::resources::addontemplates::AddOnTemplate;
use crate::resources::clusters::ManagedCluster;
use crate::resources::managedclusteraddons::{DeployMode, ManagedClusterAddOn};
use crate::{Error, Result};

use super::values::{build_values, RenderValues, ValuesFn};
use super::{AgentOptions, AgentProvider};

/// One embedded template file. Management-only templates render objects meant
/// for the hosting cluster and are skipped outside hosted mode.
#[derive(Clone, Copy)]
pub struct TemplateFile {
    pub name: &'static str,
    pub content: &'static str,
    pub management_only: bool,
}

impl TemplateFile {
    pub const fn new(name: &'static str, content: &'static str) -> Self {
        TemplateFile {
            name,
            content,
            management_only: false,
        }
    }

    pub const fn management_only(name: &'static str, content: &'static str) -> Self {
        TemplateFile {
            name,
            content,
            management_only: true,
        }
    }
}

/// Provider backed by embedded handlebars templates rendering to YAML.
pub struct TemplateAgent {
    options: AgentOptions,
    templates: Vec<TemplateFile>,
    value_fns: Vec<ValuesFn>,
}

impl TemplateAgent {
    pub fn new(options: AgentOptions, templates: Vec<TemplateFile>) -> Self {
        TemplateAgent {
            options,
            templates,
            value_fns: Vec::new(),
        }
    }

    pub fn with_value_fn(mut self, value_fn: ValuesFn) -> Self {
        self.value_fns.push(value_fn);
        self
    }
}

impl AgentProvider for TemplateAgent {
    fn options(&self) -> &AgentOptions {
        &self.options
    }

    fn value_fns(&self) -> &[ValuesFn] {
        &self.value_fns
    }

    fn manifests(
        &self,
        _cluster: &ManagedCluster,
        addon: &ManagedClusterAddOn,
        values: &RenderValues,
    ) -> Result<Vec<Value>> {
        let hosted = addon.deploy_mode() == DeployMode::Hosted;

        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(false);

        let mut objects = Vec::new();
        for template in &self.templates {
            if template.management_only && !hosted {
                continue;
            }
            let rendered = registry.render_template(template.content, &values.public)?;
            objects.extend(parse_yaml_documents(&rendered)?);
        }

        if self.options.trim_crd_descriptions {
            for object in &mut objects {
                trim_crd_descriptions(object);
            }
        }

        Ok(objects)
    }
}

/// Split a rendered multi-document YAML stream into JSON objects, dropping
/// empty documents and documents without a kind.
pub fn parse_yaml_documents(rendered: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = Value::deserialize(document)?;
        if value.get("kind").and_then(Value::as_str).is_none() {
            continue;
        }
        objects.push(value);
    }
    Ok(objects)
}

/// Provider backed by an AddOnTemplate: raw manifests with `{{VARIABLE}}`
/// placeholders substituted from string values only.
pub struct CrdTemplateAgent {
    options: AgentOptions,
    template: AddOnTemplate,
    value_fns: Vec<ValuesFn>,
}

impl CrdTemplateAgent {
    pub fn new(options: AgentOptions, template: AddOnTemplate) -> Self {
        CrdTemplateAgent {
            options,
            template,
            value_fns: Vec::new(),
        }
    }

    pub fn with_value_fn(mut self, value_fn: ValuesFn) -> Self {
        self.value_fns.push(value_fn);
        self
    }

    pub fn template(&self) -> &AddOnTemplate {
        &self.template
    }
}

impl AgentProvider for CrdTemplateAgent {
    fn options(&self) -> &AgentOptions {
        &self.options
    }

    fn value_fns(&self) -> &[ValuesFn] {
        &self.value_fns
    }

    fn manifests(
        &self,
        _cluster: &ManagedCluster,
        _addon: &ManagedClusterAddOn,
        values: &RenderValues,
    ) -> Result<Vec<Value>> {
        let pairs = values.string_pairs()?;

        let mut objects = Vec::new();
        for manifest in &self.template.spec.agent_spec.workload.manifests {
            let mut raw = serde_json::to_string(&manifest.0)?;
            for (name, value) in &pairs {
                raw = raw.replace(&format!("{{{{{name}}}}}"), value);
            }
            objects.push(serde_json::from_str(&raw)?);
        }
        Ok(objects)
    }
}

/// Strip schema descriptions from a rendered CustomResourceDefinition.
pub fn trim_crd_descriptions(object: &mut Value) {
    if object.get("kind").and_then(Value::as_str) != Some("CustomResourceDefinition") {
        return;
    }
    let Some(versions) = object
        .pointer_mut("/spec/versions")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for version in versions {
        if let Some(schema) = version.pointer_mut("/schema/openAPIV3Schema") {
            remove_descriptions(schema);
        }
    }
}

fn remove_descriptions(schema: &mut Value) {
    if let Some(map) = schema.as_object_mut() {
        map.remove("description");
        for value in map.values_mut() {
            remove_descriptions(value);
        }
    } else if let Some(items) = schema.as_array_mut() {
        for value in items {
            remove_descriptions(value);
        }
    }
}

/// Convenience wrapper used by the deploy reconcilers: run the value pipeline
/// for one provider, then render.
pub fn render_manifests(
    provider: &dyn AgentProvider,
    cluster: &ManagedCluster,
    addon: &ManagedClusterAddOn,
    install_namespace: &str,
    config_values: &[crate::agent::values::Values],
) -> Result<(Vec<Value>, RenderValues)> {
    let values = build_values(
        cluster,
        addon,
        install_namespace,
        provider.value_fns(),
        config_values,
    )?;
    let objects = provider.manifests(cluster, addon, &values)?;
    Ok((objects, values))
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;

    use crate::agent::values::Values;
    use crate::resources::addontemplates::{AddOnTemplateSpec, AgentSpec};
    use crate::resources::managedclusteraddons::ManagedClusterAddOnSpec;
    use crate::resources::manifestworks::{Manifest, ManifestsTemplate};

    static DEPLOYMENT_TEMPLATE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{AddonName}}-agent
  namespace: {{AddonInstallNamespace}}
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: agent
          image: {{Image}}
"#;

    fn cluster() -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    fn addon() -> ManagedClusterAddOn {
        let mut addon = ManagedClusterAddOn::new("test", ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some("c1".into());
        addon
    }

    #[test]
    fn template_agent_renders_and_skips_empty_documents() {
        let agent = TemplateAgent::new(
            AgentOptions::new("test"),
            vec![
                TemplateFile::new("deployment.yaml", DEPLOYMENT_TEMPLATE),
                TemplateFile::new("empty.yaml", "\n---\n# nothing here\n"),
            ],
        )
        .with_value_fn(Box::new(|_, _| {
            let mut v = Values::new();
            v.insert("AddonName".into(), json!("test"));
            v.insert("Image".into(), json!("quay.io/test/agent:v1"));
            Ok(v)
        }));

        let (objects, _) =
            render_manifests(&agent, &cluster(), &addon(), "agent-ns", &[]).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["metadata"]["name"], json!("test-agent"));
        assert_eq!(objects[0]["metadata"]["namespace"], json!("agent-ns"));
        assert_eq!(
            objects[0]["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("quay.io/test/agent:v1")
        );
    }

    #[test]
    fn management_only_templates_render_in_hosted_mode_only() {
        let agent = TemplateAgent::new(
            AgentOptions::new("test"),
            vec![TemplateFile::management_only(
                "hosting.yaml",
                "kind: ConfigMap\nmetadata:\n  name: hosting-side\n",
            )],
        );

        let (objects, _) = render_manifests(&agent, &cluster(), &addon(), "ns", &[]).unwrap();
        assert!(objects.is_empty());

        let mut hosted = addon();
        hosted.metadata.annotations = Some(
            [
                (
                    crate::resources::managedclusteraddons::DEPLOY_MODE_ANNOTATION.to_string(),
                    "Hosted".to_string(),
                ),
                (
                    crate::resources::managedclusteraddons::HOSTING_CLUSTER_ANNOTATION.to_string(),
                    "h1".to_string(),
                ),
            ]
            .into(),
        );
        let (objects, _) = render_manifests(&agent, &cluster(), &hosted, "ns", &[]).unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn crd_template_agent_substitutes_string_values() {
        let template = AddOnTemplate::new(
            "test",
            AddOnTemplateSpec {
                addon_name: "test".into(),
                agent_spec: AgentSpec {
                    workload: ManifestsTemplate {
                        manifests: vec![Manifest(json!({
                            "apiVersion": "v1",
                            "kind": "ConfigMap",
                            "metadata": {"name": "agent-config", "namespace": "{{AddonInstallNamespace}}"},
                            "data": {"clusterName": "{{ClusterName}}"}
                        }))],
                    },
                },
                registration: None,
            },
        );

        let agent = CrdTemplateAgent::new(AgentOptions::new("test"), template);
        let (objects, _) = render_manifests(&agent, &cluster(), &addon(), "ns", &[]).unwrap();
        assert_eq!(objects[0]["metadata"]["namespace"], json!("ns"));
        assert_eq!(objects[0]["data"]["clusterName"], json!("c1"));
    }

    #[test]
    fn crd_template_agent_rejects_non_string_values() {
        let template = AddOnTemplate::new(
            "test",
            AddOnTemplateSpec {
                addon_name: "test".into(),
                agent_spec: AgentSpec::default(),
                registration: None,
            },
        );
        let agent = CrdTemplateAgent::new(AgentOptions::new("test"), template).with_value_fn(
            Box::new(|_, _| {
                let mut v = Values::new();
                v.insert("Replicas".into(), json!(2));
                Ok(v)
            }),
        );

        let err = render_manifests(&agent, &cluster(), &addon(), "ns", &[]).unwrap_err();
        assert!(matches!(err, Error::NonStringValue(_)));
    }

    #[test]
    fn trim_crd_descriptions_strips_schemas_only() {
        let mut crd = json!({
            "kind": "CustomResourceDefinition",
            "spec": {
                "versions": [{
                    "name": "v1",
                    "schema": {"openAPIV3Schema": {
                        "description": "top",
                        "properties": {"spec": {"description": "inner", "type": "object"}}
                    }}
                }]
            }
        });
        trim_crd_descriptions(&mut crd);
        let schema = crd.pointer("/spec/versions/0/schema/openAPIV3Schema").unwrap();
        assert!(schema.get("description").is_none());
        assert!(schema.pointer("/properties/spec/description").is_none());
        assert_eq!(schema.pointer("/properties/spec/type"), Some(&json!("object")));
    }
}
