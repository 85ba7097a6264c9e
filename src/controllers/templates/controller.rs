use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::*;

use crate::agent::render::CrdTemplateAgent;
use crate::agent::{
    AgentOptions, AgentProvider, CsrSignFn, HealthProber, RegistrationOption,
    kube_client_registration_config,
};
use crate::controllers::{addon, Diagnostics, State};
use crate::metrics::Metrics;
use crate::resources::addontemplates::{
    AddOnTemplate, CustomSignerRegistration, TemplateRegistration, TemplateRegistrationType,
};
use crate::resources::managedclusteraddons::{ConfigGroupResource, RegistrationConfig};
use crate::telemetry;
use crate::{Error, Result};

pub static TEMPLATE_FINALIZER: &str = "addon.open-cluster-management.io/template-cleanup";

const REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One child deploy controller spawned for a template, keyed by its spec hash
/// so template edits tear the old one down.
struct Child {
    spec_hash: String,
    handle: JoinHandle<()>,
}

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Child controllers, one per template name
    pub children: Arc<RwLock<HashMap<String, Child>>>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Shared controller state handed down to children
    pub state: State,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "addon-operator".into()),
            children: Arc::new(RwLock::new(HashMap::new())),
            diagnostics: state.diagnostics.clone(),
            metrics,
            state,
        })
    }
}

#[instrument(skip(ctx, template), fields(trace_id))]
async fn reconcile(template: Arc<AddOnTemplate>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<AddOnTemplate>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!("Reconciling AddOnTemplate {}", template.name_any());

    let api: Api<AddOnTemplate> = Api::all(ctx.client.clone());
    let result = finalizer(&api, TEMPLATE_FINALIZER, template.clone(), |event| async {
        match event {
            Finalizer::Apply(template) => template.apply(ctx.clone()).await,
            Finalizer::Cleanup(template) => template.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)));

    match result {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &template.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(template.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_template: Arc<AddOnTemplate>, _: &Error, _ctx: Arc<Context>) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Build the signing hook for a custom signer from its CA key pair. Returns a
/// closure so the secret is read once per template generation, not per CSR.
fn custom_signer_fn(ca_cert_pem: String, ca_key_pem: String) -> CsrSignFn {
    use rcgen::{CertificateParams, CertificateSigningRequestParams, KeyPair};

    Box::new(move |csr| {
        let request = String::from_utf8_lossy(&csr.spec.request.0);
        let params = CertificateSigningRequestParams::from_pem(&request).ok()?;
        let ca_key = KeyPair::from_pem(&ca_key_pem).ok()?;
        let issuer = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .ok()?
            .self_signed(&ca_key)
            .ok()?;
        let certificate = params.signed_by(&issuer, &ca_key).ok()?;
        Some(certificate.pem().into_bytes())
    })
}

/// Merge the template's registration entries into one registration option:
/// a kube-client entry contributes the default subject, approver and hub
/// permissions; custom signer entries add their own registration configs.
fn registration_option(
    addon_name: &str,
    entries: &[TemplateRegistration],
    custom_signers: Vec<(CustomSignerRegistration, Option<CsrSignFn>)>,
) -> RegistrationOption {
    let mut option = RegistrationOption::kube_client(addon_name, addon_name);

    for entry in entries {
        if entry.r#type != TemplateRegistrationType::KubeClient {
            continue;
        }
        if let Some(kube_client) = &entry.kube_client {
            if let Some(permissions) = &kube_client.hub_permissions {
                option.hub_permissions.extend(permissions.iter().cloned());
            }
        }
    }

    if !custom_signers.is_empty() {
        let addon = addon_name.to_string();
        let agent = option.agent_name.clone();
        let signers: Vec<CustomSignerRegistration> =
            custom_signers.iter().map(|(s, _)| s.clone()).collect();
        option.config_fn = Box::new(move |cluster, _addon| {
            let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
            let mut configs = vec![kube_client_registration_config(cluster_name, &addon, &agent)];
            for signer in &signers {
                configs.push(RegistrationConfig {
                    signer_name: signer.signer_name.clone(),
                    subject: signer.subject.clone(),
                });
            }
            configs
        });
        // one signing hook serves all CSRs; pick the first signer with a CA
        option.csr_sign = custom_signers.into_iter().find_map(|(_, sign)| sign);
    }

    option
}

impl AddOnTemplate {
    /// Read the signing CA key pair of a custom signer, if it is configured.
    async fn signing_hook(
        &self,
        ctx: &Context,
        signer: &CustomSignerRegistration,
    ) -> Result<Option<CsrSignFn>> {
        let Some(ca_ref) = &signer.signing_ca else {
            return Ok(None);
        };
        let namespace = if ca_ref.namespace.is_empty() {
            "open-cluster-management-hub"
        } else {
            &ca_ref.namespace
        };
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
        let Some(secret) = api.get_opt(&ca_ref.name).await? else {
            warn!(
                secret = %ca_ref.name,
                namespace = %namespace,
                "Signing CA secret not found; CSRs for this signer stay unsigned"
            );
            return Ok(None);
        };

        let data = secret.data.unwrap_or_default();
        let pem_of = |key: &str| {
            data.get(key)
                .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        };
        match (pem_of("tls.crt"), pem_of("tls.key")) {
            (Some(cert), Some(key)) => Ok(Some(custom_signer_fn(cert, key))),
            _ => {
                warn!(secret = %ca_ref.name, "Signing CA secret misses tls.crt or tls.key");
                Ok(None)
            }
        }
    }

    /// Build the provider for this template generation.
    async fn build_provider(&self, ctx: &Context) -> Result<Arc<dyn AgentProvider>> {
        let addon_name = self.spec.addon_name.clone();
        let entries = self.spec.registration.as_deref().unwrap_or(&[]);

        let mut custom_signers = Vec::new();
        for entry in entries {
            if entry.r#type != TemplateRegistrationType::CustomSigner {
                continue;
            }
            if let Some(signer) = &entry.custom_signer {
                let hook = self.signing_hook(ctx, signer).await?;
                custom_signers.push((signer.clone(), hook));
            }
        }

        let mut options = AgentOptions::new(&addon_name);
        options.supported_config_kinds = vec![
            ConfigGroupResource {
                group: "addon.open-cluster-management.io".into(),
                resource: "addondeploymentconfigs".into(),
            },
            ConfigGroupResource {
                group: "addon.open-cluster-management.io".into(),
                resource: "addontemplates".into(),
            },
        ];
        options.prober = HealthProber::WorkloadAvailability;
        options.registration = Some(registration_option(&addon_name, entries, custom_signers));
        options.hosted_mode_enabled = true;
        options.template_based = true;

        Ok(Arc::new(CrdTemplateAgent::new(options, self.clone())))
    }

    async fn apply(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let spec_hash = self.spec_hash();

        {
            let children = ctx.children.read().await;
            if children.get(&name).map(|c| c.spec_hash.as_str()) == Some(spec_hash.as_str()) {
                return Ok(Action::requeue(REQUEUE_INTERVAL));
            }
        }

        let provider = self.build_provider(&ctx).await?;
        let addon_name = provider.options().addon_name.clone();

        ctx.state
            .providers
            .write()
            .await
            .insert(addon_name.clone(), provider.clone());

        let mut children = ctx.children.write().await;
        if let Some(previous) = children.remove(&name) {
            info!(template = %name, "Restarting deploy controller for updated template");
            previous.handle.abort();
        } else {
            info!(template = %name, addon = %addon_name, "Starting deploy controller");
        }
        let handle = tokio::spawn(addon::run(
            ctx.client.clone(),
            provider,
            ctx.metrics.clone(),
            ctx.state.clone(),
        ));
        children.insert(name, Child { spec_hash, handle });

        Ok(Action::requeue(REQUEUE_INTERVAL))
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();

        if let Some(child) = ctx.children.write().await.remove(&name) {
            info!(template = %name, "Stopping deploy controller for deleted template");
            child.handle.abort();
        }
        ctx.state
            .providers
            .write()
            .await
            .remove(&self.spec.addon_name);

        Ok(Action::await_change())
    }
}

/// Run the template manager: each AddOnTemplate gets a provider in the shared
/// registry and a deploy controller of its own.
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let templates: Api<AddOnTemplate> = Api::all(client.clone());
    if let Err(e) = templates.list(&ListParams::default().limit(1)).await {
        error!("AddOnTemplate is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    Controller::new(templates, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use rcgen::{CertificateParams, DnType, IsCa, KeyPair};

    use crate::agent::{agent_user, cluster_addon_group};
    use crate::resources::addontemplates::KubeClientRegistration;
    use crate::resources::clusters::ManagedCluster;

    fn kube_client_entry() -> TemplateRegistration {
        TemplateRegistration {
            r#type: TemplateRegistrationType::KubeClient,
            kube_client: Some(KubeClientRegistration {
                hub_permissions: Some(vec![Default::default()]),
            }),
            custom_signer: None,
        }
    }

    #[test]
    fn registration_merges_permissions_and_signers() {
        let signer = CustomSignerRegistration {
            signer_name: "example.com/signer".into(),
            subject: None,
            signing_ca: None,
        };
        let option = registration_option(
            "hello",
            &[kube_client_entry()],
            vec![(signer, None)],
        );
        assert_eq!(option.hub_permissions.len(), 1);

        let mut cluster = ManagedCluster::default();
        cluster.metadata.name = Some("c1".into());
        let addon = crate::resources::managedclusteraddons::ManagedClusterAddOn::new(
            "hello",
            Default::default(),
        );
        let configs = (option.config_fn)(&cluster, &addon);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].signer_name, crate::agent::KUBE_CLIENT_SIGNER);
        assert_eq!(configs[1].signer_name, "example.com/signer");
        assert_eq!(
            configs[0].subject.as_ref().unwrap().user,
            agent_user("c1", "hello", "hello")
        );
    }

    #[test]
    fn custom_signer_issues_certificates() {
        // self-signed CA
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "test-ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        // agent CSR
        let agent_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(
            DnType::CommonName,
            agent_user("c1", "hello", "hello"),
        );
        params
            .distinguished_name
            .push(DnType::OrganizationName, cluster_addon_group("c1", "hello"));
        let request_pem = params.serialize_request(&agent_key).unwrap().pem().unwrap();

        let sign = custom_signer_fn(ca_cert.pem(), ca_key.serialize_pem());
        let csr = k8s_openapi::api::certificates::v1::CertificateSigningRequest {
            metadata: Default::default(),
            spec: k8s_openapi::api::certificates::v1::CertificateSigningRequestSpec {
                request: k8s_openapi::ByteString(request_pem.into_bytes()),
                signer_name: "example.com/signer".into(),
                ..Default::default()
            },
            status: None,
        };
        let issued = sign(&csr).unwrap();
        let pem = String::from_utf8(issued).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }
}
