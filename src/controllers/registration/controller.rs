use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::agent::{ProviderRegistry, KUBE_CLIENT_SIGNER};
use crate::controllers::{Diagnostics, State};
use crate::metrics::Metrics;
use crate::telemetry;
use crate::{Error, Result};

/// Label a member agent stamps on its CSRs, naming the cluster.
pub static CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";
/// Label naming the add-on a CSR belongs to.
pub static ADDON_NAME_LABEL: &str = "open-cluster-management.io/addon-name";

static APPROVAL_REASON: &str = "AutoApprovedByAddonManager";

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Registered providers, consulted for approval and signing hooks
    pub providers: Arc<RwLock<ProviderRegistry>>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State) -> Arc<Context> {
        Arc::new(Context {
            client,
            providers: state.providers.clone(),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

/// Whether the CSR already carries an Approved or Denied condition.
fn has_final_decision(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
        .unwrap_or(false)
}

fn is_approved(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" && c.status == "True")
        })
        .unwrap_or(false)
}

fn has_certificate(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .map(|c| !c.0.is_empty())
        .unwrap_or(false)
}

fn approval_condition() -> CertificateSigningRequestCondition {
    let now = Time(Utc::now());
    CertificateSigningRequestCondition {
        type_: "Approved".into(),
        status: "True".into(),
        reason: Some(APPROVAL_REASON.into()),
        message: Some("approved by the add-on manager".into()),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

#[instrument(skip(ctx, csr), fields(trace_id))]
async fn reconcile(csr: Arc<CertificateSigningRequest>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<CertificateSigningRequest>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let Some(addon_name) = csr.labels().get(ADDON_NAME_LABEL).cloned() else {
        return Ok(Action::await_change());
    };

    let providers = ctx.providers.read().await;
    let Some(provider) = providers.get(&addon_name).cloned() else {
        // the template manager may not have registered this add-on yet
        return Ok(Action::requeue(Duration::from_secs(30)));
    };
    drop(providers);

    let Some(registration) = provider.options().registration.as_ref() else {
        return Ok(Action::await_change());
    };

    let name = csr.name_any();
    let api: Api<CertificateSigningRequest> = Api::all(ctx.client.clone());

    if !has_final_decision(&csr) {
        if let Some(approve) = &registration.csr_approve {
            if approve(&csr) {
                info!(csr = %name, addon = %addon_name, "Approving agent CSR");
                let mut approved = (*csr).clone();
                approved
                    .status
                    .get_or_insert_with(Default::default)
                    .conditions
                    .get_or_insert_with(Vec::new)
                    .push(approval_condition());
                api.patch_approval(&name, &PatchParams::default(), &Patch::Merge(&approved))
                    .await?;
                return Ok(Action::await_change());
            }
            debug!(csr = %name, addon = %addon_name, "CSR not eligible for auto-approval");
        }
        return Ok(Action::await_change());
    }

    // custom signers are served by the provider's signing hook
    if is_approved(&csr)
        && csr.spec.signer_name != KUBE_CLIENT_SIGNER
        && !has_certificate(&csr)
    {
        if let Some(sign) = &registration.csr_sign {
            if let Some(certificate) = sign(&csr) {
                info!(csr = %name, addon = %addon_name, "Signing agent CSR");
                api.patch_status(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({
                        "status": {"certificate": ByteString(certificate)}
                    })),
                )
                .await?;
            }
        }
    }

    Ok(Action::await_change())
}

fn error_policy(_csr: Arc<CertificateSigningRequest>, _: &Error, _ctx: Arc<Context>) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Run the CSR controller over agent certificate requests. Only CSRs carrying
/// the cluster-name label are watched at all.
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());
    if let Err(e) = csrs.list(&ListParams::default().limit(1)).await {
        error!("CertificateSigningRequest is not queryable; {e:?}");
        std::process::exit(1);
    }

    Controller::new(csrs, Config::default().labels(CLUSTER_NAME_LABEL))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Context::new(client, metrics, &state))
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus;

    fn csr_with_conditions(
        conditions: Option<Vec<CertificateSigningRequestCondition>>,
    ) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: Default::default(),
            spec: Default::default(),
            status: conditions.map(|conditions| CertificateSigningRequestStatus {
                conditions: Some(conditions),
                certificate: None,
            }),
        }
    }

    #[test]
    fn fresh_csrs_have_no_decision() {
        assert!(!has_final_decision(&csr_with_conditions(None)));
        assert!(!has_final_decision(&csr_with_conditions(Some(vec![]))));
        assert!(!is_approved(&csr_with_conditions(None)));
    }

    #[test]
    fn approved_and_denied_are_final() {
        let approved = csr_with_conditions(Some(vec![approval_condition()]));
        assert!(has_final_decision(&approved));
        assert!(is_approved(&approved));

        let denied = csr_with_conditions(Some(vec![CertificateSigningRequestCondition {
            type_: "Denied".into(),
            status: "True".into(),
            reason: None,
            message: None,
            last_update_time: None,
            last_transition_time: None,
        }]));
        assert!(has_final_decision(&denied));
        assert!(!is_approved(&denied));
    }

    #[test]
    fn issued_certificates_are_detected() {
        let mut csr = csr_with_conditions(Some(vec![approval_condition()]));
        assert!(!has_certificate(&csr));

        csr.status.as_mut().unwrap().certificate = Some(ByteString(b"PEM".to_vec()));
        assert!(has_certificate(&csr));
    }
}
