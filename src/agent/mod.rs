use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::resources::managedclusteraddons::{
    ConfigGroupResource, ManagedClusterAddOn, RegistrationConfig, RegistrationSubject,
};
use crate::resources::clusters::ManagedCluster;
use crate::resources::manifestworks::{FeedbackRule, FeedbackValue, ResourceIdentifier};
use crate::{Error, Result};

pub mod render;
pub mod values;

use values::{RenderValues, ValuesFn};

/// Signer for standard hub kube-client registration.
pub static KUBE_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// A provider knows how to render the agent manifests of one add-on type and
/// exposes the options driving deployment, health probing and registration.
pub trait AgentProvider: Send + Sync {
    fn options(&self) -> &AgentOptions;

    /// Value functions merged by the value pipeline, in registration order.
    fn value_fns(&self) -> &[ValuesFn] {
        &[]
    }

    /// Render the agent manifests for one (cluster, add-on) pair.
    fn manifests(
        &self,
        cluster: &ManagedCluster,
        addon: &ManagedClusterAddOn,
        values: &RenderValues,
    ) -> Result<Vec<serde_json::Value>>;
}

/// Providers keyed by add-on name. Mutated only at startup; the template
/// manager keeps its own per-hash children instead of touching this map.
pub type ProviderRegistry = HashMap<String, Arc<dyn AgentProvider>>;

pub struct AgentOptions {
    pub addon_name: String,

    /// Configuration kinds resolved for instances of this add-on.
    pub supported_config_kinds: Vec<ConfigGroupResource>,

    pub prober: HealthProber,

    pub registration: Option<RegistrationOption>,

    /// Whether the provider understands hosted mode at all.
    pub hosted_mode_enabled: bool,

    /// When set, manifests are not deployed until the Configured condition is True.
    pub config_check_enabled: bool,

    /// Strip schema descriptions from rendered CRDs to shrink the payload.
    pub trim_crd_descriptions: bool,

    /// Template-based add-ons get public values injected as container env and
    /// signer secrets mounted by the packaging decorators.
    pub template_based: bool,
}

impl AgentOptions {
    pub fn new(addon_name: impl Into<String>) -> Self {
        AgentOptions {
            addon_name: addon_name.into(),
            supported_config_kinds: Vec::new(),
            prober: HealthProber::default(),
            registration: None,
            hosted_mode_enabled: false,
            config_check_enabled: false,
            trim_crd_descriptions: false,
            template_based: false,
        }
    }
}

/// How the Available condition of an instance is derived.
#[derive(Default)]
pub enum HealthProber {
    /// Leave Available unset; the add-on reports its own health.
    #[default]
    None,
    /// The member agent maintains a lease; an external controller sets Available.
    Lease,
    /// Probe explicit fields through work status feedback.
    Work(WorkProber),
    /// Probe every rendered Deployment through well-known status fields.
    DeploymentAvailability,
    /// Probe every rendered Deployment and DaemonSet.
    WorkloadAvailability,
}

pub struct WorkProber {
    pub probe_fields: Vec<ProbeField>,
    pub health_checker: HealthChecker,
}

/// Checks one probed resource's feedback values; an Err message marks the
/// add-on unavailable with that message.
pub type HealthChecker =
    fn(&ResourceIdentifier, &[FeedbackValue]) -> std::result::Result<(), String>;

pub struct ProbeField {
    pub resource_identifier: ResourceIdentifier,
    pub feedback_rules: Vec<FeedbackRule>,
}

/// Registration requirements plus the hub-side approval/signing hooks.
pub struct RegistrationOption {
    /// Registration configs published to the instance status, per cluster.
    pub config_fn: RegistrationConfigFn,

    /// Approval predicate for incoming CSRs; None means never auto-approve.
    pub csr_approve: Option<CsrApproveFn>,

    /// Signer for approved CSRs of custom signers; returns the issued
    /// certificate in PEM. None leaves signing to an external signer.
    pub csr_sign: Option<CsrSignFn>,

    /// The agent identity used in the default CSR subject.
    pub agent_name: String,

    /// Hub-side RBAC granted to the agent identity.
    pub hub_permissions: Vec<crate::resources::addontemplates::HubPermissionConfig>,
}

pub type RegistrationConfigFn = Box<
    dyn Fn(&ManagedCluster, &ManagedClusterAddOn) -> Vec<RegistrationConfig> + Send + Sync,
>;
pub type CsrApproveFn = Box<dyn Fn(&CertificateSigningRequest) -> bool + Send + Sync>;
pub type CsrSignFn = Box<dyn Fn(&CertificateSigningRequest) -> Option<Vec<u8>> + Send + Sync>;

impl RegistrationOption {
    /// Standard kube-client registration with the default approver.
    pub fn kube_client(addon_name: &str, agent_name: &str) -> Self {
        let addon = addon_name.to_string();
        let agent = agent_name.to_string();
        let approve_addon = addon.clone();
        let approve_agent = agent.clone();
        RegistrationOption {
            config_fn: Box::new(move |cluster, _addon| {
                vec![kube_client_registration_config(
                    cluster.metadata.name.as_deref().unwrap_or_default(),
                    &addon,
                    &agent,
                )]
            }),
            csr_approve: Some(Box::new(move |csr| {
                default_csr_approve(csr, &approve_addon, &approve_agent)
            })),
            csr_sign: None,
            agent_name: agent_name.to_string(),
            hub_permissions: Vec::new(),
        }
    }
}

pub fn agent_user(cluster: &str, addon: &str, agent: &str) -> String {
    format!("system:open-cluster-management:cluster:{cluster}:addon:{addon}:agent:{agent}")
}

pub fn cluster_addon_group(cluster: &str, addon: &str) -> String {
    format!("system:open-cluster-management:cluster:{cluster}:addon:{addon}")
}

pub fn addon_group(addon: &str) -> String {
    format!("system:open-cluster-management:addon:{addon}")
}

pub fn kube_client_registration_config(
    cluster: &str,
    addon: &str,
    agent: &str,
) -> RegistrationConfig {
    RegistrationConfig {
        signer_name: KUBE_CLIENT_SIGNER.into(),
        subject: Some(RegistrationSubject {
            user: agent_user(cluster, addon, agent),
            groups: vec![
                cluster_addon_group(cluster, addon),
                addon_group(addon),
                "system:authenticated".into(),
            ],
            organization_units: Vec::new(),
        }),
    }
}

/// Secret name the hub kubeconfig (or a custom signer's client cert) is stored
/// under on the managed cluster, and the mount path the volume decorator uses.
pub fn signer_secret_name(addon: &str, signer: &str) -> String {
    if signer == KUBE_CLIENT_SIGNER {
        format!("{addon}-hub-kubeconfig")
    } else {
        format!("{addon}-{}-client-cert", signer.replace(['/', '.'], "-"))
    }
}

pub fn signer_mount_path(signer: &str) -> String {
    if signer == KUBE_CLIENT_SIGNER {
        "/managed/hub-kubeconfig".into()
    } else {
        format!("/managed/{}", signer.replace(['/', '.'], "-"))
    }
}

/// Subject of a CSR as parsed from its PEM request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    pub common_name: String,
    pub organizations: Vec<String>,
}

/// Parse the subject out of a PEM-encoded PKCS#10 request.
pub fn parse_csr_subject(request_pem: &str) -> Result<CsrSubject> {
    use rcgen::{CertificateSigningRequestParams, DnType, DnValue};

    let params = CertificateSigningRequestParams::from_pem(request_pem)
        .map_err(|e| Error::CsrParseError(e.to_string()))?;

    let mut common_name = String::new();
    let mut organizations = Vec::new();
    for (dn_type, dn_value) in params.params.distinguished_name.iter() {
        let value = match dn_value {
            DnValue::PrintableString(s) => s.as_str().to_string(),
            DnValue::Utf8String(s) => s.clone(),
            _ => continue,
        };
        match dn_type {
            DnType::CommonName => common_name = value,
            DnType::OrganizationName => organizations.push(value),
            _ => {}
        }
    }

    Ok(CsrSubject {
        common_name,
        organizations,
    })
}

/// The default approver: the CSR subject must carry the agent common name for
/// this cluster/add-on and both well-known groups.
pub fn default_csr_approve(csr: &CertificateSigningRequest, addon: &str, agent: &str) -> bool {
    let Some(cluster) = csr
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get("open-cluster-management.io/cluster-name"))
    else {
        return false;
    };

    let request = String::from_utf8_lossy(&csr.spec.request.0);
    let subject = match parse_csr_subject(&request) {
        Ok(subject) => subject,
        Err(_) => return false,
    };

    subject.common_name == agent_user(cluster, addon, agent)
        && subject
            .organizations
            .contains(&cluster_addon_group(cluster, addon))
        && subject.organizations.contains(&addon_group(addon))
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestSpec;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn csr_pem(common_name: &str, organizations: &[String]) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        for org in organizations {
            params
                .distinguished_name
                .push(DnType::OrganizationName, org.as_str());
        }
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    fn csr_for(cluster: &str, common_name: &str, organizations: &[String]) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("addon-c1-test".into()),
                labels: Some(
                    [(
                        "open-cluster-management.io/cluster-name".to_string(),
                        cluster.to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem(common_name, organizations).into_bytes()),
                signer_name: KUBE_CLIENT_SIGNER.into(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn parse_csr_subject_roundtrip() {
        let pem = csr_pem("system:me", &["org1".into(), "org2".into()]);
        let subject = parse_csr_subject(&pem).unwrap();
        assert_eq!(subject.common_name, "system:me");
        assert_eq!(subject.organizations, vec!["org1".to_string(), "org2".to_string()]);
    }

    #[test]
    fn default_approver_accepts_expected_subject() {
        let csr = csr_for(
            "c1",
            &agent_user("c1", "test", "test"),
            &[
                cluster_addon_group("c1", "test"),
                addon_group("test"),
                "system:authenticated".into(),
            ],
        );
        assert!(default_csr_approve(&csr, "test", "test"));
    }

    #[test]
    fn default_approver_rejects_wrong_identity() {
        // wrong common name
        let csr = csr_for(
            "c1",
            &agent_user("c2", "test", "test"),
            &[cluster_addon_group("c1", "test"), addon_group("test")],
        );
        assert!(!default_csr_approve(&csr, "test", "test"));

        // missing addon group
        let csr = csr_for(
            "c1",
            &agent_user("c1", "test", "test"),
            &[cluster_addon_group("c1", "test")],
        );
        assert!(!default_csr_approve(&csr, "test", "test"));
    }

    #[test]
    fn signer_secret_names_are_deterministic() {
        assert_eq!(signer_secret_name("test", KUBE_CLIENT_SIGNER), "test-hub-kubeconfig");
        assert_eq!(
            signer_secret_name("test", "example.com/signer"),
            "test-example-com-signer-client-cert"
        );
        assert_eq!(signer_mount_path("example.com/signer"), "/managed/example-com-signer");
    }
}
