use serde_json::Value;

use crate::agent::{HealthProber, WorkProber};
use crate::resources::managedclusteraddons::{
    HealthCheckMode, REASON_NO_PROBE_RESULT, REASON_PROBE_AVAILABLE, REASON_PROBE_UNAVAILABLE,
    REASON_WORK_NOT_APPLY, REASON_WORK_NOT_FOUND,
};
use crate::resources::manifestworks::{
    FeedbackRule, FeedbackRuleType, FeedbackValue, JsonPath, ManifestConfigOption, ManifestWork,
    ResourceIdentifier, ValueType,
};

use super::works::resource_identifier_for;

/// The health check mode published to the instance status for a prober.
pub fn health_check_mode(prober: &HealthProber) -> HealthCheckMode {
    match prober {
        HealthProber::None => HealthCheckMode::Customized,
        HealthProber::Lease => HealthCheckMode::Lease,
        HealthProber::Work(_)
        | HealthProber::DeploymentAvailability
        | HealthProber::WorkloadAvailability => HealthCheckMode::WorkFeedback,
    }
}

fn is_workload(object: &Value, kinds: &[&str]) -> bool {
    object
        .get("kind")
        .and_then(Value::as_str)
        .is_some_and(|k| kinds.contains(&k))
}

/// Probe targets derived from the rendered objects for the availability
/// probers; explicit targets for the work prober.
pub fn probe_identifiers(prober: &HealthProber, objects: &[Value]) -> Vec<ResourceIdentifier> {
    match prober {
        HealthProber::None | HealthProber::Lease => Vec::new(),
        HealthProber::Work(WorkProber { probe_fields, .. }) => probe_fields
            .iter()
            .map(|f| f.resource_identifier.clone())
            .collect(),
        HealthProber::DeploymentAvailability => objects
            .iter()
            .filter(|o| is_workload(o, &["Deployment"]))
            .filter_map(resource_identifier_for)
            .collect(),
        HealthProber::WorkloadAvailability => objects
            .iter()
            .filter(|o| is_workload(o, &["Deployment", "DaemonSet"]))
            .filter_map(resource_identifier_for)
            .collect(),
    }
}

/// Manifest config entries the deploy works need so the member agent reports
/// the feedback the prober consumes.
pub fn probe_manifest_configs(
    prober: &HealthProber,
    objects: &[Value],
) -> Vec<ManifestConfigOption> {
    match prober {
        HealthProber::None | HealthProber::Lease => Vec::new(),
        HealthProber::Work(WorkProber { probe_fields, .. }) => probe_fields
            .iter()
            .map(|f| ManifestConfigOption {
                resource_identifier: f.resource_identifier.clone(),
                feedback_rules: Some(f.feedback_rules.clone()),
                update_strategy: None,
            })
            .collect(),
        HealthProber::DeploymentAvailability | HealthProber::WorkloadAvailability => {
            probe_identifiers(prober, objects)
                .into_iter()
                .map(|resource_identifier| ManifestConfigOption {
                    feedback_rules: Some(vec![availability_feedback_rule(
                        &resource_identifier.resource,
                    )]),
                    resource_identifier,
                    update_strategy: None,
                })
                .collect()
        }
    }
}

fn json_path(name: &str, path: &str) -> JsonPath {
    JsonPath {
        name: name.into(),
        version: None,
        path: path.into(),
    }
}

/// Feedback rule requesting the fields the default checker compares; the
/// desired counts are not part of the well-known set, so they are asked for
/// explicitly.
fn availability_feedback_rule(resource: &str) -> FeedbackRule {
    let json_paths = match resource {
        "deployments" => vec![
            json_path("Replicas", ".status.replicas"),
            json_path("ReadyReplicas", ".status.readyReplicas"),
        ],
        "daemonsets" => vec![
            json_path("DesiredNumberScheduled", ".status.desiredNumberScheduled"),
            json_path("NumberReady", ".status.numberReady"),
        ],
        _ => return FeedbackRule::default(),
    };
    FeedbackRule {
        r#type: FeedbackRuleType::JsonPaths,
        json_paths: Some(json_paths),
    }
}

/// Outcome of one health synthesis pass, mapped to the Available condition.
#[derive(Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The prober does not synthesize availability.
    NotApplicable,
    Available,
    Unavailable { reason: String, message: String },
}

fn integer_value(values: &[FeedbackValue], name: &str) -> Option<i64> {
    let value = values.iter().find(|v| v.name == name)?;
    match value.field_value.r#type {
        ValueType::Integer => value.field_value.integer,
        _ => None,
    }
}

/// Built-in checker for the availability probers. A Deployment scaled to zero
/// is healthy; otherwise at least one replica must be ready. A DaemonSet must
/// report every scheduled pod ready, and both counts must be probed.
fn workload_available(
    id: &ResourceIdentifier,
    values: &[FeedbackValue],
) -> Result<(), String> {
    match id.resource.as_str() {
        "deployments" => {
            if integer_value(values, "Replicas") == Some(0) {
                return Ok(());
            }
            match integer_value(values, "ReadyReplicas") {
                Some(n) if n >= 1 => Ok(()),
                Some(n) => Err(format!(
                    "{}/{} has {} ready replicas",
                    id.namespace, id.name, n
                )),
                None => Err(format!(
                    "no readiness feedback for {}/{}",
                    id.namespace, id.name
                )),
            }
        }
        "daemonsets" => {
            let desired = integer_value(values, "DesiredNumberScheduled");
            let ready = integer_value(values, "NumberReady");
            match (desired, ready) {
                (Some(desired), Some(ready)) if desired == ready => Ok(()),
                (Some(desired), Some(ready)) => Err(format!(
                    "{}/{} has {ready} of {desired} pods ready",
                    id.namespace, id.name
                )),
                _ => Err(format!(
                    "no readiness feedback for {}/{}",
                    id.namespace, id.name
                )),
            }
        }
        other => Err(format!("unprobeable resource {other}")),
    }
}

/// Derive the Available outcome for one instance from its deploy works.
pub fn probe_health(
    prober: &HealthProber,
    objects: &[Value],
    works: &[ManifestWork],
) -> ProbeOutcome {
    let identifiers = probe_identifiers(prober, objects);
    let checker = match prober {
        HealthProber::None | HealthProber::Lease => return ProbeOutcome::NotApplicable,
        HealthProber::Work(WorkProber { health_checker, .. }) => *health_checker,
        HealthProber::DeploymentAvailability | HealthProber::WorkloadAvailability => {
            workload_available
        }
    };

    if works.is_empty() {
        return ProbeOutcome::Unavailable {
            reason: REASON_WORK_NOT_FOUND.into(),
            message: "work is not found".into(),
        };
    }
    if let Some(work) = works.iter().find(|w| w.applied() != Some(true)) {
        return ProbeOutcome::Unavailable {
            reason: REASON_WORK_NOT_APPLY.into(),
            message: format!(
                "work {} is not applied",
                work.metadata.name.as_deref().unwrap_or_default()
            ),
        };
    }

    if identifiers.is_empty() {
        // nothing to probe; applied works are taken as healthy
        return ProbeOutcome::Available;
    }

    for id in &identifiers {
        let Some(values) = works.iter().find_map(|w| w.feedback_values_for(id)) else {
            return ProbeOutcome::Unavailable {
                reason: REASON_NO_PROBE_RESULT.into(),
                message: format!(
                    "no probe result for {}/{} {}",
                    id.group, id.resource, id.name
                ),
            };
        };
        if let Err(message) = checker(id, values) {
            return ProbeOutcome::Unavailable {
                reason: REASON_PROBE_UNAVAILABLE.into(),
                message,
            };
        }
    }

    ProbeOutcome::Available
}

/// Reason string used for the Available condition when probing succeeds.
pub fn available_reason() -> &'static str {
    REASON_PROBE_AVAILABLE
}
