use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub mod addondeploymentconfigs;
pub mod addontemplates;
pub mod clustermanagementaddons;
pub mod clusters;
pub mod managedclusteraddons;
pub mod manifestworks;

/// Field manager used for every server-side apply this operator performs.
pub static FIELD_MANAGER: &str = "addon-operator";

pub fn new_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
) -> Condition {
    Condition {
        type_: condition_type.into(),
        status: status.into(),
        reason: reason.into(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// Merge a condition into a list, keeping lastTransitionTime when the status
/// did not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(
    conditions: Option<&'a [Condition]>,
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions?.iter().find(|c| c.type_ == condition_type)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            new_condition("Applied", "True", "AddonManifestApplied", ""),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            new_condition("Applied", "True", "AddonManifestApplied", "still fine"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message, "still fine");

        set_condition(
            &mut conditions,
            new_condition("Applied", "False", "ManifestsApplyFailed", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
    }
}
