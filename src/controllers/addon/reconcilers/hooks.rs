use serde_json::Value;

use crate::resources::managedclusteraddons::PRE_DELETE_ANNOTATION;
use crate::resources::manifestworks::{FeedbackValue, ManifestWork, ValueType};

use super::works::resource_identifier_for;

/// Pre-delete hooks are Jobs or Pods that carry the pre-delete annotation.
pub fn is_hook_object(object: &Value) -> bool {
    let kind = object.get("kind").and_then(Value::as_str);
    if !matches!(kind, Some("Job") | Some("Pod")) {
        return false;
    }
    object
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(PRE_DELETE_ANNOTATION))
        .is_some()
}

fn boolean_value(values: &[FeedbackValue], name: &str) -> Option<bool> {
    let value = values.iter().find(|v| v.name == name)?;
    match value.field_value.r#type {
        ValueType::Boolean => value.field_value.boolean,
        _ => None,
    }
}

fn string_value<'a>(values: &'a [FeedbackValue], name: &str) -> Option<&'a str> {
    let value = values.iter().find(|v| v.name == name)?;
    match value.field_value.r#type {
        ValueType::String => value.field_value.string.as_deref(),
        _ => None,
    }
}

/// Whether every hook in the work has run to completion, judged from the
/// probe feedback the member agent reports: Jobs must report JobComplete
/// (the agent surfaces the condition as the string "True"), Pods must reach
/// the Succeeded phase.
pub fn hooks_completed(work: &ManifestWork) -> bool {
    let hooks: Vec<_> = work
        .spec
        .workload
        .manifests
        .iter()
        .filter_map(|m| {
            let kind = m.0.get("kind").and_then(Value::as_str)?;
            let id = resource_identifier_for(&m.0)?;
            Some((kind.to_string(), id))
        })
        .collect();
    if hooks.is_empty() {
        return true;
    }

    hooks.iter().all(|(kind, id)| {
        let Some(values) = work.feedback_values_for(id) else {
            return false;
        };
        match kind.as_str() {
            "Job" => {
                string_value(values, "JobComplete") == Some("True")
                    || boolean_value(values, "JobComplete").unwrap_or(false)
            }
            "Pod" => string_value(values, "PodPhase") == Some("Succeeded"),
            _ => false,
        }
    })
}
