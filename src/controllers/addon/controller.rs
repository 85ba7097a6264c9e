use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::agent::render::render_manifests;
use crate::agent::values::{
    cluster_image_registries_values, deployment_config_values, Values,
};
use crate::agent::AgentProvider;
use crate::controllers::{Diagnostics, State};
use crate::metrics::Metrics;
use crate::resources::addondeploymentconfigs::AddOnDeploymentConfig;
use crate::resources::clustermanagementaddons::ClusterManagementAddOn;
use crate::resources::clusters::ManagedCluster;
use crate::resources::managedclusteraddons::{
    DeployMode, HealthCheck, ManagedClusterAddOn, ManagedClusterAddOnStatus,
    CONDITION_AVAILABLE, CONDITION_CONFIGURED, CONDITION_HOOK_MANIFEST_COMPLETED,
    CONDITION_HOSTING_CLUSTER_VALIDITY, CONDITION_HOSTING_MANIFEST_APPLIED,
    CONDITION_MANIFEST_APPLIED, CONDITION_PROGRESSING, HOSTING_MANIFESTS_CLEANUP_FINALIZER,
    HOSTING_PRE_DELETE_HOOK_FINALIZER, LEGACY_HOSTING_MANIFESTS_CLEANUP_FINALIZER,
    LEGACY_PRE_DELETE_HOOK_FINALIZER, MESSAGE_NO_MANIFEST, PRE_DELETE_HOOK_FINALIZER,
    REASON_CONFIGURATIONS_CONFIGURED, REASON_HOOK_COMPLETED, REASON_HOOK_NOT_COMPLETED,
    REASON_HOSTING_CLUSTER_INVALID, REASON_HOSTING_CLUSTER_VALID, REASON_INSTALLING,
    REASON_INSTALL_SUCCEED, REASON_MANIFESTS_APPLY_FAILED, REASON_MANIFEST_APPLIED,
    REASON_PROBE_UNAVAILABLE, REASON_UPGRADE_SUCCEED, REASON_UPGRADING,
    SERVER_SIDE_APPLY_ANNOTATION,
};
use crate::resources::manifestworks::{
    ManifestConfigOption, ManifestWork, ServerSideApplyConfig, UpdateStrategy,
    UpdateStrategyType, ADDON_NAMESPACE_LABEL, ADDON_NAME_LABEL,
};
use crate::resources::{new_condition, set_condition, FIELD_MANAGER};
use crate::telemetry;
use crate::{Error, Result};

use super::reconcilers::{configs, decorators, health, hooks, permissions, works};

const REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// The agent provider this controller instance deploys
    pub provider: Arc<dyn AgentProvider>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(
        client: Client,
        provider: Arc<dyn AgentProvider>,
        metrics: Metrics,
        state: &State,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "addon-operator".into()),
            provider,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, addon), fields(trace_id))]
async fn reconcile(addon: Arc<ManagedClusterAddOn>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedClusterAddOn>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!(
        "Reconciling ManagedClusterAddOn {} in cluster namespace {}",
        addon.name_any(),
        addon.cluster_name(),
    );

    let result = if addon.metadata.deletion_timestamp.is_some() {
        addon.cleanup(ctx.clone()).await
    } else {
        addon.reconcile_status(ctx.clone()).await
    };

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
                    &addon.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(addon.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_addon: Arc<K>, _: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Finalizers this controller owns, including the legacy spellings that are
/// migrated on sight.
const OWNED_FINALIZERS: &[&str] = &[
    PRE_DELETE_HOOK_FINALIZER,
    LEGACY_PRE_DELETE_HOOK_FINALIZER,
    HOSTING_PRE_DELETE_HOOK_FINALIZER,
    HOSTING_MANIFESTS_CLEANUP_FINALIZER,
    LEGACY_HOSTING_MANIFESTS_CLEANUP_FINALIZER,
];

/// Recompute the finalizer list: migrate legacy names, add what the rendered
/// output requires, drop what it no longer does. None when unchanged.
fn updated_finalizers(
    current: &[String],
    needs_hooks: bool,
    needs_hosting_cleanup: bool,
    needs_hosting_hooks: bool,
) -> Option<Vec<String>> {
    let mut list = current.to_vec();
    let mut changed = false;

    for (legacy, replacement) in [
        (LEGACY_PRE_DELETE_HOOK_FINALIZER, PRE_DELETE_HOOK_FINALIZER),
        (
            LEGACY_HOSTING_MANIFESTS_CLEANUP_FINALIZER,
            HOSTING_MANIFESTS_CLEANUP_FINALIZER,
        ),
    ] {
        if let Some(pos) = list.iter().position(|f| f == legacy) {
            list.remove(pos);
            if !list.iter().any(|f| f == replacement) {
                list.push(replacement.to_string());
            }
            changed = true;
        }
    }

    for (needed, name) in [
        (needs_hooks, PRE_DELETE_HOOK_FINALIZER),
        (needs_hosting_cleanup, HOSTING_MANIFESTS_CLEANUP_FINALIZER),
        (needs_hosting_hooks, HOSTING_PRE_DELETE_HOOK_FINALIZER),
    ] {
        let present = list.iter().any(|f| f == name);
        if needed && !present {
            list.push(name.to_string());
            changed = true;
        } else if !needed && present {
            list.retain(|f| f != name);
            changed = true;
        }
    }

    changed.then_some(list)
}

/// Progressing condition derived from the configuration lifecycle.
fn progressing_condition(was_installed: bool, completed: bool) -> Condition {
    match (was_installed, completed) {
        (false, false) => new_condition(
            CONDITION_PROGRESSING,
            "True",
            REASON_INSTALLING,
            "install in progress",
        ),
        (false, true) => new_condition(
            CONDITION_PROGRESSING,
            "False",
            REASON_INSTALL_SUCCEED,
            "install completed with no errors",
        ),
        (true, false) => new_condition(
            CONDITION_PROGRESSING,
            "True",
            REASON_UPGRADING,
            "upgrade in progress",
        ),
        (true, true) => new_condition(
            CONDITION_PROGRESSING,
            "False",
            REASON_UPGRADE_SUCCEED,
            "upgrade completed with no errors",
        ),
    }
}

/// Hosting-cluster validity and the mode the instance effectively runs in;
/// an unset or unknown hosting cluster drops the instance back to the
/// default mode instead of blocking the deploy.
fn hosting_validity(named: Option<&str>, exists: bool) -> (Condition, DeployMode) {
    match (named, exists) {
        (Some(name), true) => (
            new_condition(
                CONDITION_HOSTING_CLUSTER_VALIDITY,
                "True",
                REASON_HOSTING_CLUSTER_VALID,
                format!("hosting cluster {name} is valid"),
            ),
            DeployMode::Hosted,
        ),
        (Some(name), false) => (
            new_condition(
                CONDITION_HOSTING_CLUSTER_VALIDITY,
                "False",
                REASON_HOSTING_CLUSTER_INVALID,
                format!("hosting cluster {name} does not exist"),
            ),
            DeployMode::Default,
        ),
        (None, _) => (
            new_condition(
                CONDITION_HOSTING_CLUSTER_VALIDITY,
                "False",
                REASON_HOSTING_CLUSTER_INVALID,
                "hosting cluster annotation is not set",
            ),
            DeployMode::Default,
        ),
    }
}

/// Attach the server-side-apply strategy to each rendered object that opts
/// in through its annotation.
fn merge_apply_strategy(
    mut manifest_configs: Vec<ManifestConfigOption>,
    objects: &[serde_json::Value],
) -> Vec<ManifestConfigOption> {
    let strategy = UpdateStrategy {
        r#type: UpdateStrategyType::ServerSideApply,
        server_side_apply: Some(ServerSideApplyConfig {
            force: true,
            field_manager: None,
        }),
    };
    for object in objects {
        let requested = object
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(SERVER_SIDE_APPLY_ANNOTATION))
            .and_then(serde_json::Value::as_str)
            == Some("true");
        if !requested {
            continue;
        }
        let Some(id) = works::resource_identifier_for(object) else {
            continue;
        };
        match manifest_configs
            .iter_mut()
            .find(|c| c.resource_identifier == id)
        {
            Some(existing) => existing.update_strategy = Some(strategy.clone()),
            None => manifest_configs.push(ManifestConfigOption {
                resource_identifier: id,
                feedback_rules: None,
                update_strategy: Some(strategy.clone()),
            }),
        }
    }
    manifest_configs
}

impl ManagedClusterAddOn {
    async fn patch_finalizers(&self, ctx: &Context, finalizers: Vec<String>) -> Result<()> {
        let api: Api<ManagedClusterAddOn> =
            Api::namespaced(ctx.client.clone(), self.cluster_name());
        api.patch(
            &self.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
        )
        .await?;
        Ok(())
    }

    async fn patch_status(&self, ctx: &Context, status: &ManagedClusterAddOnStatus) -> Result<()> {
        let api: Api<ManagedClusterAddOn> =
            Api::namespaced(ctx.client.clone(), self.cluster_name());
        let new_status = json!({
            "apiVersion": ManagedClusterAddOn::api_version(&()),
            "kind": ManagedClusterAddOn::kind(&()),
            "status": status,
        });
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch_status(&self.name_any(), &params, &Patch::Apply(new_status))
            .await?;
        Ok(())
    }

    /// Resolve the configuration layers: typed deployment configs become value
    /// layers, and the agent install namespace can be overridden by them.
    async fn config_value_layers(
        &self,
        ctx: &Context,
        cluster: &ManagedCluster,
        references: &[crate::resources::managedclusteraddons::ConfigReference],
    ) -> Result<(Vec<Values>, String)> {
        let mut layers = Vec::new();
        let mut install_namespace = self.install_namespace().to_string();

        layers.push(cluster_image_registries_values(cluster)?);

        for reference in references {
            if reference.group != "addon.open-cluster-management.io"
                || reference.resource != "addondeploymentconfigs"
            {
                continue;
            }
            let api: Api<AddOnDeploymentConfig> =
                Api::namespaced(ctx.client.clone(), &reference.namespace);
            let Some(config) = api.get_opt(&reference.name).await? else {
                continue;
            };
            if let Some(ns) = &config.spec.agent_install_namespace {
                if !ns.is_empty() {
                    install_namespace = ns.clone();
                }
            }
            layers.push(deployment_config_values(&config));
        }

        Ok((layers, install_namespace))
    }

    async fn reconcile_status(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let cluster_name = self.cluster_name().to_string();
        let options = ctx.provider.options();

        let mut status = self.status.clone().unwrap_or_default();
        let mut conditions = status.conditions.take().unwrap_or_default();

        let clusters: Api<ManagedCluster> = Api::all(ctx.client.clone());
        let cluster = clusters
            .get_opt(&cluster_name)
            .await?
            .ok_or_else(|| Error::ClusterNotFound(cluster_name.clone()))?;

        let descriptors: Api<ClusterManagementAddOn> = Api::all(ctx.client.clone());
        let descriptor = descriptors.get_opt(&name).await?;

        // hosted mode needs an existing hosting cluster and provider support
        let mut mode = self.deploy_mode();
        if mode == DeployMode::Hosted && !options.hosted_mode_enabled {
            warn!("Add-on {name} does not support hosted mode; deploying in default mode");
            mode = DeployMode::Default;
        }
        let hosting_cluster = if mode == DeployMode::Hosted {
            let named = self.hosting_cluster();
            let found = match named {
                Some(hosting_name) => clusters.get_opt(hosting_name).await?,
                None => None,
            };
            let (condition, effective) = hosting_validity(named, found.is_some());
            set_condition(&mut conditions, condition);
            if effective != mode {
                warn!("Add-on {name} has no valid hosting cluster; deploying in default mode");
                mode = effective;
            }
            found
        } else {
            None
        };

        // configuration resolution
        let desired = configs::desired_configs(descriptor.as_ref(), self);
        let resolved = async {
            configs::check_supported(&desired, &options.supported_config_kinds)?;
            configs::resolve_config_references(
                &ctx.client,
                &desired,
                status.config_references.as_deref(),
            )
            .await
        }
        .await;

        let mut references = match resolved {
            Ok(references) => {
                set_condition(
                    &mut conditions,
                    new_condition(
                        CONDITION_CONFIGURED,
                        "True",
                        REASON_CONFIGURATIONS_CONFIGURED,
                        "Configurations configured",
                    ),
                );
                references
            }
            Err(err) => {
                let reason = match &err {
                    Error::ConfigurationWrong { reason, .. } => reason.clone(),
                    _ => "ConfigurationResolveFailed".into(),
                };
                set_condition(
                    &mut conditions,
                    new_condition(CONDITION_CONFIGURED, "False", &reason, err.to_string()),
                );
                status.conditions = Some(conditions);
                self.patch_status(&ctx, &status).await?;
                return Err(err);
            }
        };
        let was_installed = references
            .iter()
            .any(|r| r.last_applied_config.is_some());

        // optional gate: hold the deploy until every desired config carries a
        // resolved spec hash
        if options.config_check_enabled && !configs::configs_ready(&references) {
            debug!("Add-on {name} configurations are not all resolved yet; deferring deploy");
            status.config_references = Some(references);
            status.conditions = Some(conditions);
            self.patch_status(&ctx, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }

        let (config_values, install_namespace) = self
            .config_value_layers(&ctx, &cluster, &references)
            .await?;

        // render and decorate
        let registrations = options
            .registration
            .as_ref()
            .map(|r| (r.config_fn)(&cluster, self))
            .unwrap_or_default();

        let render_result = render_manifests(
            ctx.provider.as_ref(),
            &cluster,
            self,
            &install_namespace,
            &config_values,
        );
        let (mut objects, values) = match render_result {
            Ok(rendered) => rendered,
            Err(err) => {
                set_condition(
                    &mut conditions,
                    new_condition(
                        CONDITION_MANIFEST_APPLIED,
                        "False",
                        REASON_MANIFESTS_APPLY_FAILED,
                        format!("failed to render manifests: {err}"),
                    ),
                );
                status.conditions = Some(conditions);
                self.patch_status(&ctx, &status).await?;
                return Err(err);
            }
        };

        decorators::decorate(
            &mut objects,
            &decorators::Decorations {
                addon_name: &name,
                install_namespace: &install_namespace,
                values: &values,
                template_based: options.template_based,
                registrations: &registrations,
            },
        )?;

        let split = works::split_objects(objects, mode)?;

        // keep the finalizer set in step with what was rendered
        if let Some(finalizers) = updated_finalizers(
            &self.finalizers().to_vec(),
            !split.managed_hooks.is_empty(),
            mode == DeployMode::Hosted && !split.hosting.is_empty(),
            !split.hosting_hooks.is_empty(),
        ) {
            self.patch_finalizers(&ctx, finalizers).await?;
        }

        if let Some(registration) = &options.registration {
            permissions::apply_hub_permissions(
                &ctx.client,
                &cluster_name,
                &name,
                &registration.hub_permissions,
            )
            .await?;
        }

        // package and apply works
        let hash_map = configs::config_hash_map(&references);
        let manifest_configs = merge_apply_strategy(
            health::probe_manifest_configs(&options.prober, &split.managed),
            &split.managed,
        );
        let builder = works::WorkBuilder {
            addon: self,
            config_hashes: &hash_map,
            manifest_configs,
        };

        let works_api: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &cluster_name);
        let desired_works = builder.deploy_works(&split.managed, &cluster_name, false)?;
        let mut applied_works = Vec::with_capacity(desired_works.len());
        let mut apply_error: Option<String> = None;
        for work in &desired_works {
            match works::apply_work(&works_api, work).await {
                Ok(applied) => applied_works.push(applied),
                Err(err) => {
                    apply_error = Some(err.to_string());
                    break;
                }
            }
        }

        let mut keep: BTreeSet<String> = desired_works.iter().map(|w| w.name_any()).collect();
        keep.insert(works::hook_work_name(&name));
        works::prune_works(&works_api, &works::deploy_work_selector(&name), &keep).await?;

        // hosting-side works carry no probe rules
        let mut hosting_applied = true;
        if let Some(hosting) = &hosting_cluster {
            let hosting_name = hosting.name_any();
            let hosting_builder = works::WorkBuilder {
                addon: self,
                config_hashes: &hash_map,
                manifest_configs: Vec::new(),
            };
            let hosting_api: Api<ManifestWork> =
                Api::namespaced(ctx.client.clone(), &hosting_name);
            let desired_hosting =
                hosting_builder.deploy_works(&split.hosting, &hosting_name, true)?;
            let mut hosting_keep: BTreeSet<String> =
                desired_hosting.iter().map(|w| w.name_any()).collect();
            hosting_keep.insert(works::hosting_hook_work_name(&name, &cluster_name));

            for work in &desired_hosting {
                let applied = works::apply_work(&hosting_api, work).await?;
                if applied.applied() != Some(true) {
                    hosting_applied = false;
                }
            }
            works::prune_works(
                &hosting_api,
                &works::hosting_work_selector(&name, &cluster_name),
                &hosting_keep,
            )
            .await?;

            let condition = if split.hosting.is_empty() {
                new_condition(
                    CONDITION_HOSTING_MANIFEST_APPLIED,
                    "True",
                    REASON_MANIFEST_APPLIED,
                    MESSAGE_NO_MANIFEST,
                )
            } else if hosting_applied {
                new_condition(
                    CONDITION_HOSTING_MANIFEST_APPLIED,
                    "True",
                    REASON_MANIFEST_APPLIED,
                    "hosting manifests of addon are applied successfully",
                )
            } else {
                new_condition(
                    CONDITION_HOSTING_MANIFEST_APPLIED,
                    "False",
                    REASON_MANIFESTS_APPLY_FAILED,
                    "hosting manifests are not yet applied",
                )
            };
            set_condition(&mut conditions, condition);
        }

        // ManifestApplied
        let all_applied =
            apply_error.is_none() && applied_works.iter().all(|w| w.applied() == Some(true));
        let manifest_condition = if let Some(message) = &apply_error {
            new_condition(
                CONDITION_MANIFEST_APPLIED,
                "False",
                REASON_MANIFESTS_APPLY_FAILED,
                format!("failed to apply manifest works: {message}"),
            )
        } else if split.managed.is_empty() {
            new_condition(
                CONDITION_MANIFEST_APPLIED,
                "True",
                REASON_MANIFEST_APPLIED,
                MESSAGE_NO_MANIFEST,
            )
        } else if all_applied {
            new_condition(
                CONDITION_MANIFEST_APPLIED,
                "True",
                REASON_MANIFEST_APPLIED,
                "manifests of addon are applied successfully",
            )
        } else {
            new_condition(
                CONDITION_MANIFEST_APPLIED,
                "False",
                REASON_MANIFESTS_APPLY_FAILED,
                "manifest works are not yet applied by the agent",
            )
        };
        let manifests_applied = manifest_condition.status == "True";
        set_condition(&mut conditions, manifest_condition);

        // Available; a cluster whose own availability is unknown gives no
        // signal about the agent, so the condition is left untouched
        let mut probe_available = false;
        if cluster.available().is_some() {
            let outcome = health::probe_health(&options.prober, &split.managed, &applied_works);
            probe_available = matches!(&outcome, health::ProbeOutcome::Available);
            match outcome {
                health::ProbeOutcome::NotApplicable => {}
                health::ProbeOutcome::Available => {
                    set_condition(
                        &mut conditions,
                        new_condition(
                            CONDITION_AVAILABLE,
                            "True",
                            health::available_reason(),
                            format!("{name} add-on is available"),
                        ),
                    );
                }
                health::ProbeOutcome::Unavailable { reason, message } => {
                    set_condition(
                        &mut conditions,
                        new_condition(CONDITION_AVAILABLE, "False", &reason, message),
                    );
                    // surface probe failures distinctly from apply failures
                    if reason == REASON_PROBE_UNAVAILABLE {
                        debug!("Add-on {name} probe reported unavailable");
                    }
                }
            }
        } else {
            debug!("Cluster {cluster_name} availability is unknown; skipping health probe");
        }

        // configuration progression
        let completed = manifests_applied && hosting_applied;
        if completed {
            for reference in &mut references {
                reference.last_applied_config = reference.desired_config.clone();
                if probe_available {
                    reference.last_known_good_config = reference.desired_config.clone();
                }
            }
        }
        set_condition(
            &mut conditions,
            progressing_condition(was_installed, completed),
        );

        status.namespace = Some(install_namespace);
        status.config_references = Some(references);
        status.supported_configs = Some(options.supported_config_kinds.clone());
        status.registrations = (!registrations.is_empty()).then_some(registrations);
        status.health_check = Some(HealthCheck {
            mode: health::health_check_mode(&options.prober),
        });
        status.conditions = Some(conditions);

        self.patch_status(&ctx, &status).await?;

        Ok(Action::requeue(REQUEUE_INTERVAL))
    }

    // Finalizer cleanup: run pre-delete hooks to completion, then delete the
    // delivered works and release the finalizers.
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let cluster_name = self.cluster_name().to_string();
        let current_finalizers = self.finalizers().to_vec();
        if !current_finalizers
            .iter()
            .any(|f| OWNED_FINALIZERS.contains(&f.as_str()))
        {
            return Ok(Action::await_change());
        }

        let clusters: Api<ManagedCluster> = Api::all(ctx.client.clone());
        let cluster = clusters.get_opt(&cluster_name).await?;

        let has_hook_finalizer = current_finalizers.iter().any(|f| {
            f == PRE_DELETE_HOOK_FINALIZER || f == LEGACY_PRE_DELETE_HOOK_FINALIZER
        });

        // re-render to rebuild the hook workload; a cluster or config that is
        // already gone means the hooks cannot run anymore and are skipped
        if has_hook_finalizer {
            if let Some(cluster) = &cluster {
                match self.run_pre_delete_hooks(&ctx, cluster).await {
                    Ok(true) => {}
                    Ok(false) => return Err(Error::HookNotCompleted(name)),
                    Err(err @ Error::KubeError(_)) => return Err(err),
                    Err(err) => {
                        warn!("Skipping pre-delete hooks for {name}: {err}");
                    }
                }
            }
        }

        // delete all delivered works, hooks included
        let works_api: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &cluster_name);
        works::prune_works(
            &works_api,
            &works::deploy_work_selector(&name),
            &BTreeSet::new(),
        )
        .await?;

        let hosting_finalizers = current_finalizers.iter().any(|f| {
            f == HOSTING_MANIFESTS_CLEANUP_FINALIZER
                || f == LEGACY_HOSTING_MANIFESTS_CLEANUP_FINALIZER
                || f == HOSTING_PRE_DELETE_HOOK_FINALIZER
        });
        if hosting_finalizers {
            if let Some(hosting_name) = self.hosting_cluster() {
                let hosting_api: Api<ManifestWork> =
                    Api::namespaced(ctx.client.clone(), hosting_name);
                works::prune_works(
                    &hosting_api,
                    &works::hosting_work_selector(&name, &cluster_name),
                    &BTreeSet::new(),
                )
                .await?;
            }
        }

        let remaining: Vec<String> = current_finalizers
            .into_iter()
            .filter(|f| !OWNED_FINALIZERS.contains(&f.as_str()))
            .collect();
        self.patch_finalizers(&ctx, remaining).await?;

        Ok(Action::await_change())
    }

    /// Apply the hook work and judge completion. Returns false while hooks
    /// are still running.
    async fn run_pre_delete_hooks(&self, ctx: &Context, cluster: &ManagedCluster) -> Result<bool> {
        let name = self.name_any();
        let cluster_name = self.cluster_name().to_string();
        let options = ctx.provider.options();

        let descriptors: Api<ClusterManagementAddOn> = Api::all(ctx.client.clone());
        let descriptor = descriptors.get_opt(&name).await?;
        let desired = configs::desired_configs(descriptor.as_ref(), self);
        let references = configs::resolve_config_references(
            &ctx.client,
            &desired,
            self.status.as_ref().and_then(|s| s.config_references.as_deref()),
        )
        .await?;
        let (config_values, install_namespace) =
            self.config_value_layers(ctx, cluster, &references).await?;

        let (mut objects, values) = render_manifests(
            ctx.provider.as_ref(),
            cluster,
            self,
            &install_namespace,
            &config_values,
        )?;
        let registrations = options
            .registration
            .as_ref()
            .map(|r| (r.config_fn)(cluster, self))
            .unwrap_or_default();
        decorators::decorate(
            &mut objects,
            &decorators::Decorations {
                addon_name: &name,
                install_namespace: &install_namespace,
                values: &values,
                template_based: options.template_based,
                registrations: &registrations,
            },
        )?;

        let mode = self.deploy_mode();
        let split = works::split_objects(objects, mode)?;
        if split.managed_hooks.is_empty() {
            return Ok(true);
        }

        let hash_map = configs::config_hash_map(&references);
        let builder = works::WorkBuilder {
            addon: self,
            config_hashes: &hash_map,
            manifest_configs: Vec::new(),
        };
        let Some(hook_work) = builder.hook_work(&split.managed_hooks, &cluster_name, false)
        else {
            return Ok(true);
        };

        let works_api: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &cluster_name);
        let applied = works::apply_work(&works_api, &hook_work).await?;

        let completed = hooks::hooks_completed(&applied);
        let mut status = self.status.clone().unwrap_or_default();
        let mut conditions = status.conditions.take().unwrap_or_default();
        let condition = if completed {
            new_condition(
                CONDITION_HOOK_MANIFEST_COMPLETED,
                "True",
                REASON_HOOK_COMPLETED,
                "hook manifest is completed",
            )
        } else {
            new_condition(
                CONDITION_HOOK_MANIFEST_COMPLETED,
                "False",
                REASON_HOOK_NOT_COMPLETED,
                "hook manifest is not completed yet",
            )
        };
        set_condition(&mut conditions, condition);
        status.conditions = Some(conditions);
        self.patch_status(ctx, &status).await?;

        Ok(completed)
    }
}

/// Run one add-on controller instance for the given provider. The watcher is
/// pinned to the provider's add-on name so instances of other add-ons never
/// enter this reconciler.
pub async fn run(client: Client, provider: Arc<dyn AgentProvider>, metrics: Metrics, state: State) {
    let addon_name = provider.options().addon_name.clone();
    let addons: Api<ManagedClusterAddOn> = Api::all(client.clone());

    if let Err(e) = addons.list(&ListParams::default().limit(1)).await {
        error!("ManagedClusterAddOn is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let addon_cfg = Config::default().fields(&format!("metadata.name={addon_name}"));
    let works: Api<ManifestWork> = Api::all(client.clone());
    let works_cfg = Config::default().labels(&works::deploy_work_selector(&addon_name));

    Controller::new(addons, addon_cfg)
        .shutdown_on_signal()
        .watches(works, works_cfg, |work| {
            // map a work back to its instance; hosted works carry the add-on
            // namespace in a label
            let name = work.labels().get(ADDON_NAME_LABEL)?.clone();
            let namespace = work
                .labels()
                .get(ADDON_NAMESPACE_LABEL)
                .cloned()
                .or_else(|| work.namespace())?;
            Some(ObjectRef::new(&name).within(&namespace))
        })
        .run(
            reconcile,
            error_policy,
            Context::new(client, provider, metrics, &state),
        )
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn finalizers_track_rendered_output() {
        // fresh instance with hooks rendered
        let updated = updated_finalizers(&[], true, false, false).unwrap();
        assert_eq!(updated, vec![PRE_DELETE_HOOK_FINALIZER.to_string()]);

        // hooks disappeared from the render
        let updated =
            updated_finalizers(&[PRE_DELETE_HOOK_FINALIZER.to_string()], false, false, false)
                .unwrap();
        assert!(updated.is_empty());

        // unchanged set patches nothing
        assert!(
            updated_finalizers(&[PRE_DELETE_HOOK_FINALIZER.to_string()], true, false, false)
                .is_none()
        );
    }

    #[test]
    fn legacy_finalizers_are_migrated() {
        let current = vec![
            LEGACY_PRE_DELETE_HOOK_FINALIZER.to_string(),
            "unrelated.io/finalizer".to_string(),
        ];
        let updated = updated_finalizers(&current, true, false, false).unwrap();
        assert!(!updated.contains(&LEGACY_PRE_DELETE_HOOK_FINALIZER.to_string()));
        assert!(updated.contains(&PRE_DELETE_HOOK_FINALIZER.to_string()));
        assert!(updated.contains(&"unrelated.io/finalizer".to_string()));
    }

    #[test]
    fn progressing_condition_reflects_lifecycle() {
        let c = progressing_condition(false, false);
        assert_eq!((c.status.as_str(), c.reason.as_str()), ("True", REASON_INSTALLING));
        let c = progressing_condition(false, true);
        assert_eq!(
            (c.status.as_str(), c.reason.as_str()),
            ("False", REASON_INSTALL_SUCCEED)
        );
        let c = progressing_condition(true, false);
        assert_eq!((c.status.as_str(), c.reason.as_str()), ("True", REASON_UPGRADING));
        let c = progressing_condition(true, true);
        assert_eq!(
            (c.status.as_str(), c.reason.as_str()),
            ("False", REASON_UPGRADE_SUCCEED)
        );
    }

    #[test]
    fn apply_strategy_annotation_adds_ssa_per_object() {
        let plain = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "agent", "namespace": "agent-ns"}
        });
        let opted_in = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "agent-config",
                "namespace": "agent-ns",
                "annotations": {SERVER_SIDE_APPLY_ANNOTATION: "true"}
            }
        });

        // no object opted in: untouched
        let merged = merge_apply_strategy(Vec::new(), &[plain.clone()]);
        assert!(merged.is_empty());

        // only the annotated object gets the strategy
        let merged = merge_apply_strategy(Vec::new(), &[plain, opted_in]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].resource_identifier.resource, "configmaps");
        assert_eq!(
            merged[0].update_strategy.as_ref().unwrap().r#type,
            UpdateStrategyType::ServerSideApply
        );
    }

    #[test]
    fn invalid_hosting_cluster_falls_back_to_default_mode() {
        let (condition, mode) = hosting_validity(Some("hosting"), true);
        assert_eq!(condition.status, "True");
        assert_eq!(mode, DeployMode::Hosted);

        let (condition, mode) = hosting_validity(Some("hosting"), false);
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason, REASON_HOSTING_CLUSTER_INVALID);
        assert_eq!(mode, DeployMode::Default);

        let (condition, mode) = hosting_validity(None, false);
        assert_eq!(condition.status, "False");
        assert_eq!(mode, DeployMode::Default);
    }
}
