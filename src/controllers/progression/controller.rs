use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::controllers::addon::reconcilers::configs;
use crate::controllers::{Diagnostics, State};
use crate::metrics::Metrics;
use crate::resources::clustermanagementaddons::{
    ClusterManagementAddOn, ClusterManagementAddOnStatus, DefaultConfigReference,
    InstallConfigReference, InstallProgression, PlacementStrategy,
};
use crate::resources::clusters::{PlacementDecision, PLACEMENT_LABEL};
use crate::resources::managedclusteraddons::{
    AddOnConfig, ManagedClusterAddOn, ManagedClusterAddOnSpec, CONDITION_CONFIGURED,
    CONDITION_PROGRESSING, REASON_CONFIGURATION_UNSUPPORTED, REASON_INSTALLING,
    REASON_INSTALL_SUCCEED, REASON_UPGRADE_SUCCEED, REASON_UPGRADING,
};
use crate::resources::{new_condition, set_condition, FIELD_MANAGER};
use crate::telemetry;
use crate::{Error, Result};

const REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "addon-operator".into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, cma), fields(trace_id))]
async fn reconcile(cma: Arc<ClusterManagementAddOn>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ClusterManagementAddOn>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    if cma.metadata.deletion_timestamp.is_some() {
        // instances are garbage-collected through their owner references
        return Ok(Action::await_change());
    }

    info!("Reconciling ClusterManagementAddOn {}", cma.name_any());

    match cma.reconcile_status(ctx.clone()).await {
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
                    &cma.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(cma.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_cma: Arc<ClusterManagementAddOn>, _: &Error, _ctx: Arc<Context>) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Cluster names selected by the decisions of one placement.
fn selected_clusters(decisions: &[PlacementDecision]) -> BTreeSet<String> {
    decisions
        .iter()
        .filter_map(|d| d.status.as_ref())
        .flat_map(|s| s.decisions.iter())
        .map(|d| d.cluster_name.clone())
        .collect()
}

/// The instance created for one selected cluster, owned by the descriptor so
/// descriptor deletion sweeps it away.
fn desired_instance(
    cma: &ClusterManagementAddOn,
    cluster: &str,
    strategy: &PlacementStrategy,
) -> ManagedClusterAddOn {
    let mut addon = ManagedClusterAddOn::new(
        &cma.name_any(),
        ManagedClusterAddOnSpec {
            install_namespace: String::new(),
            configs: strategy.configs.clone(),
        },
    );
    addon.metadata.namespace = Some(cluster.to_string());
    addon.metadata.owner_references = cma.controller_owner_ref(&()).map(|r| vec![r]);
    addon
}

/// Whether an instance has fully caught up with its desired configuration.
fn instance_completed(addon: &ManagedClusterAddOn) -> bool {
    let references = addon
        .status
        .as_ref()
        .and_then(|s| s.config_references.as_deref())
        .unwrap_or(&[]);
    configs::configs_applied(references)
}

/// Whether an instance flagged its configuration as unsupported.
fn instance_config_unsupported(addon: &ManagedClusterAddOn) -> bool {
    [CONDITION_PROGRESSING, CONDITION_CONFIGURED]
        .into_iter()
        .filter_map(|t| addon.condition(t))
        .any(|c| c.reason == REASON_CONFIGURATION_UNSUPPORTED)
}

/// Progressing condition summarizing one placement: "done/total" counts with
/// install vs upgrade picked from whether any instance applied a config
/// before. An unsupported configuration on any instance overrides the counts.
fn progression_condition(
    total: usize,
    completed: usize,
    upgrade: bool,
    unsupported: Option<&str>,
) -> Condition {
    if let Some(instance) = unsupported {
        return new_condition(
            CONDITION_PROGRESSING,
            "False",
            REASON_CONFIGURATION_UNSUPPORTED,
            format!("the configuration of instance {instance} is unsupported"),
        );
    }
    let done = completed == total && total > 0;
    let (status, reason, message) = match (upgrade, done) {
        (false, false) => (
            "True",
            REASON_INSTALLING,
            format!("{completed}/{total} installing"),
        ),
        (false, true) => (
            "False",
            REASON_INSTALL_SUCCEED,
            format!("{total} install completed with no errors"),
        ),
        (true, false) => (
            "True",
            REASON_UPGRADING,
            format!("{completed}/{total} upgrading"),
        ),
        (true, true) => (
            "False",
            REASON_UPGRADE_SUCCEED,
            format!("{total} upgrade completed with no errors"),
        ),
    };
    new_condition(CONDITION_PROGRESSING, status, reason, message)
}

impl ClusterManagementAddOn {
    async fn patch_status(&self, ctx: &Context, status: &ClusterManagementAddOnStatus) -> Result<()> {
        let api: Api<ClusterManagementAddOn> = Api::all(ctx.client.clone());
        let new_status = json!({
            "apiVersion": ClusterManagementAddOn::api_version(&()),
            "kind": ClusterManagementAddOn::kind(&()),
            "status": status,
        });
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch_status(&self.name_any(), &params, &Patch::Apply(new_status))
            .await?;
        Ok(())
    }

    /// The decisions of one placement strategy, read via the placement label.
    async fn placement_decisions(
        &self,
        ctx: &Context,
        strategy: &PlacementStrategy,
    ) -> Result<Vec<PlacementDecision>> {
        let api: Api<PlacementDecision> =
            Api::namespaced(ctx.client.clone(), &strategy.namespace);
        let params =
            ListParams::default().labels(&format!("{PLACEMENT_LABEL}={}", strategy.name));
        Ok(api.list(&params).await?.items)
    }

    /// Create or update the instances of the selected clusters and delete the
    /// ones pointing at clusters no placement selects anymore.
    async fn sync_instances(
        &self,
        ctx: &Context,
        per_strategy: &[(PlacementStrategy, BTreeSet<String>)],
    ) -> Result<()> {
        let name = self.name_any();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let mut selected_total = BTreeSet::new();
        for (strategy, clusters) in per_strategy {
            for cluster in clusters {
                // the first strategy selecting a cluster wins its configs
                if !selected_total.insert(cluster.clone()) {
                    continue;
                }
                let desired = desired_instance(self, cluster, strategy);
                let api: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), cluster);
                debug!(cluster = %cluster, addon = %name, "Applying placement-managed instance");
                api.patch(&name, &params, &Patch::Apply(&desired)).await?;
            }
        }

        // prune instances we own in deselected cluster namespaces
        let all: Api<ManagedClusterAddOn> = Api::all(ctx.client.clone());
        let list_params = ListParams::default().fields(&format!("metadata.name={name}"));
        let our_uid = self.metadata.uid.as_deref();
        for instance in all.list(&list_params).await? {
            let cluster = instance.cluster_name().to_string();
            if selected_total.contains(&cluster) {
                continue;
            }
            let owned = instance
                .owner_references()
                .iter()
                .any(|r| Some(r.uid.as_str()) == our_uid);
            if !owned {
                continue;
            }
            info!(cluster = %cluster, addon = %name, "Deleting deselected instance");
            let api: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), &cluster);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(err)) if err.reason == "NotFound" => {}
                Err(err) => return Err(Error::KubeError(err)),
            }
        }
        Ok(())
    }

    /// Hash the descriptor defaults so consumers can tell default rollouts apart.
    async fn default_config_references(&self, ctx: &Context) -> Result<Vec<DefaultConfigReference>> {
        let defaults: Vec<AddOnConfig> = self
            .spec
            .supported_configs
            .iter()
            .filter_map(|meta| {
                let default = meta.default_config.as_ref()?;
                Some(AddOnConfig {
                    group: meta.group.clone(),
                    resource: meta.resource.clone(),
                    namespace: default.namespace.clone(),
                    name: default.name.clone(),
                })
            })
            .collect();
        if defaults.is_empty() {
            return Ok(Vec::new());
        }

        let resolved = configs::resolve_config_references(&ctx.client, &defaults, None).await?;
        Ok(resolved
            .into_iter()
            .map(|r| DefaultConfigReference {
                group: r.group,
                resource: r.resource,
                desired_config: r.desired_config,
            })
            .collect())
    }

    /// One progression entry per placement, with "done/total" counts read from
    /// the instances' resolved configuration references.
    async fn install_progression(
        &self,
        ctx: &Context,
        strategy: &PlacementStrategy,
        clusters: &BTreeSet<String>,
    ) -> Result<InstallProgression> {
        let name = self.name_any();
        let mut completed = 0usize;
        let mut upgrade = false;
        let mut unsupported: Option<String> = None;
        let mut config_references: Vec<InstallConfigReference> = Vec::new();

        for cluster in clusters {
            let api: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), cluster);
            let Some(instance) = api.get_opt(&name).await? else {
                continue;
            };
            if instance_completed(&instance) {
                completed += 1;
            }
            if unsupported.is_none() && instance_config_unsupported(&instance) {
                unsupported = Some(format!("{cluster}/{name}"));
            }
            let references = instance
                .status
                .as_ref()
                .and_then(|s| s.config_references.as_deref())
                .unwrap_or(&[]);
            for r in references {
                if r.last_applied_config.is_some() {
                    upgrade = true;
                }
                if !config_references
                    .iter()
                    .any(|c| c.group == r.group && c.resource == r.resource)
                {
                    config_references.push(InstallConfigReference {
                        group: r.group.clone(),
                        resource: r.resource.clone(),
                        desired_config: r.desired_config.clone(),
                        last_applied_config: r.last_applied_config.clone(),
                        last_known_good_config: r.last_known_good_config.clone(),
                    });
                }
            }
        }

        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            progression_condition(clusters.len(), completed, upgrade, unsupported.as_deref()),
        );

        Ok(InstallProgression {
            name: strategy.name.clone(),
            namespace: strategy.namespace.clone(),
            config_references: (!config_references.is_empty()).then_some(config_references),
            conditions: Some(conditions),
        })
    }

    async fn reconcile_status(&self, ctx: Arc<Context>) -> Result<Action> {
        let strategies = self.placement_strategies().to_vec();

        let mut per_strategy = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let decisions = self.placement_decisions(&ctx, &strategy).await?;
            let clusters = selected_clusters(&decisions);
            per_strategy.push((strategy, clusters));
        }

        if self.manager_managed() {
            self.sync_instances(&ctx, &per_strategy).await?;
        }

        let mut progressions = Vec::with_capacity(per_strategy.len());
        for (strategy, clusters) in &per_strategy {
            progressions.push(self.install_progression(&ctx, strategy, clusters).await?);
        }

        let defaults = self.default_config_references(&ctx).await?;

        let status = ClusterManagementAddOnStatus {
            install_progressions: (!progressions.is_empty()).then_some(progressions),
            default_config_references: (!defaults.is_empty()).then_some(defaults),
        };
        self.patch_status(&ctx, &status).await?;

        Ok(Action::requeue(REQUEUE_INTERVAL))
    }
}

/// Run the descriptor controller: placement-driven instance lifecycle plus
/// progression aggregation. Instance status updates re-trigger the descriptor.
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let descriptors: Api<ClusterManagementAddOn> = Api::all(client.clone());
    if let Err(e) = descriptors.list(&ListParams::default().limit(1)).await {
        error!("ClusterManagementAddOn is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let instances: Api<ManagedClusterAddOn> = Api::all(client.clone());

    Controller::new(descriptors, Config::default())
        .shutdown_on_signal()
        .watches(instances, Config::default(), |addon| {
            Some(ObjectRef::new(&addon.name_any()))
        })
        .run(reconcile, error_policy, Context::new(client, metrics, &state))
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::resources::clustermanagementaddons::ClusterManagementAddOnSpec;
    use crate::resources::clusters::{ClusterDecision, PlacementDecisionStatus};
    use crate::resources::managedclusteraddons::{
        ConfigReference, ConfigSpecHash, ManagedClusterAddOnStatus,
    };

    fn decision(clusters: &[&str]) -> PlacementDecision {
        let mut decision = PlacementDecision::new("global-decision-1", Default::default());
        decision.status = Some(PlacementDecisionStatus {
            decisions: clusters
                .iter()
                .map(|c| ClusterDecision {
                    cluster_name: c.to_string(),
                    reason: String::new(),
                })
                .collect(),
        });
        decision
    }

    #[test]
    fn decisions_union_into_cluster_set() {
        let selected = selected_clusters(&[decision(&["c1", "c2"]), decision(&["c2", "c3"])]);
        assert_eq!(
            selected,
            BTreeSet::from(["c1".to_string(), "c2".to_string(), "c3".to_string()])
        );
    }

    #[test]
    fn desired_instances_carry_strategy_configs_and_owner() {
        let mut cma = ClusterManagementAddOn::new("test", ClusterManagementAddOnSpec::default());
        cma.metadata.uid = Some("uid-1".into());
        let strategy = PlacementStrategy {
            name: "global".into(),
            namespace: "default".into(),
            configs: Some(vec![AddOnConfig {
                group: "addon.open-cluster-management.io".into(),
                resource: "addondeploymentconfigs".into(),
                namespace: "configs".into(),
                name: "for-global".into(),
            }]),
        };

        let instance = desired_instance(&cma, "c1", &strategy);
        assert_eq!(instance.metadata.namespace.as_deref(), Some("c1"));
        assert_eq!(instance.spec.configs.as_ref().unwrap()[0].name, "for-global");
        let owners = instance.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].uid, "uid-1");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn progression_counts_map_to_reasons() {
        let c = progression_condition(3, 1, false, None);
        assert_eq!(c.reason, REASON_INSTALLING);
        assert_eq!(c.message, "1/3 installing");

        let c = progression_condition(3, 3, false, None);
        assert_eq!(c.reason, REASON_INSTALL_SUCCEED);
        assert_eq!(c.message, "3 install completed with no errors");

        let c = progression_condition(2, 1, true, None);
        assert_eq!(c.reason, REASON_UPGRADING);
        assert_eq!(c.message, "1/2 upgrading");

        let c = progression_condition(2, 2, true, None);
        assert_eq!(c.reason, REASON_UPGRADE_SUCCEED);
        assert_eq!(c.message, "2 upgrade completed with no errors");
    }

    #[test]
    fn unsupported_instance_config_overrides_progression() {
        let c = progression_condition(3, 3, false, Some("c1/test"));
        assert_eq!(c.status, "False");
        assert_eq!(c.reason, REASON_CONFIGURATION_UNSUPPORTED);
        assert!(c.message.contains("c1/test"));

        let mut addon = ManagedClusterAddOn::new("test", ManagedClusterAddOnSpec::default());
        assert!(!instance_config_unsupported(&addon));

        addon.status = Some(ManagedClusterAddOnStatus {
            conditions: Some(vec![new_condition(
                CONDITION_CONFIGURED,
                "False",
                REASON_CONFIGURATION_UNSUPPORTED,
                "the config example.com/widgets is not supported by the add-on",
            )]),
            ..Default::default()
        });
        assert!(instance_config_unsupported(&addon));
    }

    #[test]
    fn instance_completion_follows_config_references() {
        let mut addon = ManagedClusterAddOn::new("test", ManagedClusterAddOnSpec::default());
        // no configs at all counts as complete
        assert!(instance_completed(&addon));

        let desired = Some(ConfigSpecHash {
            namespace: "ns".into(),
            name: "cfg".into(),
            spec_hash: "abc".into(),
        });
        addon.status = Some(ManagedClusterAddOnStatus {
            config_references: Some(vec![ConfigReference {
                group: "addon.open-cluster-management.io".into(),
                resource: "addondeploymentconfigs".into(),
                namespace: "ns".into(),
                name: "cfg".into(),
                desired_config: desired.clone(),
                last_applied_config: None,
                last_known_good_config: None,
            }]),
            ..Default::default()
        });
        assert!(!instance_completed(&addon));

        addon
            .status
            .as_mut()
            .unwrap()
            .config_references
            .as_mut()
            .unwrap()[0]
            .last_applied_config = desired;
        assert!(instance_completed(&addon));
    }
}
