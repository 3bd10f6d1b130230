//! The Tortoise reconciler.
//!
//! Each reconciliation reads the workload, its HorizontalPodAutoscaler and
//! its monitor VerticalPodAutoscaler, runs the planning engine and writes
//! the results back. Planning is pure; everything here is I/O.

use crate::{
    core::{
        conditions,
        engine::{self, Notice, NoticeType, Snapshot},
        hpa, policy, Config, Workload, CONTROLLER_NAME,
    },
    k8s::{
        annotations,
        tortoise::{TortoiseConditionType, TortoiseCondition},
        vpa::{self, VerticalPodAutoscalerSpec},
        Api, AutoscalingType, Client, DeletionPolicy, Deployment, HorizontalPodAutoscaler,
        Patch, PatchParams, PostParams, Resource, ResourceExt, Tortoise, TortoiseStatus,
        VerticalPodAutoscaler,
    },
    metrics::Metrics,
    retry, Error, Result,
};
use chrono::{DateTime, Utc};
use futures::prelude::*;
use k8s_openapi::api::autoscaling::v1::CrossVersionObjectReference;
use kube::runtime::{
    controller::{Action, Config as ControllerConfig, Controller},
    events::{Event, EventType, Recorder, Reporter},
    finalizer::{finalizer, Event as Finalizer},
    watcher,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, info_span, warn, Instrument};

pub(crate) const FINALIZER: &str = "tortoise.autoscaling.mercari.com/finalizer";

pub(crate) struct Context {
    client: Client,
    config: Arc<Config>,
    recorder: Recorder,
    metrics: Metrics,
    vpa_available: bool,
    last_reconciled: Mutex<HashMap<(String, String), Instant>>,
}

// === impl Context ===

impl Context {
    pub(crate) fn new(
        client: Client,
        config: Arc<Config>,
        metrics: Metrics,
        vpa_available: bool,
    ) -> Arc<Self> {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Arc::new(Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            config,
            metrics,
            vpa_available,
            last_reconciled: Default::default(),
        })
    }

    /// Time left before `key` may be reconciled again, if any.
    fn throttled(&self, key: &(String, String)) -> Option<Duration> {
        let interval = self.config.tortoise_update_interval;
        let last = *self.last_reconciled.lock().get(key)?;
        interval.checked_sub(last.elapsed()).filter(|d| !d.is_zero())
    }

    fn mark_reconciled(&self, key: (String, String)) {
        self.last_reconciled.lock().insert(key, Instant::now());
    }

    fn forget(&self, key: &(String, String)) {
        self.last_reconciled.lock().remove(key);
        self.metrics.forget(&key.0, &key.1);
    }

    async fn publish(&self, tortoise: &Tortoise, notice: &Notice) {
        let event = Event {
            type_: match notice.type_ {
                NoticeType::Normal => EventType::Normal,
                NoticeType::Warning => EventType::Warning,
            },
            reason: notice.reason.to_string(),
            note: (!notice.note.is_empty()).then(|| notice.note.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, &tortoise.object_ref(&())).await {
            warn!(%error, reason = %notice.reason, "Failed to publish event");
        }
    }
}

pub(crate) async fn run(ctx: Arc<Context>, concurrency: usize, drain: drain::Watch) {
    let tortoises = Api::<Tortoise>::all(ctx.client.clone());
    Controller::new(tortoises, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(concurrency as u16))
        .graceful_shutdown_on(async move {
            let _release = drain.signaled().await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(ns = ?obj.namespace, name = %obj.name, "Reconciled"),
                Err(error) => warn!(%error, "Reconciliation failed"),
            }
        })
        .await;
    info!("Controller stopped");
}

async fn reconcile(tortoise: Arc<Tortoise>, ctx: Arc<Context>) -> Result<Action> {
    let ns = tortoise.namespace().ok_or(Error::MissingNamespace)?;
    let name = tortoise.name_any();
    let api = Api::<Tortoise>::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER, tortoise, |event| async move {
        match event {
            Finalizer::Apply(t) => apply(t, &ctx).await,
            Finalizer::Cleanup(t) => cleanup(t, &ctx).await,
        }
    })
    .instrument(info_span!("reconcile", %ns, %name))
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(_: Arc<Tortoise>, _: &Error, ctx: Arc<Context>) -> Action {
    Action::requeue(ctx.config.tortoise_update_interval)
}

async fn apply(tortoise: Arc<Tortoise>, ctx: &Context) -> Result<Action> {
    let ns = tortoise.namespace().ok_or(Error::MissingNamespace)?;
    let name = tortoise.name_any();
    let key = (ns.clone(), name.clone());
    if let Some(wait) = ctx.throttled(&key) {
        debug!(?wait, "Reconciled recently");
        return Ok(Action::requeue(wait));
    }

    let now = Utc::now();
    let api = Api::<Tortoise>::namespaced(ctx.client.clone(), &ns);
    match sync(&tortoise, &ns, ctx, now).await {
        Ok(()) => {
            ctx.mark_reconciled(key);
            ctx.metrics.reconciled();
            Ok(Action::requeue(ctx.config.tortoise_update_interval))
        }
        Err(error) => {
            warn!(%error, "Failed to reconcile");
            ctx.metrics.failed();
            let mut conds = tortoise
                .status
                .as_ref()
                .map(|s| s.conditions.tortoise_conditions.clone())
                .unwrap_or_default();
            conditions::set(
                &mut conds,
                TortoiseConditionType::FailedToReconcile,
                true,
                error.reason(),
                error.to_string(),
                now,
            );
            if let Err(error) = patch_conditions(&api, &name, &conds).await {
                warn!(%error, "Failed to record reconciliation failure");
            }
            Err(error)
        }
    }
}

async fn sync(t: &Tortoise, ns: &str, ctx: &Context, now: DateTime<Utc>) -> Result<()> {
    let name = t.name_any();
    let cfg = &*ctx.config;

    let target = &t.spec.target_refs.scale_target_ref;
    if !target.is_deployment() {
        return Err(crate::core::Error::UnsupportedTarget(target.kind.clone()).into());
    }
    let deploys = Api::<Deployment>::namespaced(ctx.client.clone(), ns);
    let deploy = deploys
        .get_opt(&target.name)
        .await?
        .ok_or_else(|| Error::MissingObject {
            kind: "Deployment",
            namespace: ns.to_string(),
            name: target.name.clone(),
        })?;
    let workload = Workload::from_deployment(&deploy);

    let hpas = Api::<HorizontalPodAutoscaler>::namespaced(ctx.client.clone(), ns);
    let mut hpa = hpas.get_opt(&t.hpa_name()).await?;
    let policies = policy::resolve(&t.spec, &workload, hpa.as_ref());

    match hpa.as_mut() {
        None if t.owns_hpa() && policy::has_horizontal(&policies) => {
            let horizontal = policy::pairs_with(&policies, AutoscalingType::Horizontal)
                .collect::<BTreeSet<_>>();
            let owned = hpa::build_owned(t, workload.replicas, &horizontal, cfg);
            let created = hpas.create(&PostParams::default(), &owned).await?;
            info!(hpa = %created.name_any(), "Created HorizontalPodAutoscaler");
            ctx.publish(t, &Notice::normal("HPACreated", format!("Created {}", created.name_any())))
                .await;
            hpa = Some(created);
        }
        None if !t.owns_hpa() => {
            return Err(Error::MissingObject {
                kind: "HorizontalPodAutoscaler",
                namespace: ns.to_string(),
                name: t.hpa_name(),
            });
        }
        Some(h) if !t.owns_hpa() => {
            if hpa::annotate_managed(&mut h.metadata, &name) {
                let patch = serde_json::json!({
                    "metadata": { "annotations": h.metadata.annotations },
                });
                hpas.patch(&h.name_any(), &PatchParams::default(), &Patch::Merge(patch))
                    .await?;
            }
        }
        _ => {}
    }

    let vpa = if ctx.vpa_available {
        let vpas = Api::<VerticalPodAutoscaler>::namespaced(ctx.client.clone(), ns);
        match vpas.get_opt(&t.monitor_vpa_name()).await? {
            Some(vpa) => Some(vpa),
            None => {
                let created = vpas
                    .create(&PostParams::default(), &monitor_vpa(t, ns))
                    .await?;
                let note = format!("Created {}", created.name_any());
                ctx.publish(t, &Notice::normal("VPACreated", note)).await;
                Some(created)
            }
        }
    } else {
        None
    };

    let plan = engine::plan(
        Snapshot {
            tortoise: t,
            workload: &workload,
            hpa: hpa.as_ref(),
            vpa: vpa.as_ref(),
        },
        now,
        cfg,
    );
    ctx.metrics.observe(ns, &name, &plan.proposals);
    ctx.metrics
        .set_state(ns, &name, plan.status.tortoise_phase, t.spec.update_mode);

    let api = Api::<Tortoise>::namespaced(ctx.client.clone(), ns);
    patch_status(&api, &name, &plan.status).await?;
    for notice in &plan.notices {
        ctx.publish(t, notice).await;
    }

    let mut status = plan.status;
    let mut wrote = false;

    if let (Some(want), Some(current)) = (plan.hpa.as_ref(), hpa.as_ref()) {
        let hpa_name = current.name_any();
        let (hpas, hpa_name) = (&hpas, hpa_name.as_str());
        let changed = retry::on_conflict("HorizontalPodAutoscaler", move || async move {
            let mut current = hpas.get(hpa_name).await?;
            if !hpa::apply(&mut current, want, cfg) {
                return Ok(false);
            }
            hpas.replace(hpa_name, &PostParams::default(), &current).await?;
            Ok(true)
        })
        .await?;
        if changed {
            info!(
                hpa = %hpa_name,
                min = want.min_replicas,
                max = want.max_replicas,
                "Updated HorizontalPodAutoscaler"
            );
            ctx.publish(t, &Notice::normal("HPAUpdated", format!("Updated {hpa_name}")))
                .await;
        }
        conditions::set(
            &mut status.conditions.tortoise_conditions,
            TortoiseConditionType::HpaTargetUtilizationUpdated,
            true,
            "HPATargetUtilizationUpdated",
            "HPA target utilization is updated",
            now,
        );
        wrote = true;
    }

    if let (Some(resource_policy), Some(current)) = (plan.vpa_policy, vpa.as_ref()) {
        let want = Some(resource_policy);
        if current.spec.resource_policy != want {
            let vpas = Api::<VerticalPodAutoscaler>::namespaced(ctx.client.clone(), ns);
            let patch = serde_json::json!({ "spec": { "resourcePolicy": want } });
            vpas.patch(&current.name_any(), &PatchParams::default(), &Patch::Merge(patch))
                .await?;
        }
        conditions::set(
            &mut status.conditions.tortoise_conditions,
            TortoiseConditionType::VerticalRecommendationUpdated,
            true,
            "VerticalRecommendationUpdated",
            "The recommendation is provided",
            now,
        );
        wrote = true;
    }

    if wrote {
        patch_status(&api, &name, &status).await?;
    }
    Ok(())
}

async fn cleanup(tortoise: Arc<Tortoise>, ctx: &Context) -> Result<Action> {
    let ns = tortoise.namespace().ok_or(Error::MissingNamespace)?;
    let name = tortoise.name_any();
    let hpas = Api::<HorizontalPodAutoscaler>::namespaced(ctx.client.clone(), &ns);

    if let Some(hpa_name) = tortoise.spec.target_refs.horizontal_pod_autoscaler_name.as_ref() {
        if let Some(mut h) = hpas.get_opt(hpa_name).await? {
            if hpa::strip_managed(&mut h.metadata) {
                let removed = [annotations::MANAGED_BY_TORTOISE, annotations::TORTOISE_NAME]
                    .into_iter()
                    .map(|k| (k.to_string(), serde_json::Value::Null))
                    .collect::<serde_json::Map<_, _>>();
                let patch = serde_json::json!({ "metadata": { "annotations": removed } });
                hpas.patch(hpa_name, &PatchParams::default(), &Patch::Merge(patch))
                    .await?;
            }
        }
    }

    if tortoise.spec.deletion_policy == DeletionPolicy::DeleteAll {
        if tortoise.owns_hpa() {
            let hpa_name = tortoise.default_hpa_name();
            if delete(&hpas, &hpa_name).await? {
                info!(hpa = %hpa_name, "Deleted HorizontalPodAutoscaler");
                ctx.publish(&tortoise, &Notice::normal("HPADeleted", format!("Deleted {hpa_name}")))
                    .await;
            }
        }
        if ctx.vpa_available {
            let vpas = Api::<VerticalPodAutoscaler>::namespaced(ctx.client.clone(), &ns);
            delete(&vpas, &tortoise.monitor_vpa_name()).await?;
        }
    }

    ctx.forget(&(ns, name));
    Ok(Action::await_change())
}

/// Deletes `name`, returning false when it was already gone.
async fn delete<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(true),
        Err(error) if retry::is_not_found(&error) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn monitor_vpa(t: &Tortoise, ns: &str) -> VerticalPodAutoscaler {
    let target = &t.spec.target_refs.scale_target_ref;
    let mut vpa = VerticalPodAutoscaler::new(
        &t.monitor_vpa_name(),
        VerticalPodAutoscalerSpec {
            target_ref: CrossVersionObjectReference {
                api_version: Some(
                    target
                        .api_version
                        .clone()
                        .unwrap_or_else(|| "apps/v1".to_string()),
                ),
                kind: target.kind.clone(),
                name: target.name.clone(),
            },
            update_policy: Some(vpa::UpdatePolicy {
                update_mode: Some(vpa::VpaUpdateMode::Off),
            }),
            resource_policy: None,
        },
    );
    vpa.metadata.namespace = Some(ns.to_string());
    vpa.metadata.annotations = Some(
        [
            (annotations::MANAGED_BY_TORTOISE.to_string(), "true".to_string()),
            (annotations::TORTOISE_NAME.to_string(), t.name_any()),
        ]
        .into_iter()
        .collect(),
    );
    vpa
}

fn make_patch(status: &TortoiseStatus) -> Patch<serde_json::Value> {
    Patch::Merge(serde_json::json!({ "status": status }))
}

async fn patch_status(api: &Api<Tortoise>, name: &str, status: &TortoiseStatus) -> Result<()> {
    api.patch_status(name, &PatchParams::default(), &make_patch(status))
        .await?;
    Ok(())
}

async fn patch_conditions(
    api: &Api<Tortoise>,
    name: &str,
    conds: &[TortoiseCondition],
) -> Result<()> {
    let patch = serde_json::json!({
        "status": { "conditions": { "tortoiseConditions": conds } },
    });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::tortoise::{v1beta3::TargetRefs, ScaleTargetRef};
    use crate::k8s::TortoiseSpec;

    #[test]
    fn monitor_vpa_only_recommends() {
        let mut t = Tortoise::new(
            "web",
            TortoiseSpec {
                target_refs: TargetRefs {
                    scale_target_ref: ScaleTargetRef::deployment("web"),
                    horizontal_pod_autoscaler_name: None,
                },
                ..Default::default()
            },
        );
        t.metadata.namespace = Some("prod".to_string());

        let vpa = monitor_vpa(&t, "prod");
        assert_eq!(vpa.metadata.name.as_deref(), Some("tortoise-monitor-web"));
        assert_eq!(vpa.metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(vpa.spec.target_ref.kind, "Deployment");
        assert_eq!(vpa.spec.target_ref.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(
            vpa.spec.update_policy.and_then(|p| p.update_mode),
            Some(vpa::VpaUpdateMode::Off)
        );
    }

    #[test]
    fn status_patches_merge_the_whole_status() {
        let status = TortoiseStatus::default();
        match make_patch(&status) {
            Patch::Merge(v) => assert_eq!(v["status"]["tortoisePhase"], "Initializing"),
            _ => panic!("expected a merge patch"),
        }
    }
}
