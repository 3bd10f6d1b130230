use super::{Admission, Mutate, Validate};
use crate::{
    core::{policy, quantity, Workload},
    k8s::{
        tortoise::ContainerAutoscalingPolicy, Api, DeletionPolicy, Deployment,
        HorizontalPodAutoscaler, Quantity, ResourceName, Tortoise, TortoiseSpec, UpdateMode,
    },
};
use anyhow::{bail, ensure, Context, Result};
use std::collections::BTreeSet;

#[async_trait::async_trait]
impl Validate<Tortoise> for Admission {
    async fn validate(self, ns: &str, new: Option<Tortoise>, old: Option<Tortoise>) -> Result<()> {
        let Some(new) = new else {
            return Ok(());
        };
        let workload = self.workload(ns, &new.spec).await?;
        validate(&new, old.as_ref(), workload.as_ref())
    }
}

#[async_trait::async_trait]
impl Mutate<Tortoise> for Admission {
    async fn mutate(self, ns: &str, t: &mut Tortoise) -> Result<()> {
        if t.spec.autoscaling_policy.is_empty() {
            return Ok(());
        }
        let Some(workload) = self.workload(ns, &t.spec).await? else {
            return Ok(());
        };
        let hpa = match t.spec.target_refs.horizontal_pod_autoscaler_name.as_ref() {
            Some(name) => {
                Api::<HorizontalPodAutoscaler>::namespaced(self.client.clone(), ns)
                    .get_opt(name)
                    .await?
            }
            None => None,
        };
        fill_policies(&mut t.spec, &workload, hpa.as_ref());
        Ok(())
    }
}

impl Admission {
    /// The Deployment a Tortoise targets, if it exists yet.
    async fn workload(&self, ns: &str, spec: &TortoiseSpec) -> Result<Option<Workload>> {
        let target = &spec.target_refs.scale_target_ref;
        if !target.is_deployment() || target.name.is_empty() {
            return Ok(None);
        }
        let deploy = Api::<Deployment>::namespaced(self.client.clone(), ns)
            .get_opt(&target.name)
            .await?;
        Ok(deploy.as_ref().map(Workload::from_deployment))
    }
}

/// Expands a partial autoscaling policy to every container and resource of
/// the workload.
pub(super) fn fill_policies(
    spec: &mut TortoiseSpec,
    workload: &Workload,
    hpa: Option<&HorizontalPodAutoscaler>,
) {
    spec.autoscaling_policy = policy::resolve(spec, workload, hpa);
}

pub(super) fn validate(
    new: &Tortoise,
    old: Option<&Tortoise>,
    workload: Option<&Workload>,
) -> Result<()> {
    let target = &new.spec.target_refs.scale_target_ref;
    ensure!(
        target.is_deployment(),
        "spec.targetRefs.scaleTargetRef.kind must be Deployment, not {:?}",
        target.kind
    );
    ensure!(
        !target.name.is_empty(),
        "spec.targetRefs.scaleTargetRef.name must be set"
    );

    if let Some(old) = old {
        let was = &old.spec.target_refs;
        ensure!(
            was.scale_target_ref.kind == target.kind && was.scale_target_ref.name == target.name,
            "spec.targetRefs.scaleTargetRef is immutable"
        );
        if was.horizontal_pod_autoscaler_name.is_some() {
            ensure!(
                was.horizontal_pod_autoscaler_name
                    == new.spec.target_refs.horizontal_pod_autoscaler_name,
                "spec.targetRefs.horizontalPodAutoscalerName is immutable once set"
            );
        }
    }

    if new.spec.update_mode == UpdateMode::Emergency && !new.phase().allows_emergency() {
        bail!(
            "emergency mode cannot be enabled while the Tortoise is {}",
            new.phase()
        );
    }

    validate_resource_policy(&new.spec)?;

    let Some(workload) = workload else {
        return Ok(());
    };
    let containers = workload
        .containers
        .iter()
        .map(|c| c.name.as_str())
        .collect::<BTreeSet<_>>();
    let named = new
        .spec
        .autoscaling_policy
        .iter()
        .map(|p| p.container_name.as_str())
        .chain(new.spec.resource_policy.iter().map(|p| p.container_name.as_str()));
    for name in named {
        ensure!(
            containers.contains(name),
            "container {name:?} is not in Deployment {}",
            workload.name
        );
    }

    if let Some(old) = old {
        let had = policy::has_horizontal(&effective(&old.spec, workload));
        let has = policy::has_horizontal(&effective(&new.spec, workload));
        let keeps_hpa = new.spec.deletion_policy == DeletionPolicy::NoDelete
            || new.spec.target_refs.horizontal_pod_autoscaler_name.is_some();
        if had && !has && keeps_hpa {
            bail!(
                "at least one resource must stay Horizontal unless deletionPolicy is DeleteAll \
                 and no HorizontalPodAutoscaler is named"
            );
        }
    }
    Ok(())
}

fn effective(spec: &TortoiseSpec, workload: &Workload) -> Vec<ContainerAutoscalingPolicy> {
    policy::resolve(spec, workload, None)
}

fn validate_resource_policy(spec: &TortoiseSpec) -> Result<()> {
    for p in &spec.resource_policy {
        let parse = |field: &str, q: Option<&Quantity>, resource: ResourceName| {
            q.map(|q| {
                quantity::parse_milli(q).with_context(|| {
                    format!("container {:?}: {field}.{resource}", p.container_name)
                })
            })
            .transpose()
        };
        for resource in ResourceName::ALL {
            let min = parse(
                "minAllocatedResources",
                p.min_allocated_resources.get(&resource),
                resource,
            )?;
            let max = parse(
                "maxAllocatedResources",
                p.max_allocated_resources.get(&resource),
                resource,
            )?;
            if let (Some(min), Some(max)) = (min, max) {
                ensure!(
                    min <= max,
                    "container {:?}: minAllocatedResources.{resource} exceeds \
                     maxAllocatedResources.{resource}",
                    p.container_name
                );
            }
        }
    }
    Ok(())
}
