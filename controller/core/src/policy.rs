//! Resolving the effective per-container autoscaling policy.

use crate::{hpa, workload::Workload};
use std::collections::BTreeMap;
use tortoise_k8s_api::{
    tortoise::ContainerAutoscalingPolicy, AutoscalingType, HorizontalPodAutoscaler, ResourceName,
    TortoiseSpec,
};

/// Resolves one entry per workload container. For each resource:
///
/// 1. the user's choice wins;
/// 2. a resource without a request is `Off`;
/// 3. a resource the steered HorizontalPodAutoscaler scales on is
///    `Horizontal`;
/// 4. otherwise CPU is `Horizontal` and memory is `Vertical`.
pub fn resolve(
    spec: &TortoiseSpec,
    workload: &Workload,
    hpa: Option<&HorizontalPodAutoscaler>,
) -> Vec<ContainerAutoscalingPolicy> {
    let steered_pairs = match (spec.target_refs.horizontal_pod_autoscaler_name.is_some(), hpa) {
        (true, Some(hpa)) => hpa::metric_pairs(hpa),
        _ => Default::default(),
    };

    workload
        .containers
        .iter()
        .map(|c| {
            let user = spec
                .autoscaling_policy
                .iter()
                .find(|p| p.container_name == c.name)
                .map(|p| &p.policy);

            let policy = ResourceName::ALL
                .into_iter()
                .map(|resource| {
                    let t = if let Some(t) = user.and_then(|u| u.get(&resource)) {
                        *t
                    } else if !c.requests.contains_key(&resource) {
                        AutoscalingType::Off
                    } else if steered_pairs.contains(&(c.name.clone(), resource)) {
                        AutoscalingType::Horizontal
                    } else {
                        default_for(resource)
                    };
                    (resource, t)
                })
                .collect::<BTreeMap<_, _>>();

            ContainerAutoscalingPolicy {
                container_name: c.name.clone(),
                policy,
            }
        })
        .collect()
}

fn default_for(resource: ResourceName) -> AutoscalingType {
    match resource {
        ResourceName::Cpu => AutoscalingType::Horizontal,
        ResourceName::Memory => AutoscalingType::Vertical,
    }
}

/// The policy for a pair, `Off` when unknown.
pub fn lookup(
    policies: &[ContainerAutoscalingPolicy],
    container: &str,
    resource: ResourceName,
) -> AutoscalingType {
    policies
        .iter()
        .find(|p| p.container_name == container)
        .and_then(|p| p.policy.get(&resource).copied())
        .unwrap_or_default()
}

/// Every (container, resource) pair with the given policy.
pub fn pairs_with(
    policies: &[ContainerAutoscalingPolicy],
    wanted: AutoscalingType,
) -> impl Iterator<Item = hpa::Pair> + '_ {
    policies.iter().flat_map(move |p| {
        p.policy
            .iter()
            .filter(move |(_, t)| **t == wanted)
            .map(move |(r, _)| (p.container_name.clone(), *r))
    })
}

pub fn has_horizontal(policies: &[ContainerAutoscalingPolicy]) -> bool {
    pairs_with(policies, AutoscalingType::Horizontal).next().is_some()
}
