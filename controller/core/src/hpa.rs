//! Reading and rewriting HorizontalPodAutoscaler specs.
//!
//! The controller and the HorizontalPodAutoscaler webhook both go through
//! [`apply`], so a user edit is overwritten with exactly what the
//! controller would have written.

use crate::{quantity, replicas, Config};
use std::collections::{BTreeMap, BTreeSet};
use tortoise_k8s_api::{
    annotations, tortoise::ScaleTargetRef, ContainerResourceMetricSource,
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerBehavior,
    HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget, ObjectMeta, Quantity, ResourceExt,
    ResourceName, Tortoise,
};

pub type Pair = (String, ResourceName);

/// What the controller wants a HorizontalPodAutoscaler to look like.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HpaPlan {
    pub min_replicas: i32,
    pub max_replicas: i32,
    /// Target utilization to write per (container, resource).
    pub targets: BTreeMap<Pair, i32>,
    /// Every pair scaled horizontally. Each must end up with a metric.
    pub horizontal: BTreeSet<Pair>,
    /// Target used for a metric added for a pair without a recommendation.
    pub initial_target: i32,
    /// Written only to HorizontalPodAutoscalers the Tortoise owns.
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
}

/// External metric name prefixes per resource, read from the
/// HorizontalPodAutoscaler's annotations.
fn prefixes(meta: &ObjectMeta) -> Vec<(ResourceName, String)> {
    let Some(annots) = meta.annotations.as_ref() else {
        return Vec::new();
    };
    [
        (ResourceName::Cpu, annotations::CONTAINER_BASED_CPU_METRIC_PREFIX),
        (ResourceName::Memory, annotations::CONTAINER_BASED_MEMORY_METRIC_PREFIX),
    ]
    .into_iter()
    .filter_map(|(r, key)| {
        let prefix = annots.get(key)?;
        (!prefix.is_empty()).then(|| (r, prefix.clone()))
    })
    .collect()
}

fn metric_pair(metric: &MetricSpec, prefixes: &[(ResourceName, String)]) -> Option<Pair> {
    if let Some(cr) = metric.container_resource.as_ref() {
        let resource = ResourceName::from_key(&cr.name)?;
        return Some((cr.container.clone(), resource));
    }
    let ext = metric.external.as_ref()?;
    prefixes.iter().find_map(|(resource, prefix)| {
        let container = ext.metric.name.strip_prefix(prefix.as_str())?;
        (!container.is_empty()).then(|| (container.to_string(), *resource))
    })
}

/// The (container, resource) pairs a HorizontalPodAutoscaler scales on.
pub fn metric_pairs(hpa: &HorizontalPodAutoscaler) -> BTreeSet<Pair> {
    let prefixes = prefixes(&hpa.metadata);
    hpa.spec
        .iter()
        .flat_map(|s| s.metrics.iter().flatten())
        .filter_map(|m| metric_pair(m, &prefixes))
        .collect()
}

/// The current target utilization for a pair, as a percentage.
pub fn current_target(
    hpa: &HorizontalPodAutoscaler,
    container: &str,
    resource: ResourceName,
) -> Option<i32> {
    let prefixes = prefixes(&hpa.metadata);
    let metric = hpa
        .spec
        .iter()
        .flat_map(|s| s.metrics.iter().flatten())
        .find(|m| {
            metric_pair(m, &prefixes)
                .is_some_and(|(c, r)| c == container && r == resource)
        })?;

    if let Some(cr) = metric.container_resource.as_ref() {
        return cr.target.average_utilization;
    }
    let value = metric.external.as_ref()?.target.value.as_ref()?;
    let milli = quantity::parse_or_warn(value)?;
    i32::try_from(milli / 1000).ok()
}

/// Replicas the HorizontalPodAutoscaler currently runs, if it has reported.
pub fn current_replicas(hpa: &HorizontalPodAutoscaler) -> Option<i32> {
    hpa.status.as_ref().and_then(|s| s.current_replicas)
}

pub fn min_replicas(hpa: &HorizontalPodAutoscaler) -> Option<i32> {
    hpa.spec.as_ref().and_then(|s| s.min_replicas)
}

/// Rewrites `hpa` to match `plan`. Returns true when anything changed.
pub fn apply(hpa: &mut HorizontalPodAutoscaler, plan: &HpaPlan, cfg: &Config) -> bool {
    let prefixes = prefixes(&hpa.metadata);
    let before = hpa.spec.clone();
    let spec = hpa.spec.get_or_insert_with(Default::default);

    spec.min_replicas = Some(plan.min_replicas);
    spec.max_replicas = plan.max_replicas;
    if let Some(behavior) = plan.behavior.as_ref() {
        spec.behavior = Some(behavior.clone());
    }

    let metrics = spec.metrics.get_or_insert_with(Vec::new);
    metrics.retain(|m| {
        if let Some(ext) = m.external.as_ref() {
            if cfg.excludes_external_metric(&ext.metric.name) {
                return false;
            }
        }
        match (m.container_resource.as_ref(), metric_pair(m, &prefixes)) {
            // Container metrics for pairs no longer scaled horizontally go.
            (Some(_), Some(pair)) => plan.horizontal.contains(&pair),
            _ => true,
        }
    });

    let mut seen = BTreeSet::new();
    for metric in metrics.iter_mut() {
        let Some(pair) = metric_pair(metric, &prefixes) else {
            continue;
        };
        if let Some(target) = plan.targets.get(&pair) {
            write_target(metric, *target);
        }
        seen.insert(pair);
    }

    for pair in plan.horizontal.difference(&seen) {
        let target = plan.targets.get(pair).copied().unwrap_or(plan.initial_target);
        metrics.push(container_resource_metric(&pair.0, pair.1, target));
    }

    before != hpa.spec
}

fn write_target(metric: &mut MetricSpec, target: i32) {
    if let Some(cr) = metric.container_resource.as_mut() {
        cr.target = MetricTarget {
            type_: "Utilization".to_string(),
            average_utilization: Some(target),
            ..Default::default()
        };
    } else if let Some(ext) = metric.external.as_mut() {
        if ext.target.type_.is_empty() {
            ext.target.type_ = "Value".to_string();
        }
        ext.target.value = Some(Quantity(target.to_string()));
    }
}

fn container_resource_metric(container: &str, resource: ResourceName, target: i32) -> MetricSpec {
    MetricSpec {
        type_: "ContainerResource".to_string(),
        container_resource: Some(ContainerResourceMetricSource {
            container: container.to_string(),
            name: resource.to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(target),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// Builds the HorizontalPodAutoscaler a Tortoise creates when it does not
/// steer an existing one.
pub fn build_owned(
    tortoise: &Tortoise,
    observed_replicas: i32,
    horizontal: &BTreeSet<Pair>,
    cfg: &Config,
) -> HorizontalPodAutoscaler {
    let min = replicas::propose(observed_replicas, cfg.min_replicas_factor)
        .max(cfg.minimum_min_replicas);
    let mut max = replicas::propose(observed_replicas, cfg.max_replicas_factor)
        .min(cfg.maximum_max_replicas);
    if let Some(limit) = tortoise.spec.max_replicas {
        max = max.min(limit);
    }
    let max = max.max(min);

    let ScaleTargetRef {
        api_version,
        kind,
        name,
    } = tortoise.spec.target_refs.scale_target_ref.clone();

    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(tortoise.default_hpa_name()),
            namespace: tortoise.namespace(),
            annotations: Some(
                [
                    (annotations::MANAGED_BY_TORTOISE.to_string(), "true".to_string()),
                    (annotations::TORTOISE_NAME.to_string(), tortoise.name_any()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(api_version.unwrap_or_else(|| "apps/v1".to_string())),
                kind,
                name,
            },
            min_replicas: Some(min),
            max_replicas: max,
            metrics: Some(
                horizontal
                    .iter()
                    .map(|(c, r)| {
                        container_resource_metric(c, *r, cfg.minimum_target_resource_utilization)
                    })
                    .collect(),
            ),
            behavior: tortoise.spec.horizontal_pod_autoscaler_behavior.clone(),
        }),
        status: None,
    }
}

/// Marks a steered HorizontalPodAutoscaler as managed by `tortoise`.
/// Returns true when annotations changed.
pub fn annotate_managed(meta: &mut ObjectMeta, tortoise: &str) -> bool {
    let annots = meta.annotations.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in [
        (annotations::MANAGED_BY_TORTOISE, "true"),
        (annotations::TORTOISE_NAME, tortoise),
    ] {
        if annots.get(k).map(String::as_str) != Some(v) {
            annots.insert(k.to_string(), v.to_string());
            changed = true;
        }
    }
    changed
}

/// Removes the annotations written by [`annotate_managed`].
pub fn strip_managed(meta: &mut ObjectMeta) -> bool {
    let Some(annots) = meta.annotations.as_mut() else {
        return false;
    };
    let a = annots.remove(annotations::MANAGED_BY_TORTOISE).is_some();
    let b = annots.remove(annotations::TORTOISE_NAME).is_some();
    a || b
}

/// The Tortoise a HorizontalPodAutoscaler is bound to, if any.
pub fn tortoise_name(hpa: &HorizontalPodAutoscaler) -> Option<&str> {
    hpa.metadata
        .annotations
        .as_ref()?
        .get(annotations::TORTOISE_NAME)
        .map(String::as_str)
}
