//! Rewriting pod resources from a Tortoise's desired requests.

use crate::{quantity, Config};
use std::collections::BTreeMap;
use tortoise_k8s_api::{
    annotations, tortoise::ContainerResourceRequests, ObjectMeta, PodSpec, Quantity,
    ResourceName,
};

/// Scales a limit alongside its request.
///
/// The pod's existing limit:request ratio is kept unless it is below the
/// configured multiplier, in which case the multiplier is used. CPU limits
/// never drop below the configured minimum. A resource without a limit
/// stays without one.
pub fn scale_limit(
    resource: ResourceName,
    old_request: Option<i64>,
    old_limit: i64,
    new_request: i64,
    cfg: &Config,
) -> i64 {
    let multiplier = cfg.limit_multiplier(resource);
    let by_ratio = match old_request.filter(|r| *r > 0) {
        Some(old_request) => quantity::scale_ceil(new_request, old_limit, old_request),
        None => old_limit,
    };
    let mut limit = by_ratio.max(quantity::scale_ceil(new_request, multiplier, 1));
    if resource == ResourceName::Cpu {
        limit = limit.max(cfg.minimum_cpu_limit);
    }
    limit
}

fn desired_for<'a>(
    desired: &'a [ContainerResourceRequests],
    container: &str,
) -> Option<&'a BTreeMap<ResourceName, Quantity>> {
    desired
        .iter()
        .find(|d| d.container_name == container)
        .map(|d| &d.resource)
}

/// Applies `desired` requests to the containers of `spec`. Returns true
/// when anything changed.
pub fn apply_to_spec(
    spec: &mut PodSpec,
    desired: &[ContainerResourceRequests],
    cfg: &Config,
) -> bool {
    let mut changed = false;
    for container in spec.containers.iter_mut() {
        let Some(want) = desired_for(desired, &container.name) else {
            continue;
        };
        let resources = container.resources.get_or_insert_with(Default::default);
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        let mut limits = resources.limits.take().unwrap_or_default();

        for (resource, q) in want {
            let Some(new_request) = quantity::parse_or_warn(q) else {
                continue;
            };
            let key = resource.as_str();
            let old_request = requests.get(key).and_then(quantity::parse_or_warn);
            if old_request != Some(new_request) {
                requests.insert(key.to_string(), q.clone());
                changed = true;
            }

            let Some(old_limit) = limits.get(key).and_then(quantity::parse_or_warn) else {
                continue;
            };
            let new_limit = scale_limit(*resource, old_request, old_limit, new_request, cfg);
            if new_limit != old_limit {
                limits.insert(key.to_string(), quantity::format(*resource, new_limit));
                changed = true;
            }
        }

        resources.limits = (!limits.is_empty()).then_some(limits);
    }
    changed
}

/// Applies the desired `istio-proxy` requests through the sidecar
/// annotations, which the istio injector reads when it adds the proxy.
pub fn apply_to_istio_annotations(
    meta: &mut ObjectMeta,
    desired: &[ContainerResourceRequests],
    cfg: &Config,
) -> bool {
    let injected = meta
        .annotations
        .as_ref()
        .is_some_and(annotations::istio_injected);
    let Some(want) = desired_for(desired, annotations::ISTIO_PROXY_CONTAINER).filter(|_| injected)
    else {
        return false;
    };
    let annots = meta.annotations.get_or_insert_with(BTreeMap::new);

    let mut changed = false;
    for (resource, req_key, lim_key) in [
        (
            ResourceName::Cpu,
            annotations::ISTIO_PROXY_CPU,
            annotations::ISTIO_PROXY_CPU_LIMIT,
        ),
        (
            ResourceName::Memory,
            annotations::ISTIO_PROXY_MEMORY,
            annotations::ISTIO_PROXY_MEMORY_LIMIT,
        ),
    ] {
        let Some(new_request) = want.get(&resource).and_then(quantity::parse_or_warn) else {
            continue;
        };
        let read = |key: &str| {
            annots
                .get(key)
                .and_then(|v| quantity::parse_or_warn(&Quantity(v.clone())))
        };
        let old_request = read(req_key);
        let old_limit = read(lim_key);

        if old_request != Some(new_request) {
            annots.insert(req_key.to_string(), quantity::format(resource, new_request).0);
            changed = true;
        }
        if let Some(old_limit) = old_limit {
            let new_limit = scale_limit(resource, old_request, old_limit, new_request, cfg);
            if new_limit != old_limit {
                annots.insert(lim_key.to_string(), quantity::format(resource, new_limit).0);
                changed = true;
            }
        }
    }
    changed
}

/// Projects the requests the pod webhook would set for a pod template,
/// without touching limits. Used to compare against what a template
/// already asks for.
pub fn webhook_requests(
    desired: &[ContainerResourceRequests],
    container: &str,
) -> BTreeMap<ResourceName, i64> {
    desired_for(desired, container)
        .into_iter()
        .flatten()
        .filter_map(|(r, q)| Some((*r, quantity::parse_or_warn(q)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use tortoise_k8s_api::{Container, ResourceRequirements};

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn spec(
        requests: BTreeMap<String, Quantity>,
        limits: Option<BTreeMap<String, Quantity>>,
    ) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    limits,
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn desired(cpu: &str) -> Vec<ContainerResourceRequests> {
        vec![ContainerResourceRequests {
            container_name: "app".to_string(),
            resource: btreemap! { ResourceName::Cpu => q(cpu) },
        }]
    }

    fn cfg() -> Config {
        Config {
            resource_limit_multiplier: btreemap! { ResourceName::Cpu => 3 },
            minimum_cpu_limit: 50,
            ..Default::default()
        }
    }

    /// A 100m/400m container resized to 200m keeps its 4x ratio.
    #[test]
    fn preserves_the_limit_ratio() {
        let mut s = spec(
            btreemap! { "cpu".to_string() => q("100m") },
            Some(btreemap! { "cpu".to_string() => q("400m") }),
        );
        assert!(apply_to_spec(&mut s, &desired("200m"), &cfg()));
        let r = s.containers[0].resources.as_ref().unwrap();
        assert_eq!(r.requests.as_ref().unwrap()["cpu"], q("200m"));
        assert_eq!(r.limits.as_ref().unwrap()["cpu"], q("800m"));
    }

    #[test]
    fn raises_low_ratios_to_the_multiplier() {
        let mut s = spec(
            btreemap! { "cpu".to_string() => q("100m") },
            Some(btreemap! { "cpu".to_string() => q("150m") }),
        );
        apply_to_spec(&mut s, &desired("200m"), &cfg());
        let r = s.containers[0].resources.as_ref().unwrap();
        assert_eq!(r.limits.as_ref().unwrap()["cpu"], q("600m"));
    }

    #[test]
    fn enforces_the_cpu_limit_floor() {
        assert_eq!(scale_limit(ResourceName::Cpu, Some(10), 20, 5, &cfg()), 50);
        assert_eq!(scale_limit(ResourceName::Memory, Some(10), 20, 5, &cfg()), 10);
    }

    #[test]
    fn missing_limits_pass_through() {
        let mut s = spec(btreemap! { "cpu".to_string() => q("100m") }, None);
        assert!(apply_to_spec(&mut s, &desired("300m"), &cfg()));
        let r = s.containers[0].resources.as_ref().unwrap();
        assert_eq!(r.requests.as_ref().unwrap()["cpu"], q("300m"));
        assert!(r.limits.is_none());
    }

    #[test]
    fn unchanged_requests_report_no_change() {
        let mut s = spec(btreemap! { "cpu".to_string() => q("0.3") }, None);
        assert!(!apply_to_spec(&mut s, &desired("300m"), &cfg()));
    }

    #[test]
    fn istio_proxy_is_sized_through_annotations() {
        let mut meta = ObjectMeta {
            annotations: Some(btreemap! {
                annotations::ISTIO_SIDECAR_INJECT.to_string() => "true".to_string(),
                annotations::ISTIO_PROXY_CPU.to_string() => "100m".to_string(),
                annotations::ISTIO_PROXY_CPU_LIMIT.to_string() => "200m".to_string(),
            }),
            ..Default::default()
        };
        let want = vec![ContainerResourceRequests {
            container_name: annotations::ISTIO_PROXY_CONTAINER.to_string(),
            resource: btreemap! { ResourceName::Cpu => q("300m") },
        }];
        assert!(apply_to_istio_annotations(&mut meta, &want, &cfg()));
        let a = meta.annotations.unwrap();
        assert_eq!(a[annotations::ISTIO_PROXY_CPU], "300m");
        // 2x is below the 3x multiplier.
        assert_eq!(a[annotations::ISTIO_PROXY_CPU_LIMIT], "900m");
    }
}
