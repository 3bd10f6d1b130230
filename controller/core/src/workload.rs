//! The view of a scale target that the engine works from.

use crate::quantity;
use std::collections::BTreeMap;
use tortoise_k8s_api::{
    annotations, Container, Deployment, PodTemplateSpec, Quantity, ResourceName,
};

/// Requests and limits of one container, in milli-units. Malformed
/// quantities are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerResources {
    pub name: String,
    pub requests: BTreeMap<ResourceName, i64>,
    pub limits: BTreeMap<ResourceName, i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub containers: Vec<ContainerResources>,
    /// Replicas currently observed on the workload.
    pub replicas: i32,
    pub template_annotations: BTreeMap<String, String>,
}

impl Workload {
    pub fn from_deployment(deploy: &Deployment) -> Self {
        let spec = deploy.spec.as_ref();
        let replicas = deploy
            .status
            .as_ref()
            .and_then(|s| s.replicas)
            .or_else(|| spec.and_then(|s| s.replicas))
            .unwrap_or(1);
        let mut workload = spec
            .map(|s| Self::from_template(&s.template))
            .unwrap_or_default();
        workload.name = deploy.metadata.name.clone().unwrap_or_default();
        workload.replicas = replicas;
        workload
    }

    /// Reads containers from a pod template. When the template asks for
    /// istio injection a synthetic `istio-proxy` container is added with the
    /// resources given by the proxy annotations.
    pub fn from_template(template: &PodTemplateSpec) -> Self {
        let template_annotations = template
            .metadata
            .as_ref()
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();

        let mut containers: Vec<ContainerResources> = template
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(ContainerResources::from_container).collect())
            .unwrap_or_default();

        if annotations::istio_injected(&template_annotations)
            && !containers.iter().any(|c| c.name == annotations::ISTIO_PROXY_CONTAINER)
        {
            containers.push(istio_proxy(&template_annotations));
        }

        Self {
            name: String::new(),
            containers,
            replicas: 0,
            template_annotations,
        }
    }

    pub fn container(&self, name: &str) -> Option<&ContainerResources> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn request(&self, container: &str, resource: ResourceName) -> Option<i64> {
        self.container(container)?.requests.get(&resource).copied()
    }
}

impl ContainerResources {
    pub fn from_container(c: &Container) -> Self {
        let resources = c.resources.as_ref();
        Self {
            name: c.name.clone(),
            requests: parse_map(resources.and_then(|r| r.requests.as_ref())),
            limits: parse_map(resources.and_then(|r| r.limits.as_ref())),
        }
    }
}

fn parse_map(map: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<ResourceName, i64> {
    map.into_iter()
        .flatten()
        .filter_map(|(k, q)| Some((ResourceName::from_key(k)?, quantity::parse_or_warn(q)?)))
        .collect()
}

fn istio_proxy(annots: &BTreeMap<String, String>) -> ContainerResources {
    let read = |key: &str| {
        annots
            .get(key)
            .and_then(|v| quantity::parse_or_warn(&Quantity(v.clone())))
    };
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
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
        if let Some(v) = read(req_key) {
            requests.insert(resource, v);
        }
        if let Some(v) = read(lim_key) {
            limits.insert(resource, v);
        }
    }
    ContainerResources {
        name: annotations::ISTIO_PROXY_CONTAINER.to_string(),
        requests,
        limits,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use tortoise_k8s_api::{
        api::core::v1::PodSpec, DeploymentSpec, ObjectMeta, ResourceRequirements,
    };

    #[test]
    fn reads_requests_and_istio_sidecar() {
        let deploy = Deployment {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(4),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: Some(btreemap! {
                            annotations::ISTIO_SIDECAR_INJECT.to_string() => "true".to_string(),
                            annotations::ISTIO_PROXY_CPU.to_string() => "100m".to_string(),
                            annotations::ISTIO_PROXY_MEMORY_LIMIT.to_string() => "1Gi".to_string(),
                        }),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            resources: Some(ResourceRequirements {
                                requests: Some(btreemap! {
                                    "cpu".to_string() => Quantity("500m".to_string()),
                                    "memory".to_string() => Quantity("bogus".to_string()),
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let w = Workload::from_deployment(&deploy);
        assert_eq!(w.name, "app");
        assert_eq!(w.replicas, 4);
        assert_eq!(w.request("app", ResourceName::Cpu), Some(500));
        assert_eq!(w.request("app", ResourceName::Memory), None);

        let proxy = w.container(annotations::ISTIO_PROXY_CONTAINER).unwrap();
        assert_eq!(proxy.requests, btreemap! { ResourceName::Cpu => 100 });
        assert_eq!(
            proxy.limits,
            btreemap! { ResourceName::Memory => 1_073_741_824_000 }
        );
    }
}
