//! Conversions between the served Tortoise versions.
//!
//! Every conversion goes through the `v1beta3` hub. Older versions can only
//! describe Deployments, so converting a hub object that targets anything
//! else fails.

use super::{v1beta1, v1beta2, v1beta3, ContainerAutoscalingPolicy, ScaleTargetRef};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{0} only supports Deployment targets, not {1}")]
    UnsupportedKind(&'static str, String),

    #[error("unsupported apiVersion {0}")]
    UnsupportedVersion(String),

    #[error("object has no apiVersion")]
    MissingApiVersion,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// === v1beta2 <-> hub ===

impl From<v1beta2::Tortoise> for v1beta3::Tortoise {
    fn from(old: v1beta2::Tortoise) -> Self {
        let v1beta2::Tortoise {
            metadata,
            spec,
            status,
        } = old;

        let autoscaling_policy = spec
            .resource_policy
            .iter()
            .filter_map(|p| {
                Some(ContainerAutoscalingPolicy {
                    container_name: p.container_name.clone(),
                    policy: p.autoscaling_policy.clone()?,
                })
            })
            .collect();
        let resource_policy = spec
            .resource_policy
            .into_iter()
            .filter(|p| {
                !p.min_allocated_resources.is_empty() || !p.max_allocated_resources.is_empty()
            })
            .map(|p| v1beta3::ContainerResourcePolicy {
                container_name: p.container_name,
                min_allocated_resources: p.min_allocated_resources,
                max_allocated_resources: p.max_allocated_resources,
            })
            .collect();

        v1beta3::Tortoise {
            metadata,
            spec: v1beta3::TortoiseSpec {
                target_refs: spec.target_refs,
                update_mode: spec.update_mode,
                deletion_policy: spec.deletion_policy,
                autoscaling_policy,
                resource_policy,
                max_replicas: spec.max_replicas,
                horizontal_pod_autoscaler_behavior: None,
            },
            status: status.map(|s| v1beta3::TortoiseStatus {
                tortoise_phase: s.tortoise_phase,
                autoscaling_policy: Vec::new(),
                container_resource_phases: s.container_resource_phases,
                targets: s.targets,
                recommendations: s.recommendations,
                conditions: s.conditions,
            }),
        }
    }
}

impl TryFrom<v1beta3::Tortoise> for v1beta2::Tortoise {
    type Error = ConversionError;

    fn try_from(hub: v1beta3::Tortoise) -> Result<Self, Self::Error> {
        let v1beta3::Tortoise {
            metadata,
            spec,
            status,
        } = hub;
        require_deployment(v1beta2::API_VERSION, &spec.target_refs.scale_target_ref)?;

        let resource_policy = merge_policies(&spec)
            .into_iter()
            .map(|(container_name, (min, max, policy))| v1beta2::ContainerResourcePolicy {
                container_name,
                min_allocated_resources: min,
                max_allocated_resources: max,
                autoscaling_policy: policy,
            })
            .collect();

        Ok(v1beta2::Tortoise {
            metadata,
            spec: v1beta2::TortoiseSpec {
                target_refs: spec.target_refs,
                update_mode: spec.update_mode,
                resource_policy,
                deletion_policy: spec.deletion_policy,
                max_replicas: spec.max_replicas,
            },
            status: status.map(|s| v1beta2::TortoiseStatus {
                tortoise_phase: s.tortoise_phase,
                container_resource_phases: s.container_resource_phases,
                targets: s.targets,
                recommendations: s.recommendations,
                conditions: s.conditions,
            }),
        })
    }
}

// === v1beta1 <-> hub ===

impl From<v1beta1::Tortoise> for v1beta3::Tortoise {
    fn from(old: v1beta1::Tortoise) -> Self {
        let v1beta1::Tortoise {
            metadata,
            spec,
            status,
        } = old;

        let autoscaling_policy = spec
            .resource_policy
            .iter()
            .filter_map(|p| {
                Some(ContainerAutoscalingPolicy {
                    container_name: p.container_name.clone(),
                    policy: p.autoscaling_policy.clone()?,
                })
            })
            .collect();
        let resource_policy = spec
            .resource_policy
            .into_iter()
            .filter(|p| !p.min_allocated_resources.is_empty())
            .map(|p| v1beta3::ContainerResourcePolicy {
                container_name: p.container_name,
                min_allocated_resources: p.min_allocated_resources,
                max_allocated_resources: BTreeMap::new(),
            })
            .collect();

        v1beta3::Tortoise {
            metadata,
            spec: v1beta3::TortoiseSpec {
                target_refs: v1beta3::TargetRefs {
                    scale_target_ref: ScaleTargetRef::deployment(&spec.target_refs.deployment_name),
                    horizontal_pod_autoscaler_name: spec.target_refs.horizontal_pod_autoscaler_name,
                },
                update_mode: spec.update_mode,
                deletion_policy: spec.deletion_policy,
                autoscaling_policy,
                resource_policy,
                max_replicas: None,
                horizontal_pod_autoscaler_behavior: None,
            },
            status: status.map(|s| v1beta3::TortoiseStatus {
                tortoise_phase: s.tortoise_phase,
                autoscaling_policy: Vec::new(),
                container_resource_phases: Vec::new(),
                targets: v1beta3::TargetsStatus {
                    horizontal_pod_autoscaler: s.targets.horizontal_pod_autoscaler,
                    scale_target_ref: if s.targets.deployment.is_empty() {
                        ScaleTargetRef::default()
                    } else {
                        ScaleTargetRef::deployment(&s.targets.deployment)
                    },
                    vertical_pod_autoscalers: s.targets.vertical_pod_autoscalers,
                },
                recommendations: s.recommendations,
                conditions: v1beta3::Conditions {
                    container_recommendation_from_vpa: s
                        .conditions
                        .container_recommendation_from_vpa,
                    ..Default::default()
                },
            }),
        }
    }
}

impl TryFrom<v1beta3::Tortoise> for v1beta1::Tortoise {
    type Error = ConversionError;

    fn try_from(hub: v1beta3::Tortoise) -> Result<Self, Self::Error> {
        let v1beta3::Tortoise {
            metadata,
            spec,
            status,
        } = hub;
        require_deployment(v1beta1::API_VERSION, &spec.target_refs.scale_target_ref)?;

        let resource_policy = merge_policies(&spec)
            .into_iter()
            .map(|(container_name, (min, _, policy))| v1beta1::ContainerResourcePolicy {
                container_name,
                min_allocated_resources: min,
                autoscaling_policy: policy,
            })
            .collect();

        Ok(v1beta1::Tortoise {
            metadata,
            spec: v1beta1::TortoiseSpec {
                target_refs: v1beta1::TargetRefs {
                    deployment_name: spec.target_refs.scale_target_ref.name,
                    horizontal_pod_autoscaler_name: spec.target_refs.horizontal_pod_autoscaler_name,
                },
                update_mode: spec.update_mode,
                resource_policy,
                deletion_policy: spec.deletion_policy,
            },
            status: status.map(|s| v1beta1::TortoiseStatus {
                tortoise_phase: s.tortoise_phase,
                targets: v1beta1::TargetsStatus {
                    horizontal_pod_autoscaler: s.targets.horizontal_pod_autoscaler,
                    deployment: s.targets.scale_target_ref.name,
                    vertical_pod_autoscalers: s.targets.vertical_pod_autoscalers,
                },
                recommendations: s.recommendations,
                conditions: v1beta1::Conditions {
                    container_recommendation_from_vpa: s
                        .conditions
                        .container_recommendation_from_vpa,
                },
            }),
        })
    }
}

type Bounds = BTreeMap<super::ResourceName, Quantity>;
type MergedPolicy = (
    Bounds,
    Bounds,
    Option<BTreeMap<super::ResourceName, super::AutoscalingType>>,
);

/// Folds the hub's separate autoscaling and resource policy lists into one
/// entry per container. Entries follow autoscaling-policy order, and
/// containers that only carry bounds come last.
fn merge_policies(spec: &v1beta3::TortoiseSpec) -> Vec<(String, MergedPolicy)> {
    let bounds = |name: &str| {
        spec.resource_policy
            .iter()
            .find(|p| p.container_name == name)
            .map(|p| {
                (
                    p.min_allocated_resources.clone(),
                    p.max_allocated_resources.clone(),
                )
            })
            .unwrap_or_default()
    };

    let mut merged = spec
        .autoscaling_policy
        .iter()
        .map(|a| {
            let (min, max) = bounds(&a.container_name);
            (a.container_name.clone(), (min, max, Some(a.policy.clone())))
        })
        .collect::<Vec<_>>();

    for p in &spec.resource_policy {
        if !merged.iter().any(|(name, _)| *name == p.container_name) {
            merged.push((
                p.container_name.clone(),
                (
                    p.min_allocated_resources.clone(),
                    p.max_allocated_resources.clone(),
                    None,
                ),
            ));
        }
    }
    merged
}

fn require_deployment(
    version: &'static str,
    target: &ScaleTargetRef,
) -> Result<(), ConversionError> {
    if target.is_deployment() {
        return Ok(());
    }
    Err(ConversionError::UnsupportedKind(version, target.kind.clone()))
}

/// Converts a serialized Tortoise of any served version to
/// `desired_api_version`.
pub fn convert(
    object: serde_json::Value,
    desired_api_version: &str,
) -> Result<serde_json::Value, ConversionError> {
    let api_version = object
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or(ConversionError::MissingApiVersion)?
        .to_string();
    if api_version == desired_api_version {
        return Ok(object);
    }

    let hub: v1beta3::Tortoise = match api_version.as_str() {
        v1beta3::API_VERSION => serde_json::from_value(object)?,
        v1beta2::API_VERSION => serde_json::from_value::<v1beta2::Tortoise>(object)?.into(),
        v1beta1::API_VERSION => serde_json::from_value::<v1beta1::Tortoise>(object)?.into(),
        _ => return Err(ConversionError::UnsupportedVersion(api_version)),
    };

    let converted = match desired_api_version {
        v1beta3::API_VERSION => serde_json::to_value(hub)?,
        v1beta2::API_VERSION => serde_json::to_value(v1beta2::Tortoise::try_from(hub)?)?,
        v1beta1::API_VERSION => serde_json::to_value(v1beta1::Tortoise::try_from(hub)?)?,
        other => return Err(ConversionError::UnsupportedVersion(other.to_string())),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests;
