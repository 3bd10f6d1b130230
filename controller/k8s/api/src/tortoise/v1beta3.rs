use super::{
    ContainerAutoscalingPolicy, ContainerRecommendationFromVpa, ContainerResourcePhases,
    ContainerResourceRequests, DeletionPolicy, Recommendations, ResourceName, ScaleTargetRef,
    TargetStatusVerticalPodAutoscaler, TortoiseCondition, TortoisePhase, UpdateMode,
};
use k8s_openapi::{
    api::autoscaling::v2::HorizontalPodAutoscalerBehavior,
    apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "autoscaling.mercari.com/v1beta3";

/// Tortoise describes how a workload is autoscaled, horizontally and
/// vertically, from historical recommendations.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "autoscaling.mercari.com",
    version = "v1beta3",
    kind = "Tortoise",
    status = "TortoiseStatus",
    shortname = "tort",
    derive = "PartialEq",
    derive = "Default",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TortoiseSpec {
    pub target_refs: TargetRefs,

    #[serde(default)]
    pub update_mode: UpdateMode,

    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// Per-container scaling mode. When empty the controller derives one
    /// from the workload and the attached HorizontalPodAutoscaler.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub autoscaling_policy: Vec<ContainerAutoscalingPolicy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_policy: Vec<ContainerResourcePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_pod_autoscaler_behavior: Option<HorizontalPodAutoscalerBehavior>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRefs {
    pub scale_target_ref: ScaleTargetRef,

    /// A pre-existing HorizontalPodAutoscaler to steer. When unset the
    /// controller creates and owns `tortoise-hpa-<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_pod_autoscaler_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allocated_resources: BTreeMap<ResourceName, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allocated_resources: BTreeMap<ResourceName, Quantity>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TortoiseStatus {
    #[serde(default)]
    pub tortoise_phase: TortoisePhase,
    #[serde(default)]
    pub autoscaling_policy: Vec<ContainerAutoscalingPolicy>,
    #[serde(default)]
    pub container_resource_phases: Vec<ContainerResourcePhases>,
    #[serde(default)]
    pub targets: TargetsStatus,
    #[serde(default)]
    pub recommendations: Recommendations,
    #[serde(default)]
    pub conditions: Conditions,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetsStatus {
    #[serde(default)]
    pub horizontal_pod_autoscaler: Option<String>,
    #[serde(default)]
    pub scale_target_ref: ScaleTargetRef,
    #[serde(default)]
    pub vertical_pod_autoscalers: Vec<TargetStatusVerticalPodAutoscaler>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    #[serde(default)]
    pub tortoise_conditions: Vec<TortoiseCondition>,
    #[serde(default, rename = "containerRecommendationFromVPA")]
    pub container_recommendation_from_vpa: Vec<ContainerRecommendationFromVpa>,
    /// The requests the controller wants each container to run with. The
    /// pod webhook applies these.
    #[serde(default)]
    pub container_resource_requests: Vec<ContainerResourceRequests>,
}

impl Tortoise {
    /// Name of the HorizontalPodAutoscaler the controller creates when the
    /// spec does not reference one.
    pub fn default_hpa_name(&self) -> String {
        format!("tortoise-hpa-{}", kube::ResourceExt::name_any(self))
    }

    pub fn monitor_vpa_name(&self) -> String {
        format!("tortoise-monitor-{}", kube::ResourceExt::name_any(self))
    }

    /// The HorizontalPodAutoscaler this Tortoise steers: the one named in
    /// `spec.targetRefs`, else the one recorded in status, else the default name.
    pub fn hpa_name(&self) -> String {
        if let Some(name) = self.spec.target_refs.horizontal_pod_autoscaler_name.as_ref() {
            return name.clone();
        }
        self.status
            .as_ref()
            .and_then(|s| s.targets.horizontal_pod_autoscaler.clone())
            .unwrap_or_else(|| self.default_hpa_name())
    }

    /// True when the HorizontalPodAutoscaler was created by this Tortoise.
    pub fn owns_hpa(&self) -> bool {
        self.spec.target_refs.horizontal_pod_autoscaler_name.is_none()
    }

    pub fn phase(&self) -> TortoisePhase {
        self.status
            .as_ref()
            .map(|s| s.tortoise_phase)
            .unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
