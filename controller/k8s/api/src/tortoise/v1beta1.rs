//! The first Tortoise schema. Targets are named Deployments and the
//! status records recommender observations only.

use super::{
    AutoscalingType, ContainerRecommendationFromVpa, DeletionPolicy, Recommendations,
    ResourceName, TargetStatusVerticalPodAutoscaler, TortoisePhase, UpdateMode,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "autoscaling.mercari.com/v1beta1";

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "autoscaling.mercari.com",
    version = "v1beta1",
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
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_policy: Vec<ContainerResourcePolicy>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRefs {
    pub deployment_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_pod_autoscaler_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allocated_resources: BTreeMap<ResourceName, Quantity>,
    /// Absent when the container only carries resource bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_policy: Option<BTreeMap<ResourceName, AutoscalingType>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TortoiseStatus {
    #[serde(default)]
    pub tortoise_phase: TortoisePhase,
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
    pub deployment: String,
    #[serde(default)]
    pub vertical_pod_autoscalers: Vec<TargetStatusVerticalPodAutoscaler>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    #[serde(default, rename = "containerRecommendationFromVPA")]
    pub container_recommendation_from_vpa: Vec<ContainerRecommendationFromVpa>,
}
