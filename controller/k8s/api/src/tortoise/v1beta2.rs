//! The second Tortoise schema. Autoscaling policy lives inside each
//! container's resource policy and only Deployments can be targeted.

use super::{
    v1beta3::{Conditions, TargetRefs, TargetsStatus},
    AutoscalingType, ContainerResourcePhases, DeletionPolicy, Recommendations, ResourceName,
    TortoisePhase, UpdateMode,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "autoscaling.mercari.com/v1beta2";

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "autoscaling.mercari.com",
    version = "v1beta2",
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allocated_resources: BTreeMap<ResourceName, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allocated_resources: BTreeMap<ResourceName, Quantity>,
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
    pub container_resource_phases: Vec<ContainerResourcePhases>,
    #[serde(default)]
    pub targets: TargetsStatus,
    #[serde(default)]
    pub recommendations: Recommendations,
    #[serde(default)]
    pub conditions: Conditions,
}
