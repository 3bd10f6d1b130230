//! The Tortoise custom resource.
//!
//! Three versions are served. `v1beta3` is the hub: every other version
//! converts through it (see [`conversion`]). Types that did not change
//! shape between versions live here and are shared by all of them.

pub mod conversion;
pub mod v1beta1;
pub mod v1beta2;
pub mod v1beta3;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

pub const GROUP: &str = "autoscaling.mercari.com";

/// A compute resource that Tortoise sizes.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ResourceName {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "memory")]
    Memory,
}

impl ResourceName {
    pub const ALL: [ResourceName; 2] = [ResourceName::Cpu, ResourceName::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "cpu" => Some(Self::Cpu),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a (container, resource) pair is scaled.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum AutoscalingType {
    #[default]
    Off,
    Horizontal,
    Vertical,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum UpdateMode {
    /// Recommendations are computed but never applied.
    #[default]
    Off,
    Auto,
    /// Pins the replica floor to the replica ceiling.
    Emergency,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum DeletionPolicy {
    DeleteAll,
    #[default]
    NoDelete,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum TortoisePhase {
    #[default]
    Initializing,
    GatheringData,
    PartlyWorking,
    Working,
    Emergency,
    BackToNormal,
}

impl TortoisePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::GatheringData => "GatheringData",
            Self::PartlyWorking => "PartlyWorking",
            Self::Working => "Working",
            Self::Emergency => "Emergency",
            Self::BackToNormal => "BackToNormal",
        }
    }

    /// Phases from which emergency mode may be entered.
    pub fn allows_emergency(&self) -> bool {
        matches!(
            self,
            Self::Working | Self::PartlyWorking | Self::Emergency | Self::BackToNormal
        )
    }
}

impl fmt::Display for TortoisePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "Off",
            Self::Auto => "Auto",
            Self::Emergency => "Emergency",
        })
    }
}

/// Sub-phase of a single (container, resource) pair.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ContainerResourcePhase {
    #[default]
    GatheringData,
    Working,
    Off,
}

/// The workload a Tortoise scales. Only `Deployment` is supported.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

impl ScaleTargetRef {
    pub const DEPLOYMENT: &'static str = "Deployment";

    pub fn deployment(name: impl ToString) -> Self {
        Self {
            api_version: Some("apps/v1".to_string()),
            kind: Self::DEPLOYMENT.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_deployment(&self) -> bool {
        self.kind == Self::DEPLOYMENT
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAutoscalingPolicy {
    pub container_name: String,
    #[serde(default)]
    pub policy: BTreeMap<ResourceName, AutoscalingType>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePhase {
    pub phase: ContainerResourcePhase,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePhases {
    pub container_name: String,
    #[serde(default)]
    pub resource_phases: BTreeMap<ResourceName, ResourcePhase>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
    #[serde(default)]
    pub horizontal: HorizontalRecommendations,
    #[serde(default)]
    pub vertical: VerticalRecommendations,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRecommendations {
    #[serde(default)]
    pub target_utilizations: Vec<HpaTargetUtilizationRecommendationPerContainer>,
    #[serde(default)]
    pub min_replicas: Vec<ReplicasRecommendation>,
    #[serde(default)]
    pub max_replicas: Vec<ReplicasRecommendation>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HpaTargetUtilizationRecommendationPerContainer {
    pub container_name: String,
    #[serde(default)]
    pub target_utilization: BTreeMap<ResourceName, i32>,
}

/// One slot of the weekly replica table: hours `[from, to)` of `weekday`
/// (every day when `weekday` is unset) in `timeZone`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasRecommendation {
    pub from: u32,
    pub to: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<String>,
    pub time_zone: String,
    pub value: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticalRecommendations {
    #[serde(default)]
    pub container_resource_recommendation: Vec<RecommendedContainerResources>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    pub container_name: String,
    #[serde(default)]
    pub recommended_resource: BTreeMap<ResourceName, Quantity>,
}

/// A sample from the vertical recommender.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantity {
    pub quantity: Quantity,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecommendationFromVpa {
    pub container_name: String,
    /// The latest sample per resource.
    #[serde(default)]
    pub recommendation: BTreeMap<ResourceName, ResourceQuantity>,
    /// The largest sample seen within the last week per resource.
    #[serde(default)]
    pub max_recommendation: BTreeMap<ResourceName, ResourceQuantity>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourceRequests {
    pub container_name: String,
    #[serde(default)]
    pub resource: BTreeMap<ResourceName, Quantity>,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum TortoiseConditionType {
    FailedToReconcile,
    #[serde(rename = "HPATargetUtilizationUpdated")]
    HpaTargetUtilizationUpdated,
    VerticalRecommendationUpdated,
    ScaledUpBasedOnPreferredMaxReplicas,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b {
            Self::True
        } else {
            Self::False
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TortoiseCondition {
    #[serde(rename = "type")]
    pub type_: TortoiseConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_update_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum VerticalPodAutoscalerRole {
    #[default]
    Monitor,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatusVerticalPodAutoscaler {
    pub name: String,
    pub role: VerticalPodAutoscalerRole,
}
