//! A typed subset of the `autoscaling.k8s.io/v1` VerticalPodAutoscaler.
//!
//! Tortoise only runs VPAs as recommenders (`updateMode: Off`), so only the
//! fields it writes or reads are modeled. Unknown fields are dropped on
//! deserialization and never written back.

use crate::tortoise::ResourceName;
use k8s_openapi::{
    api::autoscaling::v1::CrossVersionObjectReference,
    apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RECOMMENDATION_PROVIDED: &str = "RecommendationProvided";

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1",
    kind = "VerticalPodAutoscaler",
    status = "VerticalPodAutoscalerStatus",
    derive = "PartialEq",
    derive = "Default",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerSpec {
    pub target_ref: CrossVersionObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<VpaUpdateMode>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum VpaUpdateMode {
    Off,
    Initial,
    Recreate,
    Auto,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controlled_resources: Vec<ResourceName>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allowed: BTreeMap<ResourceName, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allowed: BTreeMap<ResourceName, Quantity>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendedPodResources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VerticalPodAutoscalerCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPodResources {
    #[serde(default)]
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

/// Resource keys other than cpu and memory are ignored.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    pub container_name: String,
    #[serde(default)]
    pub target: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub upper_bound: BTreeMap<String, Quantity>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerticalPodAutoscaler {
    /// A VPA is ready once it reports a `RecommendationProvided` condition
    /// with status `True`.
    pub fn recommendation_provided(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == RECOMMENDATION_PROVIDED && c.status == "True")
        })
    }

    /// The per-container samples the recommender currently offers. The
    /// upper bound is preferred and the target is used when it is absent.
    pub fn samples(&self) -> BTreeMap<String, BTreeMap<ResourceName, Quantity>> {
        let mut out = BTreeMap::new();
        let Some(rec) = self.status.as_ref().and_then(|s| s.recommendation.as_ref()) else {
            return out;
        };
        for c in &rec.container_recommendations {
            let mut resources = BTreeMap::new();
            for name in ResourceName::ALL {
                let q = c
                    .upper_bound
                    .get(name.as_str())
                    .or_else(|| c.target.get(name.as_str()));
                if let Some(q) = q {
                    resources.insert(name, q.clone());
                }
            }
            out.insert(c.container_name.clone(), resources);
        }
        out
    }
}
