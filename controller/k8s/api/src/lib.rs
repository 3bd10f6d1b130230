#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod duration;
pub mod tortoise;
pub mod vpa;

pub use self::{
    duration::GoDuration,
    tortoise::{
        v1beta3::{Tortoise, TortoiseSpec, TortoiseStatus},
        AutoscalingType, ContainerResourcePhase, DeletionPolicy, ResourceName, TortoisePhase,
        UpdateMode,
    },
    vpa::VerticalPodAutoscaler,
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, DeploymentSpec, ReplicaSet},
        autoscaling::v2::{
            ContainerResourceMetricSource, CrossVersionObjectReference, ExternalMetricSource,
            HorizontalPodAutoscaler, HorizontalPodAutoscalerBehavior, HorizontalPodAutoscalerSpec,
            MetricIdentifier, MetricSpec, MetricTarget,
        },
        core::v1::{Container, Pod, PodSpec, PodTemplateSpec, ResourceRequirements},
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Resource,
};
