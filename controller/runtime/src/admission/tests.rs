use super::*;
use crate::{
    core::workload::{ContainerResources, Workload},
    k8s::{
        annotations,
        tortoise::{
            v1beta3::{ContainerResourcePolicy, TargetRefs},
            ContainerAutoscalingPolicy, ContainerResourceRequests, ScaleTargetRef,
        },
        AutoscalingType, Container, DeletionPolicy, HorizontalPodAutoscaler, ObjectMeta, Pod,
        PodSpec, Quantity, ResourceName, ResourceRequirements, Tortoise, TortoisePhase,
        TortoiseSpec, TortoiseStatus, UpdateMode,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn q(s: &str) -> Quantity {
    Quantity(s.to_string())
}

fn tortoise(mode: UpdateMode, phase: TortoisePhase) -> Tortoise {
    let mut t = Tortoise::new(
        "web",
        TortoiseSpec {
            target_refs: TargetRefs {
                scale_target_ref: ScaleTargetRef::deployment("web"),
                horizontal_pod_autoscaler_name: None,
            },
            update_mode: mode,
            ..Default::default()
        },
    );
    t.metadata.namespace = Some("prod".to_string());
    t.status = Some(TortoiseStatus {
        tortoise_phase: phase,
        ..Default::default()
    });
    t
}

fn workload() -> Workload {
    let container = |name: &str| ContainerResources {
        name: name.to_string(),
        requests: btreemap! {
            ResourceName::Cpu => 1000,
            ResourceName::Memory => 1024 * 1024 * 1024 * 1000,
        },
        limits: BTreeMap::new(),
    };
    Workload {
        name: "web".to_string(),
        containers: vec![container("app"), container("istio-proxy")],
        replicas: 3,
        template_annotations: BTreeMap::new(),
    }
}

fn policy(
    container: &str,
    cpu: AutoscalingType,
    memory: AutoscalingType,
) -> ContainerAutoscalingPolicy {
    ContainerAutoscalingPolicy {
        container_name: container.to_string(),
        policy: btreemap! {
            ResourceName::Cpu => cpu,
            ResourceName::Memory => memory,
        },
    }
}

#[test]
fn only_deployments_can_be_targeted() {
    let mut t = tortoise(UpdateMode::Off, TortoisePhase::Initializing);
    t.spec.target_refs.scale_target_ref.kind = "StatefulSet".to_string();
    let err = tortoise::validate(&t, None, None).unwrap_err();
    assert!(err.to_string().contains("must be Deployment"), "{err}");

    let mut t = tortoise(UpdateMode::Off, TortoisePhase::Initializing);
    t.spec.target_refs.scale_target_ref.name.clear();
    assert!(tortoise::validate(&t, None, None).is_err());

    let t = tortoise(UpdateMode::Off, TortoisePhase::Initializing);
    tortoise::validate(&t, None, Some(&workload())).expect("valid tortoise");
}

#[test]
fn targets_are_immutable() {
    let old = tortoise(UpdateMode::Auto, TortoisePhase::Working);

    let mut new = old.clone();
    new.spec.target_refs.scale_target_ref.name = "other".to_string();
    assert!(tortoise::validate(&new, Some(&old), None).is_err());

    // A name may be added but never changed afterwards.
    let mut named = old.clone();
    named.spec.target_refs.horizontal_pod_autoscaler_name = Some("web-hpa".to_string());
    tortoise::validate(&named, Some(&old), None).expect("adding a name is allowed");

    let mut renamed = named.clone();
    renamed.spec.target_refs.horizontal_pod_autoscaler_name = Some("web-hpa-2".to_string());
    assert!(tortoise::validate(&renamed, Some(&named), None).is_err());
}

#[test]
fn emergency_requires_a_working_tortoise() {
    for (phase, ok) in [
        (TortoisePhase::Initializing, false),
        (TortoisePhase::GatheringData, false),
        (TortoisePhase::PartlyWorking, true),
        (TortoisePhase::Working, true),
        (TortoisePhase::Emergency, true),
        (TortoisePhase::BackToNormal, true),
    ] {
        let t = tortoise(UpdateMode::Emergency, phase);
        assert_eq!(tortoise::validate(&t, None, None).is_ok(), ok, "{phase}");
    }
}

#[test]
fn the_last_horizontal_resource_cannot_be_removed() {
    let mut old = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    old.spec.autoscaling_policy = vec![
        policy("app", AutoscalingType::Horizontal, AutoscalingType::Vertical),
        policy("istio-proxy", AutoscalingType::Vertical, AutoscalingType::Vertical),
    ];
    let mut new = old.clone();
    new.spec.autoscaling_policy[0] =
        policy("app", AutoscalingType::Vertical, AutoscalingType::Vertical);

    let err = tortoise::validate(&new, Some(&old), Some(&workload())).unwrap_err();
    assert!(err.to_string().contains("Horizontal"), "{err}");

    new.spec.deletion_policy = DeletionPolicy::DeleteAll;
    tortoise::validate(&new, Some(&old), Some(&workload()))
        .expect("an owned HPA may be dropped when it is deleted with the Tortoise");
}

#[test]
fn policies_must_name_real_containers() {
    let mut t = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    t.spec.autoscaling_policy = vec![policy(
        "sidecar",
        AutoscalingType::Horizontal,
        AutoscalingType::Vertical,
    )];
    let err = tortoise::validate(&t, None, Some(&workload())).unwrap_err();
    assert!(err.to_string().contains("sidecar"), "{err}");
}

#[test]
fn resource_bounds_must_be_ordered() {
    let mut t = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    t.spec.resource_policy = vec![ContainerResourcePolicy {
        container_name: "app".to_string(),
        min_allocated_resources: btreemap! { ResourceName::Cpu => q("2") },
        max_allocated_resources: btreemap! { ResourceName::Cpu => q("500m") },
    }];
    assert!(tortoise::validate(&t, None, Some(&workload())).is_err());

    t.spec.resource_policy[0].max_allocated_resources = btreemap! { ResourceName::Cpu => q("4") };
    tortoise::validate(&t, None, Some(&workload())).expect("ordered bounds");
}

#[test]
fn resource_bounds_must_parse() {
    let mut t = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    t.spec.resource_policy = vec![ContainerResourcePolicy {
        container_name: "app".to_string(),
        min_allocated_resources: btreemap! { ResourceName::Memory => q("lots") },
        max_allocated_resources: BTreeMap::new(),
    }];
    let error = tortoise::validate(&t, None, Some(&workload())).unwrap_err();
    assert!(
        format!("{error:#}").contains("minAllocatedResources.memory"),
        "{error:#}"
    );
}

#[test]
fn partial_policies_are_filled_for_every_container() {
    let mut t = tortoise(UpdateMode::Auto, TortoisePhase::Initializing);
    t.spec.autoscaling_policy = vec![policy(
        "app",
        AutoscalingType::Vertical,
        AutoscalingType::Vertical,
    )];
    tortoise::fill_policies(&mut t.spec, &workload(), None);
    assert_eq!(
        t.spec.autoscaling_policy,
        vec![
            policy("app", AutoscalingType::Vertical, AutoscalingType::Vertical),
            policy("istio-proxy", AutoscalingType::Horizontal, AutoscalingType::Vertical),
        ]
    );
}

#[test]
fn managed_hpas_cannot_be_deleted() {
    let h = HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some("tortoise-hpa-web".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut t = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    assert!(hpa::guard_delete(&h, &t).is_err());

    t.metadata = serde_json::from_value(serde_json::json!({
        "name": "web",
        "namespace": "prod",
        "deletionTimestamp": "2024-01-10T12:00:00Z",
    }))
    .unwrap();
    hpa::guard_delete(&h, &t).expect("deleting tortoises release their HPA");

    let other = HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some("unrelated".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let t = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    hpa::guard_delete(&other, &t).expect("unrelated HPAs may be deleted");
}

fn app_pod(requests: BTreeMap<String, Quantity>, limits: BTreeMap<String, Quantity>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            annotations: Some(btreemap! {
                annotations::TORTOISE_NAME.to_string() => "web".to_string(),
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn wants_200m(t: &mut Tortoise) {
    if let Some(status) = t.status.as_mut() {
        status.conditions.container_resource_requests = vec![ContainerResourceRequests {
            container_name: "app".to_string(),
            resource: btreemap! { ResourceName::Cpu => q("200m") },
        }];
    }
}

#[test]
fn pods_keep_their_limit_ratio() {
    let mut cfg = Config::default();
    cfg.resource_limit_multiplier.insert(ResourceName::Cpu, 3);
    cfg.minimum_cpu_limit = 50;

    let mut t = tortoise(UpdateMode::Auto, TortoisePhase::Working);
    wants_200m(&mut t);

    let mut p = app_pod(
        btreemap! { "cpu".to_string() => q("100m") },
        btreemap! { "cpu".to_string() => q("400m") },
    );
    assert!(pod::apply(&mut p, &t, &cfg));

    let resources = p.spec.unwrap().containers[0].resources.clone().unwrap();
    assert_eq!(resources.requests.unwrap()["cpu"], q("200m"));
    assert_eq!(resources.limits.unwrap()["cpu"], q("800m"));
}

#[test]
fn pods_are_left_alone_while_off() {
    let cfg = Config::default();
    let mut t = tortoise(UpdateMode::Off, TortoisePhase::Working);
    wants_200m(&mut t);

    let mut p = app_pod(
        btreemap! { "cpu".to_string() => q("100m") },
        BTreeMap::new(),
    );
    let before = p.clone();
    assert!(!pod::apply(&mut p, &t, &cfg));
    assert_eq!(p, before);
}

#[test]
fn pods_resolve_their_replicaset_owner() {
    let owner = |kind: &str, controller: Option<bool>| OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: "web-5d8f7".to_string(),
        uid: "0".to_string(),
        controller,
        ..Default::default()
    };
    let meta = ObjectMeta {
        owner_references: Some(vec![
            owner("ReplicaSet", None),
            owner("ReplicaSet", Some(true)),
        ]),
        ..Default::default()
    };
    assert_eq!(pod::owner(&meta, "ReplicaSet").as_deref(), Some("web-5d8f7"));
    assert_eq!(pod::owner(&meta, "Deployment"), None);
}

#[test]
fn patches_only_touch_spec_and_annotations() {
    let raw = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "web-1", "annotations": { "a": "b" } },
        "spec": {
            "containers": [{
                "name": "app",
                "resources": { "requests": { "cpu": "100m" } },
            }],
        },
        "status": { "phase": "Pending" },
    });
    let mut p: Pod = serde_json::from_value(raw.clone()).unwrap();
    assert!(patch_for(&raw, &p).unwrap().0.is_empty());

    let resources = p.spec.as_mut().unwrap().containers[0].resources.as_mut().unwrap();
    resources
        .requests
        .as_mut()
        .unwrap()
        .insert("cpu".to_string(), q("200m"));
    let patch = serde_json::to_value(patch_for(&raw, &p).unwrap()).unwrap();
    assert_eq!(
        patch,
        serde_json::json!([{
            "op": "replace",
            "path": "/spec/containers/0/resources/requests/cpu",
            "value": "200m",
        }])
    );
}

#[test]
fn only_known_paths_are_served() {
    for path in [
        MUTATE_TORTOISE,
        VALIDATE_TORTOISE,
        MUTATE_HPA,
        VALIDATE_HPA,
        MUTATE_POD,
        CONVERT,
    ] {
        assert!(is_known(path), "{path}");
    }
    assert!(!is_known("/"));
    assert!(!is_known("/mutate-apps-v1-deployment"));
}
