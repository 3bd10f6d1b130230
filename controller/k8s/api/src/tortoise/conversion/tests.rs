use super::*;
use crate::tortoise::{AutoscalingType, ResourceName, TortoisePhase, UpdateMode};
use kube::core::ObjectMeta;
use maplit::btreemap;
use pretty_assertions::assert_eq;

fn meta() -> ObjectMeta {
    ObjectMeta {
        name: Some("app".to_string()),
        namespace: Some("ns".to_string()),
        ..Default::default()
    }
}

fn hub() -> v1beta3::Tortoise {
    v1beta3::Tortoise {
        metadata: meta(),
        spec: v1beta3::TortoiseSpec {
            target_refs: v1beta3::TargetRefs {
                scale_target_ref: ScaleTargetRef::deployment("app"),
                horizontal_pod_autoscaler_name: Some("app-hpa".to_string()),
            },
            update_mode: UpdateMode::Auto,
            autoscaling_policy: vec![
                ContainerAutoscalingPolicy {
                    container_name: "app".to_string(),
                    policy: btreemap! {
                        ResourceName::Cpu => AutoscalingType::Horizontal,
                        ResourceName::Memory => AutoscalingType::Vertical,
                    },
                },
                ContainerAutoscalingPolicy {
                    container_name: "sidecar".to_string(),
                    policy: btreemap! {
                        ResourceName::Cpu => AutoscalingType::Vertical,
                        ResourceName::Memory => AutoscalingType::Vertical,
                    },
                },
            ],
            resource_policy: vec![v1beta3::ContainerResourcePolicy {
                container_name: "app".to_string(),
                min_allocated_resources: btreemap! {
                    ResourceName::Cpu => Quantity("100m".to_string()),
                },
                max_allocated_resources: btreemap! {
                    ResourceName::Memory => Quantity("2Gi".to_string()),
                },
            }],
            ..Default::default()
        },
        status: Some(v1beta3::TortoiseStatus {
            tortoise_phase: TortoisePhase::Working,
            targets: v1beta3::TargetsStatus {
                horizontal_pod_autoscaler: Some("app-hpa".to_string()),
                scale_target_ref: ScaleTargetRef::deployment("app"),
                vertical_pod_autoscalers: vec![],
            },
            ..Default::default()
        }),
    }
}

#[test]
fn v1beta2_carries_policy_per_container() {
    let old = v1beta2::Tortoise::try_from(hub()).expect("must convert");
    assert_eq!(old.spec.resource_policy.len(), 2);

    let app = &old.spec.resource_policy[0];
    assert_eq!(app.container_name, "app");
    assert_eq!(
        app.autoscaling_policy
            .as_ref()
            .and_then(|p| p.get(&ResourceName::Cpu)),
        Some(&AutoscalingType::Horizontal)
    );
    assert_eq!(
        app.min_allocated_resources.get(&ResourceName::Cpu),
        Some(&Quantity("100m".to_string()))
    );

    let sidecar = &old.spec.resource_policy[1];
    assert_eq!(sidecar.container_name, "sidecar");
    assert!(sidecar.min_allocated_resources.is_empty());
}

#[test]
fn v1beta2_round_trip_preserves_spec() {
    let original = hub();
    let back = v1beta3::Tortoise::from(v1beta2::Tortoise::try_from(original.clone()).unwrap());
    assert_eq!(back.spec, original.spec);
    assert_eq!(
        back.status.as_ref().map(|s| s.tortoise_phase),
        Some(TortoisePhase::Working)
    );
}

#[test]
fn v1beta2_round_trip_preserves_policy_order() {
    let mut original = hub();
    original.spec.autoscaling_policy = vec![
        ContainerAutoscalingPolicy {
            container_name: "sidecar".to_string(),
            policy: BTreeMap::new(),
        },
        ContainerAutoscalingPolicy {
            container_name: "app".to_string(),
            policy: btreemap! { ResourceName::Cpu => AutoscalingType::Horizontal },
        },
    ];
    original.spec.resource_policy.push(v1beta3::ContainerResourcePolicy {
        container_name: "db".to_string(),
        min_allocated_resources: btreemap! {
            ResourceName::Memory => Quantity("1Gi".to_string()),
        },
        max_allocated_resources: BTreeMap::new(),
    });

    let old = v1beta2::Tortoise::try_from(original.clone()).unwrap();
    let names = old
        .spec
        .resource_policy
        .iter()
        .map(|p| p.container_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["sidecar", "app", "db"]);
    assert_eq!(old.spec.resource_policy[0].autoscaling_policy, Some(BTreeMap::new()));
    assert_eq!(old.spec.resource_policy[2].autoscaling_policy, None);

    let back = v1beta3::Tortoise::from(old);
    assert_eq!(back.spec, original.spec);
}

#[test]
fn v1beta1_round_trip_preserves_common_fields() {
    let original = hub();
    let old = v1beta1::Tortoise::try_from(original.clone()).unwrap();
    assert_eq!(old.spec.target_refs.deployment_name, "app");
    assert_eq!(
        old.status.as_ref().map(|s| s.targets.deployment.as_str()),
        Some("app")
    );

    let back = v1beta3::Tortoise::from(old);
    assert_eq!(back.spec.target_refs, original.spec.target_refs);
    assert_eq!(back.spec.update_mode, UpdateMode::Auto);
    assert_eq!(back.spec.autoscaling_policy, original.spec.autoscaling_policy);
    // v1beta1 cannot express upper bounds.
    assert!(back.spec.resource_policy[0].max_allocated_resources.is_empty());
}

#[test]
fn older_versions_reject_non_deployments() {
    let mut t = hub();
    t.spec.target_refs.scale_target_ref.kind = "StatefulSet".to_string();
    assert!(matches!(
        v1beta2::Tortoise::try_from(t.clone()),
        Err(ConversionError::UnsupportedKind(_, kind)) if kind == "StatefulSet"
    ));
    assert!(v1beta1::Tortoise::try_from(t).is_err());
}

#[test]
fn convert_json_between_versions() {
    let object = serde_json::json!({
        "apiVersion": v1beta1::API_VERSION,
        "kind": "Tortoise",
        "metadata": { "name": "app", "namespace": "ns" },
        "spec": {
            "targetRefs": { "deploymentName": "app" },
            "updateMode": "Auto",
            "resourcePolicy": [{
                "containerName": "app",
                "autoscalingPolicy": { "cpu": "Horizontal", "memory": "Vertical" }
            }]
        }
    });

    let hub = convert(object, v1beta3::API_VERSION).expect("must convert");
    assert_eq!(hub["apiVersion"], v1beta3::API_VERSION);
    assert_eq!(hub["spec"]["targetRefs"]["scaleTargetRef"]["kind"], "Deployment");
    assert_eq!(hub["spec"]["autoscalingPolicy"][0]["policy"]["cpu"], "Horizontal");
    assert!(hub["spec"].get("resourcePolicy").is_none());
}

#[test]
fn convert_rejects_unknown_versions() {
    let object = serde_json::json!({
        "apiVersion": "autoscaling.mercari.com/v1alpha1",
        "kind": "Tortoise",
        "metadata": { "name": "app" },
        "spec": {}
    });
    assert!(matches!(
        convert(object, v1beta3::API_VERSION),
        Err(ConversionError::UnsupportedVersion(_))
    ));
    assert!(matches!(
        convert(serde_json::json!({}), v1beta3::API_VERSION),
        Err(ConversionError::MissingApiVersion)
    ));
}
