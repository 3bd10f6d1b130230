//! Reconciliation planning.
//!
//! [`plan`] is the whole recommendation pipeline for one Tortoise: it
//! resolves policy, folds in recommender samples, updates every
//! recommendation, moves the phase machine and decides what should be
//! written to the HorizontalPodAutoscaler and the recommender.

use crate::{
    conditions,
    hpa::{self, HpaPlan},
    hpa_target, phase, policy, quantity, recommendation,
    replicas::{self, Series},
    vertical, Config, Error, Workload,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tortoise_k8s_api::{
    tortoise::{
        ContainerAutoscalingPolicy, ContainerResourceRequests,
        HpaTargetUtilizationRecommendationPerContainer, RecommendedContainerResources,
        TargetStatusVerticalPodAutoscaler, TortoiseConditionType, VerticalPodAutoscalerRole,
    },
    vpa, AutoscalingType, HorizontalPodAutoscaler, ResourceName, Tortoise, TortoisePhase,
    TortoiseStatus, UpdateMode, VerticalPodAutoscaler,
};

/// Everything a reconciliation reads.
#[derive(Copy, Clone, Debug)]
pub struct Snapshot<'a> {
    pub tortoise: &'a Tortoise,
    pub workload: &'a Workload,
    pub hpa: Option<&'a HorizontalPodAutoscaler>,
    pub vpa: Option<&'a VerticalPodAutoscaler>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NoticeType {
    Normal,
    Warning,
}

/// An event to publish on the Tortoise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub type_: NoticeType,
    pub reason: &'static str,
    pub note: String,
}

impl Notice {
    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: NoticeType::Normal,
            reason,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: NoticeType::Warning,
            reason,
            note: note.into(),
        }
    }
}

/// Values proposed during a reconciliation, exported as metrics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Proposals {
    pub target_utilizations: Vec<(String, ResourceName, i32)>,
    pub min_replicas: Option<i32>,
    pub max_replicas: Option<i32>,
    pub requests: Vec<(String, ResourceName, i64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub status: TortoiseStatus,
    /// Set when the HorizontalPodAutoscaler should be rewritten.
    pub hpa: Option<HpaPlan>,
    /// Set when the monitor VerticalPodAutoscaler's resource policy should
    /// be rewritten.
    pub vpa_policy: Option<vpa::PodResourcePolicy>,
    pub notices: Vec<Notice>,
    pub proposals: Proposals,
}

/// True when the Tortoise needs a HorizontalPodAutoscaler at all.
pub fn needs_hpa(tortoise: &Tortoise, policies: &[ContainerAutoscalingPolicy]) -> bool {
    !tortoise.owns_hpa() || policy::has_horizontal(policies)
}

/// Plans one reconciliation.
pub fn plan(snap: Snapshot<'_>, now: DateTime<Utc>, cfg: &Config) -> Plan {
    let t = snap.tortoise;
    let mut status = t.status.clone().unwrap_or_default();
    let mut notices = Vec::new();
    let mut proposals = Proposals::default();
    let mut failures = Vec::new();

    let policies = policy::resolve(&t.spec, snap.workload, snap.hpa);
    let containers = snap
        .workload
        .containers
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>();
    let samples = snap.vpa.map(|v| v.samples()).unwrap_or_default();
    status.conditions.container_recommendation_from_vpa = recommendation::absorb(
        &status.conditions.container_recommendation_from_vpa,
        &samples,
        &containers,
        now,
    );
    status.container_resource_phases = phase::sync_resource_phases(
        &status.container_resource_phases,
        &policies,
        &status.conditions.container_recommendation_from_vpa,
        now,
        cfg,
    );

    let wants_hpa = needs_hpa(t, &policies);
    status.autoscaling_policy = policies;
    status.targets.horizontal_pod_autoscaler = wants_hpa.then(|| t.hpa_name());
    status.targets.scale_target_ref = t.spec.target_refs.scale_target_ref.clone();
    status.targets.vertical_pod_autoscalers = vec![TargetStatusVerticalPodAutoscaler {
        name: t.monitor_vpa_name(),
        role: VerticalPodAutoscalerRole::Monitor,
    }];

    if status.tortoise_phase == TortoisePhase::Initializing {
        let ready = (snap.hpa.is_some() || !wants_hpa)
            && snap.vpa.is_some_and(VerticalPodAutoscaler::recommendation_provided);
        if ready {
            status.tortoise_phase = TortoisePhase::GatheringData;
            status.recommendations.horizontal.min_replicas = replicas::initial_slots(cfg, now);
            status.recommendations.horizontal.max_replicas = replicas::initial_slots(cfg, now);
            notices.push(Notice::normal(
                "Initialized",
                "The HorizontalPodAutoscaler and the VerticalPodAutoscaler are ready",
            ));
        }
        conditions::set(
            &mut status.conditions.tortoise_conditions,
            TortoiseConditionType::FailedToReconcile,
            false,
            "ReconcileSucceeded",
            "",
            now,
        );
        return Plan {
            status,
            hpa: None,
            vpa_policy: None,
            notices,
            proposals,
        };
    }

    // Replica tables. Replica counts seen while the floor is pinned or
    // unwinding reflect the pin, not load.
    let forced = matches!(
        status.tortoise_phase,
        TortoisePhase::Emergency | TortoisePhase::BackToNormal
    );
    let horizontal = &mut status.recommendations.horizontal;
    if !replicas::matches_layout(&horizontal.min_replicas, cfg) {
        horizontal.min_replicas = replicas::initial_slots(cfg, now);
    }
    if !replicas::matches_layout(&horizontal.max_replicas, cfg) {
        horizontal.max_replicas = replicas::initial_slots(cfg, now);
    }
    let observed = snap
        .hpa
        .and_then(hpa::current_replicas)
        .unwrap_or(snap.workload.replicas);
    if !forced {
        if let Err(e) = replicas::record(
            &mut horizontal.min_replicas,
            Series::Min,
            replicas::propose(observed, cfg.min_replicas_factor),
            now,
            None,
            cfg,
        ) {
            failures.push(e);
        }
        if let Err(e) = replicas::record(
            &mut horizontal.max_replicas,
            Series::Max,
            replicas::propose(observed, cfg.max_replicas_factor),
            now,
            t.spec.max_replicas,
            cfg,
        ) {
            failures.push(e);
        }
    }

    // Target utilizations and requests.
    let recs = &status.conditions.container_recommendation_from_vpa;
    let previous_targets =
        std::mem::take(&mut status.recommendations.horizontal.target_utilizations);
    let mut target_utilizations = Vec::new();
    let mut vertical_recs = Vec::new();
    let mut requests = Vec::new();
    let mut stepped_up = false;

    for c in &snap.workload.containers {
        let mut targets = BTreeMap::new();
        let mut recommended = BTreeMap::new();
        let mut wanted = BTreeMap::new();

        for resource in ResourceName::ALL {
            let pol = policy::lookup(&status.autoscaling_policy, &c.name, resource);
            let request = c.requests.get(&resource).copied();
            let peak = recommendation::peak(recs, &c.name, resource);
            let working = phase::is_working(&status.container_resource_phases, &c.name, resource);

            let current_target = snap.hpa.and_then(|h| hpa::current_target(h, &c.name, resource));
            match hpa_target::recommend(pol, current_target, request, peak, cfg) {
                Some(v) => {
                    targets.insert(resource, v);
                    proposals.target_utilizations.push((c.name.clone(), resource, v));
                }
                None => {
                    if pol == AutoscalingType::Horizontal && working && peak.is_none() {
                        failures.push(Error::MissingRecommendation {
                            container: c.name.clone(),
                            resource,
                        });
                    }
                    let kept = previous_targets
                        .iter()
                        .find(|p| p.container_name == c.name)
                        .and_then(|p| p.target_utilization.get(&resource));
                    if let (Some(v), true) = (kept, pol != AutoscalingType::Off) {
                        targets.insert(resource, *v);
                    }
                }
            }

            let Some(request) = request else {
                continue;
            };
            let bounds = t
                .spec
                .resource_policy
                .iter()
                .find(|p| p.container_name == c.name);
            let input = vertical::Input {
                resource,
                policy: pol,
                request,
                replicas: observed,
                peak,
                min_allocated: bounds
                    .and_then(|p| p.min_allocated_resources.get(&resource))
                    .and_then(quantity::parse_or_warn),
                max_allocated: bounds
                    .and_then(|p| p.max_allocated_resources.get(&resource))
                    .and_then(quantity::parse_or_warn),
            };
            let rec = vertical::recommend(input, cfg);
            stepped_up |= rec.stepped_up;
            recommended.insert(resource, quantity::format(resource, rec.request));
            proposals.requests.push((c.name.clone(), resource, rec.request));

            // Pairs that are not working keep their current request, bounded.
            let applied = if working && pol != AutoscalingType::Off {
                rec.request
            } else {
                let keep = vertical::Input {
                    policy: AutoscalingType::Off,
                    ..input
                };
                vertical::recommend(keep, cfg).request
            };
            wanted.insert(resource, quantity::format(resource, applied));
        }

        target_utilizations.push(HpaTargetUtilizationRecommendationPerContainer {
            container_name: c.name.clone(),
            target_utilization: targets,
        });
        vertical_recs.push(RecommendedContainerResources {
            container_name: c.name.clone(),
            recommended_resource: recommended,
        });
        requests.push(ContainerResourceRequests {
            container_name: c.name.clone(),
            resource: wanted,
        });
    }
    status.recommendations.horizontal.target_utilizations = target_utilizations;
    status.recommendations.vertical.container_resource_recommendation = vertical_recs;
    status.conditions.container_resource_requests = requests;
    conditions::set(
        &mut status.conditions.tortoise_conditions,
        TortoiseConditionType::ScaledUpBasedOnPreferredMaxReplicas,
        stepped_up,
        if stepped_up {
            "ScaledUpBasedOnPreferredMaxReplicas"
        } else {
            "BelowPreferredMaxReplicas"
        },
        if stepped_up {
            format!(
                "The workload runs {observed} replicas, at or above the preferred {}; \
                 requests were raised",
                cfg.preferred_max_replicas
            )
        } else {
            String::new()
        },
        now,
    );
    notices.push(Notice::normal(
        "RecommendationUpdated",
        "The recommendation on Tortoise status is updated",
    ));

    // Phase.
    let complete = replicas::is_complete(&status.recommendations.horizontal.min_replicas)
        && replicas::is_complete(&status.recommendations.horizontal.max_replicas);
    let settled = phase::aggregate(&status.container_resource_phases);
    let tr = phase::transition(status.tortoise_phase, t.spec.update_mode, settled, complete);
    if tr.emergency_rejected {
        notices.push(Notice::warning(
            "EmergencyModeFailed",
            format!(
                "Emergency mode cannot be enabled while the Tortoise is {}",
                status.tortoise_phase
            ),
        ));
    }
    if let Some(reason) = tr.reason {
        notices.push(Notice::normal(reason, phase_note(tr.phase)));
    }
    status.tortoise_phase = tr.phase;

    // Replica bounds.
    let bounds = match replica_bounds(&status, t, now, cfg) {
        Ok(b) => Some(b),
        Err(e) => {
            failures.push(e);
            None
        }
    };
    let mut hpa_plan = None;
    if let Some(Bounds {
        ideal_min,
        mut max,
        capped_max,
    }) = bounds
    {
        if let Some(wanted) = capped_max {
            notices.push(Notice::warning(
                "HitHardMaxReplicaLimit",
                format!(
                    "The recommended maxReplicas {wanted} exceeds the cluster limit {}",
                    cfg.maximum_max_replicas
                ),
            ));
        }
        let mut min = ideal_min;
        match status.tortoise_phase {
            TortoisePhase::Emergency => min = max,
            TortoisePhase::BackToNormal => {
                let current = snap.hpa.and_then(hpa::min_replicas).unwrap_or(ideal_min);
                let (reduced, done) =
                    phase::reduce_min_replicas(current, ideal_min, cfg.replica_reduction_factor);
                min = reduced;
                if done {
                    status.tortoise_phase = if complete {
                        settled
                    } else {
                        TortoisePhase::GatheringData
                    };
                    notices.push(Notice::normal(
                        "Working",
                        "minReplicas is back to the recommended value",
                    ));
                }
            }
            _ => {}
        }
        if min > max {
            notices.push(Notice::warning(
                "ReplicaValidationWarning",
                format!("minReplicas {min} exceeds maxReplicas {max}; using {max}"),
            ));
            min = max;
        }
        max = max.max(min);
        proposals.min_replicas = Some(min);
        proposals.max_replicas = Some(max);

        let applies = t.spec.update_mode != UpdateMode::Off
            && status.tortoise_phase != TortoisePhase::GatheringData
            && wants_hpa
            && snap.hpa.is_some();
        if applies {
            hpa_plan = Some(build_hpa_plan(t, &status, min, max, cfg));
        }
    }

    let vpa_policy = (t.spec.update_mode != UpdateMode::Off
        && status.tortoise_phase != TortoisePhase::GatheringData)
        .then(|| vpa_resource_policy(t, &status.autoscaling_policy, cfg));

    match failures.as_slice() {
        [] => conditions::set(
            &mut status.conditions.tortoise_conditions,
            TortoiseConditionType::FailedToReconcile,
            false,
            "ReconcileSucceeded",
            "",
            now,
        ),
        [first, ..] => conditions::set(
            &mut status.conditions.tortoise_conditions,
            TortoiseConditionType::FailedToReconcile,
            true,
            first.reason(),
            failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            now,
        ),
    }

    Plan {
        status,
        hpa: hpa_plan,
        vpa_policy,
        notices,
        proposals,
    }
}

fn phase_note(phase: TortoisePhase) -> &'static str {
    match phase {
        TortoisePhase::Working => "Every resource is autoscaled from recommendations",
        TortoisePhase::PartlyWorking => "Some resources are autoscaled from recommendations",
        TortoisePhase::Emergency => "minReplicas is pinned to maxReplicas",
        _ => "",
    }
}

struct Bounds {
    ideal_min: i32,
    max: i32,
    /// The recommendation that was capped by the cluster ceiling.
    capped_max: Option<i32>,
}

fn replica_bounds(
    status: &TortoiseStatus,
    t: &Tortoise,
    now: DateTime<Utc>,
    cfg: &Config,
) -> crate::Result<Bounds> {
    let h = &status.recommendations.horizontal;
    let ideal_min = replicas::value_at(&h.min_replicas, Series::Min, now, cfg)?
        .max(cfg.minimum_min_replicas);
    let mut max = replicas::value_at(&h.max_replicas, Series::Max, now, cfg)?
        .max(cfg.minimum_min_replicas);
    if let Some(limit) = t.spec.max_replicas {
        max = max.min(limit);
    }
    let capped_max = (max > cfg.maximum_max_replicas).then_some(max);
    max = max.min(cfg.maximum_max_replicas);
    Ok(Bounds {
        ideal_min,
        max,
        capped_max,
    })
}

fn build_hpa_plan(
    t: &Tortoise,
    status: &TortoiseStatus,
    min: i32,
    max: i32,
    cfg: &Config,
) -> HpaPlan {
    let phases = &status.container_resource_phases;
    let mut targets = BTreeMap::new();
    for rec in &status.recommendations.horizontal.target_utilizations {
        for (resource, v) in &rec.target_utilization {
            if phase::is_working(phases, &rec.container_name, *resource) {
                targets.insert((rec.container_name.clone(), *resource), *v);
            }
        }
    }
    HpaPlan {
        min_replicas: min,
        max_replicas: max,
        targets,
        horizontal: policy::pairs_with(&status.autoscaling_policy, AutoscalingType::Horizontal)
            .collect::<BTreeSet<_>>(),
        initial_target: cfg.minimum_target_resource_utilization,
        behavior: t
            .owns_hpa()
            .then(|| t.spec.horizontal_pod_autoscaler_behavior.clone())
            .flatten(),
    }
}

/// What the HorizontalPodAutoscaler webhook enforces for `t`, computed from
/// its persisted status alone. `current_min` is the incoming object's
/// floor, which is kept while the Tortoise is returning to normal.
pub fn hpa_plan_from_status(
    t: &Tortoise,
    current_min: Option<i32>,
    now: DateTime<Utc>,
    cfg: &Config,
) -> Option<HpaPlan> {
    if t.spec.update_mode == UpdateMode::Off {
        return None;
    }
    let status = t.status.as_ref()?;
    if matches!(
        status.tortoise_phase,
        TortoisePhase::Initializing | TortoisePhase::GatheringData
    ) {
        return None;
    }
    let Bounds { ideal_min, max, .. } = replica_bounds(status, t, now, cfg).ok()?;
    let min = match status.tortoise_phase {
        TortoisePhase::Emergency => max,
        TortoisePhase::BackToNormal => current_min
            .unwrap_or(ideal_min)
            .clamp(ideal_min.min(max), max),
        _ => ideal_min,
    };
    Some(build_hpa_plan(t, status, min.min(max), max, cfg))
}

/// The monitor VerticalPodAutoscaler's resource policy: each container
/// controls its non-`Off` resources within the Tortoise's bounds and the
/// cluster ceilings.
pub fn vpa_resource_policy(
    t: &Tortoise,
    policies: &[ContainerAutoscalingPolicy],
    cfg: &Config,
) -> vpa::PodResourcePolicy {
    let container_policies = policies
        .iter()
        .map(|p| {
            let bounds = t
                .spec
                .resource_policy
                .iter()
                .find(|r| r.container_name == p.container_name);
            let controlled_resources = p
                .policy
                .iter()
                .filter(|(_, ty)| **ty != AutoscalingType::Off)
                .map(|(r, _)| *r)
                .collect::<Vec<_>>();

            let mut min_allowed = BTreeMap::new();
            let mut max_allowed = BTreeMap::new();
            for resource in &controlled_resources {
                if let Some(q) = bounds.and_then(|b| b.min_allocated_resources.get(resource)) {
                    min_allowed.insert(*resource, q.clone());
                }
                let user_max = bounds
                    .and_then(|b| b.max_allocated_resources.get(resource))
                    .and_then(quantity::parse_or_warn);
                let max = match (user_max, cfg.ceiling(*resource)) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                if let Some(max) = max {
                    max_allowed.insert(*resource, quantity::format(*resource, max));
                }
            }

            vpa::ContainerResourcePolicy {
                container_name: p.container_name.clone(),
                controlled_resources,
                min_allowed,
                max_allowed,
            }
        })
        .collect();
    vpa::PodResourcePolicy { container_policies }
}
