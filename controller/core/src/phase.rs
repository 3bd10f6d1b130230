//! The Tortoise phase machine and the per-pair sub-phases beneath it.

use crate::{recommendation, Config};
use chrono::{DateTime, Utc};
use tortoise_k8s_api::{
    tortoise::{
        ContainerAutoscalingPolicy, ContainerRecommendationFromVpa, ContainerResourcePhases,
        ResourcePhase,
    },
    AutoscalingType, ContainerResourcePhase, ResourceName, TortoisePhase, UpdateMode,
};

/// Brings the sub-phases in line with the effective policy.
///
/// New pairs, and pairs leaving `Off`, start gathering. A gathering pair
/// starts working once it has a held peak and has gathered for the
/// configured period. Pairs of removed containers are dropped.
pub fn sync_resource_phases(
    existing: &[ContainerResourcePhases],
    policies: &[ContainerAutoscalingPolicy],
    recs: &[ContainerRecommendationFromVpa],
    now: DateTime<Utc>,
    cfg: &Config,
) -> Vec<ContainerResourcePhases> {
    let threshold = cfg.gathering_data_period.threshold();
    let at = |phase| ResourcePhase {
        phase,
        last_transition_time: now,
    };

    policies
        .iter()
        .map(|p| {
            let container = p.container_name.as_str();
            let prev = existing.iter().find(|e| e.container_name == container);
            let resource_phases = p
                .policy
                .iter()
                .map(|(resource, policy)| {
                    let prev = prev.and_then(|e| e.resource_phases.get(resource));
                    let next = match (policy, prev.map(|p| p.phase)) {
                        (AutoscalingType::Off, Some(ContainerResourcePhase::Off)) => prev.cloned(),
                        (AutoscalingType::Off, _) => Some(at(ContainerResourcePhase::Off)),
                        (_, None) | (_, Some(ContainerResourcePhase::Off)) => {
                            Some(at(ContainerResourcePhase::GatheringData))
                        }
                        (_, Some(ContainerResourcePhase::Working)) => prev.cloned(),
                        (_, Some(ContainerResourcePhase::GatheringData)) => {
                            let waited =
                                prev.is_some_and(|p| now - p.last_transition_time >= threshold);
                            let ready = waited
                                && recommendation::peak(recs, container, *resource).is_some();
                            if ready {
                                Some(at(ContainerResourcePhase::Working))
                            } else {
                                prev.cloned()
                            }
                        }
                    };
                    (*resource, next.unwrap_or_else(|| at(ContainerResourcePhase::GatheringData)))
                })
                .collect();
            ContainerResourcePhases {
                container_name: p.container_name.clone(),
                resource_phases,
            }
        })
        .collect()
}

/// True when the pair's sub-phase is `Working`.
pub fn is_working(
    phases: &[ContainerResourcePhases],
    container: &str,
    resource: ResourceName,
) -> bool {
    phases
        .iter()
        .find(|p| p.container_name == container)
        .and_then(|p| p.resource_phases.get(&resource))
        .is_some_and(|p| p.phase == ContainerResourcePhase::Working)
}

/// The phase implied by the sub-phases alone. Pairs that are `Off` do not
/// count either way.
pub fn aggregate(phases: &[ContainerResourcePhases]) -> TortoisePhase {
    let (mut working, mut gathering) = (0, 0);
    for p in phases.iter().flat_map(|p| p.resource_phases.values()) {
        match p.phase {
            ContainerResourcePhase::Working => working += 1,
            ContainerResourcePhase::GatheringData => gathering += 1,
            ContainerResourcePhase::Off => {}
        }
    }
    match (working, gathering) {
        (_, 0) => TortoisePhase::Working,
        (0, _) => TortoisePhase::GatheringData,
        _ => TortoisePhase::PartlyWorking,
    }
}

/// A phase change and the event reason announcing it, if any.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub phase: TortoisePhase,
    pub reason: Option<&'static str>,
    /// Set when emergency mode was requested from a phase that cannot
    /// enter it.
    pub emergency_rejected: bool,
}

/// Moves a Tortoise that has left `Initializing` to its next phase.
///
/// `settled` is what the sub-phases call for, see [`aggregate`]. The
/// replica table must be complete before anything but gathering is
/// reported. `BackToNormal` is left by the caller once the replica floor
/// has decayed to the ideal value. Turning a Tortoise off ends the unwind
/// at once since its autoscaler is no longer written.
pub fn transition(
    current: TortoisePhase,
    mode: UpdateMode,
    settled: TortoisePhase,
    table_complete: bool,
) -> Transition {
    let settled = if table_complete {
        settled
    } else {
        TortoisePhase::GatheringData
    };
    let normal = |current: TortoisePhase| {
        let reason = match settled {
            _ if settled == current => None,
            TortoisePhase::Working => Some("Working"),
            TortoisePhase::PartlyWorking => Some("PartlyWorking"),
            _ => None,
        };
        Transition {
            phase: settled,
            reason,
            emergency_rejected: false,
        }
    };

    if mode == UpdateMode::Emergency {
        if current.allows_emergency() {
            return Transition {
                phase: TortoisePhase::Emergency,
                reason: (current != TortoisePhase::Emergency).then_some("EmergencyModeEnabled"),
                emergency_rejected: false,
            };
        }
        return Transition {
            emergency_rejected: true,
            ..normal(current)
        };
    }

    match current {
        TortoisePhase::Emergency | TortoisePhase::BackToNormal if mode != UpdateMode::Off => {
            Transition {
                phase: TortoisePhase::BackToNormal,
                reason: None,
                emergency_rejected: false,
            }
        }
        _ => normal(current),
    }
}

/// One step of the post-emergency decay of the replica floor.
///
/// The floor shrinks to `ceil(current * factor)` and by at least one
/// replica. Returns the new floor and whether it reached `ideal`, in which
/// case the floor is `ideal`.
pub fn reduce_min_replicas(current: i32, ideal: i32, factor: f64) -> (i32, bool) {
    let reduced = crate::replicas::propose(current, factor).min(current - 1);
    if reduced <= ideal {
        (ideal, true)
    } else {
        (reduced, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use maplit::btreemap;
    use tortoise_k8s_api::{tortoise::ResourceQuantity, Quantity};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn policy() -> Vec<ContainerAutoscalingPolicy> {
        vec![ContainerAutoscalingPolicy {
            container_name: "app".to_string(),
            policy: btreemap! {
                ResourceName::Cpu => AutoscalingType::Horizontal,
                ResourceName::Memory => AutoscalingType::Off,
            },
        }]
    }

    fn peak(at: DateTime<Utc>) -> Vec<ContainerRecommendationFromVpa> {
        vec![ContainerRecommendationFromVpa {
            container_name: "app".to_string(),
            max_recommendation: btreemap! {
                ResourceName::Cpu => ResourceQuantity {
                    quantity: Quantity("1".to_string()),
                    updated_at: at,
                },
            },
            ..Default::default()
        }]
    }

    #[test]
    fn pairs_work_after_the_gathering_period() {
        let cfg = Config::default();
        let start = t0();
        let phases = sync_resource_phases(&[], &policy(), &[], start, &cfg);
        assert!(!is_working(&phases, "app", ResourceName::Cpu));
        assert_eq!(
            phases[0].resource_phases[&ResourceName::Memory].phase,
            ContainerResourcePhase::Off
        );
        assert_eq!(aggregate(&phases), TortoisePhase::GatheringData);

        // A peak alone is not enough.
        let day = start + TimeDelta::days(1);
        let phases = sync_resource_phases(&phases, &policy(), &peak(day), day, &cfg);
        assert!(!is_working(&phases, "app", ResourceName::Cpu));

        let week = start + TimeDelta::days(7);
        let phases = sync_resource_phases(&phases, &policy(), &peak(week), week, &cfg);
        assert!(is_working(&phases, "app", ResourceName::Cpu));
        assert_eq!(
            phases[0].resource_phases[&ResourceName::Cpu].last_transition_time,
            week
        );
        assert_eq!(aggregate(&phases), TortoisePhase::Working);
    }

    #[test]
    fn aggregate_reports_partial_progress() {
        let cfg = Config::default();
        let now = t0();
        let mut phases = sync_resource_phases(&[], &policy(), &[], now, &cfg);
        phases[0].resource_phases.insert(
            ResourceName::Memory,
            ResourcePhase {
                phase: ContainerResourcePhase::Working,
                last_transition_time: now,
            },
        );
        assert_eq!(aggregate(&phases), TortoisePhase::PartlyWorking);
    }

    fn step(current: TortoisePhase, mode: UpdateMode, complete: bool) -> Transition {
        transition(current, mode, TortoisePhase::Working, complete)
    }

    #[test]
    fn emergency_requires_a_working_phase() {
        let t = step(TortoisePhase::Working, UpdateMode::Emergency, true);
        assert_eq!(t.phase, TortoisePhase::Emergency);
        assert_eq!(t.reason, Some("EmergencyModeEnabled"));

        let t = step(TortoisePhase::Emergency, UpdateMode::Emergency, true);
        assert_eq!(t.reason, None);

        let t = transition(
            TortoisePhase::GatheringData,
            UpdateMode::Emergency,
            TortoisePhase::GatheringData,
            false,
        );
        assert_eq!(t.phase, TortoisePhase::GatheringData);
        assert!(t.emergency_rejected);
    }

    #[test]
    fn leaving_emergency_goes_back_to_normal() {
        let t = step(TortoisePhase::Emergency, UpdateMode::Auto, true);
        assert_eq!(t.phase, TortoisePhase::BackToNormal);
        let t = step(TortoisePhase::BackToNormal, UpdateMode::Auto, true);
        assert_eq!(t.phase, TortoisePhase::BackToNormal);
    }

    #[test]
    fn turning_off_skips_back_to_normal() {
        let t = step(TortoisePhase::Emergency, UpdateMode::Off, true);
        assert_eq!(t.phase, TortoisePhase::Working);
        assert_eq!(t.reason, Some("Working"));
        let t = step(TortoisePhase::BackToNormal, UpdateMode::Off, false);
        assert_eq!(t.phase, TortoisePhase::GatheringData);
    }

    #[test]
    fn incomplete_tables_keep_gathering() {
        let t = step(TortoisePhase::GatheringData, UpdateMode::Auto, false);
        assert_eq!(t.phase, TortoisePhase::GatheringData);
        let t = step(TortoisePhase::GatheringData, UpdateMode::Auto, true);
        assert_eq!(
            t,
            Transition {
                phase: TortoisePhase::Working,
                reason: Some("Working"),
                emergency_rejected: false,
            }
        );
    }

    #[test]
    fn back_to_normal_strictly_decreases() {
        let mut min = 10;
        let mut steps = 0;
        loop {
            let (next, done) = reduce_min_replicas(min, 3, 0.95);
            if done {
                assert_eq!(next, 3);
                break;
            }
            assert!(next < min);
            min = next;
            steps += 1;
        }
        assert_eq!(steps, 6);
        assert_eq!(reduce_min_replicas(100, 3, 0.5), (50, false));
    }
}
