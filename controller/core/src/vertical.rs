//! Container request recommendations.

use crate::{quantity, Config};
use tortoise_k8s_api::{AutoscalingType, ResourceName};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Input {
    pub resource: ResourceName,
    pub policy: AutoscalingType,
    /// Current request in milli-units.
    pub request: i64,
    pub replicas: i32,
    /// The week's peak recommendation in milli-units.
    pub peak: Option<i64>,
    pub min_allocated: Option<i64>,
    pub max_allocated: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Recommendation {
    pub request: i64,
    /// True when the request was stepped up because the workload ran at or
    /// beyond the preferred replica count.
    pub stepped_up: bool,
}

/// Recommends a request for one (container, resource) pair.
///
/// Vertical pairs, and any pair of a workload already at the replica floor,
/// size to the recommender's peak. Horizontal pairs of a workload running
/// at or past the preferred peak replica count are stepped up by 10%. Every
/// other pair keeps its request. The result is then bounded by the policy
/// and the cluster ceiling, except that a request already above the ceiling
/// is left alone.
pub fn recommend(input: Input, cfg: &Config) -> Recommendation {
    let Input {
        resource,
        policy,
        request,
        replicas,
        peak,
        min_allocated,
        max_allocated,
    } = input;

    let mut stepped_up = false;
    let proposed = match policy {
        AutoscalingType::Vertical => peak.unwrap_or(request),
        AutoscalingType::Horizontal if replicas <= cfg.minimum_min_replicas => {
            peak.unwrap_or(request)
        }
        AutoscalingType::Horizontal if replicas >= cfg.preferred_max_replicas => {
            stepped_up = true;
            quantity::scale_ceil(request, 11, 10)
        }
        AutoscalingType::Horizontal | AutoscalingType::Off => request,
    };

    let ceiling = cfg.ceiling(resource);
    if ceiling.is_some_and(|c| request > c) {
        return Recommendation {
            request,
            stepped_up: false,
        };
    }

    let floor = min_allocated.unwrap_or(0);
    let upper = match (max_allocated, ceiling) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let mut value = proposed.max(floor);
    if let Some(upper) = upper {
        value = value.min(upper);
    }

    Recommendation {
        request: value,
        stepped_up,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(policy: AutoscalingType, request: i64, replicas: i32, peak: Option<i64>) -> Input {
        Input {
            resource: ResourceName::Cpu,
            policy,
            request,
            replicas,
            peak,
            min_allocated: None,
            max_allocated: None,
        }
    }

    #[test]
    fn vertical_follows_the_peak() {
        let cfg = Config::default();
        let r = recommend(input(AutoscalingType::Vertical, 500, 10, Some(800)), &cfg);
        assert_eq!(r, Recommendation { request: 800, stepped_up: false });
    }

    #[test]
    fn horizontal_at_the_floor_follows_the_peak() {
        let cfg = Config::default();
        let r = recommend(input(AutoscalingType::Horizontal, 500, 3, Some(300)), &cfg);
        assert_eq!(r.request, 300);
    }

    #[test]
    fn horizontal_at_peak_replicas_steps_up() {
        let cfg = Config::default();
        let r = recommend(input(AutoscalingType::Horizontal, 1000, 30, Some(300)), &cfg);
        assert_eq!(r, Recommendation { request: 1100, stepped_up: true });
    }

    #[test]
    fn horizontal_in_band_keeps_the_request() {
        let cfg = Config::default();
        let r = recommend(input(AutoscalingType::Horizontal, 1000, 12, Some(3000)), &cfg);
        assert_eq!(r, Recommendation { request: 1000, stepped_up: false });
    }

    #[test]
    fn policy_bounds_and_ceiling_apply() {
        let cfg = Config::default();
        let mut i = input(AutoscalingType::Vertical, 500, 10, Some(50));
        i.min_allocated = Some(100);
        assert_eq!(recommend(i, &cfg).request, 100);

        let mut i = input(AutoscalingType::Vertical, 500, 10, Some(5000));
        i.max_allocated = Some(2000);
        assert_eq!(recommend(i, &cfg).request, 2000);

        let i = input(AutoscalingType::Vertical, 500, 10, Some(50_000));
        assert_eq!(recommend(i, &cfg).request, 10_000);

        // An upper bound wins over a conflicting lower bound.
        let mut i = input(AutoscalingType::Vertical, 500, 10, Some(500));
        i.min_allocated = Some(20_000);
        assert_eq!(recommend(i, &cfg).request, 10_000);
    }

    #[test]
    fn oversized_requests_are_retained() {
        let cfg = Config::default();
        let r = recommend(input(AutoscalingType::Vertical, 12_000, 10, Some(3000)), &cfg);
        assert_eq!(r.request, 12_000);
    }

    #[test]
    fn results_stay_within_bounds() {
        let cfg = Config::default();
        let policies = [
            AutoscalingType::Vertical,
            AutoscalingType::Horizontal,
            AutoscalingType::Off,
        ];
        for policy in policies {
            for replicas in [1, 3, 10, 30, 80] {
                for peak in [None, Some(10), Some(900), Some(9_999), Some(40_000)] {
                    let i = Input {
                        min_allocated: Some(200),
                        max_allocated: Some(4000),
                        ..input(policy, 1000, replicas, peak)
                    };
                    let r = recommend(i, &cfg).request;
                    assert!((200..=4000).contains(&r), "{policy:?} {replicas} {peak:?} -> {r}");
                }
            }
        }
    }
}
