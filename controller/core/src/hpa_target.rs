//! Target utilization recommendations for the HorizontalPodAutoscaler.

use crate::Config;
use tortoise_k8s_api::AutoscalingType;

/// Recommends a target utilization (in percent) for one pair.
///
/// `request` and `peak` are milli-units: the container's current request
/// and the week's peak recommendation. A pair without a current target is
/// given the ceiling. Returns `None` for pairs that are not scaled or when
/// the inputs do not support a recommendation.
pub fn recommend(
    policy: AutoscalingType,
    current_target: Option<i32>,
    request: Option<i64>,
    peak: Option<i64>,
    cfg: &Config,
) -> Option<i32> {
    let (lo, hi) = (
        cfg.minimum_target_resource_utilization,
        cfg.maximum_target_resource_utilization,
    );
    match policy {
        AutoscalingType::Off => None,
        AutoscalingType::Vertical => Some(hi),
        AutoscalingType::Horizontal => {
            let request = request.filter(|r| *r > 0)?;
            let peak = peak?;
            let Some(current) = current_target else {
                return Some(hi);
            };
            // ceil(peak / request * 100), in integers.
            let upper = (i128::from(peak) * 100 + i128::from(request) - 1) / i128::from(request);
            let additional = upper - i128::from(current);
            let proposed = (100 - additional).clamp(i128::from(lo), i128::from(hi));
            Some(proposed as i32)
        }
    }
}
