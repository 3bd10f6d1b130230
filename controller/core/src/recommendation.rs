//! Folding recommender samples into the Tortoise status.

use crate::quantity;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use tortoise_k8s_api::{
    tortoise::{ContainerRecommendationFromVpa, ResourceQuantity},
    Quantity, ResourceName,
};

/// How long a peak sample is held.
pub const PEAK_WINDOW: TimeDelta = TimeDelta::days(7);

pub type Samples = BTreeMap<String, BTreeMap<ResourceName, Quantity>>;

/// Records the latest samples for `containers`.
///
/// Each pair's `recommendation` becomes the new sample. Its
/// `maxRecommendation` keeps the old peak unless the new sample is at least
/// as large or the old peak is older than [`PEAK_WINDOW`]. Containers not
/// in `containers` are dropped; containers without a new sample keep their
/// previous entry.
pub fn absorb(
    current: &[ContainerRecommendationFromVpa],
    samples: &Samples,
    containers: &[&str],
    now: DateTime<Utc>,
) -> Vec<ContainerRecommendationFromVpa> {
    containers
        .iter()
        .map(|name| {
            let mut entry = current
                .iter()
                .find(|c| c.container_name == *name)
                .cloned()
                .unwrap_or_else(|| ContainerRecommendationFromVpa {
                    container_name: name.to_string(),
                    ..Default::default()
                });

            // Peaks that have aged out are forgotten even without a new sample.
            entry
                .max_recommendation
                .retain(|_, peak| now - peak.updated_at < PEAK_WINDOW);

            for (resource, q) in samples.get(*name).into_iter().flatten() {
                let Some(sample) = quantity::parse_or_warn(q) else {
                    continue;
                };
                let fresh = ResourceQuantity {
                    quantity: q.clone(),
                    updated_at: now,
                };
                entry.recommendation.insert(*resource, fresh.clone());

                let keep_peak = entry
                    .max_recommendation
                    .get(resource)
                    .and_then(|peak| quantity::parse_or_warn(&peak.quantity))
                    .is_some_and(|peak| peak > sample);
                if !keep_peak {
                    entry.max_recommendation.insert(*resource, fresh);
                }
            }
            entry
        })
        .collect()
}

/// The held peak for a pair, in milli-units.
pub fn peak(
    recs: &[ContainerRecommendationFromVpa],
    container: &str,
    resource: ResourceName,
) -> Option<i64> {
    let rec = recs.iter().find(|c| c.container_name == container)?;
    quantity::parse_or_warn(&rec.max_recommendation.get(&resource)?.quantity)
}
