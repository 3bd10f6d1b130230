//! The min/max replica tables.
//!
//! Each table is a list of slots tiling a week (or a single day, which then
//! repeats) at a fixed hour granularity. A slot holds the peak proposal seen
//! in its window and only falls once that peak is older than the TTL.

use crate::{Config, Error, GatheringDataPeriod, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use tortoise_k8s_api::tortoise::ReplicasRecommendation;

/// Which of the two tables a slot belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Series {
    Min,
    Max,
}

impl Series {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "minReplicas",
            Self::Max => "maxReplicas",
        }
    }
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "Sunday",
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
    }
}

/// `ceil(replicas * factor)`.
pub fn propose(replicas: i32, factor: f64) -> i32 {
    let v = (f64::from(replicas.max(0)) * factor).ceil();
    if v >= f64::from(i32::MAX) {
        i32::MAX
    } else {
        v as i32
    }
}

/// A fresh table with every slot at zero.
pub fn initial_slots(cfg: &Config, now: DateTime<Utc>) -> Vec<ReplicasRecommendation> {
    let step = cfg.range_of_min_max_replicas_recommendation_hours;
    let days: Vec<Option<String>> = match cfg.gathering_data_period {
        GatheringDataPeriod::Daily => vec![None],
        GatheringDataPeriod::Weekly => WEEKDAYS
            .iter()
            .map(|d| Some(weekday_name(*d).to_string()))
            .collect(),
    };
    let tz = cfg.time_zone.name().to_string();

    days.into_iter()
        .flat_map(|weekday| {
            let tz = tz.clone();
            (0..24).step_by(step as usize).map(move |from| ReplicasRecommendation {
                from,
                to: from + step,
                weekday: weekday.clone(),
                time_zone: tz.clone(),
                value: 0,
                updated_at: now,
            })
        })
        .collect()
}

/// True when `slots` has exactly the layout [`initial_slots`] would build
/// for `cfg`. A table built for another layout or timezone is rebuilt.
pub fn matches_layout(slots: &[ReplicasRecommendation], cfg: &Config) -> bool {
    let fresh = initial_slots(cfg, DateTime::<Utc>::MIN_UTC);
    slots.len() == fresh.len()
        && slots.iter().zip(&fresh).all(|(a, b)| {
            a.from == b.from && a.to == b.to && a.weekday == b.weekday && a.time_zone == b.time_zone
        })
}

/// Index of the slot containing `at`.
pub fn slot_index(
    slots: &[ReplicasRecommendation],
    series: Series,
    at: DateTime<Utc>,
    tz: &impl TimeZone,
) -> Result<usize> {
    let local = at.with_timezone(tz);
    let hour = local.hour();
    let day = weekday_name(local.weekday());
    slots
        .iter()
        .position(|s| {
            s.from <= hour
                && hour < s.to
                && s.weekday.as_deref().map(|w| w == day).unwrap_or(true)
        })
        .ok_or(Error::NoSlot {
            series: series.as_str(),
            at,
        })
}

/// The value of the slot containing `at`.
pub fn value_at(
    slots: &[ReplicasRecommendation],
    series: Series,
    at: DateTime<Utc>,
    cfg: &Config,
) -> Result<i32> {
    let i = slot_index(slots, series, at, &cfg.time_zone)?;
    Ok(slots[i].value)
}

/// Folds `proposed` into the slot containing `now`.
///
/// The slot takes the proposal when it is higher than the slot's value or
/// when the slot has not been refreshed for a full TTL. Min slots are then
/// raised to the replica floor and max slots lowered to `max_override`.
pub fn record(
    slots: &mut [ReplicasRecommendation],
    series: Series,
    proposed: i32,
    now: DateTime<Utc>,
    max_override: Option<i32>,
    cfg: &Config,
) -> Result<i32> {
    let i = slot_index(slots, series, now, &cfg.time_zone)?;
    let slot = &mut slots[i];

    if proposed > slot.value || now - slot.updated_at >= cfg.ttl_of_min_max_replicas_recommendation
    {
        slot.value = proposed;
        slot.updated_at = now;
    }

    match series {
        Series::Min => slot.value = slot.value.max(cfg.minimum_min_replicas),
        Series::Max => {
            if let Some(limit) = max_override {
                slot.value = slot.value.min(limit);
            }
        }
    }
    Ok(slot.value)
}

/// True once every slot has been filled at least once.
pub fn is_complete(slots: &[ReplicasRecommendation]) -> bool {
    !slots.is_empty() && slots.iter().all(|s| s.value > 0)
}
