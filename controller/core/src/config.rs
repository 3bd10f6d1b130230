//! Controller configuration.
//!
//! The file is YAML with PascalCase keys. Every key is optional; a missing
//! key takes the default shown in [`RawConfig::default`]. [`RawConfig`] is
//! what the file says and [`Config`] is the checked form the engine uses.

use crate::{quantity, Error, Result};
use chrono::TimeDelta;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tortoise_k8s_api::{GoDuration, Quantity, ResourceName};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatheringDataPeriod {
    Daily,
    #[default]
    Weekly,
}

impl GatheringDataPeriod {
    /// How long a (container, resource) pair gathers data before its
    /// recommendations are trusted.
    pub fn threshold(&self) -> TimeDelta {
        match self {
            Self::Daily => TimeDelta::days(1),
            Self::Weekly => TimeDelta::days(7),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase", deny_unknown_fields)]
pub struct RawConfig {
    pub range_of_min_max_replicas_recommendation_hours: u32,
    #[serde(rename = "TTLHoursOfMinMaxReplicasRecommendation")]
    pub ttl_hours_of_min_max_replicas_recommendation: u32,
    pub gathering_data_period_type: GatheringDataPeriod,
    pub max_replicas_factor: f64,
    pub min_replicas_factor: f64,
    pub replica_reduction_factor: f64,
    pub minimum_min_replicas: i32,
    pub maximum_max_replicas: i32,
    pub minimum_target_resource_utilization: i32,
    pub maximum_target_resource_utilization: i32,
    pub preferred_max_replicas: i32,
    #[serde(rename = "MaximumCPURequest", deserialize_with = "lenient_quantity")]
    pub maximum_cpu_request: Quantity,
    #[serde(deserialize_with = "lenient_quantity")]
    pub maximum_memory_request: Quantity,
    #[serde(rename = "MinimumCPULimit", deserialize_with = "lenient_quantity")]
    pub minimum_cpu_limit: Quantity,
    pub resource_limit_multiplier: BTreeMap<ResourceName, i64>,
    pub time_zone: String,
    pub tortoise_update_interval: GoDuration,
    #[serde(rename = "HPAExternalMetricExclusionRegex")]
    pub hpa_external_metric_exclusion_regex: Option<String>,
}

// YAML readers tend to write bare numbers such as `MaximumCPURequest: 10`.
fn lenient_quantity<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Quantity, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }
    Ok(Quantity(match Raw::deserialize(d)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    }))
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            range_of_min_max_replicas_recommendation_hours: 1,
            ttl_hours_of_min_max_replicas_recommendation: 24 * 7 * 4,
            gathering_data_period_type: GatheringDataPeriod::Weekly,
            max_replicas_factor: 2.0,
            min_replicas_factor: 0.5,
            replica_reduction_factor: 0.95,
            minimum_min_replicas: 3,
            maximum_max_replicas: 100,
            minimum_target_resource_utilization: 65,
            maximum_target_resource_utilization: 90,
            preferred_max_replicas: 30,
            maximum_cpu_request: Quantity("10".to_string()),
            maximum_memory_request: Quantity("64Gi".to_string()),
            minimum_cpu_limit: Quantity("0".to_string()),
            resource_limit_multiplier: BTreeMap::new(),
            time_zone: "Asia/Tokyo".to_string(),
            tortoise_update_interval: GoDuration::from_secs(15),
            hpa_external_metric_exclusion_regex: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub range_of_min_max_replicas_recommendation_hours: u32,
    pub ttl_of_min_max_replicas_recommendation: TimeDelta,
    pub gathering_data_period: GatheringDataPeriod,
    pub max_replicas_factor: f64,
    pub min_replicas_factor: f64,
    pub replica_reduction_factor: f64,
    pub minimum_min_replicas: i32,
    pub maximum_max_replicas: i32,
    pub minimum_target_resource_utilization: i32,
    pub maximum_target_resource_utilization: i32,
    pub preferred_max_replicas: i32,
    /// Cluster-wide request ceilings in milli-units.
    pub maximum_request: BTreeMap<ResourceName, i64>,
    pub minimum_cpu_limit: i64,
    pub resource_limit_multiplier: BTreeMap<ResourceName, i64>,
    pub time_zone: chrono_tz::Tz,
    pub tortoise_update_interval: Duration,
    /// Matches whole external metric names that are dropped from steered
    /// HorizontalPodAutoscalers.
    pub hpa_external_metric_exclusion: Option<Regex>,
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default()
            .validate()
            .unwrap_or_else(|error| unreachable!("default configuration is valid: {error}"))
    }
}

impl RawConfig {
    pub fn validate(self) -> Result<Config> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        let range = self.range_of_min_max_replicas_recommendation_hours;
        if range == 0 || 24 % range != 0 {
            return invalid(format!(
                "RangeOfMinMaxReplicasRecommendationHours must divide 24, got {range}"
            ));
        }
        for (key, factor) in [
            ("MaxReplicasFactor", self.max_replicas_factor),
            ("MinReplicasFactor", self.min_replicas_factor),
            ("ReplicaReductionFactor", self.replica_reduction_factor),
        ] {
            if !factor.is_finite() || factor <= 0.0 {
                return invalid(format!("{key} must be positive, got {factor}"));
            }
        }
        if self.replica_reduction_factor >= 1.0 {
            return invalid(format!(
                "ReplicaReductionFactor must be below 1, got {}",
                self.replica_reduction_factor
            ));
        }
        if self.minimum_min_replicas < 1 {
            return invalid("MinimumMinReplicas must be at least 1".to_string());
        }
        if self.maximum_max_replicas < self.minimum_min_replicas {
            return invalid("MaximumMaxReplicas must not be below MinimumMinReplicas".to_string());
        }
        let (lo, hi) = (
            self.minimum_target_resource_utilization,
            self.maximum_target_resource_utilization,
        );
        if !(1..=100).contains(&lo) || !(1..=100).contains(&hi) || lo > hi {
            return invalid(format!(
                "target utilization bounds must satisfy 1 <= {lo} <= {hi} <= 100"
            ));
        }
        let too_small = self.resource_limit_multiplier.iter().find(|(_, m)| **m < 1);
        if let Some((resource, m)) = too_small {
            return invalid(format!(
                "ResourceLimitMultiplier for {resource} must be at least 1, got {m}"
            ));
        }

        let time_zone = self
            .time_zone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| Error::InvalidConfig(format!("TimeZone {:?}: {e}", self.time_zone)))?;

        let hpa_external_metric_exclusion = self
            .hpa_external_metric_exclusion_regex
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| Regex::new(&format!("^(?:{r})$")))
            .transpose()
            .map_err(|e| Error::InvalidConfig(format!("HPAExternalMetricExclusionRegex: {e}")))?;

        let maximum_request = [
            (ResourceName::Cpu, quantity::parse_milli(&self.maximum_cpu_request)?),
            (ResourceName::Memory, quantity::parse_milli(&self.maximum_memory_request)?),
        ]
        .into_iter()
        .collect();

        Ok(Config {
            range_of_min_max_replicas_recommendation_hours: range,
            ttl_of_min_max_replicas_recommendation: TimeDelta::hours(
                self.ttl_hours_of_min_max_replicas_recommendation.into(),
            ),
            gathering_data_period: self.gathering_data_period_type,
            max_replicas_factor: self.max_replicas_factor,
            min_replicas_factor: self.min_replicas_factor,
            replica_reduction_factor: self.replica_reduction_factor,
            minimum_min_replicas: self.minimum_min_replicas,
            maximum_max_replicas: self.maximum_max_replicas,
            minimum_target_resource_utilization: lo,
            maximum_target_resource_utilization: hi,
            preferred_max_replicas: self.preferred_max_replicas,
            maximum_request,
            minimum_cpu_limit: quantity::parse_milli(&self.minimum_cpu_limit)?,
            resource_limit_multiplier: self.resource_limit_multiplier,
            time_zone,
            tortoise_update_interval: self.tortoise_update_interval.into(),
            hpa_external_metric_exclusion,
        })
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: RawConfig = if yaml.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfig(e.to_string()))?
        };
        raw.validate()
    }

    pub fn limit_multiplier(&self, resource: ResourceName) -> i64 {
        self.resource_limit_multiplier
            .get(&resource)
            .copied()
            .unwrap_or(1)
    }

    pub fn ceiling(&self, resource: ResourceName) -> Option<i64> {
        self.maximum_request.get(&resource).copied()
    }

    /// True when `name` is an external metric the controller strips from
    /// HorizontalPodAutoscalers.
    pub fn excludes_external_metric(&self, name: &str) -> bool {
        self.hpa_external_metric_exclusion
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = Config::from_yaml("").unwrap();
        assert_eq!(cfg.minimum_min_replicas, 3);
        assert_eq!(cfg.maximum_max_replicas, 100);
        assert_eq!(cfg.ttl_of_min_max_replicas_recommendation, TimeDelta::hours(672));
        assert_eq!(cfg.time_zone, chrono_tz::Asia::Tokyo);
        assert_eq!(cfg.tortoise_update_interval, Duration::from_secs(15));
        assert_eq!(cfg.ceiling(ResourceName::Cpu), Some(10_000));
        assert_eq!(cfg.gathering_data_period, GatheringDataPeriod::Weekly);
    }

    #[test]
    fn parses_pascal_case_keys() {
        let cfg = Config::from_yaml(
            r#"
RangeOfMinMaxReplicasRecommendationHours: 2
TTLHoursOfMinMaxReplicasRecommendation: 24
GatheringDataPeriodType: daily
MinimumMinReplicas: 2
MaximumCPURequest: 4
MinimumCPULimit: 50m
ResourceLimitMultiplier:
  cpu: 3
TimeZone: UTC
TortoiseUpdateInterval: 1m30s
HPAExternalMetricExclusionRegex: "datadogmetric@.*"
"#,
        )
        .unwrap();
        assert_eq!(cfg.range_of_min_max_replicas_recommendation_hours, 2);
        assert_eq!(cfg.ttl_of_min_max_replicas_recommendation, TimeDelta::hours(24));
        assert_eq!(cfg.gathering_data_period, GatheringDataPeriod::Daily);
        assert_eq!(cfg.minimum_min_replicas, 2);
        assert_eq!(cfg.ceiling(ResourceName::Cpu), Some(4000));
        assert_eq!(cfg.minimum_cpu_limit, 50);
        assert_eq!(cfg.limit_multiplier(ResourceName::Cpu), 3);
        assert_eq!(cfg.limit_multiplier(ResourceName::Memory), 1);
        assert_eq!(cfg.time_zone, chrono_tz::UTC);
        assert_eq!(cfg.tortoise_update_interval, Duration::from_secs(90));
    }

    #[test]
    fn exclusion_regex_is_anchored() {
        let cfg =
            Config::from_yaml("HPAExternalMetricExclusionRegex: \"datadogmetric@.*\"").unwrap();
        assert!(cfg.excludes_external_metric("datadogmetric@ns:app-cpu"));
        assert!(!cfg.excludes_external_metric("prefix-datadogmetric@ns:app-cpu"));
        assert!(!Config::default().excludes_external_metric("anything"));
    }

    #[test]
    fn rejects_invalid_values() {
        for yaml in [
            "RangeOfMinMaxReplicasRecommendationHours: 5",
            "MinimumTargetResourceUtilization: 95",
            "MaxReplicasFactor: 0",
            "ReplicaReductionFactor: 1.5",
            "TimeZone: Mars/Olympus",
            "HPAExternalMetricExclusionRegex: \"(\"",
            "MaximumCPURequest: lots",
            "UnknownKey: 1",
        ] {
            assert!(
                matches!(
                    Config::from_yaml(yaml),
                    Err(Error::InvalidConfig(_)) | Err(Error::InvalidQuantity(_))
                ),
                "{yaml} must be rejected"
            );
        }
    }
}
