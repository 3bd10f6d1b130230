use crate::{
    core::engine::Proposals,
    k8s::{ResourceName, TortoisePhase, UpdateMode},
};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, linear_buckets, Histogram},
    },
    registry::Registry,
};
use std::{collections::HashMap, sync::Arc};

const PHASES: [TortoisePhase; 6] = [
    TortoisePhase::Initializing,
    TortoisePhase::GatheringData,
    TortoisePhase::PartlyWorking,
    TortoisePhase::Working,
    TortoisePhase::Emergency,
    TortoisePhase::BackToNormal,
];

const MODES: [UpdateMode; 3] = [UpdateMode::Off, UpdateMode::Auto, UpdateMode::Emergency];

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    target_utilization: Family<ContainerLabels, Histogram>,
    min_replicas: Family<TortoiseLabels, Histogram>,
    max_replicas: Family<TortoiseLabels, Histogram>,
    cpu_request: Family<ContainerLabels, Histogram>,
    memory_request: Family<ContainerLabels, Histogram>,
    reconciles: Counter,
    reconcile_failures: Counter,
    tortoises: Family<StateLabels, Gauge>,
    states: Arc<Mutex<HashMap<TortoiseLabels, (TortoisePhase, UpdateMode)>>>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TortoiseLabels {
    tortoise: String,
    namespace: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ContainerLabels {
    tortoise: String,
    namespace: String,
    container: String,
    resource: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct StateLabels {
    phase: &'static str,
    update_mode: &'static str,
}

fn mode_label(mode: UpdateMode) -> &'static str {
    match mode {
        UpdateMode::Off => "Off",
        UpdateMode::Auto => "Auto",
        UpdateMode::Emergency => "Emergency",
    }
}

// === impl Metrics ===

impl Metrics {
    pub(crate) fn register(reg: &mut Registry) -> Self {
        let target_utilization = Family::<ContainerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(linear_buckets(10.0, 10.0, 10))
        });
        reg.register(
            "proposed_hpa_target_utilization",
            "Target utilization proposed for a container resource",
            target_utilization.clone(),
        );

        let min_replicas = Family::<TortoiseLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(1.0, 2.0, 10))
        });
        reg.register(
            "proposed_hpa_min_replicas",
            "minReplicas proposed for the HorizontalPodAutoscaler",
            min_replicas.clone(),
        );

        let max_replicas = Family::<TortoiseLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(1.0, 2.0, 10))
        });
        reg.register(
            "proposed_hpa_max_replicas",
            "maxReplicas proposed for the HorizontalPodAutoscaler",
            max_replicas.clone(),
        );

        let cpu_request = Family::<ContainerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(10.0, 2.0, 14))
        });
        reg.register(
            "proposed_cpu_request_millicores",
            "CPU request proposed for a container",
            cpu_request.clone(),
        );

        let memory_request = Family::<ContainerLabels, Histogram>::new_with_constructor(|| {
            // 16Mi through 32Gi.
            Histogram::new(exponential_buckets(16.0 * 1024.0 * 1024.0, 2.0, 12))
        });
        reg.register(
            "proposed_memory_request_bytes",
            "Memory request proposed for a container",
            memory_request.clone(),
        );

        let reconciles = Counter::default();
        reg.register("reconciles", "Total number of Tortoise reconciliations", reconciles.clone());

        let reconcile_failures = Counter::default();
        reg.register(
            "reconcile_failures",
            "Total number of failed Tortoise reconciliations",
            reconcile_failures.clone(),
        );

        let tortoises = Family::<StateLabels, Gauge>::default();
        reg.register(
            "tortoises",
            "Number of Tortoises by phase and update mode",
            tortoises.clone(),
        );

        Self {
            target_utilization,
            min_replicas,
            max_replicas,
            cpu_request,
            memory_request,
            reconciles,
            reconcile_failures,
            tortoises,
            states: Default::default(),
        }
    }

    pub(crate) fn reconciled(&self) {
        self.reconciles.inc();
    }

    pub(crate) fn failed(&self) {
        self.reconciles.inc();
        self.reconcile_failures.inc();
    }

    pub(crate) fn observe(&self, namespace: &str, name: &str, proposals: &Proposals) {
        let tortoise = TortoiseLabels {
            tortoise: name.to_string(),
            namespace: namespace.to_string(),
        };
        let container = |container: &str, resource: ResourceName| ContainerLabels {
            tortoise: name.to_string(),
            namespace: namespace.to_string(),
            container: container.to_string(),
            resource: resource.as_str(),
        };

        for (c, r, v) in &proposals.target_utilizations {
            self.target_utilization
                .get_or_create(&container(c, *r))
                .observe(f64::from(*v));
        }
        if let Some(min) = proposals.min_replicas {
            self.min_replicas.get_or_create(&tortoise).observe(f64::from(min));
        }
        if let Some(max) = proposals.max_replicas {
            self.max_replicas.get_or_create(&tortoise).observe(f64::from(max));
        }
        for (c, r, milli) in &proposals.requests {
            match r {
                ResourceName::Cpu => self
                    .cpu_request
                    .get_or_create(&container(c, *r))
                    .observe(*milli as f64),
                ResourceName::Memory => self
                    .memory_request
                    .get_or_create(&container(c, *r))
                    .observe(*milli as f64 / 1000.0),
            }
        }
    }

    /// Records the state of a Tortoise and recomputes the state gauge.
    pub(crate) fn set_state(
        &self,
        namespace: &str,
        name: &str,
        phase: TortoisePhase,
        mode: UpdateMode,
    ) {
        let key = TortoiseLabels {
            tortoise: name.to_string(),
            namespace: namespace.to_string(),
        };
        let mut states = self.states.lock();
        states.insert(key, (phase, mode));
        self.recount(&states);
    }

    pub(crate) fn forget(&self, namespace: &str, name: &str) {
        let key = TortoiseLabels {
            tortoise: name.to_string(),
            namespace: namespace.to_string(),
        };
        let mut states = self.states.lock();
        states.remove(&key);
        self.recount(&states);
    }

    fn recount(&self, states: &HashMap<TortoiseLabels, (TortoisePhase, UpdateMode)>) {
        for phase in PHASES {
            for mode in MODES {
                let n = states.values().filter(|s| **s == (phase, mode)).count();
                self.tortoises
                    .get_or_create(&StateLabels {
                        phase: phase.as_str(),
                        update_mode: mode_label(mode),
                    })
                    .set(n as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(m: &Metrics, phase: TortoisePhase, mode: UpdateMode) -> i64 {
        m.tortoises
            .get_or_create(&StateLabels {
                phase: phase.as_str(),
                update_mode: mode_label(mode),
            })
            .get()
    }

    #[test]
    fn state_gauge_tracks_each_tortoise_once() {
        let m = Metrics::register(&mut Registry::default());
        m.set_state("default", "a", TortoisePhase::GatheringData, UpdateMode::Auto);
        m.set_state("default", "b", TortoisePhase::GatheringData, UpdateMode::Auto);
        assert_eq!(count(&m, TortoisePhase::GatheringData, UpdateMode::Auto), 2);

        m.set_state("default", "a", TortoisePhase::Working, UpdateMode::Auto);
        assert_eq!(count(&m, TortoisePhase::GatheringData, UpdateMode::Auto), 1);
        assert_eq!(count(&m, TortoisePhase::Working, UpdateMode::Auto), 1);

        m.forget("default", "b");
        assert_eq!(count(&m, TortoisePhase::GatheringData, UpdateMode::Auto), 0);
    }
}
