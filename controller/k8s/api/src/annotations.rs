//! Annotation keys shared by the controller, the webhooks and the CLI.

use std::collections::BTreeMap;

/// Binds a pod or a HorizontalPodAutoscaler to the Tortoise that steers it.
pub const TORTOISE_NAME: &str = "tortoises.autoscaling.mercari.com/tortoise-name";

/// Marks an object whose spec is managed by a Tortoise.
pub const MANAGED_BY_TORTOISE: &str = "tortoises.autoscaling.mercari.com/managed-by-tortoise";

/// Prefix of external metric names that carry a per-container CPU target.
pub const CONTAINER_BASED_CPU_METRIC_PREFIX: &str =
    "tortoises.autoscaling.mercari.com/container-based-cpu-metric-prefix";

/// Prefix of external metric names that carry a per-container memory target.
pub const CONTAINER_BASED_MEMORY_METRIC_PREFIX: &str =
    "tortoises.autoscaling.mercari.com/container-based-memory-metric-prefix";

pub const ISTIO_SIDECAR_INJECT: &str = "sidecar.istio.io/inject";
pub const ISTIO_PROXY_CPU: &str = "sidecar.istio.io/proxyCPU";
pub const ISTIO_PROXY_CPU_LIMIT: &str = "sidecar.istio.io/proxyCPULimit";
pub const ISTIO_PROXY_MEMORY: &str = "sidecar.istio.io/proxyMemory";
pub const ISTIO_PROXY_MEMORY_LIMIT: &str = "sidecar.istio.io/proxyMemoryLimit";

/// Name of the container that the istio injector adds to meshed pods.
pub const ISTIO_PROXY_CONTAINER: &str = "istio-proxy";

/// Pod-template annotation written to trigger a rolling restart.
pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Returns true when the annotations request istio sidecar injection.
pub fn istio_injected(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(ISTIO_SIDECAR_INJECT)
        .map(|v| v == "true")
        .unwrap_or(false)
}
