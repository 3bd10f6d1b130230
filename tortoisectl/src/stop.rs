use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource,
};
use std::fmt;
use tortoise_core::{pod, quantity, Config};
use tortoise_k8s_api::{
    annotations, tortoise::ContainerResourceRequests, Deployment, PodTemplateSpec, Tortoise,
    UpdateMode,
};
use tracing::{debug, info};

const FIELD_MANAGER: &str = "tortoisectl";

pub(crate) struct Stopper {
    client: Client,
    recorder: Recorder,
    no_lowering_resources: bool,
    config: Config,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    AlreadyOff,
    Restarted,
    Raised,
    Unchanged,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlreadyOff => "already Off, skipped",
            Self::Restarted => "stopped, workload restarted",
            Self::Raised => "stopped, workload template raised to current resources",
            Self::Unchanged => "stopped, workload left unchanged",
        })
    }
}

impl Stopper {
    pub(crate) fn new(client: Client, no_lowering_resources: bool, config: Config) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            no_lowering_resources,
            config,
        }
    }

    pub(crate) async fn stop(&self, ns: &str, name: &str) -> Result<Outcome> {
        let tortoises = Api::<Tortoise>::namespaced(self.client.clone(), ns);
        let t = tortoises
            .get(name)
            .await
            .with_context(|| format!("getting Tortoise {name}"))?;
        if t.spec.update_mode == UpdateMode::Off {
            return Ok(Outcome::AlreadyOff);
        }

        let patch = serde_json::json!({ "spec": { "updateMode": UpdateMode::Off } });
        tortoises
            .patch(name, &params(), &Patch::Merge(patch))
            .await
            .context("turning the Tortoise off")?;
        info!(%ns, %name, "Set updateMode to Off");

        let target = &t.spec.target_refs.scale_target_ref;
        let deploys = Api::<Deployment>::namespaced(self.client.clone(), ns);
        let deploy = deploys
            .get(&target.name)
            .await
            .with_context(|| format!("getting Deployment {}", target.name))?;

        if self.no_lowering_resources {
            let desired = t
                .status
                .as_ref()
                .map(|s| s.conditions.container_resource_requests.as_slice())
                .unwrap_or_default();
            let Some(mut template) = deploy.spec.map(|s| s.template) else {
                return Ok(Outcome::Unchanged);
            };
            if !raise_requests(&mut template, desired, &self.config) {
                return Ok(Outcome::Unchanged);
            }
            let containers = template.spec.map(|s| s.containers).unwrap_or_default();
            let patch = serde_json::json!({
                "spec": { "template": { "spec": { "containers": containers } } },
            });
            deploys
                .patch(&target.name, &params(), &Patch::Strategic(patch))
                .await
                .context("raising the Deployment's requests")?;
            return Ok(Outcome::Raised);
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let restarted = serde_json::Map::from_iter([(
            annotations::RESTARTED_AT.to_string(),
            serde_json::Value::String(now),
        )]);
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": restarted } } },
        });
        deploys
            .patch(&target.name, &params(), &Patch::Merge(patch))
            .await
            .context("restarting the Deployment")?;

        let event = Event {
            type_: EventType::Normal,
            reason: "RestartDeployment".to_string(),
            note: Some(format!(
                "Deployment {} is restarted to bring pods back to their original resources",
                target.name
            )),
            action: "Stop".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, &t.object_ref(&())).await {
            debug!(%error, "Failed to publish event");
        }
        Ok(Outcome::Restarted)
    }
}

fn params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Raises each container's requests in `template` to what the pod webhook
/// would set, scaling limits alongside. Requests are never lowered.
/// Returns true when anything changed.
pub(crate) fn raise_requests(
    template: &mut PodTemplateSpec,
    desired: &[ContainerResourceRequests],
    cfg: &Config,
) -> bool {
    let Some(spec) = template.spec.as_mut() else {
        return false;
    };
    let mut changed = false;
    for container in spec.containers.iter_mut() {
        let want = pod::webhook_requests(desired, &container.name);
        if want.is_empty() {
            continue;
        }
        let resources = container.resources.get_or_insert_with(Default::default);
        let requests = resources.requests.get_or_insert_with(Default::default);
        for (resource, new_request) in want {
            let key = resource.as_str();
            let current = requests.get(key).and_then(quantity::parse_or_warn);
            if current.is_some_and(|c| c >= new_request) {
                continue;
            }
            requests.insert(key.to_string(), quantity::format(resource, new_request));
            changed = true;

            let limit = resources
                .limits
                .as_mut()
                .and_then(|l| l.get_mut(key).map(|q| (quantity::parse_or_warn(q), q)));
            if let Some((Some(old_limit), q)) = limit {
                let new_limit = pod::scale_limit(resource, current, old_limit, new_request, cfg);
                *q = quantity::format(resource, new_limit);
            }
        }
        debug!(container = %container.name, "Raised requests");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use tortoise_k8s_api::{Container, PodSpec, Quantity, ResourceName, ResourceRequirements};

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn template(cpu: &str, limit: Option<&str>) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(btreemap! { "cpu".to_string() => q(cpu) }),
                        limits: limit.map(|l| btreemap! { "cpu".to_string() => q(l) }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn desired(cpu: &str) -> Vec<ContainerResourceRequests> {
        vec![ContainerResourceRequests {
            container_name: "app".to_string(),
            resource: btreemap! { ResourceName::Cpu => q(cpu) },
        }]
    }

    fn requests(t: &PodTemplateSpec) -> ResourceRequirements {
        t.spec.as_ref().unwrap().containers[0]
            .resources
            .clone()
            .unwrap()
    }

    #[test]
    fn raises_templates_to_current_pod_requests() {
        let mut t = template("200m", None);
        assert!(raise_requests(&mut t, &desired("500m"), &Config::default()));
        let r = requests(&t);
        assert_eq!(r.requests.unwrap()["cpu"], q("500m"));
        assert_eq!(r.limits, None);
    }

    #[test]
    fn never_lowers_templates() {
        let mut t = template("800m", None);
        assert!(!raise_requests(&mut t, &desired("500m"), &Config::default()));
        assert_eq!(requests(&t).requests.unwrap()["cpu"], q("800m"));
    }

    #[test]
    fn limits_follow_raised_requests() {
        let mut t = template("200m", Some("400m"));
        assert!(raise_requests(&mut t, &desired("500m"), &Config::default()));
        assert_eq!(requests(&t).limits.unwrap()["cpu"], q("1"));
    }

    #[test]
    fn limits_use_the_controller_multiplier() {
        let cfg = Config {
            resource_limit_multiplier: btreemap! { ResourceName::Cpu => 3 },
            ..Default::default()
        };
        let mut t = template("200m", Some("300m"));
        assert!(raise_requests(&mut t, &desired("500m"), &cfg));
        assert_eq!(requests(&t).limits.unwrap()["cpu"], q("1500m"));
    }
}
