use super::{Admission, Mutate, Validate};
use crate::{
    core::{engine, hpa},
    k8s::{Api, HorizontalPodAutoscaler, ListParams, ResourceExt, Tortoise},
};
use anyhow::{bail, Result};
use chrono::Utc;
use tracing::debug;

#[async_trait::async_trait]
impl Mutate<HorizontalPodAutoscaler> for Admission {
    async fn mutate(self, ns: &str, h: &mut HorizontalPodAutoscaler) -> Result<()> {
        let Some(t) = self.tortoise_for(ns, h).await? else {
            return Ok(());
        };
        if t.is_deleting() {
            return Ok(());
        }
        let current_min = h.spec.as_ref().and_then(|s| s.min_replicas);
        let Some(plan) = engine::hpa_plan_from_status(&t, current_min, Utc::now(), &self.config)
        else {
            return Ok(());
        };
        if hpa::apply(h, &plan, &self.config) {
            debug!(
                hpa = %h.name_any(),
                tortoise = %t.name_any(),
                "Rewrote HorizontalPodAutoscaler"
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Validate<HorizontalPodAutoscaler> for Admission {
    async fn validate(
        self,
        ns: &str,
        new: Option<HorizontalPodAutoscaler>,
        old: Option<HorizontalPodAutoscaler>,
    ) -> Result<()> {
        // Only deletions are guarded.
        let (None, Some(old)) = (new, old) else {
            return Ok(());
        };
        if let Some(t) = self.tortoise_for(ns, &old).await? {
            guard_delete(&old, &t)?;
        }
        Ok(())
    }
}

impl Admission {
    /// The Tortoise steering `h`: the one its annotation names, else any
    /// Tortoise in the namespace that targets it by name.
    async fn tortoise_for(
        &self,
        ns: &str,
        h: &HorizontalPodAutoscaler,
    ) -> Result<Option<Tortoise>> {
        let api = Api::<Tortoise>::namespaced(self.client.clone(), ns);
        if let Some(name) = hpa::tortoise_name(h) {
            if let Some(t) = api.get_opt(name).await? {
                return Ok(Some(t));
            }
        }
        let name = h.name_any();
        let tortoises = api.list(&ListParams::default()).await?;
        Ok(tortoises.items.into_iter().find(|t| targets(t, &name)))
    }
}

fn targets(t: &Tortoise, hpa_name: &str) -> bool {
    t.hpa_name() == hpa_name
}

pub(super) fn guard_delete(h: &HorizontalPodAutoscaler, t: &Tortoise) -> Result<()> {
    if t.is_deleting() || !targets(t, &h.name_any()) {
        return Ok(());
    }
    bail!(
        "HorizontalPodAutoscaler {} is managed by Tortoise {}; delete the Tortoise first",
        h.name_any(),
        t.name_any()
    )
}
