use super::{Admission, Mutate};
use crate::{
    core::pod,
    k8s::{
        annotations, Api, ListParams, ObjectMeta, Pod, ReplicaSet, ResourceExt, Tortoise,
        UpdateMode,
    },
};
use anyhow::Result;
use tracing::debug;

#[async_trait::async_trait]
impl Mutate<Pod> for Admission {
    async fn mutate(self, ns: &str, p: &mut Pod) -> Result<()> {
        let Some(t) = self.tortoise_for_pod(ns, &p.metadata).await? else {
            return Ok(());
        };
        apply(p, &t, &self.config);
        Ok(())
    }
}

/// Rewrites a pod's requests and limits from the Tortoise's desired
/// requests. Nothing changes while the Tortoise is `Off`.
pub(super) fn apply(p: &mut Pod, t: &Tortoise, cfg: &crate::core::Config) -> bool {
    if t.spec.update_mode == UpdateMode::Off {
        return false;
    }
    let Some(status) = t.status.as_ref() else {
        return false;
    };
    let desired = &status.conditions.container_resource_requests;
    let mut changed = false;
    if let Some(spec) = p.spec.as_mut() {
        changed |= pod::apply_to_spec(spec, desired, cfg);
    }
    changed |= pod::apply_to_istio_annotations(&mut p.metadata, desired, cfg);
    if changed {
        debug!(tortoise = %t.name_any(), "Rewrote pod resources");
    }
    changed
}

impl Admission {
    /// Resolves the Tortoise for a pod from its annotation, falling back to
    /// the owning ReplicaSet's Deployment.
    async fn tortoise_for_pod(&self, ns: &str, meta: &ObjectMeta) -> Result<Option<Tortoise>> {
        let tortoises = Api::<Tortoise>::namespaced(self.client.clone(), ns);
        if let Some(name) = meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::TORTOISE_NAME))
        {
            return Ok(tortoises.get_opt(name).await?);
        }

        let Some(rs_name) = owner(meta, "ReplicaSet") else {
            return Ok(None);
        };
        let Some(rs) = Api::<ReplicaSet>::namespaced(self.client.clone(), ns)
            .get_opt(&rs_name)
            .await?
        else {
            return Ok(None);
        };
        let Some(deploy) = owner(&rs.metadata, "Deployment") else {
            return Ok(None);
        };

        let list = tortoises.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().find(|t| {
            let target = &t.spec.target_refs.scale_target_ref;
            target.is_deployment() && target.name == deploy
        }))
    }
}

pub(super) fn owner(meta: &ObjectMeta, kind: &str) -> Option<String> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.kind == kind && o.controller == Some(true))
        .map(|o| o.name.clone())
}
