use crate::{
    admission::Admission,
    controller::{self, Context},
    core::Config,
    k8s::{Client, Resource, VerticalPodAutoscaler},
    metrics::Metrics,
};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "tortoise", about = "A workload autoscaling controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "tortoise=info,warn",
        env = "TORTOISE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Path to the YAML controller configuration. Defaults apply when unset.
    #[clap(long, env = "TORTOISE_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of Tortoises reconciled concurrently.
    #[clap(long, default_value = "16")]
    max_concurrent_reconciles: u16,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            config,
            max_concurrent_reconciles,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let config = match config {
            Some(path) => {
                let yaml = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Config::from_yaml(&yaml).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Config::default(),
        };
        let config = Arc::new(config);

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("tortoise"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let vpa_available = api_resource_exists::<VerticalPodAutoscaler>(&client).await;
        if !vpa_available {
            warn!(
                "verticalpodautoscalers.autoscaling.k8s.io resource kind not found, \
                 Tortoises will not leave Initializing"
            );
        }
        info!(
            update_interval = ?config.tortoise_update_interval,
            time_zone = %config.time_zone,
            "Configured"
        );

        let ctx = Context::new(client.clone(), config.clone(), metrics, vpa_available);
        tokio::spawn(
            controller::run(
                ctx,
                usize::from(max_concurrent_reconciles),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("tortoises")),
        );

        let runtime = runtime.spawn_server(move || Admission::new(client.clone(), config.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
