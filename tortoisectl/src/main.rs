#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kube::{
    api::{Api, ListParams, ResourceExt},
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};
use std::path::PathBuf;
use tortoise_core::Config;
use tortoise_k8s_api::Tortoise;

mod stop;

/// Operates Tortoises from the command line
#[derive(Parser)]
#[clap(name = "tortoisectl", version, about)]
struct Args {
    #[clap(long, env = "TORTOISECTL_LOG_LEVEL", default_value = "warn")]
    log_level: kubert::LogFilter,

    #[clap(long, env = "TORTOISECTL_LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Path to a kubeconfig. Defaults to the usual discovery rules.
    #[clap(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Turns Tortoises off and restarts their workloads so pods go back to
    /// the resources in their templates
    Stop {
        /// Names of the Tortoises to stop
        names: Vec<String>,

        /// Namespace of the Tortoises
        #[clap(long, short = 'n')]
        namespace: Option<String>,

        /// Stop every Tortoise in the namespace, or in the cluster when no
        /// namespace is given
        #[clap(long, short = 'A')]
        all: bool,

        /// Raise workload templates to the resources pods currently get
        /// instead of restarting them
        #[clap(long)]
        no_lowering_resources: bool,

        /// The controller's YAML configuration, used to size limits the way
        /// the pod webhook does
        #[clap(long, env = "TORTOISE_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        kubeconfig,
        command,
    } = Args::parse();

    log_format
        .try_init(log_level)
        .context("must configure logging")?;

    let client = client(kubeconfig).await?;

    match command {
        Command::Stop {
            names,
            namespace,
            all,
            no_lowering_resources,
            config,
        } => {
            let config = load_config(config)?;
            let targets = targets(&client, names, namespace, all).await?;
            let stopper = stop::Stopper::new(client, no_lowering_resources, config);
            let mut failed = 0usize;
            for (ns, name) in targets {
                match stopper.stop(&ns, &name).await {
                    Ok(outcome) => println!("{ns}/{name}: {outcome}"),
                    Err(error) => {
                        failed += 1;
                        eprintln!("{ns}/{name}: {error:#}");
                    }
                }
            }
            if failed > 0 {
                bail!("failed to stop {failed} Tortoise(s)");
            }
        }
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let yaml =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Config::from_yaml(&yaml).with_context(|| format!("parsing {}", path.display()))
}

async fn client(kubeconfig: Option<PathBuf>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await?;
    Ok(Client::try_from(config)?)
}

/// Resolves the (namespace, name) pairs to stop.
async fn targets(
    client: &Client,
    names: Vec<String>,
    namespace: Option<String>,
    all: bool,
) -> Result<Vec<(String, String)>> {
    if all {
        if !names.is_empty() {
            bail!("names cannot be given with --all");
        }
        let api = match namespace.as_deref() {
            Some(ns) => Api::<Tortoise>::namespaced(client.clone(), ns),
            None => Api::<Tortoise>::all(client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        return Ok(list
            .items
            .iter()
            .map(|t| (t.namespace().unwrap_or_default(), t.name_any()))
            .collect());
    }

    if names.is_empty() {
        bail!("at least one Tortoise name or --all is required");
    }
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    Ok(names.into_iter().map(|n| (ns.clone(), n)).collect())
}
