//! podlink: forward cluster-internal Kubernetes services to your local
//! machine without any cluster setup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use podlink_core::config::{Config, ForwardConfig, PodTarget, Target};
use podlink_core::{KubeClient, RunOptions, Supervisor};

const RESOURCE_TYPE_POD: &str = "pod";

#[derive(Parser)]
#[command(name = "podlink")]
#[command(version)]
#[command(about = "Port forward internal Kubernetes services to your local machine")]
#[command(long_about = "Forward cluster-internal services and domains to your local machine \
without any cluster setup.

Requires sudo to modify /etc/hosts and create network aliases for transparent access.

EXAMPLES:

1. Using config file:
   podlink --config path/to/config.yaml

2. Using CLI options:
   podlink -t pod/app=backend -n default -c service -f \"postgres:5432,redis:6379\"
   podlink -t app=web -n production -c service -f \"{{.DB_HOST}}:{{.DB_PORT}}\"

3. Multiple forwards with CLI:
   podlink -t pod/app=api -n staging -c service -f \"db.internal:5432,cache.internal:6379\"")]
struct Cli {
    /// Path to YAML configuration file, otherwise use command line options
    /// to provide configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Custom forwarder agent binary (optional)
    #[arg(long = "forwarder-agent")]
    forwarder_agent: Option<PathBuf>,

    /// Save target pod environment variables to .envs/ directory
    #[arg(long = "save-target-envar")]
    save_target_envar: bool,

    /// Target resource with label selector. Format: 'pod/labelSelector' or
    /// just 'labelSelector' (defaults to pod)
    #[arg(short = 't')]
    target: Option<String>,

    /// Kubernetes namespace
    #[arg(short = 'n', default_value = "default")]
    namespace: String,

    /// Container name within the pod (e.g. 'service')
    #[arg(short = 'c')]
    container: Option<String>,

    /// Comma-separated list of target addresses to forward
    /// (e.g. 'postgres:5432,{{.REDIS_HOST}}:{{.REDIS_PORT}}')
    #[arg(short = 'f')]
    forwards: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env()
        .add_directive("podlink_cli=info".parse()?)
        .add_directive("podlink_core=info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path).context("unable to read config")?,
        None => config_from_flags(&cli)?,
    };

    let client = KubeClient::connect()
        .await
        .context("unable to create cluster client")?;

    let options = RunOptions {
        forwarder_agent: cli.forwarder_agent.clone(),
        save_target_env: cli.save_target_envar,
    };

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("got interrupt/terminate, exiting");
            token.cancel();
        }
    });

    Supervisor::new(Arc::new(client), config, options)
        .run(token)
        .await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(error = %err, "unable to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Assemble a config from the `-t`/`-n`/`-c`/`-f` flag group.
fn config_from_flags(cli: &Cli) -> Result<Config> {
    let Some(target) = &cli.target else {
        bail!("target flag (-t) is required when not using config file");
    };
    let Some(container) = &cli.container else {
        bail!("container flag (-c) is required when not using config file");
    };
    let Some(forwards) = &cli.forwards else {
        bail!("forwards flag (-f) is required when not using config file");
    };

    let (resource_type, label_selector) =
        parse_target_flag(target).context("error parsing target")?;
    let forwards = parse_forwards_flag(forwards).context("error parsing forwards")?;

    let mut config = Config {
        forwards,
        ..Default::default()
    };
    if resource_type == RESOURCE_TYPE_POD {
        config.target = Target {
            pod: Some(PodTarget {
                namespace: cli.namespace.clone(),
                label_selector,
                container: container.clone(),
            }),
        };
    }

    Ok(config)
}

/// Parse the target flag: `pod/<labelSelector>` or a bare label selector
/// (the resource type defaults to pod; only pods are supported).
fn parse_target_flag(target: &str) -> Result<(String, String)> {
    if target.is_empty() {
        bail!("target cannot be empty");
    }

    if let Some((resource_type, label_selector)) = target.split_once('/') {
        if resource_type != RESOURCE_TYPE_POD {
            bail!("unknown resource type: {resource_type} (only '{RESOURCE_TYPE_POD}' is supported)");
        }
        if label_selector.is_empty() {
            bail!("label selector cannot be empty after '{RESOURCE_TYPE_POD}/'");
        }
        return Ok((resource_type.to_string(), label_selector.to_string()));
    }

    Ok((RESOURCE_TYPE_POD.to_string(), target.to_string()))
}

/// Parse comma-separated target addresses into forwards named
/// `forward-1`, `forward-2`, ... Empty segments are skipped.
fn parse_forwards_flag(raw: &str) -> Result<Vec<ForwardConfig>> {
    if raw.is_empty() {
        bail!("forwards flag cannot be empty");
    }

    let forwards: Vec<ForwardConfig> = raw
        .split(',')
        .enumerate()
        .filter_map(|(index, addr)| {
            let addr = addr.trim();
            if addr.is_empty() {
                return None;
            }
            Some(ForwardConfig {
                name: format!("forward-{}", index + 1),
                target_addr: addr.to_string(),
                ..Default::default()
            })
        })
        .collect();

    if forwards.is_empty() {
        bail!("forwards flag contains no addresses");
    }
    Ok(forwards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_flag_with_prefix() {
        let (resource, selector) = parse_target_flag("pod/app=backend").unwrap();
        assert_eq!(resource, "pod");
        assert_eq!(selector, "app=backend");
    }

    #[test]
    fn test_parse_target_flag_defaults_to_pod() {
        let (resource, selector) = parse_target_flag("app=backend").unwrap();
        assert_eq!(resource, "pod");
        assert_eq!(selector, "app=backend");
    }

    #[test]
    fn test_parse_target_flag_rejects_unknown_resource() {
        assert!(parse_target_flag("deployment/app=backend").is_err());
        assert!(parse_target_flag("pod/").is_err());
        assert!(parse_target_flag("").is_err());
    }

    #[test]
    fn test_parse_forwards_flag() {
        let forwards = parse_forwards_flag("postgres:5432, redis:6379 ,,").unwrap();
        assert_eq!(forwards.len(), 2);
        assert_eq!(forwards[0].name, "forward-1");
        assert_eq!(forwards[0].target_addr, "postgres:5432");
        assert_eq!(forwards[1].name, "forward-2");
        assert_eq!(forwards[1].target_addr, "redis:6379");
    }

    #[test]
    fn test_parse_forwards_flag_rejects_empty() {
        assert!(parse_forwards_flag("").is_err());
        assert!(parse_forwards_flag(" , ,").is_err());
    }

    #[test]
    fn test_config_from_flags_requires_triple() {
        let cli = Cli::parse_from(["podlink", "-t", "app=backend"]);
        assert!(config_from_flags(&cli).is_err());

        let cli = Cli::parse_from([
            "podlink",
            "-t",
            "pod/app=backend",
            "-n",
            "staging",
            "-c",
            "service",
            "-f",
            "db:5432",
        ]);
        let config = config_from_flags(&cli).unwrap();
        let pod = config.target.pod.unwrap();
        assert_eq!(pod.namespace, "staging");
        assert_eq!(pod.label_selector, "app=backend");
        assert_eq!(pod.container, "service");
        assert_eq!(config.forwards.len(), 1);
    }
}
