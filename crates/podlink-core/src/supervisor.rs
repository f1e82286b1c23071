//! The supervised lifecycle of one run.
//!
//! Startup walks a fixed order: resolve the carrier pod, scrape its
//! environment, materialize the config, stage and launch the relay agent,
//! tunnel the control port, confirm relay readiness, then bring up host
//! mappings, the data tunnels, and the keepalive ping loop. Every long-lived
//! task derives from one cancellation token; any child failure or an
//! external signal cancels it, and the supervisor joins all children and
//! unwinds host mappings before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use podlink_proto::DEFAULT_API_PORT;

use crate::cluster::{self, ClusterClient, PodRef, PodSummary};
use crate::config::{self, Config};
use crate::hosts::{HostRewriter, HostsFile, InstallError};
use crate::probe::IcmpProber;
use crate::stage;
use crate::tunnel::{self, TunnelSpec};

/// How long to wait for any single readiness signal.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive cadence against the relay's `/ping`.
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const PING_RETRY: Duration = Duration::from_secs(5);

/// Cadence for polling `/ready` while waiting for the relay to come up.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-run options that arrive from the CLI rather than the config file.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Override for the relay agent binary.
    pub forwarder_agent: Option<PathBuf>,
    /// Dump the scraped environment map to `./.envs/<pod>`.
    pub save_target_env: bool,
}

pub struct Supervisor {
    client: Arc<dyn ClusterClient>,
    config: Config,
    options: RunOptions,
}

impl Supervisor {
    pub fn new(client: Arc<dyn ClusterClient>, config: Config, options: RunOptions) -> Self {
        Self {
            client,
            config,
            options,
        }
    }

    /// Run until `token` is cancelled or a fatal error occurs. Returns `Ok`
    /// for a clean (signal-initiated) shutdown.
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        let mut rewriter = HostRewriter::new(HostsFile::system());
        rewriter.check_access();

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(1);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let run_result = self
            .run_phases(&token, &fatal_tx, &mut tasks, &mut rewriter)
            .await;

        // DRAINING: cancel everything, join every child, then unwind the
        // host mappings this run installed.
        token.cancel();
        join_all(&mut tasks).await;
        rewriter.cleanup();

        // A child's failure is the root cause even when the phase sequence
        // noticed the cancellation first.
        match fatal_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => run_result,
        }
    }

    async fn run_phases(
        &mut self,
        token: &CancellationToken,
        fatal_tx: &mpsc::Sender<anyhow::Error>,
        tasks: &mut Vec<JoinHandle<()>>,
        rewriter: &mut HostRewriter,
    ) -> anyhow::Result<()> {
        let pod_target = self
            .config
            .target
            .pod
            .clone()
            .ok_or_else(|| anyhow!("no pod target configured"))?;

        if let Some(context) = self.client.context_name() {
            info!(context, "find target pod on cluster");
        }

        // INIT -> TARGET_FOUND
        let pods = self
            .client
            .list_pods(&pod_target.namespace, &pod_target.label_selector)
            .await
            .context("unable to find target pod")?;
        let target_pod = select_target(&pods).ok_or_else(|| {
            anyhow!(
                "ready target pod not found for selector {}",
                pod_target.label_selector
            )
        })?;
        let target = PodRef {
            namespace: pod_target.namespace.clone(),
            name: target_pod.name.clone(),
            container: pod_target.container.clone(),
        };
        info!(pod = %target.name, namespace = %target.namespace, "found target pod");

        // TARGET_FOUND -> ENV_SCRAPED
        let env = cluster::scrape_env(self.client.as_ref(), &target)
            .await
            .context("unable to get environment variables from target pod")?;
        if self.options.save_target_env {
            let path = save_env_file(Path::new("./.envs"), &target.name, &env)?;
            info!(path = %path.display(), "saved target pod environment");
        }

        // ENV_SCRAPED -> CONFIG_BOUND
        config::materialize(&mut self.config, &env, &IcmpProber)
            .context("unable to render environment variables to config")?;
        let forwards: Vec<_> = self
            .config
            .forwards
            .iter()
            .filter(|f| f.is_active())
            .cloned()
            .collect();
        if forwards.is_empty() {
            bail!("no forwards to run after materialization");
        }

        // CONFIG_BOUND -> RELAY_STAGED
        let agent_path = resolve_agent_path(&self.options, &self.config)?;
        let staged = stage::stage_agent(self.client.as_ref(), &target, &agent_path)
            .await
            .context("unable to stage forwarder agent")?;

        // RELAY_STAGED -> RELAY_RUNNING
        let (marker_tx, mut marker_rx) = mpsc::channel::<()>(4);
        let command = stage::launch_command(&staged, &forwards);
        tasks.push(spawn_fatal("relay agent", token.clone(), fatal_tx.clone(), {
            let client = self.client.clone();
            let target = target.clone();
            let token = token.clone();
            async move {
                // Cancellation drops the exec stream, which is what reaps
                // the in-pod relay.
                tokio::select! {
                    result = stage::run_agent(client.as_ref(), &target, command, marker_tx) => {
                        result.map_err(|e| anyhow!(e).context("error on relay agent"))
                    }
                    _ = token.cancelled() => Ok(()),
                }
            }
        }));

        // RELAY_RUNNING -> CONTROL_TUNNELED
        let (control_ready_tx, mut control_ready_rx) = mpsc::channel::<()>(1);
        tasks.push(spawn_fatal(
            "control tunnel",
            token.clone(),
            fatal_tx.clone(),
            {
                let client = self.client.clone();
                let namespace = target.namespace.clone();
                let pod = target.name.clone();
                let token = token.clone();
                let spec = TunnelSpec {
                    name: "control-api".to_string(),
                    local_host: "127.0.0.1".to_string(),
                    local_port: DEFAULT_API_PORT,
                    pod_port: DEFAULT_API_PORT,
                };
                async move {
                    tunnel::serve(client, namespace, pod, spec, token, control_ready_tx)
                        .await
                        .map_err(|e| anyhow!(e).context("forwarder agent api port err"))
                }
            },
        ));
        wait_ready(&mut control_ready_rx, "forwarder agent api port").await?;

        // CONTROL_TUNNELED -> relay-ready: stdout marker or the tunneled
        // /ready endpoint, whichever answers first.
        wait_relay_ready(&mut marker_rx, token).await?;
        info!(forwards = forwards.len(), "relay agent ready");

        // Host mappings go in before their tunnels open.
        let mut tunnel_specs = Vec::new();
        for forward in &forwards {
            let (Some(local_host), Some(local_port), Some(source_port), Some(target_host)) = (
                forward.local_host(),
                forward.local_port(),
                forward.source_port(),
                forward.target_host(),
            ) else {
                bail!("forward {:?} is missing a bound address", forward.name);
            };

            match rewriter.install(local_host, target_host) {
                Ok(()) => tunnel_specs.push(TunnelSpec {
                    name: forward.name.clone(),
                    local_host: local_host.to_string(),
                    local_port,
                    pod_port: source_port,
                }),
                Err(InstallError::Alias { ip, source }) => {
                    warn!(forward = %forward.name, ip = %ip, error = %source,
                        "unable to add loopback alias, skipping forward");
                }
                Err(InstallError::Hosts(err)) => {
                    return Err(anyhow!(err).context("unable to update hosts file"));
                }
            }
        }

        // PINGING + TUNNELS_UP
        info!("forwarding all ports from relay configs...");
        for spec in tunnel_specs {
            let (ready_tx, _ready_rx) = mpsc::channel::<()>(1);
            tasks.push(spawn_fatal("tunnel", token.clone(), fatal_tx.clone(), {
                let client = self.client.clone();
                let namespace = target.namespace.clone();
                let pod = target.name.clone();
                let token = token.clone();
                let name = spec.name.clone();
                async move {
                    tunnel::serve(client, namespace, pod, spec, token, ready_tx)
                        .await
                        .map_err(move |e| anyhow!(e).context(format!("port forwarding {name}")))
                }
            }));
        }

        tasks.push({
            let token = token.clone();
            tokio::spawn(async move { ping_loop(token).await })
        });

        // Steady state: wait for a signal or the first failing child.
        token.cancelled().await;
        Ok(())
    }
}

/// First pod whose conditions are all true, in list order.
pub fn select_target(pods: &[PodSummary]) -> Option<&PodSummary> {
    pods.iter().find(|p| p.ready)
}

fn resolve_agent_path(options: &RunOptions, config: &Config) -> anyhow::Result<PathBuf> {
    let path = if let Some(path) = &options.forwarder_agent {
        path.clone()
    } else if let Some(path) = &config.forwarder_agent_path {
        PathBuf::from(path)
    } else {
        let exe = std::env::current_exe().context("unable to locate current executable")?;
        exe.parent()
            .map(|dir| dir.join("podlink-agent"))
            .ok_or_else(|| anyhow!("unable to locate current executable directory"))?
    };

    if !path.exists() {
        bail!(
            "forwarder agent binary not found at {} (use --forwarder-agent to point at one)",
            path.display()
        );
    }
    Ok(path)
}

/// Write the scraped environment as `KEY=VALUE` lines to `<dir>/<pod>`.
pub fn save_env_file(
    dir: &Path,
    pod_name: &str,
    env: &HashMap<String, String>,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create envs dir {}", dir.display()))?;

    let mut data = String::new();
    for (name, value) in env {
        data.push_str(&format!("{name}={value}\n"));
    }

    let path = dir.join(pod_name);
    std::fs::write(&path, data).with_context(|| format!("write env file {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))
            .with_context(|| format!("set mode on {}", path.display()))?;
    }
    Ok(path)
}

/// Spawn a child that cancels the run when it returns, forwarding an error
/// (if any) as the run's fatal cause.
fn spawn_fatal<F>(
    what: &'static str,
    token: CancellationToken,
    fatal_tx: mpsc::Sender<anyhow::Error>,
    fut: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = fut.await {
            warn!(task = what, error = %err, "task failed");
            let _ = fatal_tx.try_send(err);
        }
        token.cancel();
    })
}

async fn join_all(tasks: &mut Vec<JoinHandle<()>>) {
    for task in tasks.drain(..) {
        let _ = task.await;
    }
}

async fn wait_ready(rx: &mut mpsc::Receiver<()>, what: &str) -> anyhow::Result<()> {
    match tokio::time::timeout(READY_TIMEOUT, rx.recv()).await {
        Ok(Some(())) => Ok(()),
        Ok(None) => bail!("{what}: closed before becoming ready"),
        Err(_) => bail!("timeout waiting for {what} to be ready"),
    }
}

/// Wait for relay readiness: the stdout marker or a 200 from the tunneled
/// `/ready` endpoint, bounded by [`READY_TIMEOUT`].
async fn wait_relay_ready(
    marker_rx: &mut mpsc::Receiver<()>,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let poll = async {
        let client = match reqwest::Client::builder().timeout(READY_TIMEOUT).build() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "unable to create readiness client");
                std::future::pending::<()>().await;
                return;
            }
        };
        let url = format!("http://127.0.0.1:{DEFAULT_API_PORT}/ready");
        loop {
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        result = tokio::time::timeout(READY_TIMEOUT, marker_rx.recv()) => match result {
            Ok(Some(())) => Ok(()),
            Ok(None) => bail!("executing forwarder agent err: output ended before ready"),
            Err(_) => bail!("timeout waiting for forwarder agent to be ready"),
        },
        _ = poll => Ok(()),
        _ = token.cancelled() => bail!("cancelled while waiting for forwarder agent"),
    }
}

/// Keepalive against the relay's watchdog. Failures are retried, not fatal:
/// a dead relay stops answering, its watchdog fires, and the exec stream
/// ending is what tears the run down.
async fn ping_loop(token: CancellationToken) {
    let client = match reqwest::Client::builder().timeout(PING_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "unable to create ping client");
            return;
        }
    };
    let url = format!("http://127.0.0.1:{DEFAULT_API_PORT}/ping");

    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("relay agent stopped, ping exited");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        delay = match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => PING_INTERVAL,
            Ok(resp) => {
                warn!(status = %resp.status(), "ping got unexpected status");
                PING_RETRY
            }
            Err(err) => {
                warn!(error = %err, "unable to call ping");
                PING_RETRY
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_target_prefers_first_ready() {
        let pods = vec![
            PodSummary {
                name: "backend-0".to_string(),
                ready: false,
            },
            PodSummary {
                name: "backend-1".to_string(),
                ready: true,
            },
            PodSummary {
                name: "backend-2".to_string(),
                ready: true,
            },
        ];
        assert_eq!(select_target(&pods).unwrap().name, "backend-1");
    }

    #[test]
    fn test_select_target_none_ready() {
        let pods = vec![PodSummary {
            name: "backend-0".to_string(),
            ready: false,
        }];
        assert!(select_target(&pods).is_none());
    }

    #[test]
    fn test_save_env_file_writes_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("A".to_string(), "1".to_string());
        env.insert("B".to_string(), "two=2".to_string());

        let path = save_env_file(dir.path(), "backend-1", &env).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("A=1\n"));
        assert!(content.contains("B=two=2\n"));
    }
}
