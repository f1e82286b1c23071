//! Staging and launching the relay agent inside the carrier pod.
//!
//! The agent binary is copied to `/tmp` in the container unless a file with
//! a matching MD5 is already there. MD5 is the staging protocol, not a
//! security primitive: the check runs through the pod's own `md5sum -c`.

use std::path::Path;

use md5::{Digest, Md5};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use podlink_proto::{ForwardPair, DEFAULT_API_PORT, READY_MARKER};

use crate::cluster::{ClusterClient, ClusterError, PodRef};
use crate::config::ForwardConfig;

/// Directory on the pod where the agent binary lands.
const STAGE_DIR: &str = "/tmp";

/// File mode for the staged binary.
const STAGE_MODE: u32 = 0o555;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("unable to read agent binary {path}: {source}")]
    ReadAgent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent binary path {0} has no file name")]
    NoFileName(String),
    #[error("unable to copy agent to target container: {0}")]
    Copy(#[source] ClusterError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// A staged agent, ready to be launched.
#[derive(Debug, Clone)]
pub struct StagedAgent {
    pub remote_path: String,
}

/// Ensure the agent binary exists at `/tmp/<name>` in the container,
/// copying it only when the pod-side MD5 check fails.
pub async fn stage_agent(
    client: &dyn ClusterClient,
    pod: &PodRef,
    local_path: &Path,
) -> Result<StagedAgent, StageError> {
    let data = tokio::fs::read(local_path)
        .await
        .map_err(|source| StageError::ReadAgent {
            path: local_path.display().to_string(),
            source,
        })?;

    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StageError::NoFileName(local_path.display().to_string()))?;
    let remote_path = format!("{STAGE_DIR}/{file_name}");

    let digest = hex::encode(Md5::digest(&data));
    let check = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cd {STAGE_DIR} && echo '{digest}  {file_name}' | md5sum -c -"),
    ];

    match client.exec_capture(pod, &check).await {
        Ok(result) => {
            info!(result = %result.trim(), "forwarder agent already staged");
        }
        Err(err) => {
            info!(error = %err, agent = file_name, "staging forwarder agent to target pod");
            client
                .copy_file(pod, &remote_path, STAGE_MODE, &data)
                .await
                .map_err(StageError::Copy)?;
        }
    }

    Ok(StagedAgent { remote_path })
}

/// Command line that launches the staged agent with one `-address` pair per
/// active forward.
pub fn launch_command(staged: &StagedAgent, forwards: &[ForwardConfig]) -> Vec<String> {
    let mut remote = format!(
        "{}={} {}",
        podlink_proto::API_PORT_ENV,
        DEFAULT_API_PORT,
        staged.remote_path
    );
    for forward in forwards.iter().filter(|f| f.is_active()) {
        let pair = ForwardPair {
            source_addr: forward.source_addr.clone(),
            target_addr: forward.target_addr.clone(),
        };
        remote.push_str(&format!(" -address '{}'", pair.to_arg()));
    }

    vec!["sh".to_string(), "-c".to_string(), remote]
}

/// Run the agent over remote exec, re-emitting its output through tracing
/// and signalling `ready` when the stdout marker appears. Returns when the
/// exec stream ends.
pub async fn run_agent(
    client: &dyn ClusterClient,
    pod: &PodRef,
    command: Vec<String>,
    ready: mpsc::Sender<()>,
) -> Result<(), ClusterError> {
    let (tx, mut rx) = mpsc::channel::<String>(16);

    let exec = client.exec_streamed(pod, &command, tx);
    tokio::pin!(exec);

    let mut marker_seen = false;
    let mut output_open = true;
    loop {
        tokio::select! {
            chunk = rx.recv(), if output_open => {
                match chunk {
                    Some(chunk) => {
                        for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
                            info!(source = "agent", "{}", line.trim_end());
                        }
                        if !marker_seen && chunk.contains(READY_MARKER) {
                            marker_seen = true;
                            let _ = ready.try_send(());
                        }
                    }
                    // Output closed; the exec result follows shortly.
                    None => output_open = false,
                }
            }
            result = &mut exec => {
                if let Err(ref err) = result {
                    warn!(error = %err, "relay agent exec stream ended with error");
                }
                return result;
            }
        }
    }
}
