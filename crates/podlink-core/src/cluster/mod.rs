//! Cluster collaborator interface.
//!
//! The supervisor only needs four things from a cluster: list candidate
//! pods, run a command in a container (captured or streamed), push a file in
//! over an exec stdin channel, and open a byte stream to a pod port. The
//! trait keeps the orchestration testable against a fake; [`kube::KubeClient`]
//! is the production implementation.

pub mod kube_client;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

pub use kube_client::KubeClient;

/// The resolved `{namespace, pod, container}` triple. Immutable for the
/// lifetime of a run.
#[derive(Debug, Clone)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub container: String,
}

/// One pod returned by a selector query.
#[derive(Debug, Clone)]
pub struct PodSummary {
    pub name: String,
    /// True when every status condition on the pod reports `True`.
    pub ready: bool,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster api: {0}")]
    Api(#[source] Box<kube::Error>),
    #[error("kubeconfig: {0}")]
    Kubeconfig(String),
    #[error("exec stream has no {0} channel")]
    MissingChannel(&'static str),
    #[error("remote command failed: {0}")]
    CommandFailed(String),
    #[error("port-forward returned no stream for port {0}")]
    NoStream(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        Self::Api(Box::new(err))
    }
}

/// Byte stream to a single pod port, multiplexed over the control plane.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type TunnelStream = Box<dyn IoStream>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// The kubeconfig context the client resolved, for operator-facing logs.
    fn context_name(&self) -> Option<&str>;

    /// Pods matching `label_selector` in `namespace`, in list order.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ClusterError>;

    /// Run `command` in the container and capture its stdout. A non-success
    /// exit surfaces as [`ClusterError::CommandFailed`].
    async fn exec_capture(&self, pod: &PodRef, command: &[String])
        -> Result<String, ClusterError>;

    /// Run `command` in the container, streaming output chunks into
    /// `output` until the process exits. The returned result reflects the
    /// remote exit status.
    async fn exec_streamed(
        &self,
        pod: &PodRef,
        command: &[String],
        output: mpsc::Sender<String>,
    ) -> Result<(), ClusterError>;

    /// Write `data` to `remote_path` in the container with the given mode,
    /// using a `tee`/`chmod` pipeline over exec stdin.
    async fn copy_file(
        &self,
        pod: &PodRef,
        remote_path: &str,
        mode: u32,
        data: &[u8],
    ) -> Result<(), ClusterError>;

    /// Open one port-forward stream to `port` on the pod.
    async fn open_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<TunnelStream, ClusterError>;
}

/// Run `env` in the carrier container and parse the result.
pub async fn scrape_env(
    client: &dyn ClusterClient,
    pod: &PodRef,
) -> Result<HashMap<String, String>, ClusterError> {
    let output = client.exec_capture(pod, &["env".to_string()]).await?;
    Ok(parse_env_output(&output))
}

/// Parse `env` output line by line at the first `=`. Lines without `=` are
/// dropped.
pub fn parse_env_output(output: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in output.lines() {
        match line.split_once('=') {
            Some((name, value)) => {
                vars.insert(name.trim().to_string(), value.trim().to_string());
            }
            None => {
                if !line.trim().is_empty() {
                    debug!(line, "skipping unparsable env line");
                }
            }
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_output() {
        let output = "PATH=/usr/bin\nAUTH_SERVICE_URL=http://auth.local\nnot a pair\n\n";
        let vars = parse_env_output(output);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["PATH"], "/usr/bin");
        assert_eq!(vars["AUTH_SERVICE_URL"], "http://auth.local");
    }

    #[test]
    fn test_parse_env_output_keeps_equals_in_value() {
        let vars = parse_env_output("JAVA_OPTS=-Xmx512m -Dfoo=bar\n");
        assert_eq!(vars["JAVA_OPTS"], "-Xmx512m -Dfoo=bar");
    }
}
