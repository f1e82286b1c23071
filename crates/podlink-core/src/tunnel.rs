//! Workstation-side tunnels over the pod port-forward channel.
//!
//! Each forward gets a local TCP listener; every accepted connection is
//! paired with its own port-forward stream to the relay's source port and
//! the two are copied into each other until either side closes.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterError};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("unable to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One workstation-side tunnel: a local listener mapped to a pod port.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    /// Forward name, for logs.
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub pod_port: u16,
}

/// Serve one tunnel until `token` is cancelled. `ready` fires once the
/// local listener is bound.
pub async fn serve(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    pod: String,
    spec: TunnelSpec,
    token: CancellationToken,
    ready: mpsc::Sender<()>,
) -> Result<(), TunnelError> {
    let local_addr = format!("{}:{}", spec.local_host, spec.local_port);
    let listener = TcpListener::bind(&local_addr)
        .await
        .map_err(|source| TunnelError::Bind {
            addr: local_addr.clone(),
            source,
        })?;

    info!(name = %spec.name, local = %local_addr, pod_port = spec.pod_port, "tunnel listening");
    let _ = ready.try_send(());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(name = %spec.name, error = %err, "accept failed");
                        continue;
                    }
                };
                debug!(name = %spec.name, peer = %peer, "connection established");

                let client = client.clone();
                let namespace = namespace.clone();
                let pod = pod.clone();
                let name = spec.name.clone();
                let pod_port = spec.pod_port;
                let conn_token = token.child_token();
                tokio::spawn(async move {
                    if let Err(err) =
                        relay_connection(client, &namespace, &pod, pod_port, stream, conn_token).await
                    {
                        debug!(name = %name, error = %err, "tunneled connection closed with error");
                    }
                });
            }
        }
    }

    info!(name = %spec.name, local = %local_addr, "tunnel closed");
    Ok(())
}

/// Pipe one accepted connection through its own port-forward stream.
async fn relay_connection(
    client: Arc<dyn ClusterClient>,
    namespace: &str,
    pod: &str,
    pod_port: u16,
    local: TcpStream,
    token: CancellationToken,
) -> Result<(), ClusterError> {
    let remote = client.open_tunnel(namespace, pod, pod_port).await?;

    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    // Either direction finishing tears down both; cancellation does too.
    tokio::select! {
        _ = token.cancelled() => {}
        result = tokio::io::copy(&mut local_read, &mut remote_write) => {
            log_copy_end("local->pod", result);
        }
        result = tokio::io::copy(&mut remote_read, &mut local_write) => {
            log_copy_end("pod->local", result);
        }
    }

    Ok(())
}

fn log_copy_end(direction: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(direction, bytes, "copy finished"),
        Err(err) => debug!(direction, error = %err, "copy ended with error"),
    }
}
