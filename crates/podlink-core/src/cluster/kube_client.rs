//! Production [`ClusterClient`] backed by the `kube` crate.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::config::Kubeconfig;
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClusterClient, ClusterError, PodRef, PodSummary, TunnelStream};

pub struct KubeClient {
    client: Client,
    context: Option<String>,
}

impl KubeClient {
    /// Connect using the standard kubeconfig resolution (`KUBECONFIG`, then
    /// `~/.kube/config`, then in-cluster).
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        let context = Kubeconfig::read().ok().and_then(|k| k.current_context);
        Ok(Self { client, context })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn attach_params(container: &str) -> AttachParams {
        AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true)
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    fn context_name(&self) -> Option<&str> {
        self.context.as_deref()
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ClusterError> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }

        let pods = self.pods(namespace).list(&params).await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| PodSummary {
                name: pod.metadata.name.clone().unwrap_or_default(),
                ready: pod_ready(pod),
            })
            .collect())
    }

    async fn exec_capture(
        &self,
        pod: &PodRef,
        command: &[String],
    ) -> Result<String, ClusterError> {
        let mut attached = self
            .pods(&pod.namespace)
            .exec(&pod.name, command.to_vec(), &Self::attach_params(&pod.container))
            .await?;

        let mut stdout = attached
            .stdout()
            .ok_or(ClusterError::MissingChannel("stdout"))?;
        let stderr = attached.stderr();
        let status_fut = attached.take_status();

        let (out, err_out) = tokio::join!(read_to_string(&mut stdout), async {
            match stderr {
                Some(mut reader) => read_to_string(&mut reader).await,
                None => Ok(String::new()),
            }
        });
        let out = out?;
        let err_out = err_out?;

        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.map_err(|e| ClusterError::CommandFailed(e.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                let detail = status
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| err_out.trim().to_string());
                return Err(ClusterError::CommandFailed(detail));
            }
        }

        Ok(out)
    }

    async fn exec_streamed(
        &self,
        pod: &PodRef,
        command: &[String],
        output: mpsc::Sender<String>,
    ) -> Result<(), ClusterError> {
        let mut attached = self
            .pods(&pod.namespace)
            .exec(&pod.name, command.to_vec(), &Self::attach_params(&pod.container))
            .await?;

        let mut stdout = attached
            .stdout()
            .ok_or(ClusterError::MissingChannel("stdout"))?;
        let stderr = attached.stderr();
        let status_fut = attached.take_status();

        let (out_res, err_res) = tokio::join!(pump(&mut stdout, &output), async {
            match stderr {
                Some(mut reader) => pump(&mut reader, &output).await,
                None => Ok(()),
            }
        });
        out_res?;
        err_res?;

        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.map_err(|e| ClusterError::CommandFailed(e.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(ClusterError::CommandFailed(
                    status.message.unwrap_or_else(|| "exec failed".to_string()),
                ));
            }
        }

        Ok(())
    }

    async fn copy_file(
        &self,
        pod: &PodRef,
        remote_path: &str,
        mode: u32,
        data: &[u8],
    ) -> Result<(), ClusterError> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("tee {remote_path} && chmod {mode:o} {remote_path}"),
        ];
        let params = AttachParams::default()
            .container(&pod.container)
            .stdin(true)
            .stdout(false)
            .stderr(true);

        let mut attached = self
            .pods(&pod.namespace)
            .exec(&pod.name, command, &params)
            .await?;

        let mut stdin = attached
            .stdin()
            .ok_or(ClusterError::MissingChannel("stdin"))?;
        stdin.write_all(data).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let err_out = match attached.stderr() {
            Some(mut reader) => read_to_string(&mut reader).await?,
            None => String::new(),
        };
        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.map_err(|e| ClusterError::CommandFailed(e.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                let detail = status
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| err_out.trim().to_string());
                return Err(ClusterError::CommandFailed(detail));
            }
        }

        Ok(())
    }

    async fn open_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<TunnelStream, ClusterError> {
        let mut forwarder = self.pods(namespace).portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or(ClusterError::NoStream(port))?;

        // The forwarder task outlives the handle; surface its exit quietly.
        tokio::spawn(async move {
            if let Err(err) = forwarder.join().await {
                debug!(error = %err, port, "port-forward connection closed with error");
            }
        });

        Ok(Box::new(stream))
    }
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| conditions.iter().all(|c| c.status == "True"))
        .unwrap_or(true)
}

async fn read_to_string(reader: &mut (impl AsyncRead + Unpin)) -> Result<String, ClusterError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Forward chunks from `reader` into `output` until EOF. A dropped receiver
/// keeps draining the stream so the remote process is not backpressured into
/// a stall.
async fn pump(
    reader: &mut (impl AsyncRead + Unpin),
    output: &mpsc::Sender<String>,
) -> Result<(), ClusterError> {
    let mut buf = [0u8; 2048];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
        if output.send(chunk).await.is_err() {
            // Receiver gone; keep reading to EOF without forwarding.
            continue;
        }
    }
}
