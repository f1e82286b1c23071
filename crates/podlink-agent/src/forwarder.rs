//! Per-pair TCP relay: one listener, one upstream, and a health check that
//! retires the pair when the upstream stops answering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use podlink_proto::{ForwardPair, ForwarderStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Upstream dial timeout for health checks.
const HEALTH_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the first health-check dial after startup.
const HEALTH_INITIAL_DELAY: Duration = Duration::from_secs(1);

pub struct Forwarder {
    pub source_addr: String,
    pub target_addr: String,
    health_check_interval: Duration,
    fail_threshold: u32,
    last_err: Mutex<Option<String>>,
}

impl Forwarder {
    pub fn new(pair: ForwardPair, health_check_interval: Duration, fail_threshold: u32) -> Self {
        Self {
            source_addr: pair.source_addr,
            target_addr: pair.target_addr,
            health_check_interval,
            fail_threshold: fail_threshold.max(1),
            last_err: Mutex::new(None),
        }
    }

    /// Snapshot for the `/forwarders` endpoint.
    pub fn status(&self) -> ForwarderStatus {
        ForwarderStatus {
            source_addr: self.source_addr.clone(),
            target_addr: self.target_addr.clone(),
            error: self.last_err.lock().unwrap().clone(),
        }
    }

    fn record_error(&self, message: String) {
        *self.last_err.lock().unwrap() = Some(message);
    }

    /// Accept connections until the pair is cancelled. The health check runs
    /// alongside and cancels only this pair; other pairs keep going.
    pub async fn run(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        info!("start forwarding {} -> {}", self.source_addr, self.target_addr);

        let pair_token = token.child_token();
        let health = tokio::spawn(self.clone().health_check(pair_token.clone()));

        loop {
            tokio::select! {
                _ = pair_token.cancelled() => break,
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            debug!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    info!(peer = %peer, source = %self.source_addr, "connection established");
                    tokio::spawn(self.clone().forward(conn, pair_token.clone()));
                }
            }
        }

        let _ = health.await;
        info!("stop forwarding {} -> {}", self.source_addr, self.target_addr);
    }

    /// Stream one client connection to the upstream and back. Either side
    /// finishing closes both sockets.
    async fn forward(self: Arc<Self>, client: TcpStream, token: CancellationToken) {
        let peer = client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let target = match TcpStream::connect(&self.target_addr).await {
            Ok(target) => target,
            Err(err) => {
                error!(target = %self.target_addr, error = %err, "failed to dial TCP address");
                return;
            }
        };

        let (mut client_read, mut client_write) = client.into_split();
        let (mut target_read, mut target_write) = target.into_split();

        tokio::select! {
            _ = token.cancelled() => {}
            result = tokio::io::copy(&mut client_read, &mut target_write) => {
                log_copy_result(&peer, &self.target_addr, result);
            }
            result = tokio::io::copy(&mut target_read, &mut client_write) => {
                log_copy_result(&self.target_addr, &peer, result);
            }
        }

        info!(peer = %peer, "connection closed");
    }

    /// Dial the upstream on a fixed cadence. A run of consecutive failures
    /// retires the pair and records the last error for `/forwarders`.
    async fn health_check(self: Arc<Self>, token: CancellationToken) {
        let mut failures = 0u32;
        let mut delay = HEALTH_INITIAL_DELAY;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.health_check_interval;

            let dial = tokio::time::timeout(
                HEALTH_DIAL_TIMEOUT,
                TcpStream::connect(&self.target_addr),
            )
            .await;

            match dial {
                Ok(Ok(conn)) => {
                    drop(conn);
                    failures = 0;
                }
                Ok(Err(err)) => {
                    failures += 1;
                    self.note_health_failure(failures, &err.to_string(), &token);
                    if failures >= self.fail_threshold {
                        return;
                    }
                }
                Err(_) => {
                    failures += 1;
                    self.note_health_failure(failures, "dial timed out", &token);
                    if failures >= self.fail_threshold {
                        return;
                    }
                }
            }
        }
    }

    fn note_health_failure(&self, failures: u32, detail: &str, token: &CancellationToken) {
        let message = format!("health check {} err: {detail}", self.target_addr);
        error!(
            failures,
            threshold = self.fail_threshold,
            "{message}"
        );
        self.record_error(message);
        if failures >= self.fail_threshold {
            error!(target = %self.target_addr, "upstream unreachable, closing forwarder");
            token.cancel();
        }
    }
}

/// Bindable form of a source address: a bare `:port` listens on every
/// interface, like the supervisor expects.
pub fn listen_addr(source_addr: &str) -> String {
    if let Some(stripped) = source_addr.strip_prefix(':') {
        format!("0.0.0.0:{stripped}")
    } else {
        source_addr.to_string()
    }
}

fn log_copy_result(from: &str, to: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(from, to, bytes, "copy finished"),
        Err(err) if is_disconnect(&err) => {}
        Err(err) => error!(from, to, error = %err, "io copy err"),
    }
}

/// Errors that just mean "the other side went away first".
fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}
