//! podlink-agent: the relay process staged into the carrier pod.
//!
//! The supervisor launches it as
//! `FORWARDER_API_PORT=8181 podlink-agent -address 'src->dst' ...`; the
//! agent binds one TCP listener per pair, prints the readiness line, and
//! serves a small control API. A watchdog exits the process when the
//! supervisor stops pinging, so abandoned agents never linger in a pod.

mod forwarder;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use podlink_proto::{
    ready_line, ForwardPair, API_PORT_ENV, DEFAULT_API_PORT, WATCHDOG_SECS,
};

use forwarder::{listen_addr, Forwarder};

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(WATCHDOG_SECS);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "podlink-agent")]
#[command(about = "TCP relay agent: listens on source addresses and forwards traffic to targets")]
#[command(version)]
struct Args {
    /// TCP address pair to forward, example: 'sourcehost:port->targethost:port'.
    /// The agent creates a listener for the source and forwards any traffic
    /// to the target.
    #[arg(long = "address")]
    addresses: Vec<String>,

    /// Consecutive upstream health-check failures before a pair shuts down
    #[arg(long = "health-fail-threshold", default_value_t = 3)]
    health_fail_threshold: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::from_default_env().add_directive("podlink_agent=info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse_from(normalize_go_flags(std::env::args()));
    let pairs =
        ForwardPair::parse_list(&args.addresses).context("unable to parse forwarder config")?;

    let token = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Bind every listener before declaring readiness; any failure aborts.
    let mut forwarders = Vec::new();
    let mut bound = Vec::new();
    for pair in pairs {
        let addr = listen_addr(&pair.source_addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("unable to listen tcp {addr}"))?;
        forwarders.push(Arc::new(Forwarder::new(
            pair,
            HEALTH_CHECK_INTERVAL,
            args.health_fail_threshold,
        )));
        bound.push(listener);
    }

    // Contract with the supervisor: this exact line on stdout.
    println!("{}", ready_line(forwarders.len()));

    for (forwarder, listener) in forwarders.iter().cloned().zip(bound) {
        tasks.push(tokio::spawn(forwarder.run(listener, token.clone())));
    }

    // Watchdog: /ping pushes the deadline out; silence kills the process.
    let deadline = Arc::new(Mutex::new(tokio::time::Instant::now() + WATCHDOG_TIMEOUT));
    tasks.push(tokio::spawn(watchdog(deadline.clone(), token.clone())));

    // Control API.
    let state = ApiState {
        deadline,
        forwarders: Arc::new(forwarders),
    };
    let api_addr = api_listen_addr();
    let api_listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("unable to listen on api port {api_addr}"))?;
    info!(addr = %api_addr, "control api listening");
    tasks.push(tokio::spawn(serve_api(api_listener, state, token.clone())));

    // Signals cancel the process scope like everything else.
    tasks.push(tokio::spawn({
        let token = token.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => token.cancel(),
                _ = token.cancelled() => {}
            }
        }
    }));

    token.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

/// Accept Go-style single-dash long flags (`-address`) the way the
/// supervisor composes them, alongside regular `--address`.
fn normalize_go_flags(args: impl Iterator<Item = String>) -> Vec<String> {
    args.enumerate()
        .map(|(position, arg)| {
            if position > 0 && arg.len() > 2 && arg.starts_with('-') && !arg.starts_with("--") {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

fn api_listen_addr() -> String {
    let port = std::env::var(API_PORT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(DEFAULT_API_PORT);
    format!("0.0.0.0:{port}")
}

/// Exit the process when the deadline passes without a ping.
async fn watchdog(deadline: Arc<Mutex<tokio::time::Instant>>, token: CancellationToken) {
    loop {
        let until = *deadline.lock().unwrap();
        if tokio::time::Instant::now() >= until {
            info!("process timeout, exit.");
            token.cancel();
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(until) => {}
        }
    }
}

#[derive(Clone)]
struct ApiState {
    deadline: Arc<Mutex<tokio::time::Instant>>,
    forwarders: Arc<Vec<Arc<Forwarder>>>,
}

fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(handle_ping))
        .route("/ready", get(handle_ready))
        .route("/forwarders", get(handle_forwarders))
        .with_state(state)
}

async fn serve_api(listener: TcpListener, state: ApiState, token: CancellationToken) {
    let app = api_router(state);
    let shutdown = token.clone().cancelled_owned();
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %err, "http api listener error");
        token.cancel();
    } else {
        info!("http api listener exit.");
    }
}

async fn handle_ping(State(state): State<ApiState>) -> &'static str {
    *state.deadline.lock().unwrap() = tokio::time::Instant::now() + WATCHDOG_TIMEOUT;
    "pong"
}

async fn handle_ready() -> &'static str {
    "ready"
}

async fn handle_forwarders(
    State(state): State<ApiState>,
) -> Json<Vec<podlink_proto::ForwarderStatus>> {
    Json(state.forwarders.iter().map(|f| f.status()).collect())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "unable to install SIGTERM handler");
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
