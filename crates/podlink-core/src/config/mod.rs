//! Declarative configuration and the materialization pass that binds every
//! forward to concrete addresses.
//!
//! A forward routes traffic through three hops:
//!
//! 1. a client connects to `local_addr` on the workstation,
//! 2. traffic is tunneled to `source_addr` on the carrier pod, where the
//!    relay agent listens,
//! 3. the agent dials `target_addr` inside the cluster.
//!
//! Only `target_addr` is mandatory in the declaration; the materializer
//! renders its template, then assigns the other two.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::addr::{self, AddrError};
use crate::probe::Prober;
use crate::template::{Expander, TemplateError};

/// First candidate for auto-assigned loopback-alias listener IPs.
const LOCAL_IP_RANGE_START: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);

/// First port handed out when `source_addr` is left unset.
const SOURCE_PORT_RANGE_START: u16 = 50000;

/// Top-level configuration for podlink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Optional override for the relay agent binary shipped to the pod.
    #[serde(default)]
    pub forwarder_agent_path: Option<String>,

    /// Where to stage the relay agent.
    #[serde(default)]
    pub target: Target,

    /// Forwarding declarations, processed in order.
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub pod: Option<PodTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTarget {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub label_selector: String,
    pub container: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A single forwarding rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardConfig {
    /// Human-readable label, used in logs and diagnostics.
    #[serde(default)]
    pub name: String,

    /// Listener on the workstation, `host:port`. Assigned by the
    /// materializer when empty.
    #[serde(default)]
    pub local_addr: String,

    /// Listener on the carrier pod, `:port`. Assigned from 50000 upward
    /// when empty.
    #[serde(default)]
    pub source_addr: String,

    /// Final in-cluster destination, `host:port` or a template over the
    /// pod's environment (`{{.SERVICE_HOST}}:{{.SERVICE_PORT}}`).
    #[serde(default)]
    pub target_addr: String,

    #[serde(skip)]
    pub local_parsed: Option<Url>,
    #[serde(skip)]
    pub source_parsed: Option<Url>,
    #[serde(skip)]
    pub target_parsed: Option<Url>,
}

impl ForwardConfig {
    /// A forward with an empty target is declared but disabled.
    pub fn is_active(&self) -> bool {
        self.target_parsed.is_some()
    }

    pub fn local_host(&self) -> Option<&str> {
        self.local_parsed.as_ref().and_then(|u| u.host_str())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_parsed.as_ref().and_then(addr::port_of)
    }

    pub fn source_port(&self) -> Option<u16> {
        self.source_parsed.as_ref().and_then(addr::port_of)
    }

    pub fn target_host(&self) -> Option<&str> {
        self.target_parsed.as_ref().and_then(|u| u.host_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
#[error("forward {name:?} (#{index}): {source}")]
pub struct MaterializeError {
    pub name: String,
    pub index: usize,
    #[source]
    pub source: ForwardBindError,
}

#[derive(Debug, Error)]
pub enum ForwardBindError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("no port specified for addr: {0}")]
    MissingPort(String),
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }
}

/// Bind every declared forward to concrete local, source, and target
/// addresses, rendering target templates against `env` and probing candidate
/// listener IPs through `prober`.
///
/// Forwards with an empty `target_addr` are skipped. Any other failure
/// aborts the whole pass, identifying the offending forward.
pub fn materialize(
    config: &mut Config,
    env: &HashMap<String, String>,
    prober: &dyn Prober,
) -> Result<(), MaterializeError> {
    let expander = Expander::new();

    let mut candidate_ip = LOCAL_IP_RANGE_START;
    let mut taken_ips: HashSet<Ipv4Addr> = HashSet::new();
    let mut used_local_ports: HashSet<u16> = HashSet::new();
    let mut next_source_port = SOURCE_PORT_RANGE_START;

    for (index, forward) in config.forwards.iter_mut().enumerate() {
        if forward.target_addr.is_empty() {
            continue;
        }

        bind_forward(
            forward,
            env,
            prober,
            &expander,
            &mut candidate_ip,
            &mut taken_ips,
            &mut used_local_ports,
            &mut next_source_port,
        )
        .map_err(|source| MaterializeError {
            name: forward.name.clone(),
            index,
            source,
        })?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn bind_forward(
    forward: &mut ForwardConfig,
    env: &HashMap<String, String>,
    prober: &dyn Prober,
    expander: &Expander,
    candidate_ip: &mut Ipv4Addr,
    taken_ips: &mut HashSet<Ipv4Addr>,
    used_local_ports: &mut HashSet<u16>,
    next_source_port: &mut u16,
) -> Result<(), ForwardBindError> {
    // Target: render the template, then pin down host and port.
    let rendered = expander.expand(&forward.target_addr, env)?;
    let parsed = addr::parse(&rendered)?;

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AddrError::MissingHost(rendered.clone()))?
        .to_string();
    let port = addr::port_of(&parsed).ok_or_else(|| ForwardBindError::MissingPort(rendered.clone()))?;

    forward.target_addr = format!("{host}:{port}");
    forward.target_parsed = Some(addr::parse(&format!(
        "{}://{host}:{port}",
        parsed.scheme()
    ))?);

    // Local listener: prefer 127.0.0.1 on the target port, otherwise find a
    // free IP in the alias range and keep the same port.
    if forward.local_addr.is_empty() {
        if !used_local_ports.contains(&port) {
            forward.local_addr = format!("127.0.0.1:{port}");
        } else {
            loop {
                if !taken_ips.contains(candidate_ip) && !prober.is_reachable(*candidate_ip) {
                    taken_ips.insert(*candidate_ip);
                    forward.local_addr = format!("{candidate_ip}:{port}");
                    break;
                }
                *candidate_ip = addr::next_ip(*candidate_ip);
            }
        }
    }

    let local_parsed = addr::parse(&forward.local_addr)?;
    let local_port = addr::port_of(&local_parsed)
        .ok_or_else(|| ForwardBindError::MissingPort(forward.local_addr.clone()))?;
    used_local_ports.insert(local_port);
    forward.local_parsed = Some(local_parsed);

    // Relay-side listener: hand out sequential ports when unset.
    if forward.source_addr.is_empty() {
        forward.source_addr = format!(":{next_source_port}");
        *next_source_port += 1;
    }
    forward.source_parsed = Some(addr::parse(&forward.source_addr)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Prober with a scripted set of reachable (taken) IPs.
    struct FakeProber {
        reachable: HashSet<Ipv4Addr>,
    }

    impl FakeProber {
        fn new(reachable: &[Ipv4Addr]) -> Self {
            Self {
                reachable: reachable.iter().copied().collect(),
            }
        }
    }

    impl Prober for FakeProber {
        fn is_reachable(&self, ip: Ipv4Addr) -> bool {
            self.reachable.contains(&ip)
        }
    }

    fn forward(target: &str) -> ForwardConfig {
        ForwardConfig {
            name: format!("fwd-{target}"),
            target_addr: target.to_string(),
            ..Default::default()
        }
    }

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_single_forward_with_template_and_default_port() {
        let mut config = Config {
            forwards: vec![forward("{{.AUTH_SERVICE_URL}}")],
            ..Default::default()
        };
        let env = envs(&[("AUTH_SERVICE_URL", "http://auth.local")]);

        materialize(&mut config, &env, &FakeProber::new(&[])).unwrap();

        let fwd = &config.forwards[0];
        assert_eq!(fwd.target_addr, "auth.local:80");
        assert_eq!(fwd.local_addr, "127.0.0.1:80");
        assert_eq!(fwd.source_addr, ":50000");
    }

    #[test]
    fn test_colliding_target_ports_fall_back_to_alias_range() {
        let mut config = Config {
            forwards: vec![forward("db:5432"), forward("replica:5432")],
            ..Default::default()
        };
        // 10.0.0.10 and 10.0.0.11 answer pings, 10.0.0.12 is free.
        let prober = FakeProber::new(&[
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 11),
        ]);

        materialize(&mut config, &HashMap::new(), &prober).unwrap();

        assert_eq!(config.forwards[0].local_addr, "127.0.0.1:5432");
        assert_eq!(config.forwards[1].local_addr, "10.0.0.12:5432");
        assert_eq!(config.forwards[0].source_addr, ":50000");
        assert_eq!(config.forwards[1].source_addr, ":50001");
    }

    #[test]
    fn test_missing_template_key_aborts_with_forward_identity() {
        let mut config = Config {
            forwards: vec![forward("db:5432"), forward("{{.MISSING}}")],
            ..Default::default()
        };

        let err = materialize(&mut config, &HashMap::new(), &FakeProber::new(&[]))
            .expect_err("missing key must fail materialization");
        assert_eq!(err.index, 1);
        assert!(matches!(err.source, ForwardBindError::Template(_)));
    }

    #[test]
    fn test_target_without_port_or_default_fails() {
        let mut config = Config {
            forwards: vec![forward("db.internal")],
            ..Default::default()
        };

        let err = materialize(&mut config, &HashMap::new(), &FakeProber::new(&[]))
            .expect_err("tcp scheme has no default port");
        assert!(matches!(err.source, ForwardBindError::MissingPort(_)));
    }

    #[test]
    fn test_empty_target_is_skipped() {
        let mut config = Config {
            forwards: vec![forward(""), forward("db:5432")],
            ..Default::default()
        };

        materialize(&mut config, &HashMap::new(), &FakeProber::new(&[])).unwrap();

        assert!(!config.forwards[0].is_active());
        assert!(config.forwards[1].is_active());
        // The skipped forward consumed no source port.
        assert_eq!(config.forwards[1].source_addr, ":50000");
    }

    #[test]
    fn test_split_at_template_navigation() {
        let mut config = Config {
            forwards: vec![forward(r#"{{ splitAt .MY_VAR "," 1 }}"#)],
            ..Default::default()
        };
        let env = envs(&[("MY_VAR", "a:1,b:2")]);

        materialize(&mut config, &env, &FakeProber::new(&[])).unwrap();

        assert_eq!(config.forwards[0].target_addr, "b:2");
    }

    #[test]
    fn test_all_parsed_forms_present_and_ports_unique() {
        let mut config = Config {
            forwards: vec![forward("db:5432"), forward("cache:6379"), forward("mq:5672")],
            ..Default::default()
        };

        materialize(&mut config, &HashMap::new(), &FakeProber::new(&[])).unwrap();

        let mut local_ports = HashSet::new();
        let mut source_ports = HashSet::new();
        for fwd in &config.forwards {
            assert!(fwd.local_parsed.is_some());
            assert!(fwd.source_parsed.is_some());
            assert!(fwd.target_parsed.is_some());
            assert!(local_ports.insert(fwd.local_port().unwrap()));
            assert!(source_ports.insert(fwd.source_port().unwrap()));
        }
    }

    #[test]
    fn test_explicit_addresses_are_kept() {
        let mut config = Config {
            forwards: vec![ForwardConfig {
                name: "database".to_string(),
                local_addr: "127.0.0.1:15432".to_string(),
                source_addr: ":50001".to_string(),
                target_addr: "postgres.svc:5432".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        materialize(&mut config, &HashMap::new(), &FakeProber::new(&[])).unwrap();

        let fwd = &config.forwards[0];
        assert_eq!(fwd.local_addr, "127.0.0.1:15432");
        assert_eq!(fwd.source_addr, ":50001");
        assert_eq!(fwd.target_addr, "postgres.svc:5432");
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
forwarderAgentPath: /opt/podlink-agent
target:
  pod:
    namespace: staging
    labelSelector: app=backend
    container: service
forwards:
  - name: database
    targetAddr: "postgres.svc:5432"
  - name: auth
    localAddr: "127.0.0.1:9000"
    targetAddr: "{{.AUTH_SERVICE_URL}}"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.forwarder_agent_path.as_deref(),
            Some("/opt/podlink-agent")
        );
        let pod = config.target.pod.as_ref().unwrap();
        assert_eq!(pod.namespace, "staging");
        assert_eq!(pod.label_selector, "app=backend");
        assert_eq!(pod.container, "service");
        assert_eq!(config.forwards.len(), 2);
        assert_eq!(config.forwards[1].local_addr, "127.0.0.1:9000");
    }
}
