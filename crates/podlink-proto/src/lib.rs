//! Wire contract between the podlink supervisor and the in-pod relay agent.
//!
//! Both halves run as separate processes, so the protocol is intentionally
//! small: a command-line pair syntax, a readiness line on stdout, and a JSON
//! status schema served by the agent's control port.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Substring the agent prints on stdout once every listener is bound.
/// The supervisor scans the exec stream for it.
pub const READY_MARKER: &str = "FORWARDERS READY";

/// Environment variable overriding the agent's control port.
pub const API_PORT_ENV: &str = "FORWARDER_API_PORT";

/// Default control port for the agent's HTTP API.
pub const DEFAULT_API_PORT: u16 = 8181;

/// Separator between the source and target halves of an `-address` pair.
pub const PAIR_SEPARATOR: &str = "->";

/// The agent exits if no `/ping` arrives for this many seconds.
pub const WATCHDOG_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairParseError {
    #[error("invalid forward pair format: {0}")]
    InvalidFormat(String),
    #[error("forward pair err[{index}]: {source}")]
    AtIndex {
        index: usize,
        #[source]
        source: Box<PairParseError>,
    },
}

/// A single `src->dst` forwarding pair as passed on the agent command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPair {
    /// Listener address on the agent side, e.g. `:50000`.
    pub source_addr: String,
    /// Final in-cluster destination, e.g. `postgres.svc:5432`.
    pub target_addr: String,
}

impl ForwardPair {
    /// Parse a `src->dst` pair. Whitespace around either half is trimmed;
    /// anything after a second separator is ignored.
    pub fn parse(raw: &str) -> Result<Self, PairParseError> {
        let mut fields = raw.split(PAIR_SEPARATOR);
        match (fields.next(), fields.next()) {
            (Some(source), Some(target)) => Ok(Self {
                source_addr: source.trim().to_string(),
                target_addr: target.trim().to_string(),
            }),
            _ => Err(PairParseError::InvalidFormat(raw.to_string())),
        }
    }

    /// Parse a list of pairs, reporting the position of the first bad entry.
    pub fn parse_list(raw: &[String]) -> Result<Vec<Self>, PairParseError> {
        raw.iter()
            .enumerate()
            .map(|(index, item)| {
                Self::parse(item).map_err(|source| PairParseError::AtIndex {
                    index,
                    source: Box::new(source),
                })
            })
            .collect()
    }

    /// Render the pair back into the command-line syntax.
    pub fn to_arg(&self) -> String {
        format!("{}{}{}", self.source_addr, PAIR_SEPARATOR, self.target_addr)
    }
}

/// The exact line the agent prints once all listeners are bound.
pub fn ready_line(count: usize) -> String {
    format!("{READY_MARKER}. count: {count}")
}

/// One element of the `GET /forwarders` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwarderStatus {
    pub source_addr: String,
    pub target_addr: String,
    /// Most recent upstream health-check failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let pair = ForwardPair::parse(" :50000 -> postgres.svc:5432 ").unwrap();
        assert_eq!(pair.source_addr, ":50000");
        assert_eq!(pair.target_addr, "postgres.svc:5432");
    }

    #[test]
    fn test_parse_pair_extra_separator_ignores_tail() {
        let pair = ForwardPair::parse("a:1->b:2->c:3").unwrap();
        assert_eq!(pair.source_addr, "a:1");
        assert_eq!(pair.target_addr, "b:2");
    }

    #[test]
    fn test_parse_pair_missing_separator() {
        assert!(matches!(
            ForwardPair::parse("postgres.svc:5432"),
            Err(PairParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_list_reports_index() {
        let raw = vec![":50000->db:5432".to_string(), "broken".to_string()];
        match ForwardPair::parse_list(&raw) {
            Err(PairParseError::AtIndex { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected index error, got {other:?}"),
        }
    }

    #[test]
    fn test_ready_line_contains_marker() {
        assert_eq!(ready_line(3), "FORWARDERS READY. count: 3");
        assert!(ready_line(0).contains(READY_MARKER));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ForwarderStatus {
            source_addr: ":50000".to_string(),
            target_addr: "db:5432".to_string(),
            error: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("sourceAddr"));
        assert!(!json.contains("error"));
    }
}
