//! `/etc/hosts` rewriting and the per-run set of installed entries.
//!
//! Untouched lines are preserved byte-for-byte: the editor splits the file
//! on newlines, only modifies lines that mention the host being removed, and
//! appends new entries as fresh lines. Adding and then removing the same
//! host leaves the file identical to its pre-add state.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::loopback::{self, LoopbackError};

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("hosts file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why installing a forward's host mapping failed.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The loopback alias could not be added; the forward is unusable but
    /// the run continues.
    #[error("loopback alias {ip}: {source}")]
    Alias {
        ip: String,
        #[source]
        source: LoopbackError,
    },
    /// The hosts file could not be updated; this is fatal for the run.
    #[error(transparent)]
    Hosts(#[from] HostsError),
}

/// Line-preserving editor for a hosts file.
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    /// The system hosts file.
    pub fn system() -> Self {
        Self {
            path: PathBuf::from("/etc/hosts"),
        }
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Rewrite the file with its current content. Used once at startup to
    /// surface permission problems early; denial is reported by the caller
    /// as a warning, not a failure.
    pub fn probe_writable(&self) -> Result<(), HostsError> {
        let content = self.read()?;
        self.write(&content)
    }

    /// Map `host` to `ip`. Any existing mapping for `host` is dropped first
    /// so a hostname never resolves to two addresses.
    pub fn add_host(&self, ip: &str, host: &str) -> Result<(), HostsError> {
        let content = self.read()?;
        let mut lines = split_lines(&content);
        strip_host(&mut lines, host);

        let entry = format!("{ip}\t{host}");
        match lines.last() {
            // Keep the trailing newline where the file already had one.
            Some(last) if last.is_empty() => {
                let idx = lines.len() - 1;
                lines.insert(idx, entry);
            }
            _ => lines.push(entry),
        }

        self.write(&lines.join("\n"))
    }

    /// Remove every mapping for `host`, leaving all other lines untouched.
    pub fn remove_host(&self, host: &str) -> Result<(), HostsError> {
        let content = self.read()?;
        let mut lines = split_lines(&content);
        strip_host(&mut lines, host);
        self.write(&lines.join("\n"))
    }

    fn read(&self) -> Result<String, HostsError> {
        std::fs::read_to_string(&self.path).map_err(|source| HostsError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write(&self, content: &str) -> Result<(), HostsError> {
        std::fs::write(&self.path, content).map_err(|source| HostsError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }
}

fn split_lines(content: &str) -> Vec<String> {
    content.split('\n').map(str::to_string).collect()
}

/// Drop `host` from every entry line; lines left without hostnames are
/// removed entirely. Comment lines are never touched.
fn strip_host(lines: &mut Vec<String>, host: &str) {
    lines.retain_mut(|line| {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return true;
        }

        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next() else {
            return true;
        };
        let hostnames: Vec<&str> = fields.collect();
        if !hostnames.iter().any(|h| *h == host) {
            return true;
        }

        let kept: Vec<&str> = hostnames.into_iter().filter(|h| *h != host).collect();
        if kept.is_empty() {
            return false;
        }
        *line = format!("{ip}\t{}", kept.join(" "));
        true
    });
}

/// One installed mapping, remembered so teardown removes exactly what this
/// run added.
struct InstalledEntry {
    ip: String,
    host: String,
    aliased: bool,
}

/// Installs host mappings and loopback aliases for forwards, and guarantees
/// their removal in reverse order on teardown.
pub struct HostRewriter {
    file: HostsFile,
    installed: Vec<InstalledEntry>,
}

impl HostRewriter {
    pub fn new(file: HostsFile) -> Self {
        Self {
            file,
            installed: Vec::new(),
        }
    }

    /// Surface hosts-file permission problems before any forward starts.
    pub fn check_access(&self) {
        if let Err(err) = self.file.probe_writable() {
            warn!(
                error = %err,
                "permission denied on hosts file, run privileged to map forwarded domains locally"
            );
        }
    }

    /// Install the mapping for one forward: loopback alias first (for
    /// non-127.0.0.1 listeners), then the hosts entry.
    pub fn install(&mut self, local_ip: &str, target_host: &str) -> Result<(), InstallError> {
        let mut aliased = false;
        if local_ip != "127.0.0.1" {
            loopback::add_alias(local_ip).map_err(|source| InstallError::Alias {
                ip: local_ip.to_string(),
                source,
            })?;
            aliased = true;
        }

        if let Err(err) = self.file.add_host(local_ip, target_host) {
            if aliased {
                if let Err(alias_err) = loopback::remove_alias(local_ip) {
                    error!(ip = %local_ip, error = %alias_err, "unable to roll back loopback alias");
                }
            }
            return Err(err.into());
        }

        info!(ip = %local_ip, host = %target_host, "mapped host locally");
        self.installed.push(InstalledEntry {
            ip: local_ip.to_string(),
            host: target_host.to_string(),
            aliased,
        });
        Ok(())
    }

    /// Remove everything this run installed, in reverse order. Failures are
    /// logged and do not stop the remaining removals.
    pub fn cleanup(&mut self) {
        while let Some(entry) = self.installed.pop() {
            if let Err(err) = self.file.remove_host(&entry.host) {
                error!(host = %entry.host, error = %err, "unable to remove hosts entry");
            }
            if entry.aliased {
                if let Err(err) = loopback::remove_alias(&entry.ip) {
                    error!(ip = %entry.ip, error = %err, "unable to remove loopback alias");
                }
            }
        }
    }
}

impl Drop for HostRewriter {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &str) -> (tempfile::NamedTempFile, HostsFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let hosts = HostsFile::with_path(file.path());
        (file, hosts)
    }

    const BASE: &str = "127.0.0.1\tlocalhost\n# comment line\n192.168.1.5\trouter.lan\n";

    #[test]
    fn test_add_host_appends_entry() {
        let (file, hosts) = fixture(BASE);
        hosts.add_host("10.0.0.10", "auth.local").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("10.0.0.10\tauth.local"));
        assert!(content.starts_with("127.0.0.1\tlocalhost"));
    }

    #[test]
    fn test_add_then_remove_is_byte_identical() {
        let (file, hosts) = fixture(BASE);
        hosts.add_host("10.0.0.10", "auth.local").unwrap();
        hosts.remove_host("auth.local").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, BASE);
    }

    #[test]
    fn test_add_without_trailing_newline() {
        let (file, hosts) = fixture("127.0.0.1\tlocalhost");
        hosts.add_host("10.0.0.10", "db.svc").unwrap();
        hosts.remove_host("db.svc").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "127.0.0.1\tlocalhost");
    }

    #[test]
    fn test_add_host_replaces_previous_mapping() {
        let (file, hosts) = fixture(BASE);
        hosts.add_host("10.0.0.10", "auth.local").unwrap();
        hosts.add_host("10.0.0.11", "auth.local").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(!content.contains("10.0.0.10\tauth.local"));
        assert!(content.contains("10.0.0.11\tauth.local"));
        assert_eq!(content.matches("auth.local").count(), 1);
    }

    #[test]
    fn test_remove_host_keeps_other_names_on_shared_line() {
        let (file, hosts) = fixture("127.0.0.1\tlocalhost auth.local db.svc\n");
        hosts.remove_host("auth.local").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("localhost"));
        assert!(content.contains("db.svc"));
        assert!(!content.contains("auth.local"));
    }

    #[test]
    fn test_remove_host_ignores_comments() {
        let (file, hosts) = fixture("# auth.local is documented here\n10.0.0.10\tauth.local\n");
        hosts.remove_host("auth.local").unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("# auth.local is documented here"));
        assert!(!content.contains("10.0.0.10"));
    }
}
