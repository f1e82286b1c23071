//! Loopback interface aliases.
//!
//! Auto-assigned listener IPs in the `10.0.0.x` range only work if the
//! loopback interface answers for them. macOS and Linux spell this
//! differently; other platforms are reported as unsupported and the forward
//! is skipped.

#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("loopback aliases are not supported on this platform")]
    Unsupported,
}

/// Alias `ip` onto the loopback interface.
pub fn add_alias(ip: &str) -> Result<(), LoopbackError> {
    #[cfg(target_os = "macos")]
    return run_cmd("ifconfig", &["lo0", "alias", ip]);

    #[cfg(target_os = "linux")]
    return run_cmd("ip", &["addr", "add", &format!("{ip}/32"), "dev", "lo"]);

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = ip;
        Err(LoopbackError::Unsupported)
    }
}

/// Remove a previously added alias.
pub fn remove_alias(ip: &str) -> Result<(), LoopbackError> {
    #[cfg(target_os = "macos")]
    return run_cmd("ifconfig", &["lo0", "-alias", ip]);

    #[cfg(target_os = "linux")]
    return run_cmd("ip", &["addr", "del", &format!("{ip}/32"), "dev", "lo"]);

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = ip;
        Err(LoopbackError::Unsupported)
    }
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn run_cmd(program: &str, args: &[&str]) -> Result<(), LoopbackError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| LoopbackError::CommandFailed(format!("{program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LoopbackError::CommandFailed(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}
