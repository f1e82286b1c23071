//! ICMP reachability probe used for local-IP assignment.
//!
//! A candidate loopback-alias IP is only usable if nothing answers on it, so
//! the materializer sends a single echo with a short deadline and treats a
//! successful reply as "taken".

use std::net::Ipv4Addr;
use std::process::Command;

/// Answers whether an IP currently responds to an ICMP echo.
pub trait Prober {
    fn is_reachable(&self, ip: Ipv4Addr) -> bool;
}

/// Probes by shelling out to the system `ping` tool with a 1-second deadline.
pub struct IcmpProber;

impl Prober for IcmpProber {
    fn is_reachable(&self, ip: Ipv4Addr) -> bool {
        let mut cmd = Command::new("ping");
        cmd.arg("-c").arg("1");
        #[cfg(target_os = "macos")]
        cmd.arg("-t").arg("1");
        #[cfg(not(target_os = "macos"))]
        cmd.arg("-W").arg("1");
        cmd.arg(ip.to_string());

        cmd.output().map(|out| out.status.success()).unwrap_or(false)
    }
}
