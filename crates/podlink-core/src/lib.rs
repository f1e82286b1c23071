//! Core library for podlink.
//!
//! podlink forwards cluster-internal TCP endpoints to a developer
//! workstation: it picks a running "carrier" pod that can already reach the
//! desired services, stages a small relay agent into it, tunnels workstation
//! traffic to the relay over the pod port-forward channel, and rewrites
//! local host resolution so in-cluster hostnames work unchanged.

pub mod addr;
pub mod cluster;
pub mod config;
pub mod hosts;
pub mod loopback;
pub mod probe;
pub mod stage;
pub mod supervisor;
pub mod template;
pub mod tunnel;

pub use cluster::{ClusterClient, KubeClient, PodRef};
pub use config::{Config, ForwardConfig, PodTarget};
pub use supervisor::{RunOptions, Supervisor};
