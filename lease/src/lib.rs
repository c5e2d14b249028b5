#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod application;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod ipc;
pub mod monitor;
pub mod partner;
pub mod security;
pub mod telemetry;
pub mod time;
pub mod transport;

pub use agent::{EstablishRequest, LeaseAgent, PendingEstablish, RemoteLeaseExpiration};
pub use application::{ArbitrationContext, ArbitrationType, ArbitrationVerdict, LeasingApplication};
pub use config::{ConfigKey, ConfigStore, LeaseAgentConfiguration, LeaseConfig, LeaseDurationType, LeaseGlobalConfig};
pub use error::{Error, Result};
pub use monitor::{LeaseMonitor, MonitorMode};
pub use partner::PartnerState;
pub use security::{ProtectionLevel, SecurityProvider, SecuritySettings};
pub use transport::{harness::LeaseHarness, HealthReport, LeaseTransport, LeaseTtl};

/// A lease agent as its peers see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeInstance {
    pub address: String,
    pub instance: i64,
}

impl std::fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.instance)
    }
}
