use async_trait::async_trait;
use std::time::Duration;

use crate::transport::{HealthReport, LeaseTtl};

/// How the two sides of an arbitration relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationType {
    /// The remote has no instance yet; only keep-alive semantics apply.
    KeepAlive,
    /// Only the remote monitors us.
    OneWay,
    TwoWaySimple,
    TwoWayExtended,
}

impl ArbitrationType {
    pub fn classify(remote_instance: i64, monitor_lease_instance: i64, remote_version: u16) -> Self {
        if remote_instance == 0 {
            ArbitrationType::KeepAlive
        } else if monitor_lease_instance == 0 {
            ArbitrationType::OneWay
        } else if remote_version >> 8 == 1 {
            ArbitrationType::TwoWaySimple
        } else {
            ArbitrationType::TwoWayExtended
        }
    }
}

/// Everything the application needs to decide an arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitrationContext {
    pub local_id: String,
    pub local_instance: i64,
    pub local_ttl: LeaseTtl,
    pub remote_address: String,
    pub remote_instance: i64,
    /// Already widened by the clock uncertainty interval.
    pub remote_ttl: LeaseTtl,
    pub remote_version: u16,
    pub monitor_lease_instance: i64,
    pub subject_lease_instance: i64,
    pub arbitration_duration_upper_bound: i64,
    pub arbitration_type: ArbitrationType,
}

/// The application's answer: how long each side may keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationVerdict {
    pub local_ttl: LeaseTtl,
    pub remote_ttl: LeaseTtl,
}

impl ArbitrationVerdict {
    /// The local side stops immediately.
    pub fn concede() -> Self {
        Self {
            local_ttl: LeaseTtl::ZERO,
            remote_ttl: LeaseTtl::NoLimit,
        }
    }

    /// The remote side must stop within `grace`.
    pub fn prevail(grace: Duration) -> Self {
        Self {
            local_ttl: LeaseTtl::NoLimit,
            remote_ttl: LeaseTtl::Remaining(grace),
        }
    }

    /// Both sides keep running and the lease should be re-established.
    pub fn keep_both() -> Self {
        Self {
            local_ttl: LeaseTtl::NoLimit,
            remote_ttl: LeaseTtl::NoLimit,
        }
    }

    pub fn keeps_both(&self) -> bool {
        self.local_ttl.is_no_limit() && self.remote_ttl.is_no_limit()
    }
}

/// Callbacks a lease agent makes into its owning application.
///
/// Calls are made from the agent's dispatcher, never from a driver thread.
#[async_trait]
pub trait LeasingApplication: Send + Sync {
    /// The local lease was lost. The application must stop acting on it.
    fn on_lease_failed(&self);

    fn on_remote_leasing_application_failed(&self, remote_id: &str);

    async fn arbitrate(&self, context: ArbitrationContext) -> ArbitrationVerdict;

    /// A driver-level health condition, such as a stalled maintenance timer.
    fn on_health_report(&self, _report: &HealthReport) {}
}
