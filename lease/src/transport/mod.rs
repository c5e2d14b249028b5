pub mod harness;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{LeaseDurationType, LeaseDurations, LeaseGlobalConfig};
use crate::security::SecurityMaterial;

/// Handle for one registered leasing application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppHandle(u64);

impl AppHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app#{}", self.0)
    }
}

/// Handle for one lease relationship inside a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseHandle(u64);

impl LeaseHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease#{}", self.0)
    }
}

/// Remaining validity of a lease as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseTtl {
    Remaining(Duration),
    /// No lease constrains the application.
    NoLimit,
}

impl LeaseTtl {
    pub const ZERO: LeaseTtl = LeaseTtl::Remaining(Duration::ZERO);

    /// Resolves `NoLimit` to `fallback`.
    pub fn or_duration(self, fallback: Duration) -> Duration {
        match self {
            LeaseTtl::Remaining(ttl) => ttl,
            LeaseTtl::NoLimit => fallback,
        }
    }

    pub fn is_no_limit(self) -> bool {
        matches!(self, LeaseTtl::NoLimit)
    }

    /// Adds `extra` to a finite TTL. `NoLimit` stays `NoLimit`.
    pub fn widened(self, extra: Duration) -> LeaseTtl {
        match self {
            LeaseTtl::Remaining(ttl) => LeaseTtl::Remaining(ttl.saturating_add(extra)),
            LeaseTtl::NoLimit => LeaseTtl::NoLimit,
        }
    }
}

impl fmt::Display for LeaseTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseTtl::Remaining(ttl) => write!(f, "{:?}", ttl),
            LeaseTtl::NoLimit => f.write_str("no-limit"),
        }
    }
}

/// A TTL together with the instant it was measured at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlReading {
    pub ttl: LeaseTtl,
    pub reference: Instant,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("access denied")]
    AccessDenied,

    #[error("lease driver not found")]
    NotFound,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("lease driver version mismatch")]
    VersionMismatch,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("lease driver busy, retry")]
    Retry,

    #[error("leasing application {0} is already registered")]
    AlreadyRegistered(String),

    #[error("remote leasing application {0} is not registered")]
    RemoteNotRegistered(String),

    #[error("remote {0} is unreachable")]
    RemoteUnreachable(String),

    #[error("lease not found")]
    LeaseNotFound,

    #[error("lease driver call failed: {0}")]
    Unsuccessful(String),
}

impl TransportError {
    /// Establish failures a partner should retry on its backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Retry
                | TransportError::RemoteNotRegistered(_)
                | TransportError::RemoteUnreachable(_)
        )
    }

    /// Teardown targets that no longer exist. Cleanup treats these as success.
    pub fn is_already_gone(&self) -> bool {
        matches!(self, TransportError::LeaseNotFound | TransportError::InvalidHandle)
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opaque credential material pushed to the driver.
pub type Credentials = SecurityMaterial;

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub leasing_application_id: String,
    pub local_address: String,
    pub durations: LeaseDurations,
    pub lease_suspend_timeout: Duration,
    pub arbitration_timeout: Duration,
    pub lease_retry_count: u32,
    pub lease_renew_begin_ratio: u32,
    pub app_lease_expiry_timeout: Duration,
    pub security: Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub app: AppHandle,
    /// Lease agent instance. Changes whenever the driver restarts the agent.
    pub instance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishLeaseRequest {
    pub remote_id: String,
    pub remote_address: String,
    pub remote_instance: i64,
    pub duration_type: LeaseDurationType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishedLease {
    pub handle: LeaseHandle,
    /// The lease was already up when the call returned. No
    /// `on_lease_established` callback will follow.
    pub already_established: bool,
}

/// Remaining durations of the two directions of a lease with one remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteExpiration {
    /// How long the local side keeps monitoring the remote.
    pub monitor: Option<Duration>,
    /// How long the remote is guaranteed to consider the local side alive.
    pub subject: Option<Duration>,
}

/// A conflict the driver asks the local application to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitrationRequest {
    pub app: AppHandle,
    pub local_instance: i64,
    pub local_ttl: LeaseTtl,
    pub remote_address: String,
    pub remote_instance: i64,
    pub remote_ttl: LeaseTtl,
    pub remote_version: u16,
    pub monitor_lease_instance: i64,
    pub subject_lease_instance: i64,
    pub remote_arbitration_duration_upper_bound: i64,
}

/// Verdict reported back through `complete_arbitration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitrationCompletion {
    pub local_instance: i64,
    pub remote_address: String,
    pub remote_instance: i64,
    pub local_ttl: LeaseTtl,
    pub remote_ttl: LeaseTtl,
}

/// A health condition raised by the driver itself rather than by a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub code: i32,
    pub property: String,
    pub description: String,
}

/// Asynchronous notifications from a lease driver.
///
/// Implementations may be called on driver-owned threads and must not call
/// back into the driver synchronously.
pub trait TransportEvents: Send + Sync {
    fn on_lease_established(&self, remote_id: &str, lease: LeaseHandle);

    /// The local application lost its lease.
    fn on_lease_failed(&self);

    fn on_remote_leasing_application_failed(&self, remote_id: &str);

    fn on_arbitrate(&self, request: ArbitrationRequest);

    fn on_health_report(&self, report: HealthReport);
}

/// What the agent needs from a lease driver. Handles are typed and opaque.
pub trait LeaseTransport: Send + Sync + fmt::Debug {
    fn register(
        &self,
        request: RegisterRequest,
        events: Arc<dyn TransportEvents>,
    ) -> TransportResult<Registration>;

    fn establish_lease(
        &self,
        app: AppHandle,
        request: &EstablishLeaseRequest,
    ) -> TransportResult<EstablishedLease>;

    fn terminate_lease(&self, app: AppHandle, lease: LeaseHandle, remote_id: &str) -> TransportResult<()>;

    /// `delayed` keeps the registration alive for the configured close delay
    /// so remotes observe a graceful departure.
    fn unregister(&self, app: AppHandle, delayed: bool) -> TransportResult<()>;

    fn expiration_time(&self, app: AppHandle) -> TransportResult<TtlReading>;

    fn remote_expiration_time(&self, app: AppHandle, remote_id: &str) -> TransportResult<RemoteExpiration>;

    fn complete_arbitration(&self, app: AppHandle, completion: ArbitrationCompletion) -> TransportResult<()>;

    fn update_durations(&self, app: AppHandle, durations: LeaseDurations) -> TransportResult<()>;

    fn update_security(&self, app: AppHandle, security: &Credentials) -> TransportResult<()>;

    fn update_heartbeat_result(&self, app: AppHandle, healthy: bool) -> TransportResult<()>;

    /// Applies to every registration on the driver, including the delay
    /// used by `unregister(app, true)`.
    fn update_global_config(&self, config: &LeaseGlobalConfig) -> TransportResult<()>;
}
