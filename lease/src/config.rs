use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::{Error, Result};

/// Which configured lease duration applies to a partner relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseDurationType {
    Regular,
    AcrossFaultDomain,
}

impl LeaseDurationType {
    /// Picks the duration type for a pair of fault domains such as
    /// `/dc1/rack4`. Only the first segment is compared.
    pub fn for_fault_domains(config: &LeaseConfig, local: &str, remote: &str) -> Self {
        let first_segment = |fd: &str| fd.split('/').find(|s| !s.is_empty()).map(str::to_owned);

        if config.lease_duration_across_fault_domain.is_zero() {
            return LeaseDurationType::Regular;
        }
        match (first_segment(local), first_segment(remote)) {
            (Some(l), Some(r)) if l != r => LeaseDurationType::AcrossFaultDomain,
            _ => LeaseDurationType::Regular,
        }
    }
}

/// Thresholds used by the arbitration layer to weigh suspicion reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspicionLevels {
    pub weak: u32,
    pub strong: u32,
    pub reject: u32,
    pub threshold: u32,
    pub report_threshold: u32,
    pub comparison_threshold: u32,
    pub keep_alive: u32,
}

impl Default for SuspicionLevels {
    fn default() -> Self {
        Self {
            weak: 1,
            strong: 3,
            reject: 5,
            threshold: 2,
            report_threshold: 3,
            comparison_threshold: 2,
            keep_alive: 1,
        }
    }
}

/// Settings for the periodic self heartbeat started by `LeaseAgent::open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Zero disables the heartbeat.
    pub interval: Duration,
    /// Directory for the probe file. `None` heartbeats without touching disk.
    pub probe_directory: Option<PathBuf>,
    /// Sectors written per probe. Negative means a random count in `1..=|n|`.
    pub buffer_sector_count: i32,
    pub sector_size: u32,
    /// Fill byte for the probe buffer. Negative means random bytes.
    pub buffer_data: i32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            probe_directory: None,
            buffer_sector_count: 1,
            sector_size: 512,
            buffer_data: 0x42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub lease_duration: Duration,
    /// Zero disables the across-fault-domain duration.
    pub lease_duration_across_fault_domain: Duration,
    pub max_lease_duration: Duration,
    pub unresponsive_duration: Duration,
    pub lease_suspend_timeout: Duration,
    pub lease_retry_count: u32,
    pub lease_renew_begin_ratio: u32,
    /// Backoff between partner establish attempts.
    pub lease_retry_interval: Duration,
    pub application_lease_duration: Duration,
    pub arbitration_timeout: Duration,
    pub max_arbitration_timeout: Duration,
    pub arbitration_request_delay: Duration,
    pub arbitration_retry_interval: Duration,
    pub arbitration_cleanup_interval: Duration,
    pub max_consecutive_indirect_lease_duration: Duration,
    pub lease_clock_uncertainty_interval: Duration,
    /// How long the driver keeps a gracefully closed registration alive.
    pub delay_lease_agent_close_interval: Duration,
    pub lease_maintenance_interval: Duration,
    pub process_assert_exit_timeout: Duration,
    pub timer_margin: Duration,
    pub suspicion: SuspicionLevels,
    pub heartbeat: HeartbeatSettings,
    /// Slack added to the regular indirect monitor poll interval.
    pub monitor_poll_margin: Duration,
    /// Lower bound on the indirect monitor poll interval.
    pub monitor_min_poll_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            lease_duration_across_fault_domain: Duration::from_secs(30),
            max_lease_duration: Duration::from_secs(30),
            unresponsive_duration: Duration::ZERO,
            lease_suspend_timeout: Duration::from_secs(2),
            lease_retry_count: 2,
            lease_renew_begin_ratio: 4,
            lease_retry_interval: Duration::from_secs(1),
            application_lease_duration: Duration::from_secs(30),
            arbitration_timeout: Duration::from_secs(30),
            max_arbitration_timeout: Duration::from_secs(40),
            arbitration_request_delay: Duration::from_secs(1),
            arbitration_retry_interval: Duration::from_secs(5),
            arbitration_cleanup_interval: Duration::from_secs(30),
            max_consecutive_indirect_lease_duration: Duration::from_secs(60),
            lease_clock_uncertainty_interval: Duration::from_secs(1),
            delay_lease_agent_close_interval: Duration::from_secs(35),
            lease_maintenance_interval: Duration::from_secs(15),
            process_assert_exit_timeout: Duration::from_secs(300),
            timer_margin: Duration::from_millis(16),
            suspicion: SuspicionLevels::default(),
            heartbeat: HeartbeatSettings::default(),
            monitor_poll_margin: Duration::from_millis(500),
            monitor_min_poll_interval: Duration::from_secs(1),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.lease_duration.is_zero() {
            return invalid("lease_duration must be positive");
        }
        if self.max_lease_duration < self.lease_duration {
            return invalid("max_lease_duration must be at least lease_duration");
        }
        if self.max_lease_duration < self.lease_duration_across_fault_domain {
            return invalid("max_lease_duration must be at least lease_duration_across_fault_domain");
        }
        if self.lease_renew_begin_ratio < 2 {
            return invalid("lease_renew_begin_ratio must be at least 2");
        }
        if self.lease_retry_interval.is_zero() {
            return invalid("lease_retry_interval must be positive");
        }
        if self.arbitration_timeout.is_zero() || self.max_arbitration_timeout < self.arbitration_timeout {
            return invalid("arbitration_timeout must be positive and not exceed max_arbitration_timeout");
        }
        if self.monitor_min_poll_interval.is_zero() {
            return invalid("monitor_min_poll_interval must be positive");
        }
        let s = &self.suspicion;
        if !(s.weak <= s.strong && s.strong <= s.reject) {
            return invalid("suspicion levels must satisfy weak <= strong <= reject");
        }
        if self.heartbeat.sector_size == 0 {
            return invalid("heartbeat sector_size must be positive");
        }
        Ok(())
    }

    pub fn lease_duration_for(&self, duration_type: LeaseDurationType) -> Duration {
        match duration_type {
            LeaseDurationType::Regular => self.lease_duration,
            LeaseDurationType::AcrossFaultDomain if !self.lease_duration_across_fault_domain.is_zero() => {
                self.lease_duration_across_fault_domain
            }
            LeaseDurationType::AcrossFaultDomain => self.lease_duration,
        }
    }

    /// The duration block pushed to the transport on registration and reload.
    pub fn durations(&self) -> LeaseDurations {
        LeaseDurations {
            lease_duration: self.lease_duration,
            lease_duration_across_fault_domain: self.lease_duration_across_fault_domain,
            unresponsive_duration: self.unresponsive_duration,
            max_indirect_lease_duration: self.max_consecutive_indirect_lease_duration,
        }
    }

    /// Driver-wide settings shared by every registration.
    pub fn global_config(&self) -> LeaseGlobalConfig {
        LeaseGlobalConfig {
            maintenance_interval: self.lease_maintenance_interval,
            process_assert_exit_timeout: self.process_assert_exit_timeout,
            delay_lease_agent_close_interval: self.delay_lease_agent_close_interval,
        }
    }

    /// Keys whose values differ between `self` and `other`.
    pub fn changed_keys(&self, other: &LeaseConfig) -> Vec<ConfigKey> {
        let mut keys = Vec::new();
        let mut check = |changed: bool, key| {
            if changed {
                keys.push(key);
            }
        };
        check(self.lease_duration != other.lease_duration, ConfigKey::LeaseDuration);
        check(
            self.lease_duration_across_fault_domain != other.lease_duration_across_fault_domain,
            ConfigKey::LeaseDurationAcrossFaultDomain,
        );
        check(self.unresponsive_duration != other.unresponsive_duration, ConfigKey::UnresponsiveDuration);
        check(
            self.max_consecutive_indirect_lease_duration != other.max_consecutive_indirect_lease_duration,
            ConfigKey::MaxConsecutiveIndirectLeaseDuration,
        );
        check(
            self.lease_suspend_timeout != other.lease_suspend_timeout
                || self.arbitration_timeout != other.arbitration_timeout
                || self.lease_retry_count != other.lease_retry_count
                || self.lease_renew_begin_ratio != other.lease_renew_begin_ratio
                || self.application_lease_duration != other.application_lease_duration,
            ConfigKey::AgentTimeouts,
        );
        check(self.global_config() != other.global_config(), ConfigKey::GlobalConfig);
        check(self.heartbeat != other.heartbeat, ConfigKey::Heartbeat);
        drop(check);
        if self != other && keys.is_empty() {
            keys.push(ConfigKey::Other);
        }
        keys
    }
}

/// Durations the transport needs to renew leases on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDurations {
    pub lease_duration: Duration,
    pub lease_duration_across_fault_domain: Duration,
    pub unresponsive_duration: Duration,
    pub max_indirect_lease_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGlobalConfig {
    pub maintenance_interval: Duration,
    pub process_assert_exit_timeout: Duration,
    pub delay_lease_agent_close_interval: Duration,
}

/// Groups of settings a subscriber can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    LeaseDuration,
    LeaseDurationAcrossFaultDomain,
    UnresponsiveDuration,
    MaxConsecutiveIndirectLeaseDuration,
    AgentTimeouts,
    GlobalConfig,
    Heartbeat,
    Other,
}

/// Keys whose change must be re-pushed to the lease transport.
pub const DURATION_KEYS: &[ConfigKey] = &[
    ConfigKey::LeaseDuration,
    ConfigKey::LeaseDurationAcrossFaultDomain,
    ConfigKey::UnresponsiveDuration,
    ConfigKey::MaxConsecutiveIndirectLeaseDuration,
];

type Handler = Arc<dyn Fn(&LeaseConfig) + Send + Sync>;

struct Subscriber {
    keys: Vec<ConfigKey>,
    handler: Handler,
}

/// Live, reloadable lease settings.
pub struct ConfigStore {
    current: RwLock<Arc<LeaseConfig>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("current", &self.current.read())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl ConfigStore {
    pub fn new(config: LeaseConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            current: RwLock::new(Arc::new(config)),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn snapshot(&self) -> Arc<LeaseConfig> {
        self.current.read().clone()
    }

    /// Applies `change` to a copy of the live settings, validates it, swaps it
    /// in, and notifies subscribers of the changed keys. Returns those keys.
    pub fn update<F>(&self, change: F) -> Result<Vec<ConfigKey>>
    where
        F: FnOnce(&mut LeaseConfig),
    {
        let (changed, snapshot) = {
            let mut current = self.current.write();
            let mut next = LeaseConfig::clone(&current);
            change(&mut next);
            next.validate()?;

            let changed = current.changed_keys(&next);
            if changed.is_empty() {
                return Ok(changed);
            }
            *current = Arc::new(next);
            (changed, current.clone())
        };

        info!(?changed, "lease configuration updated");

        // Handlers run outside both locks so they may read the store again.
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .values()
            .filter(|s| s.keys.iter().any(|k| changed.contains(k)))
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            handler(&snapshot);
        }

        Ok(changed)
    }

    /// Registers `handler` for changes to any of `keys`.
    pub fn subscribe<F>(self: &Arc<Self>, keys: &[ConfigKey], handler: F) -> ConfigSubscription
    where
        F: Fn(&LeaseConfig) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(
            id,
            Subscriber {
                keys: keys.to_vec(),
                handler: Arc::new(handler),
            },
        );
        debug!(subscription = id, ?keys, "config subscription added");

        ConfigSubscription {
            id,
            store: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Scoped registration returned by `ConfigStore::subscribe`.
#[derive(Debug)]
pub struct ConfigSubscription {
    id: u64,
    store: Weak<ConfigStore>,
}

impl Drop for ConfigSubscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.subscribers.lock().remove(&self.id);
            debug!(subscription = self.id, "config subscription removed");
        }
    }
}

/// Per-agent snapshot of identity and the timeouts handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseAgentConfiguration {
    pub leasing_application_id: String,
    pub local_address: String,
    pub arbitration_enabled: bool,
    pub suspend_timeout: Duration,
    pub arbitration_timeout: Duration,
    pub retry_count: u32,
    pub renew_begin_ratio: u32,
    pub app_lease_expiry_timeout: Duration,
    pub max_indirect_lease_duration: Duration,
}

impl LeaseAgentConfiguration {
    pub fn new(
        leasing_application_id: impl Into<String>,
        local_address: impl Into<String>,
        arbitration_enabled: bool,
        config: &LeaseConfig,
    ) -> Self {
        let mut agent_config = Self {
            leasing_application_id: leasing_application_id.into(),
            local_address: local_address.into(),
            arbitration_enabled,
            suspend_timeout: Duration::ZERO,
            arbitration_timeout: Duration::ZERO,
            retry_count: 0,
            renew_begin_ratio: 0,
            app_lease_expiry_timeout: Duration::ZERO,
            max_indirect_lease_duration: Duration::ZERO,
        };
        agent_config.refresh(config);
        agent_config
    }

    /// Re-reads the duration fields. Identity fields are left alone.
    pub fn refresh(&mut self, config: &LeaseConfig) {
        self.suspend_timeout = config.lease_suspend_timeout;
        self.arbitration_timeout = config.arbitration_timeout;
        self.retry_count = config.lease_retry_count;
        self.renew_begin_ratio = config.lease_renew_begin_ratio;
        self.app_lease_expiry_timeout = config.application_lease_duration;
        self.max_indirect_lease_duration = config.max_consecutive_indirect_lease_duration;
    }
}
