use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use super::{
    AppHandle, ArbitrationCompletion, ArbitrationRequest, Credentials, EstablishLeaseRequest, EstablishedLease,
    HealthReport, LeaseHandle, LeaseTransport, LeaseTtl, RegisterRequest, Registration, RemoteExpiration, TransportError,
    TransportEvents, TransportResult, TtlReading,
};
use crate::config::{LeaseDurationType, LeaseDurations, LeaseGlobalConfig};
use crate::dispatch::Dispatcher;

/// How `establish_lease` behaves for a new lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishMode {
    /// Returns a pending handle and confirms it later from the queue.
    Async,
    /// Returns an already established lease.
    Synchronous,
    /// Returns a pending handle that is never confirmed.
    Never,
}

/// Events sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl TransportEvents for NullEvents {
    fn on_lease_established(&self, _remote_id: &str, _lease: LeaseHandle) {}
    fn on_lease_failed(&self) {}
    fn on_remote_leasing_application_failed(&self, _remote_id: &str) {}
    fn on_arbitrate(&self, _request: ArbitrationRequest) {}
    fn on_health_report(&self, _report: HealthReport) {}
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    handle: LeaseHandle,
    remote_address: String,
    remote_instance: i64,
    duration_type: LeaseDurationType,
    established: bool,
}

struct AppEntry {
    id: String,
    address: String,
    instance: i64,
    events: Arc<dyn TransportEvents>,
    durations: LeaseDurations,
    security: Credentials,
    ttl: LeaseTtl,
    heartbeat: Option<bool>,
    leases: HashMap<String, LeaseRecord>,
}

impl AppEntry {
    fn duration_for(&self, duration_type: LeaseDurationType) -> Duration {
        match duration_type {
            LeaseDurationType::AcrossFaultDomain if !self.durations.lease_duration_across_fault_domain.is_zero() => {
                self.durations.lease_duration_across_fault_domain
            }
            _ => self.durations.lease_duration,
        }
    }
}

#[derive(Default)]
struct Registry {
    apps: HashMap<AppHandle, AppEntry>,
    by_id: HashMap<String, AppHandle>,
}

impl Registry {
    fn entry(&self, app: AppHandle) -> TransportResult<&AppEntry> {
        self.apps.get(&app).ok_or(TransportError::InvalidHandle)
    }

    fn entry_mut(&mut self, app: AppHandle) -> TransportResult<&mut AppEntry> {
        self.apps.get_mut(&app).ok_or(TransportError::InvalidHandle)
    }

    fn by_id(&self, id: &str) -> Option<(AppHandle, &AppEntry)> {
        let app = *self.by_id.get(id)?;
        self.apps.get(&app).map(|entry| (app, entry))
    }
}

#[derive(Default)]
struct CallLog {
    establish_attempts: HashMap<String, usize>,
    terminations: Vec<(AppHandle, LeaseHandle, String)>,
    unregistrations: Vec<(AppHandle, bool)>,
    completions: Vec<(AppHandle, ArbitrationCompletion)>,
    duration_updates: usize,
    global_config_updates: usize,
}

struct HarnessInner {
    registry: Mutex<Registry>,
    partitions: DashMap<(String, String), ()>,
    queue: Dispatcher,
    establish_delay: Mutex<Duration>,
    mode: Mutex<EstablishMode>,
    next_handle: AtomicU64,
    next_instance: AtomicI64,
    log: Mutex<CallLog>,
    fail_next_security: Mutex<Option<TransportError>>,
    fail_next_registration: Mutex<Option<TransportError>>,
    global_config: Mutex<Option<LeaseGlobalConfig>>,
}

/// Deterministic lease driver for tests and demos.
#[derive(Clone)]
pub struct LeaseHarness {
    inner: Arc<HarnessInner>,
}

impl fmt::Debug for LeaseHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("LeaseHarness")
            .field("registrations", &registry.by_id.keys().collect::<Vec<_>>())
            .field("partitions", &self.inner.partitions.len())
            .field("mode", &*self.inner.mode.lock())
            .finish()
    }
}

impl Default for LeaseHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseHarness {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_establish_delay(Duration::from_millis(10))
    }

    pub fn with_establish_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(HarnessInner {
                registry: Mutex::new(Registry::default()),
                partitions: DashMap::new(),
                queue: Dispatcher::spawn("lease-harness"),
                establish_delay: Mutex::new(delay),
                mode: Mutex::new(EstablishMode::Async),
                next_handle: AtomicU64::new(1),
                next_instance: AtomicI64::new(1),
                log: Mutex::new(CallLog::default()),
                fail_next_security: Mutex::new(None),
                fail_next_registration: Mutex::new(None),
                global_config: Mutex::new(None),
            }),
        }
    }

    pub fn set_establish_mode(&self, mode: EstablishMode) {
        *self.inner.mode.lock() = mode;
    }

    pub fn set_establish_delay(&self, delay: Duration) {
        *self.inner.establish_delay.lock() = delay;
    }

    /// Waits for callbacks already queued for delivery.
    pub async fn flush(&self) {
        self.inner.queue.flush().await;
    }

    pub fn partition(&self, a: &str, b: &str) {
        info!(a, b, "harness partition");
        self.inner.partitions.insert((a.to_string(), b.to_string()), ());
        self.inner.partitions.insert((b.to_string(), a.to_string()), ());
    }

    pub fn heal(&self, a: &str, b: &str) {
        info!(a, b, "harness heal");
        self.inner.partitions.remove(&(a.to_string(), b.to_string()));
        self.inner.partitions.remove(&(b.to_string(), a.to_string()));
    }

    fn is_partitioned(&self, a: &str, b: &str) -> bool {
        self.inner.partitions.contains_key(&(a.to_string(), b.to_string()))
    }

    /// Sets the TTL `expiration_time` reports for `id`.
    pub fn set_ttl(&self, id: &str, ttl: LeaseTtl) -> TransportResult<()> {
        let mut registry = self.inner.registry.lock();
        let app = *registry
            .by_id
            .get(id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(id.to_string()))?;
        registry.entry_mut(app)?.ttl = ttl;
        Ok(())
    }

    /// Expires `id`'s lease, tells it so, and tells every application
    /// holding a lease on it that it failed.
    pub fn fault_agent(&self, id: &str) -> TransportResult<()> {
        let mut registry = self.inner.registry.lock();
        let app = *registry
            .by_id
            .get(id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(id.to_string()))?;

        let entry = registry.entry_mut(app)?;
        entry.ttl = LeaseTtl::ZERO;
        let events = Arc::clone(&entry.events);
        self.inner.queue.post(move || events.on_lease_failed());

        for entry in registry.apps.values_mut() {
            if entry.leases.remove(id).is_some() {
                let events = Arc::clone(&entry.events);
                let remote = id.to_string();
                self.inner
                    .queue
                    .post(move || events.on_remote_leasing_application_failed(&remote));
            }
        }

        info!(id, "harness faulted lease agent");
        Ok(())
    }

    /// Drops `local_id`'s lease on `remote_id` and reports the remote failed.
    pub fn fail_remote(&self, local_id: &str, remote_id: &str) -> TransportResult<()> {
        let mut registry = self.inner.registry.lock();
        let app = *registry
            .by_id
            .get(local_id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(local_id.to_string()))?;
        let entry = registry.entry_mut(app)?;
        entry.leases.remove(remote_id);

        let events = Arc::clone(&entry.events);
        let remote = remote_id.to_string();
        self.inner
            .queue
            .post(move || events.on_remote_leasing_application_failed(&remote));
        Ok(())
    }

    /// Builds the arbitration callback `local_id` would receive about
    /// `remote_id`, using both sides' current TTLs.
    pub fn arbitration_request(&self, local_id: &str, remote_id: &str) -> TransportResult<ArbitrationRequest> {
        let registry = self.inner.registry.lock();
        let (app, local) = registry
            .by_id(local_id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(local_id.to_string()))?;
        let (_, remote) = registry
            .by_id(remote_id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(remote_id.to_string()))?;

        let lease_instance = local
            .leases
            .get(remote_id)
            .and_then(|record| i64::try_from(record.handle.raw()).ok())
            .unwrap_or(0);

        Ok(ArbitrationRequest {
            app,
            local_instance: local.instance,
            local_ttl: local.ttl,
            remote_address: remote.address.clone(),
            remote_instance: remote.instance,
            remote_ttl: remote.ttl,
            remote_version: 0x0200,
            monitor_lease_instance: lease_instance,
            subject_lease_instance: lease_instance,
            remote_arbitration_duration_upper_bound: i64::try_from(local.durations.lease_duration.as_millis())
                .unwrap_or(i64::MAX),
        })
    }

    /// Delivers `request` to `local_id`'s arbitration callback.
    pub fn deliver_arbitration(&self, local_id: &str, request: ArbitrationRequest) -> TransportResult<()> {
        let registry = self.inner.registry.lock();
        let (_, entry) = registry
            .by_id(local_id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(local_id.to_string()))?;
        let events = Arc::clone(&entry.events);
        self.inner.queue.post(move || events.on_arbitrate(request));
        Ok(())
    }

    pub fn trigger_arbitration(&self, local_id: &str, remote_id: &str) -> TransportResult<ArbitrationRequest> {
        let request = self.arbitration_request(local_id, remote_id)?;
        self.deliver_arbitration(local_id, request.clone())?;
        Ok(request)
    }

    /// Delivers an established callback for an arbitrary handle.
    pub fn inject_lease_established(&self, local_id: &str, remote_id: &str, handle: LeaseHandle) -> TransportResult<()> {
        let registry = self.inner.registry.lock();
        let (_, entry) = registry
            .by_id(local_id)
            .ok_or_else(|| TransportError::RemoteNotRegistered(local_id.to_string()))?;
        let events = Arc::clone(&entry.events);
        let remote = remote_id.to_string();
        self.inner.queue.post(move || events.on_lease_established(&remote, handle));
        Ok(())
    }

    /// Raises a driver health report to every registration.
    pub fn report_health(&self, report: HealthReport) {
        let registry = self.inner.registry.lock();
        for entry in registry.apps.values() {
            let events = Arc::clone(&entry.events);
            let report = report.clone();
            self.inner.queue.post(move || events.on_health_report(report));
        }
    }

    pub fn fail_next_security_update(&self, error: TransportError) {
        *self.inner.fail_next_security.lock() = Some(error);
    }

    pub fn fail_next_registration(&self, error: TransportError) {
        *self.inner.fail_next_registration.lock() = Some(error);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.registry.lock().by_id.contains_key(id)
    }

    pub fn registration(&self, id: &str) -> Option<Registration> {
        let registry = self.inner.registry.lock();
        registry.by_id(id).map(|(app, entry)| Registration {
            app,
            instance: entry.instance,
        })
    }

    pub fn security_of(&self, id: &str) -> Option<Credentials> {
        let registry = self.inner.registry.lock();
        registry.by_id(id).map(|(_, entry)| entry.security.clone())
    }

    pub fn durations_of(&self, id: &str) -> Option<LeaseDurations> {
        let registry = self.inner.registry.lock();
        registry.by_id(id).map(|(_, entry)| entry.durations)
    }

    pub fn heartbeat_of(&self, id: &str) -> Option<bool> {
        let registry = self.inner.registry.lock();
        registry.by_id(id).and_then(|(_, entry)| entry.heartbeat)
    }

    pub fn is_lease_established(&self, local_id: &str, remote_id: &str) -> bool {
        let registry = self.inner.registry.lock();
        registry
            .by_id(local_id)
            .and_then(|(_, entry)| entry.leases.get(remote_id))
            .map_or(false, |record| record.established)
    }

    pub fn establish_attempts(&self, local_id: &str) -> usize {
        self.inner
            .log
            .lock()
            .establish_attempts
            .get(local_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn arbitration_completions(&self) -> Vec<(AppHandle, ArbitrationCompletion)> {
        self.inner.log.lock().completions.clone()
    }

    pub fn unregistrations(&self) -> Vec<(AppHandle, bool)> {
        self.inner.log.lock().unregistrations.clone()
    }

    pub fn terminations(&self) -> Vec<(AppHandle, LeaseHandle, String)> {
        self.inner.log.lock().terminations.clone()
    }

    pub fn duration_updates(&self) -> usize {
        self.inner.log.lock().duration_updates
    }

    pub fn global_config(&self) -> Option<LeaseGlobalConfig> {
        *self.inner.global_config.lock()
    }

    pub fn global_config_updates(&self) -> usize {
        self.inner.log.lock().global_config_updates
    }

    /// Human readable snapshot of every registration and lease.
    pub fn dump(&self) -> String {
        let registry = self.inner.registry.lock();
        let mut out = String::new();

        let mut apps: Vec<_> = registry.apps.iter().collect();
        apps.sort_by_key(|(app, _)| **app);
        for (app, entry) in apps {
            let _ = writeln!(
                out,
                "{} {}@{} instance={} ttl={}",
                app, entry.id, entry.address, entry.instance, entry.ttl
            );
            let mut leases: Vec<_> = entry.leases.iter().collect();
            leases.sort_by(|a, b| a.0.cmp(b.0));
            for (remote, record) in leases {
                let _ = writeln!(
                    out,
                    "  -> {}@{} instance={} {} {:?} established={}",
                    remote,
                    record.remote_address,
                    record.remote_instance,
                    record.handle,
                    record.duration_type,
                    record.established
                );
            }
        }
        out
    }

    fn schedule_established(&self, app: AppHandle, remote_id: String, handle: LeaseHandle) {
        let delay = *self.inner.establish_delay.lock();
        let harness = self.clone();

        self.inner.queue.spawn_task(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let events = {
                let mut registry = harness.inner.registry.lock();
                let Ok(entry) = registry.entry_mut(app) else {
                    return;
                };
                match entry.leases.get_mut(&remote_id) {
                    Some(record) if record.handle == handle => {
                        record.established = true;
                        Arc::clone(&entry.events)
                    }
                    _ => {
                        trace!(%app, remote = %remote_id, %handle, "lease vanished before confirmation");
                        return;
                    }
                }
            };
            harness
                .inner
                .queue
                .post(move || events.on_lease_established(&remote_id, handle));
        });
    }
}

impl LeaseTransport for LeaseHarness {
    fn register(&self, request: RegisterRequest, events: Arc<dyn TransportEvents>) -> TransportResult<Registration> {
        if let Some(error) = self.inner.fail_next_registration.lock().take() {
            debug!(id = %request.leasing_application_id, %error, "injected registration failure");
            return Err(error);
        }

        let mut registry = self.inner.registry.lock();
        if registry.by_id.contains_key(&request.leasing_application_id) {
            return Err(TransportError::AlreadyRegistered(request.leasing_application_id));
        }

        let app = AppHandle::from_raw(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);

        registry.by_id.insert(request.leasing_application_id.clone(), app);
        registry.apps.insert(
            app,
            AppEntry {
                id: request.leasing_application_id,
                address: request.local_address,
                instance,
                events,
                durations: request.durations,
                security: request.security,
                ttl: LeaseTtl::NoLimit,
                heartbeat: None,
                leases: HashMap::new(),
            },
        );

        Ok(Registration { app, instance })
    }

    fn establish_lease(&self, app: AppHandle, request: &EstablishLeaseRequest) -> TransportResult<EstablishedLease> {
        let mode = *self.inner.mode.lock();
        let mut registry = self.inner.registry.lock();
        let local_id = registry.entry(app)?.id.clone();

        *self
            .inner
            .log
            .lock()
            .establish_attempts
            .entry(local_id.clone())
            .or_default() += 1;

        if self.is_partitioned(&local_id, &request.remote_id) {
            return Err(TransportError::RemoteUnreachable(request.remote_id.clone()));
        }
        if !registry.by_id.contains_key(&request.remote_id) {
            return Err(TransportError::RemoteNotRegistered(request.remote_id.clone()));
        }

        let entry = registry.entry_mut(app)?;
        if let Some(record) = entry.leases.get(&request.remote_id) {
            return Ok(EstablishedLease {
                handle: record.handle,
                already_established: record.established,
            });
        }

        let handle = LeaseHandle::from_raw(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let established = mode == EstablishMode::Synchronous;
        entry.leases.insert(
            request.remote_id.clone(),
            LeaseRecord {
                handle,
                remote_address: request.remote_address.clone(),
                remote_instance: request.remote_instance,
                duration_type: request.duration_type,
                established,
            },
        );
        drop(registry);

        if mode == EstablishMode::Async {
            self.schedule_established(app, request.remote_id.clone(), handle);
        }

        Ok(EstablishedLease {
            handle,
            already_established: established,
        })
    }

    fn terminate_lease(&self, app: AppHandle, lease: LeaseHandle, remote_id: &str) -> TransportResult<()> {
        self.inner
            .log
            .lock()
            .terminations
            .push((app, lease, remote_id.to_string()));

        let mut registry = self.inner.registry.lock();
        let entry = registry.entry_mut(app)?;
        match entry.leases.get(remote_id) {
            Some(record) if record.handle == lease => {
                entry.leases.remove(remote_id);
                Ok(())
            }
            _ => Err(TransportError::LeaseNotFound),
        }
    }

    fn unregister(&self, app: AppHandle, delayed: bool) -> TransportResult<()> {
        self.inner.log.lock().unregistrations.push((app, delayed));

        let mut registry = self.inner.registry.lock();
        let entry = registry.apps.remove(&app).ok_or(TransportError::InvalidHandle)?;
        registry.by_id.remove(&entry.id);
        let delay = match *self.inner.global_config.lock() {
            Some(config) if delayed => config.delay_lease_agent_close_interval,
            _ => Duration::ZERO,
        };
        debug!(%app, id = %entry.id, delayed, ?delay, "harness unregistered");
        Ok(())
    }

    fn expiration_time(&self, app: AppHandle) -> TransportResult<TtlReading> {
        let registry = self.inner.registry.lock();
        Ok(TtlReading {
            ttl: registry.entry(app)?.ttl,
            reference: Instant::now(),
        })
    }

    fn remote_expiration_time(&self, app: AppHandle, remote_id: &str) -> TransportResult<RemoteExpiration> {
        let registry = self.inner.registry.lock();
        let entry = registry.entry(app)?;
        Ok(match entry.leases.get(remote_id) {
            Some(record) if record.established => {
                let duration = entry.duration_for(record.duration_type);
                RemoteExpiration {
                    monitor: Some(duration),
                    subject: Some(duration),
                }
            }
            _ => RemoteExpiration::default(),
        })
    }

    fn complete_arbitration(&self, app: AppHandle, completion: ArbitrationCompletion) -> TransportResult<()> {
        debug!(%app, ?completion, "harness arbitration completed");
        self.inner.log.lock().completions.push((app, completion));
        self.inner.registry.lock().entry(app).map(|_| ())
    }

    fn update_durations(&self, app: AppHandle, durations: LeaseDurations) -> TransportResult<()> {
        self.inner.registry.lock().entry_mut(app)?.durations = durations;
        self.inner.log.lock().duration_updates += 1;
        Ok(())
    }

    fn update_security(&self, app: AppHandle, security: &Credentials) -> TransportResult<()> {
        if let Some(error) = self.inner.fail_next_security.lock().take() {
            return Err(error);
        }
        self.inner.registry.lock().entry_mut(app)?.security = security.clone();
        Ok(())
    }

    fn update_heartbeat_result(&self, app: AppHandle, healthy: bool) -> TransportResult<()> {
        self.inner.registry.lock().entry_mut(app)?.heartbeat = Some(healthy);
        Ok(())
    }

    fn update_global_config(&self, config: &LeaseGlobalConfig) -> TransportResult<()> {
        debug!(?config, "harness global config updated");
        *self.inner.global_config.lock() = Some(*config);
        self.inner.log.lock().global_config_updates += 1;
        Ok(())
    }
}
