use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::application::{ArbitrationContext, ArbitrationType, LeasingApplication};
use crate::config::{
    ConfigKey, ConfigStore, ConfigSubscription, LeaseAgentConfiguration, LeaseConfig, LeaseDurationType,
    DURATION_KEYS,
};
use crate::dispatch::Dispatcher;
use crate::heartbeat::HeartbeatProbe;
use crate::monitor::LeaseMonitor;
use crate::partner::{LeasePartner, PartnerContext, PartnerState, RetryHook};
use crate::security::SecuritySettings;
use crate::time::{ticks, Advance, MonotonicClock, MonotonicExpiry};
use crate::transport::{
    AppHandle, ArbitrationCompletion, ArbitrationRequest, HealthReport, LeaseHandle, LeaseTransport, LeaseTtl,
    RegisterRequest, Registration, TransportError, TransportEvents,
};
use crate::{Error, NodeInstance, Result};

/// Identity of the remote a caller wants a lease with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRequest {
    pub remote_id: String,
    pub remote_fault_domain: String,
    pub remote_address: String,
    pub remote_instance: i64,
    pub duration_type: LeaseDurationType,
}

impl EstablishRequest {
    pub fn new(remote_id: impl Into<String>, remote_address: impl Into<String>, remote_instance: i64) -> Self {
        Self {
            remote_id: remote_id.into(),
            remote_fault_domain: String::new(),
            remote_address: remote_address.into(),
            remote_instance,
            duration_type: LeaseDurationType::Regular,
        }
    }

    pub fn with_fault_domain(mut self, fault_domain: impl Into<String>) -> Self {
        self.remote_fault_domain = fault_domain.into();
        self
    }

    pub fn with_duration_type(mut self, duration_type: LeaseDurationType) -> Self {
        self.duration_type = duration_type;
        self
    }
}

/// An establish in flight. The caller timeout runs from `begin_establish`,
/// not from `wait`.
#[derive(Debug)]
pub struct PendingEstablish {
    rx: oneshot::Receiver<Result<()>>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl PendingEstablish {
    fn new(rx: oneshot::Receiver<Result<()>>, timeout: Duration) -> Self {
        Self {
            rx,
            deadline: Instant::now().checked_add(timeout),
            timeout,
        }
    }

    pub async fn wait(self) -> Result<()> {
        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Error::Timeout(self.timeout)),
            },
            None => self.rx.await,
        };
        outcome.unwrap_or_else(|_| Err(Error::Canceled))
    }
}

/// Expiry instants of both directions of a lease with one remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteLeaseExpiration {
    /// Upper bound on how long the local side monitors the remote.
    pub monitor: Option<Instant>,
    /// Lower bound on how long the remote considers the local side alive.
    pub subject: Option<Instant>,
}

struct AgentState {
    config: LeaseAgentConfiguration,
    registration: Option<Registration>,
    /// Bumped on every registration so callbacks from an old one are dropped.
    epoch: u64,
    partners: HashMap<String, LeasePartner>,
    security: SecuritySettings,
    subscriptions: Vec<ConfigSubscription>,
    heartbeat: Option<HeartbeatProbe>,
}

struct AgentShared {
    store: Arc<ConfigStore>,
    transport: Arc<dyn LeaseTransport>,
    application: Arc<dyn LeasingApplication>,
    dispatcher: Dispatcher,
    clock: MonotonicClock,
    expiry: MonotonicExpiry,
    generations: AtomicU64,
    retry_hook: RetryHook,
    state: RwLock<AgentState>,
}

/// One local leasing application and its partners.
///
/// Driver callbacks are re-posted to the agent's dispatcher before they touch
/// any state or reach the application.
#[derive(Clone)]
pub struct LeaseAgent {
    shared: Arc<AgentShared>,
}

impl fmt::Debug for LeaseAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("LeaseAgent")
            .field("id", &state.config.leasing_application_id)
            .field("address", &state.config.local_address)
            .field("registration", &state.registration)
            .field("partners", &state.partners.len())
            .finish()
    }
}

impl LeaseAgent {
    /// Creates a closed agent. Must be called from within a tokio runtime; the
    /// agent's timers and tasks stay on that runtime, so every other method
    /// may be called from any thread.
    pub fn new(
        config: LeaseAgentConfiguration,
        store: Arc<ConfigStore>,
        transport: Arc<dyn LeaseTransport>,
        application: Arc<dyn LeasingApplication>,
        security: SecuritySettings,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<AgentShared>| {
            let agent = weak.clone();
            let retry_hook: RetryHook = Arc::new(move |remote_id: &str, duration_type, generation| {
                if let Some(shared) = agent.upgrade() {
                    shared.retry_establish(remote_id, duration_type, generation);
                }
            });

            AgentShared {
                store,
                transport,
                application,
                dispatcher: Dispatcher::spawn("lease-agent"),
                clock: MonotonicClock::new(),
                expiry: MonotonicExpiry::new(0),
                generations: AtomicU64::new(0),
                retry_hook,
                state: RwLock::new(AgentState {
                    config,
                    registration: None,
                    epoch: 0,
                    partners: HashMap::new(),
                    security,
                    subscriptions: Vec::new(),
                    heartbeat: None,
                }),
            }
        });

        Self { shared }
    }

    /// Registers with the lease driver and starts config tracking and the
    /// heartbeat. Opening an open agent is a no-op.
    pub fn open(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.write();
        if state.registration.is_some() {
            return Ok(());
        }

        state.security.validate().map_err(|e| {
            error!(id = %state.config.leasing_application_id, error = %e, "invalid initial security settings");
            e
        })?;

        let config = shared.store.snapshot();
        shared.update_global_config(&config);
        state.epoch += 1;
        let events = Arc::new(AgentEvents {
            agent: Arc::downgrade(shared),
            dispatcher: shared.dispatcher.clone(),
            epoch: state.epoch,
        });
        let request = RegisterRequest {
            leasing_application_id: state.config.leasing_application_id.clone(),
            local_address: state.config.local_address.clone(),
            durations: config.durations(),
            lease_suspend_timeout: state.config.suspend_timeout,
            arbitration_timeout: state.config.arbitration_timeout,
            lease_retry_count: state.config.retry_count,
            lease_renew_begin_ratio: state.config.renew_begin_ratio,
            app_lease_expiry_timeout: state.config.app_lease_expiry_timeout,
            security: state.security.material(),
        };

        let registration = match shared.transport.register(request, events) {
            Ok(registration) => registration,
            Err(e) => return Err(shared.registration_failed(&state.config, &e)),
        };

        state.registration = Some(registration);
        state.subscriptions = shared.subscribe();
        state.heartbeat = HeartbeatProbe::start(
            shared.dispatcher.runtime(),
            Arc::clone(&shared.transport),
            registration.app,
            config.heartbeat.clone(),
        );

        info!(
            id = %state.config.leasing_application_id,
            address = %state.config.local_address,
            app = %registration.app,
            instance = registration.instance,
            lease_duration = ?config.lease_duration,
            suspend_timeout = ?state.config.suspend_timeout,
            arbitration_timeout = ?state.config.arbitration_timeout,
            "lease agent opened"
        );
        Ok(())
    }

    /// Tears down every partner and unregisters with a delayed departure.
    pub fn close(&self) {
        self.shared.cleanup(true);
    }

    /// Like `close`, but unregisters immediately.
    pub fn abort(&self) {
        self.shared.cleanup(false);
    }

    /// Re-registers under `new_id`, dropping every partner of the old
    /// identity.
    pub fn restart(&self, new_id: impl Into<String>) -> Result<()> {
        let new_id = new_id.into();
        let (old, old_id, heartbeat) = {
            let mut state = self.shared.state.write();
            let old_id = std::mem::replace(&mut state.config.leasing_application_id, new_id.clone());
            let old = self.shared.internal_close(&mut state);
            (old, old_id, state.heartbeat.take())
        };
        drop(heartbeat);

        if let Some(registration) = old {
            self.shared.unregister(registration.app, &old_id, false);
        }

        info!(old = %old_id, new = %new_id, "restarting lease agent");
        self.open()
    }

    /// Starts establishing a lease with `request.remote_id`. The returned
    /// handle resolves when the lease is up, the partner is torn down, or
    /// `timeout` elapses, whichever comes first.
    pub fn begin_establish(&self, request: EstablishRequest, timeout: Duration) -> PendingEstablish {
        let (tx, rx) = oneshot::channel();
        let pending = PendingEstablish::new(rx, timeout);
        let shared = &self.shared;

        let mut guard = shared.state.write();
        let state = &mut *guard;
        let Some(registration) = state.registration else {
            debug!(remote = %request.remote_id, "establish on closed lease agent");
            shared.dispatcher.post(move || {
                let _ = tx.send(Err(Error::OperationFailed));
            });
            return pending;
        };

        let partner = match state.partners.entry(request.remote_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                match LeasePartner::new(
                    state.config.leasing_application_id.clone(),
                    request.remote_id.clone(),
                    request.remote_fault_domain.clone(),
                    request.remote_address.clone(),
                    request.remote_instance,
                ) {
                    Ok(partner) => entry.insert(partner),
                    Err(e) => {
                        warn!(remote = %request.remote_id, error = %e, "rejecting establish");
                        shared.dispatcher.post(move || {
                            let _ = tx.send(Err(e));
                        });
                        return pending;
                    }
                }
            }
        };

        let retry_interval = shared.store.snapshot().lease_retry_interval;
        partner.establish(&shared.partner_ctx(registration.app, retry_interval), request.duration_type, tx);
        pending
    }

    pub async fn establish(&self, request: EstablishRequest, timeout: Duration) -> Result<()> {
        self.begin_establish(request, timeout).wait().await
    }

    /// Establishes without anyone waiting on the outcome.
    pub fn establish_in_background(&self, request: EstablishRequest) {
        drop(self.begin_establish(request, Duration::MAX));
    }

    pub fn terminate(&self, remote_id: &str) {
        let shared = &self.shared;
        let mut state = shared.state.write();
        let Some(registration) = state.registration else {
            return;
        };

        if let Some(mut partner) = state.partners.remove(remote_id) {
            let retry_interval = shared.store.snapshot().lease_retry_interval;
            partner.terminate(&shared.partner_ctx(registration.app, retry_interval));
            info!(remote = remote_id, "lease partner terminated");
        }
    }

    /// True once the local lease has run out. Only consults the driver when
    /// the cached expiry has passed.
    pub fn is_lease_expired(&self) -> bool {
        let shared = &self.shared;
        let now = shared.clock.now();
        if now < shared.expiry.load() {
            return false;
        }

        // Readers suffice; the expiry itself is updated lock-free.
        let state = shared.state.read();
        let Some(registration) = state.registration else {
            return false;
        };

        let reading = match shared.transport.expiration_time(registration.app) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(id = %state.config.leasing_application_id, error = %e, "lease expiration query failed");
                return true;
            }
        };
        trace!(id = %state.config.leasing_application_id, ttl = %reading.ttl, "lease ttl");

        if reading.ttl == LeaseTtl::ZERO {
            return true;
        }

        let ttl = reading.ttl.or_duration(shared.store.snapshot().lease_duration);
        match shared.expiry.advance(now.saturating_add(ticks(ttl))) {
            Advance::Updated(expiry) | Advance::Stale(expiry) => now >= expiry,
            Advance::Closed => true,
        }
    }

    /// Handles an arbitration callback from the driver.
    pub fn arbitrate(&self, request: ArbitrationRequest) {
        self.shared.arbitrate(request);
    }

    /// Reports an arbitration verdict to the driver.
    pub fn complete_arbitration(
        &self,
        local_instance: i64,
        remote_address: &str,
        remote_instance: i64,
        local_ttl: LeaseTtl,
        remote_ttl: LeaseTtl,
    ) {
        self.shared
            .complete_arbitration(local_instance, remote_address, remote_instance, local_ttl, remote_ttl);
    }

    /// Swaps in new security settings. Downgrades are rejected and a failed
    /// push to the driver restores the previous settings.
    pub fn set_security(&self, settings: SecuritySettings) -> Result<()> {
        let shared = &self.shared;
        settings.validate().map_err(|e| {
            error!(error = %e, "invalid security settings");
            e
        })?;

        let mut state = shared.state.write();
        if let Err(e) = state.security.can_upgrade_to(&settings) {
            error!(error = %e, "security upgrade rejected");
            return Err(e);
        }

        let previous = std::mem::replace(&mut state.security, settings);
        if let Some(registration) = state.registration {
            if let Err(e) = shared.transport.update_security(registration.app, &state.security.material()) {
                error!(app = %registration.app, error = %e, "failed to push security settings, rolling back");
                state.security = previous;
                return Err(e.into());
            }
        }

        info!(
            provider = ?state.security.provider,
            protection = ?state.security.protection,
            "security settings updated"
        );
        Ok(())
    }

    pub fn security(&self) -> SecuritySettings {
        self.shared.state.read().security.clone()
    }

    /// Expiry of the lease with `remote_id` in both directions. The monitor
    /// side is widened and the subject side narrowed by the timer margin.
    pub fn remote_lease_expiration(&self, remote_id: &str) -> Result<RemoteLeaseExpiration> {
        let shared = &self.shared;
        let state = shared.state.read();
        let registration = state.registration.ok_or(Error::OperationFailed)?;
        let margin = shared.store.snapshot().timer_margin;

        let before = Instant::now();
        let remote = shared.transport.remote_expiration_time(registration.app, remote_id)?;
        let after = Instant::now();

        Ok(RemoteLeaseExpiration {
            monitor: remote
                .monitor
                .and_then(|ttl| after.checked_add(ttl.saturating_add(margin))),
            subject: remote
                .subject
                .and_then(|ttl| before.checked_add(ttl))
                .map(|at| at.checked_sub(margin).unwrap_or(before)),
        })
    }

    /// Raw TTL for callers in other processes.
    pub fn lease_ttl_for_ipc(&self) -> Result<LeaseTtl> {
        let state = self.shared.state.read();
        let registration = state.registration.ok_or(Error::OperationFailed)?;
        Ok(self.shared.transport.expiration_time(registration.app)?.ttl)
    }

    /// A monitor that queries this agent's registration directly.
    pub fn direct_monitor(&self) -> Result<LeaseMonitor> {
        let state = self.shared.state.read();
        let registration = state.registration.ok_or(Error::OperationFailed)?;
        Ok(LeaseMonitor::direct(
            Arc::clone(&self.shared.transport),
            registration.app,
            Arc::clone(&self.shared.store),
        ))
    }

    pub fn partner_state(&self, remote_id: &str) -> Option<PartnerState> {
        self.shared.state.read().partners.get(remote_id).map(LeasePartner::state)
    }

    pub fn partner_count(&self) -> usize {
        self.shared.state.read().partners.len()
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.read().registration.is_some()
    }

    pub fn instance_id(&self) -> Option<i64> {
        self.shared.state.read().registration.map(|r| r.instance)
    }

    pub fn app_handle(&self) -> Option<AppHandle> {
        self.shared.state.read().registration.map(|r| r.app)
    }

    /// Address and instance as remotes see this agent.
    pub fn local_instance(&self) -> Option<NodeInstance> {
        let state = self.shared.state.read();
        state.registration.map(|r| NodeInstance {
            address: state.config.local_address.clone(),
            instance: r.instance,
        })
    }

    pub fn configuration(&self) -> LeaseAgentConfiguration {
        self.shared.state.read().config.clone()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.shared
            .state
            .read()
            .heartbeat
            .as_ref()
            .map_or(false, HeartbeatProbe::is_running)
    }
}

impl AgentShared {
    fn partner_ctx(&self, app: AppHandle, retry_interval: Duration) -> PartnerContext<'_> {
        PartnerContext {
            transport: &*self.transport,
            app,
            dispatcher: &self.dispatcher,
            retry_interval,
            retry_hook: &self.retry_hook,
            generations: &self.generations,
        }
    }

    fn registration_failed(&self, config: &LeaseAgentConfiguration, error: &TransportError) -> Error {
        let id = &config.leasing_application_id;
        match error {
            TransportError::AccessDenied => error!(
                id = %id,
                "lease driver registration denied; check the driver is running and the caller is authorized"
            ),
            TransportError::NotFound => {
                error!(id = %id, "lease driver not found; check the driver is installed")
            }
            TransportError::InvalidParameter(detail) => error!(
                id = %id,
                detail = %detail,
                "lease driver rejected registration parameters; check configuration for invalid inputs"
            ),
            TransportError::VersionMismatch => {
                error!(id = %id, "lease driver version mismatch; check the driver is up to date")
            }
            _ => {}
        }

        debug_assert!(
            !matches!(error, TransportError::InvalidHandle | TransportError::InvalidParameter(_)),
            "{} got invalid return code {} for registration",
            id,
            error
        );

        warn!(id = %id, error = %error, "lease agent open failed");
        if matches!(error, TransportError::Retry) {
            Error::Retry
        } else {
            Error::RegisterWithLeaseDriverFailed
        }
    }

    fn subscribe(self: &Arc<Self>) -> Vec<ConfigSubscription> {
        let durations = {
            let agent = Arc::downgrade(self);
            self.store.subscribe(DURATION_KEYS, move |config| {
                if let Some(shared) = agent.upgrade() {
                    shared.update_lease_durations(config);
                }
            })
        };
        let timeouts = {
            let agent = Arc::downgrade(self);
            let keys = [ConfigKey::AgentTimeouts, ConfigKey::MaxConsecutiveIndirectLeaseDuration];
            self.store.subscribe(&keys, move |config| {
                if let Some(shared) = agent.upgrade() {
                    shared.state.write().config.refresh(config);
                }
            })
        };
        let heartbeat = {
            let agent = Arc::downgrade(self);
            self.store.subscribe(&[ConfigKey::Heartbeat], move |config| {
                if let Some(shared) = agent.upgrade() {
                    shared.restart_heartbeat(config);
                }
            })
        };
        let global = {
            let agent = Arc::downgrade(self);
            self.store.subscribe(&[ConfigKey::GlobalConfig], move |config| {
                if let Some(shared) = agent.upgrade() {
                    shared.update_global_config(config);
                }
            })
        };
        vec![durations, timeouts, heartbeat, global]
    }

    fn update_global_config(&self, config: &LeaseConfig) {
        let global = config.global_config();
        match self.transport.update_global_config(&global) {
            Ok(()) => info!(
                maintenance_interval = ?global.maintenance_interval,
                process_assert_exit_timeout = ?global.process_assert_exit_timeout,
                delay_close = ?global.delay_lease_agent_close_interval,
                "lease global config updated"
            ),
            Err(e) => warn!(error = %e, "failed to update lease global config"),
        }
    }

    fn update_lease_durations(&self, config: &LeaseConfig) {
        let state = self.state.read();
        if let Some(registration) = state.registration {
            match self.transport.update_durations(registration.app, config.durations()) {
                Ok(()) => info!(
                    id = %state.config.leasing_application_id,
                    lease_duration = ?config.lease_duration,
                    across_fault_domain = ?config.lease_duration_across_fault_domain,
                    "lease durations updated"
                ),
                Err(e) => warn!(id = %state.config.leasing_application_id, error = %e, "failed to update lease durations"),
            }
        }
    }

    fn restart_heartbeat(&self, config: &LeaseConfig) {
        let mut state = self.state.write();
        if let Some(registration) = state.registration {
            state.heartbeat = None;
            state.heartbeat = HeartbeatProbe::start(
                self.dispatcher.runtime(),
                Arc::clone(&self.transport),
                registration.app,
                config.heartbeat.clone(),
            );
        }
    }

    /// Drops the registration and every partner. Returns the registration so
    /// the caller can unregister it outside the lock.
    fn internal_close(&self, state: &mut AgentState) -> Option<Registration> {
        let registration = state.registration.take();

        if let Some(registration) = registration {
            info!(
                id = %state.config.leasing_application_id,
                app = %registration.app,
                partners = state.partners.len(),
                "closing leases"
            );
            let ctx = self.partner_ctx(registration.app, self.store.snapshot().lease_retry_interval);
            for (_, mut partner) in state.partners.drain() {
                partner.abort(&ctx);
            }
        }

        state.subscriptions.clear();
        registration
    }

    fn cleanup(&self, delayed: bool) {
        let (old, id, heartbeat) = {
            let mut state = self.state.write();
            let old = self.internal_close(&mut state);
            (old, state.config.leasing_application_id.clone(), state.heartbeat.take())
        };
        drop(heartbeat);

        if let Some(registration) = old {
            self.unregister(registration.app, &id, delayed);
        }
    }

    fn unregister(&self, app: AppHandle, id: &str, delayed: bool) {
        if let Err(e) = self.transport.unregister(app, delayed) {
            warn!(id, %app, error = %e, "failed to unregister");
        }
        info!(id, %app, delayed, "lease agent unregistered");
    }

    fn retry_establish(&self, remote_id: &str, duration_type: LeaseDurationType, generation: u64) {
        let mut state = self.state.write();
        let Some(registration) = state.registration else {
            return;
        };
        if let Some(partner) = state.partners.get_mut(remote_id) {
            let retry_interval = self.store.snapshot().lease_retry_interval;
            partner.retry(&self.partner_ctx(registration.app, retry_interval), duration_type, generation);
        }
    }

    fn is_current(state: &AgentState, epoch: u64) -> bool {
        state.registration.is_some() && state.epoch == epoch
    }

    fn on_lease_established(&self, epoch: u64, remote_id: &str, lease: LeaseHandle) {
        let mut state = self.state.write();
        if !Self::is_current(&state, epoch) {
            trace!(remote = remote_id, %lease, "dropping established callback for old registration");
            return;
        }
        let Some(registration) = state.registration else {
            return;
        };
        if let Some(partner) = state.partners.get_mut(remote_id) {
            let retry_interval = self.store.snapshot().lease_retry_interval;
            partner.on_established(&self.partner_ctx(registration.app, retry_interval), lease);
        }
    }

    fn on_lease_failed(&self, epoch: u64) {
        {
            let state = self.state.read();
            if !Self::is_current(&state, epoch) {
                debug!("dropping lease failure for old registration");
                return;
            }
            error!(id = %state.config.leasing_application_id, "local lease failed");
        }
        self.application.on_lease_failed();
    }

    fn on_remote_leasing_application_failed(&self, epoch: u64, remote_id: &str) {
        {
            let mut state = self.state.write();
            if !Self::is_current(&state, epoch) {
                return;
            }
            info!(id = %state.config.leasing_application_id, remote = remote_id, "remote leasing application failed");

            if let (Some(registration), Some(mut partner)) = (state.registration, state.partners.remove(remote_id)) {
                let retry_interval = self.store.snapshot().lease_retry_interval;
                partner.abort(&self.partner_ctx(registration.app, retry_interval));
            }
        }
        self.application.on_remote_leasing_application_failed(remote_id);
    }

    fn on_health_report(&self, report: &HealthReport) {
        info!(
            id = %self.state.read().config.leasing_application_id,
            code = report.code,
            property = %report.property,
            description = %report.description,
            "lease driver health report"
        );
        self.application.on_health_report(report);
    }

    fn concede(&self, request: &ArbitrationRequest) {
        let completion = ArbitrationCompletion {
            local_instance: request.local_instance,
            remote_address: request.remote_address.clone(),
            remote_instance: request.remote_instance,
            local_ttl: LeaseTtl::ZERO,
            remote_ttl: LeaseTtl::NoLimit,
        };
        if let Err(e) = self.transport.complete_arbitration(request.app, completion) {
            warn!(app = %request.app, error = %e, "failed to report conceded arbitration");
        }
    }

    fn arbitrate(self: &Arc<Self>, request: ArbitrationRequest) {
        let config = self.store.snapshot();

        let context = {
            let mut state = self.state.write();
            if !state.config.arbitration_enabled {
                error!(id = %state.config.leasing_application_id, "arbitration requested but not enabled, conceding");
                drop(state);
                self.concede(&request);
                return;
            }
            if state.registration.map(|r| r.app) != Some(request.app) {
                error!(
                    id = %state.config.leasing_application_id,
                    app = %request.app,
                    "arbitration for a registration that was already cleaned up, conceding"
                );
                drop(state);
                self.concede(&request);
                return;
            }

            if let Some(partner) = state
                .partners
                .values_mut()
                .find(|p| p.remote_address() == request.remote_address)
            {
                partner.on_arbitration();
            }

            ArbitrationContext {
                local_id: state.config.leasing_application_id.clone(),
                local_instance: request.local_instance,
                local_ttl: request.local_ttl,
                remote_address: request.remote_address.clone(),
                remote_instance: request.remote_instance,
                remote_ttl: request.remote_ttl.widened(config.lease_clock_uncertainty_interval),
                remote_version: request.remote_version,
                monitor_lease_instance: request.monitor_lease_instance,
                subject_lease_instance: request.subject_lease_instance,
                arbitration_duration_upper_bound: request.remote_arbitration_duration_upper_bound,
                arbitration_type: ArbitrationType::classify(
                    request.remote_instance,
                    request.monitor_lease_instance,
                    request.remote_version,
                ),
            }
        };

        info!(
            remote = %context.remote_address,
            remote_instance = context.remote_instance,
            local_ttl = %context.local_ttl,
            remote_ttl = %context.remote_ttl,
            kind = ?context.arbitration_type,
            "arbitrating"
        );

        let shared = Arc::clone(self);
        self.dispatcher.spawn_task(async move {
            let verdict = shared.application.arbitrate(context).await;
            shared.complete_arbitration(
                request.local_instance,
                &request.remote_address,
                request.remote_instance,
                verdict.local_ttl,
                verdict.remote_ttl,
            );
        });
    }

    fn complete_arbitration(
        &self,
        local_instance: i64,
        remote_address: &str,
        remote_instance: i64,
        local_ttl: LeaseTtl,
        remote_ttl: LeaseTtl,
    ) {
        let mut state = self.state.write();
        let Some(registration) = state.registration else {
            return;
        };

        let completion = ArbitrationCompletion {
            local_instance,
            remote_address: remote_address.to_string(),
            remote_instance,
            local_ttl,
            remote_ttl,
        };
        if let Err(e) = self.transport.complete_arbitration(registration.app, completion) {
            debug_assert!(
                matches!(e, TransportError::InvalidHandle | TransportError::InvalidParameter(_)),
                "unexpected error completing arbitration: {}",
                e
            );
            warn!(
                remote = remote_address,
                remote_instance,
                %local_ttl,
                %remote_ttl,
                error = %e,
                "failed to complete arbitration"
            );
        }

        if local_ttl.is_no_limit() && remote_ttl.is_no_limit() {
            let retry_interval = self.store.snapshot().lease_retry_interval;
            let ctx = self.partner_ctx(registration.app, retry_interval);
            if let Some(partner) = state
                .partners
                .values_mut()
                .find(|p| p.remote_address() == remote_address)
            {
                partner.establish_after_arbitration(&ctx, remote_instance);
            }
        }
    }
}

/// Driver callback sink for one registration.
struct AgentEvents {
    agent: Weak<AgentShared>,
    dispatcher: Dispatcher,
    epoch: u64,
}

impl AgentEvents {
    fn post<F>(&self, job: F)
    where
        F: FnOnce(Arc<AgentShared>) + Send + 'static,
    {
        let agent = self.agent.clone();
        self.dispatcher.post(move || {
            if let Some(shared) = agent.upgrade() {
                job(shared);
            }
        });
    }
}

impl TransportEvents for AgentEvents {
    fn on_lease_established(&self, remote_id: &str, lease: LeaseHandle) {
        let epoch = self.epoch;
        let remote_id = remote_id.to_string();
        self.post(move |shared| shared.on_lease_established(epoch, &remote_id, lease));
    }

    fn on_lease_failed(&self) {
        let epoch = self.epoch;
        self.post(move |shared| shared.on_lease_failed(epoch));
    }

    fn on_remote_leasing_application_failed(&self, remote_id: &str) {
        let epoch = self.epoch;
        let remote_id = remote_id.to_string();
        self.post(move |shared| shared.on_remote_leasing_application_failed(epoch, &remote_id));
    }

    fn on_arbitrate(&self, request: ArbitrationRequest) {
        self.post(move |shared| shared.arbitrate(request));
    }

    fn on_health_report(&self, report: HealthReport) {
        self.post(move |shared| shared.on_health_report(&report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ArbitrationVerdict;
    use crate::config::LeaseConfig;
    use crate::transport::harness::{EstablishMode, LeaseHarness};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingApp {
        lease_failed: Mutex<usize>,
        remote_failed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LeasingApplication for RecordingApp {
        fn on_lease_failed(&self) {
            *self.lease_failed.lock() += 1;
        }

        fn on_remote_leasing_application_failed(&self, remote_id: &str) {
            self.remote_failed.lock().push(remote_id.to_string());
        }

        async fn arbitrate(&self, _context: ArbitrationContext) -> ArbitrationVerdict {
            ArbitrationVerdict::concede()
        }
    }

    fn agent(harness: &LeaseHarness, id: &str, app: Arc<RecordingApp>) -> LeaseAgent {
        let store = ConfigStore::new(LeaseConfig::default()).unwrap();
        let config = LeaseAgentConfiguration::new(id, format!("{}:9000", id), true, &store.snapshot());
        LeaseAgent::new(
            config,
            store,
            Arc::new(harness.clone()),
            app,
            SecuritySettings::unsecured(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_and_close_are_idempotent() {
        let harness = LeaseHarness::new();
        let a = agent(&harness, "a", Arc::default());

        a.open().unwrap();
        a.open().unwrap();
        assert!(harness.is_registered("a"));

        a.close();
        a.close();
        a.abort();

        assert!(!a.is_open());
        assert_eq!(harness.unregistrations().len(), 1);
        assert!(harness.unregistrations()[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_agent_fails_establish() {
        let harness = LeaseHarness::new();
        let a = agent(&harness, "a", Arc::default());

        let result = a.establish(EstablishRequest::new("b", "b:9000", 1), Duration::from_secs(5)).await;

        assert!(matches!(result, Err(Error::OperationFailed)));
        assert_eq!(a.partner_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_error_is_distinguished() {
        let harness = LeaseHarness::new();
        let a = agent(&harness, "a", Arc::default());

        harness.fail_next_registration(TransportError::Retry);
        assert!(a.open().unwrap_err().is_retry());

        harness.fail_next_registration(TransportError::AccessDenied);
        assert!(matches!(a.open(), Err(Error::RegisterWithLeaseDriverFailed)));

        a.open().unwrap();
        assert!(a.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_drops_partner_and_notifies() {
        let harness = LeaseHarness::new();
        harness.set_establish_mode(EstablishMode::Synchronous);
        let app = Arc::new(RecordingApp::default());
        let a = agent(&harness, "a", app.clone());
        let b = agent(&harness, "b", Arc::default());
        a.open().unwrap();
        b.open().unwrap();

        a.establish(EstablishRequest::new("b", "b:9000", b.instance_id().unwrap()), Duration::from_secs(5))
            .await
            .unwrap();

        harness.fail_remote("a", "b").unwrap();
        harness.flush().await;
        a.shared.dispatcher.flush().await;

        assert_eq!(a.partner_state("b"), None);
        assert_eq!(*app.remote_failed.lock(), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_changes_identity() {
        let harness = LeaseHarness::new();
        let a = agent(&harness, "a", Arc::default());
        a.open().unwrap();
        let first = a.instance_id().unwrap();

        a.restart("a2").unwrap();

        assert!(!harness.is_registered("a"));
        assert!(harness.is_registered("a2"));
        assert_ne!(a.instance_id().unwrap(), first);
        assert_eq!(a.configuration().leasing_application_id, "a2");
        assert_eq!(harness.unregistrations(), vec![(AppHandle::from_raw(1), false)]);
    }
}
