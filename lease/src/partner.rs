use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroI64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::LeaseDurationType;
use crate::dispatch::Dispatcher;
use crate::transport::{AppHandle, EstablishLeaseRequest, EstablishedLease, LeaseHandle, LeaseTransport};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartnerState {
    None,
    Retrying,
    Establishing,
    Established,
    Failed,
}

impl fmt::Display for PartnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartnerState::None => "None",
            PartnerState::Retrying => "Retrying",
            PartnerState::Establishing => "Establishing",
            PartnerState::Established => "Established",
            PartnerState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

pub type Waiter = oneshot::Sender<Result<()>>;

/// Called when a retry timer fires: `(remote_id, duration_type, generation)`.
pub type RetryHook = Arc<dyn Fn(&str, LeaseDurationType, u64) + Send + Sync>;

/// What a partner borrows from its agent for the duration of one call.
pub struct PartnerContext<'a> {
    pub transport: &'a dyn LeaseTransport,
    pub app: AppHandle,
    pub dispatcher: &'a Dispatcher,
    pub retry_interval: Duration,
    pub retry_hook: &'a RetryHook,
    /// Agent-wide counter so a timer never matches a partner it was not
    /// armed for.
    pub generations: &'a AtomicU64,
}

/// Per-remote lease state machine. Only touched under the agent's lock;
/// waiter completions are posted to the dispatcher in transition order.
pub struct LeasePartner {
    local_id: String,
    remote_id: String,
    remote_fault_domain: String,
    remote_address: String,
    remote_instance: NonZeroI64,
    state: PartnerState,
    lease: Option<LeaseHandle>,
    duration_type: LeaseDurationType,
    waiters: VecDeque<Waiter>,
    retry_timer: Option<JoinHandle<()>>,
    retry_generation: u64,
}

impl fmt::Debug for LeasePartner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasePartner")
            .field("remote_id", &self.remote_id)
            .field("remote_address", &self.remote_address)
            .field("remote_instance", &self.remote_instance)
            .field("state", &self.state)
            .field("lease", &self.lease)
            .field("waiters", &self.waiters.len())
            .field("retry_pending", &self.retry_timer.is_some())
            .finish()
    }
}

impl LeasePartner {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_fault_domain: impl Into<String>,
        remote_address: impl Into<String>,
        remote_instance: i64,
    ) -> Result<Self> {
        let remote_id = remote_id.into();
        let remote_instance = NonZeroI64::new(remote_instance).ok_or_else(|| {
            Error::InvalidArgument(format!("remote instance for {} must be non-zero", remote_id))
        })?;

        Ok(Self {
            local_id: local_id.into(),
            remote_id,
            remote_fault_domain: remote_fault_domain.into(),
            remote_address: remote_address.into(),
            remote_instance,
            state: PartnerState::None,
            lease: None,
            duration_type: LeaseDurationType::Regular,
            waiters: VecDeque::new(),
            retry_timer: None,
            retry_generation: 0,
        })
    }

    pub fn state(&self) -> PartnerState {
        self.state
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn remote_fault_domain(&self) -> &str {
        &self.remote_fault_domain
    }

    pub fn remote_instance(&self) -> i64 {
        self.remote_instance.get()
    }

    pub fn lease_handle(&self) -> Option<LeaseHandle> {
        self.lease
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_timer.is_some()
    }

    /// Queues `waiter` for the lease to come up, starting an attempt if idle.
    pub fn establish(&mut self, ctx: &PartnerContext<'_>, duration_type: LeaseDurationType, waiter: Waiter) {
        if self.state == PartnerState::Established {
            ctx.dispatcher.post(move || {
                let _ = waiter.send(Ok(()));
            });
            return;
        }

        // Callers that already timed out have dropped their receivers.
        self.waiters.retain(|w| !w.is_closed());
        self.waiters.push_back(waiter);

        if self.state == PartnerState::None {
            self.try_establish(ctx, duration_type);
        }
    }

    fn try_establish(&mut self, ctx: &PartnerContext<'_>, duration_type: LeaseDurationType) {
        self.duration_type = duration_type;
        let request = EstablishLeaseRequest {
            remote_id: self.remote_id.clone(),
            remote_address: self.remote_address.clone(),
            remote_instance: self.remote_instance.get(),
            duration_type,
        };

        match ctx.transport.establish_lease(ctx.app, &request) {
            Ok(EstablishedLease {
                handle,
                already_established: true,
            }) => {
                self.lease = Some(handle);
                self.transition(PartnerState::Established);
                self.complete_waiters(ctx, || Ok(()));
            }
            Ok(EstablishedLease { handle, .. }) => {
                self.lease = Some(handle);
                self.transition(PartnerState::Establishing);
            }
            Err(e) => {
                if e.is_retryable() {
                    debug!(local = %self.local_id, remote = %self.remote_id, error = %e, "establish failed, will retry");
                } else {
                    warn!(local = %self.local_id, remote = %self.remote_id, error = %e, "establish failed, will retry");
                }
                self.lease = None;
                self.transition(PartnerState::Retrying);
                self.schedule_retry(ctx, duration_type);
            }
        }
    }

    fn schedule_retry(&mut self, ctx: &PartnerContext<'_>, duration_type: LeaseDurationType) {
        self.cancel_retry();

        let generation = ctx.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.retry_generation = generation;

        let hook = Arc::clone(ctx.retry_hook);
        let remote_id = self.remote_id.clone();
        let interval = ctx.retry_interval;
        self.retry_timer = Some(ctx.dispatcher.spawn_task(async move {
            tokio::time::sleep(interval).await;
            hook(&remote_id, duration_type, generation);
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Retry timer callback. Stale firings are ignored.
    pub fn retry(&mut self, ctx: &PartnerContext<'_>, duration_type: LeaseDurationType, generation: u64) {
        if self.state != PartnerState::Retrying || generation != self.retry_generation {
            trace!(
                remote = %self.remote_id,
                state = %self.state,
                generation,
                current = self.retry_generation,
                "ignoring stale retry"
            );
            return;
        }

        self.retry_timer = None;
        self.try_establish(ctx, duration_type);
    }

    /// Driver confirmation for the lease obtained by the last attempt.
    pub fn on_established(&mut self, ctx: &PartnerContext<'_>, handle: LeaseHandle) {
        if self.state != PartnerState::Establishing || self.lease != Some(handle) {
            debug!(
                remote = %self.remote_id,
                state = %self.state,
                %handle,
                current = ?self.lease,
                "ignoring lease established callback"
            );
            return;
        }

        self.transition(PartnerState::Established);
        self.complete_waiters(ctx, || Ok(()));
    }

    /// The driver is arbitrating with this remote. The lease can no longer be
    /// relied on, but its handle is kept so teardown still releases it.
    pub fn on_arbitration(&mut self) {
        self.cancel_retry();
        self.transition(PartnerState::Failed);
    }

    /// Both sides survived arbitration; re-establish if the remote is the
    /// same instance this partner was tracking.
    pub fn establish_after_arbitration(&mut self, ctx: &PartnerContext<'_>, remote_instance: i64) {
        if self.state != PartnerState::Failed {
            debug!(remote = %self.remote_id, state = %self.state, "not re-establishing, partner has not failed");
            return;
        }
        if remote_instance != self.remote_instance.get() {
            info!(
                remote = %self.remote_id,
                expected = self.remote_instance.get(),
                actual = remote_instance,
                "not re-establishing, remote instance changed"
            );
            return;
        }

        self.try_establish(ctx, self.duration_type);
    }

    /// Tears the lease down and cancels every waiter.
    pub fn terminate(&mut self, ctx: &PartnerContext<'_>) {
        self.teardown(ctx, "terminate");
    }

    pub fn abort(&mut self, ctx: &PartnerContext<'_>) {
        self.teardown(ctx, "abort");
    }

    fn teardown(&mut self, ctx: &PartnerContext<'_>, reason: &'static str) {
        self.cancel_retry();
        self.complete_waiters(ctx, || Err(Error::Canceled));

        if let Some(handle) = self.lease.take() {
            match ctx.transport.terminate_lease(ctx.app, handle, &self.remote_id) {
                Ok(()) => {}
                Err(e) if e.is_already_gone() => {
                    debug!(remote = %self.remote_id, %handle, error = %e, "lease already gone");
                }
                Err(e) => {
                    warn!(remote = %self.remote_id, %handle, error = %e, "failed to terminate lease");
                }
            }
        }

        debug!(remote = %self.remote_id, reason, "partner torn down");
        self.transition(PartnerState::None);
    }

    fn complete_waiters<F>(&mut self, ctx: &PartnerContext<'_>, outcome: F)
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        if self.waiters.is_empty() {
            return;
        }

        let waiters: Vec<Waiter> = self.waiters.drain(..).collect();
        ctx.dispatcher.post(move || {
            for waiter in waiters {
                let _ = waiter.send(outcome());
            }
        });
    }

    fn transition(&mut self, next: PartnerState) {
        if self.state != next {
            info!(
                local = %self.local_id,
                remote = %self.remote_id,
                from = %self.state,
                to = %next,
                lease = ?self.lease,
                "lease partner transition"
            );
            self.state = next;
        }
    }
}
