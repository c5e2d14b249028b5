use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigStore, LeaseConfig};
use crate::ipc::LeaseQueryClient;
use crate::time::{ticks, Advance, MonotonicClock, MonotonicExpiry};
use crate::transport::{AppHandle, LeaseTransport, LeaseTtl};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Direct,
    Indirect,
}

enum Source {
    Direct {
        transport: Arc<dyn LeaseTransport>,
        app: AppHandle,
    },
    Indirect {
        client: Arc<dyn LeaseQueryClient>,
    },
}

struct MonitorInner {
    source: Source,
    store: Arc<ConfigStore>,
    clock: MonotonicClock,
    expiration: MonotonicExpiry,
}

/// Liveness view of a lease agent, either next to it (`Direct`) or from
/// another process over IPC (`Indirect`). Indirect checks never block.
pub struct LeaseMonitor {
    inner: Arc<MonitorInner>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LeaseMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseMonitor")
            .field("mode", &self.mode())
            .field("expiration", &self.inner.expiration.load())
            .finish()
    }
}

impl LeaseMonitor {
    pub fn direct(transport: Arc<dyn LeaseTransport>, app: AppHandle, store: Arc<ConfigStore>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                source: Source::Direct { transport, app },
                store,
                clock: MonotonicClock::new(),
                expiration: MonotonicExpiry::new(0),
            }),
            poll: Mutex::new(None),
        }
    }

    /// Starts polling through `client` right away. Must be called from within
    /// a tokio runtime.
    pub fn indirect(client: Arc<dyn LeaseQueryClient>, store: Arc<ConfigStore>) -> Self {
        let inner = Arc::new(MonitorInner {
            source: Source::Indirect { client },
            store,
            clock: MonotonicClock::new(),
            expiration: MonotonicExpiry::new(0),
        });

        let task = tokio::spawn(poll_loop(Arc::clone(&inner)));
        info!("indirect lease monitor started");

        Self {
            inner,
            poll: Mutex::new(Some(task)),
        }
    }

    pub fn mode(&self) -> MonitorMode {
        match self.inner.source {
            Source::Direct { .. } => MonitorMode::Direct,
            Source::Indirect { .. } => MonitorMode::Indirect,
        }
    }

    pub fn is_lease_expired(&self) -> bool {
        let inner = &self.inner;
        let now = inner.clock.now();
        let current = inner.expiration.load();
        if current < 0 {
            return true;
        }
        if now < current {
            return false;
        }

        match &inner.source {
            Source::Indirect { .. } => true,
            Source::Direct { transport, app } => {
                let reading = match transport.expiration_time(*app) {
                    Ok(reading) => reading,
                    Err(e) => {
                        warn!(%app, error = %e, "lease expiration query failed, treating as expired");
                        return true;
                    }
                };
                if reading.ttl == LeaseTtl::ZERO {
                    return true;
                }

                let ttl = reading.ttl.or_duration(inner.store.snapshot().lease_duration);
                let candidate = inner.clock.at(reading.reference).saturating_add(ticks(ttl));
                match inner.expiration.advance(candidate) {
                    Advance::Updated(expiry) | Advance::Stale(expiry) => now >= expiry,
                    Advance::Closed => true,
                }
            }
        }
    }

    /// Cached expiration instant, if the monitor is open and has one.
    pub fn expires_at(&self) -> Option<Instant> {
        let current = self.inner.expiration.load();
        (current > 0).then(|| self.inner.clock.instant(current))
    }

    /// Stops polling. Every later `is_lease_expired` reports true.
    pub fn close(&self) {
        self.inner.expiration.close();
        if let Some(task) = self.poll.lock().take() {
            task.abort();
        }
        debug!(mode = ?self.mode(), "lease monitor closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.expiration.is_closed()
    }
}

impl Drop for LeaseMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.poll.get_mut().take() {
            task.abort();
        }
    }
}

/// Delay before the next poll given the TTL just received.
///
/// A healthy lease is polled on the renewal cadence. A lease close to running
/// out is polled at half its TTL so the answer arrives before it lapses.
pub fn poll_delay(config: &LeaseConfig, ttl: Duration) -> Duration {
    let regular = config.lease_duration / config.lease_renew_begin_ratio.max(1) + config.monitor_poll_margin;
    if ttl > regular * 2 {
        regular
    } else {
        (ttl / 2).max(config.monitor_min_poll_interval)
    }
}

async fn poll_loop(inner: Arc<MonitorInner>) {
    let Source::Indirect { client } = &inner.source else {
        return;
    };

    loop {
        let config = inner.store.snapshot();
        let sent = Instant::now();

        let result = match timeout(config.lease_duration, client.query_lease_ttl()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(config.lease_duration)),
        };

        if inner.expiration.is_closed() {
            trace!("discarding lease query reply after close");
            return;
        }

        let delay = match result {
            Ok(reply) => {
                let ttl = reply.or_duration(config.lease_duration);
                let candidate = inner.clock.at(sent).saturating_add(ticks(ttl));
                match inner.expiration.advance(candidate) {
                    Advance::Closed => return,
                    Advance::Updated(_) => trace!(ttl = ?ttl, "lease expiration extended"),
                    Advance::Stale(current) => trace!(ttl = ?ttl, current, "lease query reply is stale"),
                }
                poll_delay(&config, ttl)
            }
            Err(e) => {
                warn!(error = %e, "lease query failed");
                config.monitor_min_poll_interval
            }
        };

        sleep(delay).await;
    }
}
