use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HeartbeatSettings;
use crate::transport::{AppHandle, LeaseTransport};

pub const PROBE_FILE_NAME: &str = "lease_heartbeat.probe";

/// Running heartbeat task. Dropping it stops the heartbeat.
#[derive(Debug)]
pub struct HeartbeatProbe {
    task: JoinHandle<()>,
}

impl HeartbeatProbe {
    /// Starts the heartbeat on `runtime`, or returns `None` when the interval
    /// is zero.
    pub fn start(
        runtime: &Handle,
        transport: Arc<dyn LeaseTransport>,
        app: AppHandle,
        settings: HeartbeatSettings,
    ) -> Option<Self> {
        if settings.interval.is_zero() {
            debug!(%app, "heartbeat disabled");
            return None;
        }

        info!(
            %app,
            interval = ?settings.interval,
            directory = ?settings.probe_directory,
            sectors = settings.buffer_sector_count,
            sector_size = settings.sector_size,
            data = settings.buffer_data,
            "starting heartbeat"
        );

        let task = runtime.spawn(async move {
            let mut ticker = time::interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let healthy = match &settings.probe_directory {
                    Some(directory) => probe_disk(directory, &settings).await,
                    None => true,
                };

                if let Err(e) = transport.update_heartbeat_result(app, healthy) {
                    if e.is_already_gone() {
                        debug!(%app, "registration gone, stopping heartbeat");
                        break;
                    }
                    warn!(%app, error = %e, "failed to report heartbeat");
                }
            }
        });

        Some(Self { task })
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatProbe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Builds the probe buffer for one tick.
///
/// A negative sector count picks a random size in `1..=|count|` sectors and a
/// negative fill value picks random bytes. The rng is the calling thread's
/// own, so concurrent probes never share random state.
pub fn probe_buffer(settings: &HeartbeatSettings) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let sector_size = settings.sector_size as usize;

    let sectors = if settings.buffer_sector_count < 0 {
        rng.gen_range(1..=settings.buffer_sector_count.unsigned_abs() as usize)
    } else {
        settings.buffer_sector_count as usize
    };

    match u8::try_from(settings.buffer_data) {
        Ok(fill) => vec![fill; sectors * sector_size],
        Err(_) if settings.buffer_data < 0 => {
            let mut buffer = vec![0u8; sectors * sector_size];
            rng.fill(&mut buffer[..]);
            buffer
        }
        // Fill values above a byte wrap like a C char would.
        Err(_) => vec![settings.buffer_data as u8; sectors * sector_size],
    }
}

async fn probe_disk(directory: &Path, settings: &HeartbeatSettings) -> bool {
    let buffer = probe_buffer(settings);
    if buffer.is_empty() {
        return true;
    }

    let path: PathBuf = directory.join(PROBE_FILE_NAME);
    let started = time::Instant::now();
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(&buffer).await?;
        file.sync_data().await
    }
    .await;

    match result {
        Ok(()) => {
            debug!(path = %path.display(), bytes = buffer.len(), elapsed = ?started.elapsed(), "disk probe written");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "disk probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_buffer() {
        let settings = HeartbeatSettings {
            buffer_sector_count: 2,
            sector_size: 512,
            buffer_data: 0x42,
            ..HeartbeatSettings::default()
        };

        let buffer = probe_buffer(&settings);

        assert_eq!(buffer.len(), 1024);
        assert!(buffer.iter().all(|b| *b == 0x42));
    }

    #[test]
    fn test_random_size_stays_in_range() {
        let settings = HeartbeatSettings {
            buffer_sector_count: -4,
            sector_size: 16,
            buffer_data: -1,
            ..HeartbeatSettings::default()
        };

        for _ in 0..64 {
            let len = probe_buffer(&settings).len();
            assert!(len >= 16 && len <= 64 && len % 16 == 0, "unexpected size {}", len);
        }
    }

    #[test]
    fn test_zero_sectors_is_empty() {
        let settings = HeartbeatSettings {
            buffer_sector_count: 0,
            ..HeartbeatSettings::default()
        };

        assert!(probe_buffer(&settings).is_empty());
    }

    #[tokio::test]
    async fn test_disk_probe_writes_file() {
        let directory = std::env::temp_dir().join(format!("lease-probe-{}", std::process::id()));
        tokio::fs::create_dir_all(&directory).await.unwrap();
        let settings = HeartbeatSettings {
            interval: Duration::from_millis(10),
            probe_directory: Some(directory.clone()),
            ..HeartbeatSettings::default()
        };

        assert!(probe_disk(&directory, &settings).await);

        let written = tokio::fs::read(directory.join(PROBE_FILE_NAME)).await.unwrap();
        assert_eq!(written.len(), 512);
        let _ = tokio::fs::remove_dir_all(&directory).await;
    }
}
