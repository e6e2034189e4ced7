//! Metrics service
//!
//! Samples host CPU, memory, and root-filesystem usage on a ticker and
//! reports each sample through the platform facade. When the engine is
//! running, its process CPU/memory replace the host-wide values whenever
//! they exceed them, so a busy engine on an otherwise idle host is not
//! hidden. Event counters stay at zero until an engine stats endpoint is
//! wired in.

use crate::engine::EngineControl;
use crate::protocol::model::AgentMetrics;
use crate::transport::Platform;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Pid, System};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Floor for the configured interval
pub const MIN_METRICS_INTERVAL: Duration = Duration::from_secs(30);
/// `get_metrics` serves a cached sample at most this old
const CACHE_WINDOW: Duration = Duration::from_secs(5);
/// CPU usage is measured across this window
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Periodic system and engine resource reporter
pub struct MetricsService {
    platform: Arc<dyn Platform>,
    engine: Arc<dyn EngineControl>,
    agent_id: String,
    interval: Duration,
    started_at: Instant,
    cache: Arc<Mutex<Option<(Instant, AgentMetrics)>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MetricsService {
    /// Build the service; intervals below the floor are clamped
    pub fn new(
        platform: Arc<dyn Platform>,
        engine: Arc<dyn EngineControl>,
        agent_id: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let interval = if interval < MIN_METRICS_INTERVAL {
            warn!(
                requested_secs = interval.as_secs(),
                clamped_secs = MIN_METRICS_INTERVAL.as_secs(),
                "metrics interval below minimum, clamping"
            );
            MIN_METRICS_INTERVAL
        } else {
            interval
        };

        Self {
            platform,
            engine,
            agent_id: agent_id.into(),
            interval,
            started_at: Instant::now(),
            cache: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
            cancel,
        }
    }

    /// Effective (possibly clamped) interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Latest metrics, served from a short-lived cache
    pub async fn get_metrics(&self) -> AgentMetrics {
        {
            let cache = self.cache.lock().await;
            if let Some((taken_at, sample)) = &*cache {
                if taken_at.elapsed() <= CACHE_WINDOW {
                    return sample.clone();
                }
            }
        }
        self.sample_and_cache().await
    }

    /// Take a fresh sample and publish it to the cache
    async fn sample_and_cache(&self) -> AgentMetrics {
        let sample = self.sample().await;
        let mut cache = self.cache.lock().await;
        *cache = Some((Instant::now(), sample.clone()));
        sample
    }

    /// Take a fresh sample
    async fn sample(&self) -> AgentMetrics {
        let engine_pid = if self.engine.is_running().await {
            let pid = self.engine.status().await.pid;
            (pid != 0).then_some(pid)
        } else {
            None
        };
        let uptime_secs = self.started_at.elapsed().as_secs();

        // sysinfo sampling blocks for the CPU window; keep it off the
        // async worker threads
        let sampled = tokio::task::spawn_blocking(move || sample_system(engine_pid))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "metrics sampling task failed");
                (0.0, 0.0, 0.0)
            });
        let (cpu_percent, memory_percent, disk_percent) = sampled;

        AgentMetrics {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            disk_percent,
            events_received: 0,
            events_sent: 0,
            events_failed: 0,
            uptime_secs,
        }
    }

    /// Start the ticker; idempotent. Each tick samples through the same
    /// path `get_metrics` uses and reports; reporting failures are
    /// logged and the ticker continues.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            debug!("metrics service already started");
            return;
        }

        let service = self.clone();
        let cancel = self.cancel.clone();
        let tick_interval = self.interval;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let sample = service.sample_and_cache().await;
                match service
                    .platform
                    .report_metrics(&service.agent_id, &sample)
                    .await
                {
                    Ok(()) => debug!(agent_id = %service.agent_id, "metrics reported"),
                    Err(e) => {
                        warn!(agent_id = %service.agent_id, error = %e, "metrics report failed")
                    }
                }
            }
            debug!("metrics ticker stopped");
        }));
    }

    /// Cancel the ticker and wait for it to exit
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            self.cancel.cancel();
            let _ = handle.await;
        }
    }
}

/// Blocking sampler: host CPU% over a one-second window, memory used%,
/// root filesystem used%, with the engine process override applied
fn sample_system(engine_pid: Option<u32>) -> (f32, f32, f32) {
    let mut sys = System::new();

    sys.refresh_cpu();
    if let Some(pid) = engine_pid {
        sys.refresh_process(Pid::from_u32(pid));
    }
    std::thread::sleep(CPU_SAMPLE_WINDOW);
    sys.refresh_cpu();
    sys.refresh_memory();

    let host_cpu = sys.global_cpu_info().cpu_usage();
    let total_memory = sys.total_memory();
    let host_memory = if total_memory > 0 {
        (sys.used_memory() as f32 / total_memory as f32) * 100.0
    } else {
        0.0
    };

    let engine_sample = engine_pid.and_then(|pid| {
        if !sys.refresh_process(Pid::from_u32(pid)) {
            return None;
        }
        let process = sys.process(Pid::from_u32(pid))?;
        let memory = if total_memory > 0 {
            (process.memory() as f32 / total_memory as f32) * 100.0
        } else {
            0.0
        };
        Some((process.cpu_usage(), memory))
    });

    let (cpu_percent, memory_percent) = apply_engine_override(host_cpu, host_memory, engine_sample);
    let disk_percent = root_disk_percent();
    (cpu_percent, memory_percent, disk_percent)
}

/// A busy engine on an otherwise idle host must not be hidden: the
/// engine process values replace the host-wide ones when they exceed
/// them
fn apply_engine_override(
    host_cpu: f32,
    host_memory: f32,
    engine: Option<(f32, f32)>,
) -> (f32, f32) {
    match engine {
        Some((engine_cpu, engine_memory)) => (
            host_cpu.max(engine_cpu),
            host_memory.max(engine_memory),
        ),
        None => (host_cpu, host_memory),
    }
}

/// Used% of the filesystem mounted at `/`
fn root_disk_percent() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    for disk in disks.iter() {
        if disk.mount_point() == std::path::Path::new("/") {
            let total = disk.total_space();
            if total == 0 {
                return 0.0;
            }
            let used = total.saturating_sub(disk.available_space());
            return (used as f32 / total as f32) * 100.0;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockEngine, MockPlatform};

    fn service(interval: Duration) -> MetricsService {
        MetricsService::new(
            Arc::new(MockPlatform::new()),
            Arc::new(MockEngine::new()),
            "test-agent",
            interval,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_interval_clamped_to_minimum() {
        assert_eq!(service(Duration::from_secs(5)).interval(), MIN_METRICS_INTERVAL);
        assert_eq!(
            service(Duration::from_secs(120)).interval(),
            Duration::from_secs(120)
        );
    }

    #[tokio::test]
    async fn test_get_metrics_returns_sane_values() {
        let service = service(Duration::from_secs(60));
        let metrics = service.get_metrics().await;

        assert!((0.0..=100.0).contains(&metrics.memory_percent));
        assert!((0.0..=100.0).contains(&metrics.disk_percent));
        assert!(metrics.cpu_percent >= 0.0);
        assert_eq!(metrics.events_received, 0);
        assert_eq!(metrics.events_sent, 0);
        assert_eq!(metrics.events_failed, 0);
    }

    #[tokio::test]
    async fn test_get_metrics_serves_cached_sample() {
        let service = service(Duration::from_secs(60));

        let first = service.get_metrics().await;
        let second = service.get_metrics().await;
        // Within the cache window the same snapshot comes back
        assert_eq!(first.timestamp, second.timestamp);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_harmless() {
        let service = service(Duration::from_secs(60));
        service.stop().await;
    }

    #[test]
    fn test_engine_override_takes_the_larger_value() {
        // A busy engine on an idle host shows through
        assert_eq!(
            apply_engine_override(3.0, 10.0, Some((85.0, 42.0))),
            (85.0, 42.0)
        );
        // A quiet engine never lowers the host numbers
        assert_eq!(
            apply_engine_override(60.0, 70.0, Some((5.0, 8.0))),
            (60.0, 70.0)
        );
        // Mixed: each dimension is compared independently
        assert_eq!(
            apply_engine_override(60.0, 10.0, Some((5.0, 42.0))),
            (60.0, 42.0)
        );
    }

    #[test]
    fn test_engine_override_without_engine_keeps_host_values() {
        assert_eq!(apply_engine_override(12.0, 34.0, None), (12.0, 34.0));
    }
}
