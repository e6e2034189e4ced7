//! Heartbeat service
//!
//! Sends one liveness ping per tick through the platform facade. A first
//! heartbeat is emitted immediately when the service starts; each call
//! carries its own deadline so a stalled network never wedges the ticker.
//! Transport errors are counted and surfaced through `is_healthy`, never
//! retried within a tick; the next tick is the retry.

use crate::transport::Platform;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Floor for the configured interval
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Per-call deadline
const HEARTBEAT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Failures tolerated before `is_healthy` goes false without a recent
/// success
const FAILURE_TOLERANCE: u64 = 3;

/// Callback fired after each heartbeat attempt
pub type HeartbeatHook = Arc<dyn Fn(&HeartbeatStats) + Send + Sync>;

/// Counters maintained across heartbeat attempts
#[derive(Debug, Clone, Default)]
pub struct HeartbeatStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Periodic liveness reporter
pub struct HeartbeatService {
    platform: Arc<dyn Platform>,
    agent_id: String,
    interval: Duration,
    stats: Arc<std::sync::Mutex<HeartbeatStats>>,
    on_success: Option<HeartbeatHook>,
    on_failure: Option<HeartbeatHook>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

impl HeartbeatService {
    /// Build the service; intervals below the floor are clamped
    pub fn new(
        platform: Arc<dyn Platform>,
        agent_id: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let interval = if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                requested_secs = interval.as_secs(),
                clamped_secs = MIN_HEARTBEAT_INTERVAL.as_secs(),
                "heartbeat interval below minimum, clamping"
            );
            MIN_HEARTBEAT_INTERVAL
        } else {
            interval
        };

        Self {
            platform,
            agent_id: agent_id.into(),
            interval,
            stats: Arc::new(std::sync::Mutex::new(HeartbeatStats::default())),
            on_success: None,
            on_failure: None,
            handle: Mutex::new(None),
            cancel,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach success/failure hooks; must be called before `start`
    pub fn with_callbacks(
        mut self,
        on_success: Option<HeartbeatHook>,
        on_failure: Option<HeartbeatHook>,
    ) -> Self {
        self.on_success = on_success;
        self.on_failure = on_failure;
        self
    }

    /// Effective (possibly clamped) interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current counters
    pub fn stats(&self) -> HeartbeatStats {
        self.stats.lock().expect("heartbeat stats lock poisoned").clone()
    }

    /// Start the ticker; idempotent
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            debug!("heartbeat service already started");
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let platform = self.platform.clone();
        let agent_id = self.agent_id.clone();
        let stats = self.stats.clone();
        let on_success = self.on_success.clone();
        let on_failure = self.on_failure.clone();
        let cancel = self.cancel.clone();
        let tick_interval = self.interval;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    // First tick completes immediately: the initial
                    // heartbeat goes out before the cadence starts
                    _ = ticker.tick() => {}
                }

                let result = timeout(
                    HEARTBEAT_CALL_TIMEOUT,
                    platform.send_heartbeat(&agent_id),
                )
                .await;

                let snapshot = {
                    let mut stats = stats.lock().expect("heartbeat stats lock poisoned");
                    match &result {
                        Ok(Ok(())) => {
                            stats.success_count += 1;
                            stats.last_success = Some(Utc::now());
                        }
                        _ => {
                            stats.failure_count += 1;
                            stats.last_failure = Some(Utc::now());
                        }
                    }
                    stats.clone()
                };

                match result {
                    Ok(Ok(())) => {
                        debug!(agent_id = %agent_id, "heartbeat sent");
                        if let Some(hook) = &on_success {
                            hook(&snapshot);
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(agent_id = %agent_id, error = %e, "heartbeat failed");
                        if let Some(hook) = &on_failure {
                            hook(&snapshot);
                        }
                    }
                    Err(_) => {
                        warn!(
                            agent_id = %agent_id,
                            timeout_secs = HEARTBEAT_CALL_TIMEOUT.as_secs(),
                            "heartbeat timed out"
                        );
                        if let Some(hook) = &on_failure {
                            hook(&snapshot);
                        }
                    }
                }
            }
            debug!("heartbeat ticker stopped");
        }));
    }

    /// Cancel the ticker and wait for it to exit
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            self.cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Healthy while running and either recently successful or not yet
    /// persistently failing
    pub fn is_healthy(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let stats = self.stats.lock().expect("heartbeat stats lock poisoned");
        let recent_success = stats.last_success.is_some_and(|at| {
            let window = chrono::Duration::from_std(self.interval * 3)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            Utc::now() - at <= window
        });
        recent_success || stats.failure_count < FAILURE_TOLERANCE
    }
}
