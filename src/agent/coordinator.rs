//! Lifecycle coordinator
//!
//! Owns the transport facade, configuration store, engine supervisor,
//! heartbeat and metrics services, and the message router. Startup
//! registers with the platform (the only fatal failure), starts the
//! engine and the reporting loops, and launches the control-channel
//! reconnect supervisor. Shutdown flips the agent offline, pushes one
//! final status report, cancels every worker, and waits out the caller's
//! deadline.

use crate::agent::router::MessageRouter;
use crate::config::AgentSettings;
use crate::engine::{EngineControl, EngineSupervisor};
use crate::error::{AgentError, AgentResult};
use crate::protocol::frames::ControlFrame;
use crate::protocol::model::{AgentIdentity, AgentStatus, AgentStatusState, StatusReport};
use crate::services::{HeartbeatService, MetricsService};
use crate::store::ConfigStore;
use crate::transport::{ControlChannel, Platform, PlatformClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The agent object wiring every component together
pub struct AgentCoordinator {
    agent_id: String,
    settings: AgentSettings,
    identity: Arc<RwLock<AgentIdentity>>,
    status: Arc<RwLock<AgentStatus>>,
    platform: Arc<dyn Platform>,
    channel: Option<Arc<ControlChannel>>,
    engine: Arc<dyn EngineControl>,
    store: Arc<ConfigStore>,
    heartbeat: HeartbeatService,
    metrics: Arc<MetricsService>,
    cancel: CancellationToken,
    inbound_tx: Mutex<Option<mpsc::Sender<ControlFrame>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<ControlFrame>>>,
    channel_worker: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentCoordinator {
    /// Build the coordinator with injected collaborators
    pub fn new(
        settings: AgentSettings,
        agent_id: String,
        platform: Arc<dyn Platform>,
        channel: Option<Arc<ControlChannel>>,
        engine: Arc<dyn EngineControl>,
        store: Arc<ConfigStore>,
        cancel: CancellationToken,
    ) -> Self {
        let identity = Arc::new(RwLock::new(AgentIdentity {
            agent_id: agent_id.clone(),
            hostname: detect_hostname(),
            ip: detect_primary_ipv4(&settings.platform.base_url),
            engine_version: "unknown".to_string(),
        }));
        let status = Arc::new(RwLock::new(AgentStatus::new(agent_id.clone())));

        // Keep the status document's heartbeat stamp fresh
        let status_for_hook = status.clone();
        let heartbeat = HeartbeatService::new(
            platform.clone(),
            agent_id.clone(),
            Duration::from_secs(settings.heartbeat.interval_secs),
            cancel.child_token(),
        )
        .with_callbacks(
            Some(Arc::new(move |stats| {
                if let Ok(mut status) = status_for_hook.try_write() {
                    status.last_heartbeat = stats.last_success;
                }
            })),
            None,
        );

        let metrics = Arc::new(MetricsService::new(
            platform.clone(),
            engine.clone(),
            agent_id.clone(),
            Duration::from_secs(settings.metrics.interval_secs),
            cancel.child_token(),
        ));

        let (inbound_tx, inbound_rx) = MessageRouter::inbound_queue();

        Self {
            agent_id,
            settings,
            identity,
            status,
            platform,
            channel,
            engine,
            store,
            heartbeat,
            metrics,
            cancel,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            channel_worker: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Build the coordinator with real components from settings
    pub async fn from_settings(settings: AgentSettings) -> AgentResult<Self> {
        let agent_id = settings.resolve_agent_id();
        let cancel = CancellationToken::new();

        let token = settings.platform_token()?;
        let platform = Arc::new(PlatformClient::from_settings(&settings, &agent_id, token)?);
        let channel = platform.channel();
        let engine: Arc<dyn EngineControl> = Arc::new(EngineSupervisor::new(
            settings.engine.clone(),
            cancel.child_token(),
        ));
        let store = Arc::new(
            ConfigStore::open(settings.engine.config_dir.clone(), settings.store.backup_count)
                .await?,
        );

        Ok(Self::new(
            settings,
            agent_id,
            platform,
            channel,
            engine,
            store,
            cancel,
        ))
    }

    /// Agent id in use
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Shared status document
    pub fn status(&self) -> Arc<RwLock<AgentStatus>> {
        self.status.clone()
    }

    /// Heartbeat health indicator
    pub fn is_healthy(&self) -> bool {
        self.heartbeat.is_healthy()
    }

    /// Startup sequence; only registration failure aborts
    pub async fn start(&self) -> AgentResult<()> {
        info!(agent_id = %self.agent_id, "starting agent");

        let identity = self.identity.read().await.clone();
        self.platform
            .register(&identity)
            .await
            .map_err(AgentError::Transport)?;
        info!(agent_id = %self.agent_id, hostname = %identity.hostname, ip = %identity.ip, "registered with platform");

        // The agent stays useful as a control-plane endpoint even when
        // the engine will not come up
        match self.engine.start().await {
            Ok(()) => {
                let version = self.engine.status().await.version;
                info!(version = %version, "engine started");
                self.identity.write().await.engine_version = version;
            }
            Err(e) => {
                error!(error = %e, "engine start failed, continuing without engine");
            }
        }

        self.heartbeat.start().await;
        self.metrics.start().await;

        if let Some(channel) = &self.channel {
            let inbound_tx = self
                .inbound_tx
                .lock()
                .await
                .clone()
                .ok_or_else(|| AgentError::config_invalid("agent already shut down"))?;
            let handle = spawn_reconnect_loop(
                channel.clone(),
                inbound_tx,
                self.cancel.clone(),
                Duration::from_secs(self.settings.platform.reconnect_interval_secs),
                self.settings.platform.max_reconnect_attempts,
            );
            *self.channel_worker.lock().await = Some(handle);
        }

        let router = Arc::new(MessageRouter::new(
            self.platform.clone(),
            self.store.clone(),
            self.engine.clone(),
            self.metrics.clone(),
            self.status.clone(),
            self.agent_id.clone(),
            self.settings.engine.auto_reload,
        ));
        let inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::config_invalid("agent already started"))?;
        self.workers
            .lock()
            .await
            .push(router.spawn(inbound_rx, self.cancel.clone()));

        self.status.write().await.status = AgentStatusState::Online;
        info!(agent_id = %self.agent_id, "agent online");
        Ok(())
    }

    /// Shutdown sequence, bounded by `deadline`
    pub async fn stop(&self, deadline: Duration) -> AgentResult<()> {
        let started = Instant::now();
        info!(agent_id = %self.agent_id, "stopping agent");

        self.status.write().await.status = AgentStatusState::Offline;

        // Best-effort final status report
        let report = StatusReport {
            agent: self.status.read().await.clone(),
            engine: self.engine.status().await,
        };
        if let Err(e) = self.platform.report_status(&self.agent_id, &report).await {
            warn!(error = %e, "final status report failed");
        }

        // Signal every callee; the actual teardowns follow in order
        self.cancel.cancel();
        self.heartbeat.stop().await;
        self.metrics.stop().await;

        let remaining = deadline
            .saturating_sub(started.elapsed())
            .max(Duration::from_secs(1));
        if let Err(e) = self.engine.stop(remaining).await {
            warn!(error = %e, "engine stop failed during shutdown");
        }

        // Close the transport's control channel only once the engine is
        // down: tear the reconnect worker out and wait for it
        if let Some(handle) = self.channel_worker.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        // Closing the queue lets the router drain and exit
        self.inbound_tx.lock().await.take();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let remaining = deadline.saturating_sub(started.elapsed());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(remaining, join_all).await.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "shutdown deadline expired with workers still active"
            );
        }

        info!(agent_id = %self.agent_id, "agent stopped");
        Ok(())
    }
}

/// Re-establish the control channel until cancelled or out of attempts
fn spawn_reconnect_loop(
    channel: Arc<ControlChannel>,
    inbound_tx: mpsc::Sender<ControlFrame>,
    cancel: CancellationToken,
    reconnect_interval: Duration,
    max_attempts: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match channel.run(inbound_tx.clone(), cancel.clone()).await {
                Ok(()) => {
                    // A served session ended; start counting afresh
                    attempts = 0;
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!("control channel session ended, reconnecting");
                }
                Err(e) => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "control channel attempt failed");
                    if max_attempts > 0 && attempts >= max_attempts {
                        warn!(
                            max_attempts,
                            "control channel given up, continuing over HTTP"
                        );
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(reconnect_interval) => {}
            }
        }
        info!("control channel reconnect loop stopped");
    })
}

/// Host name for the registration payload
fn detect_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Primary non-loopback IPv4, discovered by routing a datagram toward the
/// platform host (no packet is actually sent)
fn detect_primary_ipv4(base_url: &str) -> String {
    let target = url::Url::parse(base_url)
        .ok()
        .and_then(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            Some((host, port))
        })
        .unwrap_or_else(|| ("203.0.113.1".to_string(), 80));

    let probe = || -> Option<std::net::IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect((target.0.as_str(), target.1)).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_loopback() && ip.is_ipv4()).then_some(ip)
    };

    probe()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
