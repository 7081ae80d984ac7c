//! Heartbeat runner for proactive wake-up and health monitoring.
//!
//! When enabled, the runner periodically sends the configured prompt to the
//! reasoning backend at `<channelId>:<sourceId>` and tracks beat health.

use crate::backend::{CallOptions, ReasoningBackend};
use crate::config::HeartbeatConfig;
use crate::envelope::CorrelationId;
use crate::routing::{BusyPolicy, SessionKey};
use crate::util::timestamp_ms;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

/// Handle for controlling the heartbeat loop.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl HeartbeatHandle {
    /// Signal the heartbeat loop to stop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Health status of the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Whether the last beat succeeded.
    pub healthy: bool,
    /// Number of beats since start.
    pub heartbeat_count: u64,
    /// Unix milliseconds of the last beat.
    pub last_heartbeat: Option<u64>,
    /// Number of failed beats.
    pub error_count: u64,
    /// Text of the most recent failure.
    pub last_error: Option<String>,
}

#[derive(Clone)]
struct Beat {
    session: SessionKey,
    prompt: String,
    backend: Option<Arc<dyn ReasoningBackend>>,
    status: Arc<RwLock<HealthStatus>>,
}

impl Beat {
    async fn run(&self) {
        let correlation_id = CorrelationId::generate();
        let result = match &self.backend {
            Some(backend) => backend
                .invoke(
                    &self.session,
                    &self.prompt,
                    &CallOptions::new(BusyPolicy::Drop, correlation_id.clone()),
                )
                .await
                .map_err(|e| e.to_string()),
            None => Err("reasoning backend disabled".to_string()),
        };

        let mut s = self.status.write().await;
        s.heartbeat_count += 1;
        s.last_heartbeat = Some(timestamp_ms());
        match result {
            Ok(_) => {
                s.healthy = true;
                debug!(count = s.heartbeat_count, correlation_id = %correlation_id, "heartbeat");
            }
            Err(e) => {
                warn!(error = %e, "heartbeat failed");
                s.healthy = false;
                s.error_count += 1;
                s.last_error = Some(e);
            }
        }
    }
}

/// Periodic backend wake-up.
pub struct HeartbeatRunner {
    beat: Beat,
    interval: Duration,
    enabled: bool,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<HeartbeatHandle>>,
}

impl std::fmt::Debug for HeartbeatRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatRunner")
            .field("session", &self.beat.session)
            .field("interval", &self.interval)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl HeartbeatRunner {
    /// Create a runner from config.
    pub fn new(config: &HeartbeatConfig, backend: Option<Arc<dyn ReasoningBackend>>) -> Self {
        Self {
            beat: Beat {
                session: SessionKey::for_source(&config.channel_id, &config.source_id),
                prompt: config.prompt.clone(),
                backend,
                status: Arc::new(RwLock::new(HealthStatus {
                    healthy: true,
                    ..HealthStatus::default()
                })),
            },
            interval: Duration::from_secs(config.interval_secs.max(1)),
            enabled: config.enabled,
            running: Arc::new(RwLock::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Override the beat interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether config enables the runner.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the current health status.
    pub async fn status(&self) -> HealthStatus {
        self.beat.status.read().await.clone()
    }

    /// Check if the loop is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Perform a single beat now.
    pub async fn beat_once(&self) {
        self.beat.run().await;
    }

    /// Start the loop if enabled. Returns whether it was started.
    pub async fn start(&self) -> bool {
        if !self.enabled {
            debug!("heartbeat disabled");
            return false;
        }
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return true;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *handle = Some(HeartbeatHandle { shutdown_tx });

        let beat = self.beat.clone();
        let interval = self.interval;
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            *running.write().await = true;
            info!(interval = ?interval, session = %beat.session, "heartbeat runner started");

            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => beat.run().await,
                    _ = shutdown_rx.recv() => {
                        info!("heartbeat runner shutting down");
                        break;
                    }
                }
            }

            *running.write().await = false;
        });
        true
    }

    /// Stop the loop.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop().await;
        }
    }
}
