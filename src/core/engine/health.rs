//! Shared health state between the serial task and the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A transport that produced no valid frame for this long is considered
/// dead rather than merely degraded.
const UNHEALTHY_WINDOW: Duration = Duration::from_secs(60);

/// How many poll intervals a poll result may age before health degrades.
const POLL_FRESHNESS_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatusKind {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatusKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            HealthStatusKind::Healthy => "healthy",
            HealthStatusKind::Degraded => "degraded",
            HealthStatusKind::Unhealthy => "unhealthy",
        }
    }
}

/// Snapshot handed to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub status: HealthStatusKind,
    pub controller_connected: bool,
    pub uptime_seconds: u64,
    pub parameters_count: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct HealthInner {
    connected: bool,
    last_poll_at: Option<DateTime<Utc>>,
    last_frame_at: Option<Instant>,
}

/// Cheaply clonable shared health handle.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthInner>>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthInner::default())),
            started_at: Instant::now(),
            started_wall: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_wall
    }

    pub async fn set_connected(&self, connected: bool) {
        self.inner.write().await.connected = connected;
    }

    pub async fn record_poll(&self, at: DateTime<Utc>) {
        self.inner.write().await.last_poll_at = Some(at);
    }

    /// Note the most recent valid frame seen by the link.
    pub async fn record_frame_activity(&self, last_frame_at: Option<Instant>) {
        if last_frame_at.is_some() {
            self.inner.write().await.last_frame_at = last_frame_at;
        }
    }

    pub async fn info(&self, poll_interval: Duration, parameters_count: usize) -> HealthInfo {
        let inner = self.inner.read().await;
        let uptime = self.started_at.elapsed();

        let frame_fresh = inner
            .last_frame_at
            .map(|t| t.elapsed() < UNHEALTHY_WINDOW)
            // Startup grace: no traffic yet is not a dead bus.
            .unwrap_or(uptime < UNHEALTHY_WINDOW);

        let poll_fresh = inner
            .last_poll_at
            .map(|t| {
                let age = Utc::now().signed_duration_since(t);
                age.to_std()
                    .map(|age| age < poll_interval * POLL_FRESHNESS_FACTOR)
                    .unwrap_or(true)
            })
            .unwrap_or(false);

        let status = if !inner.connected && !frame_fresh {
            HealthStatusKind::Unhealthy
        } else if inner.connected && poll_fresh {
            HealthStatusKind::Healthy
        } else {
            HealthStatusKind::Degraded
        };

        HealthInfo {
            status,
            controller_connected: inner.connected,
            uptime_seconds: uptime.as_secs(),
            parameters_count,
            last_poll_at: inner.last_poll_at,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
