//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> for configuration
//! - Many handlers read the config at once, a `PUT /api/v1/config` replaces it
//! - A poisoned lock is recovered with `into_inner()`; the config is plain data, so a
//!   panic in another handler cannot leave it half-written
//!
//! ### Atomics for metrics
//! - The audio path bumps counters from tokio tasks, so counters are `AtomicU64` and never
//!   take a lock
//! - Capture blocks dropped on the realtime thread are counted by the capture handle and
//!   folded in here when the session is released
//! - `Ordering::Relaxed` is enough: every counter is independent

use crate::coach::ConnectionStateMachine;
use crate::config::AppConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the coaching pipeline
    pub metrics: Arc<PipelineMetrics>,

    /// When the server started
    pub start_time: Instant,

    /// The one conversation this process drives
    pub coach: ConnectionStateMachine,
}

/// Counters for the coaching pipeline.
///
/// ## What they tell you:
/// - **frames_sent / frames_discarded**: uplink health (discarded = send after close)
/// - **capture_frames_dropped**: frames the capture queue had no room for
/// - **chunks_scheduled / chunks_dropped**: downlink audio health (dropped = undecodable)
/// - **teardowns / teardown_failures**: how often releasing a session went wrong
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub sessions_started: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub capture_frames_dropped: AtomicU64,
    pub chunks_scheduled: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub interruptions: AtomicU64,
    pub turns_completed: AtomicU64,
    pub transcript_entries: AtomicU64,
    pub teardowns: AtomicU64,
    pub teardown_failures: AtomicU64,
}

/// Plain copy of `PipelineMetrics` for JSON responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub frames_sent: u64,
    pub frames_discarded: u64,
    pub capture_frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
    pub transcript_entries: u64,
    pub teardowns: u64,
    pub teardown_failures: u64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_started: read(&self.sessions_started),
            frames_sent: read(&self.frames_sent),
            frames_discarded: read(&self.frames_discarded),
            capture_frames_dropped: read(&self.capture_frames_dropped),
            chunks_scheduled: read(&self.chunks_scheduled),
            chunks_dropped: read(&self.chunks_dropped),
            interruptions: read(&self.interruptions),
            turns_completed: read(&self.turns_completed),
            transcript_entries: read(&self.transcript_entries),
            teardowns: read(&self.teardowns),
            teardown_failures: read(&self.teardown_failures),
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of uplink frames that were discarded (0.0 to 1.0).
    pub fn frame_discard_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_discarded;
        if total > 0 {
            self.frames_discarded as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Fraction of captured frames lost to a full capture queue (0.0 to 1.0).
    pub fn capture_drop_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_discarded + self.capture_frames_dropped;
        if total > 0 {
            self.capture_frames_dropped as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    /// Build the state around an already wired coach.
    ///
    /// `metrics` must be the same counters the coach was built with.
    pub fn new(config: AppConfig, metrics: Arc<PipelineMetrics>, coach: ConnectionStateMachine) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            start_time: Instant::now(),
            coach,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so writers are never held up by a
    /// slow response.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Validate and install a new configuration.
    ///
    /// Session settings are pushed to the coach too; they take effect on its next `start()`.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        let settings = new_config.session_settings();
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        self.coach.update_settings(settings);
        Ok(())
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coach::testing::{FakeBackend, FakeCapture, ManualOutputFactory};

    /// App state wired to in-crate fakes.
    pub(crate) fn test_state() -> AppState {
        let config = AppConfig::default();
        let metrics = Arc::new(PipelineMetrics::default());
        let coach = ConnectionStateMachine::new(
            config.session_settings(),
            Arc::new(FakeBackend::new()),
            Arc::new(FakeCapture::new()),
            Arc::new(ManualOutputFactory::new()),
            Arc::clone(&metrics),
            16,
        );
        AppState::new(config, metrics, coach)
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let metrics = PipelineMetrics::default();
        metrics.frames_sent.fetch_add(3, Ordering::Relaxed);
        metrics.frames_discarded.fetch_add(1, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 3);
        assert_eq!(snapshot.frame_discard_rate(), 0.25);
        assert_eq!(MetricsSnapshot::default().frame_discard_rate(), 0.0);

        metrics.capture_frames_dropped.fetch_add(4, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.capture_frames_dropped, 4);
        assert_eq!(snapshot.capture_drop_rate(), 0.5);
        assert_eq!(MetricsSnapshot::default().capture_drop_rate(), 0.0);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = test_state();
        let mut config = state.get_config();
        config.server.port = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[test]
    fn test_update_config_reaches_coach() {
        let state = test_state();
        let mut config = state.get_config();
        config.backend.voice_name = "Aoede".to_string();
        state.update_config(config).unwrap();
        assert_eq!(state.coach.settings().connect.voice_name, "Aoede");
    }
}
