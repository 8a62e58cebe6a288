//! # Session Resources
//!
//! Everything a live session holds, gathered in one owner so that it can only be
//! released as a unit.
//!
//! ## Teardown Order:
//! 1. Stop capture (no new frames) and record how many frames it dropped
//! 2. Detach the uplink task
//! 3. Close the live session
//! 4. Detach the downlink task
//! 5. Flush playback (stop every scheduled source, reset the cursor)
//! 6. Close the output clock
//!
//! Every step runs even if an earlier one failed or panicked. Each slot is an `Option`
//! that is `take()`n by its step, so tearing down twice is harmless and `Drop` can
//! simply tear down again.

use crate::audio::capture::CaptureHandle;
use crate::audio::output::AudioOutput;
use crate::audio::playback::PlaybackScheduler;
use crate::error::VoiceError;
use crate::state::PipelineMetrics;
use crate::transport::LiveSession;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of one teardown pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TeardownReport {
    /// Steps that actually had something to release
    pub released: Vec<&'static str>,
    /// `(step, reason)` for every step that failed
    pub failures: Vec<(&'static str, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The single owner of a session's capture, tasks, connection and audio output.
pub struct SessionResources {
    pub(crate) capture: Option<CaptureHandle>,
    pub(crate) uplink: Option<JoinHandle<()>>,
    pub(crate) session: Option<LiveSession>,
    pub(crate) downlink: Option<JoinHandle<()>>,
    pub(crate) playback: Option<Arc<Mutex<PlaybackScheduler>>>,
    pub(crate) output: Option<Arc<dyn AudioOutput>>,
    metrics: Arc<PipelineMetrics>,
}

impl SessionResources {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            capture: None,
            uplink: None,
            session: None,
            downlink: None,
            playback: None,
            output: None,
            metrics,
        }
    }

    /// Whether every slot is empty.
    pub fn is_released(&self) -> bool {
        self.capture.is_none()
            && self.uplink.is_none()
            && self.session.is_none()
            && self.downlink.is_none()
            && self.playback.is_none()
            && self.output.is_none()
    }

    /// Release everything that is still held.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.is_released() {
            return report;
        }

        if let Some(mut capture) = self.capture.take() {
            run_step(&mut report, "stop capture", || capture.stop());
            let dropped = capture.dropped_frames();
            if dropped > 0 {
                debug!("Capture dropped {} frames during the session", dropped);
            }
            self.metrics
                .capture_frames_dropped
                .fetch_add(dropped, Ordering::Relaxed);
        }
        if let Some(uplink) = self.uplink.take() {
            run_step(&mut report, "detach uplink", move || {
                uplink.abort();
                Ok(())
            });
        }
        if let Some(session) = self.session.take() {
            run_step(&mut report, "close session", move || {
                session.close();
                Ok(())
            });
        }
        if let Some(downlink) = self.downlink.take() {
            run_step(&mut report, "detach downlink", move || {
                downlink.abort();
                Ok(())
            });
        }
        if let Some(playback) = self.playback.take() {
            run_step(&mut report, "flush playback", move || {
                let mut scheduler = playback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let cut = scheduler.stop_all();
                debug!("Flushed {} playback sources", cut);
                Ok(())
            });
        }
        if let Some(output) = self.output.take() {
            run_step(&mut report, "close output", move || output.close());
        }

        self.metrics.teardowns.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .teardown_failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
        report
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        let report = self.teardown();
        if !report.released.is_empty() {
            debug!("Session resources released on drop: {:?}", report.released);
        }
    }
}

/// Run one release step, converting both errors and panics into a failure entry.
fn run_step<F>(report: &mut TeardownReport, step: &'static str, release: F)
where
    F: FnOnce() -> Result<(), VoiceError>,
{
    report.released.push(step);
    let reason = match catch_unwind(AssertUnwindSafe(release)) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string()),
    };
    warn!("Teardown step '{}' failed: {}", step, reason);
    report.failures.push((step, reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::tests::{pcm_chunk, ManualOutput};
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    fn capture_handle(calls: &Arc<AtomicUsize>, fail: bool) -> CaptureHandle {
        capture_handle_with_drops(calls, fail, 0)
    }

    fn capture_handle_with_drops(calls: &Arc<AtomicUsize>, fail: bool, dropped: u64) -> CaptureHandle {
        let calls = Arc::clone(calls);
        CaptureHandle::new(
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    panic!("driver crashed");
                }
                Ok(())
            },
            Arc::new(AtomicU64::new(dropped)),
        )
    }

    #[tokio::test]
    async fn test_teardown_releases_everything_in_order() {
        let metrics = Arc::new(PipelineMetrics::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let (session, _outbound) = LiveSession::channel();
        let output = Arc::new(ManualOutput::new(24_000));
        let mut scheduler = PlaybackScheduler::new(output.clone());
        scheduler.on_audio_chunk(&pcm_chunk(240)).unwrap();

        let mut resources = SessionResources::new(Arc::clone(&metrics));
        resources.capture = Some(capture_handle(&calls, false));
        resources.uplink = Some(tokio::spawn(std::future::pending::<()>()));
        resources.session = Some(session.clone());
        resources.downlink = Some(tokio::spawn(std::future::pending::<()>()));
        resources.playback = Some(Arc::new(Mutex::new(scheduler)));
        resources.output = Some(output.clone());

        let report = resources.teardown();
        assert!(report.is_clean());
        assert_eq!(
            report.released,
            vec![
                "stop capture",
                "detach uplink",
                "close session",
                "detach downlink",
                "flush playback",
                "close output"
            ]
        );
        assert!(resources.is_released());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());
        assert!(output.is_closed());
        assert_eq!(output.playing_count(), 0);

        // Second pass has nothing left to do
        assert!(resources.teardown().released.is_empty());
        assert_eq!(metrics.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_step_does_not_block_the_rest() {
        let metrics = Arc::new(PipelineMetrics::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let (session, _outbound) = LiveSession::channel();
        let mut output = ManualOutput::new(24_000);
        output.fail_close = true;
        let output = Arc::new(output);

        let mut resources = SessionResources::new(Arc::clone(&metrics));
        resources.capture = Some(capture_handle(&calls, true));
        resources.session = Some(session.clone());
        resources.output = Some(output.clone());

        let report = resources.teardown();
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].0, "stop capture");
        assert!(report.failures[0].1.contains("driver crashed"));
        assert_eq!(report.failures[1].0, "close output");

        assert!(session.is_closed());
        assert!(output.is_closed());
        assert_eq!(metrics.teardown_failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capture_drops_are_recorded() {
        let metrics = Arc::new(PipelineMetrics::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut resources = SessionResources::new(Arc::clone(&metrics));
        resources.capture = Some(capture_handle_with_drops(&calls, false, 5));
        resources.teardown();

        // A failing stop still reports what was dropped
        let mut resources = SessionResources::new(Arc::clone(&metrics));
        resources.capture = Some(capture_handle_with_drops(&calls, true, 2));
        let report = resources.teardown();
        assert_eq!(report.failures.len(), 1);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.snapshot().capture_frames_dropped, 7);
    }

    #[test]
    fn test_drop_tears_down() {
        let (session, _outbound) = LiveSession::channel();
        {
            let mut resources = SessionResources::new(Arc::new(PipelineMetrics::default()));
            resources.session = Some(session.clone());
        }
        assert!(session.is_closed());
    }
}
