use crate::dedup::{DedupGate, DedupOutcome};
use crate::dispatcher::AnalysisDispatcher;
use crate::events::{EventBus, TrackerEvent};
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::frame::{CaptureError, Frame};
use crate::frame_lease::FrameLease;
use crate::frame_store::FrameStore;
use crate::model::{Sample, SampleLocator};
use crate::session::SessionHandle;
use crate::store::SessionStore;
use anyhow::Result;
use std::sync::{Arc, Mutex};

/// How a single tick ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Captured { duplicate: bool },
    /// Acquisition failed but the source is still usable.
    CaptureFailed,
    /// The source is gone; the scheduler must stop.
    SourceUnavailable(String),
    StorageFailed,
}

/// The work done on every tick: acquire, fingerprint, persist, dedup, analyze.
#[derive(Clone)]
pub struct CapturePipeline {
    frames: Arc<dyn FrameStore>,
    store: Arc<dyn SessionStore>,
    dispatcher: AnalysisDispatcher,
    events: EventBus,
}

impl CapturePipeline {
    pub fn new(
        frames: Arc<dyn FrameStore>,
        store: Arc<dyn SessionStore>,
        dispatcher: AnalysisDispatcher,
        events: EventBus,
    ) -> Self {
        Self {
            frames,
            store,
            dispatcher,
            events,
        }
    }

    pub async fn run_tick(
        &self,
        session: &SessionHandle,
        lease: &FrameLease,
        gate: &Mutex<DedupGate>,
    ) -> TickOutcome {
        let session_id = lease.session_id();

        let frame = match lease.acquire().await {
            Ok(frame) => frame,
            Err(CaptureError::Unavailable(reason)) => {
                tracing::warn!(session_id, reason = %reason, "frame source unavailable, stopping capture");
                self.events.emit(TrackerEvent::CaptureStopped {
                    session_id: session_id.to_string(),
                    reason: reason.clone(),
                });
                return TickOutcome::SourceUnavailable(reason);
            }
            Err(CaptureError::Failed(err)) => {
                tracing::warn!(session_id, error = ?err, "frame acquisition failed");
                self.events.emit(TrackerEvent::CaptureFailed {
                    session_id: session_id.to_string(),
                    message: format!("{err:#}"),
                });
                return TickOutcome::CaptureFailed;
            }
        };

        let fingerprint = fingerprint(&frame.bytes);

        let locator = match self.frames.put(session_id, &frame).await {
            Ok(locator) => locator,
            Err(err) => {
                tracing::warn!(session_id, error = ?err, "failed to store frame");
                self.events.emit(TrackerEvent::StorageFailed {
                    session_id: session_id.to_string(),
                    locator: None,
                    message: format!("{err:#}"),
                });
                return TickOutcome::StorageFailed;
            }
        };

        let sample = match self
            .save_sample(session_id, &locator, fingerprint.as_ref(), &frame)
            .await
        {
            Ok(sample) => sample,
            Err(err) => {
                tracing::warn!(
                    session_id,
                    locator = %locator,
                    error = ?err,
                    "failed to record sample after retry, frame kept on disk"
                );
                self.events.emit(TrackerEvent::StorageFailed {
                    session_id: session_id.to_string(),
                    locator: Some(locator),
                    message: format!("{err:#}"),
                });
                return TickOutcome::StorageFailed;
            }
        };

        let sample_count = session.record_sample();
        tracing::info!(session_id, sample_count, locator = %sample.locator, "sample captured");
        self.events.emit(TrackerEvent::SampleCaptured {
            session_id: session_id.to_string(),
            locator: sample.locator.clone(),
            timestamp: sample.captured_at,
        });

        let outcome = gate
            .lock()
            .expect("dedup gate poisoned")
            .check(fingerprint.as_ref());
        if outcome == DedupOutcome::Distinct && !session.is_active() {
            tracing::debug!(session_id, sample_id = %sample.id, "session no longer active, not classifying");
            return TickOutcome::Captured { duplicate: false };
        }

        match self.dispatcher.dispatch(&sample, outcome, &frame).await {
            Ok(Some(analysis)) => session.record_analysis(&analysis),
            Ok(None) => self.analysis_unavailable(&sample, "classifier failed".to_string()),
            Err(err) => {
                tracing::warn!(session_id, sample_id = %sample.id, error = ?err, "failed to save analysis");
                self.analysis_unavailable(&sample, format!("{err:#}"));
            }
        }

        TickOutcome::Captured {
            duplicate: outcome == DedupOutcome::Duplicate,
        }
    }

    /// Record the sample, retrying exactly once.
    async fn save_sample(
        &self,
        session_id: &str,
        locator: &SampleLocator,
        fingerprint: Option<&Fingerprint>,
        frame: &Frame,
    ) -> Result<Sample> {
        match self
            .store
            .save_sample(session_id, locator, fingerprint, frame.captured_at)
            .await
        {
            Ok(sample) => Ok(sample),
            Err(err) => {
                tracing::debug!(session_id, error = ?err, "save_sample failed, retrying once");
                self.store
                    .save_sample(session_id, locator, fingerprint, frame.captured_at)
                    .await
            }
        }
    }

    fn analysis_unavailable(&self, sample: &Sample, message: String) {
        self.events.emit(TrackerEvent::AnalysisUnavailable {
            session_id: sample.session_id.clone(),
            sample_id: sample.id.clone(),
            message,
        });
    }
}
