use crate::model::{SampleLocator, SessionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Notifications pushed to the host; nothing here is polled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackerEvent {
    #[serde(rename_all = "camelCase")]
    SampleCaptured {
        session_id: String,
        locator: SampleLocator,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StateChanged {
        session_id: String,
        status: SessionStatus,
    },
    /// A single acquisition failed; capture continues.
    #[serde(rename_all = "camelCase")]
    CaptureFailed { session_id: String, message: String },
    /// The frame source went away; the scheduler has stopped.
    #[serde(rename_all = "camelCase")]
    CaptureStopped { session_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    AnalysisUnavailable {
        session_id: String,
        sample_id: String,
        message: String,
    },
    /// A frame could not be recorded even after a retry. `locator` is set when
    /// the bytes were written but the sample record was not.
    #[serde(rename_all = "camelCase")]
    StorageFailed {
        session_id: String,
        locator: Option<SampleLocator>,
        message: String,
    },
}

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrackerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget; having no subscriber is not an error.
    pub fn emit(&self, event: TrackerEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, TrackerEvent};
    use crate::model::{SampleLocator, SessionStatus};
    use chrono::{TimeZone, Utc};

    #[test]
    fn serializes_externally_tagged() {
        let event = TrackerEvent::SampleCaptured {
            session_id: "s1".to_string(),
            locator: SampleLocator::new("captures/a.png"),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert!(json.get("type").is_none());
        assert_eq!(json["sampleCaptured"]["sessionId"], "s1");
        assert_eq!(json["sampleCaptured"]["locator"], "captures/a.png");
        assert_eq!(json["sampleCaptured"]["timestamp"], "2026-01-02T03:04:05Z");

        let json = serde_json::to_value(TrackerEvent::StateChanged {
            session_id: "s1".to_string(),
            status: SessionStatus::Paused,
        })
        .expect("serialize");
        assert_eq!(json["stateChanged"]["status"], "paused");
        assert_eq!(json.as_object().map(|o| o.len()), Some(1));
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(TrackerEvent::CaptureFailed {
            session_id: "s1".to_string(),
            message: "nope".to_string(),
        });

        let mut rx = bus.subscribe();
        bus.emit(TrackerEvent::StateChanged {
            session_id: "s1".to_string(),
            status: SessionStatus::Active,
        });
        assert!(matches!(
            rx.recv().await.expect("event"),
            TrackerEvent::StateChanged { .. }
        ));
    }
}
