//! Host-facing entry point.
//!
//! A [`Tracker`] owns the current session, the scheduler attached to it and the
//! shared frame source. Every control call validates the transition, persists
//! it, and only then changes what the scheduler is doing.

use crate::classifier::Classifier;
use crate::config::{DEFAULT_INTERVAL, TrackerConfig};
use crate::dedup::DedupGate;
use crate::dispatcher::AnalysisDispatcher;
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventBus, TrackerEvent};
use crate::frame::FrameSource;
use crate::frame_lease::SharedFrameSource;
use crate::frame_store::{DiskFrameStore, FrameStore};
use crate::model::{ActivityType, Session, SessionStatus};
use crate::pipeline::CapturePipeline;
use crate::report::{MarkdownReport, ReportSink, SessionReport};
use crate::scheduler::{CaptureRun, CaptureScheduler, CaptureStats, StoppingRun};
use crate::session::{SessionCommand, SessionHandle};
use crate::store::{LocalStore, SessionStore};
use crate::timeline::{self, ActivityShare, TimelineBucket};
use anyhow::Context;
use chrono::TimeDelta;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatus {
    pub is_active: bool,
    pub sample_count: u64,
    pub session_id: Option<String>,
    pub status: Option<SessionStatus>,
    /// False for an active session whose frame source went away.
    pub capturing: bool,
    /// Description of the latest analysis seen by this process.
    pub current_activity: Option<String>,
}

#[derive(Default)]
struct Current {
    session: Option<SessionHandle>,
    gate: Arc<Mutex<DedupGate>>,
    scheduler: CaptureScheduler,
}

pub struct Tracker {
    owner: String,
    interval: Duration,
    granularity: TimeDelta,
    source: SharedFrameSource,
    store: Arc<dyn SessionStore>,
    pipeline: CapturePipeline,
    events: EventBus,
    report: Option<Arc<dyn ReportSink>>,
    current: tokio::sync::Mutex<Current>,
}

impl Tracker {
    pub fn new(
        owner: impl Into<String>,
        source: SharedFrameSource,
        frames: Arc<dyn FrameStore>,
        store: Arc<dyn SessionStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let events = EventBus::new();
        let dispatcher = AnalysisDispatcher::new(classifier, Arc::clone(&store));
        let pipeline = CapturePipeline::new(frames, Arc::clone(&store), dispatcher, events.clone());
        Self {
            owner: owner.into(),
            interval: DEFAULT_INTERVAL,
            granularity: timeline::default_granularity(),
            source,
            store,
            pipeline,
            events,
            report: None,
            current: tokio::sync::Mutex::new(Current::default()),
        }
    }

    /// Wire a tracker from a config: JSON store, capture directory and lock
    /// file under `data_dir`, plus the Markdown report when enabled.
    pub fn from_config(
        config: &TrackerConfig,
        source: Arc<dyn FrameSource>,
        classifier: Arc<dyn Classifier>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;

        let store = Arc::new(LocalStore::open(config.store_path(), config.samples_dir())?);
        let frames = Arc::new(DiskFrameStore::new(
            config.captures_dir(),
            config.min_free_disk_bytes,
        ));
        let source = SharedFrameSource::new(source).with_lock_file(config.lock_path());

        let mut tracker = Tracker::new(config.owner.clone(), source, frames, store, classifier)
            .with_interval(config.interval)
            .with_granularity(config.granularity());
        if config.report {
            tracker = tracker.with_report_sink(Arc::new(MarkdownReport::new(config.report_path())));
        }
        Ok(tracker)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_granularity(mut self, granularity: TimeDelta) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report = Some(sink);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub async fn start_session(&self) -> TrackerResult<Session> {
        if self.interval.is_zero() {
            return Err(TrackerError::InvalidConfig(
                "interval must be greater than 0".to_string(),
            ));
        }

        let mut current = self.current.lock().await;
        if let Some(handle) = &current.session
            && handle.status().is_open()
        {
            return Err(TrackerError::Conflict {
                session_id: handle.id(),
            });
        }
        if let Some(open) = self.store.open_session(&self.owner).await?
            && open.status == SessionStatus::Active
        {
            return Err(TrackerError::Conflict {
                session_id: open.id,
            });
        }

        self.reclaim_orphaned_source().await?;
        self.ensure_source_free()?;

        let session = self.store.create_session(&self.owner).await?;
        let lease = match self.source.claim(&session.id) {
            Ok(lease) => lease,
            Err(err) => {
                // Lost a race for the source; do not leave an active session behind.
                if let Err(store_err) = self
                    .store
                    .update_session_status(&session.id, SessionStatus::Completed)
                    .await
                {
                    tracing::warn!(session_id = %session.id, error = ?store_err, "failed to close unstartable session");
                }
                return Err(err);
            }
        };

        let handle = SessionHandle::new(session.clone());
        current.gate = Arc::new(Mutex::new(DedupGate::new()));
        current.session = Some(handle.clone());
        let run = CaptureRun {
            session: handle,
            lease,
            gate: Arc::clone(&current.gate),
            pipeline: self.pipeline.clone(),
        };
        current.scheduler.start(run, self.interval)?;

        tracing::info!(session_id = %session.id, owner = %self.owner, "session started");
        self.emit_state(&session);
        Ok(session)
    }

    /// Pause capture. The lock on the current session is released before
    /// in-flight ticks are awaited, so a slow classifier only delays this call.
    pub async fn pause_session(&self) -> TrackerResult<Session> {
        let (session, stopping) = {
            let mut current = self.current.lock().await;
            let handle = current.session.clone().ok_or(TrackerError::NoSession)?;
            let session = self.transition(&handle, SessionCommand::Pause).await?;
            (session, current.scheduler.cancel())
        };
        self.emit_state(&session);
        drain(stopping).await;
        Ok(session)
    }

    /// Resume capture. Fails with `CaptureUnavailable` while a tick from
    /// before the pause still holds the frame source.
    pub async fn resume_session(&self) -> TrackerResult<Session> {
        let mut current = self.current.lock().await;
        let handle = current.session.clone().ok_or(TrackerError::NoSession)?;
        handle.plan(SessionCommand::Resume)?;

        self.reclaim_orphaned_source().await?;
        let lease = self.source.claim(&handle.id())?;
        let session = self.transition(&handle, SessionCommand::Resume).await?;

        let run = CaptureRun {
            session: handle,
            lease,
            gate: Arc::clone(&current.gate),
            pipeline: self.pipeline.clone(),
        };
        current.scheduler.start(run, self.interval)?;
        drop(current);
        self.emit_state(&session);
        Ok(session)
    }

    /// Complete the session, wait for in-flight ticks, then hand its summary
    /// to the report sink. A failing report is logged and does not undo the
    /// completion.
    pub async fn end_session(&self) -> TrackerResult<Session> {
        let (session, stopping) = {
            let mut current = self.current.lock().await;
            let handle = current.session.clone().ok_or(TrackerError::NoSession)?;
            let session = self.transition(&handle, SessionCommand::Complete).await?;
            (session, current.scheduler.cancel())
        };
        self.emit_state(&session);
        if let Some(stats) = drain(stopping).await {
            tracing::debug!(session_id = %session.id, captures = stats.captures, "capture stopped for completion");
        }

        if let Some(sink) = &self.report {
            match self.session_report(&session).await {
                Ok(report) => {
                    if let Err(err) = sink.session_completed(&report).await {
                        tracing::warn!(session_id = %session.id, error = ?err, "failed to write session report");
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id = %session.id, error = %err, "failed to build session report");
                }
            }
        }
        Ok(session)
    }

    pub async fn status(&self) -> TrackerStatus {
        let current = self.current.lock().await;
        match &current.session {
            Some(handle) => {
                let session = handle.snapshot();
                TrackerStatus {
                    is_active: session.status == SessionStatus::Active,
                    sample_count: session.sample_count,
                    session_id: Some(session.id),
                    status: Some(session.status),
                    capturing: current.scheduler.is_running(),
                    current_activity: handle.current_activity(),
                }
            }
            None => TrackerStatus {
                is_active: false,
                sample_count: 0,
                session_id: None,
                status: None,
                capturing: false,
                current_activity: None,
            },
        }
    }

    /// Adopt the owner's open session left by an earlier process. An `active`
    /// one comes back `paused` since nothing is capturing for it.
    pub async fn recover(&self) -> TrackerResult<Option<Session>> {
        let mut current = self.current.lock().await;
        if let Some(handle) = &current.session
            && handle.status().is_open()
        {
            return Ok(Some(handle.snapshot()));
        }

        let Some(mut session) = self.store.open_session(&self.owner).await? else {
            return Ok(None);
        };
        if session.status == SessionStatus::Active {
            session = self
                .store
                .update_session_status(&session.id, SessionStatus::Paused)
                .await?;
            self.emit_state(&session);
        }
        tracing::info!(session_id = %session.id, status = %session.status, "recovered session");

        current.gate = Arc::new(Mutex::new(DedupGate::new()));
        current.session = Some(SessionHandle::new(session.clone()));
        Ok(Some(session))
    }

    pub async fn sessions(&self, limit: usize) -> TrackerResult<Vec<Session>> {
        Ok(self.store.list_sessions(&self.owner, limit).await?)
    }

    pub async fn timeline(&self, session_id: &str) -> TrackerResult<Vec<TimelineBucket>> {
        self.require_session(session_id).await?;
        let samples = self.store.list_samples(session_id).await?;
        Ok(timeline::aggregate(&samples, self.granularity))
    }

    pub async fn breakdown(
        &self,
        session_id: &str,
    ) -> TrackerResult<BTreeMap<ActivityType, ActivityShare>> {
        self.require_session(session_id).await?;
        let samples = self.store.list_samples(session_id).await?;
        Ok(timeline::activity_breakdown(&samples, self.interval))
    }

    async fn transition(
        &self,
        handle: &SessionHandle,
        command: SessionCommand,
    ) -> TrackerResult<Session> {
        let next = handle.plan(command)?;
        let persisted = self.store.update_session_status(&handle.id(), next).await?;
        handle.apply(persisted);
        let session = handle.snapshot();
        tracing::info!(session_id = %session.id, status = %session.status, "session {}", command.verb());
        Ok(session)
    }

    async fn session_report(&self, session: &Session) -> anyhow::Result<SessionReport> {
        let samples = self.store.list_samples(&session.id).await?;
        Ok(SessionReport {
            session: session.clone(),
            buckets: timeline::aggregate(&samples, self.granularity),
            breakdown: timeline::activity_breakdown(&samples, self.interval),
        })
    }

    async fn require_session(&self, session_id: &str) -> TrackerResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| TrackerError::UnknownSession {
                session_id: session_id.to_string(),
            })
    }

    /// A lock file naming a session that is no longer `active` was left by a
    /// process that never released it.
    async fn reclaim_orphaned_source(&self) -> TrackerResult<()> {
        let Some(holder) = self.source.lock_file_holder()? else {
            return Ok(());
        };
        let still_active = self
            .store
            .get_session(&holder)
            .await?
            .is_some_and(|session| session.status == SessionStatus::Active);
        if !still_active {
            self.source.reclaim(&holder)?;
        }
        Ok(())
    }

    fn ensure_source_free(&self) -> TrackerResult<()> {
        let holder = match self.source.holder() {
            Some(holder) => Some(holder),
            None => self.source.lock_file_holder()?,
        };
        match holder {
            Some(holder) => Err(TrackerError::CaptureUnavailable(format!(
                "frame source is held by session {holder}"
            ))),
            None => Ok(()),
        }
    }

    fn emit_state(&self, session: &Session) {
        self.events.emit(TrackerEvent::StateChanged {
            session_id: session.id.clone(),
            status: session.status,
        });
    }
}

async fn drain(stopping: Option<StoppingRun>) -> Option<CaptureStats> {
    let stopping = stopping?;
    tracing::debug!(session_id = stopping.session_id(), "waiting for in-flight ticks");
    Some(stopping.finished().await)
}
