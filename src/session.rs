use crate::error::{TrackerError, TrackerResult};
use crate::model::{Analysis, Session, SessionStatus};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Complete,
}

impl SessionCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            SessionCommand::Pause => "pause",
            SessionCommand::Resume => "resume",
            SessionCommand::Complete => "complete",
        }
    }
}

/// The only transitions a session accepts.
///
/// `completed` is terminal; every other combination is rejected with
/// [`TrackerError::InvalidState`].
pub fn next_status(current: SessionStatus, command: SessionCommand) -> TrackerResult<SessionStatus> {
    match (current, command) {
        (SessionStatus::Active, SessionCommand::Pause) => Ok(SessionStatus::Paused),
        (SessionStatus::Paused, SessionCommand::Resume) => Ok(SessionStatus::Active),
        (SessionStatus::Active | SessionStatus::Paused, SessionCommand::Complete) => {
            Ok(SessionStatus::Completed)
        }
        (status, command) => Err(TrackerError::InvalidState {
            action: command.verb(),
            status,
        }),
    }
}

/// Shared view of the current session.
///
/// The tracker owns the transitions; the scheduler and its ticks only read the
/// status and bump the sample counter.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<Session>>,
    activity: Arc<RwLock<Option<String>>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
            activity: Arc::new(RwLock::new(None)),
        }
    }

    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.read().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn sample_count(&self) -> u64 {
        self.read().sample_count
    }

    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    /// Validate a command against the current status without applying it.
    pub fn plan(&self, command: SessionCommand) -> TrackerResult<SessionStatus> {
        next_status(self.status(), command)
    }

    /// Adopt the persisted result of a transition.
    ///
    /// The local counter never goes backwards: ticks that landed while the
    /// store call was in flight are already reflected here.
    pub fn apply(&self, persisted: Session) {
        let mut session = self.write();
        let sample_count = session.sample_count.max(persisted.sample_count);
        *session = Session {
            sample_count,
            ..persisted
        };
    }

    pub fn record_sample(&self) -> u64 {
        let mut session = self.write();
        session.sample_count += 1;
        session.sample_count
    }

    /// Description of the latest real analysis. The unchanged sentinel keeps
    /// the previous one since the screen still shows it.
    pub fn record_analysis(&self, analysis: &Analysis) {
        if analysis.is_unchanged_sentinel() {
            return;
        }
        *self.activity.write().expect("activity lock poisoned") = Some(analysis.description.clone());
    }

    pub fn current_activity(&self) -> Option<String> {
        self.activity.read().expect("activity lock poisoned").clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.inner.read().expect("session lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.inner.write().expect("session lock poisoned")
    }
}
