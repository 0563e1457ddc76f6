use crate::fingerprint::Fingerprint;
use crate::model::{Analysis, NewAnalysis, Sample, SampleLocator, Session, SessionStatus};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Persistence for sessions, samples and analyses.
///
/// Every call may fail; callers propagate failures instead of retrying, except
/// for the single `save_sample` retry done by the capture pipeline.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, owner: &str) -> Result<Session>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// The owner's most recent session that is not completed.
    async fn open_session(&self, owner: &str) -> Result<Option<Session>>;

    async fn list_sessions(&self, owner: &str, limit: usize) -> Result<Vec<Session>>;

    /// Set `ended_at` the first time the session enters `completed`.
    async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<Session>;

    /// Insert a sample and bump the session's `sample_count` in one step.
    async fn save_sample(
        &self,
        session_id: &str,
        locator: &SampleLocator,
        fingerprint: Option<&Fingerprint>,
        captured_at: DateTime<Utc>,
    ) -> Result<Sample>;

    async fn save_analysis(&self, sample_id: &str, analysis: NewAnalysis) -> Result<Analysis>;

    /// Samples in the order they were saved, with their analyses attached.
    async fn list_samples(&self, session_id: &str) -> Result<Vec<Sample>>;
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: Vec<Session>,
    samples: BTreeMap<String, Vec<Sample>>,
}

/// One line of a session's sample log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LogRecord {
    Sample(Sample),
    Analysis(Analysis),
}

#[derive(Debug)]
struct StoreFiles {
    sessions: PathBuf,
    samples_dir: PathBuf,
}

impl StoreFiles {
    fn sample_log(&self, session_id: &str) -> PathBuf {
        self.samples_dir.join(format!("{session_id}.jsonl"))
    }
}

/// Session store kept in memory and, when opened on disk, mirrored to files.
///
/// `sessions.json` holds only the session records and is rewritten when a
/// session is created or changes status. Samples and analyses are appended to
/// `<samples_dir>/<session_id>.jsonl`, one record per line, so a save costs one
/// short write however long the session runs. Sample counts are rebuilt from
/// the logs on open.
#[derive(Debug)]
pub struct LocalStore {
    files: Option<StoreFiles>,
    state: Mutex<StoreState>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            files: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn open(sessions: impl Into<PathBuf>, samples_dir: impl Into<PathBuf>) -> Result<Self> {
        let files = StoreFiles {
            sessions: sessions.into(),
            samples_dir: samples_dir.into(),
        };
        std::fs::create_dir_all(&files.samples_dir).with_context(|| {
            format!("failed to create sample log directory {}", files.samples_dir.display())
        })?;

        let mut state = StoreState::default();
        if files.sessions.exists() {
            let text = std::fs::read_to_string(&files.sessions).with_context(|| {
                format!("failed to read session store {}", files.sessions.display())
            })?;
            state.sessions = serde_json::from_str(&text).with_context(|| {
                format!("failed to parse session store {}", files.sessions.display())
            })?;
        }

        for session in &mut state.sessions {
            let samples = load_sample_log(&files.sample_log(&session.id))?;
            session.sample_count = samples.len() as u64;
            state.samples.insert(session.id.clone(), samples);
        }

        Ok(Self {
            files: Some(files),
            state: Mutex::new(state),
        })
    }

    /// Persist the session list before it replaces the in-memory one.
    async fn write_sessions(&self, sessions: &[Session]) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let path = &files.sessions;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(sessions).context("failed to encode sessions")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write session store {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace session store {}", path.display()))?;
        Ok(())
    }

    async fn append(&self, session_id: &str, record: &LogRecord) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let path = files.sample_log(session_id);
        let mut line = serde_json::to_vec(record).context("failed to encode sample record")?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open sample log {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("failed to append to sample log {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush sample log {}", path.display()))?;
        Ok(())
    }
}

/// Replay a sample log. A line that does not parse, typically the tail of a
/// write cut short by a crash, is skipped.
fn load_sample_log(path: &Path) -> Result<Vec<Sample>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sample log {}", path.display()))?;

    let mut samples: Vec<Sample> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Sample(sample)) => samples.push(sample),
            Ok(LogRecord::Analysis(analysis)) => {
                match samples.iter_mut().find(|s| s.id == analysis.sample_id) {
                    Some(sample) => sample.analysis = Some(analysis),
                    None => tracing::warn!(
                        path = %path.display(),
                        sample_id = %analysis.sample_id,
                        "analysis for unknown sample skipped"
                    ),
                }
            }
            Err(err) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "unreadable sample record skipped"
            ),
        }
    }
    Ok(samples)
}

#[async_trait]
impl SessionStore for LocalStore {
    async fn create_session(&self, owner: &str) -> Result<Session> {
        let mut state = self.state.lock().await;
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            sample_count: 0,
        };

        let mut sessions = state.sessions.clone();
        sessions.push(session.clone());
        self.write_sessions(&sessions).await?;
        state.sessions = sessions;
        state.samples.insert(session.id.clone(), Vec::new());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn open_session(&self, owner: &str) -> Result<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .rev()
            .find(|s| s.owner == owner && s.status.is_open())
            .cloned())
    }

    async fn list_sessions(&self, owner: &str, limit: usize) -> Result<Vec<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .rev()
            .filter(|s| s.owner == owner)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let mut state = self.state.lock().await;
        let mut sessions = state.sessions.clone();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("session {id} not found"))?;
        session.status = status;
        if status == SessionStatus::Completed && session.ended_at.is_none() {
            session.ended_at = Some(Utc::now().max(session.started_at));
        }
        let updated = session.clone();

        self.write_sessions(&sessions).await?;
        state.sessions = sessions;
        Ok(updated)
    }

    async fn save_sample(
        &self,
        session_id: &str,
        locator: &SampleLocator,
        fingerprint: Option<&Fingerprint>,
        captured_at: DateTime<Utc>,
    ) -> Result<Sample> {
        let mut state = self.state.lock().await;
        if !state.sessions.iter().any(|s| s.id == session_id) {
            bail!("session {session_id} not found");
        }

        let sample = Sample {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            captured_at,
            locator: locator.clone(),
            fingerprint: fingerprint.cloned(),
            analysis: None,
        };
        self.append(session_id, &LogRecord::Sample(sample.clone()))
            .await?;

        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.sample_count += 1;
        }
        state
            .samples
            .entry(session_id.to_string())
            .or_default()
            .push(sample.clone());
        Ok(sample)
    }

    async fn save_analysis(&self, sample_id: &str, analysis: NewAnalysis) -> Result<Analysis> {
        let mut state = self.state.lock().await;
        let (session_id, sample) = state
            .samples
            .iter_mut()
            .find_map(|(session_id, samples)| {
                samples
                    .iter_mut()
                    .find(|sample| sample.id == sample_id)
                    .map(|sample| (session_id.clone(), sample))
            })
            .ok_or_else(|| anyhow!("sample {sample_id} not found"))?;
        if sample.analysis.is_some() {
            bail!("sample {sample_id} already has an analysis");
        }

        let analysis = Analysis::from_new(
            Uuid::new_v4().to_string(),
            sample_id.to_string(),
            Utc::now(),
            analysis,
        );
        self.append(&session_id, &LogRecord::Analysis(analysis.clone()))
            .await?;
        sample.analysis = Some(analysis.clone());
        Ok(analysis)
    }

    async fn list_samples(&self, session_id: &str) -> Result<Vec<Sample>> {
        let state = self.state.lock().await;
        Ok(state.samples.get(session_id).cloned().unwrap_or_default())
    }
}
