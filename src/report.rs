use crate::model::{ActivityType, Session};
use crate::timeline::{ActivityShare, TimelineBucket};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What a completed session looked like.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: Session,
    pub buckets: Vec<TimelineBucket>,
    pub breakdown: BTreeMap<ActivityType, ActivityShare>,
}

/// Called once a session has been completed.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn session_completed(&self, report: &SessionReport) -> Result<()>;
}

/// Appends one Markdown section per completed session.
#[derive(Debug, Clone)]
pub struct MarkdownReport {
    path: PathBuf,
}

impl MarkdownReport {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReportSink for MarkdownReport {
    async fn session_completed(&self, report: &SessionReport) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| {
                format!("failed to create report directory {}", parent.display())
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open report file {}", self.path.display()))?;
        file.write_all(render(report).as_bytes())
            .with_context(|| format!("failed to write report file {}", self.path.display()))?;
        Ok(())
    }
}

pub fn render(report: &SessionReport) -> String {
    let session = &report.session;
    let ended_at = session.ended_at.unwrap_or_else(Utc::now);
    let minutes = session.duration(ended_at).num_minutes();

    let mut out = String::new();
    out.push_str(&format!("## Session {}\n", session.id));
    out.push_str(&format!("- Started: {}\n", session.started_at.to_rfc3339()));
    out.push_str(&format!("- Ended: {}\n", ended_at.to_rfc3339()));
    out.push_str(&format!("- Duration: {minutes} min\n"));
    out.push_str(&format!("- Samples: {}\n", session.sample_count));

    if !report.buckets.is_empty() {
        out.push_str("\n### Timeline\n");
        for bucket in &report.buckets {
            let app = if bucket.dominant_app.is_empty() {
                "unknown app"
            } else {
                bucket.dominant_app.as_str()
            };
            out.push_str(&format!(
                "- {}: {} in {} ({} samples)\n",
                bucket.label,
                bucket.dominant_activity,
                app,
                bucket.samples.len()
            ));
        }
    }

    if !report.breakdown.is_empty() {
        out.push_str("\n### Breakdown\n");
        for (activity, share) in &report.breakdown {
            out.push_str(&format!(
                "- {activity}: {:.1} min ({:.0}%)\n",
                share.duration_minutes, share.percentage
            ));
        }
    }

    out.push('\n');
    out
}
