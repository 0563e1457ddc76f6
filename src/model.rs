use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, SessionStatus::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bounded period of observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sample_count: u64,
}

impl Session {
    pub fn duration(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        self.ended_at.unwrap_or(now) - self.started_at
    }
}

/// Opaque pointer to where a frame's bytes were stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleLocator(String);

impl SampleLocator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub session_id: String,
    pub captured_at: DateTime<Utc>,
    pub locator: SampleLocator,
    /// `None` when no dedup check was possible for this frame.
    pub fingerprint: Option<Fingerprint>,
    pub analysis: Option<Analysis>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Coding,
    Browsing,
    Documentation,
    Communication,
    Meeting,
    Design,
    Entertainment,
    #[default]
    Other,
}

impl ActivityType {
    pub const ALL: [ActivityType; 8] = [
        ActivityType::Coding,
        ActivityType::Browsing,
        ActivityType::Documentation,
        ActivityType::Communication,
        ActivityType::Meeting,
        ActivityType::Design,
        ActivityType::Entertainment,
        ActivityType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Coding => "coding",
            ActivityType::Browsing => "browsing",
            ActivityType::Documentation => "documentation",
            ActivityType::Communication => "communication",
            ActivityType::Meeting => "meeting",
            ActivityType::Design => "design",
            ActivityType::Entertainment => "entertainment",
            ActivityType::Other => "other",
        }
    }

    /// Lenient parse for classifier output; anything unrecognized is `Other`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or(ActivityType::Other)
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        ActivityType::ALL
            .into_iter()
            .find(|activity| activity.as_str() == normalized)
            .ok_or_else(|| format!("unknown activity type '{value}'"))
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const UNCHANGED_APP_NAME: &str = "Screen unchanged";
pub const UNCHANGED_DESCRIPTION: &str = "Unchanged since previous sample";

/// Classification result before the store assigns it to a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAnalysis {
    pub app_name: String,
    pub activity_type: ActivityType,
    pub description: String,
    pub detailed_content: Option<String>,
    pub tags: Vec<String>,
    pub confidence: f32,
    pub raw_response: Option<String>,
}

impl NewAnalysis {
    /// The fixed analysis attached to a sample whose content matches the previous one.
    pub fn unchanged() -> Self {
        Self {
            app_name: UNCHANGED_APP_NAME.to_string(),
            activity_type: ActivityType::Other,
            description: UNCHANGED_DESCRIPTION.to_string(),
            detailed_content: None,
            tags: Vec::new(),
            confidence: 1.0,
            raw_response: None,
        }
    }

    /// Clamp confidence into [0, 1] and drop blank or repeated tags.
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut tags: Vec<String> = Vec::with_capacity(self.tags.len());
        for tag in self.tags {
            let tag = tag.trim().to_string();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        self.tags = tags;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub sample_id: String,
    pub app_name: String,
    pub activity_type: ActivityType,
    pub description: String,
    pub detailed_content: Option<String>,
    pub tags: Vec<String>,
    pub confidence: f32,
    pub raw_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Analysis {
    pub fn from_new(
        id: String,
        sample_id: String,
        created_at: DateTime<Utc>,
        analysis: NewAnalysis,
    ) -> Self {
        let analysis = analysis.normalized();
        Self {
            id,
            sample_id,
            app_name: analysis.app_name,
            activity_type: analysis.activity_type,
            description: analysis.description,
            detailed_content: analysis.detailed_content,
            tags: analysis.tags,
            confidence: analysis.confidence,
            raw_response: analysis.raw_response,
            created_at,
        }
    }

    pub fn is_unchanged_sentinel(&self) -> bool {
        self.activity_type == ActivityType::Other
            && self.confidence == 1.0
            && self.app_name == UNCHANGED_APP_NAME
            && self.description == UNCHANGED_DESCRIPTION
    }
}

#[cfg(test)]
mod tests {
    use super::{ActivityType, NewAnalysis, SessionStatus};

    #[test]
    fn activity_types_parse_case_insensitively() {
        assert_eq!("Coding".parse::<ActivityType>(), Ok(ActivityType::Coding));
        assert_eq!(ActivityType::parse_lenient(" meeting "), ActivityType::Meeting);
        assert_eq!(ActivityType::parse_lenient("gaming"), ActivityType::Other);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Paused).expect("serialize");
        assert_eq!(json, "\"paused\"");
    }

    #[test]
    fn normalizes_confidence_and_tags() {
        let analysis = NewAnalysis {
            app_name: "Editor".to_string(),
            activity_type: ActivityType::Coding,
            description: "editing".to_string(),
            detailed_content: None,
            tags: vec!["rust".into(), " ".into(), "rust".into(), "tests".into()],
            confidence: 1.7,
            raw_response: None,
        }
        .normalized();

        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.tags, vec!["rust".to_string(), "tests".to_string()]);
    }
}
