use crate::frame::Frame;
use crate::model::{ActivityType, NewAnalysis};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Turns a frame into a structured label. One attempt per sample; a failure
/// leaves the sample unanalyzed.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, frame: &Frame) -> Result<NewAnalysis>;
}

/// Records what can be known without looking at the pixels.
#[derive(Debug, Clone)]
pub struct MetadataClassifier;

#[async_trait]
impl Classifier for MetadataClassifier {
    async fn classify(&self, frame: &Frame) -> Result<NewAnalysis> {
        let format = frame
            .format()
            .map(|format| format!("{format:?}").to_ascii_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        let description = match frame.dimensions() {
            Some((width, height)) => format!(
                "Captured {width}x{height} {format} frame ({} bytes).",
                frame.bytes.len()
            ),
            None => format!("Captured {format} frame ({} bytes).", frame.bytes.len()),
        };

        Ok(NewAnalysis {
            app_name: String::new(),
            activity_type: ActivityType::Other,
            description,
            detailed_content: None,
            tags: vec![format],
            confidence: 0.0,
            raw_response: None,
        })
    }
}

pub const DEFAULT_PROMPT: &str = "You are labelling a screenshot of someone's work. Reply with a single JSON object and nothing else, with keys: \
app_name (the application in focus), \
activity_type (one of coding, browsing, documentation, communication, meeting, design, entertainment, other), \
description (one short sentence), \
detailed_content (what is being worked on, in a few sentences), \
tags (array of short keywords), \
confidence (number between 0 and 1).";

#[derive(Debug, Clone)]
pub struct OpenAiClassifier {
    client: Client,
    api_key: String,
    model: String,
    prompt: String,
}

/// Upper bound for one classification request, so a stuck call cannot hold a
/// capture tick forever.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

impl OpenAiClassifier {
    pub fn new(api_key: String, model: String, prompt: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
            prompt,
        })
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, frame: &Frame) -> Result<NewAnalysis> {
        let base64_image = general_purpose::STANDARD.encode(&frame.bytes);
        let data_url = format!("data:{};base64,{base64_image}", frame.mime_type());

        let body = json!({
            "model": self.model,
            "input": [
                {
                    "role": "user",
                    "content": [
                        {"type": "input_text", "text": self.prompt},
                        {"type": "input_image", "image_url": data_url}
                    ]
                }
            ]
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/responses")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to call OpenAI Responses API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {status}: {body}");
        }

        let json: Value = response
            .json()
            .await
            .context("failed to decode OpenAI response JSON")?;

        let Some(text) = extract_text(&json) else {
            let message = json
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("no textual output returned by model");
            bail!("OpenAI response had no analysis: {message}");
        };

        parse_analysis(&text)
    }
}

fn extract_text(root: &Value) -> Option<String> {
    if let Some(value) = root.get("output_text") {
        if let Some(text) = value.as_str() {
            return Some(text.to_string());
        }
    }

    let output = root.get("output")?.as_array()?;
    let mut fragments = Vec::new();

    for item in output {
        let content = item.get("content").and_then(Value::as_array);
        if let Some(content_parts) = content {
            for part in content_parts {
                let part_type = part.get("type").and_then(Value::as_str).unwrap_or_default();
                if matches!(part_type, "output_text" | "text") {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        fragments.push(text.trim().to_string());
                    }
                }
            }
        }
    }

    if fragments.is_empty() {
        None
    } else {
        Some(fragments.join("\n"))
    }
}

#[derive(Debug, Deserialize)]
struct ModelAnalysis {
    #[serde(default)]
    app_name: String,
    #[serde(default)]
    activity_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    detailed_content: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Pull the first JSON object out of the model's reply, tolerating code fences
/// and prose around it.
fn parse_analysis(text: &str) -> Result<NewAnalysis> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        bail!("model reply contains no JSON object");
    };
    if end < start {
        bail!("model reply contains no JSON object");
    }

    let parsed: ModelAnalysis = serde_json::from_str(&text[start..=end])
        .context("model reply is not a valid analysis object")?;

    Ok(NewAnalysis {
        app_name: parsed.app_name.trim().to_string(),
        activity_type: ActivityType::parse_lenient(&parsed.activity_type),
        description: parsed.description.trim().to_string(),
        detailed_content: parsed
            .detailed_content
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty()),
        tags: parsed.tags,
        confidence: parsed.confidence.unwrap_or(0.5),
        raw_response: Some(text.to_string()),
    }
    .normalized())
}

#[cfg(test)]
mod tests {
    use super::{Classifier, MetadataClassifier, OpenAiClassifier, extract_text, parse_analysis};
    use crate::frame::{FrameSource, SyntheticFrameSource};
    use crate::model::ActivityType;
    use serde_json::json;

    #[test]
    fn extracts_output_text_field_when_present() {
        let value = json!({"output_text": "summary"});
        assert_eq!(extract_text(&value), Some("summary".to_string()));
    }

    #[test]
    fn extracts_text_from_output_content() {
        let value = json!({
            "output": [
                {
                    "content": [
                        {"type": "output_text", "text": "line 1"},
                        {"type": "text", "text": "line 2"}
                    ]
                }
            ]
        });
        assert_eq!(extract_text(&value), Some("line 1\nline 2".to_string()));
    }

    #[test]
    fn parses_fenced_json_reply() {
        let reply = "```json\n{\"app_name\": \"VS Code\", \"activity_type\": \"Coding\", \
            \"description\": \"Editing main.rs\", \"tags\": [\"rust\", \"rust\"], \"confidence\": 0.92}\n```";
        let analysis = parse_analysis(reply).expect("parse");

        assert_eq!(analysis.app_name, "VS Code");
        assert_eq!(analysis.activity_type, ActivityType::Coding);
        assert_eq!(analysis.tags, vec!["rust".to_string()]);
        assert!((analysis.confidence - 0.92).abs() < f32::EPSILON);
        assert_eq!(analysis.raw_response.as_deref(), Some(reply));
    }

    #[test]
    fn unknown_activity_and_wild_confidence_are_normalized() {
        let analysis = parse_analysis(
            r#"{"app_name":"Steam","activity_type":"gaming","description":"","confidence":4}"#,
        )
        .expect("parse");
        assert_eq!(analysis.activity_type, ActivityType::Other);
        assert_eq!(analysis.confidence, 1.0);
    }

    #[test]
    fn rejects_replies_without_json() {
        assert!(parse_analysis("I cannot see the screen").is_err());
        assert!(parse_analysis("} backwards {").is_err());
    }

    #[tokio::test]
    async fn metadata_classifier_describes_the_frame() {
        let source = SyntheticFrameSource::solid_colors(&[[1, 2, 3]]).expect("source");
        let frame = source.acquire().await.expect("frame");

        let analysis = MetadataClassifier.classify(&frame).await.expect("classify");
        assert_eq!(analysis.activity_type, ActivityType::Other);
        assert!(analysis.description.contains("8x8 png"));
    }

    #[test]
    fn openai_client_builds_with_timeout() {
        let classifier = OpenAiClassifier::new(
            "sk-test".to_string(),
            "gpt-5".to_string(),
            "label it".to_string(),
        )
        .expect("client");
        assert_eq!(classifier.model, "gpt-5");
    }
}
