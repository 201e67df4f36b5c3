//! Result payloads of the feature endpoints.

use super::TaskArtifact;
use serde::Deserialize;
use serde_json::Value;

/// `result` of a submission.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitResult {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub media: MediaFields,
}

/// `result` of a status check.
#[derive(Debug, Default, Deserialize)]
pub struct StatusResult {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub media: MediaFields,
}

/// The places a finished job may put its output.
#[derive(Debug, Default, Deserialize)]
pub struct MediaFields {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub uploaded_urls: Vec<String>,
}

impl MediaFields {
    pub fn is_empty(&self) -> bool {
        self.image_url.is_none()
            && self.output_url.is_none()
            && self.video_url.is_none()
            && self.uploaded_urls.is_empty()
    }

    /// `image_url`, then `output_url`, then the first uploaded URL.
    pub fn into_artifact(self, payload: Value) -> TaskArtifact {
        let image_url = self
            .image_url
            .or(self.output_url)
            .or_else(|| self.uploaded_urls.into_iter().next());
        TaskArtifact {
            image_url,
            video_url: self.video_url,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifact_falls_back_through_url_fields() {
        let raw = json!({"status": "COMPLETED", "uploaded_urls": ["https://cdn/a.png", "https://cdn/b.png"]});
        let parsed: StatusResult = serde_json::from_value(raw.clone()).unwrap();
        let artifact = parsed.media.into_artifact(raw);
        assert_eq!(artifact.url(), Some("https://cdn/a.png"));

        let raw = json!({"output_url": "https://cdn/o.png", "video_url": "https://cdn/v.mp4"});
        let parsed: StatusResult = serde_json::from_value(raw.clone()).unwrap();
        let artifact = parsed.media.into_artifact(raw);
        assert_eq!(artifact.image_url.as_deref(), Some("https://cdn/o.png"));
        assert_eq!(artifact.url(), Some("https://cdn/v.mp4"));
    }

    #[test]
    fn submit_without_anything_is_empty() {
        let parsed: SubmitResult = serde_json::from_value(json!({"queued": true})).unwrap();
        assert!(parsed.task_id.is_none());
        assert!(parsed.media.is_empty());
    }
}
