//! Parameters for the feature endpoints.
//!
//! Each struct serializes to the body its endpoint expects (minus `user_id` and
//! `session_id`, which [`TaskOrchestrator`](crate::TaskOrchestrator) adds).

use crate::task::TaskKind;
use serde::Serialize;

/// A job the feature service knows how to run.
pub trait FeatureJob: Serialize + Send + Sync {
    fn kind(&self) -> TaskKind;
}

macro_rules! feature_job {
    ($ty:ty => $kind:expr) => {
        impl FeatureJob for $ty {
            fn kind(&self) -> TaskKind {
                $kind
            }
        }
    };
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageGeneration {
    pub prompt: String,
    /// `realism` or `artistic`.
    pub model: String,
    pub aspect_ratio: String,
}

impl ImageGeneration {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: "realism".to_string(),
            aspect_ratio: "1:1".to_string(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = ratio.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveBackground {
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Upscale {
    pub image_url: String,
    /// `photo`, `sublime` or `photo_denoiser`.
    pub flavor: String,
}

impl Upscale {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            flavor: "photo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reimagine {
    pub image_url: String,
    pub prompt: String,
    /// `subtle`, `vivid` or `wild`.
    pub imagination: String,
    pub aspect_ratio: String,
}

impl Reimagine {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            prompt: String::new(),
            imagination: "subtle".to_string(),
            aspect_ratio: "1:1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Relight {
    pub image_url: String,
    pub prompt: String,
    pub style: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub reference: Option<LightReference>,
}

/// Transfers lighting from another image.
#[derive(Debug, Clone, Serialize)]
pub struct LightReference {
    #[serde(rename = "reference_image_url")]
    pub image_url: String,
    /// 0.0 to 1.0.
    #[serde(rename = "light_transfer_strength")]
    pub strength: f32,
}

impl Relight {
    pub fn new(image_url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            prompt: prompt.into(),
            style: "standard".to_string(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, image_url: impl Into<String>, strength: f32) -> Self {
        self.reference = Some(LightReference {
            image_url: image_url.into(),
            strength: strength.clamp(0.0, 1.0),
        });
        self
    }
}

/// Outpainting; margins are in pixels.
#[derive(Debug, Clone, Serialize)]
pub struct ImageExpand {
    pub image_url: String,
    pub prompt: String,
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl ImageExpand {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            prompt: String::new(),
            left: 100,
            right: 100,
            top: 50,
            bottom: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StyleTransfer {
    pub image_url: String,
    pub reference_image_url: String,
    pub style_strength: f32,
    pub structure_strength: f32,
    pub is_portrait: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portrait_style: Option<String>,
}

impl StyleTransfer {
    pub fn new(image_url: impl Into<String>, reference_image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            reference_image_url: reference_image_url.into(),
            style_strength: 0.75,
            structure_strength: 0.75,
            is_portrait: false,
            portrait_style: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageToVideo {
    pub image_url: String,
    pub prompt: String,
    pub model: String,
}

impl ImageToVideo {
    pub fn new(image_url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            prompt: prompt.into(),
            model: "wan2.6-i2v".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptToVideo {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Any other feature with the submit/poll shape. `params` must be an object.
#[derive(Debug, Clone, Serialize)]
pub struct CustomJob {
    #[serde(skip)]
    pub path: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

feature_job!(ImageGeneration => TaskKind::ImageGeneration);
feature_job!(RemoveBackground => TaskKind::RemoveBackground);
feature_job!(Upscale => TaskKind::Upscale);
feature_job!(Reimagine => TaskKind::Reimagine);
feature_job!(Relight => TaskKind::Relight);
feature_job!(ImageExpand => TaskKind::ImageExpand);
feature_job!(StyleTransfer => TaskKind::StyleTransfer);
feature_job!(ImageToVideo => TaskKind::ImageToVideo);
feature_job!(PromptToVideo => TaskKind::PromptToVideo);

impl FeatureJob for CustomJob {
    fn kind(&self) -> TaskKind {
        TaskKind::from_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relight_reference_is_flattened_only_when_set() {
        let plain = serde_json::to_value(Relight::new("https://cdn/in.png", "golden hour")).unwrap();
        assert!(plain.get("reference_image_url").is_none());

        let with_ref = Relight::new("https://cdn/in.png", "golden hour")
            .with_reference("https://cdn/ref.png", 1.4);
        let body = serde_json::to_value(&with_ref).unwrap();
        assert_eq!(body["reference_image_url"], "https://cdn/ref.png");
        assert_eq!(body["light_transfer_strength"], 1.0);
        assert_eq!(with_ref.kind(), TaskKind::Relight);
    }

    #[test]
    fn custom_job_uses_its_path_as_kind() {
        let mut params = serde_json::Map::new();
        params.insert("image_url".into(), json!("https://cdn/face.png"));
        let job = CustomJob {
            path: "face-swap".into(),
            params,
        };

        assert_eq!(job.kind(), TaskKind::Custom("face-swap".into()));
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({"image_url": "https://cdn/face.png"})
        );
    }
}
