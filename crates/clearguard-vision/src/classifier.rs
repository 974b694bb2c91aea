//! Remote vision classification client.
//!
//! Sends one frame per call to a chat-completions style endpoint and turns
//! the free-text reply into a [`Classification`]. The reply format is not
//! guaranteed, so extraction is deliberately tolerant: marker keywords flag
//! explicit content, an "N/10" substring supplies the severity, and fixed
//! defaults cover replies with no usable number. All of that lives behind
//! [`parse_verdict`] so a structured API can replace it without touching
//! any caller.
//!
//! A failed call is a non-decision, never "safe": the result carries the
//! error and `explicit == false`, and the coordinator ignores it.

use crate::frame::{Frame, PixelFormat};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clearguard_policy::PolicyStore;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage, RgbaImage};
use once_cell::sync::Lazy;
use std::future::Future;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Instruction sent alongside every frame.
const INSTRUCTION: &str = "Check if this image contains any adult, NSFW, nudity, or sexual \
     content. Rate the image on a scale of 0-10 where 0 is completely safe and 10 is explicit \
     content.";

/// Keywords that flag an explicit verdict in the reply text.
const MARKER_KEYWORDS: &[&str] = &["explicit", "nudity", "sexual", "adult content"];

/// Severity assumed when markers matched but no score was given.
const DEFAULT_EXPLICIT_SCORE: f32 = 0.8;

/// Severity assumed when neither markers nor a score were found.
const DEFAULT_SAFE_SCORE: f32 = 0.1;

static MARKERS: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(MARKER_KEYWORDS)
        .expect("marker keyword automaton")
});

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Chat-completions endpoint.
    pub endpoint: String,
    /// Model name sent in the payload.
    pub model: String,
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Frames are downsized until neither dimension exceeds this.
    pub max_dimension: u32,
    /// JPEG quality for the submitted image.
    pub jpeg_quality: u8,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.deepseek.com/v1/chat/completions".to_string(),
            model: "deepseek-vl".to_string(),
            request_timeout: Duration::from_secs(10),
            max_dimension: 1024,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ClassifyError {
    #[error("no classifier credential configured")]
    MissingCredential,

    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("classification timed out")]
    Timeout,

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("malformed endpoint response: {0}")]
    Parse(String),
}

/// Verdict for one frame. Immutable once produced.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Whether the reply flagged explicit content.
    pub explicit: bool,
    /// Normalized severity in [0, 1].
    pub score: f32,
    /// Raw reply text, when one was received.
    pub detail: Option<String>,
    /// Set when the call failed; such a result is a non-decision.
    pub error: Option<ClassifyError>,
}

impl Classification {
    /// A usable verdict, as opposed to a failed call.
    pub fn is_conclusive(&self) -> bool {
        self.error.is_none()
    }

    fn inconclusive(error: ClassifyError) -> Self {
        Self {
            explicit: false,
            score: 0.0,
            detail: None,
            error: Some(error),
        }
    }
}

/// Classification seam the sampler works against.
pub trait Classify: Send + Sync {
    fn classify(&self, frame: Frame) -> impl Future<Output = Classification> + Send;
}

/// Client for the remote classification endpoint.
pub struct VisionClassifier {
    config: ClassifierConfig,
    policy: PolicyStore,
    http: reqwest::Client,
}

impl VisionClassifier {
    pub fn new(config: ClassifierConfig, policy: PolicyStore) -> Result<Self, ClassifyError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClassifyError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            policy,
            http,
        })
    }

    /// Classifies one frame. Blocking up to the request timeout; never
    /// retries, since the sampling cadence is the retry mechanism.
    pub async fn classify(&self, frame: Frame) -> Classification {
        let key = self.policy.snapshot().classifier_key.clone();
        if key.is_empty() {
            return Classification::inconclusive(ClassifyError::MissingCredential);
        }

        let max_dimension = self.config.max_dimension;
        let quality = self.config.jpeg_quality;
        let encoded =
            tokio::task::spawn_blocking(move || encode_frame(frame, max_dimension, quality))
                .await
                .unwrap_or_else(|e| Err(ClassifyError::Encode(e.to_string())));
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("frame encoding failed: {}", err);
                return Classification::inconclusive(err);
            }
        };

        let payload = serde_json::json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": INSTRUCTION },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", encoded) },
                    },
                ],
            }],
        });

        let response = match self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&key)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                warn!("classification request timed out");
                return Classification::inconclusive(ClassifyError::Timeout);
            }
            Err(err) => {
                warn!("classification request failed: {}", err);
                return Classification::inconclusive(ClassifyError::Transport(err.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("classification endpoint returned {}", status);
            return Classification::inconclusive(ClassifyError::Status(status.as_u16()));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                return Classification::inconclusive(ClassifyError::Parse(err.to_string()));
            }
        };
        let Some(content) = body["choices"][0]["message"]["content"].as_str() else {
            return Classification::inconclusive(ClassifyError::Parse(
                "missing choices[0].message.content".to_string(),
            ));
        };

        let (explicit, score) = parse_verdict(content);
        debug!("classification verdict: explicit={} score={}", explicit, score);
        Classification {
            explicit,
            score,
            detail: Some(content.to_string()),
            error: None,
        }
    }
}

impl Classify for VisionClassifier {
    fn classify(&self, frame: Frame) -> impl Future<Output = Classification> + Send {
        VisionClassifier::classify(self, frame)
    }
}

/// Downsizes and encodes a frame as base64 JPEG.
fn encode_frame(frame: Frame, max_dimension: u32, quality: u8) -> Result<String, ClassifyError> {
    let Frame {
        width,
        height,
        format,
        data,
        ..
    } = frame;

    let img = match format {
        PixelFormat::Rgba8 => RgbaImage::from_raw(width, height, data)
            .map(DynamicImage::ImageRgba8),
        PixelFormat::Rgb8 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
    }
    .ok_or_else(|| ClassifyError::Encode("frame buffer does not match dimensions".to_string()))?;

    let img = downsize(img, max_dimension);

    let mut jpeg = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality);
    img.to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| ClassifyError::Encode(e.to_string()))?;

    Ok(BASE64.encode(&jpeg))
}

/// Scales the image down so neither dimension exceeds `max_dimension`,
/// preserving aspect ratio.
fn downsize(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    let ratio = (width as f64 / max_dimension as f64).max(height as f64 / max_dimension as f64);
    if ratio <= 1.0 {
        return img;
    }
    let new_width = ((width as f64 / ratio) as u32).max(1);
    let new_height = ((height as f64 / ratio) as u32).max(1);
    img.resize_exact(new_width, new_height, FilterType::Triangle)
}

/// Interprets the reply text as an (explicit, score) pair.
fn parse_verdict(content: &str) -> (bool, f32) {
    let explicit = MARKERS.is_match(content);
    let score = match extract_score(content) {
        Some(score) => score.clamp(0.0, 1.0),
        None if explicit => DEFAULT_EXPLICIT_SCORE,
        None => DEFAULT_SAFE_SCORE,
    };
    (explicit, score)
}

/// Finds an "N/10" or "N out of 10" severity in the reply, normalized
/// to [0, 1].
fn extract_score(content: &str) -> Option<f32> {
    let bytes = content.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(value) = content[start..i].parse::<u32>() {
            if value <= 10 {
                let rest = content[i..].trim_start();
                if rest.starts_with("/10") || rest.starts_with("out of 10") {
                    return Some(value as f32 / 10.0);
                }
            }
        }
    }
    None
}
