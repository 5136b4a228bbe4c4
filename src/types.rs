// src/types.rs

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const VERSION: &str = "v1.2.0";

/// Sentinel returned when the pipeline completed but no plate validated.
pub const RECOGNITION_FAILED: &str = "인식실패";

/// Sentinel returned when the request failed internally.
pub const PROCESSING_ERROR: &str = "오류발생";

/// Hangul syllables legal on Korean plates. Anything outside this set fails
/// validation even if it is a valid syllable elsewhere.
pub const PLATE_SYLLABLES: &str =
    "가나다라마거너더러머버서어저고노도로모보소오조구누두루무부수우주아바사자배하허호";

/// Character set the recognition engine is restricted to: digits, the plate
/// syllable whitelist, and space.
pub fn allowed_chars() -> String {
    let mut chars = String::from("0123456789");
    chars.push_str(PLATE_SYLLABLES);
    chars.push(' ');
    chars
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub models: ModelsConfig,
    pub detection: DetectionConfig,
    pub cascade: CascadeConfig,
    pub scan: ScanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub vehicle_path: String,
    pub plate_path: String,
    pub recognition_path: String,
    pub charset_path: String,
    pub num_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub target_width: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub input_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Request-level failure taxonomy. Per-pass and per-region adapter failures
/// are absorbed inside the pipeline; only these two surface.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to decode input image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("model invocation failed: {0}")]
    Adapter(#[source] anyhow::Error),
}

/// Axis-aligned box in the coordinate frame of the raster it was detected on.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub class_id: usize,
    pub confidence: f32,
}

impl DetectionBox {
    /// Translate into the frame the origin (ox, oy) is expressed in.
    pub fn offset(&self, ox: i32, oy: i32) -> DetectionBox {
        DetectionBox {
            x1: self.x1 + ox,
            y1: self.y1 + oy,
            x2: self.x2 + ox,
            y2: self.y2 + oy,
            ..self.clone()
        }
    }

    /// Clamp to raster bounds; detections never extend past the raster.
    pub fn clamp_to(&self, width: u32, height: u32) -> DetectionBox {
        DetectionBox {
            x1: self.x1.clamp(0, width as i32),
            y1: self.y1.clamp(0, height as i32),
            x2: self.x2.clamp(0, width as i32),
            y2: self.y2.clamp(0, height as i32),
            ..self.clone()
        }
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One recognized text line and its confidence.
#[derive(Debug, Clone)]
pub struct TextFragment {
    pub text: String,
    pub confidence: f32,
}

/// A validated plate. `box_abs` is always in the originally uploaded image's
/// frame, however many nested crops produced it.
#[derive(Debug, Clone)]
pub struct PlateCandidate {
    pub text: String,
    pub box_abs: DetectionBox,
    pub source_pass: usize,
}

/// All validated candidates for one request, in discovery order
/// (vehicle-region order, then plate-region order within each).
#[derive(Debug, Clone, Default)]
pub struct RecognitionResult {
    pub candidates: Vec<PlateCandidate>,
}

impl RecognitionResult {
    pub fn primary(&self) -> Option<&PlateCandidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateOut {
    pub text: String,
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
}

/// Wire shape of one analysis. `error` is present only on internal failure,
/// which is distinct from "no plate found".
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub text: String,
    #[serde(rename = "box")]
    pub bbox: Option<[i32; 4]>,
    pub all_candidates: Vec<CandidateOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalyzeResponse {
    pub fn from_result(result: &RecognitionResult) -> Self {
        let all_candidates = result
            .candidates
            .iter()
            .map(|c| CandidateOut {
                text: c.text.clone(),
                bbox: c.box_abs.as_array(),
            })
            .collect();

        match result.primary() {
            Some(primary) => AnalyzeResponse {
                text: primary.text.clone(),
                bbox: Some(primary.box_abs.as_array()),
                all_candidates,
                error: None,
            },
            None => AnalyzeResponse {
                text: RECOGNITION_FAILED.to_string(),
                bbox: None,
                all_candidates,
                error: None,
            },
        }
    }

    pub fn from_failure(message: String) -> Self {
        AnalyzeResponse {
            text: PROCESSING_ERROR.to_string(),
            bbox: None,
            all_candidates: Vec::new(),
            error: Some(message),
        }
    }
}
