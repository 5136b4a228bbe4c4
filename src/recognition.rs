// src/recognition.rs

use crate::types::TextFragment;
use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::fs;
use std::sync::Mutex;
use tracing::{debug, info};

const REC_INPUT_HEIGHT: u32 = 48;
const REC_MAX_WIDTH: u32 = 640;
const REC_MIN_WIDTH: u32 = 16;

/// Opaque text-recognition capability. Returns recognized fragments in
/// reading order, restricted to `allowed_chars`; empty when nothing was read.
pub trait RecognitionModel: Send + Sync {
    fn invoke(&self, raster: &GrayImage, allowed_chars: &str) -> Result<Vec<TextFragment>>;
}

/// Join fragment texts in returned order and strip all whitespace: one
/// recognition string per invocation.
pub fn concat_fragments(fragments: &[TextFragment]) -> String {
    fragments
        .iter()
        .flat_map(|f| f.text.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// CTC text recognizer backed by an ONNX Runtime session and a character-key
/// file (one glyph per line, class index = line number + 1, class 0 = blank).
pub struct CtcRecognizer {
    session: Mutex<Session>,
    charset: Vec<char>,
}

impl CtcRecognizer {
    pub fn new(model_path: &str, charset_path: &str, num_threads: usize) -> Result<Self> {
        info!("Loading recognition model: {}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load model {}", model_path))?;

        let keys = fs::read_to_string(charset_path)
            .with_context(|| format!("Failed to read charset {}", charset_path))?;
        let charset: Vec<char> = keys.lines().filter_map(|l| l.chars().next()).collect();
        if charset.is_empty() {
            return Err(anyhow!("charset file {} is empty", charset_path));
        }

        info!("✓ Recognition model ready ({} glyphs)", charset.len());

        Ok(Self {
            session: Mutex::new(session),
            charset,
        })
    }

    fn infer(&self, input: Vec<f32>, width: u32) -> Result<(Vec<f32>, Vec<i64>)> {
        let shape = [
            1usize,
            3,
            REC_INPUT_HEIGHT as usize,
            width as usize,
        ];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("recognition session lock poisoned"))?;
        let outputs = session.run(ort::inputs!["x" => input_value])?;
        let output = &outputs[0];
        let (out_shape, data) = output.try_extract_tensor::<f32>()?;

        Ok((data.to_vec(), out_shape.to_vec()))
    }
}

impl RecognitionModel for CtcRecognizer {
    fn invoke(&self, raster: &GrayImage, allowed_chars: &str) -> Result<Vec<TextFragment>> {
        let width = (raster.width() * REC_INPUT_HEIGHT / raster.height().max(1))
            .clamp(REC_MIN_WIDTH, REC_MAX_WIDTH);
        let resized = image::imageops::resize(
            raster,
            width,
            REC_INPUT_HEIGHT,
            image::imageops::FilterType::Triangle,
        );

        // Single channel replicated to the 3-channel layout the recognition
        // model expects, normalized to [-1, 1].
        let hw = (REC_INPUT_HEIGHT * width) as usize;
        let mut input = vec![0.0f32; 3 * hw];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let v = pixel[0] as f32 / 127.5 - 1.0;
            let idx = y as usize * width as usize + x as usize;
            input[idx] = v;
            input[hw + idx] = v;
            input[2 * hw + idx] = v;
        }

        let (output, shape) = self.infer(input, width)?;
        let fragments = greedy_ctc_decode(&output, &shape, &self.charset, allowed_chars);
        debug!("Recognized {} fragment(s)", fragments.len());
        Ok(fragments)
    }
}

/// Greedy CTC decode of a [1, steps, classes] probability tensor: argmax per
/// step, collapse repeats, drop blanks, drop glyphs outside the allowed set.
fn greedy_ctc_decode(
    output: &[f32],
    shape: &[i64],
    charset: &[char],
    allowed_chars: &str,
) -> Vec<TextFragment> {
    if shape.len() != 3 {
        return Vec::new();
    }
    let steps = shape[1] as usize;
    let classes = shape[2] as usize;

    let mut text = String::new();
    let mut prob_sum = 0.0f32;
    let mut emitted = 0usize;
    let mut prev_class = 0usize;

    for t in 0..steps {
        let row = &output[t * classes..(t + 1) * classes];
        let (best_class, best_prob) = row
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });

        // class 0 is the CTC blank
        if best_class != 0 && best_class != prev_class {
            if let Some(&glyph) = charset.get(best_class - 1) {
                if allowed_chars.contains(glyph) {
                    text.push(glyph);
                    prob_sum += best_prob;
                    emitted += 1;
                }
            }
        }
        prev_class = best_class;
    }

    if text.is_empty() {
        return Vec::new();
    }

    let confidence = prob_sum / emitted as f32;
    vec![TextFragment { text, confidence }]
}
