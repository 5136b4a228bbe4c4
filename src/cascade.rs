// src/cascade.rs

use crate::preprocessing::{derive_passes, PrepPass};
use crate::recognition::{concat_fragments, RecognitionModel};
use crate::types::{DetectionBox, PlateCandidate};
use crate::validator::PlateValidator;
use image::RgbImage;
use tracing::{debug, warn};

/// Per-region cascade progress. A region either matches on some pass or
/// exhausts every pass; sibling regions never affect each other.
#[derive(Debug, Clone)]
pub enum CascadeState {
    Pending(usize),
    Matched(PlateCandidate),
    Exhausted,
}

/// Drives preprocessing -> recognition -> validation for one plate region,
/// short-circuiting on the first structurally valid match.
pub struct CascadeController<'a> {
    engine: &'a dyn RecognitionModel,
    validator: &'a PlateValidator,
    allowed_chars: &'a str,
    target_width: u32,
}

impl<'a> CascadeController<'a> {
    pub fn new(
        engine: &'a dyn RecognitionModel,
        validator: &'a PlateValidator,
        allowed_chars: &'a str,
        target_width: u32,
    ) -> Self {
        Self {
            engine,
            validator,
            allowed_chars,
            target_width,
        }
    }

    /// Run the cascade over one plate crop. `box_abs` is the region's box
    /// already transformed into the original image's frame; it becomes the
    /// candidate's box on a match.
    pub fn run(&self, crop: &RgbImage, box_abs: &DetectionBox) -> CascadeState {
        let passes = derive_passes(crop, self.target_width);
        let mut state = CascadeState::Pending(0);

        while let CascadeState::Pending(pass_index) = state {
            let Some((pass, raster)) = passes.get(pass_index) else {
                state = CascadeState::Exhausted;
                break;
            };

            state = match self.attempt(*pass, raster) {
                Some(text) => {
                    debug!("Pass {:?} matched: {}", pass, text);
                    CascadeState::Matched(PlateCandidate {
                        text,
                        box_abs: box_abs.clone(),
                        source_pass: pass_index,
                    })
                }
                None => CascadeState::Pending(pass_index + 1),
            };
        }

        state
    }

    /// One pass: recognition then validation. A failed provider invocation is
    /// a non-match, not a failed request.
    fn attempt(&self, pass: PrepPass, raster: &image::GrayImage) -> Option<String> {
        let fragments = match self.engine.invoke(raster, self.allowed_chars) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("Recognition failed on pass {:?}: {:#}", pass, e);
                return None;
            }
        };

        let recognized = concat_fragments(&fragments);
        if recognized.is_empty() {
            return None;
        }
        if let Some(first) = fragments.first() {
            debug!(
                "Pass {:?} read '{}' (conf {:.2})",
                pass, recognized, first.confidence
            );
        }

        self.validator.extract(&recognized)
    }
}
