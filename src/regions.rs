// src/regions.rs

use crate::detector::DetectionModel;
use crate::types::DetectionBox;
use anyhow::Result;
use image::RgbImage;
use std::sync::Arc;
use tracing::debug;

// COCO class IDs: car, motorcycle, bus, truck
pub const VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7];

// The custom plate model has a single class.
pub const PLATE_CLASSES: [usize; 1] = [0];

/// Locates vehicle-shaped regions in the full uploaded image.
pub struct VehicleRegionDetector {
    model: Arc<dyn DetectionModel>,
}

impl VehicleRegionDetector {
    pub fn new(model: Arc<dyn DetectionModel>) -> Self {
        Self { model }
    }

    pub fn detect(&self, raster: &RgbImage) -> Result<Vec<DetectionBox>> {
        let boxes = self.model.invoke(raster, &VEHICLE_CLASSES)?;
        for b in &boxes {
            debug!(
                "Vehicle region class {} conf {:.2} at {:?}",
                b.class_id,
                b.confidence,
                b.as_array()
            );
        }
        Ok(boxes)
    }
}

/// Locates plate-shaped regions inside a crop (or the full image on the
/// fallback path). Boxes are local to the raster handed in.
pub struct PlateRegionDetector {
    model: Arc<dyn DetectionModel>,
}

impl PlateRegionDetector {
    pub fn new(model: Arc<dyn DetectionModel>) -> Self {
        Self { model }
    }

    pub fn detect(&self, raster: &RgbImage) -> Result<Vec<DetectionBox>> {
        let boxes = self.model.invoke(raster, &PLATE_CLASSES)?;
        debug!("{} plate region(s)", boxes.len());
        Ok(boxes)
    }
}

/// Crop a detection out of its raster. The box is already clamped to the
/// raster by the detector; an empty box yields None.
pub fn crop_region(raster: &RgbImage, region: &DetectionBox) -> Option<RgbImage> {
    if region.is_empty() {
        return None;
    }
    Some(
        image::imageops::crop_imm(
            raster,
            region.x1 as u32,
            region.y1 as u32,
            region.width(),
            region.height(),
        )
        .to_image(),
    )
}
