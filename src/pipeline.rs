// src/pipeline.rs

use crate::cascade::{CascadeController, CascadeState};
use crate::detector::DetectionModel;
use crate::recognition::RecognitionModel;
use crate::regions::{crop_region, PlateRegionDetector, VehicleRegionDetector};
use crate::types::{allowed_chars, CascadeConfig, PlateCandidate, RecognitionResult, ScanError};
use crate::validator::PlateValidator;
use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The full detection-then-recognition pipeline for one request: vehicle
/// regions (or whole-image fallback), nested plate regions, per-region
/// recognition cascade, aggregation in discovery order.
pub struct PlatePipeline {
    vehicles: VehicleRegionDetector,
    plates: PlateRegionDetector,
    engine: Arc<dyn RecognitionModel>,
    validator: PlateValidator,
    allowed: String,
    target_width: u32,
}

impl PlatePipeline {
    pub fn new(
        vehicle_model: Arc<dyn DetectionModel>,
        plate_model: Arc<dyn DetectionModel>,
        engine: Arc<dyn RecognitionModel>,
        validator: PlateValidator,
        cascade: &CascadeConfig,
    ) -> Self {
        Self {
            vehicles: VehicleRegionDetector::new(vehicle_model),
            plates: PlateRegionDetector::new(plate_model),
            engine,
            validator,
            allowed: allowed_chars(),
            target_width: cascade.target_width,
        }
    }

    /// Decode raw bytes and analyze. Undecodable input is fatal for the
    /// request.
    pub fn analyze(&self, bytes: &[u8]) -> Result<RecognitionResult, ScanError> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        debug!("Decoded {}x{} image", image.width(), image.height());
        self.analyze_image(&image)
    }

    pub fn analyze_image(&self, image: &RgbImage) -> Result<RecognitionResult, ScanError> {
        let vehicles = self.vehicles.detect(image).map_err(ScanError::Adapter)?;

        let controller = CascadeController::new(
            self.engine.as_ref(),
            &self.validator,
            &self.allowed,
            self.target_width,
        );

        let mut candidates = Vec::new();

        if vehicles.is_empty() {
            // Fallback: one plate search over the whole image, origin (0, 0).
            debug!("No vehicles detected, searching the full image for plates");
            let plate_boxes = self.plates.detect(image).map_err(ScanError::Adapter)?;
            for plate_box in &plate_boxes {
                let Some(crop) = crop_region(image, plate_box) else {
                    continue;
                };
                if let CascadeState::Matched(candidate) = controller.run(&crop, plate_box) {
                    candidates.push(candidate);
                }
            }
        } else {
            for vehicle_box in &vehicles {
                let Some(vehicle_crop) = crop_region(image, vehicle_box) else {
                    continue;
                };

                // A failed plate search skips this vehicle only; siblings
                // still get processed.
                let plate_boxes = match self.plates.detect(&vehicle_crop) {
                    Ok(boxes) => boxes,
                    Err(e) => {
                        warn!("Plate detection failed for a vehicle region: {:#}", e);
                        continue;
                    }
                };

                for plate_box in &plate_boxes {
                    let Some(plate_crop) = crop_region(&vehicle_crop, plate_box) else {
                        continue;
                    };
                    let box_abs = plate_box.offset(vehicle_box.x1, vehicle_box.y1);
                    if let CascadeState::Matched(candidate) = controller.run(&plate_crop, &box_abs)
                    {
                        candidates.push(candidate);
                    }
                }
            }
        }

        log_outcome(&candidates);
        Ok(RecognitionResult { candidates })
    }
}

fn log_outcome(candidates: &[PlateCandidate]) {
    match candidates.first() {
        Some(primary) => info!(
            "✓ Recognized {} on pass {} ({} candidate(s))",
            primary.text,
            primary.source_pass,
            candidates.len()
        ),
        None => info!("No plate recognized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionBox, TextFragment};
    use anyhow::anyhow;
    use image::GrayImage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Detection stub: one canned box list per invocation, in order.
    struct StubDetector {
        script: Mutex<VecDeque<Vec<DetectionBox>>>,
        calls: Mutex<usize>,
    }

    impl StubDetector {
        fn new(script: Vec<Vec<DetectionBox>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl DetectionModel for StubDetector {
        fn invoke(
            &self,
            _raster: &RgbImage,
            _class_filter: &[usize],
        ) -> anyhow::Result<Vec<DetectionBox>> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    /// Always fails; for adapter-error paths.
    struct FailingDetector;

    impl DetectionModel for FailingDetector {
        fn invoke(
            &self,
            _raster: &RgbImage,
            _class_filter: &[usize],
        ) -> anyhow::Result<Vec<DetectionBox>> {
            Err(anyhow!("model unavailable"))
        }
    }

    /// Recognition stub: one canned fragment list per invocation, empty after
    /// the script runs out.
    struct StubEngine {
        script: Mutex<VecDeque<Vec<TextFragment>>>,
    }

    impl StubEngine {
        fn new(script: Vec<Vec<&str>>) -> Self {
            let script = script
                .into_iter()
                .map(|texts| {
                    texts
                        .into_iter()
                        .map(|t| TextFragment {
                            text: t.to_string(),
                            confidence: 0.9,
                        })
                        .collect()
                })
                .collect::<VecDeque<_>>();
            Self {
                script: Mutex::new(script),
            }
        }

        fn silent() -> Self {
            Self::new(Vec::new())
        }
    }

    impl RecognitionModel for StubEngine {
        fn invoke(
            &self,
            _raster: &GrayImage,
            _allowed_chars: &str,
        ) -> anyhow::Result<Vec<TextFragment>> {
            Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn boxed(x1: i32, y1: i32, x2: i32, y2: i32) -> DetectionBox {
        DetectionBox {
            x1,
            y1,
            x2,
            y2,
            class_id: 0,
            confidence: 0.9,
        }
    }

    fn pipeline(
        vehicle: StubDetector,
        plate: StubDetector,
        engine: StubEngine,
    ) -> (PlatePipeline, Arc<StubDetector>, Arc<StubDetector>) {
        let vehicle = Arc::new(vehicle);
        let plate = Arc::new(plate);
        let p = PlatePipeline::new(
            vehicle.clone(),
            plate.clone(),
            Arc::new(engine),
            PlateValidator::new().unwrap(),
            &CascadeConfig { target_width: 64 },
        );
        (p, vehicle, plate)
    }

    fn test_image() -> RgbImage {
        RgbImage::from_fn(200, 100, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        })
    }

    #[test]
    fn test_end_to_end_fragments_produce_primary_candidate() {
        let (p, _, _) = pipeline(
            StubDetector::new(vec![vec![boxed(10, 10, 90, 60)]]),
            StubDetector::new(vec![vec![boxed(5, 6, 45, 26)]]),
            StubEngine::new(vec![vec!["12", "가", "3456"]]),
        );

        let result = p.analyze_image(&test_image()).unwrap();
        let primary = result.primary().unwrap();
        assert_eq!(primary.text, "12가3456");
        assert_eq!(primary.source_pass, 0);
        // vehicle origin (10, 10) + plate-local (5, 6, 45, 26)
        assert_eq!(primary.box_abs.as_array(), [15, 16, 55, 36]);
    }

    #[test]
    fn test_two_vehicles_aggregate_in_discovery_order() {
        let (p, _, plate) = pipeline(
            StubDetector::new(vec![vec![
                boxed(10, 10, 90, 60),
                boxed(100, 20, 180, 80),
            ]]),
            StubDetector::new(vec![
                vec![boxed(5, 6, 45, 26)],
                vec![boxed(3, 4, 43, 24)],
            ]),
            // pass 0 of each region matches
            StubEngine::new(vec![vec!["12가3456"], vec!["78나9012"]]),
        );

        let result = p.analyze_image(&test_image()).unwrap();
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(result.candidates[0].text, "12가3456");
        assert_eq!(result.candidates[0].box_abs.as_array(), [15, 16, 55, 36]);
        assert_eq!(result.candidates[1].text, "78나9012");
        assert_eq!(result.candidates[1].box_abs.as_array(), [103, 24, 143, 44]);
        assert_eq!(result.primary().unwrap().text, "12가3456");
        // one plate search per vehicle region
        assert_eq!(plate.call_count(), 2);
    }

    #[test]
    fn test_zero_vehicles_falls_back_to_single_whole_image_search() {
        let (p, vehicle, plate) = pipeline(
            StubDetector::new(vec![Vec::new()]),
            StubDetector::new(vec![vec![boxed(50, 40, 130, 70)]]),
            StubEngine::new(vec![vec!["34허5678"]]),
        );

        let result = p.analyze_image(&test_image()).unwrap();
        assert_eq!(vehicle.call_count(), 1);
        assert_eq!(plate.call_count(), 1);

        // fallback origin is (0, 0): local box is already absolute
        let primary = result.primary().unwrap();
        assert_eq!(primary.text, "34허5678");
        assert_eq!(primary.box_abs.as_array(), [50, 40, 130, 70]);
    }

    #[test]
    fn test_silent_engine_yields_empty_result() {
        let (p, _, _) = pipeline(
            StubDetector::new(vec![vec![boxed(10, 10, 90, 60)]]),
            StubDetector::new(vec![vec![boxed(5, 6, 45, 26)]]),
            StubEngine::silent(),
        );

        let result = p.analyze_image(&test_image()).unwrap();
        assert!(result.candidates.is_empty());
        assert!(result.primary().is_none());
    }

    #[test]
    fn test_undecodable_bytes_are_a_decode_error() {
        let (p, _, _) = pipeline(
            StubDetector::new(Vec::new()),
            StubDetector::new(Vec::new()),
            StubEngine::silent(),
        );
        let err = p.analyze(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ScanError::Decode(_)));
    }

    #[test]
    fn test_vehicle_detection_failure_propagates() {
        let vehicle = Arc::new(FailingDetector);
        let plate = Arc::new(StubDetector::new(Vec::new()));
        let p = PlatePipeline::new(
            vehicle,
            plate,
            Arc::new(StubEngine::silent()),
            PlateValidator::new().unwrap(),
            &CascadeConfig { target_width: 64 },
        );
        let err = p.analyze_image(&test_image()).unwrap_err();
        assert!(matches!(err, ScanError::Adapter(_)));
    }

    #[test]
    fn test_failed_plate_search_skips_vehicle_but_keeps_siblings() {
        // first vehicle's plate search fails, second succeeds
        struct FlakyDetector {
            calls: Mutex<usize>,
        }
        impl DetectionModel for FlakyDetector {
            fn invoke(
                &self,
                _raster: &RgbImage,
                _class_filter: &[usize],
            ) -> anyhow::Result<Vec<DetectionBox>> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    Err(anyhow!("transient failure"))
                } else {
                    Ok(vec![boxed(3, 4, 43, 24)])
                }
            }
        }

        let vehicle = Arc::new(StubDetector::new(vec![vec![
            boxed(10, 10, 90, 60),
            boxed(100, 20, 180, 80),
        ]]));
        let plate = Arc::new(FlakyDetector {
            calls: Mutex::new(0),
        });
        let p = PlatePipeline::new(
            vehicle,
            plate,
            Arc::new(StubEngine::new(vec![vec!["78나9012"]])),
            PlateValidator::new().unwrap(),
            &CascadeConfig { target_width: 64 },
        );

        let result = p.analyze_image(&test_image()).unwrap();
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].text, "78나9012");
        assert_eq!(result.candidates[0].box_abs.as_array(), [103, 24, 143, 44]);
    }
}
