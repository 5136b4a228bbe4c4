// src/service.rs

use crate::detector::{DetectionModel, YoloDetector};
use crate::pipeline::PlatePipeline;
use crate::recognition::{CtcRecognizer, RecognitionModel};
use crate::types::{AnalyzeResponse, CascadeConfig, Config, RecognitionResult, ScanError};
use crate::validator::PlateValidator;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::error;

/// Capability providers the pipeline consumes. The process owns one
/// implementation; tests substitute stubs.
pub trait PipelineProviders: Send + Sync + 'static {
    fn vehicle_model(&self) -> Result<Arc<dyn DetectionModel>>;
    fn plate_model(&self) -> Result<Arc<dyn DetectionModel>>;
    fn recognition_model(&self) -> Result<Arc<dyn RecognitionModel>>;
}

/// Process-wide ONNX-backed providers. Sessions are expensive, so each is
/// constructed lazily on first use with first-call-wins semantics; once
/// initialized they are read-only for the pipeline.
pub struct ModelProviders {
    config: Config,
    vehicle: OnceLock<Arc<YoloDetector>>,
    plate: OnceLock<Arc<YoloDetector>>,
    recognizer: OnceLock<Arc<CtcRecognizer>>,
    init_lock: Mutex<()>,
}

impl ModelProviders {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            vehicle: OnceLock::new(),
            plate: OnceLock::new(),
            recognizer: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }
}

impl PipelineProviders for ModelProviders {
    fn vehicle_model(&self) -> Result<Arc<dyn DetectionModel>> {
        let detector = get_or_init_guarded(&self.vehicle, &self.init_lock, || {
            YoloDetector::new(
                &self.config.models.vehicle_path,
                self.config.models.num_threads,
                &self.config.detection,
            )
        })?;
        Ok(detector)
    }

    fn plate_model(&self) -> Result<Arc<dyn DetectionModel>> {
        let detector = get_or_init_guarded(&self.plate, &self.init_lock, || {
            YoloDetector::new(
                &self.config.models.plate_path,
                self.config.models.num_threads,
                &self.config.detection,
            )
        })?;
        Ok(detector)
    }

    fn recognition_model(&self) -> Result<Arc<dyn RecognitionModel>> {
        let recognizer = get_or_init_guarded(&self.recognizer, &self.init_lock, || {
            CtcRecognizer::new(
                &self.config.models.recognition_path,
                &self.config.models.charset_path,
                self.config.models.num_threads,
            )
        })?;
        Ok(recognizer)
    }
}

/// Guarded single-initialization: concurrent first callers race on the lock,
/// exactly one constructs, nobody observes a half-built value. A failed
/// construction leaves the slot empty so a later call may try again.
fn get_or_init_guarded<T>(
    slot: &OnceLock<Arc<T>>,
    init_lock: &Mutex<()>,
    build: impl FnOnce() -> Result<T>,
) -> Result<Arc<T>> {
    if let Some(value) = slot.get() {
        return Ok(value.clone());
    }

    let _guard = init_lock
        .lock()
        .map_err(|_| anyhow!("provider init lock poisoned"))?;
    if let Some(value) = slot.get() {
        return Ok(value.clone());
    }

    let value = Arc::new(build()?);
    let _ = slot.set(value.clone());
    Ok(value)
}

/// Request-facing surface: accepts raw image bytes, runs the CPU-bound
/// pipeline off the intake thread, and never lets a failure escape as
/// anything but the processing-error response.
pub struct PlateScanService {
    providers: Arc<dyn PipelineProviders>,
    validator: PlateValidator,
    cascade: CascadeConfig,
}

impl PlateScanService {
    pub fn new(config: Config) -> Result<Self> {
        let cascade = config.cascade.clone();
        Ok(Self {
            providers: Arc::new(ModelProviders::new(config)),
            validator: PlateValidator::new()?,
            cascade,
        })
    }

    #[cfg(test)]
    pub fn with_providers(
        providers: Arc<dyn PipelineProviders>,
        cascade: CascadeConfig,
    ) -> Result<Self> {
        Ok(Self {
            providers,
            validator: PlateValidator::new()?,
            cascade,
        })
    }

    pub async fn analyze(&self, bytes: Vec<u8>) -> AnalyzeResponse {
        let providers = self.providers.clone();
        let validator = self.validator.clone();
        let cascade = self.cascade.clone();

        let outcome = tokio::task::spawn_blocking(move || -> Result<RecognitionResult, ScanError> {
            let vehicle = providers.vehicle_model().map_err(ScanError::Adapter)?;
            let plate = providers.plate_model().map_err(ScanError::Adapter)?;
            let engine = providers.recognition_model().map_err(ScanError::Adapter)?;

            let pipeline = PlatePipeline::new(vehicle, plate, engine, validator, &cascade);
            pipeline.analyze(&bytes)
        })
        .await;

        match outcome {
            Ok(Ok(result)) => AnalyzeResponse::from_result(&result),
            Ok(Err(e)) => {
                error!("Analysis failed: {}", e);
                AnalyzeResponse::from_failure(e.to_string())
            }
            Err(join_error) => {
                error!("Analysis task aborted: {}", join_error);
                AnalyzeResponse::from_failure(format!("analysis task aborted: {}", join_error))
            }
        }
    }
}
