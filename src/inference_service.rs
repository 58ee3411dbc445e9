use crate::{
    adjustment::adjust_weight,
    binding::{self, BindingInputs, BindingStrategy, InferenceBindingExhausted},
    config::Normalization,
    extraction::{extract, ExtractionError, ExtractionStrategy},
    model_service::ModelLoadError,
    preprocessing::{prepare_image, DecodeError},
    state::{LoadedModel, ModelRegistry},
    validation::{confidence, ImageCount, ValidationError},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Invalid {view} image format or corrupted {view} image data: {source}")]
    Decode {
        view: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error("Model unavailable: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Binding(#[from] InferenceBindingExhausted),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("Prediction timed out after {0:?}")]
    Timeout(Duration),
    #[error("Prediction task failed: {0}")]
    Task(String),
}

impl PredictionError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictionError::Validation(_))
    }
}

#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub front: Vec<u8>,
    /// `None` for the single-image flow, where the front upload stands in for both views.
    pub side: Option<Vec<u8>>,
    pub user_height: Option<f64>,
}

impl PredictionRequest {
    pub fn dual(front: Vec<u8>, side: Vec<u8>, user_height: Option<f64>) -> Self {
        Self {
            front,
            side: Some(side),
            user_height,
        }
    }

    pub fn single(image: Vec<u8>, user_height: Option<f64>) -> Self {
        Self {
            front: image,
            side: None,
            user_height,
        }
    }

    pub fn image_count(&self) -> ImageCount {
        match self.side {
            Some(_) => ImageCount::Dual,
            None => ImageCount::Single,
        }
    }

    fn has_distinct_views(&self) -> bool {
        matches!(&self.side, Some(side) if *side != self.front)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub height: f64,
    pub weight: f64,
    /// The model's own height estimate, even when `height` is the declared one.
    pub predicted_height: f64,
    pub confidence: f64,
    pub adjustment_applied: bool,
    pub binding_strategy: BindingStrategy,
    pub extraction_strategy: ExtractionStrategy,
}

/// Runs one request end to end against an already loaded model.
pub fn run_pipeline(
    model: &LoadedModel,
    request: &PredictionRequest,
    normalization: Normalization,
) -> Result<PredictionResult, PredictionError> {
    tracing::debug!("Preprocessing front image, bytes length: {}", request.front.len());
    let front = prepare_image(&request.front, normalization)
        .map_err(|source| PredictionError::Decode {
            view: "front",
            source,
        })?;

    let side = match &request.side {
        Some(bytes) => {
            tracing::debug!("Preprocessing side image, bytes length: {}", bytes.len());
            prepare_image(bytes, normalization).map_err(|source| PredictionError::Decode {
                view: "side",
                source,
            })?
        }
        None => {
            tracing::debug!("Using the same image for both front and side views");
            front.clone()
        }
    };

    let inputs = BindingInputs {
        front: &front,
        side: &side,
        distinct_views: request.has_distinct_views(),
        height: request.user_height.map(|h| h as f32),
    };
    let (output, binding_strategy) =
        binding::infer(model.engine.as_ref(), &model.contract, &inputs)?;
    tracing::debug!("Raw predictions: {:?}", output);

    let extraction = extract(&output)?;
    let adjustment = adjust_weight(extraction.weight, request.user_height, extraction.height);

    Ok(PredictionResult {
        height: request.user_height.unwrap_or(extraction.height),
        weight: adjustment.weight,
        predicted_height: extraction.height,
        confidence: confidence(request.image_count(), request.user_height.is_some()),
        adjustment_applied: adjustment.applied,
        binding_strategy,
        extraction_strategy: extraction.strategy,
    })
}

#[derive(Clone)]
pub struct PredictionService {
    registry: Arc<ModelRegistry>,
    request_timeout: Duration,
}

impl PredictionService {
    pub fn new(registry: Arc<ModelRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            request_timeout,
        }
    }

    /// Loads the model ahead of the first request.
    pub async fn warm_up(&self) -> Result<(), ModelLoadError> {
        self.registry.get().await.map(|_| ())
    }

    #[instrument(
        skip(self, request),
        fields(
            images = request.image_count().as_str(),
            height_provided = request.user_height.is_some()
        )
    )]
    pub async fn predict(
        &self,
        request: PredictionRequest,
    ) -> Result<PredictionResult, PredictionError> {
        let result = tokio::time::timeout(self.request_timeout, self.load_and_run(request))
            .await
            .map_err(|_| PredictionError::Timeout(self.request_timeout))??;

        tracing::info!(
            height = result.height,
            weight = result.weight,
            predicted_height = result.predicted_height,
            confidence = result.confidence,
            adjusted = result.adjustment_applied,
            binding = %result.binding_strategy,
            extraction = %result.extraction_strategy,
            "Returning prediction"
        );

        Ok(result)
    }

    async fn load_and_run(
        &self,
        request: PredictionRequest,
    ) -> Result<PredictionResult, PredictionError> {
        let model = self.registry.get().await?;
        let normalization = self.registry.model_config().normalization;

        tokio::task::spawn_blocking(move || run_pipeline(&model, &request, normalization))
            .await
            .map_err(|err| PredictionError::Task(err.to_string()))?
    }
}
