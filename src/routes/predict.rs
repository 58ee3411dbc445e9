use crate::{
    inference_service::{PredictionError, PredictionRequest, PredictionResult},
    server::SharedState,
    validation::{parse_height, ValidationError},
};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::instrument;

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub height: f64,
    pub weight: f64,
    pub predicted_height: f64,
    pub confidence: f64,
}

impl From<PredictionResult> for PredictionResponse {
    fn from(result: PredictionResult) -> Self {
        Self {
            height: result.height,
            weight: result.weight,
            predicted_height: result.predicted_height,
            confidence: result.confidence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for PredictionError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            tracing::warn!("Rejected request: {}", self);
            StatusCode::BAD_REQUEST
        } else {
            tracing::error!("Error in prediction process: {}", self);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

struct Upload {
    file_name: String,
    bytes: Vec<u8>,
}

/// Multipart body split into file parts and plain form fields.
#[derive(Default)]
struct UploadForm {
    files: HashMap<String, Upload>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    async fn read(
        multipart: Result<Multipart, MultipartRejection>,
    ) -> Result<Self, ValidationError> {
        let mut multipart = multipart.map_err(|e| ValidationError::Multipart(e.body_text()))?;
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ValidationError::Multipart(e.body_text()))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ValidationError::Multipart(e.body_text()))?;
                    tracing::info!(
                        field = %name,
                        file_name = %file_name,
                        size = bytes.len(),
                        "Received file"
                    );
                    form.files.insert(
                        name,
                        Upload {
                            file_name,
                            bytes: bytes.to_vec(),
                        },
                    );
                }
                None => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| ValidationError::Multipart(e.body_text()))?;
                    form.fields.insert(name, text);
                }
            }
        }

        Ok(form)
    }

    fn height(&self) -> Result<Option<f64>, ValidationError> {
        parse_height(self.fields.get("height").map(String::as_str))
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, PredictionError> {
    let mut form = UploadForm::read(multipart).await?;

    let (Some(front), Some(side)) = (
        form.files.remove("front_image"),
        form.files.remove("side_image"),
    ) else {
        return Err(ValidationError::MissingImage("Both front and side images are required").into());
    };
    let height = form.height()?;
    if front.file_name.is_empty() || side.file_name.is_empty() {
        return Err(
            ValidationError::EmptyFilename("Both front and side images must be selected").into(),
        );
    }

    let result = state
        .prediction_service
        .predict(PredictionRequest::dual(front.bytes, side.bytes, height))
        .await?;

    Ok(Json(result.into()))
}

#[instrument(skip(state, multipart))]
pub async fn predict_single(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, PredictionError> {
    let mut form = UploadForm::read(multipart).await?;

    let Some(image) = form.files.remove("image") else {
        return Err(ValidationError::MissingImage("No image uploaded").into());
    };
    let height = form.height()?;
    if image.file_name.is_empty() {
        return Err(ValidationError::EmptyFilename("No selected file").into());
    }

    let result = state
        .prediction_service
        .predict(PredictionRequest::single(image.bytes, height))
        .await?;

    Ok(Json(result.into()))
}
