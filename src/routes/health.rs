use axum::{response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
}

pub async fn healthcheck() -> impl IntoResponse {
    tracing::debug!("Health check endpoint called");
    Json(Status {
        status: "Service is running".into(),
    })
}
