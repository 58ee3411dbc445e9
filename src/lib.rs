mod ort_service;
mod routes;
mod server;

#[cfg(test)]
mod test_utils;

pub mod adjustment;
pub mod binding;
pub mod config;
pub mod extraction;
pub mod inference_service;
pub mod model_service;
pub mod preprocessing;
pub mod state;
pub mod validation;

pub use ort_service::{OrtEngine, OrtModelLoader};
pub use server::{build_router, start_server, HttpServer, SharedState};
