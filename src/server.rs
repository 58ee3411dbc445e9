use crate::{
    config::{Config, ServerConfig},
    inference_service::PredictionService,
    ort_service::OrtModelLoader,
    routes::api_routes,
    state::ModelRegistry,
};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    Router,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Clone)]
pub struct SharedState {
    pub prediction_service: Arc<PredictionService>,
}

/// Browser clients on any origin, credentials allowed.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
        ])
        .expose_headers([header::LINK])
        .allow_credentials(true)
        .max_age(Duration::from_secs(300))
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors_layer())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        prediction_service: Arc<PredictionService>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let app_state = SharedState { prediction_service };
        let router = build_router(app_state, config.max_upload_bytes());

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Prediction service listening on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received, starting graceful shutdown")
            })
            .await?;

        Ok(())
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let loader = OrtModelLoader::new(config.model.num_threads, config.model.num_instances)?;
    let registry = Arc::new(ModelRegistry::new(config.model.clone(), Arc::new(loader)));
    let prediction_service = Arc::new(PredictionService::new(
        registry,
        config.server.request_timeout(),
    ));

    if config.model.preload {
        tracing::info!("Attempting to pre-load model before starting server");
        if let Err(e) = prediction_service.warm_up().await {
            tracing::error!("Failed to pre-load model: {}", e);
            return Err(e.into());
        }
    } else {
        tracing::info!("Model will be loaded on first request");
    }

    if let Some(url) = &config.training.data_export_url {
        tracing::info!("Training data export endpoint: {}", url);
    }

    let server = HttpServer::new(prediction_service, &config.server).await?;
    server.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
