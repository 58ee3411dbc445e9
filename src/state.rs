use crate::{
    config::ModelConfig,
    model_service::{InferenceEngine, ModelLoadError, ModelLoader},
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::OnceCell;

/// Input and output slot names declared by the loaded engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContract {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl ModelContract {
    pub fn from_engine(engine: &dyn InferenceEngine) -> Self {
        Self {
            inputs: engine.input_names(),
            outputs: engine.output_names(),
        }
    }

    pub fn input_arity(&self) -> usize {
        self.inputs.len()
    }

    pub fn declares_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input == name)
    }
}

pub struct LoadedModel {
    pub contract: ModelContract,
    pub engine: Box<dyn InferenceEngine>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

/// First candidate that exists on disk wins.
pub fn resolve_model_path(model_config: &ModelConfig) -> Result<PathBuf, ModelLoadError> {
    let candidates = model_config.candidate_paths();
    match candidates.iter().find(|path| path.exists()) {
        Some(path) => {
            tracing::info!("Found model file: {}", path.display());
            Ok(path.clone())
        }
        None => {
            let tried: Vec<String> = candidates
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            tracing::error!("Model file not found at any of {:?}", tried);
            Err(ModelLoadError::NotFound { tried })
        }
    }
}

/// Process-wide model handle, loaded at most once.
///
/// Concurrent first callers share a single load; a failed load leaves the
/// registry empty so a later caller can try again.
pub struct ModelRegistry {
    model_config: ModelConfig,
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<LoadedModel>>,
}

impl ModelRegistry {
    pub fn new(model_config: ModelConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            model_config,
            loader,
            model: OnceCell::new(),
        }
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    pub async fn get(&self) -> Result<Arc<LoadedModel>, ModelLoadError> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let path = resolve_model_path(&self.model_config)?;
                let loader = self.loader.clone();

                tracing::info!("Loading model from: {}", path.display());
                let engine = tokio::task::spawn_blocking(move || loader.load(&path))
                    .await
                    .map_err(|e| ModelLoadError::Task(e.to_string()))??;

                let contract = ModelContract::from_engine(engine.as_ref());
                tracing::info!(
                    inputs = ?contract.inputs,
                    outputs = ?contract.outputs,
                    "Model loaded successfully"
                );

                Ok::<_, ModelLoadError>(Arc::new(LoadedModel { contract, engine }))
            })
            .await?;

        Ok(model.clone())
    }
}
