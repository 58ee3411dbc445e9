use crate::{
    config::{ModelConfig, Normalization},
    model_service::{
        EngineError, InferenceBinding, InferenceEngine, ModelLoadError, ModelLoader, RawOutput,
    },
    state::ModelContract,
};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

type Handler = dyn Fn(&InferenceBinding) -> Result<RawOutput, EngineError> + Send + Sync;

/// Engine double that records every binding it is asked to run.
pub struct StubEngine {
    inputs: Vec<String>,
    outputs: Vec<String>,
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<InferenceBinding>>>,
}

impl StubEngine {
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            handler: Arc::new(|_: &InferenceBinding| {
                Ok::<_, EngineError>(RawOutput::Flat(vec![170.0, 65.0]))
            }),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InferenceBinding) -> Result<RawOutput, EngineError> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn calls(&self) -> Vec<InferenceBinding> {
        self.calls.lock().clone()
    }

    pub fn call_log(&self) -> Arc<Mutex<Vec<InferenceBinding>>> {
        self.calls.clone()
    }

    fn share(&self) -> Self {
        Self {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            handler: self.handler.clone(),
            calls: self.calls.clone(),
        }
    }
}

impl InferenceEngine for StubEngine {
    fn input_names(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn run(&self, binding: &InferenceBinding) -> Result<RawOutput, EngineError> {
        self.calls.lock().push(binding.clone());
        (self.handler)(binding)
    }
}

/// Loader handing out engines that share one call log.
pub struct StubLoader {
    engine: StubEngine,
    load_delay: Option<Duration>,
}

impl StubLoader {
    pub fn new(engine: StubEngine) -> Self {
        Self {
            engine,
            load_delay: None,
        }
    }

    /// Blocks every load for `delay`, like a slow disk.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }
}

impl ModelLoader for StubLoader {
    fn load(&self, _path: &Path) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        Ok(Box::new(self.engine.share()))
    }
}

pub fn contract(inputs: &[&str]) -> ModelContract {
    ModelContract {
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: vec!["output_0".to_string()],
    }
}

pub fn model_config_in(dir: &Path) -> ModelConfig {
    ModelConfig {
        model_dir: PathBuf::from(dir),
        model_name: "height_weight_model".to_string(),
        extensions: vec!["onnx".to_string(), "ort".to_string()],
        num_threads: 1,
        num_instances: 1,
        preload: false,
        normalization: Normalization::MobileNet,
    }
}

/// A model directory holding a placeholder artifact for stub loaders.
pub fn stub_model_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("body_metrics_{}_{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("height_weight_model.onnx"), b"stub").unwrap();
    dir
}
