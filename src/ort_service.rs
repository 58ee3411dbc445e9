use crate::model_service::{
    EngineError, InferenceBinding, InferenceEngine, ModelLoadError, ModelLoader, RawOutput,
    SlotId,
};
use ndarray::ArrayD;
use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue, SessionInputs},
    value::TensorRef,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    borrow::Cow,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Round-robin pool of locked values. A free slot is taken over a busy one.
pub struct SessionPool<T> {
    slots: Vec<Mutex<T>>,
    counter: AtomicUsize,
}

impl<T> SessionPool<T> {
    /// `items` must not be empty.
    pub fn new(items: Vec<T>) -> Self {
        debug_assert!(!items.is_empty(), "session pool needs at least one slot");
        Self {
            slots: items.into_iter().map(Mutex::new).collect(),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> (usize, MutexGuard<'_, T>) {
        let size = self.slots.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % size;
        for offset in 0..size {
            let index = (start + offset) % size;
            if let Some(guard) = self.slots[index].try_lock() {
                return (index, guard);
            }
        }
        (start, self.slots[start].lock())
    }
}

/// ONNX Runtime sessions behind the engine handle.
pub struct OrtEngine {
    sessions: SessionPool<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OrtEngine {
    /// All sessions must come from the same model file.
    pub fn new(sessions: Vec<Session>) -> Self {
        let (input_names, output_names) = sessions
            .first()
            .map(|session| {
                (
                    session.inputs.iter().map(|i| i.name.clone()).collect(),
                    session.outputs.iter().map(|o| o.name.clone()).collect(),
                )
            })
            .unwrap_or_default();
        Self {
            sessions: SessionPool::new(sessions),
            input_names,
            output_names,
        }
    }

    fn slot_name(&self, slot: &SlotId) -> Result<String, EngineError> {
        match slot {
            SlotId::Named(name) if self.input_names.contains(name) => Ok(name.clone()),
            SlotId::Named(name) => Err(EngineError::UnknownSlot(name.clone())),
            SlotId::Position(index) => self
                .input_names
                .get(*index)
                .cloned()
                .ok_or(EngineError::UnknownPosition(*index)),
        }
    }

    fn shape_output(&self, tensors: Vec<(String, ArrayD<f32>)>) -> RawOutput {
        let has = |key: &str| tensors.iter().any(|(name, _)| name == key);
        if has("height") && has("weight") {
            RawOutput::Named(tensors)
        } else if tensors.len() > 1 {
            RawOutput::Positional(tensors.into_iter().map(|(_, t)| t).collect())
        } else {
            RawOutput::Flat(tensors.iter().flat_map(|(_, t)| t.iter().copied()).collect())
        }
    }
}

impl InferenceEngine for OrtEngine {
    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn run(&self, binding: &InferenceBinding) -> Result<RawOutput, EngineError> {
        let standard: Vec<(String, ArrayD<f32>)> = binding
            .slots
            .iter()
            .map(|(slot, tensor)| {
                Ok((
                    self.slot_name(slot)?,
                    tensor.as_standard_layout().into_owned(),
                ))
            })
            .collect::<Result<_, EngineError>>()?;

        let mut values: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::new();
        for (name, tensor) in &standard {
            let tensor_ref =
                TensorRef::from_array_view(tensor.view()).map_err(|e| EngineError::Tensor {
                    slot: name.clone(),
                    message: e.to_string(),
                })?;
            values.push((Cow::Borrowed(name.as_str()), tensor_ref.into()));
        }

        let inputs: SessionInputs<'_, '_> = SessionInputs::ValueMap(values);
        let (index, mut session) = self.sessions.acquire();
        tracing::debug!("Handling request with session {}", index);
        let outputs = session
            .run(inputs)
            .map_err(|e| EngineError::Run(e.to_string()))?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::Output {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec()).map_err(|e| {
                EngineError::Output {
                    name: name.clone(),
                    message: e.to_string(),
                }
            })?;
            tensors.push((name.clone(), array));
        }

        Ok(self.shape_output(tensors))
    }
}

#[derive(Debug, Clone)]
pub struct OrtModelLoader {
    num_threads: usize,
    num_instances: usize,
}

impl OrtModelLoader {
    pub fn new(num_threads: usize, num_instances: usize) -> Result<Self, ModelLoadError> {
        ort::init()
            .with_name("body_metrics")
            .commit()
            .map_err(|e| ModelLoadError::Incompatible {
                path: "<runtime>".to_string(),
                message: e.to_string(),
            })?;
        tracing::info!(num_threads, num_instances, "ONNX Runtime initialized");
        Ok(Self {
            num_threads,
            num_instances: num_instances.max(1),
        })
    }
}

impl ModelLoader for OrtModelLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
        let sessions = (0..self.num_instances)
            .map(|_| build_session(path, self.num_threads))
            .collect::<ort::Result<Vec<_>>>()
            .map_err(|e| ModelLoadError::Incompatible {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        tracing::info!("Created {} ONNX sessions", sessions.len());

        let engine = OrtEngine::new(sessions);
        for (i, name) in engine.input_names.iter().enumerate() {
            tracing::info!("  Input {}: {}", i, name);
        }

        Ok(Box::new(engine))
    }
}

fn build_session(path: &Path, num_threads: usize) -> ort::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(num_threads)?
        .commit_from_file(path)?;
    Ok(session)
}
