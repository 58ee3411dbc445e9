use crate::binding::BindingStrategy;
use ndarray::ArrayD;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model has no input slot `{0}`")]
    UnknownSlot(String),
    #[error("model has no input at position {0}")]
    UnknownPosition(usize),
    #[error("failed to build input tensor for `{slot}`: {message}")]
    Tensor { slot: String, message: String },
    #[error("inference failed: {0}")]
    Run(String),
    #[error("failed to extract output `{name}`: {message}")]
    Output { name: String, message: String },
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model file not found, tried: {}", .tried.join(", "))]
    NotFound { tried: Vec<String> },
    #[error("failed to load model from {path}: {message}")]
    Incompatible { path: String, message: String },
    #[error("model loading task failed: {0}")]
    Task(String),
}

/// Identifies the engine input a tensor is fed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotId {
    Named(String),
    Position(usize),
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Named(name) => write!(f, "{}", name),
            SlotId::Position(index) => write!(f, "#{}", index),
        }
    }
}

/// Tensors bound to engine inputs, tagged with the strategy that produced them.
#[derive(Debug, Clone)]
pub struct InferenceBinding {
    pub strategy: BindingStrategy,
    pub slots: Vec<(SlotId, ArrayD<f32>)>,
}

impl InferenceBinding {
    pub fn new(strategy: BindingStrategy) -> Self {
        Self {
            strategy,
            slots: Vec::new(),
        }
    }

    pub fn bind(mut self, slot: SlotId, tensor: ArrayD<f32>) -> Self {
        self.slots.push((slot, tensor));
        self
    }

    pub fn tensor(&self, slot: &SlotId) -> Option<&ArrayD<f32>> {
        self.slots
            .iter()
            .find(|(id, _)| id == slot)
            .map(|(_, tensor)| tensor)
    }

    /// True when every declared input is fed, by name or by position.
    pub fn covers(&self, inputs: &[String]) -> bool {
        inputs.iter().enumerate().all(|(index, name)| {
            self.slots.iter().any(|(id, _)| match id {
                SlotId::Named(bound) => bound == name,
                SlotId::Position(position) => *position == index,
            })
        })
    }
}

/// Engine output, in whichever of the three shapes the loaded model produces.
#[derive(Debug, Clone)]
pub enum RawOutput {
    Positional(Vec<ArrayD<f32>>),
    Named(Vec<(String, ArrayD<f32>)>),
    Flat(Vec<f32>),
}

impl RawOutput {
    /// Every value in output order.
    pub fn flatten(&self) -> Vec<f32> {
        match self {
            RawOutput::Positional(tensors) => {
                tensors.iter().flat_map(|t| t.iter().copied()).collect()
            }
            RawOutput::Named(tensors) => tensors
                .iter()
                .flat_map(|(_, t)| t.iter().copied())
                .collect(),
            RawOutput::Flat(values) => values.clone(),
        }
    }
}

/// A loaded model that reports its slot names and runs a binding.
pub trait InferenceEngine: Send + Sync + 'static {
    fn input_names(&self) -> Vec<String>;
    fn output_names(&self) -> Vec<String>;
    fn run(&self, binding: &InferenceBinding) -> Result<RawOutput, EngineError>;
}

pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<Box<dyn InferenceEngine>, ModelLoadError>;
}
