use crate::{
    model_service::{EngineError, InferenceBinding, InferenceEngine, RawOutput, SlotId},
    state::ModelContract,
};
use ndarray::{concatenate, Array4, ArrayD, Axis, IxDyn};
use std::fmt;
use thiserror::Error;

/// Input name of a plain single-input functional model.
pub const DEFAULT_SLOT: &str = "input_layer";
/// Front/side input name pairs, checked in order.
pub const FRONT_SIDE_CONVENTIONS: [(&str, &str); 2] = [
    ("front_input", "side_input"),
    ("front_image", "side_image"),
];
pub const HEIGHT_SLOT: &str = "height";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStrategy {
    DefaultSlot,
    FrontSide,
    ChannelConcat,
    SingleSlot,
    Positional,
    DefaultSlotRetry,
}

impl BindingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingStrategy::DefaultSlot => "default_slot",
            BindingStrategy::FrontSide => "front_side",
            BindingStrategy::ChannelConcat => "channel_concat",
            BindingStrategy::SingleSlot => "single_slot",
            BindingStrategy::Positional => "positional",
            BindingStrategy::DefaultSlotRetry => "default_slot_retry",
        }
    }
}

impl fmt::Display for BindingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("{strategy} binding does not apply: {reason}")]
    NotApplicable {
        strategy: BindingStrategy,
        reason: String,
    },
    #[error("unsupported number of inputs: {0}")]
    UnsupportedInputCount(usize),
    #[error("failed to concatenate front and side tensors: {0}")]
    Concat(#[from] ndarray::ShapeError),
    #[error("{strategy} binding leaves declared inputs unbound")]
    Incomplete { strategy: BindingStrategy },
    #[error("inference failed under {strategy} binding: {source}")]
    Engine {
        strategy: BindingStrategy,
        #[source]
        source: EngineError,
    },
}

#[derive(Error, Debug)]
#[error("no input binding strategy succeeded: {original}")]
pub struct InferenceBindingExhausted {
    #[source]
    pub original: BindingError,
}

/// Preprocessed tensors of one request.
#[derive(Debug, Clone, Copy)]
pub struct BindingInputs<'a> {
    pub front: &'a Array4<f32>,
    pub side: &'a Array4<f32>,
    /// Two different uploads, as opposed to one image duplicated into both views.
    pub distinct_views: bool,
    pub height: Option<f32>,
}

type BindingRule = fn(&ModelContract, &BindingInputs) -> Result<InferenceBinding, BindingError>;

/// Binding rules by precedence; the first that applies wins.
const BINDING_RULES: [BindingRule; 4] = [
    bind_default_slot,
    bind_front_side,
    bind_channel_concat,
    bind_by_arity,
];

fn not_applicable(strategy: BindingStrategy, reason: impl Into<String>) -> BindingError {
    BindingError::NotApplicable {
        strategy,
        reason: reason.into(),
    }
}

fn bind_default_slot(
    contract: &ModelContract,
    inputs: &BindingInputs,
) -> Result<InferenceBinding, BindingError> {
    if contract.inputs != [DEFAULT_SLOT] {
        return Err(not_applicable(
            BindingStrategy::DefaultSlot,
            format!("inputs are {:?}", contract.inputs),
        ));
    }

    Ok(InferenceBinding::new(BindingStrategy::DefaultSlot).bind(
        SlotId::Named(DEFAULT_SLOT.to_string()),
        inputs.front.clone().into_dyn(),
    ))
}

fn bind_front_side(
    contract: &ModelContract,
    inputs: &BindingInputs,
) -> Result<InferenceBinding, BindingError> {
    let strategy = BindingStrategy::FrontSide;
    let (front, side) = FRONT_SIDE_CONVENTIONS
        .iter()
        .find(|(front, side)| contract.declares_input(front) && contract.declares_input(side))
        .ok_or_else(|| not_applicable(strategy, "no front/side input pair"))?;

    let remaining: Vec<&String> = contract
        .inputs
        .iter()
        .filter(|name| name.as_str() != *front && name.as_str() != *side)
        .collect();

    let binding = InferenceBinding::new(strategy)
        .bind(SlotId::Named(front.to_string()), inputs.front.clone().into_dyn())
        .bind(SlotId::Named(side.to_string()), inputs.side.clone().into_dyn());

    match (remaining.as_slice(), inputs.height) {
        ([], _) => Ok(binding),
        ([extra], Some(height)) if extra.as_str() == HEIGHT_SLOT => Ok(binding.bind(
            SlotId::Named(HEIGHT_SLOT.to_string()),
            ArrayD::from_elem(IxDyn(&[1, 1]), height),
        )),
        ([extra], None) if extra.as_str() == HEIGHT_SLOT => Err(not_applicable(
            strategy,
            "model expects a height input but none was provided",
        )),
        (extra, _) => Err(not_applicable(
            strategy,
            format!("unexpected extra inputs {:?}", extra),
        )),
    }
}

fn bind_channel_concat(
    contract: &ModelContract,
    inputs: &BindingInputs,
) -> Result<InferenceBinding, BindingError> {
    let strategy = BindingStrategy::ChannelConcat;
    if contract.input_arity() != 1 {
        return Err(not_applicable(strategy, "model has more than one input"));
    }
    if !inputs.distinct_views {
        return Err(not_applicable(strategy, "only one distinct image"));
    }

    let combined = concatenate(Axis(3), &[inputs.front.view(), inputs.side.view()])?;
    tracing::debug!("Combined input shape: {:?}", combined.shape());

    Ok(InferenceBinding::new(strategy).bind(
        SlotId::Named(contract.inputs[0].clone()),
        combined.into_dyn(),
    ))
}

fn bind_by_arity(
    contract: &ModelContract,
    inputs: &BindingInputs,
) -> Result<InferenceBinding, BindingError> {
    match contract.input_arity() {
        1 => Ok(InferenceBinding::new(BindingStrategy::SingleSlot)
            .bind(SlotId::Position(0), inputs.front.clone().into_dyn())),
        2 => Ok(InferenceBinding::new(BindingStrategy::Positional)
            .bind(SlotId::Position(0), inputs.front.clone().into_dyn())
            .bind(SlotId::Position(1), inputs.side.clone().into_dyn())),
        other => Err(BindingError::UnsupportedInputCount(other)),
    }
}

/// Picks the binding for this contract by rule precedence.
pub fn select_binding(
    contract: &ModelContract,
    inputs: &BindingInputs,
) -> Result<InferenceBinding, BindingError> {
    let mut last_error = BindingError::UnsupportedInputCount(contract.input_arity());
    for rule in BINDING_RULES {
        match rule(contract, inputs) {
            Ok(binding) => return Ok(binding),
            Err(err) => {
                tracing::trace!("{}", err);
                last_error = err;
            }
        }
    }
    Err(last_error)
}

/// Front tensor to the model's only input, when it has exactly one.
pub fn retry_binding(contract: &ModelContract, inputs: &BindingInputs) -> Option<InferenceBinding> {
    if contract.input_arity() != 1 {
        return None;
    }
    let slot = if contract.declares_input(DEFAULT_SLOT) {
        DEFAULT_SLOT.to_string()
    } else {
        contract.inputs[0].clone()
    };

    Some(
        InferenceBinding::new(BindingStrategy::DefaultSlotRetry)
            .bind(SlotId::Named(slot), inputs.front.clone().into_dyn()),
    )
}

fn run_binding(
    engine: &dyn InferenceEngine,
    contract: &ModelContract,
    binding: InferenceBinding,
) -> Result<(RawOutput, BindingStrategy), BindingError> {
    let strategy = binding.strategy;
    if !binding.covers(&contract.inputs) {
        return Err(BindingError::Incomplete { strategy });
    }

    tracing::info!(strategy = %strategy, slots = binding.slots.len(), "Running inference");
    engine
        .run(&binding)
        .map(|output| (output, strategy))
        .map_err(|source| BindingError::Engine { strategy, source })
}

/// Binds the request to the engine and runs it, with one front-only retry on failure.
pub fn infer(
    engine: &dyn InferenceEngine,
    contract: &ModelContract,
    inputs: &BindingInputs,
) -> Result<(RawOutput, BindingStrategy), InferenceBindingExhausted> {
    let original = match select_binding(contract, inputs)
        .and_then(|binding| run_binding(engine, contract, binding))
    {
        Ok(result) => return Ok(result),
        Err(err) => err,
    };
    tracing::error!(error = %original, "Error during prediction");

    match retry_binding(contract, inputs) {
        Some(binding) => {
            tracing::info!("Last resort attempt: front image to the default input");
            match run_binding(engine, contract, binding) {
                Ok(result) => return Ok(result),
                Err(err) => tracing::error!(error = %err, "Last resort failed too"),
            }
        }
        None => tracing::warn!(
            inputs = contract.input_arity(),
            "No complete front-only binding for this model, skipping retry"
        ),
    }

    Err(InferenceBindingExhausted { original })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{contract, StubEngine};
    use ndarray::arr1;

    fn views() -> (Array4<f32>, Array4<f32>) {
        (
            Array4::from_elem((1, 2, 2, 3), 1.0),
            Array4::from_elem((1, 2, 2, 3), 2.0),
        )
    }

    fn inputs<'a>(
        front: &'a Array4<f32>,
        side: &'a Array4<f32>,
        distinct_views: bool,
        height: Option<f32>,
    ) -> BindingInputs<'a> {
        BindingInputs {
            front,
            side,
            distinct_views,
            height,
        }
    }

    fn named(name: &str) -> SlotId {
        SlotId::Named(name.to_string())
    }

    #[test]
    fn test_default_slot_takes_precedence_over_concat() {
        let (front, side) = views();
        let contract = contract(&["input_layer"]);

        let binding = select_binding(&contract, &inputs(&front, &side, true, None)).unwrap();

        assert_eq!(binding.strategy, BindingStrategy::DefaultSlot);
        assert_eq!(binding.slots.len(), 1);
        assert_eq!(
            binding.tensor(&named("input_layer")),
            Some(&front.clone().into_dyn())
        );
    }

    #[test]
    fn test_front_side_slots_follow_the_views() {
        let (front, side) = views();
        let contract = contract(&["side_input", "front_input"]);

        let binding = select_binding(&contract, &inputs(&front, &side, true, None)).unwrap();
        let swapped = select_binding(&contract, &inputs(&side, &front, true, None)).unwrap();

        assert_eq!(binding.strategy, BindingStrategy::FrontSide);
        assert_eq!(
            binding.tensor(&named("front_input")),
            Some(&front.clone().into_dyn())
        );
        assert_eq!(
            binding.tensor(&named("side_input")),
            Some(&side.clone().into_dyn())
        );
        assert_eq!(
            swapped.tensor(&named("front_input")),
            Some(&side.clone().into_dyn())
        );
        assert_eq!(
            swapped.tensor(&named("side_input")),
            Some(&front.clone().into_dyn())
        );
    }

    #[test]
    fn test_front_side_with_height_input() {
        let (front, side) = views();
        let contract = contract(&["front_image", "side_image", "height"]);

        let binding =
            select_binding(&contract, &inputs(&front, &side, true, Some(182.0))).unwrap();

        assert_eq!(binding.strategy, BindingStrategy::FrontSide);
        let height = binding.tensor(&named("height")).unwrap();
        assert_eq!(height.shape(), &[1, 1]);
        assert_eq!(height[[0, 0]], 182.0);
    }

    #[test]
    fn test_height_input_without_height_is_unsupported() {
        let (front, side) = views();
        let contract = contract(&["front_image", "side_image", "height"]);

        let result = select_binding(&contract, &inputs(&front, &side, true, None));

        assert!(matches!(result, Err(BindingError::UnsupportedInputCount(3))));
    }

    #[test]
    fn test_single_unconventional_slot_concatenates_distinct_views() {
        let (front, side) = views();
        let contract = contract(&["pixels"]);

        let binding = select_binding(&contract, &inputs(&front, &side, true, None)).unwrap();

        assert_eq!(binding.strategy, BindingStrategy::ChannelConcat);
        let combined = binding.tensor(&named("pixels")).unwrap();
        assert_eq!(combined.shape(), &[1, 2, 2, 6]);
        assert_eq!(combined[[0, 0, 0, 0]], 1.0);
        assert_eq!(combined[[0, 0, 0, 5]], 2.0);
    }

    #[test]
    fn test_single_unconventional_slot_with_duplicated_image_uses_front() {
        let (front, _) = views();
        let contract = contract(&["pixels"]);

        let binding = select_binding(&contract, &inputs(&front, &front, false, None)).unwrap();

        assert_eq!(binding.strategy, BindingStrategy::SingleSlot);
        assert_eq!(
            binding.tensor(&SlotId::Position(0)),
            Some(&front.clone().into_dyn())
        );
    }

    #[test]
    fn test_two_unconventional_slots_bind_positionally() {
        let (front, side) = views();
        let contract = contract(&["a", "b"]);

        let binding = select_binding(&contract, &inputs(&front, &side, true, None)).unwrap();

        assert_eq!(binding.strategy, BindingStrategy::Positional);
        assert_eq!(
            binding.tensor(&SlotId::Position(0)),
            Some(&front.clone().into_dyn())
        );
        assert_eq!(
            binding.tensor(&SlotId::Position(1)),
            Some(&side.clone().into_dyn())
        );
    }

    #[test]
    fn test_three_unconventional_slots_fail() {
        let (front, side) = views();
        let contract = contract(&["a", "b", "c"]);

        let result = select_binding(&contract, &inputs(&front, &side, true, None));

        assert!(matches!(result, Err(BindingError::UnsupportedInputCount(3))));
    }

    #[test]
    fn test_failed_concat_retries_with_front_only() {
        let (front, side) = views();
        let engine = StubEngine::new(&["pixels"], &["output_0"]).with_handler(|binding| {
            match binding.strategy {
                BindingStrategy::ChannelConcat => {
                    Err(EngineError::Run("expected 3 channels".into()))
                }
                _ => Ok(RawOutput::Flat(vec![175.0, 72.0])),
            }
        });
        let contract = ModelContract::from_engine(&engine);

        let (output, strategy) =
            infer(&engine, &contract, &inputs(&front, &side, true, None)).unwrap();

        assert_eq!(strategy, BindingStrategy::DefaultSlotRetry);
        assert_eq!(output.flatten(), vec![175.0, 72.0]);
        let calls = engine.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].tensor(&named("pixels")),
            Some(&front.clone().into_dyn())
        );
    }

    #[test]
    fn test_exhaustion_surfaces_the_original_error() {
        let (front, side) = views();
        let engine = StubEngine::new(&["input_layer"], &["output_0"]).with_handler(|binding| {
            Err(EngineError::Run(format!("boom from {}", binding.strategy)))
        });
        let contract = ModelContract::from_engine(&engine);

        let err = infer(&engine, &contract, &inputs(&front, &side, true, None)).unwrap_err();

        assert_eq!(engine.calls().len(), 2);
        assert!(matches!(
            err.original,
            BindingError::Engine {
                strategy: BindingStrategy::DefaultSlot,
                ..
            }
        ));
        assert!(err.to_string().contains("boom from default_slot"));
    }

    #[test]
    fn test_unsupported_arity_skips_retry() {
        let (front, side) = views();
        let engine = StubEngine::new(&["a", "b", "c"], &["output_0"])
            .with_handler(|_| Ok(RawOutput::Flat(vec![1.0])));
        let contract = ModelContract::from_engine(&engine);

        let err = infer(&engine, &contract, &inputs(&front, &side, true, None)).unwrap_err();

        assert!(engine.calls().is_empty());
        assert!(matches!(err.original, BindingError::UnsupportedInputCount(3)));
    }

    #[test]
    fn test_successful_binding_runs_once() {
        let (front, side) = views();
        let engine = StubEngine::new(&["front_input", "side_input"], &["height", "weight"])
            .with_handler(|_| {
                Ok(RawOutput::Positional(vec![
                    arr1(&[180.0f32]).into_dyn(),
                    arr1(&[80.0f32]).into_dyn(),
                ]))
            });
        let contract = ModelContract::from_engine(&engine);

        let (_, strategy) = infer(&engine, &contract, &inputs(&front, &side, true, None)).unwrap();

        assert_eq!(strategy, BindingStrategy::FrontSide);
        assert_eq!(engine.calls().len(), 1);
    }
}
