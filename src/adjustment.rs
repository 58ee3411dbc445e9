#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightAdjustment {
    pub weight: f64,
    pub applied: bool,
}

impl WeightAdjustment {
    fn unchanged(weight: f64) -> Self {
        Self {
            weight,
            applied: false,
        }
    }
}

/// Rescales the predicted weight by the squared ratio of declared to predicted height.
///
/// Never fails: when the ratio cannot be computed the model's weight is kept and a
/// warning is logged.
pub fn adjust_weight(
    predicted_weight: f64,
    user_height: Option<f64>,
    predicted_height: f64,
) -> WeightAdjustment {
    let Some(user_height) = user_height else {
        return WeightAdjustment::unchanged(predicted_weight);
    };

    if user_height.is_nan() || user_height <= 0.0 {
        tracing::warn!(
            user_height,
            "Invalid user height provided, using model's height prediction"
        );
        return WeightAdjustment::unchanged(predicted_weight);
    }

    if !predicted_height.is_finite() || predicted_height <= 0.0 {
        tracing::warn!(
            predicted_height,
            "Cannot scale weight by a non-positive predicted height, keeping prediction"
        );
        return WeightAdjustment::unchanged(predicted_weight);
    }

    let adjusted = predicted_weight * (user_height / predicted_height).powi(2);
    if !adjusted.is_finite() {
        tracing::warn!(
            predicted_weight,
            user_height,
            predicted_height,
            "Weight adjustment produced a non-finite value, keeping prediction"
        );
        return WeightAdjustment::unchanged(predicted_weight);
    }

    tracing::info!(
        from = predicted_weight,
        to = adjusted,
        user_height,
        "Weight adjusted based on user height"
    );
    WeightAdjustment {
        weight: adjusted,
        applied: true,
    }
}
