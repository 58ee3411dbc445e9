use thiserror::Error;

pub const MAX_HEIGHT_CM: f64 = 300.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{0}")]
    MissingImage(&'static str),
    #[error("{0}")]
    EmptyFilename(&'static str),
    #[error("Height must be a valid number in cm, got {0:?}")]
    HeightFormat(String),
    #[error("Invalid height value {0}. Please provide a realistic height in cm.")]
    HeightOutOfRange(f64),
    #[error("Invalid multipart request: {0}")]
    Multipart(String),
}

/// Which upload flow a request came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCount {
    Single,
    Dual,
}

impl ImageCount {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCount::Single => "single",
            ImageCount::Dual => "dual",
        }
    }
}

/// Parses the optional height form field, in cm.
pub fn parse_height(raw: Option<&str>) -> Result<Option<f64>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let height: f64 = raw.trim().parse().map_err(|_| {
        tracing::warn!("Invalid height format provided: {}", raw);
        ValidationError::HeightFormat(raw.to_string())
    })?;

    if !height.is_finite() || height <= 0.0 || height > MAX_HEIGHT_CM {
        tracing::warn!("Suspicious height value provided: {}cm", height);
        return Err(ValidationError::HeightOutOfRange(height));
    }

    Ok(Some(height))
}

/// Fixed confidence tier for a response.
pub fn confidence(image_count: ImageCount, height_provided: bool) -> f64 {
    match (image_count, height_provided) {
        (ImageCount::Dual, true) => 0.92,
        (ImageCount::Dual, false) => 0.90,
        (ImageCount::Single, true) => 0.80,
        (ImageCount::Single, false) => 0.75,
    }
}
