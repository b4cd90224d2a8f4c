/// Errors produced by the `numeral-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A worker reported a digit label outside `0..=9`.
    #[error("invalid digit {value}: must be in [0, 9]")]
    InvalidDigit { value: i64 },

    /// A confidence value was outside the valid range `[0.0, 1.0]`.
    #[error("invalid confidence {value}: must be in [0.0, 1.0]")]
    InvalidConfidence { value: f64 },

    /// The declared content type is not one of the accepted image types.
    #[error("unsupported media type '{mime}'")]
    UnsupportedMediaType { mime: String },
}
